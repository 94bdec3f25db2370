//! Advancing an open snapshot to one committed by another writer.
//!
//! The data changes are already in the new snapshot; what the transaction
//! log drives here is the reconciliation of *live accessors* with the new
//! on-disk shape. Replay runs in four phases:
//!
//! - **A** - walk the log and apply only the accessor consequences of each
//!   instruction: shift and drop cache slots, insert placeholder columns,
//!   adjust cached row counts, and mark everything whose shape may have
//!   changed. Marking errs on the side of too much - a false positive
//!   costs a refresh, a false negative leaves a stale accessor.
//! - **B** - soft-detach the top array (accessors survive) and reattach to
//!   the new top-ref.
//! - **C** - bump the allocator's global version, then reload every marked
//!   accessor from the new image.
//! - **D** - fire the schema-change hook if the log touched the schema.
//!
//! If any phase fails the group is left minimally consistent and poisoned:
//! the only legal operation afterwards is detach.

use cofferdb_repl::{ColumnKind, Instruction, TransactLogParser};
use tracing::debug;

use crate::error::CoreResult;
use crate::group::Group;
use crate::table::ColumnSpec;

/// Replay state threaded through phase A.
struct Advancer {
    /// Group-level index of the accessor selected by the last
    /// `SelectTable`, when that accessor is live.
    selected: Option<usize>,
    schema_changed: bool,
}

impl Group {
    /// Advances the group from its current snapshot to `new_top_ref`,
    /// replaying `log` (the transaction log emitted by the writer that
    /// produced the new snapshot) against the live accessor cache.
    ///
    /// Must not run concurrently with any other use of this group. On
    /// error the group is poisoned; only [`Group::detach`] is legal
    /// afterwards.
    pub fn advance_transact(
        &mut self,
        new_top_ref: u64,
        new_file_size: u64,
        log: &[u8],
    ) -> CoreResult<()> {
        self.ensure_attached()?;
        let result = self.do_advance_transact(new_top_ref, new_file_size, log);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn do_advance_transact(
        &mut self,
        new_top_ref: u64,
        new_file_size: u64,
        log: &[u8],
    ) -> CoreResult<()> {
        // The file may have grown behind our back.
        self.alloc.update_reader_view(new_file_size)?;

        // Phase A: accessor consequences only.
        let instructions = TransactLogParser::new(log).parse_all()?;
        let mut state = Advancer {
            selected: None,
            schema_changed: false,
        };
        for instruction in &instructions {
            self.apply_to_accessors(&mut state, instruction);
        }

        // Phase B: rebind to the new snapshot, keeping accessors.
        self.soft_detach();
        self.attach(new_top_ref, false)?;
        self.load_free_list()?;
        debug_assert!(self.accessors.is_empty() || self.accessors.len() == self.tables.len());

        // Phase C: all caches into the new image.
        self.alloc.bump_global_version();
        self.refresh_dirty_accessors()?;

        // Phase D.
        if state.schema_changed {
            if let Some(handler) = self.schema_change_handler.as_mut() {
                handler();
            }
        }
        debug!(
            new_top_ref,
            instructions = instructions.len(),
            schema_changed = state.schema_changed,
            "advanced to new snapshot"
        );
        Ok(())
    }

    /// Phase A dispatch. Instruction arguments are trusted to be in-range
    /// for the snapshot that produced them; only accessor existence is
    /// checked.
    fn apply_to_accessors(&mut self, state: &mut Advancer, instruction: &Instruction) {
        use Instruction as I;
        match instruction {
            I::InsertGroupLevelTable {
                table_ndx,
                prior_num_tables,
                ..
            } => {
                let ndx = *table_ndx as usize;
                debug_assert!(ndx <= *prior_num_tables as usize);
                debug_assert!(
                    self.accessors.is_empty()
                        || self.accessors.len() == *prior_num_tables as usize
                );
                if !self.accessors.is_empty() {
                    self.accessors.insert(ndx, None);
                    for i in ndx + 1..self.accessors.len() {
                        if self.mark_accessor(i) {
                            self.mark_opposite_link_tables(i);
                        }
                    }
                }
                state.selected = None;
                state.schema_changed = true;
            }

            I::EraseGroupLevelTable {
                table_ndx,
                prior_num_tables,
            } => {
                let ndx = *table_ndx as usize;
                debug_assert!(ndx < *prior_num_tables as usize);
                if !self.accessors.is_empty() {
                    // Link target tables need no consideration here: every
                    // column was erased before the table, each with its own
                    // instruction.
                    self.accessors.remove(ndx);
                    for i in ndx..self.accessors.len() {
                        if self.mark_accessor(i) {
                            self.mark_opposite_link_tables(i);
                        }
                    }
                }
                state.selected = None;
                state.schema_changed = true;
            }

            I::RenameGroupLevelTable { .. } => {
                // Table names are group state; the reattach refreshes them
                // wholesale.
                state.schema_changed = true;
            }

            I::SelectTable { group_ndx, path } => {
                state.selected = None;
                let ndx = *group_ndx as usize;
                if ndx < self.accessors.len() && self.mark_accessor(ndx) {
                    // This port has no subtable accessors; a descent along
                    // a non-empty path finds nothing to select, which is
                    // exactly the no-accessor case of the original
                    // protocol.
                    if path.is_empty() {
                        state.selected = Some(ndx);
                    }
                }
            }

            I::InsertEmptyRows { num_rows, .. } => {
                if let Some(acc) = state.selected.and_then(|n| self.accessors[n].as_mut()) {
                    acc.row_count += num_rows;
                    acc.mark = true;
                }
            }

            I::EraseRows { num_rows, .. } => {
                if let Some(acc) = state.selected.and_then(|n| self.accessors[n].as_mut()) {
                    acc.row_count = acc.row_count.saturating_sub(*num_rows);
                    acc.mark = true;
                }
                if *num_rows == 0 {
                    // Nothing was erased, but linked tables still need a
                    // refresh.
                    if let Some(ndx) = state.selected {
                        self.mark_opposite_link_tables(ndx);
                    }
                }
            }

            I::SwapRows { .. } | I::MoveRow { .. } | I::MergeRows { .. } => {
                if let Some(ndx) = state.selected {
                    self.mark_accessor(ndx);
                    self.mark_opposite_link_tables(ndx);
                }
            }

            I::ClearTable => {
                if let Some(acc) = state.selected.and_then(|n| self.accessors[n].as_mut()) {
                    acc.row_count = 0;
                    acc.mark = true;
                }
            }

            I::InsertColumn {
                col_ndx,
                kind,
                name,
                nullable,
            } => {
                if let Some(ndx) = state.selected {
                    let col_ndx = *col_ndx as usize;
                    if let Some(acc) = self.accessors[ndx].as_mut() {
                        acc.spec.cols.insert(
                            col_ndx,
                            ColumnSpec {
                                name: name.clone(),
                                kind: *kind,
                                nullable: *nullable,
                                indexed: false,
                                opposite_table: 0,
                                opposite_col: 0,
                                index_ref: 0,
                            },
                        );
                        acc.col_roots.insert(col_ndx, 0);
                        acc.mark = true;
                    }
                    self.mark_link_targets_from(ndx, col_ndx + 1);
                }
                state.schema_changed = true;
            }

            I::InsertLinkColumn {
                col_ndx,
                kind,
                name,
                target_table_ndx,
                backlink_col_ndx,
            } => {
                // Origin first, then the target's backlink column; the two
                // may be the same table, and backlink columns come last.
                if let Some(ndx) = state.selected {
                    let col_ndx = *col_ndx as usize;
                    if let Some(acc) = self.accessors[ndx].as_mut() {
                        acc.spec.cols.insert(
                            col_ndx,
                            ColumnSpec {
                                name: name.clone(),
                                kind: *kind,
                                nullable: false,
                                indexed: false,
                                opposite_table: *target_table_ndx,
                                opposite_col: *backlink_col_ndx,
                                index_ref: 0,
                            },
                        );
                        acc.col_roots.insert(col_ndx, 0);
                        acc.mark = true;
                    }
                    self.mark_link_targets_from(ndx, col_ndx + 1);
                }
                let target = *target_table_ndx as usize;
                if target < self.accessors.len() {
                    let origin = state.selected.unwrap_or(target) as u64;
                    if let Some(acc) = self.accessors[target].as_mut() {
                        let backlink_ndx = *backlink_col_ndx as usize;
                        acc.spec.cols.insert(
                            backlink_ndx,
                            ColumnSpec {
                                name: String::new(),
                                kind: ColumnKind::Backlink,
                                nullable: false,
                                indexed: false,
                                opposite_table: origin,
                                opposite_col: *col_ndx,
                                index_ref: 0,
                            },
                        );
                        acc.col_roots.insert(backlink_ndx, 0);
                        acc.mark = true;
                    }
                }
                state.schema_changed = true;
            }

            I::EraseColumn { col_ndx } => {
                if let Some(ndx) = state.selected {
                    let col_ndx = *col_ndx as usize;
                    if let Some(acc) = self.accessors[ndx].as_mut() {
                        acc.spec.cols.remove(col_ndx);
                        acc.col_roots.remove(col_ndx);
                        acc.mark = true;
                    }
                    self.mark_link_targets_from(ndx, col_ndx);
                }
                state.schema_changed = true;
            }

            I::EraseLinkColumn {
                col_ndx,
                target_table_ndx,
                backlink_col_ndx,
            } => {
                // The backlink column goes first: it sits behind the
                // payload columns, so erasing it cannot shift `col_ndx`
                // even when origin and target are the same table. The
                // other order would.
                let target = *target_table_ndx as usize;
                if target < self.accessors.len() {
                    if let Some(acc) = self.accessors[target].as_mut() {
                        let backlink_ndx = *backlink_col_ndx as usize;
                        acc.spec.cols.remove(backlink_ndx);
                        acc.col_roots.remove(backlink_ndx);
                        acc.mark = true;
                    }
                }
                if let Some(ndx) = state.selected {
                    let col_ndx = *col_ndx as usize;
                    if let Some(acc) = self.accessors[ndx].as_mut() {
                        acc.spec.cols.remove(col_ndx);
                        acc.col_roots.remove(col_ndx);
                        acc.mark = true;
                    }
                    self.mark_link_targets_from(ndx, col_ndx);
                }
                state.schema_changed = true;
            }

            I::RenameColumn { .. } => {
                state.schema_changed = true;
            }

            I::SetLink { col_ndx, .. }
            | I::NullifyLink { col_ndx, .. }
            | I::SelectLinkList { col_ndx, .. } => {
                // The link-target table is affected even though no schema
                // changed: its backlink column must be refreshed. The
                // target accessor exists if and only if the origin
                // accessor exists, so going through the selected accessor
                // finds it whenever there is anything to mark.
                if let Some(ndx) = state.selected {
                    self.mark_link_target_of(ndx, *col_ndx as usize);
                }
            }

            // Pure value instructions carry no accessor consequences.
            I::SetValue { .. }
            | I::LinkListSet { .. }
            | I::LinkListInsert { .. }
            | I::LinkListErase { .. }
            | I::LinkListClear
            | I::AddSearchIndex { .. }
            | I::RemoveSearchIndex { .. }
            | I::OptimizeTable => {}
        }
    }

    /// Marks the accessor at `ndx` if it is live. Returns whether it was.
    fn mark_accessor(&mut self, ndx: usize) -> bool {
        if let Some(Some(acc)) = self.accessors.get_mut(ndx) {
            acc.mark = true;
            true
        } else {
            false
        }
    }

    /// Marks the opposite-side accessors of `ndx`'s link-ish columns at or
    /// above `from_col`.
    fn mark_link_targets_from(&mut self, ndx: usize, from_col: usize) {
        let Some(Some(acc)) = self.accessors.get(ndx) else {
            return;
        };
        let targets: Vec<usize> = acc
            .spec
            .cols
            .iter()
            .skip(from_col)
            .filter(|c| c.kind.is_link() || c.kind == ColumnKind::Backlink)
            .map(|c| c.opposite_table as usize)
            .collect();
        for target in targets {
            self.mark_accessor(target);
        }
    }

    /// Marks the target-table accessor of one link column, if both exist.
    fn mark_link_target_of(&mut self, ndx: usize, col_ndx: usize) {
        let Some(Some(acc)) = self.accessors.get(ndx) else {
            return;
        };
        let target = match acc.spec.cols.get(col_ndx) {
            Some(col) if col.kind.is_link() => col.opposite_table as usize,
            _ => return,
        };
        self.mark_accessor(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoreError, LogicErrorKind};
    use crate::group::OpenMode;
    use cofferdb_repl::TransactLogBuilder;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::tempdir;

    /// One writer and one reader over the same file: the writer commits a
    /// replicated transaction, the reader advances to it.
    fn writer_and_reader() -> (tempfile::TempDir, Group, Group) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.coffer");
        let mut writer = Group::open_file(&path, OpenMode::ReadWrite, None).unwrap();
        writer.commit().unwrap();
        let reader = Group::open_file(&path, OpenMode::ReadWrite, None).unwrap();
        (dir, writer, reader)
    }

    fn advance_from(writer: &mut Group, reader: &mut Group) {
        let log = writer.take_replication().unwrap().take_encoded();
        writer.set_replication(TransactLogBuilder::new());
        reader
            .advance_transact(writer.top_ref, writer.alloc.baseline(), &log)
            .unwrap();
    }

    #[test]
    fn advance_to_new_table_and_column() {
        // Scenario: a peer creates table "T" with one int column "n"; after
        // the advance the reader sees it.
        let (_dir, mut writer, mut reader) = writer_and_reader();
        writer.set_replication(TransactLogBuilder::new());

        let t = writer.add_table("T", true).unwrap();
        writer
            .add_column(t, ColumnKind::Int, "n", false)
            .unwrap();
        writer.commit().unwrap();
        advance_from(&mut writer, &mut reader);

        assert_eq!(reader.size(), 1);
        let table = reader.get_table_by_name("T").unwrap().unwrap();
        assert_eq!(table.index(), 0);
        assert_eq!(table.column_count(), 1);
        assert_eq!(table.column_name(0), "n");
        assert!(writer == reader);
    }

    #[test]
    fn advance_shifts_live_accessors_on_table_insert() {
        let (_dir, mut writer, mut reader) = writer_and_reader();
        writer.set_replication(TransactLogBuilder::new());
        writer.add_table("B", true).unwrap();
        let n = writer.add_column(0, ColumnKind::Int, "n", false).unwrap();
        writer.add_empty_rows(0, 1).unwrap();
        writer.set_int(0, n, 0, 7).unwrap();
        writer.commit().unwrap();
        advance_from(&mut writer, &mut reader);

        // Materialise the accessor for "B", then have the peer insert a
        // table in front of it.
        assert_eq!(reader.get_table_by_name("B").unwrap().unwrap().index(), 0);

        writer.insert_table(0, "A", true).unwrap();
        writer.commit().unwrap();
        advance_from(&mut writer, &mut reader);

        assert_eq!(reader.size(), 2);
        let b = reader.get_table_by_name("B").unwrap().unwrap();
        assert_eq!(b.index(), 1);
        assert_eq!(b.get_int(n, 0).unwrap(), 7);
        assert_eq!(reader.accessors.len(), 2);
    }

    #[test]
    fn advance_drops_accessor_of_erased_table() {
        let (_dir, mut writer, mut reader) = writer_and_reader();
        writer.set_replication(TransactLogBuilder::new());
        writer.add_table("A", true).unwrap();
        writer.add_table("B", true).unwrap();
        writer.add_column(1, ColumnKind::Int, "n", false).unwrap();
        writer.commit().unwrap();
        advance_from(&mut writer, &mut reader);

        reader.get_table(0).unwrap();
        reader.get_table(1).unwrap();

        writer.remove_table_by_name("A").unwrap();
        writer.commit().unwrap();
        advance_from(&mut writer, &mut reader);

        assert_eq!(reader.size(), 1);
        assert_eq!(reader.accessors.len(), 1);
        let b = reader.get_table(0).unwrap();
        assert_eq!(b.name(), "B");
        assert_eq!(b.column_count(), 1);
    }

    #[test]
    fn advance_inserts_backlink_in_live_target_accessor() {
        let (_dir, mut writer, mut reader) = writer_and_reader();
        writer.set_replication(TransactLogBuilder::new());
        writer.add_table("A", true).unwrap();
        writer.add_table("B", true).unwrap();
        writer.commit().unwrap();
        advance_from(&mut writer, &mut reader);

        // Live accessors on both sides in the reader.
        reader.get_table(0).unwrap();
        reader.get_table(1).unwrap();

        let col = writer
            .add_link_column(0, ColumnKind::Link, "to_b", 1)
            .unwrap();
        writer.commit().unwrap();
        advance_from(&mut writer, &mut reader);

        let a = reader.accessor(0);
        assert_eq!(a.spec.cols[col].kind, ColumnKind::Link);
        assert_eq!(a.spec.cols[col].opposite_table, 1);
        let b = reader.accessor(1);
        assert_eq!(b.spec.cols.len(), 1);
        assert_eq!(b.spec.cols[0].kind, ColumnKind::Backlink);
        assert_eq!(b.spec.cols[0].opposite_table, 0);
        assert!(writer == reader);
    }

    #[test]
    fn advance_applies_row_and_value_changes() {
        let (_dir, mut writer, mut reader) = writer_and_reader();
        writer.set_replication(TransactLogBuilder::new());
        writer.add_table("T", true).unwrap();
        let n = writer.add_column(0, ColumnKind::Int, "n", false).unwrap();
        writer.commit().unwrap();
        advance_from(&mut writer, &mut reader);
        reader.get_table(0).unwrap();

        writer.add_empty_rows(0, 3).unwrap();
        writer.set_int(0, n, 2, 42).unwrap();
        writer.commit().unwrap();
        advance_from(&mut writer, &mut reader);

        let t = reader.get_table(0).unwrap();
        assert_eq!(t.row_count(), 3);
        assert_eq!(t.get_int(n, 2).unwrap(), 42);
    }

    #[test]
    fn advance_fires_schema_change_hook() {
        let (_dir, mut writer, mut reader) = writer_and_reader();
        writer.set_replication(TransactLogBuilder::new());

        let fired = Rc::new(Cell::new(0u32));
        let observed = Rc::clone(&fired);
        reader.set_schema_change_handler(move || observed.set(observed.get() + 1));

        writer.add_table("T", true).unwrap();
        writer.commit().unwrap();
        advance_from(&mut writer, &mut reader);
        assert_eq!(fired.get(), 1);

        // A pure value transaction does not fire the hook.
        let n = writer.add_column(0, ColumnKind::Int, "n", false).unwrap();
        writer.commit().unwrap();
        advance_from(&mut writer, &mut reader);
        assert_eq!(fired.get(), 2);

        writer.add_empty_rows(0, 1).unwrap();
        writer.set_int(0, n, 0, 1).unwrap();
        writer.commit().unwrap();
        advance_from(&mut writer, &mut reader);
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn failed_advance_poisons_the_group() {
        let (_dir, mut writer, mut reader) = writer_and_reader();
        let top_ref = writer.top_ref;
        let size = writer.alloc.baseline();

        // A garbage log fails the replay.
        let garbage = [0xee, 0xee, 0xee];
        assert!(reader.advance_transact(top_ref, size, &garbage).is_err());

        // Only detach is legal now.
        assert!(matches!(
            reader.add_table("T", true),
            Err(CoreError::Logic(LogicErrorKind::WrongGroupState))
        ));
        reader.detach();
        assert!(!reader.is_attached());
    }
}
