//! Tables: per-table trees, specs, and live accessors.
//!
//! A table's on-disk root is a two-slot node: the spec (column metadata)
//! and the columns array (one root ref per column). The spec holds five
//! parallel children: column type codes, column names, attribute bits,
//! opposite-side pairs for link and backlink columns, and search-index
//! roots.
//!
//! Opposite pairs carry two slots per column. For a link column they are
//! `(target table, backlink column in target)`; for a backlink column
//! `(origin table, origin column)`. Payload columns always precede
//! backlink columns, which keeps replication column indices stable.
//!
//! The live [`TableAccessor`] caches the decoded spec, the column root
//! refs, and the row count; it is what a commit or transaction advance has
//! to reconcile with the new on-disk shape.

use cofferdb_repl::{ColumnKind, Instruction};

use crate::alloc::SlabAlloc;
use crate::array::{Array, RefOrTagged, StringArray, NODE_HEADER_SIZE};
use crate::error::{CoreError, CoreResult};
use crate::group::{Group, MAX_NAME_LENGTH};

pub(crate) const TABLE_TOP_SPEC: usize = 0;
pub(crate) const TABLE_TOP_COLUMNS: usize = 1;

const SPEC_TYPES: usize = 0;
const SPEC_NAMES: usize = 1;
const SPEC_ATTRS: usize = 2;
const SPEC_OPPOSITES: usize = 3;
const SPEC_INDEXES: usize = 4;

const ATTR_NULLABLE: i64 = 1;
const ATTR_INDEXED: i64 = 2;

/// Metadata of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColumnSpec {
    pub(crate) name: String,
    pub(crate) kind: ColumnKind,
    pub(crate) nullable: bool,
    pub(crate) indexed: bool,
    /// Opposite table index for link and backlink columns.
    pub(crate) opposite_table: u64,
    /// Backlink column in the target (link columns) or origin column in the
    /// origin (backlink columns).
    pub(crate) opposite_col: u64,
    /// Search index root, 0 when absent.
    pub(crate) index_ref: u64,
}

/// Decoded column metadata of one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Spec {
    pub(crate) cols: Vec<ColumnSpec>,
}

impl Spec {
    /// Number of payload columns (backlink columns always come last).
    pub(crate) fn payload_column_count(&self) -> usize {
        self.cols
            .iter()
            .position(|c| c.kind == ColumnKind::Backlink)
            .unwrap_or(self.cols.len())
    }

    pub(crate) fn load(alloc: &SlabAlloc, spec_ref: u64) -> CoreResult<Self> {
        let spec_top = Array::decode(alloc.node_bytes(spec_ref)?)?;
        let types = Array::decode(alloc.node_bytes(spec_top.get_ref(SPEC_TYPES))?)?;
        let names = StringArray::decode(alloc.node_bytes(spec_top.get_ref(SPEC_NAMES))?)?;
        let attrs = Array::decode(alloc.node_bytes(spec_top.get_ref(SPEC_ATTRS))?)?;
        let opposites = Array::decode(alloc.node_bytes(spec_top.get_ref(SPEC_OPPOSITES))?)?;
        let indexes = Array::decode(alloc.node_bytes(spec_top.get_ref(SPEC_INDEXES))?)?;

        let n = types.len();
        if names.len() != n || attrs.len() != n || opposites.len() != 2 * n || indexes.len() != n {
            return Err(CoreError::invalid_database(
                "table spec arrays have mismatched lengths",
                alloc.path(),
            ));
        }

        let mut cols = Vec::with_capacity(n);
        for i in 0..n {
            let kind = ColumnKind::from_code(types.get_int(i) as u8)?;
            let attr_bits = attrs.get_int(i);
            cols.push(ColumnSpec {
                name: names.get(i).to_string(),
                kind,
                nullable: attr_bits & ATTR_NULLABLE != 0,
                indexed: attr_bits & ATTR_INDEXED != 0,
                opposite_table: opposites.get_int(2 * i) as u64,
                opposite_col: opposites.get_int(2 * i + 1) as u64,
                index_ref: indexes.get_ref(i),
            });
        }
        Ok(Self { cols })
    }

    /// Stores the spec copy-on-write, reusing the previous spec's nodes
    /// where possible. Returns the new spec root.
    pub(crate) fn store(&self, alloc: &mut SlabAlloc, old_spec_ref: u64) -> CoreResult<u64> {
        let old = if old_spec_ref != 0 {
            Some(Array::decode(alloc.node_bytes(old_spec_ref)?)?)
        } else {
            None
        };
        let old_child = |slot: usize| old.as_ref().map_or(0, |top| top.get_ref(slot));

        let mut types = Array::new(false);
        let mut names = StringArray::new();
        let mut attrs = Array::new(false);
        let mut opposites = Array::new(false);
        let mut indexes = Array::new(true);
        for col in &self.cols {
            types.push(RefOrTagged::Int(i64::from(col.kind.to_code())));
            names.push(&col.name);
            let mut bits = 0;
            if col.nullable {
                bits |= ATTR_NULLABLE;
            }
            if col.indexed {
                bits |= ATTR_INDEXED;
            }
            attrs.push(RefOrTagged::Int(bits));
            opposites.push(RefOrTagged::Int(col.opposite_table as i64));
            opposites.push(RefOrTagged::Int(col.opposite_col as i64));
            indexes.push(RefOrTagged::Ref(col.index_ref));
        }

        let types_ref = alloc.store_node(&types.encode(), old_child(SPEC_TYPES))?;
        let names_ref = alloc.store_node(&names.encode(), old_child(SPEC_NAMES))?;
        let attrs_ref = alloc.store_node(&attrs.encode(), old_child(SPEC_ATTRS))?;
        let opposites_ref = alloc.store_node(&opposites.encode(), old_child(SPEC_OPPOSITES))?;
        let indexes_ref = alloc.store_node(&indexes.encode(), old_child(SPEC_INDEXES))?;

        let mut spec_top = Array::new(true);
        spec_top.push(RefOrTagged::Ref(types_ref));
        spec_top.push(RefOrTagged::Ref(names_ref));
        spec_top.push(RefOrTagged::Ref(attrs_ref));
        spec_top.push(RefOrTagged::Ref(opposites_ref));
        spec_top.push(RefOrTagged::Ref(indexes_ref));
        alloc.store_node(&spec_top.encode(), old_spec_ref)
    }
}

/// A live handle to one table of the attached snapshot.
#[derive(Debug)]
pub(crate) struct TableAccessor {
    /// Ref of the table's root node.
    pub(crate) root_ref: u64,
    pub(crate) spec_ref: u64,
    pub(crate) columns_ref: u64,
    pub(crate) spec: Spec,
    /// Root ref per column, parallel to `spec.cols` (0 for backlinks).
    pub(crate) col_roots: Vec<u64>,
    pub(crate) row_count: u64,
    /// Dirty flag: something about the on-disk shape relevant to this
    /// accessor has changed. False positives are fine, false negatives are
    /// not.
    pub(crate) mark: bool,
    /// False while the accessor is registered but not yet completed (cycle
    /// breaking during construction).
    pub(crate) complete: bool,
}

impl TableAccessor {
    pub(crate) fn incomplete(root_ref: u64) -> Self {
        Self {
            root_ref,
            spec_ref: 0,
            columns_ref: 0,
            spec: Spec::default(),
            col_roots: Vec::new(),
            row_count: 0,
            mark: true,
            complete: false,
        }
    }

    pub(crate) fn assign_parts(&mut self, parts: TableParts) {
        self.spec_ref = parts.spec_ref;
        self.columns_ref = parts.columns_ref;
        self.spec = parts.spec;
        self.col_roots = parts.col_roots;
        self.row_count = parts.row_count;
    }
}

/// Everything decoded from one table tree.
pub(crate) struct TableParts {
    pub(crate) spec_ref: u64,
    pub(crate) columns_ref: u64,
    pub(crate) spec: Spec,
    pub(crate) col_roots: Vec<u64>,
    pub(crate) row_count: u64,
}

/// Element count of the node at `ref_`.
fn node_len(alloc: &SlabAlloc, ref_: u64) -> CoreResult<u64> {
    let header = alloc.read_bytes(ref_, NODE_HEADER_SIZE)?;
    Ok(u64::from(u32::from_le_bytes(header[4..8].try_into().unwrap())))
}

pub(crate) fn load_table_parts(alloc: &SlabAlloc, root_ref: u64) -> CoreResult<TableParts> {
    let table_top = Array::decode(alloc.node_bytes(root_ref)?)?;
    let spec_ref = table_top.get_ref(TABLE_TOP_SPEC);
    let columns_ref = table_top.get_ref(TABLE_TOP_COLUMNS);
    let spec = Spec::load(alloc, spec_ref)?;
    let columns = Array::decode(alloc.node_bytes(columns_ref)?)?;
    if columns.len() != spec.cols.len() {
        return Err(CoreError::invalid_database(
            "column roots do not match the table spec",
            alloc.path(),
        ));
    }
    let col_roots: Vec<u64> = (0..columns.len()).map(|i| columns.get_ref(i)).collect();

    let mut row_count = 0;
    for (i, col) in spec.cols.iter().enumerate() {
        if col.kind != ColumnKind::Backlink && col_roots[i] != 0 {
            row_count = node_len(alloc, col_roots[i])?;
            break;
        }
    }

    Ok(TableParts {
        spec_ref,
        columns_ref,
        spec,
        col_roots,
        row_count,
    })
}

/// Creates a brand-new empty table tree. Returns its root ref.
pub(crate) fn create_empty_table(alloc: &mut SlabAlloc) -> CoreResult<u64> {
    let spec_ref = Spec::default().store(alloc, 0)?;
    let columns_ref = alloc.store_node(&Array::new(true).encode(), 0)?;
    let mut table_top = Array::new(true);
    table_top.push(RefOrTagged::Ref(spec_ref));
    table_top.push(RefOrTagged::Ref(columns_ref));
    alloc.store_node(&table_top.encode(), 0)
}

/// Creates a column root holding `rows` default values.
fn create_column_root(alloc: &mut SlabAlloc, kind: ColumnKind, rows: u64) -> CoreResult<u64> {
    match kind {
        ColumnKind::Backlink => Ok(0),
        ColumnKind::String => {
            let mut arr = StringArray::new();
            for _ in 0..rows {
                arr.push("");
            }
            alloc.store_node(&arr.encode(), 0)
        }
        ColumnKind::LinkList => {
            let mut arr = Array::new(true);
            for _ in 0..rows {
                arr.push(RefOrTagged::Ref(0));
            }
            alloc.store_node(&arr.encode(), 0)
        }
        _ => {
            let mut arr = Array::new(false);
            for _ in 0..rows {
                arr.push(RefOrTagged::Int(0));
            }
            alloc.store_node(&arr.encode(), 0)
        }
    }
}

impl Group {
    // ------------------------------------------------------------------
    // Columns
    // ------------------------------------------------------------------

    /// Adds a payload column to the table at `table_ndx`.
    ///
    /// Link columns must be created with [`Group::add_link_column`].
    /// Returns the new column's index.
    pub fn add_column(
        &mut self,
        table_ndx: usize,
        kind: ColumnKind,
        name: &str,
        nullable: bool,
    ) -> CoreResult<usize> {
        self.ensure_writable_top()?;
        if kind.is_link() || kind == ColumnKind::Backlink {
            return Err(CoreError::DescriptorMismatch);
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(CoreError::table_name_too_long());
        }
        if table_ndx >= self.size() {
            return Err(CoreError::table_index_out_of_range());
        }
        self.ensure_accessor(table_ndx)?;

        let rows = self.accessor(table_ndx).row_count;
        let col_ndx = self.accessor(table_ndx).spec.payload_column_count();
        let root = create_column_root(&mut self.alloc, kind, rows)?;

        // Backlink columns behind the insertion point shift up by one.
        self.adjust_opposite_columns(table_ndx, col_ndx, 1)?;

        let acc = self.accessor_mut(table_ndx);
        acc.spec.cols.insert(
            col_ndx,
            ColumnSpec {
                name: name.to_string(),
                kind,
                nullable,
                indexed: false,
                opposite_table: 0,
                opposite_col: 0,
                index_ref: 0,
            },
        );
        acc.col_roots.insert(col_ndx, root);
        self.persist_table(table_ndx)?;

        if let Some(repl) = self.replication.as_mut() {
            repl.select_table(table_ndx as u64);
            repl.push(Instruction::InsertColumn {
                col_ndx: col_ndx as u64,
                kind,
                name: name.to_string(),
                nullable,
            });
        }
        Ok(col_ndx)
    }

    /// Adds a link or link-list column pointing at `target_table_ndx`,
    /// appending the matching backlink column to the target table.
    ///
    /// Returns the new column's index in the origin table.
    pub fn add_link_column(
        &mut self,
        table_ndx: usize,
        kind: ColumnKind,
        name: &str,
        target_table_ndx: usize,
    ) -> CoreResult<usize> {
        self.ensure_writable_top()?;
        if !kind.is_link() {
            return Err(CoreError::DescriptorMismatch);
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(CoreError::table_name_too_long());
        }
        if table_ndx >= self.size() || target_table_ndx >= self.size() {
            return Err(CoreError::table_index_out_of_range());
        }
        self.ensure_accessor(table_ndx)?;
        self.ensure_accessor(target_table_ndx)?;

        let origin_rows = self.accessor(table_ndx).row_count;
        let col_ndx = self.accessor(table_ndx).spec.payload_column_count();
        let root = create_column_root(&mut self.alloc, kind, origin_rows)?;

        self.adjust_opposite_columns(table_ndx, col_ndx, 1)?;

        let acc = self.accessor_mut(table_ndx);
        acc.spec.cols.insert(
            col_ndx,
            ColumnSpec {
                name: name.to_string(),
                kind,
                nullable: false,
                indexed: false,
                opposite_table: target_table_ndx as u64,
                opposite_col: 0, // patched below
                index_ref: 0,
            },
        );
        acc.col_roots.insert(col_ndx, root);

        // The backlink column goes at the very end of the target's spec, so
        // no further index adjustment is needed - this also keeps the
        // origin-equals-target case straight.
        let backlink_ndx = self.accessor(target_table_ndx).spec.cols.len();
        let target_acc = self.accessor_mut(target_table_ndx);
        target_acc.spec.cols.push(ColumnSpec {
            name: String::new(),
            kind: ColumnKind::Backlink,
            nullable: false,
            indexed: false,
            opposite_table: table_ndx as u64,
            opposite_col: col_ndx as u64,
            index_ref: 0,
        });
        target_acc.col_roots.push(0);

        self.accessor_mut(table_ndx).spec.cols[col_ndx].opposite_col = backlink_ndx as u64;

        self.persist_table(table_ndx)?;
        if target_table_ndx != table_ndx {
            self.persist_table(target_table_ndx)?;
        }

        if let Some(repl) = self.replication.as_mut() {
            repl.select_table(table_ndx as u64);
            repl.push(Instruction::InsertLinkColumn {
                col_ndx: col_ndx as u64,
                kind,
                name: name.to_string(),
                target_table_ndx: target_table_ndx as u64,
                backlink_col_ndx: backlink_ndx as u64,
            });
        }
        Ok(col_ndx)
    }

    /// Removes a payload column. For a link column the backlink column in
    /// the target table is removed first (backlink columns come last, so
    /// origin-side indices stay put even when origin and target are the
    /// same table).
    pub fn remove_column(&mut self, table_ndx: usize, col_ndx: usize) -> CoreResult<()> {
        self.ensure_writable_top()?;
        if table_ndx >= self.size() {
            return Err(CoreError::table_index_out_of_range());
        }
        self.ensure_accessor(table_ndx)?;
        let acc = self.accessor(table_ndx);
        if col_ndx >= acc.spec.cols.len() {
            return Err(CoreError::table_index_out_of_range());
        }
        let col = acc.spec.cols[col_ndx].clone();
        if col.kind == ColumnKind::Backlink {
            // Backlink columns live and die with their link column.
            return Err(CoreError::wrong_group_state());
        }

        if col.kind.is_link() {
            let target = col.opposite_table as usize;
            let backlink_ndx = col.opposite_col as usize;
            self.ensure_accessor(target)?;

            // Keep spec and column roots in lockstep on disk before the
            // index sweep below reloads accessors.
            let target_acc = self.accessor_mut(target);
            target_acc.spec.cols.remove(backlink_ndx);
            target_acc.col_roots.remove(backlink_ndx);
            self.persist_table(target)?;
            self.adjust_opposite_columns(target, backlink_ndx, -1)?;
        }

        let acc = self.accessor_mut(table_ndx);
        let root = acc.col_roots[col_ndx];
        let index_ref = acc.spec.cols[col_ndx].index_ref;
        acc.spec.cols.remove(col_ndx);
        acc.col_roots.remove(col_ndx);
        if acc.spec.cols.is_empty() {
            acc.row_count = 0;
        }
        self.persist_table(table_ndx)?;
        self.adjust_opposite_columns(table_ndx, col_ndx, -1)?;
        self.alloc.destroy_deep(root)?;
        self.alloc.destroy_deep(index_ref)?;

        if let Some(repl) = self.replication.as_mut() {
            repl.select_table(table_ndx as u64);
            if col.kind.is_link() {
                repl.push(Instruction::EraseLinkColumn {
                    col_ndx: col_ndx as u64,
                    target_table_ndx: col.opposite_table,
                    backlink_col_ndx: col.opposite_col,
                });
            } else {
                repl.push(Instruction::EraseColumn {
                    col_ndx: col_ndx as u64,
                });
            }
        }
        Ok(())
    }

    /// Adds a search index to a string or integer column.
    pub fn add_search_index(&mut self, table_ndx: usize, col_ndx: usize) -> CoreResult<()> {
        self.ensure_writable_top()?;
        self.ensure_accessor(table_ndx)?;
        let acc = self.accessor(table_ndx);
        if col_ndx >= acc.spec.cols.len() {
            return Err(CoreError::table_index_out_of_range());
        }
        let kind = acc.spec.cols[col_ndx].kind;
        if !matches!(kind, ColumnKind::String | ColumnKind::Int) {
            return Err(CoreError::DescriptorMismatch);
        }

        let root = acc.col_roots[col_ndx];
        let index_ref = build_search_index(&mut self.alloc, kind, root)?;
        let acc = self.accessor_mut(table_ndx);
        let old_index = acc.spec.cols[col_ndx].index_ref;
        acc.spec.cols[col_ndx].indexed = true;
        acc.spec.cols[col_ndx].index_ref = index_ref;
        self.persist_table(table_ndx)?;
        self.alloc.destroy_deep(old_index)?;

        if let Some(repl) = self.replication.as_mut() {
            repl.select_table(table_ndx as u64);
            repl.push(Instruction::AddSearchIndex {
                col_ndx: col_ndx as u64,
            });
        }
        Ok(())
    }

    /// Rebuilds every search index of one table, discarding index trees
    /// written by older file formats.
    pub(crate) fn rebuild_search_indexes(&mut self, table_ndx: usize) -> CoreResult<()> {
        self.ensure_accessor(table_ndx)?;
        let indexed: Vec<usize> = self
            .accessor(table_ndx)
            .spec
            .cols
            .iter()
            .enumerate()
            .filter(|(_, c)| c.indexed)
            .map(|(i, _)| i)
            .collect();
        for col_ndx in indexed {
            let (kind, root, old_index) = {
                let acc = self.accessor(table_ndx);
                (
                    acc.spec.cols[col_ndx].kind,
                    acc.col_roots[col_ndx],
                    acc.spec.cols[col_ndx].index_ref,
                )
            };
            let index_ref = build_search_index(&mut self.alloc, kind, root)?;
            self.accessor_mut(table_ndx).spec.cols[col_ndx].index_ref = index_ref;
            self.persist_table(table_ndx)?;
            self.alloc.destroy_deep(old_index)?;
        }
        Ok(())
    }

    /// Rewrites legacy datetime columns of one table as timestamps.
    pub(crate) fn upgrade_legacy_datetime(&mut self, table_ndx: usize) -> CoreResult<()> {
        self.ensure_accessor(table_ndx)?;
        let mut changed = false;
        for col in &mut self.accessor_mut(table_ndx).spec.cols {
            if col.kind == ColumnKind::LegacyDateTime {
                col.kind = ColumnKind::Timestamp;
                changed = true;
            }
        }
        if changed {
            self.persist_table(table_ndx)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rows and values
    // ------------------------------------------------------------------

    /// Appends `num_rows` empty rows. Returns the index of the first one.
    pub fn add_empty_rows(&mut self, table_ndx: usize, num_rows: u64) -> CoreResult<u64> {
        self.ensure_writable_top()?;
        self.ensure_accessor(table_ndx)?;
        if self.accessor(table_ndx).spec.cols.is_empty() {
            return Err(CoreError::wrong_group_state());
        }

        let prior_num_rows = self.accessor(table_ndx).row_count;
        let n_cols = self.accessor(table_ndx).spec.cols.len();
        for col_ndx in 0..n_cols {
            let (kind, root) = {
                let acc = self.accessor(table_ndx);
                (acc.spec.cols[col_ndx].kind, acc.col_roots[col_ndx])
            };
            if kind == ColumnKind::Backlink {
                continue;
            }
            let new_root = match kind {
                ColumnKind::String => {
                    let mut arr = StringArray::decode(self.alloc.node_bytes(root)?)?;
                    for _ in 0..num_rows {
                        arr.push("");
                    }
                    self.alloc.store_node(&arr.encode(), root)?
                }
                ColumnKind::LinkList => {
                    let mut arr = Array::decode(self.alloc.node_bytes(root)?)?;
                    for _ in 0..num_rows {
                        arr.push(RefOrTagged::Ref(0));
                    }
                    self.alloc.store_node(&arr.encode(), root)?
                }
                _ => {
                    let mut arr = Array::decode(self.alloc.node_bytes(root)?)?;
                    for _ in 0..num_rows {
                        arr.push(RefOrTagged::Int(0));
                    }
                    self.alloc.store_node(&arr.encode(), root)?
                }
            };
            self.accessor_mut(table_ndx).col_roots[col_ndx] = new_root;
        }
        self.accessor_mut(table_ndx).row_count = prior_num_rows + num_rows;
        self.persist_table(table_ndx)?;

        if let Some(repl) = self.replication.as_mut() {
            repl.select_table(table_ndx as u64);
            repl.push(Instruction::InsertEmptyRows {
                row_ndx: prior_num_rows,
                num_rows,
                prior_num_rows,
                unordered: false,
            });
        }
        Ok(prior_num_rows)
    }

    /// Removes all rows of a table.
    pub fn clear_table(&mut self, table_ndx: usize) -> CoreResult<()> {
        self.ensure_writable_top()?;
        self.ensure_accessor(table_ndx)?;

        let n_cols = self.accessor(table_ndx).spec.cols.len();
        for col_ndx in 0..n_cols {
            let (kind, root) = {
                let acc = self.accessor(table_ndx);
                (acc.spec.cols[col_ndx].kind, acc.col_roots[col_ndx])
            };
            if kind == ColumnKind::Backlink || root == 0 {
                continue;
            }
            let new_root = match kind {
                ColumnKind::String => {
                    let mut arr = StringArray::decode(self.alloc.node_bytes(root)?)?;
                    arr.truncate(0);
                    self.alloc.store_node(&arr.encode(), root)?
                }
                ColumnKind::LinkList => {
                    let mut arr = Array::decode(self.alloc.node_bytes(root)?)?;
                    for i in 0..arr.len() {
                        let list_ref = arr.get_ref(i);
                        self.alloc.destroy_deep(list_ref)?;
                    }
                    arr.truncate(0);
                    self.alloc.store_node(&arr.encode(), root)?
                }
                _ => {
                    let mut arr = Array::decode(self.alloc.node_bytes(root)?)?;
                    arr.truncate(0);
                    self.alloc.store_node(&arr.encode(), root)?
                }
            };
            self.accessor_mut(table_ndx).col_roots[col_ndx] = new_root;
        }
        self.accessor_mut(table_ndx).row_count = 0;
        self.persist_table(table_ndx)?;

        if let Some(repl) = self.replication.as_mut() {
            repl.select_table(table_ndx as u64);
            repl.push(Instruction::ClearTable);
        }
        Ok(())
    }

    fn check_cell(
        &mut self,
        table_ndx: usize,
        col_ndx: usize,
        row_ndx: u64,
        expected: &[ColumnKind],
    ) -> CoreResult<(ColumnKind, u64)> {
        self.ensure_writable_top()?;
        self.ensure_accessor(table_ndx)?;
        let acc = self.accessor(table_ndx);
        if col_ndx >= acc.spec.cols.len() || row_ndx >= acc.row_count {
            return Err(CoreError::table_index_out_of_range());
        }
        let kind = acc.spec.cols[col_ndx].kind;
        if !expected.contains(&kind) {
            return Err(CoreError::DescriptorMismatch);
        }
        Ok((kind, acc.col_roots[col_ndx]))
    }

    fn set_tagged_cell(
        &mut self,
        table_ndx: usize,
        col_ndx: usize,
        row_ndx: u64,
        value: i64,
        expected: &[ColumnKind],
    ) -> CoreResult<()> {
        let (_, root) = self.check_cell(table_ndx, col_ndx, row_ndx, expected)?;
        let mut arr = Array::decode(self.alloc.node_bytes(root)?)?;
        arr.set(row_ndx as usize, RefOrTagged::Int(value));
        let new_root = self.alloc.store_node(&arr.encode(), root)?;
        self.accessor_mut(table_ndx).col_roots[col_ndx] = new_root;
        self.persist_table(table_ndx)?;

        if let Some(repl) = self.replication.as_mut() {
            repl.select_table(table_ndx as u64);
            repl.push(Instruction::SetValue {
                col_ndx: col_ndx as u64,
                row_ndx,
            });
        }
        Ok(())
    }

    /// Sets an integer cell.
    pub fn set_int(
        &mut self,
        table_ndx: usize,
        col_ndx: usize,
        row_ndx: u64,
        value: i64,
    ) -> CoreResult<()> {
        self.set_tagged_cell(table_ndx, col_ndx, row_ndx, value, &[ColumnKind::Int])
    }

    /// Sets a boolean cell.
    pub fn set_bool(
        &mut self,
        table_ndx: usize,
        col_ndx: usize,
        row_ndx: u64,
        value: bool,
    ) -> CoreResult<()> {
        self.set_tagged_cell(
            table_ndx,
            col_ndx,
            row_ndx,
            i64::from(value),
            &[ColumnKind::Bool],
        )
    }

    /// Sets a timestamp cell (seconds since the epoch).
    pub fn set_timestamp(
        &mut self,
        table_ndx: usize,
        col_ndx: usize,
        row_ndx: u64,
        seconds: i64,
    ) -> CoreResult<()> {
        self.set_tagged_cell(
            table_ndx,
            col_ndx,
            row_ndx,
            seconds,
            &[ColumnKind::Timestamp, ColumnKind::LegacyDateTime],
        )
    }

    /// Sets a string cell.
    pub fn set_string(
        &mut self,
        table_ndx: usize,
        col_ndx: usize,
        row_ndx: u64,
        value: &str,
    ) -> CoreResult<()> {
        if value.len() > MAX_NAME_LENGTH {
            return Err(CoreError::table_name_too_long());
        }
        let (_, root) = self.check_cell(table_ndx, col_ndx, row_ndx, &[ColumnKind::String])?;
        let mut arr = StringArray::decode(self.alloc.node_bytes(root)?)?;
        arr.set(row_ndx as usize, value);
        let new_root = self.alloc.store_node(&arr.encode(), root)?;
        self.accessor_mut(table_ndx).col_roots[col_ndx] = new_root;
        self.persist_table(table_ndx)?;

        if let Some(repl) = self.replication.as_mut() {
            repl.select_table(table_ndx as u64);
            repl.push(Instruction::SetValue {
                col_ndx: col_ndx as u64,
                row_ndx,
            });
        }
        Ok(())
    }

    /// Sets a link cell. `None` clears the link.
    pub fn set_link(
        &mut self,
        table_ndx: usize,
        col_ndx: usize,
        row_ndx: u64,
        target_row: Option<u64>,
    ) -> CoreResult<()> {
        let (_, root) = self.check_cell(table_ndx, col_ndx, row_ndx, &[ColumnKind::Link])?;
        if let Some(target) = target_row {
            let target_table = self.accessor(table_ndx).spec.cols[col_ndx].opposite_table as usize;
            self.ensure_accessor(target_table)?;
            if target >= self.accessor(target_table).row_count {
                return Err(CoreError::table_index_out_of_range());
            }
        }
        let encoded = target_row.map_or(0, |t| t as i64 + 1);
        let mut arr = Array::decode(self.alloc.node_bytes(root)?)?;
        arr.set(row_ndx as usize, RefOrTagged::Int(encoded));
        let new_root = self.alloc.store_node(&arr.encode(), root)?;
        self.accessor_mut(table_ndx).col_roots[col_ndx] = new_root;
        self.persist_table(table_ndx)?;

        if let Some(repl) = self.replication.as_mut() {
            repl.select_table(table_ndx as u64);
            repl.push(Instruction::SetLink {
                col_ndx: col_ndx as u64,
                row_ndx,
                target_row: encoded as u64,
            });
        }
        Ok(())
    }

    /// Appends a target row to a link-list cell.
    pub fn link_list_push(
        &mut self,
        table_ndx: usize,
        col_ndx: usize,
        row_ndx: u64,
        target_row: u64,
    ) -> CoreResult<()> {
        let (_, root) = self.check_cell(table_ndx, col_ndx, row_ndx, &[ColumnKind::LinkList])?;
        let mut column = Array::decode(self.alloc.node_bytes(root)?)?;
        let list_ref = column.get_ref(row_ndx as usize);
        let mut list = if list_ref != 0 {
            Array::decode(self.alloc.node_bytes(list_ref)?)?
        } else {
            Array::new(false)
        };
        let list_len = list.len() as u64;
        list.push(RefOrTagged::Int(target_row as i64));
        let new_list_ref = self.alloc.store_node(&list.encode(), list_ref)?;
        column.set(row_ndx as usize, RefOrTagged::Ref(new_list_ref));
        let new_root = self.alloc.store_node(&column.encode(), root)?;
        self.accessor_mut(table_ndx).col_roots[col_ndx] = new_root;
        self.persist_table(table_ndx)?;

        if let Some(repl) = self.replication.as_mut() {
            repl.select_table(table_ndx as u64);
            repl.push(Instruction::SelectLinkList {
                col_ndx: col_ndx as u64,
                row_ndx,
            });
            repl.push(Instruction::LinkListInsert {
                list_ndx: list_len,
                target_row,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Spec plumbing
    // ------------------------------------------------------------------

    /// Persists a table's cached spec and column roots, rewiring the tree
    /// above it.
    pub(crate) fn persist_table(&mut self, table_ndx: usize) -> CoreResult<()> {
        let (spec, old_spec_ref, col_roots, old_columns_ref, root_ref) = {
            let acc = self.accessor(table_ndx);
            (
                acc.spec.clone(),
                acc.spec_ref,
                acc.col_roots.clone(),
                acc.columns_ref,
                acc.root_ref,
            )
        };
        let new_spec_ref = spec.store(&mut self.alloc, old_spec_ref)?;
        let mut columns = Array::new(true);
        for root in &col_roots {
            columns.push(RefOrTagged::Ref(*root));
        }
        let new_columns_ref = self.alloc.store_node(&columns.encode(), old_columns_ref)?;
        let new_root = self.persist_table_root(
            table_ndx,
            root_ref,
            Some(new_spec_ref),
            Some(new_columns_ref),
        )?;

        let acc = self.accessor_mut(table_ndx);
        acc.spec_ref = new_spec_ref;
        acc.columns_ref = new_columns_ref;
        acc.root_ref = new_root;
        Ok(())
    }

    /// Shifts `opposite_col` by `delta` in every spec entry (across all
    /// tables) that points at a column of `target_ndx` at or above
    /// `from_col`. Used when columns of `target_ndx` shift.
    pub(crate) fn adjust_opposite_columns(
        &mut self,
        target_ndx: usize,
        from_col: usize,
        delta: i64,
    ) -> CoreResult<()> {
        let target = target_ndx as u64;
        let from = from_col as u64;
        self.map_specs(|_, spec| {
            let mut changed = false;
            for col in &mut spec.cols {
                if (col.kind.is_link() || col.kind == ColumnKind::Backlink)
                    && col.opposite_table == target
                    && col.opposite_col >= from
                {
                    col.opposite_col = (col.opposite_col as i64 + delta) as u64;
                    changed = true;
                }
            }
            changed
        })
    }

    /// Applies `f` to every table's spec (cached or on-disk), persisting
    /// changed specs, marking their accessors, and refreshing marked
    /// accessors afterwards. `f` returns whether it changed the spec.
    pub(crate) fn map_specs(
        &mut self,
        mut f: impl FnMut(usize, &mut Spec) -> bool,
    ) -> CoreResult<()> {
        for i in 0..self.tables.len() {
            let cached = self.accessors.get(i).is_some_and(|slot| slot.is_some());
            if cached {
                let mut spec = self.accessor(i).spec.clone();
                if f(i, &mut spec) {
                    self.accessor_mut(i).spec = spec;
                    self.persist_spec(i)?;
                    self.accessor_mut(i).mark = true;
                }
            } else {
                let root_ref = self.tables.get_ref(i);
                let mut parts = load_table_parts(&self.alloc, root_ref)?;
                if f(i, &mut parts.spec) {
                    let new_spec_ref = parts.spec.store(&mut self.alloc, parts.spec_ref)?;
                    self.persist_table_root(i, root_ref, Some(new_spec_ref), None)?;
                }
            }
        }
        self.refresh_dirty_accessors()
    }
}

/// Deep logical comparison of two table trees, possibly living in
/// different allocators.
pub(crate) fn table_trees_equal(
    a_alloc: &SlabAlloc,
    a_root: u64,
    b_alloc: &SlabAlloc,
    b_root: u64,
) -> CoreResult<bool> {
    let a = load_table_parts(a_alloc, a_root)?;
    let b = load_table_parts(b_alloc, b_root)?;

    if a.spec.cols.len() != b.spec.cols.len() || a.row_count != b.row_count {
        return Ok(false);
    }
    for (ca, cb) in a.spec.cols.iter().zip(&b.spec.cols) {
        if ca.name != cb.name
            || ca.kind != cb.kind
            || ca.nullable != cb.nullable
            || ca.opposite_table != cb.opposite_table
            || ca.opposite_col != cb.opposite_col
        {
            return Ok(false);
        }
    }

    for (col_ndx, col) in a.spec.cols.iter().enumerate() {
        if col.kind == ColumnKind::Backlink {
            continue;
        }
        let ra = a.col_roots[col_ndx];
        let rb = b.col_roots[col_ndx];
        match col.kind {
            ColumnKind::String => {
                let va = StringArray::decode(a_alloc.node_bytes(ra)?)?;
                let vb = StringArray::decode(b_alloc.node_bytes(rb)?)?;
                if va.len() != vb.len() {
                    return Ok(false);
                }
                for i in 0..va.len() {
                    if va.get(i) != vb.get(i) {
                        return Ok(false);
                    }
                }
            }
            ColumnKind::LinkList => {
                let va = Array::decode(a_alloc.node_bytes(ra)?)?;
                let vb = Array::decode(b_alloc.node_bytes(rb)?)?;
                if va.len() != vb.len() {
                    return Ok(false);
                }
                for i in 0..va.len() {
                    let la = va.get_ref(i);
                    let lb = vb.get_ref(i);
                    let lista = if la != 0 {
                        Some(Array::decode(a_alloc.node_bytes(la)?)?)
                    } else {
                        None
                    };
                    let listb = if lb != 0 {
                        Some(Array::decode(b_alloc.node_bytes(lb)?)?)
                    } else {
                        None
                    };
                    let lena = lista.as_ref().map_or(0, Array::len);
                    let lenb = listb.as_ref().map_or(0, Array::len);
                    if lena != lenb {
                        return Ok(false);
                    }
                    if let (Some(lista), Some(listb)) = (lista, listb) {
                        for j in 0..lista.len() {
                            if lista.get_raw(j) != listb.get_raw(j) {
                                return Ok(false);
                            }
                        }
                    }
                }
            }
            _ => {
                let va = Array::decode(a_alloc.node_bytes(ra)?)?;
                let vb = Array::decode(b_alloc.node_bytes(rb)?)?;
                if va.len() != vb.len() {
                    return Ok(false);
                }
                for i in 0..va.len() {
                    if va.get_raw(i) != vb.get_raw(i) {
                        return Ok(false);
                    }
                }
            }
        }
    }
    Ok(true)
}

/// Builds a search index for one column: the row order sorted by value.
fn build_search_index(
    alloc: &mut SlabAlloc,
    kind: ColumnKind,
    root: u64,
) -> CoreResult<u64> {
    let mut order: Vec<u64>;
    match kind {
        ColumnKind::String => {
            let values = StringArray::decode(alloc.node_bytes(root)?)?;
            order = (0..values.len() as u64).collect();
            order.sort_by(|&x, &y| values.get(x as usize).cmp(values.get(y as usize)));
        }
        _ => {
            let values = Array::decode(alloc.node_bytes(root)?)?;
            order = (0..values.len() as u64).collect();
            order.sort_by_key(|&x| values.get_int(x as usize));
        }
    }
    let mut index = Array::new(false);
    for row in order {
        index.push(RefOrTagged::Int(row as i64));
    }
    alloc.store_node(&index.encode(), 0)
}

/// A read view of one table.
///
/// Handles are cheap (group reference plus index) and are obtained from
/// [`Group::get_table`]. The heavyweight state lives in the group's
/// accessor cache.
pub struct Table<'g> {
    group: &'g Group,
    ndx: usize,
}

impl<'g> Table<'g> {
    pub(crate) fn new(group: &'g Group, ndx: usize) -> Self {
        Self { group, ndx }
    }

    fn acc(&self) -> &TableAccessor {
        self.group.accessor(self.ndx)
    }

    /// The table's index in the group; its identity until it is removed.
    #[must_use]
    pub fn index(&self) -> usize {
        self.ndx
    }

    /// The table's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.group.names.get(self.ndx)
    }

    /// Number of payload columns (excluding backlink columns).
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.acc().spec.payload_column_count()
    }

    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.acc().row_count
    }

    /// Name of the column at `col_ndx`.
    #[must_use]
    pub fn column_name(&self, col_ndx: usize) -> &str {
        &self.acc().spec.cols[col_ndx].name
    }

    /// Kind of the column at `col_ndx`.
    #[must_use]
    pub fn column_kind(&self, col_ndx: usize) -> ColumnKind {
        self.acc().spec.cols[col_ndx].kind
    }

    /// Index of the column with the given name.
    #[must_use]
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.acc().spec.cols.iter().position(|c| c.name == name)
    }

    /// Group-level index of the opposite table of a link or backlink
    /// column.
    #[must_use]
    pub fn link_target(&self, col_ndx: usize) -> Option<usize> {
        let col = &self.acc().spec.cols[col_ndx];
        if col.kind.is_link() || col.kind == ColumnKind::Backlink {
            Some(col.opposite_table as usize)
        } else {
            None
        }
    }

    fn cell_root(&self, col_ndx: usize, row_ndx: u64, expected: &[ColumnKind]) -> CoreResult<u64> {
        let acc = self.acc();
        if col_ndx >= acc.spec.cols.len() || row_ndx >= acc.row_count {
            return Err(CoreError::table_index_out_of_range());
        }
        if !expected.contains(&acc.spec.cols[col_ndx].kind) {
            return Err(CoreError::DescriptorMismatch);
        }
        Ok(acc.col_roots[col_ndx])
    }

    /// Reads an integer cell.
    pub fn get_int(&self, col_ndx: usize, row_ndx: u64) -> CoreResult<i64> {
        let root = self.cell_root(col_ndx, row_ndx, &[ColumnKind::Int])?;
        let arr = Array::decode(self.group.alloc.node_bytes(root)?)?;
        Ok(arr.get_int(row_ndx as usize))
    }

    /// Reads a boolean cell.
    pub fn get_bool(&self, col_ndx: usize, row_ndx: u64) -> CoreResult<bool> {
        let root = self.cell_root(col_ndx, row_ndx, &[ColumnKind::Bool])?;
        let arr = Array::decode(self.group.alloc.node_bytes(root)?)?;
        Ok(arr.get_int(row_ndx as usize) != 0)
    }

    /// Reads a timestamp cell (seconds since the epoch).
    pub fn get_timestamp(&self, col_ndx: usize, row_ndx: u64) -> CoreResult<i64> {
        let root = self.cell_root(
            col_ndx,
            row_ndx,
            &[ColumnKind::Timestamp, ColumnKind::LegacyDateTime],
        )?;
        let arr = Array::decode(self.group.alloc.node_bytes(root)?)?;
        Ok(arr.get_int(row_ndx as usize))
    }

    /// Reads a string cell.
    pub fn get_string(&self, col_ndx: usize, row_ndx: u64) -> CoreResult<String> {
        let root = self.cell_root(col_ndx, row_ndx, &[ColumnKind::String])?;
        let arr = StringArray::decode(self.group.alloc.node_bytes(root)?)?;
        Ok(arr.get(row_ndx as usize).to_string())
    }

    /// Reads a link cell; `None` means the link is cleared.
    pub fn get_link(&self, col_ndx: usize, row_ndx: u64) -> CoreResult<Option<u64>> {
        let root = self.cell_root(col_ndx, row_ndx, &[ColumnKind::Link])?;
        let arr = Array::decode(self.group.alloc.node_bytes(root)?)?;
        let encoded = arr.get_int(row_ndx as usize);
        Ok(if encoded == 0 {
            None
        } else {
            Some(encoded as u64 - 1)
        })
    }

    /// Reads a link-list cell as a vector of target rows.
    pub fn get_link_list(&self, col_ndx: usize, row_ndx: u64) -> CoreResult<Vec<u64>> {
        let root = self.cell_root(col_ndx, row_ndx, &[ColumnKind::LinkList])?;
        let column = Array::decode(self.group.alloc.node_bytes(root)?)?;
        let list_ref = column.get_ref(row_ndx as usize);
        if list_ref == 0 {
            return Ok(Vec::new());
        }
        let list = Array::decode(self.group.alloc.node_bytes(list_ref)?)?;
        Ok((0..list.len()).map(|i| list.get_int(i) as u64).collect())
    }
}

impl std::fmt::Debug for Table<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("index", &self.ndx)
            .field("name", &self.name())
            .field("columns", &self.column_count())
            .field("rows", &self.row_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_tables() -> Group {
        let mut group = Group::new().unwrap();
        group.add_table("A", true).unwrap();
        group.add_table("B", true).unwrap();
        group
    }

    #[test]
    fn add_column_and_rows() {
        let mut group = Group::new().unwrap();
        group.add_table("T", true).unwrap();
        let age = group.add_column(0, ColumnKind::Int, "age", false).unwrap();
        let name = group
            .add_column(0, ColumnKind::String, "name", true)
            .unwrap();

        group.add_empty_rows(0, 3).unwrap();
        group.set_int(0, age, 0, 41).unwrap();
        group.set_string(0, name, 0, "alice").unwrap();

        let table = group.get_table(0).unwrap();
        assert_eq!(table.column_count(), 2);
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.get_int(age, 0).unwrap(), 41);
        assert_eq!(table.get_int(age, 1).unwrap(), 0);
        assert_eq!(table.get_string(name, 0).unwrap(), "alice");
        assert_eq!(table.get_string(name, 2).unwrap(), "");
    }

    #[test]
    fn cell_type_is_checked() {
        let mut group = Group::new().unwrap();
        group.add_table("T", true).unwrap();
        group.add_column(0, ColumnKind::Int, "n", false).unwrap();
        group.add_empty_rows(0, 1).unwrap();

        assert!(matches!(
            group.set_string(0, 0, 0, "oops"),
            Err(CoreError::DescriptorMismatch)
        ));
        assert!(matches!(
            group.set_int(0, 0, 5, 1),
            Err(CoreError::Logic(_))
        ));
    }

    #[test]
    fn link_column_creates_backlink() {
        let mut group = two_tables();
        let col = group
            .add_link_column(0, ColumnKind::Link, "to_b", 1)
            .unwrap();
        assert_eq!(col, 0);

        // Origin side
        let a = group.accessor(0);
        assert_eq!(a.spec.cols[0].kind, ColumnKind::Link);
        assert_eq!(a.spec.cols[0].opposite_table, 1);
        assert_eq!(a.spec.cols[0].opposite_col, 0);

        // Target side
        let b = group.accessor(1);
        assert_eq!(b.spec.cols.len(), 1);
        assert_eq!(b.spec.cols[0].kind, ColumnKind::Backlink);
        assert_eq!(b.spec.cols[0].opposite_table, 0);
        assert_eq!(b.spec.cols[0].opposite_col, 0);

        // B's payload column count excludes the backlink
        let table = group.get_table(1).unwrap();
        assert_eq!(table.column_count(), 0);
    }

    #[test]
    fn self_link_column() {
        let mut group = Group::new().unwrap();
        group.add_table("T", true).unwrap();
        let col = group
            .add_link_column(0, ColumnKind::Link, "parent", 0)
            .unwrap();

        let acc = group.accessor(0);
        assert_eq!(acc.spec.cols.len(), 2);
        assert_eq!(acc.spec.cols[col].kind, ColumnKind::Link);
        assert_eq!(acc.spec.cols[1].kind, ColumnKind::Backlink);
        assert_eq!(acc.spec.cols[col].opposite_col, 1);
        assert_eq!(acc.spec.cols[1].opposite_col, 0);

        group.add_empty_rows(0, 2).unwrap();
        group.set_link(0, col, 1, Some(0)).unwrap();
        let table = group.get_table(0).unwrap();
        assert_eq!(table.get_link(col, 1).unwrap(), Some(0));
        assert_eq!(table.get_link(col, 0).unwrap(), None);
    }

    #[test]
    fn link_values_roundtrip() {
        let mut group = two_tables();
        let col = group
            .add_link_column(0, ColumnKind::Link, "to_b", 1)
            .unwrap();
        group.add_column(1, ColumnKind::Int, "n", false).unwrap();
        group.add_empty_rows(0, 2).unwrap();
        group.add_empty_rows(1, 3).unwrap();

        group.set_link(0, col, 0, Some(2)).unwrap();
        group.set_link(0, col, 1, None).unwrap();
        assert!(matches!(
            group.set_link(0, col, 0, Some(9)),
            Err(CoreError::Logic(_))
        ));

        let a = group.get_table(0).unwrap();
        assert_eq!(a.get_link(col, 0).unwrap(), Some(2));
        assert_eq!(a.get_link(col, 1).unwrap(), None);
    }

    #[test]
    fn link_list_roundtrip() {
        let mut group = two_tables();
        let col = group
            .add_link_column(0, ColumnKind::LinkList, "many_b", 1)
            .unwrap();
        group.add_column(1, ColumnKind::Int, "n", false).unwrap();
        group.add_empty_rows(0, 1).unwrap();
        group.add_empty_rows(1, 4).unwrap();

        group.link_list_push(0, col, 0, 3).unwrap();
        group.link_list_push(0, col, 0, 1).unwrap();

        let a = group.get_table(0).unwrap();
        assert_eq!(a.get_link_list(col, 0).unwrap(), vec![3, 1]);
    }

    #[test]
    fn remove_link_target_fails_until_link_removed() {
        // Scenario: A links to B; removing B fails, removing A succeeds,
        // then B sits at index 0.
        let mut group = two_tables();
        group
            .add_link_column(0, ColumnKind::Link, "to_b", 1)
            .unwrap();

        let before_names: Vec<String> = (0..group.size())
            .map(|i| group.table_name(i).unwrap().to_string())
            .collect();
        assert!(matches!(
            group.remove_table_by_name("B"),
            Err(CoreError::CrossTableLinkTarget)
        ));
        // State unchanged after the failure
        let after_names: Vec<String> = (0..group.size())
            .map(|i| group.table_name(i).unwrap().to_string())
            .collect();
        assert_eq!(before_names, after_names);
        assert_eq!(group.accessor(1).spec.cols.len(), 1);

        group.remove_table_by_name("A").unwrap();
        assert_eq!(group.size(), 1);
        let b = group.get_table_by_name("B").unwrap().unwrap();
        assert_eq!(b.index(), 0);
        // The backlink column disappeared with A's link column.
        assert_eq!(group.accessor(0).spec.cols.len(), 0);
    }

    #[test]
    fn self_linking_table_can_be_removed() {
        let mut group = Group::new().unwrap();
        group.add_table("T", true).unwrap();
        group
            .add_link_column(0, ColumnKind::Link, "parent", 0)
            .unwrap();
        group.remove_table(0).unwrap();
        assert_eq!(group.size(), 0);
    }

    #[test]
    fn insert_table_shifts_opposite_indices() {
        // Scenario: A, B, C with links; insert X at 1; links that pointed
        // at index >= 1 now read old+1.
        let mut group = Group::new().unwrap();
        group.add_table("A", true).unwrap();
        group.add_table("B", true).unwrap();
        group.add_table("C", true).unwrap();
        let a_to_c = group
            .add_link_column(0, ColumnKind::Link, "to_c", 2)
            .unwrap();
        let c_to_a = group
            .add_link_column(2, ColumnKind::Link, "to_a", 0)
            .unwrap();

        group.insert_table(1, "X", true).unwrap();
        assert_eq!(group.table_name(1).unwrap(), "X");

        let a = group.get_table(0).unwrap();
        assert_eq!(a.link_target(a_to_c), Some(3));
        let c = group.get_table(3).unwrap();
        assert_eq!(c.link_target(c_to_a), Some(0));
    }

    #[test]
    fn remove_table_shifts_opposite_indices() {
        let mut group = Group::new().unwrap();
        group.add_table("A", true).unwrap();
        group.add_table("B", true).unwrap();
        group.add_table("C", true).unwrap();
        let b_to_c = group
            .add_link_column(1, ColumnKind::Link, "to_c", 2)
            .unwrap();

        group.remove_table(0).unwrap();
        let b = group.get_table(0).unwrap();
        assert_eq!(b.name(), "B");
        assert_eq!(b.link_target(b_to_c), Some(1));
    }

    #[test]
    fn remove_middle_column_adjusts_counterparts() {
        let mut group = two_tables();
        group.add_column(0, ColumnKind::Int, "n", false).unwrap();
        let link1 = group
            .add_link_column(0, ColumnKind::Link, "first", 1)
            .unwrap();
        let link2 = group
            .add_link_column(0, ColumnKind::Link, "second", 1)
            .unwrap();
        assert_eq!((link1, link2), (1, 2));

        // Remove the first link column; the second one's backlink pair in B
        // must now point at column 1.
        group.remove_column(0, link1).unwrap();
        let a = group.accessor(0);
        assert_eq!(a.spec.cols[1].kind, ColumnKind::Link);
        assert_eq!(a.spec.cols[1].opposite_col, 0);
        let b = group.accessor(1);
        assert_eq!(b.spec.cols.len(), 1);
        assert_eq!(b.spec.cols[0].opposite_col, 1);
    }

    #[test]
    fn backlink_column_cannot_be_removed_directly() {
        let mut group = two_tables();
        group
            .add_link_column(0, ColumnKind::Link, "to_b", 1)
            .unwrap();
        assert!(matches!(
            group.remove_column(1, 0),
            Err(CoreError::Logic(_))
        ));
    }

    #[test]
    fn search_index_sorts_rows() {
        let mut group = Group::new().unwrap();
        group.add_table("T", true).unwrap();
        let col = group
            .add_column(0, ColumnKind::String, "name", false)
            .unwrap();
        group.add_empty_rows(0, 3).unwrap();
        group.set_string(0, col, 0, "cherry").unwrap();
        group.set_string(0, col, 1, "apple").unwrap();
        group.set_string(0, col, 2, "banana").unwrap();
        group.add_search_index(0, col).unwrap();

        let acc = group.accessor(0);
        assert!(acc.spec.cols[col].indexed);
        let index = Array::decode(group.alloc.node_bytes(acc.spec.cols[col].index_ref).unwrap())
            .unwrap();
        let order: Vec<i64> = (0..index.len()).map(|i| index.get_int(i)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn legacy_datetime_upgrades_to_timestamp() {
        let mut group = Group::new().unwrap();
        group.add_table("T", true).unwrap();
        let col = group
            .add_column(0, ColumnKind::LegacyDateTime, "at", false)
            .unwrap();
        group.add_empty_rows(0, 1).unwrap();
        group.set_timestamp(0, col, 0, 1234567).unwrap();

        group.upgrade_legacy_datetime(0).unwrap();
        let table = group.get_table(0).unwrap();
        assert_eq!(table.column_kind(col), ColumnKind::Timestamp);
        assert_eq!(table.get_timestamp(col, 0).unwrap(), 1234567);
    }

    #[test]
    fn clear_table_resets_rows() {
        let mut group = Group::new().unwrap();
        group.add_table("T", true).unwrap();
        group.add_column(0, ColumnKind::Int, "n", false).unwrap();
        group.add_empty_rows(0, 5).unwrap();
        group.clear_table(0).unwrap();

        let table = group.get_table(0).unwrap();
        assert_eq!(table.row_count(), 0);
    }

    #[test]
    fn accessor_materialisation_handles_link_cycles() {
        let mut group = two_tables();
        group
            .add_link_column(0, ColumnKind::Link, "to_b", 1)
            .unwrap();
        group
            .add_link_column(1, ColumnKind::Link, "to_a", 0)
            .unwrap();

        // Drop the cache, then materialise one side only; the cycle must
        // pull in the other side without recursing forever.
        group.accessors.clear();
        group.get_table(0).unwrap();
        assert!(group.accessors[0].as_ref().unwrap().complete);
        assert!(group.accessors[1].as_ref().unwrap().complete);
    }
}
