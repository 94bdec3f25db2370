//! File format versions and the upgrade ladder.
//!
//! Valid on-disk format versions are 0 (empty file), 6, 7, 8, and 9
//! (current). Versions below 6 can only be read when an upgrader is
//! allowed to rewrite the file, which requires shared mode.

use crate::array::RefOrTagged;
use crate::error::CoreResult;
use crate::group::{Group, HistoryType};

/// The file format version written by this release.
pub const CURRENT_FILE_FORMAT: u8 = 9;

/// Chooses the file format a new session will run at.
///
/// This is the only place where the upgrade target is chosen: selecting a
/// format different from `current` triggers the upgrade process. A session
/// without replication history can keep formats 6 through 8 as they are;
/// everything else moves to the current format. `current` may be 0 for an
/// empty file whose format is not yet decided.
#[must_use]
pub fn target_file_format_for_session(current: u8, requested_history: HistoryType) -> u8 {
    if requested_history == HistoryType::None && matches!(current, 6 | 7 | 8) {
        return current;
    }
    CURRENT_FILE_FORMAT
}

impl Group {
    /// Runs the file format upgrade ladder up to `target`.
    ///
    /// Already-current groups return immediately, so the ladder is
    /// idempotent at the fixed point. Each step's precondition makes the
    /// ladder itself idempotent: steps whose work is already present are
    /// skipped.
    ///
    /// # Panics
    ///
    /// The group must be attached, `target` must be the current release
    /// format, and the on-disk version must be one the ladder knows how to
    /// lift (2 through 8). The caller (session open) guarantees all three.
    pub fn upgrade_file_format(&mut self, target_file_format_version: u8) -> CoreResult<()> {
        assert!(self.is_attached());

        // Revisit this ladder when a new file format version is introduced.
        assert_eq!(target_file_format_version, CURRENT_FILE_FORMAT);

        let current = self.file_format_version();
        if current == target_file_format_version {
            return Ok(());
        }
        assert!(current < target_file_format_version);
        assert!((2..=8).contains(&current), "format {current} is not upgradable");

        // Prior to version 5: old datetime representation.
        if current < 5 {
            for table_ndx in 0..self.size() {
                self.upgrade_legacy_datetime(table_ndx)?;
            }
        }

        // Prior to version 6: string index format changed.
        if current < 6 {
            for table_ndx in 0..self.size() {
                self.rebuild_search_indexes(table_ndx)?;
            }
        }

        // Prior to version 7: the history schema version joined the top
        // array. A 9-slot top gains the missing 10th slot; larger tops are
        // already current or newer.
        if current <= 6 && target_file_format_version >= 7 {
            let top_size = self.top.len();
            debug_assert!(top_size <= 9);
            if top_size == 9 {
                let initial_history_schema_version = 0;
                self.top
                    .push(RefOrTagged::Int(initial_history_schema_version));
                self.store_group_arrays()?;
            }
        }

        // Upgrading to versions 8 and 9 requires no structural change.

        self.set_file_format_version(target_file_format_version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_target_keeps_plain_sessions_on_their_format() {
        for format in [6, 7, 8] {
            assert_eq!(
                target_file_format_for_session(format, HistoryType::None),
                format
            );
        }
    }

    #[test]
    fn session_target_moves_everything_else_to_current() {
        assert_eq!(target_file_format_for_session(0, HistoryType::None), 9);
        assert_eq!(target_file_format_for_session(9, HistoryType::None), 9);
        assert_eq!(target_file_format_for_session(2, HistoryType::None), 9);
        for format in [0, 6, 7, 8, 9] {
            assert_eq!(
                target_file_format_for_session(format, HistoryType::SyncClient),
                9
            );
            assert_eq!(
                target_file_format_for_session(format, HistoryType::Local),
                9
            );
        }
    }

    /// Grows a fresh group's top array to nine slots, the shape of a
    /// pre-version-7 file with history.
    fn group_with_nine_slot_top() -> Group {
        let mut group = Group::new().unwrap();
        group.add_table("T", true).unwrap();
        while group.top.len() < 7 {
            group.top.push(RefOrTagged::Ref(0));
        }
        group
            .top
            .push(RefOrTagged::Int(HistoryType::Local.to_code()));
        group.top.push(RefOrTagged::Ref(0));
        assert_eq!(group.top.len(), 9);
        group.store_group_arrays().unwrap();
        group
    }

    #[test]
    fn upgrade_from_6_appends_history_schema_slot() {
        let mut group = group_with_nine_slot_top();
        group.set_file_format_version(6);

        group.upgrade_file_format(9).unwrap();
        assert_eq!(group.file_format_version(), 9);
        assert_eq!(group.top.len(), 10);
        assert_eq!(group.top.get_int(9), 0);
    }

    #[test]
    fn upgrade_is_idempotent_at_the_fixed_point() {
        let mut group = group_with_nine_slot_top();
        group.set_file_format_version(6);
        group.upgrade_file_format(9).unwrap();

        // Calling again is a no-op.
        group.upgrade_file_format(9).unwrap();
        assert_eq!(group.file_format_version(), 9);
        assert_eq!(group.top.len(), 10);
    }

    #[test]
    fn upgrade_from_7_changes_nothing_structural() {
        let mut group = Group::new().unwrap();
        group.add_table("T", true).unwrap();
        let top_len = group.top.len();
        group.set_file_format_version(7);

        group.upgrade_file_format(9).unwrap();
        assert_eq!(group.file_format_version(), 9);
        assert_eq!(group.top.len(), top_len);
    }

    #[test]
    fn upgrade_from_2_rewrites_datetimes_and_indexes() {
        use cofferdb_repl::ColumnKind;

        let mut group = Group::new().unwrap();
        group.add_table("T", true).unwrap();
        let at = group
            .add_column(0, ColumnKind::LegacyDateTime, "at", false)
            .unwrap();
        let name = group
            .add_column(0, ColumnKind::String, "name", false)
            .unwrap();
        group.add_empty_rows(0, 2).unwrap();
        group.set_timestamp(0, at, 0, 500).unwrap();
        group.set_string(0, name, 1, "zz").unwrap();
        group.add_search_index(0, name).unwrap();
        group.set_file_format_version(2);

        group.upgrade_file_format(9).unwrap();
        let table = group.get_table(0).unwrap();
        assert_eq!(table.column_kind(at), ColumnKind::Timestamp);
        assert_eq!(table.get_timestamp(at, 0).unwrap(), 500);
        assert!(group.accessor(0).spec.cols[name].indexed);
    }
}
