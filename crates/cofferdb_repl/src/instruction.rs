//! Transaction log instructions.

use crate::error::LogError;

/// Kind of a table column, as carried in schema instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// 64-bit signed integer.
    Int,
    /// Boolean.
    Bool,
    /// UTF-8 string (at most 63 bytes when used as a table name).
    String,
    /// Timestamp (seconds since the epoch).
    Timestamp,
    /// Pre-upgrade datetime representation; rewritten to `Timestamp` by the
    /// file format upgrader.
    LegacyDateTime,
    /// Single link to a row of another (or the same) table.
    Link,
    /// Ordered list of links to rows of another (or the same) table.
    LinkList,
    /// Reverse side of a link column; maintained, never set directly.
    Backlink,
}

impl ColumnKind {
    /// Converts to a numeric code for log encoding.
    #[must_use]
    pub const fn to_code(self) -> u8 {
        match self {
            ColumnKind::Int => 0,
            ColumnKind::Bool => 1,
            ColumnKind::String => 2,
            ColumnKind::Timestamp => 3,
            ColumnKind::LegacyDateTime => 4,
            ColumnKind::Link => 5,
            ColumnKind::LinkList => 6,
            ColumnKind::Backlink => 7,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Result<Self, LogError> {
        match code {
            0 => Ok(ColumnKind::Int),
            1 => Ok(ColumnKind::Bool),
            2 => Ok(ColumnKind::String),
            3 => Ok(ColumnKind::Timestamp),
            4 => Ok(ColumnKind::LegacyDateTime),
            5 => Ok(ColumnKind::Link),
            6 => Ok(ColumnKind::LinkList),
            7 => Ok(ColumnKind::Backlink),
            _ => Err(LogError::UnknownColumnKind { code }),
        }
    }

    /// Whether this kind points at another table from the origin side.
    #[must_use]
    pub const fn is_link(self) -> bool {
        matches!(self, ColumnKind::Link | ColumnKind::LinkList)
    }
}

/// One transaction log instruction.
///
/// Arguments are assumed well-typed and in-range with respect to the target
/// snapshot; the consumer performs no redundant validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// A table was inserted at `table_ndx`; tables at and above that index
    /// shifted up by one.
    InsertGroupLevelTable {
        /// Position of the new table.
        table_ndx: u64,
        /// Number of tables before the insertion.
        prior_num_tables: u64,
        /// Name of the new table.
        name: String,
    },

    /// The table at `table_ndx` was removed; tables above shifted down.
    EraseGroupLevelTable {
        /// Position of the removed table.
        table_ndx: u64,
        /// Number of tables before the removal.
        prior_num_tables: u64,
    },

    /// The table at `table_ndx` was renamed.
    RenameGroupLevelTable {
        /// Position of the renamed table.
        table_ndx: u64,
        /// The new name.
        new_name: String,
    },

    /// Selects the target table for subsequent row / column / value
    /// instructions. The path descends through subtable columns as
    /// `(column, row)` pairs; an empty path selects the group-level table.
    SelectTable {
        /// Group-level table index.
        group_ndx: u64,
        /// Subtable descent path.
        path: Vec<(u64, u64)>,
    },

    /// Empty rows were inserted into the selected table.
    InsertEmptyRows {
        /// Position of the first new row.
        row_ndx: u64,
        /// Number of rows inserted.
        num_rows: u64,
        /// Row count before the insertion.
        prior_num_rows: u64,
        /// Whether the insertion was unordered (move-last-over style).
        unordered: bool,
    },

    /// Rows were erased from the selected table.
    EraseRows {
        /// Position of the first erased row.
        row_ndx: u64,
        /// Number of rows erased (at most one when `unordered`).
        num_rows: u64,
        /// Row count before the erasure.
        prior_num_rows: u64,
        /// Whether the erasure was move-last-over-target.
        unordered: bool,
    },

    /// Two rows of the selected table swapped places.
    SwapRows {
        /// First row.
        row_1: u64,
        /// Second row.
        row_2: u64,
    },

    /// A row of the selected table moved to a new position.
    MoveRow {
        /// Source row.
        from_ndx: u64,
        /// Destination row.
        to_ndx: u64,
    },

    /// A row's links were merged into another row.
    MergeRows {
        /// Source row.
        row_ndx: u64,
        /// Row that received the links.
        new_row_ndx: u64,
    },

    /// All rows of the selected table were removed.
    ClearTable,

    /// A non-link column was inserted into the selected table.
    InsertColumn {
        /// Position of the new column.
        col_ndx: u64,
        /// Column kind.
        kind: ColumnKind,
        /// Column name.
        name: String,
        /// Whether the column is nullable.
        nullable: bool,
    },

    /// A link column was inserted into the selected table, adding a backlink
    /// column to the target table as a side effect.
    InsertLinkColumn {
        /// Position of the new column in the origin table.
        col_ndx: u64,
        /// Column kind (`Link` or `LinkList`).
        kind: ColumnKind,
        /// Column name.
        name: String,
        /// Group-level index of the link target table.
        target_table_ndx: u64,
        /// Position of the new backlink column in the target table.
        backlink_col_ndx: u64,
    },

    /// A non-link column was erased from the selected table.
    EraseColumn {
        /// Position of the erased column.
        col_ndx: u64,
    },

    /// A link column was erased, removing the matching backlink column from
    /// the target table as a side effect.
    EraseLinkColumn {
        /// Position of the erased column in the origin table.
        col_ndx: u64,
        /// Group-level index of the link target table.
        target_table_ndx: u64,
        /// Position of the removed backlink column in the target table.
        backlink_col_ndx: u64,
    },

    /// A column of the selected table was renamed.
    RenameColumn {
        /// Position of the renamed column.
        col_ndx: u64,
        /// The new name.
        new_name: String,
    },

    /// A search index was added to a column of the selected table.
    AddSearchIndex {
        /// Position of the indexed column.
        col_ndx: u64,
    },

    /// A search index was removed from a column of the selected table.
    RemoveSearchIndex {
        /// Position of the column.
        col_ndx: u64,
    },

    /// A payload cell of the selected table was set. Carries no schema
    /// effect; consumers may ignore everything but the touched location.
    SetValue {
        /// Column of the cell.
        col_ndx: u64,
        /// Row of the cell.
        row_ndx: u64,
    },

    /// A link cell of the selected table was set.
    SetLink {
        /// Link column.
        col_ndx: u64,
        /// Row of the cell.
        row_ndx: u64,
        /// New target row (`0` = null, otherwise target row + 1).
        target_row: u64,
    },

    /// A link cell of the selected table was nullified by target row
    /// removal.
    NullifyLink {
        /// Link column.
        col_ndx: u64,
        /// Row of the cell.
        row_ndx: u64,
    },

    /// Selects a link list cell for subsequent `LinkList*` instructions.
    SelectLinkList {
        /// Link-list column.
        col_ndx: u64,
        /// Row of the cell.
        row_ndx: u64,
    },

    /// An entry of the selected link list was overwritten.
    LinkListSet {
        /// Position inside the list.
        list_ndx: u64,
        /// New target row.
        target_row: u64,
    },

    /// An entry was inserted into the selected link list.
    LinkListInsert {
        /// Position inside the list.
        list_ndx: u64,
        /// Target row.
        target_row: u64,
    },

    /// An entry was erased from the selected link list.
    LinkListErase {
        /// Position inside the list.
        list_ndx: u64,
    },

    /// The selected link list was cleared.
    LinkListClear,

    /// The selected table's leaf representation was optimized. No
    /// consequences for accessors.
    OptimizeTable,
}

impl Instruction {
    /// Whether replaying this instruction changes the group's schema.
    #[must_use]
    pub fn changes_schema(&self) -> bool {
        matches!(
            self,
            Instruction::InsertGroupLevelTable { .. }
                | Instruction::EraseGroupLevelTable { .. }
                | Instruction::RenameGroupLevelTable { .. }
                | Instruction::InsertColumn { .. }
                | Instruction::InsertLinkColumn { .. }
                | Instruction::EraseColumn { .. }
                | Instruction::EraseLinkColumn { .. }
                | Instruction::RenameColumn { .. }
        )
    }
}
