//! The group coordinator: one snapshot of a CofferDB file.
//!
//! A [`Group`] owns the root of a snapshot's array tree, the registry of
//! named tables underneath it, and the cache of live table accessors. It is
//! single-threaded: one logical owner at a time, every call runs to
//! completion or fails.
//!
//! The top array has one of five sizes. Slots 0-2 (table names, tables,
//! logical file size) are always present; slots 3-6 carry the free list and
//! snapshot version; slots 7-9 carry the replication history.

use std::path::Path;

use cofferdb_repl::{ColumnKind, Instruction, TransactLogBuilder};
use cofferdb_storage::{EncryptedBackend, EncryptionKey, FileBackend, StorageBackend};
use tracing::debug;

use crate::alloc::{Chunk, SlabAlloc, FILE_HEADER_SIZE};
use crate::array::{Array, RefOrTagged, StringArray};
use crate::error::{CoreError, CoreResult};
use crate::table::{self, Table, TableAccessor};
use crate::upgrade::target_file_format_for_session;

/// Maximum length of a table or column name in bytes.
pub const MAX_NAME_LENGTH: usize = 63;

// Top array slot indices.
pub(crate) const TOP_NAMES: usize = 0;
pub(crate) const TOP_TABLES: usize = 1;
pub(crate) const TOP_LOGICAL_SIZE: usize = 2;
pub(crate) const TOP_FREE_POSITIONS: usize = 3;
pub(crate) const TOP_FREE_LENGTHS: usize = 4;
pub(crate) const TOP_FREE_VERSIONS: usize = 5;
pub(crate) const TOP_VERSION: usize = 6;
pub(crate) const TOP_HISTORY_TYPE: usize = 7;
pub(crate) const TOP_HISTORY_REF: usize = 8;
pub(crate) const TOP_HISTORY_SCHEMA_VERSION: usize = 9;

/// How to open a database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing file for reading.
    ReadOnly,
    /// Open for reading and writing, creating the file if missing.
    ReadWrite,
    /// Open for reading and writing, failing if the file does not exist.
    ReadWriteNoCreate,
}

/// Kind of replication history attached to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryType {
    /// No history.
    None,
    /// Local-only history; dropped when writing the group to a fresh file.
    Local,
    /// Sync client history; preserved across rewrites.
    SyncClient,
    /// Sync server history; preserved across rewrites.
    SyncServer,
}

impl HistoryType {
    pub(crate) fn to_code(self) -> i64 {
        match self {
            HistoryType::None => 0,
            HistoryType::Local => 1,
            HistoryType::SyncClient => 2,
            HistoryType::SyncServer => 3,
        }
    }

    pub(crate) fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(HistoryType::None),
            1 => Some(HistoryType::Local),
            2 => Some(HistoryType::SyncClient),
            3 => Some(HistoryType::SyncServer),
            _ => None,
        }
    }

    /// Whether this history survives a rewrite to a fresh file.
    pub(crate) fn preserved_on_write(self) -> bool {
        matches!(self, HistoryType::SyncClient | HistoryType::SyncServer)
    }
}

/// Selects which parts of a snapshot `Group::aggregated_byte_size` counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeAggregate {
    /// Table state: names, tables, top array, and file header.
    pub state: bool,
    /// The three free-list arrays.
    pub freelists: bool,
    /// The history tree.
    pub history: bool,
}

impl SizeAggregate {
    /// Everything.
    #[must_use]
    pub fn all() -> Self {
        Self {
            state: true,
            freelists: true,
            history: true,
        }
    }

    /// Only the table state.
    #[must_use]
    pub fn state() -> Self {
        Self {
            state: true,
            ..Self::default()
        }
    }
}

/// The group coordinator.
///
/// See the crate docs for the lifecycle: a group is either unattached or
/// attached to one snapshot. Unshared groups may be mutated freely and
/// committed; shared groups are driven by the shared-group collaborator
/// through [`Group::attach_shared`] and [`Group::advance_transact`].
pub struct Group {
    pub(crate) alloc: SlabAlloc,
    pub(crate) top_ref: u64,
    pub(crate) top: Array,
    pub(crate) names: StringArray,
    pub(crate) names_ref: u64,
    pub(crate) tables: Array,
    pub(crate) tables_ref: u64,
    pub(crate) attached: bool,
    pub(crate) top_attached: bool,
    pub(crate) is_shared: bool,
    /// Set when a post-mutation failure left only minimal consistency.
    /// Every operation except detach then refuses to run.
    pub(crate) poisoned: bool,
    pub(crate) file_format_version: u8,
    pub(crate) accessors: Vec<Option<TableAccessor>>,
    pub(crate) replication: Option<TransactLogBuilder>,
    pub(crate) schema_change_handler: Option<Box<dyn FnMut()>>,
}

impl Group {
    fn unattached() -> Self {
        Self {
            alloc: SlabAlloc::new(),
            top_ref: 0,
            top: Array::new(true),
            names: StringArray::new(),
            names_ref: 0,
            tables: Array::new(true),
            tables_ref: 0,
            attached: false,
            top_attached: false,
            is_shared: false,
            poisoned: false,
            file_format_version: 0,
            accessors: Vec::new(),
            replication: None,
            schema_change_handler: None,
        }
    }

    /// Creates a new empty in-memory group.
    pub fn new() -> CoreResult<Self> {
        let mut group = Self::unattached();
        group.alloc.attach_empty();
        group.file_format_version = target_file_format_for_session(0, HistoryType::None);
        group.attach(0, true)?;
        Ok(group)
    }

    /// Opens a database file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidDatabase`] when the image fails
    /// validation; the group is then not constructed. With `ReadOnly` or
    /// `ReadWriteNoCreate` a missing file is an I/O error.
    pub fn open_file(
        path: &Path,
        mode: OpenMode,
        key: Option<&EncryptionKey>,
    ) -> CoreResult<Self> {
        let file = match mode {
            OpenMode::ReadOnly => FileBackend::open_read_only(path)?,
            OpenMode::ReadWrite => FileBackend::open(path)?,
            OpenMode::ReadWriteNoCreate => FileBackend::open_no_create(path)?,
        };
        let backend: Box<dyn StorageBackend> = match key {
            Some(key) => Box::new(EncryptedBackend::new(Box::new(file), key)?),
            None => Box::new(file),
        };

        let mut group = Self::unattached();
        let path_str = path.display().to_string();
        let top_ref = group.alloc.attach_file(backend, &path_str)?;
        group.open_from_ref(top_ref)?;
        debug!(path = %path_str, tables = group.size(), "opened database");
        Ok(group)
    }

    /// Opens a database from an in-memory image, taking ownership of it.
    pub fn open_buffer(buffer: Vec<u8>) -> CoreResult<Self> {
        let mut group = Self::unattached();
        let top_ref = group.alloc.attach_buffer(buffer)?;
        group.open_from_ref(top_ref)?;
        Ok(group)
    }

    fn open_from_ref(&mut self, top_ref: u64) -> CoreResult<()> {
        self.file_format_version = self.alloc.committed_file_format();

        // In unshared mode only formats that need no upgrade can be opened;
        // the file may not be writable.
        let format_ok = match self.file_format_version {
            0 => top_ref == 0,
            6..=9 => true,
            _ => false,
        };
        if !format_ok {
            return Err(CoreError::invalid_database(
                "unsupported file format version",
                self.alloc.path(),
            ));
        }

        let target = target_file_format_for_session(self.file_format_version, HistoryType::None);
        if self.file_format_version == 0 {
            self.file_format_version = target;
        } else {
            debug_assert_eq!(target, self.file_format_version);
        }

        self.alloc.reset_free_space_tracking();
        self.attach(top_ref, true)?;
        self.load_free_list()?;
        Ok(())
    }

    /// Binds the group to the top array at `top_ref`.
    ///
    /// All-or-nothing: on failure no field has been touched and the group
    /// stays unattached.
    pub(crate) fn attach(&mut self, top_ref: u64, create_group_when_missing: bool) -> CoreResult<()> {
        debug_assert!(!self.top_attached);

        if top_ref != 0 {
            let top = Array::decode(self.alloc.node_bytes(top_ref)?)?;
            Self::validate_top_array(&top, &self.alloc, top_ref)?;
            let names_ref = top.get_ref(TOP_NAMES);
            let tables_ref = top.get_ref(TOP_TABLES);
            let names = StringArray::decode(self.alloc.node_bytes(names_ref)?)?;
            let tables = Array::decode(self.alloc.node_bytes(tables_ref)?)?;
            if names.len() != tables.len() {
                return Err(CoreError::invalid_database(
                    format!(
                        "table name count {} does not match table count {}",
                        names.len(),
                        tables.len()
                    ),
                    self.alloc.path(),
                ));
            }
            self.top = top;
            self.top_ref = top_ref;
            self.names = names;
            self.names_ref = names_ref;
            self.tables = tables;
            self.tables_ref = tables_ref;
            self.top_attached = true;
        } else if create_group_when_missing {
            self.create_empty_group()?;
        }

        self.attached = true;
        Ok(())
    }

    /// Structural validation of a top array.
    pub(crate) fn validate_top_array(
        top: &Array,
        alloc: &SlabAlloc,
        top_ref: u64,
    ) -> CoreResult<()> {
        let top_size = top.len();
        match top_size {
            3 | 5 | 7 | 9 | 10 => {
                let names_raw = top.get_raw(TOP_NAMES);
                let tables_raw = top.get_raw(TOP_TABLES);
                let logical_file_size = match top.get(TOP_LOGICAL_SIZE) {
                    RefOrTagged::Int(v) if v >= 0 => v as u64,
                    _ => {
                        return Err(CoreError::invalid_database(
                            format!("top array {top_ref} has no tagged logical file size"),
                            alloc.path(),
                        ))
                    }
                };

                // The logical file size must never exceed the physical one,
                // and the first two slots must be refs inside the logical
                // range.
                let file_size = alloc.baseline();
                if logical_file_size > file_size
                    || names_raw == 0
                    || names_raw > logical_file_size
                    || names_raw & 7 != 0
                    || tables_raw == 0
                    || tables_raw > logical_file_size
                    || tables_raw & 7 != 0
                {
                    return Err(CoreError::invalid_database(
                        format!(
                            "invalid top array (ref, [0], [1], [2]): {top_ref}, {names_raw}, \
                             {tables_raw}, {logical_file_size}"
                        ),
                        alloc.path(),
                    ));
                }
                Ok(())
            }
            _ => Err(CoreError::invalid_database(
                format!("invalid top array (ref: {top_ref}, size: {top_size})"),
                alloc.path(),
            )),
        }
    }

    fn create_empty_group(&mut self) -> CoreResult<()> {
        let names = StringArray::new();
        let names_ref = self.alloc.store_node(&names.encode(), 0)?;
        let tables = Array::new(true);
        let tables_ref = self.alloc.store_node(&tables.encode(), 0)?;

        let mut top = Array::new(true);
        top.push(RefOrTagged::Ref(names_ref));
        top.push(RefOrTagged::Ref(tables_ref));
        top.push(RefOrTagged::Int(FILE_HEADER_SIZE as i64));
        let top_ref = self.alloc.store_node(&top.encode(), 0)?;

        self.names = names;
        self.names_ref = names_ref;
        self.tables = tables;
        self.tables_ref = tables_ref;
        self.top = top;
        self.top_ref = top_ref;
        self.top_attached = true;
        Ok(())
    }

    /// Begins a shared-mode transaction on behalf of the shared-group
    /// collaborator.
    ///
    /// With `writable = false` and `new_top_ref == 0` the group attaches to
    /// an empty read-only view (array accessors stay detached); with
    /// `writable = true` an empty group is materialised so it is ready for
    /// mutation.
    pub fn attach_shared(
        &mut self,
        new_top_ref: u64,
        new_file_size: u64,
        writable: bool,
    ) -> CoreResult<()> {
        debug_assert!(new_top_ref < new_file_size);
        if self.attached {
            return Err(CoreError::wrong_group_state());
        }

        self.alloc.reset_free_space_tracking();
        self.alloc.update_reader_view(new_file_size)?;
        self.alloc.refresh_header_mirror()?;
        if self.alloc.committed_file_format() != 0 {
            self.file_format_version = self.alloc.committed_file_format();
        }

        self.is_shared = true;
        self.attach(new_top_ref, writable)?;
        self.load_free_list()?;
        Ok(())
    }

    /// Detaches from the current snapshot, dropping all table accessors.
    ///
    /// This is the only operation that is always legal, including after a
    /// post-mutation failure.
    pub fn detach(&mut self) {
        self.accessors.clear();
        self.soft_detach();
        self.attached = false;
        self.poisoned = false;
    }

    /// Detaches the group-level arrays but keeps table accessors alive, for
    /// reattachment to a newer snapshot.
    pub(crate) fn soft_detach(&mut self) {
        self.top = Array::new(true);
        self.names = StringArray::new();
        self.tables = Array::new(true);
        self.top_ref = 0;
        self.names_ref = 0;
        self.tables_ref = 0;
        self.top_attached = false;
    }

    /// Closes the group, releasing the file image.
    pub fn close(&mut self) {
        self.detach();
        self.alloc.detach();
    }

    /// Whether the group is attached to a snapshot.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Whether the group is owned by a shared-group collaborator.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.is_shared
    }

    /// The file format version of the attached snapshot.
    #[must_use]
    pub fn file_format_version(&self) -> u8 {
        self.file_format_version
    }

    pub(crate) fn set_file_format_version(&mut self, version: u8) {
        self.file_format_version = version;
    }

    /// The snapshot version number, or 0 when no versioning info is
    /// present. Versions 0 and 1 both mean "no versioning info".
    #[must_use]
    pub fn version(&self) -> u64 {
        if self.top_attached && self.top.len() > TOP_VERSION {
            match self.top.get(TOP_VERSION) {
                RefOrTagged::Int(v) if v > 0 => v as u64,
                _ => 0,
            }
        } else {
            0
        }
    }

    /// The kind of replication history attached to this snapshot.
    #[must_use]
    pub fn history_type(&self) -> HistoryType {
        if self.top_attached && self.top.len() > TOP_HISTORY_TYPE {
            HistoryType::from_code(self.top.get_int(TOP_HISTORY_TYPE))
                .unwrap_or(HistoryType::None)
        } else {
            HistoryType::None
        }
    }

    pub(crate) fn ensure_attached(&self) -> CoreResult<()> {
        if self.poisoned {
            Err(CoreError::wrong_group_state())
        } else if self.attached {
            Ok(())
        } else {
            Err(CoreError::detached_accessor())
        }
    }

    pub(crate) fn ensure_writable_top(&self) -> CoreResult<()> {
        self.ensure_attached()?;
        if self.top_attached {
            Ok(())
        } else {
            Err(CoreError::wrong_group_state())
        }
    }

    // ------------------------------------------------------------------
    // Table registry
    // ------------------------------------------------------------------

    /// Number of tables in the group.
    #[must_use]
    pub fn size(&self) -> usize {
        if self.top_attached {
            self.tables.len()
        } else {
            0
        }
    }

    /// Whether the group is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether a table with the given name exists.
    #[must_use]
    pub fn has_table(&self, name: &str) -> bool {
        self.top_attached && self.names.find_first(name).is_some()
    }

    /// Index of the table with the given name.
    #[must_use]
    pub fn find_table(&self, name: &str) -> Option<usize> {
        if self.top_attached {
            self.names.find_first(name)
        } else {
            None
        }
    }

    /// Name of the table at `ndx`.
    pub fn table_name(&self, ndx: usize) -> CoreResult<&str> {
        self.ensure_attached()?;
        if !self.top_attached || ndx >= self.names.len() {
            return Err(CoreError::table_index_out_of_range());
        }
        Ok(self.names.get(ndx))
    }

    /// Returns the table at `ndx`, materialising its accessor (and the
    /// accessors of every table reachable from it along links) on first
    /// access.
    pub fn get_table(&mut self, ndx: usize) -> CoreResult<Table<'_>> {
        self.ensure_attached()?;
        if !self.top_attached || ndx >= self.tables.len() {
            return Err(CoreError::table_index_out_of_range());
        }
        self.ensure_accessor(ndx)?;
        Ok(Table::new(self, ndx))
    }

    /// Returns the table with the given name, or `None`.
    pub fn get_table_by_name(&mut self, name: &str) -> CoreResult<Option<Table<'_>>> {
        self.ensure_attached()?;
        match self.find_table(name) {
            Some(ndx) => Ok(Some(self.get_table(ndx)?)),
            None => Ok(None),
        }
    }

    /// Returns the table with the given name, checking its payload columns
    /// against an expected schema.
    ///
    /// # Errors
    ///
    /// [`CoreError::NoSuchTable`] when the name is unknown,
    /// [`CoreError::DescriptorMismatch`] when the on-disk columns differ
    /// from `expected`.
    pub fn get_table_with_schema(
        &mut self,
        name: &str,
        expected: &[(&str, ColumnKind)],
    ) -> CoreResult<Table<'_>> {
        self.ensure_attached()?;
        let ndx = self.find_table(name).ok_or(CoreError::NoSuchTable)?;
        self.ensure_accessor(ndx)?;
        let acc = self.accessor(ndx);
        let payload: Vec<(&str, ColumnKind)> = acc
            .spec
            .cols
            .iter()
            .filter(|c| c.kind != ColumnKind::Backlink)
            .map(|c| (c.name.as_str(), c.kind))
            .collect();
        if payload != expected {
            return Err(CoreError::DescriptorMismatch);
        }
        Ok(Table::new(self, ndx))
    }

    /// Adds a table at the end of the registry.
    ///
    /// Returns the new table's index.
    pub fn add_table(&mut self, name: &str, require_unique_name: bool) -> CoreResult<usize> {
        self.insert_table(self.size(), name, require_unique_name)
    }

    /// Inserts a table at `ndx`, shifting all tables at and above `ndx` up
    /// by one and rewriting every link column's opposite-table index
    /// accordingly.
    pub fn insert_table(
        &mut self,
        ndx: usize,
        name: &str,
        require_unique_name: bool,
    ) -> CoreResult<usize> {
        self.ensure_writable_top()?;
        if require_unique_name && self.has_table(name) {
            return Err(CoreError::TableNameInUse);
        }
        if ndx > self.tables.len() {
            return Err(CoreError::table_index_out_of_range());
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(CoreError::table_name_too_long());
        }

        let table_ref = table::create_empty_table(&mut self.alloc)?;
        let prior_num_tables = self.tables.len();
        self.tables.insert(ndx, RefOrTagged::Ref(table_ref));
        self.names.insert(ndx, name);
        self.store_group_arrays()?;

        if !self.accessors.is_empty() {
            self.accessors.insert(ndx, None);
        }

        let ndx_u64 = ndx as u64;
        self.update_table_indices(|old| if old >= ndx_u64 { old + 1 } else { old })?;

        if let Some(repl) = self.replication.as_mut() {
            repl.push(Instruction::InsertGroupLevelTable {
                table_ndx: ndx_u64,
                prior_num_tables: prior_num_tables as u64,
                name: name.to_string(),
            });
        }
        Ok(ndx)
    }

    /// Returns the index of the named table, creating it when missing.
    ///
    /// The boolean is true when the table was created by this call.
    pub fn get_or_add_table(&mut self, name: &str) -> CoreResult<(usize, bool)> {
        self.ensure_attached()?;
        match self.find_table(name) {
            Some(ndx) => Ok((ndx, false)),
            None => {
                let ndx = self.add_table(name, false)?;
                Ok((ndx, true))
            }
        }
    }

    /// Removes the table at `ndx`.
    ///
    /// The table must not be the target of link columns of *other* tables;
    /// such a removal fails with [`CoreError::CrossTableLinkTarget`] and
    /// leaves the group unchanged. All columns are dropped from high to low
    /// first, so the emitted replication entries are sufficient for a peer
    /// to reconcile.
    pub fn remove_table(&mut self, ndx: usize) -> CoreResult<()> {
        self.ensure_writable_top()?;
        if ndx >= self.tables.len() {
            return Err(CoreError::table_index_out_of_range());
        }
        self.ensure_accessor(ndx)?;

        if self.is_cross_table_link_target(ndx) {
            return Err(CoreError::CrossTableLinkTarget);
        }

        // Drop columns high to low. Backlink columns always follow payload
        // columns, and with no foreign backlinks each one disappears along
        // with its own-table link column.
        let payload_cols = self.accessor(ndx).spec.payload_column_count();
        for col_ndx in (0..payload_cols).rev() {
            self.remove_column(ndx, col_ndx)?;
        }

        let prior_num_tables = self.tables.len();
        if let Some(repl) = self.replication.as_mut() {
            repl.push(Instruction::EraseGroupLevelTable {
                table_ndx: ndx as u64,
                prior_num_tables: prior_num_tables as u64,
            });
        }

        let table_ref = self.tables.get_ref(ndx);
        self.tables.erase(ndx);
        self.names.erase(ndx);
        self.store_group_arrays()?;
        if !self.accessors.is_empty() {
            self.accessors.remove(ndx);
        }

        let last_table_removed = ndx == self.tables.len();
        if !last_table_removed {
            let ndx_u64 = ndx as u64;
            self.update_table_indices(|old| {
                debug_assert_ne!(old, ndx_u64);
                if old > ndx_u64 {
                    old - 1
                } else {
                    old
                }
            })?;
        }

        self.alloc.destroy_deep(table_ref)?;
        Ok(())
    }

    /// Removes the table with the given name.
    pub fn remove_table_by_name(&mut self, name: &str) -> CoreResult<()> {
        self.ensure_attached()?;
        let ndx = self.find_table(name).ok_or(CoreError::NoSuchTable)?;
        self.remove_table(ndx)
    }

    /// Renames the table at `ndx`.
    ///
    /// With `require_unique_name` the rename fails with
    /// [`CoreError::TableNameInUse`] when another table already has the new
    /// name; without it duplicates are allowed (replication replay needs
    /// this).
    pub fn rename_table(
        &mut self,
        ndx: usize,
        new_name: &str,
        require_unique_name: bool,
    ) -> CoreResult<()> {
        self.ensure_writable_top()?;
        if ndx >= self.tables.len() {
            return Err(CoreError::table_index_out_of_range());
        }
        if new_name.len() > MAX_NAME_LENGTH {
            return Err(CoreError::table_name_too_long());
        }
        if require_unique_name && self.has_table(new_name) {
            return Err(CoreError::TableNameInUse);
        }

        self.names.set(ndx, new_name);
        self.store_group_arrays()?;

        if let Some(repl) = self.replication.as_mut() {
            repl.push(Instruction::RenameGroupLevelTable {
                table_ndx: ndx as u64,
                new_name: new_name.to_string(),
            });
        }
        Ok(())
    }

    /// Renames the table with the given name.
    pub fn rename_table_by_name(
        &mut self,
        name: &str,
        new_name: &str,
        require_unique_name: bool,
    ) -> CoreResult<()> {
        self.ensure_attached()?;
        let ndx = self.find_table(name).ok_or(CoreError::NoSuchTable)?;
        self.rename_table(ndx, new_name, require_unique_name)
    }

    // ------------------------------------------------------------------
    // Accessor cache
    // ------------------------------------------------------------------

    pub(crate) fn accessor(&self, ndx: usize) -> &TableAccessor {
        self.accessors[ndx]
            .as_ref()
            .expect("table accessor must be materialised before use")
    }

    pub(crate) fn accessor_mut(&mut self, ndx: usize) -> &mut TableAccessor {
        self.accessors[ndx]
            .as_mut()
            .expect("table accessor must be materialised before use")
    }

    pub(crate) fn ensure_accessor(&mut self, ndx: usize) -> CoreResult<()> {
        if self.accessors.is_empty() {
            self.accessors = (0..self.tables.len()).map(|_| None).collect();
        }
        debug_assert_eq!(self.accessors.len(), self.tables.len());
        if self.accessors[ndx].is_none() {
            self.create_table_accessor(ndx)?;
        }
        Ok(())
    }

    /// Materialises the accessor for table `ndx` and, transitively, for
    /// every table reachable from it along link or backlink columns.
    ///
    /// The link graph may contain cycles, so construction runs in four
    /// steps: register an incomplete accessor, mark it, complete it (which
    /// may recursively request other accessors - the early registration
    /// breaks the cycle), then unmark it.
    fn create_table_accessor(&mut self, ndx: usize) -> CoreResult<()> {
        let root_ref = self.tables.get_ref(ndx);
        self.accessors[ndx] = Some(TableAccessor::incomplete(root_ref));

        let parts = table::load_table_parts(&self.alloc, root_ref)?;
        let opposite_tables: Vec<u64> = parts
            .spec
            .cols
            .iter()
            .filter(|c| c.kind.is_link() || c.kind == ColumnKind::Backlink)
            .map(|c| c.opposite_table)
            .collect();
        {
            let acc = self.accessor_mut(ndx);
            acc.assign_parts(parts);
        }

        for target in opposite_tables {
            let target = target as usize;
            if target < self.accessors.len() && self.accessors[target].is_none() {
                self.create_table_accessor(target)?;
            }
        }

        let acc = self.accessor_mut(ndx);
        acc.complete = true;
        acc.mark = false;
        Ok(())
    }

    /// Reloads a cached accessor from the attached snapshot.
    pub(crate) fn reload_accessor(&mut self, ndx: usize) -> CoreResult<()> {
        let root_ref = self.tables.get_ref(ndx);
        let parts = table::load_table_parts(&self.alloc, root_ref)?;
        let acc = self.accessor_mut(ndx);
        acc.root_ref = root_ref;
        acc.assign_parts(parts);
        acc.complete = true;
        acc.mark = false;
        Ok(())
    }

    /// Reloads every marked accessor.
    pub(crate) fn refresh_dirty_accessors(&mut self) -> CoreResult<()> {
        for ndx in 0..self.accessors.len() {
            if self.accessors[ndx].as_ref().is_some_and(|a| a.mark) {
                self.reload_accessor(ndx)?;
            }
        }
        Ok(())
    }

    /// Marks the accessors of every table on the opposite side of `ndx`'s
    /// link and backlink columns.
    pub(crate) fn mark_opposite_link_tables(&mut self, ndx: usize) {
        let Some(acc) = self.accessors.get(ndx).and_then(|a| a.as_ref()) else {
            return;
        };
        let targets: Vec<usize> = acc
            .spec
            .cols
            .iter()
            .filter(|c| c.kind.is_link() || c.kind == ColumnKind::Backlink)
            .map(|c| c.opposite_table as usize)
            .collect();
        for target in targets {
            if let Some(Some(t)) = self.accessors.get_mut(target) {
                t.mark = true;
            }
        }
    }

    /// Whether the table at `ndx` is the target of link columns of another
    /// table. Requires a materialised accessor.
    pub(crate) fn is_cross_table_link_target(&self, ndx: usize) -> bool {
        self.accessor(ndx)
            .spec
            .cols
            .iter()
            .any(|c| c.kind == ColumnKind::Backlink && c.opposite_table as usize != ndx)
    }

    /// Rewrites every link and backlink column's opposite-table index
    /// through `map`, across all tables, then refreshes marked accessors.
    pub(crate) fn update_table_indices(&mut self, map: impl Fn(u64) -> u64) -> CoreResult<()> {
        self.map_specs(|_, spec| {
            let mut changed = false;
            for col in &mut spec.cols {
                if col.kind.is_link() || col.kind == ColumnKind::Backlink {
                    let new_ndx = map(col.opposite_table);
                    if new_ndx != col.opposite_table {
                        col.opposite_table = new_ndx;
                        changed = true;
                    }
                }
            }
            changed
        })
    }

    /// Persists the cached spec of table `ndx` and rewires the tree above
    /// it.
    pub(crate) fn persist_spec(&mut self, ndx: usize) -> CoreResult<()> {
        let (spec_encoded_ref, root_ref) = {
            let acc = self.accessor(ndx);
            (acc.spec_ref, acc.root_ref)
        };
        let spec = self.accessor(ndx).spec.clone();
        let new_spec_ref = spec.store(&mut self.alloc, spec_encoded_ref)?;
        let new_root = self.persist_table_root(ndx, root_ref, Some(new_spec_ref), None)?;
        let acc = self.accessor_mut(ndx);
        acc.spec_ref = new_spec_ref;
        acc.root_ref = new_root;
        Ok(())
    }

    /// Rewrites table `ndx`'s top node with a new spec and/or columns ref,
    /// then stores the group-level arrays. Returns the table's new root.
    pub(crate) fn persist_table_root(
        &mut self,
        ndx: usize,
        root_ref: u64,
        new_spec_ref: Option<u64>,
        new_columns_ref: Option<u64>,
    ) -> CoreResult<u64> {
        let mut table_top = Array::decode(self.alloc.node_bytes(root_ref)?)?;
        if let Some(spec_ref) = new_spec_ref {
            table_top.set(table::TABLE_TOP_SPEC, RefOrTagged::Ref(spec_ref));
        }
        if let Some(columns_ref) = new_columns_ref {
            table_top.set(table::TABLE_TOP_COLUMNS, RefOrTagged::Ref(columns_ref));
        }
        let new_root = self.alloc.store_node(&table_top.encode(), root_ref)?;
        self.tables.set(ndx, RefOrTagged::Ref(new_root));
        self.store_group_arrays()?;
        Ok(new_root)
    }

    /// Stores the group-level arrays copy-on-write, rewiring the top array.
    pub(crate) fn store_group_arrays(&mut self) -> CoreResult<()> {
        let encoded = self.names.encode();
        let names_ref = self.alloc.store_node(&encoded, self.names_ref)?;
        if names_ref != self.names_ref {
            self.names_ref = names_ref;
            self.top.set(TOP_NAMES, RefOrTagged::Ref(names_ref));
        }

        let encoded = self.tables.encode();
        let tables_ref = self.alloc.store_node(&encoded, self.tables_ref)?;
        if tables_ref != self.tables_ref {
            self.tables_ref = tables_ref;
            self.top.set(TOP_TABLES, RefOrTagged::Ref(tables_ref));
        }

        let encoded = self.top.encode();
        self.top_ref = self.alloc.store_node(&encoded, self.top_ref)?;
        Ok(())
    }

    pub(crate) fn load_free_list(&mut self) -> CoreResult<()> {
        let mut chunks = Vec::new();
        if self.top_attached && self.top.len() > TOP_FREE_LENGTHS {
            let positions_ref = self.top.get_ref(TOP_FREE_POSITIONS);
            let lengths_ref = self.top.get_ref(TOP_FREE_LENGTHS);
            if positions_ref != 0 && lengths_ref != 0 {
                let positions = Array::decode(self.alloc.node_bytes(positions_ref)?)?;
                let lengths = Array::decode(self.alloc.node_bytes(lengths_ref)?)?;
                let versions = if self.top.len() > TOP_FREE_VERSIONS {
                    let versions_ref = self.top.get_ref(TOP_FREE_VERSIONS);
                    if versions_ref != 0 {
                        Some(Array::decode(self.alloc.node_bytes(versions_ref)?)?)
                    } else {
                        None
                    }
                } else {
                    None
                };
                if positions.len() != lengths.len()
                    || versions.as_ref().is_some_and(|v| v.len() != positions.len())
                {
                    return Err(CoreError::invalid_database(
                        "free-list arrays have mismatched lengths",
                        self.alloc.path(),
                    ));
                }
                for i in 0..positions.len() {
                    chunks.push(Chunk {
                        pos: positions.get_int(i) as u64,
                        len: lengths.get_int(i) as u64,
                        version: versions.as_ref().map_or(0, |v| v.get_int(i) as u64),
                    });
                }
            }
        }
        self.alloc.set_file_free(chunks);
        Ok(())
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Grows the top array so it can carry a replication history, padding
    /// absent free-list and version slots with zeros.
    pub fn prepare_history_slots(
        &mut self,
        history_type: HistoryType,
        history_schema_version: i64,
    ) -> CoreResult<()> {
        self.ensure_writable_top()?;
        debug_assert!(self.file_format_version >= 7);

        if self.top.len() < 10 {
            debug_assert!(self.top.len() <= 7);
            while self.top.len() < 7 {
                self.top.push(RefOrTagged::Ref(0));
            }
            self.top.push(RefOrTagged::Int(history_type.to_code()));
            self.top.push(RefOrTagged::Ref(0));
            self.top.push(RefOrTagged::Int(history_schema_version));
        } else {
            let stored = HistoryType::from_code(self.top.get_int(TOP_HISTORY_TYPE));
            if let Some(stored) = stored {
                debug_assert!(
                    stored == HistoryType::None || stored == history_type,
                    "history type cannot change once set"
                );
            }
            self.top
                .set(TOP_HISTORY_TYPE, RefOrTagged::Int(history_type.to_code()));
            self.top.set(
                TOP_HISTORY_SCHEMA_VERSION,
                RefOrTagged::Int(history_schema_version),
            );
        }
        self.store_group_arrays()
    }

    /// Installs a new history root (owned by the replication collaborator).
    pub fn set_history_ref(&mut self, history_ref: u64) -> CoreResult<()> {
        self.ensure_writable_top()?;
        if self.top.len() <= TOP_HISTORY_REF {
            return Err(CoreError::wrong_group_state());
        }
        self.top.set(TOP_HISTORY_REF, RefOrTagged::Ref(history_ref));
        self.store_group_arrays()
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Installs a transaction log builder; subsequent mutations record
    /// replication instructions into it.
    pub fn set_replication(&mut self, builder: TransactLogBuilder) {
        self.replication = Some(builder);
    }

    /// The installed transaction log builder, if any.
    pub fn replication_mut(&mut self) -> Option<&mut TransactLogBuilder> {
        self.replication.as_mut()
    }

    /// Removes and returns the installed transaction log builder.
    pub fn take_replication(&mut self) -> Option<TransactLogBuilder> {
        self.replication.take()
    }

    /// Installs a hook invoked after a transaction advance that changed the
    /// schema.
    pub fn set_schema_change_handler(&mut self, handler: impl FnMut() + 'static) {
        self.schema_change_handler = Some(Box::new(handler));
    }

    // ------------------------------------------------------------------
    // Sizes
    // ------------------------------------------------------------------

    /// Total encoded size of the selected parts of the snapshot.
    pub fn aggregated_byte_size(&self, agg: SizeAggregate) -> CoreResult<u64> {
        if !self.top_attached {
            return Ok(0);
        }
        let mut used = 0;
        if agg.state {
            used += self.alloc.deep_byte_size(self.names_ref)?;
            used += self.alloc.deep_byte_size(self.tables_ref)?;
            used += self.top.byte_size() as u64;
            used += FILE_HEADER_SIZE as u64;
        }
        if agg.freelists && self.top.len() > TOP_FREE_VERSIONS {
            used += self.alloc.deep_byte_size(self.top.get_ref(TOP_FREE_POSITIONS))?;
            used += self.alloc.deep_byte_size(self.top.get_ref(TOP_FREE_LENGTHS))?;
            used += self.alloc.deep_byte_size(self.top.get_ref(TOP_FREE_VERSIONS))?;
        }
        if agg.history && self.top.len() > TOP_HISTORY_SCHEMA_VERSION {
            used += self.alloc.deep_byte_size(self.top.get_ref(TOP_HISTORY_REF))?;
        }
        Ok(used)
    }

    /// Logical file size minus free-list space: the bytes the snapshot
    /// actually occupies.
    pub fn used_space(&self) -> CoreResult<u64> {
        if !self.top_attached {
            return Ok(0);
        }
        let logical = self.top.get_int(TOP_LOGICAL_SIZE) as u64;
        let mut free = 0u64;
        if self.top.len() > TOP_FREE_LENGTHS {
            let lengths_ref = self.top.get_ref(TOP_FREE_LENGTHS);
            if lengths_ref != 0 {
                let lengths = Array::decode(self.alloc.node_bytes(lengths_ref)?)?;
                for i in 0..lengths.len() {
                    free += lengths.get_int(i) as u64;
                }
            }
        }
        Ok(logical - free)
    }
}

impl PartialEq for Group {
    /// Element-wise comparison of table names and table contents in index
    /// order. Unreadable snapshots compare unequal.
    fn eq(&self, other: &Self) -> bool {
        let n = self.size();
        if n != other.size() {
            return false;
        }
        for i in 0..n {
            if self.names.get(i) != other.names.get(i) {
                return false;
            }
            let eq = table::table_trees_equal(
                &self.alloc,
                self.tables.get_ref(i),
                &other.alloc,
                other.tables.get_ref(i),
            );
            if !matches!(eq, Ok(true)) {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("attached", &self.attached)
            .field("tables", &self.size())
            .field("file_format_version", &self.file_format_version)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LogicErrorKind;

    fn group_with_tables(names: &[&str]) -> Group {
        let mut group = Group::new().unwrap();
        for name in names {
            group.add_table(name, true).unwrap();
        }
        group
    }

    #[test]
    fn new_group_is_empty() {
        let group = Group::new().unwrap();
        assert!(group.is_attached());
        assert_eq!(group.size(), 0);
        assert!(group.is_empty());
    }

    #[test]
    fn add_tables_in_order() {
        // Scenario: empty group, add A, B, C.
        let mut group = group_with_tables(&["A", "B", "C"]);
        assert_eq!(group.size(), 3);
        assert_eq!(group.table_name(0).unwrap(), "A");
        assert_eq!(group.table_name(1).unwrap(), "B");
        assert_eq!(group.table_name(2).unwrap(), "C");

        let table = group.get_table_by_name("B").unwrap().unwrap();
        assert_eq!(table.index(), 1);
    }

    #[test]
    fn names_and_tables_stay_parallel() {
        let mut group = group_with_tables(&["A", "B"]);
        assert_eq!(group.names.len(), group.tables.len());
        group.remove_table(0).unwrap();
        assert_eq!(group.names.len(), group.tables.len());
        group.insert_table(0, "C", true).unwrap();
        assert_eq!(group.names.len(), group.tables.len());
    }

    #[test]
    fn duplicate_name_rejected_when_unique_required() {
        let mut group = group_with_tables(&["A"]);
        assert!(matches!(
            group.add_table("A", true),
            Err(CoreError::TableNameInUse)
        ));
        // Replication replay is allowed to create duplicates.
        group.add_table("A", false).unwrap();
        assert_eq!(group.size(), 2);
    }

    #[test]
    fn name_length_boundary() {
        let mut group = Group::new().unwrap();
        let ok = "x".repeat(63);
        let too_long = "x".repeat(64);
        group.add_table(&ok, true).unwrap();
        assert!(matches!(
            group.add_table(&too_long, true),
            Err(CoreError::Logic(LogicErrorKind::TableNameTooLong))
        ));
        assert_eq!(group.size(), 1);
    }

    #[test]
    fn insert_past_end_rejected() {
        let mut group = group_with_tables(&["A"]);
        assert!(matches!(
            group.insert_table(2, "B", true),
            Err(CoreError::Logic(LogicErrorKind::TableIndexOutOfRange))
        ));
    }

    #[test]
    fn remove_missing_table_fails() {
        let mut group = group_with_tables(&["A"]);
        assert!(matches!(
            group.remove_table_by_name("B"),
            Err(CoreError::NoSuchTable)
        ));
        assert!(matches!(
            group.remove_table(5),
            Err(CoreError::Logic(LogicErrorKind::TableIndexOutOfRange))
        ));
    }

    #[test]
    fn insert_then_remove_preserves_indices() {
        let mut group = group_with_tables(&["A", "B", "C"]);
        group.insert_table(1, "X", true).unwrap();
        assert_eq!(group.table_name(1).unwrap(), "X");
        assert_eq!(group.table_name(2).unwrap(), "B");
        group.remove_table(1).unwrap();
        assert_eq!(group.table_name(0).unwrap(), "A");
        assert_eq!(group.table_name(1).unwrap(), "B");
        assert_eq!(group.table_name(2).unwrap(), "C");
    }

    #[test]
    fn rename_table_checks_uniqueness() {
        let mut group = group_with_tables(&["A", "B"]);
        assert!(matches!(
            group.rename_table_by_name("A", "B", true),
            Err(CoreError::TableNameInUse)
        ));
        group.rename_table_by_name("A", "B", false).unwrap();
        assert_eq!(group.table_name(0).unwrap(), "B");
        assert_eq!(group.table_name(1).unwrap(), "B");
    }

    #[test]
    fn get_or_add_table_reports_creation() {
        let mut group = Group::new().unwrap();
        let (ndx, added) = group.get_or_add_table("T").unwrap();
        assert_eq!((ndx, added), (0, true));
        let (ndx, added) = group.get_or_add_table("T").unwrap();
        assert_eq!((ndx, added), (0, false));
    }

    #[test]
    fn accessor_cache_tracks_registry() {
        let mut group = group_with_tables(&["A", "B", "C"]);
        // Materialise one accessor; the cache must be parallel from then on.
        group.get_table(1).unwrap();
        assert_eq!(group.accessors.len(), 3);
        group.insert_table(0, "X", true).unwrap();
        assert_eq!(group.accessors.len(), 4);
        group.remove_table(0).unwrap();
        assert_eq!(group.accessors.len(), 3);
    }

    #[test]
    fn validate_top_array_rejects_bad_sizes() {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();
        for size in [0usize, 1, 2, 4, 6, 8, 11] {
            let mut top = Array::new(true);
            for _ in 0..size {
                top.push(RefOrTagged::Ref(0));
            }
            let result = Group::validate_top_array(&top, &alloc, 24);
            assert!(
                matches!(result, Err(CoreError::InvalidDatabase { .. })),
                "top array of size {size} must be rejected"
            );
        }
    }

    #[test]
    fn validate_top_array_rejects_bad_refs() {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        // Zero names-ref
        let mut top = Array::new(true);
        top.push(RefOrTagged::Ref(0));
        top.push(RefOrTagged::Ref(8));
        top.push(RefOrTagged::Int(24));
        assert!(Group::validate_top_array(&top, &alloc, 24).is_err());

        // Logical size beyond the baseline
        let mut top = Array::new(true);
        top.push(RefOrTagged::Ref(8));
        top.push(RefOrTagged::Ref(16));
        top.push(RefOrTagged::Int(1 << 40));
        assert!(Group::validate_top_array(&top, &alloc, 24).is_err());

        // Ref past the logical file size
        let mut top = Array::new(true);
        top.push(RefOrTagged::Ref(8));
        top.push(RefOrTagged::Ref(2048));
        top.push(RefOrTagged::Int(24));
        assert!(Group::validate_top_array(&top, &alloc, 24).is_err());
    }

    #[test]
    fn detach_then_use_fails() {
        let mut group = group_with_tables(&["A"]);
        group.detach();
        assert!(!group.is_attached());
        assert!(matches!(
            group.add_table("B", true),
            Err(CoreError::Logic(LogicErrorKind::DetachedAccessor))
        ));
    }

    #[test]
    fn groups_compare_by_names_and_content() {
        let a = group_with_tables(&["A", "B"]);
        let b = group_with_tables(&["A", "B"]);
        let c = group_with_tables(&["A", "C"]);
        assert!(a == b);
        assert!(a != c);

        let d = group_with_tables(&["A"]);
        assert!(a != d);
    }

    #[test]
    fn replication_records_registry_mutations() {
        let mut group = Group::new().unwrap();
        group.set_replication(TransactLogBuilder::new());
        group.add_table("A", true).unwrap();
        group.rename_table(0, "B", true).unwrap();
        group.remove_table(0).unwrap();

        let log = group.take_replication().unwrap();
        let instrs = log.instructions();
        assert!(matches!(
            instrs[0],
            Instruction::InsertGroupLevelTable { table_ndx: 0, prior_num_tables: 0, .. }
        ));
        assert!(matches!(
            instrs[1],
            Instruction::RenameGroupLevelTable { table_ndx: 0, .. }
        ));
        assert!(matches!(
            instrs[2],
            Instruction::EraseGroupLevelTable { table_ndx: 0, prior_num_tables: 1 }
        ));
    }

    #[test]
    fn aggregated_byte_size_counts_state() {
        let group = group_with_tables(&["A"]);
        let state = group.aggregated_byte_size(SizeAggregate::state()).unwrap();
        assert!(state > FILE_HEADER_SIZE as u64);
        let all = group.aggregated_byte_size(SizeAggregate::all()).unwrap();
        assert!(all >= state);
    }
}
