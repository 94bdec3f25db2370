//! Snapshot write-out and the durable in-file commit.
//!
//! Two write paths share the tree-copy machinery:
//!
//! - [`Group::write_to`] streams a complete, self-contained image: header,
//!   all array nodes, the top array, optional encryption padding, and the
//!   streaming footer carrying the authoritative top-ref.
//! - [`Group::commit`] places the arrays mutated since the last commit into
//!   free space of the open file (never overwriting anything the previous
//!   snapshot can reach), appends a new free list and top array, then
//!   publishes by flipping the header's root selector.
//!
//! Output is deterministic: the same logical snapshot written with the same
//! version number produces identical bytes.

use std::io::Write;

use cofferdb_storage::{EncryptedBackend, EncryptionKey, FileBackend, StorageBackend};
use tracing::debug;

use crate::alloc::{encode_footer, Chunk, FileHeader, FILE_FOOTER_SIZE, FILE_HEADER_SIZE};
use crate::array::{Array, RefOrTagged, KIND_INTS};
use crate::error::{CoreError, CoreResult};
use crate::group::{
    Group, HistoryType, TOP_FREE_LENGTHS, TOP_FREE_POSITIONS, TOP_FREE_VERSIONS, TOP_HISTORY_REF,
    TOP_HISTORY_SCHEMA_VERSION, TOP_HISTORY_TYPE, TOP_LOGICAL_SIZE, TOP_NAMES, TOP_TABLES,
    TOP_VERSION,
};
use crate::upgrade::target_file_format_for_session;

/// Page size used when padding output for encryption.
const PAGE_SIZE: u64 = 4096;

/// Sequential sink for the streaming write path.
struct StreamSink<'a> {
    out: &'a mut dyn Write,
    pos: u64,
}

impl<'a> StreamSink<'a> {
    fn new(out: &'a mut dyn Write) -> Self {
        Self { out, pos: 0 }
    }

    fn write_raw(&mut self, bytes: &[u8]) -> CoreResult<()> {
        self.out.write_all(bytes)?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    /// Places one node, returning its ref in the produced image.
    fn place(&mut self, bytes: &[u8]) -> CoreResult<u64> {
        debug_assert_eq!(self.pos % 8, 0);
        let ref_ = self.pos;
        self.write_raw(bytes)?;
        Ok(ref_)
    }
}

/// Recursively copies the subtree at `ref_` into the stream, rewriting
/// child refs to their destination offsets. Returns the subtree's new ref.
fn stream_tree(group: &Group, ref_: u64, sink: &mut StreamSink<'_>) -> CoreResult<u64> {
    if ref_ == 0 {
        return Ok(0);
    }
    let bytes = group.alloc.node_bytes(ref_)?.to_vec();
    let has_refs = bytes[1] & 1 != 0;
    if bytes[0] == KIND_INTS && has_refs {
        let mut arr = Array::decode(&bytes)?;
        for i in 0..arr.len() {
            let raw = arr.get_raw(i);
            if raw != 0 && raw & 1 == 0 {
                let new_child = stream_tree(group, raw, sink)?;
                arr.set(i, RefOrTagged::Ref(new_child));
            }
        }
        sink.place(&arr.encode())
    } else {
        sink.place(&bytes)
    }
}

impl Group {
    /// Writes a complete snapshot image to `out`.
    ///
    /// With a non-zero `version_number` the image carries versioning info
    /// and an (empty) free list; this is how a shared database is compacted
    /// into a fresh file. Only sync-type histories are preserved; other
    /// history kinds are dropped. With `pad_for_encryption` the payload is
    /// padded so the footer lands on a page boundary.
    pub fn write_to(
        &self,
        out: &mut dyn Write,
        version_number: u64,
        pad_for_encryption: bool,
    ) -> CoreResult<()> {
        self.ensure_attached()?;

        let no_top_array = !self.top_attached;
        let file_format = if no_top_array {
            0
        } else if self.file_format_version == 0 {
            target_file_format_for_session(0, HistoryType::None)
        } else {
            self.file_format_version
        };

        let mut sink = StreamSink::new(out);
        sink.write_raw(&FileHeader::new_streaming(file_format).encode())?;

        let mut top_ref = 0;
        let mut final_file_size = FILE_HEADER_SIZE as u64;
        if no_top_array {
            // Version 1 also denotes the empty initial state of a file.
            debug_assert!(version_number <= 1);
        } else {
            // The top array records the total logical file size, so
            // everything else is written first and the top array is
            // finalised against its own projected position.
            let names_ref = stream_tree(self, self.names_ref, &mut sink)?;
            let tables_ref = stream_tree(self, self.tables_ref, &mut sink)?;

            let mut history: Option<(i64, u64, i64)> = None;
            if self.top.len() > TOP_HISTORY_SCHEMA_VERSION {
                let history_type = HistoryType::from_code(self.top.get_int(TOP_HISTORY_TYPE))
                    .unwrap_or(HistoryType::None);
                let history_root = self.top.get_ref(TOP_HISTORY_REF);
                // Only sync histories survive a rewrite to a fresh file.
                if history_type.preserved_on_write() && history_root != 0 {
                    let new_root = stream_tree(self, history_root, &mut sink)?;
                    history = Some((
                        history_type.to_code(),
                        new_root,
                        self.top.get_int(TOP_HISTORY_SCHEMA_VERSION),
                    ));
                }
            }

            let mut top = Array::new(true);
            top.push(RefOrTagged::Ref(names_ref));
            top.push(RefOrTagged::Ref(tables_ref));
            top.push(RefOrTagged::Int(0));
            if version_number != 0 {
                // The produced file has no free space; the free list is
                // three empty placeholder arrays.
                let empty = Array::new(false).encode();
                let positions_ref = sink.place(&empty)?;
                let lengths_ref = sink.place(&empty)?;
                let versions_ref = sink.place(&empty)?;
                top.push(RefOrTagged::Ref(positions_ref));
                top.push(RefOrTagged::Ref(lengths_ref));
                top.push(RefOrTagged::Ref(versions_ref));
                top.push(RefOrTagged::Int(version_number as i64));

                if let Some((type_code, root, schema_version)) = history {
                    top.push(RefOrTagged::Int(type_code));
                    top.push(RefOrTagged::Ref(root));
                    top.push(RefOrTagged::Int(schema_version));
                }
            }

            top_ref = sink.pos;

            // Two-pass rule: widen the representation for the projected
            // maximum final size first, then patch the real size in without
            // perturbing the byte size.
            let max_final_file_size = top_ref + Array::max_byte_size(top.len()) as u64;
            top.ensure_minimum_width(RefOrTagged::Int(max_final_file_size as i64));
            final_file_size = top_ref + top.byte_size() as u64;
            top.set(TOP_LOGICAL_SIZE, RefOrTagged::Int(final_file_size as i64));

            let placed = sink.place(&top.encode())?;
            debug_assert_eq!(placed, top_ref);
            debug_assert_eq!(sink.pos, final_file_size);
        }

        // Encryption works in whole pages; keep the footer at the end of
        // one.
        if pad_for_encryption {
            let unrounded = final_file_size + FILE_FOOTER_SIZE as u64;
            let rounded = unrounded.div_ceil(PAGE_SIZE) * PAGE_SIZE;
            if rounded != unrounded {
                sink.write_raw(&vec![0u8; (rounded - unrounded) as usize])?;
            }
        }

        sink.write_raw(&encode_footer(top_ref))?;
        Ok(())
    }

    /// Writes a complete snapshot image into a fresh byte buffer.
    pub fn write_to_mem(&self) -> CoreResult<Vec<u8>> {
        self.write_to_mem_versioned(0)
    }

    /// Like [`Group::write_to_mem`], with versioning info.
    pub fn write_to_mem_versioned(&self, version_number: u64) -> CoreResult<Vec<u8>> {
        let mut buffer = Vec::new();
        self.write_to(&mut buffer, version_number, false)?;
        Ok(buffer)
    }

    /// Writes a complete snapshot image to a new file.
    ///
    /// The file must not already exist. With a key the image is written
    /// through an encrypting backend and padded to page granularity.
    pub fn write_to_file(
        &self,
        path: &std::path::Path,
        key: Option<&EncryptionKey>,
        version_number: u64,
    ) -> CoreResult<()> {
        let bytes = {
            let mut buffer = Vec::new();
            self.write_to(&mut buffer, version_number, key.is_some())?;
            buffer
        };
        let file = FileBackend::create_new(path)?;
        let mut backend: Box<dyn StorageBackend> = match key {
            Some(key) => Box::new(EncryptedBackend::new(Box::new(file), key)?),
            None => Box::new(file),
        };
        backend.append(&bytes)?;
        backend.sync()?;
        Ok(())
    }

    /// Durably commits the current state into the open file.
    ///
    /// Legal only for unshared groups. New and changed arrays are placed
    /// into free space (live data of the previous snapshot is never
    /// overwritten), then the new root is published atomically. On return
    /// all live table accessors address the new snapshot.
    pub fn commit(&mut self) -> CoreResult<()> {
        self.ensure_attached()?;
        if self.is_shared {
            return Err(CoreError::wrong_group_state());
        }
        if !self.alloc.has_backend() {
            return Err(CoreError::wrong_group_state());
        }
        debug_assert!(self.top_attached);

        let old_baseline = self.alloc.baseline();

        let (top_ref, new_file_size, new_free) = {
            let mut writer = GroupWriter::new(self)?;
            let top_ref = writer.write_group()?;
            (top_ref, writer.file_size(), writer.take_new_free())
        };

        // Everything the new snapshot needs is in the file now; slab memory
        // becomes plain free space again.
        self.alloc.reset_free_space_tracking();
        self.alloc.update_reader_view(new_file_size)?;

        // The moment the snapshot becomes the file's authoritative root.
        self.alloc.publish_top_ref(top_ref, self.file_format_version)?;
        self.alloc.set_file_free(new_free);
        self.alloc.clear_pending_free();

        let refreshed = self.update_refs(top_ref, old_baseline);
        if refreshed.is_err() {
            self.poisoned = true;
        }
        debug!(top_ref, new_file_size, "committed snapshot");
        refreshed
    }

    /// Rebinds the group-level arrays and all live accessors after a
    /// commit moved them into the file.
    ///
    /// Nodes of the previous snapshot are never overwritten by a commit,
    /// so an accessor whose root ref is unchanged and below the old
    /// baseline is known invariant and skipped.
    pub(crate) fn update_refs(&mut self, top_ref: u64, old_baseline: u64) -> CoreResult<()> {
        if top_ref < old_baseline && self.top_ref == top_ref {
            return Ok(());
        }

        let top = Array::decode(self.alloc.node_bytes(top_ref)?)?;
        self.top_ref = top_ref;
        self.names_ref = top.get_ref(TOP_NAMES);
        self.tables_ref = top.get_ref(TOP_TABLES);
        self.names =
            crate::array::StringArray::decode(self.alloc.node_bytes(self.names_ref)?)?;
        self.tables = Array::decode(self.alloc.node_bytes(self.tables_ref)?)?;
        self.top = top;

        for ndx in 0..self.accessors.len() {
            let Some(acc) = self.accessors[ndx].as_ref() else {
                continue;
            };
            let new_root = self.tables.get_ref(ndx);
            if new_root == acc.root_ref && new_root < old_baseline {
                continue;
            }
            self.reload_accessor(ndx)?;
        }
        Ok(())
    }
}

/// Places a transaction's worth of new arrays into the open file.
///
/// Allocation policy: data nodes go into the previous snapshot's free list
/// first-fit, falling back to extending the file; the new free-list arrays
/// and the top array are always appended, which sidesteps the
/// free-list-allocating-itself knot.
pub(crate) struct GroupWriter<'g> {
    group: &'g mut Group,
    /// Allocatable ranges: the previous snapshot's persisted free list.
    pool: Vec<Chunk>,
    /// Append cursor; equals the backend size at all times.
    logical_end: u64,
    final_file_size: u64,
    new_version: u64,
    /// The free list the new snapshot will carry.
    new_free: Vec<Chunk>,
}

impl<'g> GroupWriter<'g> {
    pub(crate) fn new(group: &'g mut Group) -> CoreResult<Self> {
        let pool = group.alloc.file_free().to_vec();
        let logical_end = group.alloc.backend_mut()?.size()?;
        debug_assert_eq!(logical_end % 8, 0);
        let new_version = group.version().max(1) + 1;
        Ok(Self {
            group,
            pool,
            logical_end,
            final_file_size: 0,
            new_version,
            new_free: Vec::new(),
        })
    }

    /// Total physical file size after the write-out.
    pub(crate) fn file_size(&self) -> u64 {
        self.final_file_size
    }

    pub(crate) fn take_new_free(&mut self) -> Vec<Chunk> {
        std::mem::take(&mut self.new_free)
    }

    /// Writes all changed arrays plus a new free list and top array.
    /// Returns the new top-ref; the caller publishes it.
    pub(crate) fn write_group(&mut self) -> CoreResult<u64> {
        // Data trees first: only nodes living in slabs move, nodes of the
        // previous snapshot stay where they are.
        let names_ref = self.write_tree(self.group.names_ref)?;
        let tables_ref = self.write_tree(self.group.tables_ref)?;
        let history_ref = if self.group.top.len() > TOP_HISTORY_REF {
            self.write_tree(self.group.top.get_ref(TOP_HISTORY_REF))?
        } else {
            0
        };

        // Assemble the new free list: what is left of the old one, plus
        // every range released by copy-on-write this transaction, plus the
        // nodes of the old top and old free list (garbage once the new
        // root is published).
        let mut free = self.pool.clone();
        for chunk in self.group.alloc.pending_free() {
            free.push(Chunk {
                version: self.new_version,
                ..*chunk
            });
        }
        let old_top_ref = self.group.top_ref;
        if !self.group.alloc.is_slab_ref(old_top_ref) {
            free.push(self.file_chunk(old_top_ref)?);
        }
        if self.group.top.len() > TOP_FREE_VERSIONS {
            for slot in [TOP_FREE_POSITIONS, TOP_FREE_LENGTHS, TOP_FREE_VERSIONS] {
                let ref_ = self.group.top.get_ref(slot);
                if ref_ != 0 && !self.group.alloc.is_slab_ref(ref_) {
                    free.push(self.file_chunk(ref_)?);
                }
            }
        }
        free.sort_by_key(|c| c.pos);
        let free = merge_chunks(free);

        let mut positions = Array::new(false);
        let mut lengths = Array::new(false);
        let mut versions = Array::new(false);
        for chunk in &free {
            positions.push(RefOrTagged::Int(chunk.pos as i64));
            lengths.push(RefOrTagged::Int(chunk.len as i64));
            versions.push(RefOrTagged::Int(chunk.version as i64));
        }
        let positions_ref = self.append_node(&positions.encode())?;
        let lengths_ref = self.append_node(&lengths.encode())?;
        let versions_ref = self.append_node(&versions.encode())?;

        // The new top: same shape as the old one, grown to at least the
        // seven versioned slots.
        let mut top = self.group.top.clone();
        top.set(TOP_NAMES, RefOrTagged::Ref(names_ref));
        top.set(TOP_TABLES, RefOrTagged::Ref(tables_ref));
        while top.len() <= TOP_VERSION {
            top.push(RefOrTagged::Ref(0));
        }
        top.set(TOP_FREE_POSITIONS, RefOrTagged::Ref(positions_ref));
        top.set(TOP_FREE_LENGTHS, RefOrTagged::Ref(lengths_ref));
        top.set(TOP_FREE_VERSIONS, RefOrTagged::Ref(versions_ref));
        top.set(TOP_VERSION, RefOrTagged::Int(self.new_version as i64));
        if top.len() > TOP_HISTORY_REF {
            top.set(TOP_HISTORY_REF, RefOrTagged::Ref(history_ref));
        }

        let top_ref = self.logical_end;
        let max_final_file_size = top_ref + Array::max_byte_size(top.len()) as u64;
        top.ensure_minimum_width(RefOrTagged::Int(max_final_file_size as i64));
        self.final_file_size = top_ref + top.byte_size() as u64;
        top.set(
            TOP_LOGICAL_SIZE,
            RefOrTagged::Int(self.final_file_size as i64),
        );
        let placed = self.append_node(&top.encode())?;
        debug_assert_eq!(placed, top_ref);
        debug_assert_eq!(self.logical_end, self.final_file_size);

        self.new_free = free;
        Ok(top_ref)
    }

    fn file_chunk(&self, ref_: u64) -> CoreResult<Chunk> {
        Ok(Chunk {
            pos: ref_,
            len: self.group.alloc.node_byte_size(ref_)? as u64,
            version: self.new_version,
        })
    }

    /// Recursively writes the subtree at `ref_` into the file, children
    /// first. Nodes below the slab base are part of the previous snapshot
    /// and stay put.
    fn write_tree(&mut self, ref_: u64) -> CoreResult<u64> {
        if ref_ == 0 || !self.group.alloc.is_slab_ref(ref_) {
            return Ok(ref_);
        }
        let bytes = self.group.alloc.node_bytes(ref_)?.to_vec();
        let has_refs = bytes[1] & 1 != 0;
        if bytes[0] == KIND_INTS && has_refs {
            let mut arr = Array::decode(&bytes)?;
            for i in 0..arr.len() {
                let raw = arr.get_raw(i);
                if raw != 0 && raw & 1 == 0 {
                    let new_child = self.write_tree(raw)?;
                    arr.set(i, RefOrTagged::Ref(new_child));
                }
            }
            self.place_node(&arr.encode())
        } else {
            self.place_node(&bytes)
        }
    }

    /// Places one node into free space, or at the end of the file.
    fn place_node(&mut self, bytes: &[u8]) -> CoreResult<u64> {
        let len = bytes.len() as u64;
        debug_assert_eq!(len % 8, 0);

        if let Some(i) = self.pool.iter().position(|c| c.len >= len) {
            let pos = self.pool[i].pos;
            if self.pool[i].len == len {
                self.pool.remove(i);
            } else {
                self.pool[i].pos += len;
                self.pool[i].len -= len;
            }
            self.group.alloc.backend_mut()?.write_at(pos, bytes)?;
            return Ok(pos);
        }

        self.append_node(bytes)
    }

    /// Appends one node at the end of the file.
    fn append_node(&mut self, bytes: &[u8]) -> CoreResult<u64> {
        let pos = self.group.alloc.backend_mut()?.append(bytes)?;
        debug_assert_eq!(pos, self.logical_end);
        self.logical_end += bytes.len() as u64;
        Ok(pos)
    }
}

/// Merges adjacent free chunks of equal version.
fn merge_chunks(sorted: Vec<Chunk>) -> Vec<Chunk> {
    let mut merged: Vec<Chunk> = Vec::with_capacity(sorted.len());
    for chunk in sorted {
        if let Some(last) = merged.last_mut() {
            debug_assert!(last.pos + last.len <= chunk.pos, "overlapping free chunks");
            if last.pos + last.len == chunk.pos && last.version == chunk.version {
                last.len += chunk.len;
                continue;
            }
        }
        merged.push(chunk);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{OpenMode, SizeAggregate};
    use cofferdb_repl::ColumnKind;
    use tempfile::tempdir;

    fn sample_group() -> Group {
        let mut group = Group::new().unwrap();
        for name in ["A", "B"] {
            let t = group.add_table(name, true).unwrap();
            let n = group.add_column(t, ColumnKind::Int, "n", false).unwrap();
            let s = group.add_column(t, ColumnKind::String, "s", false).unwrap();
            group.add_empty_rows(t, 5).unwrap();
            for row in 0..5 {
                group.set_int(t, n, row, row as i64 * 10).unwrap();
                group.set_string(t, s, row, &format!("row{row}")).unwrap();
            }
        }
        group
    }

    #[test]
    fn write_to_mem_then_reattach_compares_equal() {
        // Scenario: two tables, five rows each, through a memory image.
        let group = sample_group();
        let image = group.write_to_mem().unwrap();
        let reopened = Group::open_buffer(image.clone()).unwrap();

        assert!(group == reopened);
        assert_eq!(reopened.size(), 2);

        // The final-size slot of the new top accounts for everything but
        // the footer.
        let logical = reopened.top.get_int(TOP_LOGICAL_SIZE) as u64;
        assert_eq!(logical + FILE_FOOTER_SIZE as u64, image.len() as u64);
    }

    #[test]
    fn written_image_is_deterministic() {
        let group = sample_group();
        let a = group.write_to_mem_versioned(7).unwrap();
        let b = group.write_to_mem_versioned(7).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn versioned_image_carries_empty_free_list() {
        let group = sample_group();
        let image = group.write_to_mem_versioned(3).unwrap();
        let reopened = Group::open_buffer(image).unwrap();
        assert_eq!(reopened.version(), 3);
        assert_eq!(reopened.top.len(), 7);
        assert_eq!(
            reopened.used_space().unwrap(),
            reopened.top.get_int(TOP_LOGICAL_SIZE) as u64
        );
    }

    #[test]
    fn empty_group_writes_and_reopens() {
        let group = Group::new().unwrap();
        let image = group.write_to_mem().unwrap();
        let reopened = Group::open_buffer(image).unwrap();
        assert_eq!(reopened.size(), 0);
        assert!(group == reopened);
    }

    #[test]
    fn pad_for_encryption_aligns_footer_to_page() {
        let group = sample_group();
        let mut image = Vec::new();
        group.write_to(&mut image, 0, true).unwrap();
        assert_eq!(image.len() as u64 % PAGE_SIZE, 0);

        let reopened = Group::open_buffer(image).unwrap();
        assert!(group == reopened);
    }

    #[test]
    fn write_to_file_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.coffer");

        let group = sample_group();
        group.write_to_file(&path, None, 0).unwrap();
        // The destination must be fresh.
        assert!(group.write_to_file(&path, None, 0).is_err());

        let reopened = Group::open_file(&path, OpenMode::ReadOnly, None).unwrap();
        assert!(group == reopened);
    }

    #[test]
    fn write_to_encrypted_file_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.coffer");
        let key = EncryptionKey::from_bytes(&[7u8; 32]).unwrap();

        let group = sample_group();
        group.write_to_file(&path, Some(&key), 0).unwrap();

        // Without the key the image is unreadable.
        assert!(Group::open_file(&path, OpenMode::ReadOnly, None).is_err());

        let reopened = Group::open_file(&path, OpenMode::ReadOnly, Some(&key)).unwrap();
        assert!(group == reopened);
    }

    #[test]
    fn commit_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.coffer");

        {
            let mut group = Group::open_file(&path, OpenMode::ReadWrite, None).unwrap();
            let t = group.add_table("people", true).unwrap();
            let n = group.add_column(t, ColumnKind::Int, "age", false).unwrap();
            group.add_empty_rows(t, 2).unwrap();
            group.set_int(t, n, 0, 30).unwrap();
            group.set_int(t, n, 1, 40).unwrap();
            group.commit().unwrap();
        }

        let mut group = Group::open_file(&path, OpenMode::ReadWrite, None).unwrap();
        assert_eq!(group.size(), 1);
        assert_eq!(group.version(), 2);
        let table = group.get_table(0).unwrap();
        assert_eq!(table.get_int(0, 1).unwrap(), 40);
    }

    #[test]
    fn commit_keeps_live_accessors_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.coffer");

        let mut group = Group::open_file(&path, OpenMode::ReadWrite, None).unwrap();
        let t = group.add_table("T", true).unwrap();
        let n = group.add_column(t, ColumnKind::Int, "n", false).unwrap();
        group.add_empty_rows(t, 1).unwrap();
        group.get_table(t).unwrap(); // materialise the accessor
        group.commit().unwrap();

        // The accessor cache survived the commit and addresses the file.
        assert!(!group.alloc.is_slab_ref(group.accessor(t).root_ref));
        group.set_int(t, n, 0, 99).unwrap();
        group.commit().unwrap();
        assert_eq!(group.get_table(t).unwrap().get_int(n, 0).unwrap(), 99);
    }

    #[test]
    fn successive_commits_bump_version_and_reuse_space() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.coffer");

        let mut group = Group::open_file(&path, OpenMode::ReadWrite, None).unwrap();
        let t = group.add_table("T", true).unwrap();
        let n = group.add_column(t, ColumnKind::Int, "n", false).unwrap();
        group.add_empty_rows(t, 1).unwrap();
        group.commit().unwrap();
        assert_eq!(group.version(), 2);

        let mut sizes = Vec::new();
        for i in 0..8 {
            group.set_int(t, n, 0, i).unwrap();
            group.commit().unwrap();
            sizes.push(group.alloc.baseline());
        }
        assert_eq!(group.version(), 10);

        // With free-space reuse the file must not grow linearly with the
        // number of commits.
        let growth = sizes.last().unwrap() - sizes.first().unwrap();
        assert!(
            growth < 8 * 1024,
            "file grew by {growth} bytes over 8 small commits"
        );
    }

    #[test]
    fn commit_is_refused_for_buffers_without_backing_file() {
        let mut group = Group::new().unwrap();
        group.add_table("T", true).unwrap();
        assert!(matches!(
            group.commit(),
            Err(CoreError::Logic(crate::error::LogicErrorKind::WrongGroupState))
        ));
    }

    #[test]
    fn commit_is_refused_in_shared_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.coffer");
        {
            let mut group = Group::open_file(&path, OpenMode::ReadWrite, None).unwrap();
            group.add_table("T", true).unwrap();
            group.commit().unwrap();
        }

        let mut group = Group::open_file(&path, OpenMode::ReadWrite, None).unwrap();
        let top_ref = group.top_ref;
        let file_size = group.alloc.baseline();
        group.detach();
        group.attach_shared(top_ref, file_size, false).unwrap();
        assert!(matches!(
            group.commit(),
            Err(CoreError::Logic(crate::error::LogicErrorKind::WrongGroupState))
        ));
    }

    #[test]
    fn aggregated_size_after_commit_includes_freelists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.coffer");

        let mut group = Group::open_file(&path, OpenMode::ReadWrite, None).unwrap();
        group.add_table("T", true).unwrap();
        group.commit().unwrap();

        let state = group.aggregated_byte_size(SizeAggregate::state()).unwrap();
        let all = group.aggregated_byte_size(SizeAggregate::all()).unwrap();
        assert!(all > state);
        assert!(group.used_space().unwrap() <= group.alloc.baseline());
    }
}
