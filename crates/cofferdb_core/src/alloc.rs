//! Slab allocator: the logical address space of one attached snapshot.
//!
//! Refs below the **baseline** address bytes of the attached file image;
//! refs at or above the **slab base** address copy-on-write slabs holding
//! everything mutated since the last commit. The file image is never
//! written through this type - new data lives in slabs until the committer
//! places it into the file.
//!
//! The allocator also owns the on-disk header and footer codecs. The header
//! is a dual-root structure: two top-ref slots plus a flags byte whose low
//! bit selects the live slot, so a commit publishes atomically by flipping
//! one byte. A *streamed* file instead stores `u64::MAX` in the selected
//! slot and carries the authoritative top-ref in the 16-byte footer at
//! end-of-file.

use std::collections::HashMap;

use cofferdb_storage::{StorageBackend, StorageError};
use tracing::debug;

use crate::array::{KIND_INTS, KIND_STRINGS, NODE_HEADER_SIZE};
use crate::error::{CoreError, CoreResult};

/// Size of the file header in bytes.
pub const FILE_HEADER_SIZE: usize = 24;
/// Size of the streaming footer in bytes.
pub const FILE_FOOTER_SIZE: usize = 16;

const HEADER_MAGIC: [u8; 4] = *b"CFDB";
const FOOTER_COOKIE: u64 = u64::from_le_bytes(*b"CoffrEnd");
/// Header slot value meaning "the top-ref lives in the streaming footer".
const STREAMING_TOP_REF: u64 = u64::MAX;

pub(crate) fn align8(v: u64) -> u64 {
    (v + 7) & !7
}

fn round_up_8(n: usize) -> usize {
    (n + 7) & !7
}

/// The decoded file header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FileHeader {
    pub(crate) top_refs: [u64; 2],
    pub(crate) formats: [u8; 2],
    pub(crate) flags: u8,
}

impl FileHeader {
    pub(crate) fn new_empty() -> Self {
        Self {
            top_refs: [0, 0],
            formats: [0, 0],
            flags: 0,
        }
    }

    /// Header of a streamed file: the authoritative top-ref is in the
    /// footer.
    pub(crate) fn new_streaming(file_format: u8) -> Self {
        Self {
            top_refs: [STREAMING_TOP_REF, 0],
            formats: [file_format, 0],
            flags: 0,
        }
    }

    pub(crate) fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.top_refs[0].to_le_bytes());
        buf[8..16].copy_from_slice(&self.top_refs[1].to_le_bytes());
        buf[16..20].copy_from_slice(&HEADER_MAGIC);
        buf[20] = self.formats[0];
        buf[21] = self.formats[1];
        buf[23] = self.flags;
        buf
    }

    pub(crate) fn decode(bytes: &[u8], path: &str) -> CoreResult<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(CoreError::invalid_database("file header truncated", path));
        }
        if bytes[16..20] != HEADER_MAGIC {
            return Err(CoreError::invalid_database(
                "not a CofferDB file (bad magic)",
                path,
            ));
        }
        Ok(Self {
            top_refs: [
                u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
                u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            ],
            formats: [bytes[20], bytes[21]],
            flags: bytes[23],
        })
    }

    /// Index of the live slot.
    pub(crate) fn selected(&self) -> usize {
        (self.flags & 1) as usize
    }
}

/// Encodes a streaming footer carrying the authoritative top-ref.
pub(crate) fn encode_footer(top_ref: u64) -> [u8; FILE_FOOTER_SIZE] {
    let mut buf = [0u8; FILE_FOOTER_SIZE];
    buf[0..8].copy_from_slice(&top_ref.to_le_bytes());
    buf[8..16].copy_from_slice(&FOOTER_COOKIE.to_le_bytes());
    buf
}

/// A contiguous range of file space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Chunk {
    /// Start offset.
    pub(crate) pos: u64,
    /// Length in bytes (multiple of 8).
    pub(crate) len: u64,
    /// Snapshot version at which the range became free.
    pub(crate) version: u64,
}

/// The slab allocator backing one group coordinator.
pub struct SlabAlloc {
    backend: Option<Box<dyn StorageBackend>>,
    path: String,
    /// Mirror of the first `baseline` bytes of the backend.
    file_image: Vec<u8>,
    /// Physical size of the attached file; refs below live in the file.
    ///
    /// The logical file size recorded in the top array may be smaller than
    /// the baseline (streamed files carry padding and a footer behind the
    /// top array). That gap is dead space, tracked neither as live data nor
    /// in the free list.
    baseline: u64,
    /// First slab address. Always `>= align8(baseline)`.
    slab_base: u64,
    slab: Vec<u8>,
    /// Live slab chunks: ref to capacity.
    slab_chunks: HashMap<u64, usize>,
    /// Reusable freed slab ranges.
    slab_free: Vec<Chunk>,
    /// Free file ranges of the attached snapshot (from its free list).
    file_free: Vec<Chunk>,
    /// File ranges released by copy-on-write during the current transaction.
    /// Still live in the previous snapshot; free only after the next commit.
    pending_free: Vec<Chunk>,
    committed_file_format: u8,
    global_version: u64,
    attached: bool,
}

impl SlabAlloc {
    /// Creates a detached allocator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            backend: None,
            path: String::new(),
            file_image: Vec::new(),
            baseline: 0,
            slab_base: 0,
            slab: Vec::new(),
            slab_chunks: HashMap::new(),
            slab_free: Vec::new(),
            file_free: Vec::new(),
            pending_free: Vec::new(),
            committed_file_format: 0,
            global_version: 0,
            attached: false,
        }
    }

    /// Whether the allocator is attached to an image.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Attaches to nothing: an empty logical file consisting of a bare
    /// header. All allocation goes to slabs.
    pub fn attach_empty(&mut self) {
        let header = FileHeader::new_empty();
        self.file_image = header.encode().to_vec();
        self.baseline = FILE_HEADER_SIZE as u64;
        self.slab_base = align8(self.baseline);
        self.committed_file_format = 0;
        self.attached = true;
    }

    /// Attaches to a file image served by `backend`.
    ///
    /// Returns the top-ref recorded in the image (0 for an empty file).
    pub fn attach_file(
        &mut self,
        mut backend: Box<dyn StorageBackend>,
        path: &str,
    ) -> CoreResult<u64> {
        let size = backend.size()?;

        let top_ref = if size == 0 {
            // Brand-new file: lay down an empty header.
            let header = FileHeader::new_empty();
            match backend.append(&header.encode()) {
                Ok(_) => {}
                Err(StorageError::ReadOnly) => {
                    return Err(CoreError::invalid_database("database file is empty", path));
                }
                Err(e) => return Err(e.into()),
            }
            backend.flush()?;
            self.file_image = header.encode().to_vec();
            self.baseline = FILE_HEADER_SIZE as u64;
            self.committed_file_format = 0;
            0
        } else {
            if size < FILE_HEADER_SIZE as u64 {
                return Err(CoreError::invalid_database(
                    "file is smaller than the file header",
                    path,
                ));
            }
            let file_image = backend.read_at(0, size as usize)?;
            let header = FileHeader::decode(&file_image, path)?;
            let slot = header.selected();
            let mut top_ref = header.top_refs[slot];
            self.committed_file_format = header.formats[slot];

            if top_ref == STREAMING_TOP_REF {
                // Streamed file: the authoritative ref is in the footer.
                if size < (FILE_HEADER_SIZE + FILE_FOOTER_SIZE) as u64 {
                    return Err(CoreError::invalid_database(
                        "streamed file is missing its footer",
                        path,
                    ));
                }
                let footer = &file_image[(size as usize - FILE_FOOTER_SIZE)..];
                let cookie = u64::from_le_bytes(footer[8..16].try_into().unwrap());
                if cookie != FOOTER_COOKIE {
                    return Err(CoreError::invalid_database(
                        "bad streaming footer cookie",
                        path,
                    ));
                }
                top_ref = u64::from_le_bytes(footer[0..8].try_into().unwrap());
            }

            if top_ref != 0 && (top_ref & 7 != 0 || top_ref >= size) {
                return Err(CoreError::invalid_database(
                    format!("top-ref {top_ref} is invalid for a file of {size} bytes"),
                    path,
                ));
            }

            self.file_image = file_image;
            self.baseline = size;
            top_ref
        };

        self.slab_base = align8(self.baseline);
        self.path = path.to_string();
        self.backend = Some(backend);
        self.attached = true;
        debug!(path, baseline = self.baseline, top_ref, "attached file");
        Ok(top_ref)
    }

    /// Attaches to an in-memory database image, taking ownership of it.
    pub fn attach_buffer(&mut self, buffer: Vec<u8>) -> CoreResult<u64> {
        let backend = cofferdb_storage::InMemoryBackend::with_data(buffer);
        self.attach_file(Box::new(backend), "")
    }

    /// Detaches from the current image, dropping all slabs.
    pub fn detach(&mut self) {
        self.backend = None;
        self.path.clear();
        self.file_image.clear();
        self.baseline = 0;
        self.slab_base = 0;
        self.slab.clear();
        self.slab_chunks.clear();
        self.slab_free.clear();
        self.file_free.clear();
        self.pending_free.clear();
        self.committed_file_format = 0;
        self.attached = false;
    }

    /// Physical size of the attached file.
    #[must_use]
    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    pub(crate) fn backend_mut(&mut self) -> CoreResult<&mut Box<dyn StorageBackend>> {
        self.backend
            .as_mut()
            .ok_or_else(CoreError::wrong_group_state)
    }

    /// Committed file format version read from the header.
    #[must_use]
    pub fn committed_file_format(&self) -> u8 {
        self.committed_file_format
    }

    /// Monotonic cache-invalidation counter.
    #[must_use]
    pub fn global_version(&self) -> u64 {
        self.global_version
    }

    /// Bumps the cache-invalidation counter.
    pub fn bump_global_version(&mut self) {
        self.global_version += 1;
    }

    pub(crate) fn is_slab_ref(&self, ref_: u64) -> bool {
        ref_ >= self.slab_base
    }

    /// Reads `len` bytes at `ref_` from the file image or a slab.
    pub(crate) fn read_bytes(&self, ref_: u64, len: usize) -> CoreResult<&[u8]> {
        if ref_ < self.baseline {
            let start = ref_ as usize;
            let end = start + len;
            if end > self.file_image.len() {
                return Err(CoreError::invalid_database(
                    format!("ref {ref_} reads past the end of the file"),
                    &self.path,
                ));
            }
            Ok(&self.file_image[start..end])
        } else if ref_ >= self.slab_base {
            let start = (ref_ - self.slab_base) as usize;
            let end = start + len;
            if end > self.slab.len() {
                return Err(CoreError::invalid_database(
                    format!("ref {ref_} reads past the end of slab space"),
                    &self.path,
                ));
            }
            Ok(&self.slab[start..end])
        } else {
            Err(CoreError::invalid_database(
                format!("ref {ref_} falls between file and slab space"),
                &self.path,
            ))
        }
    }

    /// Byte size of the node at `ref_`, from its header.
    pub(crate) fn node_byte_size(&self, ref_: u64) -> CoreResult<usize> {
        let header = self.read_bytes(ref_, NODE_HEADER_SIZE)?;
        let kind = header[0];
        let width = header[2] as usize;
        let size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        match kind {
            KIND_INTS | KIND_STRINGS => Ok(NODE_HEADER_SIZE + round_up_8(size * width)),
            _ => Err(CoreError::invalid_database(
                format!("unknown node kind {kind} at ref {ref_}"),
                &self.path,
            )),
        }
    }

    /// Returns the complete encoded node at `ref_`.
    pub(crate) fn node_bytes(&self, ref_: u64) -> CoreResult<&[u8]> {
        let len = self.node_byte_size(ref_)?;
        self.read_bytes(ref_, len)
    }

    /// Allocates a slab chunk of at least `size` bytes.
    pub(crate) fn alloc_chunk(&mut self, size: usize) -> u64 {
        let size = round_up_8(size.max(NODE_HEADER_SIZE));

        // First fit in the freed-slab list.
        if let Some(i) = self
            .slab_free
            .iter()
            .position(|c| c.len as usize >= size)
        {
            let chunk = self.slab_free[i];
            if chunk.len as usize == size {
                self.slab_free.remove(i);
            } else {
                self.slab_free[i].pos += size as u64;
                self.slab_free[i].len -= size as u64;
            }
            self.slab_chunks.insert(chunk.pos, size);
            return chunk.pos;
        }

        let ref_ = self.slab_base + self.slab.len() as u64;
        self.slab.resize(self.slab.len() + size, 0);
        self.slab_chunks.insert(ref_, size);
        ref_
    }

    /// Capacity of a live slab chunk, if `ref_` is one.
    pub(crate) fn chunk_capacity(&self, ref_: u64) -> Option<usize> {
        self.slab_chunks.get(&ref_).copied()
    }

    /// Overwrites the contents of a live slab chunk.
    pub(crate) fn overwrite(&mut self, ref_: u64, bytes: &[u8]) {
        debug_assert!(self.is_slab_ref(ref_));
        debug_assert!(bytes.len() <= self.chunk_capacity(ref_).unwrap_or(0));
        let start = (ref_ - self.slab_base) as usize;
        self.slab[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Stores an encoded node copy-on-write style.
    ///
    /// Rewrites `old_ref` in place when it is a slab chunk with enough
    /// capacity; otherwise allocates a new slab chunk and releases the old
    /// ref (slab chunks become reusable immediately, file ranges are
    /// deferred to the next commit).
    pub(crate) fn store_node(&mut self, encoded: &[u8], old_ref: u64) -> CoreResult<u64> {
        if old_ref != 0 {
            if let Some(cap) = self.chunk_capacity(old_ref) {
                if encoded.len() <= cap {
                    self.overwrite(old_ref, encoded);
                    return Ok(old_ref);
                }
            }
        }
        let new_ref = self.alloc_chunk(encoded.len());
        self.overwrite(new_ref, encoded);
        if old_ref != 0 {
            self.free_ref(old_ref)?;
        }
        Ok(new_ref)
    }

    /// Releases one node ref.
    pub(crate) fn free_ref(&mut self, ref_: u64) -> CoreResult<()> {
        if self.is_slab_ref(ref_) {
            if let Some(cap) = self.slab_chunks.remove(&ref_) {
                self.slab_free.push(Chunk {
                    pos: ref_,
                    len: cap as u64,
                    version: 0,
                });
            }
        } else {
            let len = self.node_byte_size(ref_)? as u64;
            self.pending_free.push(Chunk {
                pos: ref_,
                len,
                version: 0,
            });
        }
        Ok(())
    }

    /// Releases a whole subtree rooted at `ref_`.
    pub(crate) fn destroy_deep(&mut self, ref_: u64) -> CoreResult<()> {
        if ref_ == 0 {
            return Ok(());
        }
        let bytes = self.node_bytes(ref_)?;
        let kind = bytes[0];
        let has_refs = bytes[1] & 1 != 0;
        if kind == KIND_INTS && has_refs {
            let arr = crate::array::Array::decode(bytes)?;
            for i in 0..arr.len() {
                let raw = arr.get_raw(i);
                if raw != 0 && raw & 1 == 0 {
                    self.destroy_deep(raw)?;
                }
            }
        }
        self.free_ref(ref_)
    }

    /// Total encoded byte size of the subtree rooted at `ref_`.
    pub(crate) fn deep_byte_size(&self, ref_: u64) -> CoreResult<u64> {
        if ref_ == 0 {
            return Ok(0);
        }
        let bytes = self.node_bytes(ref_)?;
        let mut total = bytes.len() as u64;
        let kind = bytes[0];
        let has_refs = bytes[1] & 1 != 0;
        if kind == KIND_INTS && has_refs {
            let arr = crate::array::Array::decode(bytes)?;
            for i in 0..arr.len() {
                let raw = arr.get_raw(i);
                if raw != 0 && raw & 1 == 0 {
                    total += self.deep_byte_size(raw)?;
                }
            }
        }
        Ok(total)
    }

    /// Marks all slab memory as free again.
    ///
    /// Called before a commit publishes (everything live has been written
    /// into the file) and when (re)attaching.
    pub fn reset_free_space_tracking(&mut self) {
        self.slab.clear();
        self.slab_chunks.clear();
        self.slab_free.clear();
        self.slab_base = align8(self.baseline.max(FILE_HEADER_SIZE as u64));
    }

    /// Advances the reader's view of the file to `new_file_size`.
    pub fn update_reader_view(&mut self, new_file_size: u64) -> CoreResult<()> {
        if let Some(backend) = self.backend.as_ref() {
            self.file_image = backend.read_at(0, new_file_size as usize)?;
        }
        self.baseline = new_file_size;
        if self.slab.is_empty() {
            self.slab_base = align8(self.baseline.max(FILE_HEADER_SIZE as u64));
        } else {
            debug_assert!(
                self.slab_base >= align8(self.baseline),
                "file grew into live slab space"
            );
        }
        Ok(())
    }

    /// Re-reads the file header mirror after an external writer published.
    pub(crate) fn refresh_header_mirror(&mut self) -> CoreResult<()> {
        if let Some(backend) = self.backend.as_ref() {
            let header = backend.read_at(0, FILE_HEADER_SIZE)?;
            self.file_image[..FILE_HEADER_SIZE].copy_from_slice(&header);
            let decoded = FileHeader::decode(&header, &self.path)?;
            self.committed_file_format = decoded.formats[decoded.selected()];
        }
        Ok(())
    }

    pub(crate) fn file_free(&self) -> &[Chunk] {
        &self.file_free
    }

    pub(crate) fn set_file_free(&mut self, chunks: Vec<Chunk>) {
        self.file_free = chunks;
    }

    pub(crate) fn pending_free(&self) -> &[Chunk] {
        &self.pending_free
    }

    pub(crate) fn clear_pending_free(&mut self) {
        self.pending_free.clear();
    }

    /// Publishes `top_ref` as the file's authoritative root.
    ///
    /// Writes the new root and format version into the inactive header
    /// slot, syncs, then flips the selector byte and syncs again. A crash
    /// on either side of the flip leaves a consistent snapshot selected.
    pub(crate) fn publish_top_ref(&mut self, top_ref: u64, file_format: u8) -> CoreResult<()> {
        let mut header = FileHeader::decode(&self.file_image[..FILE_HEADER_SIZE], &self.path)?;
        let other = 1 - header.selected();
        header.top_refs[other] = top_ref;
        header.formats[other] = file_format;
        let encoded = header.encode();

        let backend = self
            .backend
            .as_mut()
            .ok_or_else(CoreError::wrong_group_state)?;
        backend.write_at(0, &encoded[..FILE_HEADER_SIZE - 1])?;
        backend.sync()?;
        backend.write_at((FILE_HEADER_SIZE - 1) as u64, &[other as u8])?;
        backend.sync()?;

        header.flags = other as u8;
        self.file_image[..FILE_HEADER_SIZE].copy_from_slice(&header.encode());
        self.committed_file_format = file_format;
        debug!(top_ref, file_format, "published new snapshot root");
        Ok(())
    }
}

impl Default for SlabAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SlabAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabAlloc")
            .field("baseline", &self.baseline)
            .field("slab_base", &self.slab_base)
            .field("slab_bytes", &self.slab.len())
            .field("file_free", &self.file_free.len())
            .field("pending_free", &self.pending_free.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Array, RefOrTagged};

    fn empty_alloc() -> SlabAlloc {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();
        alloc
    }

    #[test]
    fn attach_empty_baseline_is_header_size() {
        let alloc = empty_alloc();
        assert_eq!(alloc.baseline(), FILE_HEADER_SIZE as u64);
        assert_eq!(alloc.committed_file_format(), 0);
    }

    #[test]
    fn store_and_read_node() {
        let mut alloc = empty_alloc();
        let mut arr = Array::new(false);
        arr.push(RefOrTagged::Int(42));

        let ref_ = alloc.store_node(&arr.encode(), 0).unwrap();
        assert!(alloc.is_slab_ref(ref_));
        assert_eq!(ref_ % 8, 0);

        let decoded = Array::decode(alloc.node_bytes(ref_).unwrap()).unwrap();
        assert_eq!(decoded.get(0), RefOrTagged::Int(42));
    }

    #[test]
    fn store_node_rewrites_in_place_when_it_fits() {
        let mut alloc = empty_alloc();
        let mut arr = Array::new(false);
        arr.push(RefOrTagged::Int(1));
        arr.push(RefOrTagged::Int(2));

        let ref1 = alloc.store_node(&arr.encode(), 0).unwrap();
        arr.set(0, RefOrTagged::Int(3));
        let ref2 = alloc.store_node(&arr.encode(), ref1).unwrap();
        assert_eq!(ref1, ref2);
    }

    #[test]
    fn store_node_relocates_on_growth() {
        let mut alloc = empty_alloc();
        let mut arr = Array::new(false);
        arr.push(RefOrTagged::Int(1));

        let ref1 = alloc.store_node(&arr.encode(), 0).unwrap();
        for i in 0..16 {
            arr.push(RefOrTagged::Int(i));
        }
        let ref2 = alloc.store_node(&arr.encode(), ref1).unwrap();
        assert_ne!(ref1, ref2);
        // The old chunk is reusable
        let ref3 = alloc.alloc_chunk(16);
        assert_eq!(ref3, ref1);
    }

    #[test]
    fn destroy_deep_frees_children() {
        let mut alloc = empty_alloc();
        let mut leaf = Array::new(false);
        leaf.push(RefOrTagged::Int(5));
        let leaf_ref = alloc.store_node(&leaf.encode(), 0).unwrap();

        let mut parent = Array::new(true);
        parent.push(RefOrTagged::Ref(leaf_ref));
        let parent_ref = alloc.store_node(&parent.encode(), 0).unwrap();

        alloc.destroy_deep(parent_ref).unwrap();
        assert!(alloc.chunk_capacity(leaf_ref).is_none());
        assert!(alloc.chunk_capacity(parent_ref).is_none());
    }

    #[test]
    fn attach_buffer_rejects_garbage() {
        let mut alloc = SlabAlloc::new();
        let result = alloc.attach_buffer(vec![0xabu8; 64]);
        assert!(matches!(result, Err(CoreError::InvalidDatabase { .. })));
    }

    #[test]
    fn attach_buffer_rejects_truncated_header() {
        let mut alloc = SlabAlloc::new();
        let result = alloc.attach_buffer(vec![0u8; 10]);
        assert!(matches!(result, Err(CoreError::InvalidDatabase { .. })));
    }

    #[test]
    fn header_roundtrip() {
        let header = FileHeader {
            top_refs: [0x1000, STREAMING_TOP_REF],
            formats: [9, 0],
            flags: 1,
        };
        let decoded = FileHeader::decode(&header.encode(), "").unwrap();
        assert_eq!(decoded.top_refs, header.top_refs);
        assert_eq!(decoded.formats, header.formats);
        assert_eq!(decoded.selected(), 1);
    }

    #[test]
    fn reset_free_space_tracking_drops_slabs() {
        let mut alloc = empty_alloc();
        let mut arr = Array::new(false);
        arr.push(RefOrTagged::Int(1));
        let ref_ = alloc.store_node(&arr.encode(), 0).unwrap();

        alloc.reset_free_space_tracking();
        assert!(alloc.chunk_capacity(ref_).is_none());
        assert!(alloc.node_bytes(ref_).is_err());
    }
}
