//! Immutable array nodes and the ref-or-tagged slot encoding.
//!
//! Every node of a snapshot tree is an array: an 8-byte header followed by a
//! little-endian payload, padded to 8 bytes. Integer arrays hold raw 64-bit
//! slot values narrowed to a per-node element width; string arrays hold
//! fixed-stride length-prefixed strings. A slot value is either a **ref**
//! (low bit clear, 8-byte aligned offset into the allocator's address
//! space) or a **tagged integer** (low bit set, value shifted left by one).

use crate::error::{CoreError, CoreResult};

/// Size of the node header in bytes.
pub(crate) const NODE_HEADER_SIZE: usize = 8;

/// Node kind: integer/ref slots.
pub(crate) const KIND_INTS: u8 = 0;
/// Node kind: fixed-stride strings.
pub(crate) const KIND_STRINGS: u8 = 1;

const FLAG_HAS_REFS: u8 = 0x01;

/// A slot value: either a ref to another node or a small tagged integer.
///
/// On the wire the two are distinguished by the low bit; in memory this is
/// an ordinary sum type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOrTagged {
    /// Ref to another array node; 0 means "absent".
    Ref(u64),
    /// Tagged integer payload. Must fit in 63 bits.
    Int(i64),
}

impl RefOrTagged {
    /// Decodes a raw slot value.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        if raw & 1 == 0 {
            RefOrTagged::Ref(raw)
        } else {
            // Arithmetic shift recovers the sign of 63-bit payloads.
            RefOrTagged::Int((raw as i64) >> 1)
        }
    }

    /// Encodes this value as a raw slot.
    ///
    /// # Panics
    ///
    /// Panics if a tagged integer does not fit in 63 bits, or if a ref is
    /// not 8-byte aligned. Both indicate a bug in the caller.
    #[must_use]
    pub fn to_raw(self) -> u64 {
        match self {
            RefOrTagged::Ref(r) => {
                assert_eq!(r & 7, 0, "refs must be 8-byte aligned");
                r
            }
            RefOrTagged::Int(v) => {
                assert!(
                    (i64::MIN >> 1..=i64::MAX >> 1).contains(&v),
                    "tagged integer {v} does not fit in 63 bits"
                );
                ((v << 1) as u64) | 1
            }
        }
    }

    /// Returns the ref, or `None` for a tagged integer.
    #[must_use]
    pub fn as_ref_value(self) -> Option<u64> {
        match self {
            RefOrTagged::Ref(r) => Some(r),
            RefOrTagged::Int(_) => None,
        }
    }

    /// Returns the tagged integer, or `None` for a ref.
    #[must_use]
    pub fn as_int(self) -> Option<i64> {
        match self {
            RefOrTagged::Ref(_) => None,
            RefOrTagged::Int(v) => Some(v),
        }
    }
}

fn round_up_8(n: usize) -> usize {
    (n + 7) & !7
}

fn needed_width(raw: u64) -> u8 {
    if raw < 1 << 8 {
        1
    } else if raw < 1 << 16 {
        2
    } else if raw < 1 << 32 {
        4
    } else {
        8
    }
}

/// An integer/ref array node.
///
/// The element width only ever grows while the array is live; this is what
/// makes the writer's two-pass top-array rule sound (grow the width for the
/// projected maximum first, then patch the real value in without changing
/// the byte size).
#[derive(Debug, Clone)]
pub(crate) struct Array {
    values: Vec<u64>,
    has_refs: bool,
    width: u8,
}

impl Array {
    /// Creates an empty array.
    pub(crate) fn new(has_refs: bool) -> Self {
        Self {
            values: Vec::new(),
            has_refs,
            width: 1,
        }
    }

    /// Decodes an array from node bytes.
    pub(crate) fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < NODE_HEADER_SIZE {
            return Err(CoreError::invalid_database("array node too short", ""));
        }
        if bytes[0] != KIND_INTS {
            return Err(CoreError::invalid_database(
                "expected integer array node",
                "",
            ));
        }
        let has_refs = bytes[1] & FLAG_HAS_REFS != 0;
        let width = bytes[2];
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(CoreError::invalid_database("invalid array width", ""));
        }
        let size = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let payload_len = size * width as usize;
        if bytes.len() < NODE_HEADER_SIZE + payload_len {
            return Err(CoreError::invalid_database("array payload truncated", ""));
        }

        let mut values = Vec::with_capacity(size);
        let w = width as usize;
        for i in 0..size {
            let start = NODE_HEADER_SIZE + i * w;
            let mut raw = [0u8; 8];
            raw[..w].copy_from_slice(&bytes[start..start + w]);
            values.push(u64::from_le_bytes(raw));
        }

        Ok(Self {
            values,
            has_refs,
            width,
        })
    }

    /// Encodes this array into node bytes.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.byte_size());
        buf.push(KIND_INTS);
        buf.push(if self.has_refs { FLAG_HAS_REFS } else { 0 });
        buf.push(self.width);
        buf.push(0);
        buf.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        let w = self.width as usize;
        for &v in &self.values {
            buf.extend_from_slice(&v.to_le_bytes()[..w]);
        }
        buf.resize(self.byte_size(), 0);
        buf
    }

    /// Total encoded size of this node in bytes (8-byte aligned).
    pub(crate) fn byte_size(&self) -> usize {
        NODE_HEADER_SIZE + round_up_8(self.values.len() * self.width as usize)
    }

    /// Maximum possible encoded size of a node with `len` slots.
    pub(crate) fn max_byte_size(len: usize) -> usize {
        NODE_HEADER_SIZE + len * 8
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn has_refs(&self) -> bool {
        self.has_refs
    }

    pub(crate) fn get_raw(&self, ndx: usize) -> u64 {
        self.values[ndx]
    }

    pub(crate) fn get(&self, ndx: usize) -> RefOrTagged {
        RefOrTagged::from_raw(self.values[ndx])
    }

    /// Reads a slot known to hold a ref.
    pub(crate) fn get_ref(&self, ndx: usize) -> u64 {
        match self.get(ndx) {
            RefOrTagged::Ref(r) => r,
            RefOrTagged::Int(_) => {
                debug_assert!(false, "slot {ndx} holds a tagged integer, not a ref");
                0
            }
        }
    }

    /// Reads a slot known to hold a tagged integer.
    pub(crate) fn get_int(&self, ndx: usize) -> i64 {
        match self.get(ndx) {
            RefOrTagged::Int(v) => v,
            RefOrTagged::Ref(_) => {
                debug_assert!(false, "slot {ndx} holds a ref, not a tagged integer");
                0
            }
        }
    }

    fn widen_for(&mut self, raw: u64) {
        let needed = needed_width(raw);
        if needed > self.width {
            self.width = needed;
        }
    }

    pub(crate) fn set(&mut self, ndx: usize, value: RefOrTagged) {
        let raw = value.to_raw();
        self.widen_for(raw);
        self.values[ndx] = raw;
    }

    pub(crate) fn insert(&mut self, ndx: usize, value: RefOrTagged) {
        let raw = value.to_raw();
        self.widen_for(raw);
        self.values.insert(ndx, raw);
    }

    pub(crate) fn push(&mut self, value: RefOrTagged) {
        self.insert(self.values.len(), value);
    }

    pub(crate) fn erase(&mut self, ndx: usize) {
        self.values.remove(ndx);
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    /// Grows the representation so that `value` can later be stored without
    /// changing the encoded byte size.
    pub(crate) fn ensure_minimum_width(&mut self, value: RefOrTagged) {
        self.widen_for(value.to_raw());
    }
}

fn needed_stride(len: usize) -> u8 {
    if len < 8 {
        8
    } else if len < 16 {
        16
    } else if len < 32 {
        32
    } else {
        64
    }
}

/// A fixed-stride string array node.
///
/// Each element is one length byte followed by the string bytes, zero-padded
/// to the stride. The stride grows with the longest stored string and caps
/// at 64, bounding strings to 63 bytes.
#[derive(Debug, Clone)]
pub(crate) struct StringArray {
    strings: Vec<String>,
    stride: u8,
}

impl StringArray {
    pub(crate) fn new() -> Self {
        Self {
            strings: Vec::new(),
            stride: 8,
        }
    }

    pub(crate) fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < NODE_HEADER_SIZE {
            return Err(CoreError::invalid_database("string node too short", ""));
        }
        if bytes[0] != KIND_STRINGS {
            return Err(CoreError::invalid_database("expected string array node", ""));
        }
        let stride = bytes[2];
        if !matches!(stride, 8 | 16 | 32 | 64) {
            return Err(CoreError::invalid_database("invalid string stride", ""));
        }
        let size = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let s = stride as usize;
        if bytes.len() < NODE_HEADER_SIZE + size * s {
            return Err(CoreError::invalid_database("string payload truncated", ""));
        }

        let mut strings = Vec::with_capacity(size);
        for i in 0..size {
            let start = NODE_HEADER_SIZE + i * s;
            let len = bytes[start] as usize;
            if len >= s {
                return Err(CoreError::invalid_database("string length out of range", ""));
            }
            let text = std::str::from_utf8(&bytes[start + 1..start + 1 + len])
                .map_err(|_| CoreError::invalid_database("string is not valid UTF-8", ""))?;
            strings.push(text.to_string());
        }

        Ok(Self { strings, stride })
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let s = self.stride as usize;
        let mut buf = Vec::with_capacity(self.byte_size());
        buf.push(KIND_STRINGS);
        buf.push(0);
        buf.push(self.stride);
        buf.push(0);
        buf.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        for text in &self.strings {
            buf.push(text.len() as u8);
            buf.extend_from_slice(text.as_bytes());
            buf.resize(buf.len() + (s - 1 - text.len()), 0);
        }
        buf.resize(self.byte_size(), 0);
        buf
    }

    pub(crate) fn byte_size(&self) -> usize {
        NODE_HEADER_SIZE + round_up_8(self.strings.len() * self.stride as usize)
    }

    pub(crate) fn len(&self) -> usize {
        self.strings.len()
    }

    pub(crate) fn get(&self, ndx: usize) -> &str {
        &self.strings[ndx]
    }

    /// Linear scan for the first element equal to `needle`.
    pub(crate) fn find_first(&self, needle: &str) -> Option<usize> {
        self.strings.iter().position(|s| s == needle)
    }

    fn widen_for(&mut self, len: usize) {
        debug_assert!(len <= 63);
        let needed = needed_stride(len);
        if needed > self.stride {
            self.stride = needed;
        }
    }

    pub(crate) fn set(&mut self, ndx: usize, text: &str) {
        self.widen_for(text.len());
        self.strings[ndx] = text.to_string();
    }

    pub(crate) fn insert(&mut self, ndx: usize, text: &str) {
        self.widen_for(text.len());
        self.strings.insert(ndx, text.to_string());
    }

    pub(crate) fn push(&mut self, text: &str) {
        self.insert(self.strings.len(), text);
    }

    pub(crate) fn erase(&mut self, ndx: usize) {
        self.strings.remove(ndx);
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.strings.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_encoding_distinguishes_refs_and_ints() {
        assert_eq!(RefOrTagged::from_raw(0), RefOrTagged::Ref(0));
        assert_eq!(RefOrTagged::from_raw(24), RefOrTagged::Ref(24));
        assert_eq!(RefOrTagged::from_raw(1), RefOrTagged::Int(0));
        assert_eq!(RefOrTagged::Int(21).to_raw(), 43);
        assert_eq!(RefOrTagged::from_raw(43), RefOrTagged::Int(21));
    }

    #[test]
    fn negative_tagged_integers_roundtrip() {
        let v = RefOrTagged::Int(-12345);
        assert_eq!(RefOrTagged::from_raw(v.to_raw()), v);
    }

    #[test]
    #[should_panic(expected = "63 bits")]
    fn oversized_tagged_integer_is_refused() {
        let _ = RefOrTagged::Int(i64::MAX).to_raw();
    }

    #[test]
    #[should_panic(expected = "aligned")]
    fn misaligned_ref_is_refused() {
        let _ = RefOrTagged::Ref(13).to_raw();
    }

    #[test]
    fn array_roundtrip() {
        let mut arr = Array::new(true);
        arr.push(RefOrTagged::Ref(24));
        arr.push(RefOrTagged::Ref(1024));
        arr.push(RefOrTagged::Int(7));

        let decoded = Array::decode(&arr.encode()).unwrap();
        assert_eq!(decoded.len(), 3);
        assert!(decoded.has_refs());
        assert_eq!(decoded.get(0), RefOrTagged::Ref(24));
        assert_eq!(decoded.get(1), RefOrTagged::Ref(1024));
        assert_eq!(decoded.get(2), RefOrTagged::Int(7));
    }

    #[test]
    fn width_grows_and_never_shrinks() {
        let mut arr = Array::new(false);
        arr.push(RefOrTagged::Int(1));
        assert_eq!(arr.byte_size(), 16);
        arr.push(RefOrTagged::Int(1 << 40));
        assert_eq!(arr.byte_size(), 24);
        arr.erase(1);
        // Representation stays wide
        assert_eq!(arr.byte_size(), 16);
        let decoded = Array::decode(&arr.encode()).unwrap();
        assert_eq!(decoded.get(0), RefOrTagged::Int(1));
    }

    #[test]
    fn ensure_minimum_width_makes_patching_size_stable() {
        let mut top = Array::new(true);
        top.push(RefOrTagged::Ref(24));
        top.push(RefOrTagged::Ref(48));
        top.push(RefOrTagged::Int(0));

        let projected = 1 << 34;
        top.ensure_minimum_width(RefOrTagged::Int(projected));
        let size_before = top.byte_size();
        top.set(2, RefOrTagged::Int(projected - 16));
        assert_eq!(top.byte_size(), size_before);
    }

    #[test]
    fn max_byte_size_is_an_upper_bound() {
        let mut arr = Array::new(false);
        for i in 0..10 {
            arr.push(RefOrTagged::Int(i << 55));
        }
        assert!(arr.byte_size() <= Array::max_byte_size(10));
    }

    #[test]
    fn string_array_roundtrip() {
        let mut names = StringArray::new();
        names.push("alpha");
        names.push("b");
        names.push("a-table-with-a-rather-long-name");

        let decoded = StringArray::decode(&names.encode()).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.get(0), "alpha");
        assert_eq!(decoded.get(2), "a-table-with-a-rather-long-name");
        assert_eq!(decoded.find_first("b"), Some(1));
        assert_eq!(decoded.find_first("missing"), None);
    }

    #[test]
    fn string_array_holds_63_byte_names() {
        let name = "x".repeat(63);
        let mut names = StringArray::new();
        names.push(&name);
        let decoded = StringArray::decode(&names.encode()).unwrap();
        assert_eq!(decoded.get(0), name);
    }

    #[test]
    fn node_sizes_are_8_byte_aligned() {
        let mut arr = Array::new(false);
        for i in 0..5 {
            arr.push(RefOrTagged::Int(i));
        }
        assert_eq!(arr.byte_size() % 8, 0);
        assert_eq!(arr.encode().len(), arr.byte_size());

        let mut names = StringArray::new();
        names.push("abc");
        assert_eq!(names.byte_size() % 8, 0);
        assert_eq!(names.encode().len(), names.byte_size());
    }

    #[test]
    fn decode_rejects_wrong_kind() {
        let names = StringArray::new();
        assert!(Array::decode(&names.encode()).is_err());
        let ints = Array::new(false);
        assert!(StringArray::decode(&ints.encode()).is_err());
    }
}
