//! Encrypted storage backend wrapper.
//!
//! This module provides an encrypted storage backend that wraps any other
//! backend with AES-256-GCM encryption at rest.
//!
//! ## Security Model
//!
//! - All data is encrypted in fixed-size blocks (default 4KB plaintext)
//! - Each block is encrypted with AES-256-GCM
//! - Block structure: `epoch (8 bytes) || ciphertext || tag (16 bytes)`
//! - Nonces are derived from a SHA-256 nonce key, the block number, and the
//!   block's write epoch; the epoch is bumped on every rewrite so a nonce is
//!   never reused for different plaintext
//! - Keys are never stored; must be provided by the application
//! - Keys are zeroized on drop
//!
//! ## Block-Level Encryption
//!
//! Data is encrypted in fixed-size blocks to enable random access reads and
//! in-place rewrites (the commit path overwrites the file header and free
//! space, so `write_at` must work through this wrapper).
//!
//! ```text
//! Physical layout:
//! [Header (32 bytes)][Block 0][Block 1][Block 2]...
//!
//! Each Block:
//! [Epoch (8 bytes)][Ciphertext (4 + block_size bytes)][Tag (16 bytes)]
//! ```
//!
//! The plaintext of each block is a 4-byte length prefix followed by the
//! block's data, zero-padded to the block size. The header contains the
//! magic bytes, format version, block size, and total logical size.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// Default block size for plaintext (4KB).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// Header size in bytes.
const HEADER_SIZE: usize = 32;
/// Magic bytes identifying encrypted CofferDB storage.
const MAGIC: &[u8; 8] = b"COFRENCB";
/// Current format version.
const FORMAT_VERSION: u32 = 1;
/// Size of the length prefix inside each block's plaintext.
const BLOCK_LEN_SIZE: usize = 4;
/// Size of the per-block write epoch.
const EPOCH_SIZE: usize = 8;
/// Domain separator for nonce-key derivation.
const NONCE_KEY_DOMAIN: &[u8] = b"cofferdb.nonce-key.v1";

/// Physical size of one encrypted block.
const fn encrypted_block_size(plaintext_block_size: usize) -> usize {
    EPOCH_SIZE + BLOCK_LEN_SIZE + plaintext_block_size + TAG_SIZE
}

/// Encryption key for the encrypted backend.
///
/// The key is automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(StorageError::Encryption(format!(
                "invalid key size: expected {KEY_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Returns the key as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Header for encrypted storage files.
#[derive(Debug, Clone, Copy)]
struct Header {
    /// Plaintext block size.
    block_size: u32,
    /// Total logical (plaintext) bytes written.
    logical_size: u64,
}

impl Header {
    fn new(block_size: u32) -> Self {
        Self {
            block_size,
            logical_size: 0,
        }
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.block_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.logical_size.to_le_bytes());
        // bytes 24..32 reserved
        buf
    }

    fn decode(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StorageError::Encryption("header too short".to_string()));
        }

        if &bytes[0..8] != MAGIC {
            return Err(StorageError::Encryption(
                "invalid magic bytes - not an encrypted CofferDB file".to_string(),
            ));
        }

        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(StorageError::Encryption(format!(
                "unsupported format version: {version}, expected {FORMAT_VERSION}"
            )));
        }

        let block_size = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let logical_size = u64::from_le_bytes(bytes[16..24].try_into().unwrap());

        if !(1024..=1024 * 1024).contains(&block_size) {
            return Err(StorageError::Encryption(format!(
                "invalid block size: {block_size}"
            )));
        }

        Ok(Self {
            block_size,
            logical_size,
        })
    }
}

/// Derives the nonce key from the main encryption key.
fn derive_nonce_key(key: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(NONCE_KEY_DOMAIN);
    hasher.update(key);
    hasher.finalize().into()
}

/// Derives the nonce for a given (block number, epoch) pair.
///
/// The epoch is bumped on every rewrite of the block, so the same nonce is
/// never used to encrypt two different plaintexts under one key.
fn derive_nonce(nonce_key: &[u8; KEY_SIZE], block_number: u64, epoch: u64) -> [u8; NONCE_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(nonce_key);
    hasher.update(block_number.to_le_bytes());
    hasher.update(epoch.to_le_bytes());
    let digest = hasher.finalize();
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    nonce
}

/// An encrypted storage backend that wraps another backend.
///
/// All data written through this backend is encrypted using AES-256-GCM.
/// Data is encrypted in fixed-size blocks for efficient random access.
///
/// # Security Guarantees
///
/// - **Confidentiality**: Data is encrypted with AES-256-GCM
/// - **Integrity**: Each block has a 128-bit authentication tag bound to its
///   block number, so blocks cannot be swapped undetected
/// - **Key security**: Keys are zeroized on drop
pub struct EncryptedBackend {
    /// The underlying storage backend.
    inner: Box<dyn StorageBackend>,
    /// AES-256-GCM cipher instance.
    cipher: Aes256Gcm,
    /// Derived key for nonce generation.
    nonce_key: [u8; KEY_SIZE],
    /// Plaintext block size.
    block_size: usize,
    /// Cached header (updated on writes).
    header: Header,
}

impl EncryptedBackend {
    /// Creates a new encrypted backend wrapping the given inner backend.
    ///
    /// If the inner backend is empty, initializes a new encrypted storage.
    /// If it contains data, reads and validates the header.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The inner backend contains invalid encrypted data
    /// - The encryption key is wrong (authentication fails on first read)
    /// - The format version is unsupported
    pub fn new(inner: Box<dyn StorageBackend>, key: &EncryptionKey) -> StorageResult<Self> {
        Self::with_block_size(inner, key, DEFAULT_BLOCK_SIZE)
    }

    /// Creates a new encrypted backend with a custom block size.
    ///
    /// # Errors
    ///
    /// Returns an error if the block size is invalid (must be 1KB to 1MB) or
    /// the storage is corrupted.
    pub fn with_block_size(
        mut inner: Box<dyn StorageBackend>,
        key: &EncryptionKey,
        block_size: usize,
    ) -> StorageResult<Self> {
        if !(1024..=1024 * 1024).contains(&block_size) {
            return Err(StorageError::Encryption(format!(
                "block size must be between 1KB and 1MB, got {block_size}"
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| StorageError::Encryption(format!("failed to create cipher: {e}")))?;
        let nonce_key = derive_nonce_key(key.as_bytes());

        let physical_size = inner.size()?;
        let header = if physical_size == 0 {
            let header = Header::new(block_size as u32);
            inner.append(&header.encode())?;
            inner.flush()?;
            header
        } else if physical_size < HEADER_SIZE as u64 {
            return Err(StorageError::Encryption(
                "storage too small to contain header".to_string(),
            ));
        } else {
            let header = Header::decode(&inner.read_at(0, HEADER_SIZE)?)?;
            if header.block_size as usize != block_size {
                return Err(StorageError::Encryption(format!(
                    "block size mismatch: storage has {}, requested {block_size}",
                    header.block_size
                )));
            }
            header
        };

        Ok(Self {
            inner,
            cipher,
            nonce_key,
            block_size,
            header,
        })
    }

    fn physical_offset(&self, block_number: u64) -> u64 {
        HEADER_SIZE as u64 + block_number * encrypted_block_size(self.block_size) as u64
    }

    /// Reads and decrypts one block, returning `(epoch, plaintext)`.
    ///
    /// The plaintext is the block's live data, without length prefix or
    /// padding.
    fn read_block(&self, block_number: u64) -> StorageResult<(u64, Vec<u8>)> {
        let enc_size = encrypted_block_size(self.block_size);
        let raw = self.inner.read_at(self.physical_offset(block_number), enc_size)?;

        let epoch = u64::from_le_bytes(raw[..EPOCH_SIZE].try_into().unwrap());
        let nonce_bytes = derive_nonce(&self.nonce_key, block_number, epoch);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let aad = block_number.to_le_bytes();
        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &raw[EPOCH_SIZE..],
                    aad: &aad,
                },
            )
            .map_err(|_| {
                StorageError::Encryption(format!(
                    "decryption failed for block {block_number} - wrong key or corrupted data"
                ))
            })?;

        if plaintext.len() != BLOCK_LEN_SIZE + self.block_size {
            return Err(StorageError::Encryption(format!(
                "unexpected plaintext size for block {block_number}"
            )));
        }

        let len = u32::from_le_bytes(plaintext[..BLOCK_LEN_SIZE].try_into().unwrap()) as usize;
        if len > self.block_size {
            return Err(StorageError::Encryption(format!(
                "invalid length prefix in block {block_number}"
            )));
        }

        Ok((epoch, plaintext[BLOCK_LEN_SIZE..BLOCK_LEN_SIZE + len].to_vec()))
    }

    /// Encrypts and writes one block with the given epoch.
    fn write_block(
        &mut self,
        block_number: u64,
        epoch: u64,
        data: &[u8],
        extend: bool,
    ) -> StorageResult<()> {
        debug_assert!(data.len() <= self.block_size);

        let mut plaintext = Vec::with_capacity(BLOCK_LEN_SIZE + self.block_size);
        plaintext.extend_from_slice(&(data.len() as u32).to_le_bytes());
        plaintext.extend_from_slice(data);
        plaintext.resize(BLOCK_LEN_SIZE + self.block_size, 0);

        let nonce_bytes = derive_nonce(&self.nonce_key, block_number, epoch);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let aad = block_number.to_le_bytes();
        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| StorageError::Encryption(format!("encryption failed: {e}")))?;

        let mut raw = Vec::with_capacity(encrypted_block_size(self.block_size));
        raw.extend_from_slice(&epoch.to_le_bytes());
        raw.extend_from_slice(&ciphertext);

        if extend {
            self.inner.append(&raw)?;
        } else {
            self.inner.write_at(self.physical_offset(block_number), &raw)?;
        }
        Ok(())
    }

    fn persist_header(&mut self) -> StorageResult<()> {
        let encoded = self.header.encode();
        self.inner.write_at(0, &encoded)
    }
}

impl StorageBackend for EncryptedBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = self.header.logical_size;
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let bs = self.block_size as u64;
        let mut out = Vec::with_capacity(len);
        let mut block = offset / bs;
        let mut skip = (offset % bs) as usize;
        while (out.len() as u64) < len as u64 {
            let (_, data) = self.read_block(block)?;
            let want = len - out.len();
            let avail = data.len().saturating_sub(skip);
            out.extend_from_slice(&data[skip..skip + avail.min(want)]);
            skip = 0;
            block += 1;
        }
        Ok(out)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let size = self.header.logical_size;
        let end = offset.saturating_add(data.len() as u64);
        if offset > size || end > size {
            return Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let bs = self.block_size as u64;
        let mut remaining = data;
        let mut block = offset / bs;
        let mut skip = (offset % bs) as usize;
        while !remaining.is_empty() {
            let (epoch, mut plain) = self.read_block(block)?;
            let take = remaining.len().min(plain.len() - skip);
            plain[skip..skip + take].copy_from_slice(&remaining[..take]);
            self.write_block(block, epoch + 1, &plain, false)?;
            remaining = &remaining[take..];
            skip = 0;
            block += 1;
        }
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.header.logical_size;
        if data.is_empty() {
            return Ok(offset);
        }

        let bs = self.block_size as u64;
        let mut remaining = data;

        // Fill the trailing partial block first, if any.
        let tail = (offset % bs) as usize;
        let mut block = offset / bs;
        if tail != 0 {
            let (epoch, mut plain) = self.read_block(block)?;
            debug_assert_eq!(plain.len(), tail);
            let take = remaining.len().min(self.block_size - tail);
            plain.extend_from_slice(&remaining[..take]);
            self.write_block(block, epoch + 1, &plain, false)?;
            remaining = &remaining[take..];
            block += 1;
        }

        // Then whole (or final partial) new blocks.
        while !remaining.is_empty() {
            let take = remaining.len().min(self.block_size);
            self.write_block(block, 0, &remaining[..take], true)?;
            remaining = &remaining[take..];
            block += 1;
        }

        self.header.logical_size = offset + data.len() as u64;
        self.persist_header()?;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.header.logical_size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let size = self.header.logical_size;
        if new_size > size {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate to size {new_size} which is greater than current size {size}"
                ),
            )));
        }
        if new_size == size {
            return Ok(());
        }

        let bs = self.block_size as u64;
        let keep_blocks = new_size.div_ceil(bs);
        let tail = (new_size % bs) as usize;

        if tail != 0 {
            let (epoch, plain) = self.read_block(keep_blocks - 1)?;
            self.write_block(keep_blocks - 1, epoch + 1, &plain[..tail], false)?;
        }

        let physical = self.physical_offset(keep_blocks);
        self.inner.truncate(physical)?;
        self.header.logical_size = new_size;
        self.persist_header()?;
        Ok(())
    }
}

impl std::fmt::Debug for EncryptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedBackend")
            .field("block_size", &self.block_size)
            .field("logical_size", &self.header.logical_size)
            .finish_non_exhaustive()
    }
}
