//! Durable local cache for document state.
//!
//! One flat file per document, written atomically (temp file + rename) so a
//! crash mid-save leaves the previous blob intact:
//!
//! ```text
//! ┌─────────┬─────────┬──────────┬──────────────────────┐
//! │ magic   │ version │ checksum │ payload              │
//! │ 4 bytes │ 2 bytes │ 4 bytes  │ LZ4, size-prepended  │
//! └─────────┴─────────┴──────────┴──────────────────────┘
//! ```
//!
//! The payload is an encoded document state (containers, op log, clocks).
//! A cache is an optimization, never a source of truth: every load failure
//! — missing file, bad magic, wrong schema version, checksum mismatch,
//! corrupt compression — degrades to "no cache" with a warning, and a
//! resync rebuilds the state.
//!
//! Performance targets:
//! - Save 100KB state: <5ms (compression dominated)
//! - Load 100KB state: <2ms
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (Hash Indexes, crash recovery)

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// File magic: identifies a roomsync cache blob.
const MAGIC: &[u8; 4] = b"RSYN";

/// Bumped whenever the encoded document state changes incompatibly.
/// A version mismatch is treated as a cache miss, not an error.
const SCHEMA_VERSION: u16 = 1;

/// Header: magic + version + checksum.
const HEADER_LEN: usize = 4 + 2 + 4;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding one blob per document.
    pub dir: PathBuf,
    /// Save after this many applied ops (whichever comes first).
    pub save_after_ops: u64,
    /// Save after this long with unsaved ops (whichever comes first).
    pub save_interval: Duration,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            save_after_ops: 200,
            save_interval: Duration::from_secs(5),
        }
    }

    /// Config for testing (aggressive thresholds).
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            save_after_ops: 2,
            save_interval: Duration::from_millis(20),
        }
    }
}

/// Cache errors. Only saves surface errors; loads degrade to `None`.
#[derive(Debug)]
pub enum CacheError {
    Io(std::io::Error),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Io(e) => write!(f, "cache I/O error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(e)
    }
}

/// FNV-1a over the compressed payload.
fn checksum(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193); // FNV prime
    }
    hash
}

/// FNV-1a 64-bit, used to derive stable filenames from document ids.
fn fnv64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Per-document blob store.
pub struct DocumentCache {
    dir: PathBuf,
}

impl DocumentCache {
    /// Open (and create if needed) the cache directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn blob_path(&self, document_id: &str) -> PathBuf {
        self.dir
            .join(format!("{:016x}.rsync", fnv64(document_id.as_bytes())))
    }

    /// Atomically persist a document state blob.
    pub fn save(&self, document_id: &str, state: &[u8]) -> Result<(), CacheError> {
        let compressed = lz4_flex::compress_prepend_size(state);

        let mut blob = Vec::with_capacity(HEADER_LEN + compressed.len());
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
        blob.extend_from_slice(&checksum(&compressed).to_le_bytes());
        blob.extend_from_slice(&compressed);

        let path = self.blob_path(document_id);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&blob)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        log::debug!(
            "cached {document_id}: {} bytes ({} compressed)",
            state.len(),
            compressed.len()
        );
        Ok(())
    }

    /// Load a document state blob. Any failure is a cache miss.
    pub fn load(&self, document_id: &str) -> Option<Vec<u8>> {
        let path = self.blob_path(document_id);
        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("cache read failed for {document_id}: {e}");
                return None;
            }
        };

        if blob.len() < HEADER_LEN || &blob[..4] != MAGIC {
            log::warn!("cache blob for {document_id} has bad magic, ignoring");
            return None;
        }
        let version = u16::from_le_bytes([blob[4], blob[5]]);
        if version != SCHEMA_VERSION {
            log::warn!(
                "cache blob for {document_id} has schema v{version}, expected v{SCHEMA_VERSION}, ignoring"
            );
            return None;
        }
        let stored = u32::from_le_bytes([blob[6], blob[7], blob[8], blob[9]]);
        let payload = &blob[HEADER_LEN..];
        if checksum(payload) != stored {
            log::warn!("cache blob for {document_id} failed checksum, ignoring");
            return None;
        }

        match lz4_flex::decompress_size_prepended(payload) {
            Ok(state) => Some(state),
            Err(e) => {
                log::warn!("cache blob for {document_id} failed decompression: {e}");
                None
            }
        }
    }

    /// Delete a document's blob (missing blob is fine).
    pub fn remove(&self, document_id: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.blob_path(document_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Decides when the session should persist, trading write amplification
/// against the amount of work lost on a crash.
#[derive(Debug)]
pub struct SaveDebouncer {
    ops_since_save: u64,
    last_save: Instant,
    save_after_ops: u64,
    save_interval: Duration,
}

impl SaveDebouncer {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            ops_since_save: 0,
            last_save: Instant::now(),
            save_after_ops: config.save_after_ops,
            save_interval: config.save_interval,
        }
    }

    /// Record applied ops (local or remote).
    pub fn note_ops(&mut self, count: u64) {
        self.ops_since_save += count;
    }

    /// True once either threshold trips.
    pub fn needs_save(&self) -> bool {
        self.ops_since_save >= self.save_after_ops
            || (self.ops_since_save > 0 && self.last_save.elapsed() >= self.save_interval)
    }

    pub fn mark_saved(&mut self) {
        self.ops_since_save = 0;
        self.last_save = Instant::now();
    }

    pub fn dirty(&self) -> bool {
        self.ops_since_save > 0
    }
}
