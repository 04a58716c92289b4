//! Sparse counter backing files
//!
//! One file per counter id. The file's virtual size is fixed and large
//! (default 1 TiB) so it never needs resizing, but only the first page is
//! ever touched, so physical usage stays at a single block. Offset 0 holds
//! a small header followed by the live counter word. Recovery reads the
//! value directly from the mapping; there is no log and no replay.
//!
//! Header layout (32 bytes, little-endian):
//! [MAGIC:4][VERSION:2][FLAGS:2][HEADER_CRC:4][RESERVED:4][TERM:8][VALUE:8]
//!
//! HEADER_CRC covers magic, version, flags and the counter id, so a file
//! renamed across counter ids is detected at recovery. VALUE is a single
//! 8-byte-aligned word updated atomically; TERM is rewritten (and always
//! flushed) only on ownership acquisition.

use crate::common::{Error, FlushPolicy, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

const COUNTER_MAGIC: [u8; 4] = *b"SCRB";
const FORMAT_VERSION: u16 = 1;

/// Size of the mapped active region. The header and counter word live in
/// the first page; the rest of the file is never touched.
pub const ACTIVE_REGION: usize = 4096;

const HEADER_LEN: usize = 32;
const VERSION_OFFSET: usize = 4;
const FLAGS_OFFSET: usize = 6;
const CRC_OFFSET: usize = 8;
const TERM_OFFSET: usize = 16;
const VALUE_OFFSET: usize = 24;

/// A durable, memory-mapped 64-bit counter.
///
/// Increments are atomic fetch-adds on the mapped word. Cross-node write
/// exclusion is not this type's job; it assumes a single concurrent writer,
/// enforced upstream by ownership fencing.
#[derive(Debug)]
pub struct SparseCounterFile {
    counter_id: String,
    mmap: MmapMut,
    flush_policy: FlushPolicy,
}

impl SparseCounterFile {
    /// Create the backing file for a counter that does not exist yet.
    ///
    /// The file is extended to `virtual_size` without materializing any
    /// blocks beyond the header page.
    pub fn create(
        path: impl AsRef<Path>,
        counter_id: &str,
        virtual_size: u64,
        flush_policy: FlushPolicy,
    ) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(virtual_size)?;

        let mut mmap = unsafe { MmapOptions::new().len(ACTIVE_REGION).map_mut(&file)? };

        mmap[0..4].copy_from_slice(&COUNTER_MAGIC);
        mmap[VERSION_OFFSET..VERSION_OFFSET + 2].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        mmap[FLAGS_OFFSET..FLAGS_OFFSET + 2].copy_from_slice(&0u16.to_le_bytes());
        let crc = header_crc(counter_id);
        mmap[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        mmap[TERM_OFFSET..TERM_OFFSET + 8].copy_from_slice(&0u64.to_le_bytes());
        mmap[VALUE_OFFSET..VALUE_OFFSET + 8].copy_from_slice(&0u64.to_le_bytes());
        mmap.flush_range(0, HEADER_LEN)?;

        Ok(Self {
            counter_id: counter_id.to_string(),
            mmap,
            flush_policy,
        })
    }

    /// Reopen and remap an existing counter file.
    ///
    /// Explicit and idempotent: calling it twice yields the same state.
    /// A missing, undersized, or corrupt file fails with a
    /// StorageCorruption scoped to this counter only.
    pub fn recover(
        path: impl AsRef<Path>,
        counter_id: &str,
        flush_policy: FlushPolicy,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::corruption(counter_id, "backing file missing"));
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len < ACTIVE_REGION as u64 {
            return Err(Error::corruption(
                counter_id,
                format!("backing file undersized ({} bytes)", len),
            ));
        }

        let mmap = unsafe { MmapOptions::new().len(ACTIVE_REGION).map_mut(&file)? };

        if mmap[0..4] != COUNTER_MAGIC {
            return Err(Error::corruption(counter_id, "bad magic"));
        }
        let version = u16::from_le_bytes([mmap[VERSION_OFFSET], mmap[VERSION_OFFSET + 1]]);
        if version != FORMAT_VERSION {
            return Err(Error::corruption(
                counter_id,
                format!("unsupported format version {}", version),
            ));
        }
        let stored_crc = u32::from_le_bytes([
            mmap[CRC_OFFSET],
            mmap[CRC_OFFSET + 1],
            mmap[CRC_OFFSET + 2],
            mmap[CRC_OFFSET + 3],
        ]);
        if stored_crc != header_crc(counter_id) {
            return Err(Error::corruption(counter_id, "header checksum mismatch"));
        }

        Ok(Self {
            counter_id: counter_id.to_string(),
            mmap,
            flush_policy,
        })
    }

    /// The counter id this file backs.
    pub fn counter_id(&self) -> &str {
        &self.counter_id
    }

    /// Current counter value.
    pub fn value(&self) -> u64 {
        self.cell(VALUE_OFFSET).load(Ordering::Acquire)
    }

    /// Owning term recorded in the header.
    pub fn term(&self) -> u64 {
        self.cell(TERM_OFFSET).load(Ordering::Acquire)
    }

    /// Atomic fetch-and-add on the counter word. Returns the new value.
    pub fn increment(&self, delta: u64) -> Result<u64> {
        let prev = self
            .cell(VALUE_OFFSET)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_add(delta))
            .map_err(|_| {
                Error::ResourceExhausted(format!(
                    "counter {} value space exhausted",
                    self.counter_id
                ))
            })?;
        self.maybe_flush()?;
        Ok(prev + delta)
    }

    /// Atomic fetch-max on the counter word. Returns the previous value;
    /// the caller advanced the counter iff the previous value is below
    /// `target`. The value never decreases.
    pub fn advance_to(&self, target: u64) -> Result<u64> {
        let prev = self.cell(VALUE_OFFSET).fetch_max(target, Ordering::AcqRel);
        self.maybe_flush()?;
        Ok(prev)
    }

    /// Record the owning term. Ownership changes are rare, so this is
    /// always flushed regardless of the increment flush policy.
    pub fn set_term(&self, term: u64) -> Result<()> {
        self.cell(TERM_OFFSET).store(term, Ordering::Release);
        self.mmap.flush_range(0, HEADER_LEN)?;
        Ok(())
    }

    /// Flush the active region to disk.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush_range(0, HEADER_LEN)?;
        Ok(())
    }

    fn maybe_flush(&self) -> Result<()> {
        match self.flush_policy {
            FlushPolicy::Always => self.flush(),
            FlushPolicy::Never => Ok(()),
        }
    }

    fn cell(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= ACTIVE_REGION);
        // The mapping is page-aligned and both word offsets are 8-byte
        // aligned, which upholds AtomicU64's alignment requirement. The
        // region is mapped read-write.
        unsafe { AtomicU64::from_ptr(self.mmap.as_ptr().add(offset) as *mut u64) }
    }
}

fn header_crc(counter_id: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&COUNTER_MAGIC);
    hasher.update(&FORMAT_VERSION.to_le_bytes());
    hasher.update(&0u16.to_le_bytes());
    hasher.update(counter_id.as_bytes());
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TEST_SIZE: u64 = 1 << 20;

    #[test]
    fn test_create_and_increment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq.counter");

        let counter =
            SparseCounterFile::create(&path, "seq", TEST_SIZE, FlushPolicy::Always).unwrap();
        assert_eq!(counter.value(), 0);
        assert_eq!(counter.increment(1).unwrap(), 1);
        assert_eq!(counter.increment(5).unwrap(), 6);
        assert_eq!(counter.value(), 6);
    }

    #[test]
    fn test_recover_retains_value_and_term() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq.counter");

        {
            let counter =
                SparseCounterFile::create(&path, "seq", TEST_SIZE, FlushPolicy::Always).unwrap();
            counter.increment(42).unwrap();
            counter.set_term(3).unwrap();
        }

        let counter = SparseCounterFile::recover(&path, "seq", FlushPolicy::Always).unwrap();
        assert_eq!(counter.value(), 42);
        assert_eq!(counter.term(), 3);
    }

    #[test]
    fn test_recover_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq.counter");

        {
            let counter =
                SparseCounterFile::create(&path, "seq", TEST_SIZE, FlushPolicy::Always).unwrap();
            counter.increment(7).unwrap();
        }

        let first = SparseCounterFile::recover(&path, "seq", FlushPolicy::Always).unwrap();
        assert_eq!(first.value(), 7);
        drop(first);
        let second = SparseCounterFile::recover(&path, "seq", FlushPolicy::Always).unwrap();
        assert_eq!(second.value(), 7);
    }

    #[test]
    fn test_recover_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.counter");

        let err = SparseCounterFile::recover(&path, "absent", FlushPolicy::Always).unwrap_err();
        assert!(matches!(err, Error::StorageCorruption { .. }));
    }

    #[test]
    fn test_recover_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq.counter");

        SparseCounterFile::create(&path, "seq", TEST_SIZE, FlushPolicy::Always).unwrap();
        // Stomp the header.
        use std::io::{Seek, SeekFrom, Write};
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(b"XXXX").unwrap();
        f.sync_all().unwrap();

        let err = SparseCounterFile::recover(&path, "seq", FlushPolicy::Always).unwrap_err();
        assert!(matches!(err, Error::StorageCorruption { .. }));
    }

    #[test]
    fn test_recover_undersized_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.counter");
        std::fs::write(&path, b"SCRB").unwrap();

        let err = SparseCounterFile::recover(&path, "short", FlushPolicy::Always).unwrap_err();
        assert!(matches!(err, Error::StorageCorruption { .. }));
    }

    #[test]
    fn test_recover_rejects_renamed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.counter");

        SparseCounterFile::create(&path, "a", TEST_SIZE, FlushPolicy::Always).unwrap();

        // Recovering the same file under a different counter id must fail
        // the header checksum.
        let err = SparseCounterFile::recover(&path, "b", FlushPolicy::Always).unwrap_err();
        assert!(matches!(err, Error::StorageCorruption { .. }));
    }

    #[test]
    fn test_advance_to_never_decreases() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clock.counter");

        let counter =
            SparseCounterFile::create(&path, "clock", TEST_SIZE, FlushPolicy::Never).unwrap();
        assert_eq!(counter.advance_to(100).unwrap(), 0);
        assert_eq!(counter.value(), 100);

        // Lower target is a no-op.
        assert_eq!(counter.advance_to(50).unwrap(), 100);
        assert_eq!(counter.value(), 100);

        assert_eq!(counter.advance_to(101).unwrap(), 100);
        assert_eq!(counter.value(), 101);
    }

    #[test]
    fn test_increment_exhaustion() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.counter");

        let counter =
            SparseCounterFile::create(&path, "full", TEST_SIZE, FlushPolicy::Never).unwrap();
        counter.advance_to(u64::MAX - 1).unwrap();
        assert_eq!(counter.increment(1).unwrap(), u64::MAX);

        let err = counter.increment(1).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        // Value must not have wrapped.
        assert_eq!(counter.value(), u64::MAX);
    }

    #[test]
    fn test_unflushed_value_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lazy.counter");

        {
            let counter =
                SparseCounterFile::create(&path, "lazy", TEST_SIZE, FlushPolicy::Never).unwrap();
            counter.increment(9).unwrap();
        }

        let counter = SparseCounterFile::recover(&path, "lazy", FlushPolicy::Never).unwrap();
        assert_eq!(counter.value(), 9);
    }

    #[cfg(unix)]
    #[test]
    fn test_backing_file_is_sparse() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("sparse.counter");

        let counter =
            SparseCounterFile::create(&path, "sparse", 1 << 30, FlushPolicy::Always).unwrap();
        counter.increment(1).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 1 << 30);
        // Only the header page should be materialized.
        assert!(meta.blocks() * 512 < 1 << 20);
    }
}
