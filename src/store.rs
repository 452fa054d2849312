//! Backing store: one large file-backed mapping.
//!
//! The store creates a uniquely named file in the configured directory,
//! unlinks it immediately (the space is reclaimed by the filesystem when the
//! handle closes; the pool is not a durable artifact), sizes it to the full
//! pool, and maps it shared read/write. Everything above this layer works in
//! [`PoolAddr`] offsets; because the file is mapped from offset zero, the
//! same offset addresses both the mapping and the file, so positioned file
//! writes and loads through the mapping observe the same bytes.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use memmap2::{Advice, MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::path::Path;

use crate::error::{Result, TierError};
use crate::types::PoolAddr;

/// Sanity floor for the pool size: 1 GiB.
///
/// A device tier smaller than this is a misconfiguration, not a workload this
/// allocator is built for. There is no grow path; the caller must pre-size.
pub const MIN_POOL_BYTES: u64 = 1024 * 1024 * 1024;

/// The memory-mapped backing store for the pool.
pub struct BackingStore {
    /// Backing file; already unlinked, freed on close.
    file: Arc<File>,
    /// The shared mapping over the whole file.
    mmap: RwLock<MmapMut>,
    /// Mapped base virtual address, recorded once at creation.
    base: u64,
    /// Offset of the first alignment boundary at or after `base`.
    aligned_start: PoolAddr,
    /// Total mapping size in bytes.
    len: u64,
}

impl BackingStore {
    /// Create the backing file and map it.
    ///
    /// Fails with [`TierError::PoolTooSmall`] below the sanity floor, and
    /// with [`TierError::StoreCreate`] / [`TierError::MapFailed`] when the
    /// file cannot be created, sized, or mapped. There is no fallback path.
    pub fn create(alignment: u64, size: u64, directory: &Path) -> Result<Self> {
        debug_assert!(alignment.is_power_of_two());

        if size < MIN_POOL_BYTES {
            return Err(TierError::PoolTooSmall {
                requested: size,
                minimum: MIN_POOL_BYTES,
            });
        }

        std::fs::create_dir_all(directory).map_err(|e| TierError::StoreCreate {
            directory: directory.to_path_buf(),
            cause: e.to_string(),
        })?;

        // Uniquely named and unlinked before we ever see the path.
        let file = tempfile::tempfile_in(directory).map_err(|e| TierError::StoreCreate {
            directory: directory.to_path_buf(),
            cause: e.to_string(),
        })?;

        file.set_len(size).map_err(|e| TierError::StoreCreate {
            directory: directory.to_path_buf(),
            cause: format!("failed to size backing file to {size} bytes: {e}"),
        })?;

        let mmap = unsafe {
            MmapOptions::new()
                .len(size as usize)
                .map_mut(&file)
                .map_err(|e| TierError::MapFailed {
                    size,
                    cause: e.to_string(),
                })?
        };

        let base = mmap.as_ptr() as u64;
        let aligned = base.next_multiple_of(alignment) - base;
        if aligned >= size {
            return Err(TierError::MapFailed {
                size,
                cause: format!("alignment padding {aligned} consumed the whole mapping"),
            });
        }

        tracing::debug!(
            base = %format_args!("0x{base:x}"),
            aligned_start = %PoolAddr::new(aligned),
            size,
            "mapped backing store"
        );

        Ok(Self {
            file: Arc::new(file),
            mmap: RwLock::new(mmap),
            base,
            aligned_start: PoolAddr::new(aligned),
            len: size,
        })
    }

    /// Offset of the usable, aligned pool start within the mapping.
    pub fn aligned_start(&self) -> PoolAddr {
        self.aligned_start
    }

    /// One past the last mapped offset.
    pub fn end(&self) -> PoolAddr {
        PoolAddr::new(self.len)
    }

    /// Total mapping size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the mapping is empty (never true for a live store).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle to the backing file for positioned writes from other threads.
    pub fn file_handle(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }

    fn check_range(&self, addr: PoolAddr, len: u64) -> Result<()> {
        if addr.as_u64().checked_add(len).is_none_or(|end| end > self.len) {
            return Err(TierError::InvalidAddress { addr, len });
        }
        Ok(())
    }

    /// Copy `bytes` into the mapping at `addr`.
    ///
    /// This is the no-device write path: the payload lands in the page cache
    /// of the unlinked file and is never explicitly persisted.
    pub fn copy_in(&self, addr: PoolAddr, bytes: &[u8]) -> Result<()> {
        self.check_range(addr, bytes.len() as u64)?;
        let mut mmap = self.mmap.write();
        let start = addr.as_usize();
        mmap[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read `len` bytes from the mapping at `addr`.
    pub fn read(&self, addr: PoolAddr, len: usize) -> Result<Vec<u8>> {
        self.check_range(addr, len as u64)?;
        let mmap = self.mmap.read();
        let start = addr.as_usize();
        Ok(mmap[start..start + len].to_vec())
    }

    /// Blocking positioned write of `bytes` to the file offset of `addr`.
    ///
    /// Goes through the file descriptor, not the mapping; the shared mapping
    /// observes the result through the unified page cache.
    pub fn write_at(&self, addr: PoolAddr, bytes: &[u8]) -> Result<()> {
        self.check_range(addr, bytes.len() as u64)?;
        self.file
            .write_all_at(bytes, addr.as_u64())
            .map_err(|e| TierError::WriteFailed {
                addr,
                len: bytes.len() as u64,
                cause: e.to_string(),
            })
    }

    /// Flush written data out of the page cache onto the device.
    pub fn sync_to_device(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| TierError::SyncFailed { cause: e.to_string() })
    }

    /// Advise the kernel to expect sequential access over the pool.
    pub fn advise_sequential(&self) -> Result<()> {
        self.advise(Advice::Sequential)
    }

    /// Advise the kernel to expect normal (random) access over the pool.
    pub fn advise_random(&self) -> Result<()> {
        self.advise(Advice::Normal)
    }

    /// Ask the kernel to serve pool page faults with huge pages.
    #[cfg(target_os = "linux")]
    pub fn advise_huge_pages(&self) -> Result<()> {
        self.advise(Advice::HugePage)
    }

    /// Ask the kernel to serve pool page faults with regular pages.
    #[cfg(target_os = "linux")]
    pub fn advise_regular_pages(&self) -> Result<()> {
        self.advise(Advice::NoHugePage)
    }

    fn advise(&self, advice: Advice) -> Result<()> {
        self.mmap
            .read()
            .advise(advice)
            .map_err(|e| TierError::AdviseFailed { cause: e.to_string() })
    }

    #[cfg(test)]
    fn base(&self) -> u64 {
        self.base
    }
}

impl std::fmt::Debug for BackingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingStore")
            .field("base", &format_args!("0x{:x}", self.base))
            .field("aligned_start", &self.aligned_start)
            .field("len", &self.len)
            .finish()
    }
}
