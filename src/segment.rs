//! File-backed data segment mapped at a fixed address.
//!
//! `SegmentStorage` owns the mapping between the datastore's backing file
//! and the caller-chosen window inside the reserved VM region. It grows the
//! file and the mapping together, never moves, and never hands out
//! pointers; the allocator above it speaks offsets.

use crate::error::{Error, Result};
use crate::platform;
use rustix::fd::{AsFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use std::path::{Path, PathBuf};

/// A growable file-backed memory segment pinned at a fixed address.
pub struct SegmentStorage {
    /// Backing file descriptor. `None` once the storage is released.
    fd: Option<OwnedFd>,
    /// Fixed base address of the mapping.
    base: *mut u8,
    /// Currently mapped (and file-backed) length in bytes.
    current_size: usize,
    /// Growth cap in bytes.
    max_size: usize,
    /// Path to the backing file.
    path: PathBuf,
    /// Whether the mapping is read-only.
    read_only: bool,
}

impl SegmentStorage {
    /// Create a new backing file and map `initial_size` bytes at `addr`.
    ///
    /// `addr..addr + max_size` must lie inside a reservation owned by the
    /// caller; the mapping is placed with `MAP_FIXED` and creation fails if
    /// the kernel does not honor the address exactly.
    pub fn create(
        path: &Path,
        max_size: usize,
        addr: *mut u8,
        initial_size: usize,
    ) -> Result<Self> {
        if initial_size == 0 || initial_size > max_size {
            return Err(Error::InvalidSegment(format!(
                "initial size {initial_size} out of range (max {max_size})"
            )));
        }

        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o644),
        )?;
        rustix::fs::ftruncate(&fd, initial_size as u64)?;

        unsafe { platform::map_file_fixed(fd.as_fd(), initial_size, 0, addr, false)? };

        Ok(Self {
            fd: Some(fd),
            base: addr,
            current_size: initial_size,
            max_size,
            path: path.to_path_buf(),
            read_only: false,
        })
    }

    /// Open an existing backing file and map its current length at `addr`.
    pub fn open(path: &Path, max_size: usize, addr: *mut u8, read_only: bool) -> Result<Self> {
        let flags = if read_only {
            OFlags::RDONLY | OFlags::CLOEXEC
        } else {
            OFlags::RDWR | OFlags::CLOEXEC
        };
        let fd = rustix::fs::open(path, flags, Mode::empty())?;

        let stat = rustix::fs::fstat(&fd)?;
        let size = stat.st_size as usize;
        if size == 0 || size > max_size {
            return Err(Error::InvalidSegment(format!(
                "backing file length {size} out of range (max {max_size})"
            )));
        }

        unsafe { platform::map_file_fixed(fd.as_fd(), size, 0, addr, read_only)? };

        Ok(Self {
            fd: Some(fd),
            base: addr,
            current_size: size,
            max_size,
            path: path.to_path_buf(),
            read_only,
        })
    }

    /// Whether `path` holds an openable backing file.
    pub fn openable(path: &Path) -> bool {
        platform::file_exists(path)
    }

    /// Grow the file and the mapping to `new_size` bytes.
    ///
    /// Idempotent when `new_size` does not exceed the current size. The new
    /// pages are mapped contiguously after the existing ones, so previously
    /// returned offsets stay valid.
    pub fn extend(&mut self, new_size: usize) -> Result<()> {
        if self.read_only {
            return Err(Error::InvalidSegment("segment is read-only".into()));
        }
        if new_size <= self.current_size {
            return Ok(());
        }
        if new_size > self.max_size {
            return Err(Error::InvalidSegment(format!(
                "extension to {new_size} exceeds cap {}",
                self.max_size
            )));
        }
        let Some(fd) = self.fd.as_ref() else {
            return Err(Error::InvalidSegment("segment already released".into()));
        };

        rustix::fs::ftruncate(fd, new_size as u64)?;

        let grow = new_size - self.current_size;
        unsafe {
            platform::map_file_fixed(
                fd.as_fd(),
                grow,
                self.current_size as u64,
                self.base.add(self.current_size),
                false,
            )?;
        }

        self.current_size = new_size;
        Ok(())
    }

    /// Flush dirty pages to the backing file.
    ///
    /// Synchronous mode additionally waits for the file to reach stable
    /// storage before returning.
    pub fn sync(&self, synchronous: bool) -> Result<()> {
        let Some(fd) = self.fd.as_ref() else {
            return Err(Error::InvalidSegment("segment already released".into()));
        };
        unsafe { platform::sync_region(self.base, self.current_size, synchronous)? };
        if synchronous && !self.read_only {
            rustix::fs::fdatasync(fd)?;
        }
        Ok(())
    }

    /// Unmap the segment and close the backing file, keeping the files on
    /// disk. Idempotent; Drop performs the same release for storages that
    /// were never released explicitly.
    pub fn release(&mut self) {
        if self.fd.take().is_some() {
            unsafe {
                let _ = rustix::mm::munmap(self.base.cast(), self.current_size);
            }
            self.current_size = 0;
        }
    }

    /// Delete the backing file of a segment previously created at `path`.
    ///
    /// The segment must not be mapped anywhere. A backing that is already
    /// gone counts as a success; a deletion failure is reported as false.
    pub fn destroy_files(path: &Path) -> bool {
        if !platform::file_exists(path) {
            return true;
        }
        match std::fs::remove_file(path) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("failed to delete segment backing {}: {e}", path.display());
                false
            }
        }
    }

    /// Whether the mapping is read-only.
    #[inline]
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Currently backed length in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.current_size
    }

    /// Growth cap in bytes.
    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Fixed base address of the mapping.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Page size of the segment backing.
    #[inline]
    pub fn page_size(&self) -> usize {
        platform::page_size()
    }

    /// Path to the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SegmentStorage {
    fn drop(&mut self) {
        // The kernel flushes explicitly before teardown; here we only return
        // the address range to the surrounding reservation.
        self.release();
    }
}

// SAFETY: SegmentStorage is Send + Sync because the mapping is fixed for the
// lifetime of the value and all mutation (extend) requires &mut self; the
// kernel above serializes extension behind its allocator lock.
unsafe impl Send for SegmentStorage {}
unsafe impl Sync for SegmentStorage {}
