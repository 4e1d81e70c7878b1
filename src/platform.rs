//! Platform primitives: virtual-memory reservation, fixed-address mapping,
//! durable sync, and file cloning.
//!
//! Everything here is a thin layer over rustix and `std::fs`. The rest of
//! the crate never issues a raw system call directly; it goes through these
//! helpers so the fixed-address mapping rules live in one place.

use crate::error::{Error, Result};
use rustix::fd::BorrowedFd;
use rustix::mm::{MapFlags, MsyncFlags, ProtFlags};
use std::path::Path;

/// System page size in bytes.
#[inline]
pub fn page_size() -> usize {
    rustix::param::page_size()
}

/// Reserve a contiguous, aligned virtual-address range.
///
/// The range is backed by nothing: it is an anonymous `PROT_NONE` mapping
/// that only claims address space. File-backed and anonymous pages are later
/// placed inside it with the `*_fixed` functions below. Release the range
/// with [`release_vm`].
///
/// `alignment` must be a power of two and a multiple of the page size.
pub fn reserve_aligned_vm(size: usize, alignment: usize) -> Result<*mut u8> {
    if !alignment.is_power_of_two() || alignment % page_size() != 0 {
        return Err(Error::AddressSpace(format!(
            "bad reservation alignment {alignment}"
        )));
    }
    if size == 0 || size % alignment != 0 {
        return Err(Error::AddressSpace(format!("bad reservation size {size}")));
    }

    // Over-reserve by one alignment unit, then trim the unaligned head and
    // the surplus tail so exactly [aligned, aligned + size) stays claimed.
    let padded = size
        .checked_add(alignment)
        .ok_or_else(|| Error::AddressSpace("reservation size overflow".into()))?;

    let base = unsafe {
        rustix::mm::mmap_anonymous(
            std::ptr::null_mut(),
            padded,
            ProtFlags::empty(),
            MapFlags::PRIVATE | MapFlags::NORESERVE,
        )?
    };

    let raw = base as usize;
    let aligned = (raw + alignment - 1) & !(alignment - 1);
    let head = aligned - raw;
    let tail = padded - head - size;

    unsafe {
        if head > 0 {
            rustix::mm::munmap(base, head)?;
        }
        if tail > 0 {
            rustix::mm::munmap((aligned + size) as *mut _, tail)?;
        }
    }

    Ok(aligned as *mut u8)
}

/// Release an address range obtained from [`reserve_aligned_vm`].
///
/// Any fixed mappings placed inside the range are torn down with it.
///
/// # Safety
///
/// `addr..addr + size` must be a range this process owns and no live
/// reference into it may remain.
pub unsafe fn release_vm(addr: *mut u8, size: usize) -> Result<()> {
    unsafe { rustix::mm::munmap(addr.cast(), size)? };
    Ok(())
}

/// Map `len` bytes of a file at exactly `addr`, replacing whatever part of
/// the reservation currently occupies that range.
///
/// Fails if the kernel does not honor the requested address.
///
/// # Safety
///
/// `addr..addr + len` must lie inside a range previously reserved with
/// [`reserve_aligned_vm`] and owned by the caller.
pub unsafe fn map_file_fixed(
    fd: BorrowedFd<'_>,
    len: usize,
    file_offset: u64,
    addr: *mut u8,
    read_only: bool,
) -> Result<()> {
    let prot = if read_only {
        ProtFlags::READ
    } else {
        ProtFlags::READ | ProtFlags::WRITE
    };

    let got = unsafe {
        rustix::mm::mmap(
            addr.cast(),
            len,
            prot,
            MapFlags::SHARED | MapFlags::FIXED,
            fd,
            file_offset,
        )?
    };

    if got.cast::<u8>() != addr {
        // MAP_FIXED placed the pages somewhere else; undo and report.
        unsafe {
            let _ = rustix::mm::munmap(got, len);
        }
        return Err(Error::AddressSpace(format!(
            "file mapping not honored at {addr:p}"
        )));
    }

    Ok(())
}

/// Map `len` anonymous read-write bytes at exactly `addr`.
///
/// # Safety
///
/// Same contract as [`map_file_fixed`].
pub unsafe fn map_anonymous_fixed(addr: *mut u8, len: usize) -> Result<()> {
    let got = unsafe {
        rustix::mm::mmap_anonymous(
            addr.cast(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE | MapFlags::FIXED,
        )?
    };

    if got.cast::<u8>() != addr {
        unsafe {
            let _ = rustix::mm::munmap(got, len);
        }
        return Err(Error::AddressSpace(format!(
            "anonymous mapping not honored at {addr:p}"
        )));
    }

    Ok(())
}

/// Flush dirty pages of a mapped range to their backing file.
///
/// Synchronous mode blocks until the pages are stable; asynchronous mode
/// returns after scheduling the write-back.
///
/// # Safety
///
/// `addr..addr + len` must be a live mapping owned by the caller.
pub unsafe fn sync_region(addr: *mut u8, len: usize, synchronous: bool) -> Result<()> {
    let flags = if synchronous {
        MsyncFlags::SYNC
    } else {
        MsyncFlags::ASYNC
    };
    unsafe { rustix::mm::msync(addr.cast(), len, flags)? };
    Ok(())
}

/// Clone `src` to `dst`, preferring a reflink (`FICLONE`) and falling back
/// to a byte copy on filesystems without clone support.
pub fn clone_file(src: &Path, dst: &Path) -> Result<()> {
    use rustix::fs::{Mode, OFlags};

    let src_fd = rustix::fs::open(src, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())?;
    let dst_fd = rustix::fs::open(
        dst,
        OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
        Mode::from_raw_mode(0o644),
    )?;

    if rustix::fs::ioctl_ficlone(&dst_fd, &src_fd).is_ok() {
        return Ok(());
    }

    // Reflink unsupported (EOPNOTSUPP, EXDEV, ...); copy bytes instead.
    drop(dst_fd);
    drop(src_fd);
    std::fs::copy(src, dst)?;
    Ok(())
}

/// Recursively clone a directory tree with [`clone_file`] semantics per file.
pub fn clone_directory(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            clone_directory(&entry.path(), &target)?;
        } else {
            clone_file(&entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Whether a path exists (file or directory).
#[inline]
pub fn file_exists(path: &Path) -> bool {
    path.exists()
}

/// Create a directory and any missing parents.
#[inline]
pub fn create_directory(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Delete a directory tree. Returns false on failure or if it never existed.
pub fn remove_directory(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match std::fs::remove_dir_all(path) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("failed to remove {}: {e}", path.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fd::AsFd;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("duraheap-test-{}-{}", name, std::process::id()))
    }

    #[test]
    fn test_reserve_alignment() {
        let align = 2 * 1024 * 1024;
        let base = reserve_aligned_vm(4 * align, align).unwrap();
        assert_eq!(base as usize % align, 0);
        unsafe { release_vm(base, 4 * align).unwrap() };
    }

    #[test]
    fn test_reserve_rejects_bad_alignment() {
        assert!(reserve_aligned_vm(4096, 3000).is_err());
        assert!(reserve_aligned_vm(0, 4096).is_err());
    }

    #[test]
    fn test_map_file_into_reservation() {
        let align = 2 * 1024 * 1024;
        let base = reserve_aligned_vm(align, align).unwrap();

        let path = temp_path("map-fixed");
        {
            use rustix::fs::{Mode, OFlags};
            let fd = rustix::fs::open(
                &path,
                OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC,
                Mode::from_raw_mode(0o644),
            )
            .unwrap();
            rustix::fs::ftruncate(&fd, 4096).unwrap();
            unsafe { map_file_fixed(fd.as_fd(), 4096, 0, base, false).unwrap() };
        }

        // Write through the mapping and read it back from the file.
        unsafe {
            *base = 0xA5;
            sync_region(base, 4096, true).unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes[0], 0xA5);

        unsafe { release_vm(base, align).unwrap() };
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_anonymous_fixed_mapping() {
        let align = 2 * 1024 * 1024;
        let base = reserve_aligned_vm(align, align).unwrap();

        unsafe {
            map_anonymous_fixed(base, 4096).unwrap();
            *base = 7;
            assert_eq!(*base, 7);
            release_vm(base, align).unwrap();
        }
    }

    #[test]
    fn test_clone_file_roundtrip() {
        let src = temp_path("clone-src");
        let dst = temp_path("clone-dst");
        std::fs::write(&src, b"reflink me").unwrap();

        clone_file(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"reflink me");

        std::fs::remove_file(&src).unwrap();
        std::fs::remove_file(&dst).unwrap();
    }

    #[test]
    fn test_clone_directory_recursive() {
        let src = temp_path("clonedir-src");
        let dst = temp_path("clonedir-dst");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("a"), b"top").unwrap();
        std::fs::write(src.join("sub/b"), b"nested").unwrap();

        clone_directory(&src, &dst).unwrap();
        assert_eq!(std::fs::read(dst.join("a")).unwrap(), b"top");
        assert_eq!(std::fs::read(dst.join("sub/b")).unwrap(), b"nested");

        std::fs::remove_dir_all(&src).unwrap();
        std::fs::remove_dir_all(&dst).unwrap();
    }
}
