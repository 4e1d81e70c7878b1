//! In-segment header carrying the live kernel back-pointer.
//!
//! The header occupies the first chunk of the VM region, in front of the
//! data segment, as an anonymous fixed mapping. Its contents are transient:
//! they are rebuilt on every open and torn down on close. User code that
//! dereferences offset pointers resolves the owning kernel through this
//! record instead of a process-wide registry lookup.

/// Header record placed at the base of the VM region.
///
/// ```text
/// ┌────────────────┬──────────────────────────────────────────┐
/// │ SegmentHeader  │              data segment                │
/// └────────────────┴──────────────────────────────────────────┘
/// ^ region base     ^ region base + header chunk
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    /// Address of the currently live manager kernel. Rebuilt per open.
    pub manager_kernel_address: usize,
    /// Address the data segment is mapped at in this session.
    pub segment_base: usize,
    /// Maximum size of the data segment in bytes.
    pub segment_capacity: usize,
}

impl SegmentHeader {
    /// Construct the header into the anonymous chunk at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must point at a live, writable mapping of at least
    /// `size_of::<SegmentHeader>()` bytes owned by the caller.
    pub unsafe fn install(
        addr: *mut u8,
        manager_kernel_address: usize,
        segment_base: usize,
        segment_capacity: usize,
    ) -> *mut SegmentHeader {
        let header = addr.cast::<SegmentHeader>();
        unsafe {
            header.write(SegmentHeader {
                manager_kernel_address,
                segment_base,
                segment_capacity,
            });
        }
        header
    }

    /// Zero the back-pointer so stale reads cannot reach a dead kernel.
    ///
    /// # Safety
    ///
    /// `header` must point at a header previously written by [`install`]
    /// whose mapping is still live.
    ///
    /// [`install`]: SegmentHeader::install
    pub unsafe fn clear(header: *mut SegmentHeader) {
        unsafe {
            (*header).manager_kernel_address = 0;
            (*header).segment_base = 0;
            (*header).segment_capacity = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform;

    #[test]
    fn test_install_and_clear() {
        let chunk = 2 * 1024 * 1024;
        let base = platform::reserve_aligned_vm(chunk, chunk).unwrap();
        unsafe {
            platform::map_anonymous_fixed(base, chunk).unwrap();

            let header = SegmentHeader::install(base, 0xdead_beef, base as usize + chunk, 1024);
            assert_eq!((*header).manager_kernel_address, 0xdead_beef);
            assert_eq!((*header).segment_base, base as usize + chunk);
            assert_eq!((*header).segment_capacity, 1024);

            SegmentHeader::clear(header);
            assert_eq!((*header).manager_kernel_address, 0);

            platform::release_vm(base, chunk).unwrap();
        }
    }
}
