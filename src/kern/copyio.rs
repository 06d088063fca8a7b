//! Copyin/Copyout - User↔Kernel Data Transfer
//!
//! System calls reach user memory only through these functions. They walk
//! the range page by page and touch each page through the address space,
//! so a lazy or swapped-out page is faulted in exactly as a user access
//! would have done, and a bad pointer costs the process rather than the
//! kernel.
//!
//! Faults taken here are kernel-mode faults: stack growth is judged
//! against the user stack pointer saved with
//! [`AddressSpace::set_user_rsp`] at syscall entry.

use crate::vm::vm_fault::FatalFault;
use crate::vm::vm_map::AddressSpace;
use crate::vm::vm_param::{is_user_vaddr, trunc_page, PAGE_SIZE};

/// Maximum size for a single copy operation
pub const COPYIO_MAX_SIZE: usize = 64 * 1024; // 64KB

// ============================================================================
// Error Types
// ============================================================================

/// Copy operation result
pub type CopyResult = Result<usize, CopyError>;

/// Errors that can occur during copy operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CopyError {
    /// Bad user address (null, kernel space, or unmapped)
    BadAddress = -1,
    /// Page could not be brought in
    PageFault = -2,
    /// Protection violation (write to read-only page)
    Protection = -3,
    /// Size too large
    TooLarge = -4,
}

impl CopyError {
    /// Syscall return value
    pub fn to_status(self) -> i32 {
        self as i32
    }
}

impl From<FatalFault> for CopyError {
    fn from(fault: FatalFault) -> Self {
        match fault {
            FatalFault::WriteProtect | FatalFault::ReadOnlyWrite => CopyError::Protection,
            FatalFault::ResolveFailed(_) => CopyError::PageFault,
            FatalFault::KernelAddress
            | FatalFault::Unmapped
            | FatalFault::StackLimit
            | FatalFault::Unrecoverable => CopyError::BadAddress,
        }
    }
}

// ============================================================================
// Address Validation
// ============================================================================

/// Check if an address range is entirely in user space
#[inline]
pub fn is_user_range(addr: u64, size: usize) -> bool {
    if size == 0 {
        return is_user_vaddr(addr);
    }
    match addr.checked_add(size as u64 - 1) {
        Some(end) => is_user_vaddr(addr) && is_user_vaddr(end),
        None => false,
    }
}

fn check_range(addr: u64, size: usize) -> Result<(), CopyError> {
    if addr == 0 || !is_user_range(addr, size) {
        return Err(CopyError::BadAddress);
    }
    if size > COPYIO_MAX_SIZE {
        return Err(CopyError::TooLarge);
    }
    Ok(())
}

/// Split `[addr, addr + len)` at page boundaries
fn chunks(addr: u64, len: usize) -> impl Iterator<Item = (u64, core::ops::Range<usize>)> {
    let mut done = 0usize;
    core::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let va = addr + done as u64;
        let room = PAGE_SIZE - (va - trunc_page(va)) as usize;
        let n = room.min(len - done);
        let range = done..done + n;
        done += n;
        Some((va, range))
    })
}

/// Check that a syscall buffer may be used: every page is registered (or
/// is a stack page the access would grow into) and writable if the kernel
/// will write it. Faults nothing in.
pub fn validate_user_buffer(
    space: &AddressSpace,
    addr: u64,
    len: usize,
    will_write: bool,
) -> Result<(), CopyError> {
    check_range(addr, len)?;
    let rsp = space.user_rsp();
    for (va, _) in chunks(addr, len.max(1)) {
        match space.page_info(va) {
            Some(info) if will_write && !info.writable => return Err(CopyError::Protection),
            Some(_) => {}
            None if space.is_stack_access(va, rsp) => {}
            None => return Err(CopyError::BadAddress),
        }
    }
    Ok(())
}

// ============================================================================
// Copyin / Copyout
// ============================================================================

/// Copy `dst.len()` bytes from user address `user_src`
pub fn copyin(space: &AddressSpace, user_src: u64, dst: &mut [u8]) -> CopyResult {
    check_range(user_src, dst.len())?;
    for (va, range) in chunks(user_src, dst.len()) {
        let len = range.len();
        space.access(va, false, |data, off| {
            dst[range].copy_from_slice(&data[off..off + len]);
        })?;
    }
    Ok(dst.len())
}

/// Copy `src` to user address `user_dst`
pub fn copyout(space: &AddressSpace, src: &[u8], user_dst: u64) -> CopyResult {
    check_range(user_dst, src.len())?;
    for (va, range) in chunks(user_dst, src.len()) {
        let len = range.len();
        space.access(va, true, |data, off| {
            data[off..off + len].copy_from_slice(&src[range]);
        })?;
    }
    Ok(src.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::memory_object::MemFile;
    use crate::vm::vm_page::PageType;
    use crate::vm::vm_param::{KERN_BASE, USER_STACK};
    use crate::vm::vm_swap::RamDisk;
    use crate::vm::{VmConfig, VmSystem};
    use alloc::boxed::Box;

    fn space() -> AddressSpace {
        AddressSpace::new(VmSystem::new(
            VmConfig {
                frame_count: 8,
                ..VmConfig::default()
            },
            Box::new(RamDisk::with_slots(8)),
        ))
    }

    #[test]
    fn test_copy_across_page_boundary() {
        let space = space();
        space.allocate_lazy_page(PageType::Anon, 0x1000, true, None).unwrap();
        space.allocate_lazy_page(PageType::Anon, 0x2000, true, None).unwrap();

        let data: alloc::vec::Vec<u8> = (0..64u8).collect();
        assert_eq!(copyout(&space, &data, 0x1fe0), Ok(64));

        let mut back = [0u8; 64];
        assert_eq!(copyin(&space, 0x1fe0, &mut back), Ok(64));
        assert_eq!(&back[..], &data[..]);
        assert!(space.pmap().is_dirty(0x2000));
    }

    #[test]
    fn test_copyout_to_read_only_segment() {
        let file = MemFile::new(&[1u8; PAGE_SIZE]);
        let space = space();
        space.map_segment(&file.handle(), 0, 0x40_0000, PAGE_SIZE, 0, false).unwrap();

        assert_eq!(copyout(&space, b"x", 0x40_0000), Err(CopyError::Protection));
        let mut byte = [0u8; 1];
        assert_eq!(copyin(&space, 0x40_0000, &mut byte), Ok(1));
        assert_eq!(byte[0], 1);
    }

    #[test]
    fn test_bad_addresses() {
        let space = space();
        let mut buf = [0u8; 4];
        assert_eq!(copyin(&space, 0, &mut buf), Err(CopyError::BadAddress));
        assert_eq!(copyin(&space, KERN_BASE - 2, &mut buf), Err(CopyError::BadAddress));
        assert_eq!(copyin(&space, 0x5000, &mut buf), Err(CopyError::BadAddress));
        assert_eq!(CopyError::BadAddress.to_status(), -1);
        assert_eq!(CopyError::from(FatalFault::WriteProtect).to_status(), -3);
        assert_eq!(
            copyout(&space, &[0u8; COPYIO_MAX_SIZE + 1], 0x1000),
            Err(CopyError::TooLarge)
        );
    }

    #[test]
    fn test_copyout_grows_stack_below_saved_rsp() {
        let space = space();
        space.setup_initial_stack().unwrap();
        let rsp = USER_STACK - PAGE_SIZE as u64 - 64;
        space.set_user_rsp(rsp);

        assert_eq!(copyout(&space, &[7u8; 16], rsp), Ok(16));
        assert_eq!(space.stack_bottom(), USER_STACK - 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_validate_user_buffer() {
        let space = space();
        space.allocate_lazy_page(PageType::Anon, 0x1000, false, None).unwrap();
        space.allocate_lazy_page(PageType::Anon, 0x2000, true, None).unwrap();

        assert_eq!(validate_user_buffer(&space, 0x1800, 0x1000, false), Ok(()));
        assert_eq!(validate_user_buffer(&space, 0x1800, 0x1000, true), Err(CopyError::Protection));
        assert_eq!(validate_user_buffer(&space, 0x2800, 0x1000, false), Err(CopyError::BadAddress));
        // Nothing was faulted in
        assert!(space.resident_pages().is_empty());
    }
}
