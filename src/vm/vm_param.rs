//! VM Parameters - Address Space Layout Constants
//!
//! Fixed page geometry and the user/kernel split of the flat 64-bit
//! address space, plus the address arithmetic every other module uses.

// ============================================================================
// Page Geometry
// ============================================================================

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Mask of the in-page offset bits
pub const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

// ============================================================================
// Address Space Layout
// ============================================================================

/// First kernel virtual address. Everything below is user space.
pub const KERN_BASE: u64 = 0x80_0400_0000;

/// Top of the user stack (one past the highest stack byte)
pub const USER_STACK: u64 = 0x4748_0000;

/// Default maximum stack size, measured down from `USER_STACK`
pub const STACK_LIMIT: u64 = 0x10_0000; // 1MB

/// Accesses this far below the stack pointer still count as stack accesses
/// (a push faults before the stack pointer is decremented).
pub const STACK_SLACK: u64 = 8;

// ============================================================================
// Swap Geometry
// ============================================================================

/// Block device sector size
pub const SECTOR_SIZE: usize = 512;

/// Sectors needed to hold one page
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

// ============================================================================
// Address Helpers
// ============================================================================

/// Round address down to page boundary
#[inline]
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Round address up to page boundary
#[inline]
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_MASK) & !PAGE_MASK
}

/// Offset of an address within its page
#[inline]
pub const fn page_offset(addr: u64) -> usize {
    (addr & PAGE_MASK) as usize
}

/// Virtual page number of an address
#[inline]
pub const fn vpn(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// Check whether an address is page aligned
#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & PAGE_MASK == 0
}

/// Check if an address belongs to user space
#[inline]
pub const fn is_user_vaddr(addr: u64) -> bool {
    addr < KERN_BASE
}

/// Check if an address belongs to kernel space
#[inline]
pub const fn is_kernel_vaddr(addr: u64) -> bool {
    addr >= KERN_BASE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_utils() {
        assert_eq!(trunc_page(0x5678), 0x5000);
        assert_eq!(round_page(0x5001), 0x6000);
        assert_eq!(round_page(0x5000), 0x5000);
        assert_eq!(page_offset(0x5678), 0x678);
        assert_eq!(vpn(0x5678), 5);
        assert!(is_page_aligned(0x7000));
        assert!(!is_page_aligned(0x7001));
    }

    #[test]
    fn test_address_split() {
        assert!(is_user_vaddr(USER_STACK));
        assert!(is_user_vaddr(KERN_BASE - 1));
        assert!(is_kernel_vaddr(KERN_BASE));
        assert!(!is_kernel_vaddr(0));
        assert_eq!(SECTORS_PER_PAGE, 8);
    }
}
