//! Swap Space Management
//!
//! Anonymous pages evicted from memory are written to fixed-size slots on a
//! swap block device. Slot allocation is tracked in a bitmap (1 = used);
//! each slot spans `SECTORS_PER_PAGE` consecutive sectors.
//!
//! Bitmap updates happen under the swap lock. Sector I/O does not.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::vm::vm_error::VmError;
use crate::vm::vm_param::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

// ============================================================================
// Block Device
// ============================================================================

/// Sector-addressed block device backing the swap area
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device
    fn sector_count(&self) -> u64;

    /// Read sector `sector` into `buf` (`SECTOR_SIZE` bytes)
    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), VmError>;

    /// Write `buf` (`SECTOR_SIZE` bytes) to sector `sector`
    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<(), VmError>;
}

/// RAM-backed block device
#[derive(Debug)]
pub struct RamDisk {
    sectors: Mutex<Vec<u8>>,
    sector_count: u64,
}

impl RamDisk {
    /// Create a zeroed disk of `sector_count` sectors
    pub fn new(sector_count: u64) -> Self {
        Self {
            sectors: Mutex::new(vec![0u8; sector_count as usize * SECTOR_SIZE]),
            sector_count,
        }
    }

    /// Disk large enough for `slots` swap slots
    pub fn with_slots(slots: u64) -> Self {
        Self::new(slots * SECTORS_PER_PAGE as u64)
    }

    fn range(&self, sector: u64, len: usize) -> Result<core::ops::Range<usize>, VmError> {
        if sector >= self.sector_count || len != SECTOR_SIZE {
            return Err(VmError::SwapIo);
        }
        let start = sector as usize * SECTOR_SIZE;
        Ok(start..start + SECTOR_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), VmError> {
        let range = self.range(sector, buf.len())?;
        buf.copy_from_slice(&self.sectors.lock()[range]);
        Ok(())
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<(), VmError> {
        let range = self.range(sector, buf.len())?;
        self.sectors.lock()[range].copy_from_slice(buf);
        Ok(())
    }
}

// ============================================================================
// Swap Slots
// ============================================================================

/// Index of a page-sized slot on the swap device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub u32);

impl SwapSlot {
    /// First sector of this slot
    pub fn first_sector(&self) -> u64 {
        self.0 as u64 * SECTORS_PER_PAGE as u64
    }
}

/// Swap usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapStats {
    pub total: u32,
    pub used: u32,
}

/// Slot bitmap: 64 slots per word
#[derive(Debug)]
struct SwapBitmap {
    words: Vec<u64>,
    total: u32,
    used: u32,
}

impl SwapBitmap {
    fn new(total: u32) -> Self {
        Self {
            words: vec![0u64; (total as usize + 63) / 64],
            total,
            used: 0,
        }
    }

    fn alloc(&mut self) -> Option<u32> {
        for (idx, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let slot = (idx * 64 + bit) as u32;
            if slot >= self.total {
                return None;
            }
            *word |= 1 << bit;
            self.used += 1;
            return Some(slot);
        }
        None
    }

    fn free(&mut self, slot: u32) -> bool {
        if slot >= self.total {
            return false;
        }
        let (idx, bit) = (slot as usize / 64, slot as usize % 64);
        if self.words[idx] & (1 << bit) == 0 {
            return false;
        }
        self.words[idx] &= !(1 << bit);
        self.used -= 1;
        true
    }

    fn is_used(&self, slot: u32) -> bool {
        slot < self.total && self.words[slot as usize / 64] & (1 << (slot as usize % 64)) != 0
    }
}

/// Swap slot allocator, reader and writer over a block device
pub struct SwapManager {
    device: Box<dyn BlockDevice>,
    bitmap: Mutex<SwapBitmap>,
}

impl SwapManager {
    /// Manage the whole of `device` as swap space
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let slots = (device.sector_count() / SECTORS_PER_PAGE as u64) as u32;
        Self {
            device,
            bitmap: Mutex::new(SwapBitmap::new(slots)),
        }
    }

    /// Reserve a free slot
    pub fn alloc_slot(&self) -> Result<SwapSlot, VmError> {
        match self.bitmap.lock().alloc() {
            Some(slot) => Ok(SwapSlot(slot)),
            None => {
                crate::println!("vm_swap: swap space exhausted");
                Err(VmError::SwapFull)
            }
        }
    }

    /// Release a slot. Freeing an unused slot is ignored.
    pub fn free_slot(&self, slot: SwapSlot) {
        self.bitmap.lock().free(slot.0);
    }

    /// Check if slot is in use
    pub fn is_slot_used(&self, slot: SwapSlot) -> bool {
        self.bitmap.lock().is_used(slot.0)
    }

    /// Write one page to `slot`
    pub fn write_slot(&self, slot: SwapSlot, page: &[u8; PAGE_SIZE]) -> Result<(), VmError> {
        let base = slot.first_sector();
        for (i, chunk) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            self.device.write_sector(base + i as u64, chunk)?;
        }
        Ok(())
    }

    /// Read one page from `slot`
    pub fn read_slot(&self, slot: SwapSlot, page: &mut [u8; PAGE_SIZE]) -> Result<(), VmError> {
        let base = slot.first_sector();
        for (i, chunk) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.device.read_sector(base + i as u64, chunk)?;
        }
        Ok(())
    }

    /// Get swap statistics
    pub fn stats(&self) -> SwapStats {
        let bitmap = self.bitmap.lock();
        SwapStats {
            total: bitmap.total,
            used: bitmap.used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_round_trip() {
        let swap = SwapManager::new(Box::new(RamDisk::with_slots(4)));
        let slot = swap.alloc_slot().unwrap();

        let mut page = [0u8; PAGE_SIZE];
        page[0] = 1;
        page[PAGE_SIZE - 1] = 2;
        swap.write_slot(slot, &page).unwrap();

        let mut back = [0u8; PAGE_SIZE];
        swap.read_slot(slot, &mut back).unwrap();
        assert_eq!(back[0], 1);
        assert_eq!(back[PAGE_SIZE - 1], 2);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let swap = SwapManager::new(Box::new(RamDisk::with_slots(2)));
        let a = swap.alloc_slot().unwrap();
        let _b = swap.alloc_slot().unwrap();
        assert_eq!(swap.alloc_slot(), Err(VmError::SwapFull));
        assert_eq!(swap.stats(), SwapStats { total: 2, used: 2 });

        swap.free_slot(a);
        assert!(!swap.is_slot_used(a));
        assert_eq!(swap.alloc_slot(), Ok(a));
    }

    #[test]
    fn test_double_free_ignored() {
        let swap = SwapManager::new(Box::new(RamDisk::with_slots(1)));
        let slot = swap.alloc_slot().unwrap();
        swap.free_slot(slot);
        swap.free_slot(slot);
        assert_eq!(swap.stats().used, 0);
    }

    #[test]
    fn test_out_of_range_sector() {
        let disk = RamDisk::new(8);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(disk.read_sector(8, &mut buf), Err(VmError::SwapIo));
    }
}
