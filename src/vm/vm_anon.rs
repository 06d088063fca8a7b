//! Anonymous Pages
//!
//! Pages with no file behind them: stack, heap, and executable segments once
//! loaded. Evicted contents live in a swap slot until the next swap-in.

use crate::counter;
use crate::kern::counters::{C_VM_SWAP_INS, C_VM_SWAP_OUTS};
use crate::vm::vm_error::VmError;
use crate::vm::vm_phys::FrameData;
use crate::vm::vm_swap::{SwapManager, SwapSlot};

/// Anonymous page state
#[derive(Debug, Default)]
pub struct AnonPage {
    /// Slot holding the contents while swapped out
    slot: Option<SwapSlot>,
}

impl AnonPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot currently holding this page, if swapped out
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    /// Restore from swap, or zero-fill a page that was never swapped
    pub fn swap_in(&mut self, frame: &mut FrameData, swap: &SwapManager) -> Result<(), VmError> {
        let slot = match self.slot {
            Some(slot) => slot,
            None => {
                frame.fill(0);
                return Ok(());
            }
        };

        swap.read_slot(slot, frame)?;
        swap.free_slot(slot);
        self.slot = None;
        counter!(C_VM_SWAP_INS);
        Ok(())
    }

    /// Write the frame to a swap slot
    pub fn swap_out(&mut self, frame: &FrameData, swap: &SwapManager) -> Result<(), VmError> {
        let (slot, fresh) = match self.slot {
            Some(slot) => (slot, false),
            None => (swap.alloc_slot()?, true),
        };

        if let Err(e) = swap.write_slot(slot, frame) {
            if fresh {
                swap.free_slot(slot);
            }
            return Err(e);
        }

        self.slot = Some(slot);
        counter!(C_VM_SWAP_OUTS);
        Ok(())
    }

    pub fn destroy(&mut self, swap: &SwapManager) {
        if let Some(slot) = self.slot.take() {
            swap.free_slot(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::vm_param::PAGE_SIZE;
    use crate::vm::vm_swap::RamDisk;
    use alloc::boxed::Box;

    #[test]
    fn test_swap_out_then_in() {
        let swap = SwapManager::new(Box::new(RamDisk::with_slots(2)));
        let mut anon = AnonPage::new();

        let mut frame = [0u8; PAGE_SIZE];
        frame[123] = 0x42;
        anon.swap_out(&frame, &swap).unwrap();
        assert!(anon.swap_slot().is_some());
        assert_eq!(swap.stats().used, 1);

        let mut back = [0u8; PAGE_SIZE];
        anon.swap_in(&mut back, &swap).unwrap();
        assert_eq!(back[123], 0x42);
        assert!(anon.swap_slot().is_none());
        assert_eq!(swap.stats().used, 0);
    }

    #[test]
    fn test_destroy_frees_slot() {
        let swap = SwapManager::new(Box::new(RamDisk::with_slots(1)));
        let mut anon = AnonPage::new();
        anon.swap_out(&[1u8; PAGE_SIZE], &swap).unwrap();
        anon.destroy(&swap);
        assert_eq!(swap.stats().used, 0);
    }

    #[test]
    fn test_swap_full_keeps_page_unswapped() {
        let swap = SwapManager::new(Box::new(RamDisk::with_slots(0)));
        let mut anon = AnonPage::new();
        assert_eq!(anon.swap_out(&[0u8; PAGE_SIZE], &swap), Err(VmError::SwapFull));
        assert!(anon.swap_slot().is_none());
    }
}
