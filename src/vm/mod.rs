//! Demand-Paged Virtual Memory Subsystem
//!
//! - vm_page: page record and the per-variant operation dispatch
//! - vm_uninit / vm_anon / vm_file: the three page variants
//! - vm_frame: frame allocator with clock eviction
//! - vm_spt: supplemental page table
//! - vm_map: address space (SPT + pmap + stack + mappings)
//! - vm_fault: page fault resolver and stack growth
//! - vm_fork: address space duplication
//! - pmap / vm_phys / vm_swap / memory_object: the services below the VM
//!
//! The frame pool and swap area are shared by every address space and live
//! in one [`VmSystem`].

use alloc::boxed::Box;
use alloc::sync::Arc;

pub mod memory_object;
pub mod pmap;
pub mod vm_anon;
pub mod vm_error;
pub mod vm_fault;
pub mod vm_file;
pub mod vm_fork;
pub mod vm_frame;
pub mod vm_map;
pub mod vm_page;
pub mod vm_param;
pub mod vm_phys;
pub mod vm_spt;
pub mod vm_swap;
pub mod vm_uninit;

pub use memory_object::{BackingFile, MemFile};
pub use pmap::{Pmap, PmapError, SoftPmap};
pub use vm_error::VmError;
pub use vm_fault::{FatalFault, FaultOutcome, PageFault};
pub use vm_file::MmapRegion;
pub use vm_fork::duplicate_address_space;
pub use vm_frame::{Frame, FrameId, FrameManager, FrameStats};
pub use vm_map::{AddressSpace, PageInfo};
pub use vm_page::{LazyLoad, Page, PageFlags, PageType};
pub use vm_param::{PAGE_SIZE, USER_STACK};
pub use vm_spt::SupplementalPageTable;
pub use vm_swap::{BlockDevice, RamDisk, SwapManager, SwapSlot, SwapStats};

// ============================================================================
// Configuration
// ============================================================================

/// Runtime sizing of the VM subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Frames in the user pool
    pub frame_count: usize,
    /// Maximum stack size in bytes
    pub stack_limit: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            frame_count: 256,
            stack_limit: vm_param::STACK_LIMIT,
        }
    }
}

// ============================================================================
// VM System
// ============================================================================

/// Process-wide paging state: the frame pool and the swap area
pub struct VmSystem {
    config: VmConfig,
    frames: FrameManager,
    swap: SwapManager,
}

impl VmSystem {
    /// Build a system over `swap_device`
    pub fn new(config: VmConfig, swap_device: Box<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            config,
            frames: FrameManager::new(config.frame_count),
            swap: SwapManager::new(swap_device),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameManager {
        &self.frames
    }

    pub fn swap(&self) -> &SwapManager {
        &self.swap
    }
}

/// Kernel-lifetime instance
static VM_SYSTEM: spin::Once<Arc<VmSystem>> = spin::Once::new();

/// Initialize the VM subsystem. Later calls return the first instance.
pub fn init(config: VmConfig, swap_device: Box<dyn BlockDevice>) -> &'static Arc<VmSystem> {
    VM_SYSTEM.call_once(|| {
        let system = VmSystem::new(config, swap_device);
        crate::println!(
            "vm: {} frames, {} swap slots",
            config.frame_count,
            system.swap.stats().total
        );
        system
    })
}

/// The kernel's VM system, once initialized
pub fn system() -> Option<&'static Arc<VmSystem>> {
    VM_SYSTEM.get()
}
