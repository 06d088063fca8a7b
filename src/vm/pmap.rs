//! Physical Map (pmap) - Hardware Mapping Service
//!
//! The pmap is the VM subsystem's only view of the MMU. Each address space
//! owns one; the fault resolver installs a mapping after a page becomes
//! resident and eviction removes it again.
//!
//! ## Key Operations
//!
//! - `enter`: Install a mapping from virtual to physical
//! - `remove`: Remove a mapping
//! - `extract`: Get physical address for virtual address
//! - accessed/dirty bits: read and cleared by the eviction clock and by
//!   file write-back
//!
//! [`SoftPmap`] keeps the table in software. It is what tests run against,
//! and an architecture port wraps its page-table walker behind the same trait.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::vm::vm_param::{page_offset, trunc_page};

// ============================================================================
// Pmap Errors
// ============================================================================

/// Pmap operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmapError {
    /// Pmap not initialized (or already torn down)
    NotInitialized,
    /// A mapping already exists at the virtual page
    AlreadyMapped,
    /// Address not mapped
    NotMapped,
    /// Out of memory for page-table pages
    OutOfMemory,
}

// ============================================================================
// Pmap Interface
// ============================================================================

/// Hardware mapping installer/remover for one address space.
///
/// Addresses may carry an in-page offset; implementations key on the page.
pub trait Pmap: Send + Sync {
    /// Map `va` to the frame at `pa`
    fn enter(&self, va: u64, pa: u64, writable: bool) -> Result<(), PmapError>;

    /// Remove the mapping for `va`
    fn remove(&self, va: u64) -> Result<(), PmapError>;

    /// Physical address backing `va`, including the in-page offset
    fn extract(&self, va: u64) -> Option<u64>;

    /// Whether the mapping for `va` permits writes
    fn is_writable(&self, va: u64) -> bool;

    /// Hardware dirty bit
    fn is_dirty(&self, va: u64) -> bool;

    /// Set or clear the dirty bit
    fn set_dirty(&self, va: u64, dirty: bool);

    /// Hardware accessed bit
    fn is_accessed(&self, va: u64) -> bool;

    /// Set or clear the accessed bit
    fn set_accessed(&self, va: u64, accessed: bool);

    /// Number of live mappings
    fn resident_count(&self) -> u32;

    /// Check if a virtual address is mapped
    fn is_mapped(&self, va: u64) -> bool {
        self.extract(va).is_some()
    }
}

// ============================================================================
// Software Pmap
// ============================================================================

/// One software page-table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmapEntry {
    /// Physical page base
    pub phys: u64,
    /// Writable mapping
    pub writable: bool,
    /// Accessed since last cleared
    pub accessed: bool,
    /// Written since last cleared
    pub dirty: bool,
}

/// Software page table: virt_page -> entry
#[derive(Debug, Default)]
pub struct SoftPmap {
    mappings: Mutex<BTreeMap<u64, PmapEntry>>,
    resident_count: AtomicU32,
}

impl SoftPmap {
    /// Create an empty pmap
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the entry for `va`
    pub fn entry(&self, va: u64) -> Option<PmapEntry> {
        self.mappings.lock().get(&trunc_page(va)).copied()
    }

    fn update(&self, va: u64, f: impl FnOnce(&mut PmapEntry)) {
        if let Some(entry) = self.mappings.lock().get_mut(&trunc_page(va)) {
            f(entry);
        }
    }
}

impl Pmap for SoftPmap {
    fn enter(&self, va: u64, pa: u64, writable: bool) -> Result<(), PmapError> {
        let mut mappings = self.mappings.lock();
        let virt_page = trunc_page(va);
        if mappings.contains_key(&virt_page) {
            return Err(PmapError::AlreadyMapped);
        }

        mappings.insert(
            virt_page,
            PmapEntry {
                phys: trunc_page(pa),
                writable,
                accessed: false,
                dirty: false,
            },
        );
        self.resident_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remove(&self, va: u64) -> Result<(), PmapError> {
        match self.mappings.lock().remove(&trunc_page(va)) {
            Some(_) => {
                self.resident_count.fetch_sub(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(PmapError::NotMapped),
        }
    }

    fn extract(&self, va: u64) -> Option<u64> {
        self.entry(va).map(|e| e.phys | page_offset(va) as u64)
    }

    fn is_writable(&self, va: u64) -> bool {
        self.entry(va).map_or(false, |e| e.writable)
    }

    fn is_dirty(&self, va: u64) -> bool {
        self.entry(va).map_or(false, |e| e.dirty)
    }

    fn set_dirty(&self, va: u64, dirty: bool) {
        self.update(va, |e| e.dirty = dirty);
    }

    fn is_accessed(&self, va: u64) -> bool {
        self.entry(va).map_or(false, |e| e.accessed)
    }

    fn set_accessed(&self, va: u64, accessed: bool) {
        self.update(va, |e| e.accessed = accessed);
    }

    fn resident_count(&self) -> u32 {
        self.resident_count.load(Ordering::Relaxed)
    }
}
