//! Frame Allocator
//!
//! Leases physical frames from the [`PhysPool`] to resident pages and takes
//! them back by eviction when the pool runs dry.
//!
//! ## Frame states
//!
//! ```text
//!   Free ──acquire──▶ Reserved ──assign──▶ Owned ──clock──▶ Evicting
//!    ▲                  │  ▲                 │                 │
//!    └────release───────┘  └─────────────────┼──swapped out────┘
//!    └──────────────────────release──────────┘
//! ```
//!
//! The table only holds a `Weak` back-link to the owning page; the page
//! holds the [`FrameId`]. Detaching is a single write on each side.
//!
//! ## Eviction
//!
//! Second-chance clock over frame slots in index order. An owned frame
//! whose accessed bit is set gets the bit cleared and is passed over; the
//! first owned frame found clear is the victim. The hand sweeps at most
//! two full revolutions per request, so one whose frames are all busy
//! fails with `OutOfFrames` instead of spinning.
//!
//! The table lock covers bookkeeping only. The victim's page lock is taken
//! with `try_lock` (a busy page is skipped) and swap-out runs after the
//! table lock is dropped.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

use crate::counter;
use crate::kern::counters::C_VM_EVICTIONS;
use crate::vm::pmap::Pmap;
use crate::vm::vm_error::VmError;
use crate::vm::vm_page::{Page, PageRef};
use crate::vm::vm_phys::{FrameMemory, PhysFrame, PhysPool};
use crate::vm::vm_swap::SwapManager;

// ============================================================================
// Frame Types
// ============================================================================

/// Slot index of a frame in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u32);

/// A zero-filled frame handed out by [`FrameManager::acquire`]
#[derive(Clone)]
pub struct Frame {
    pub id: FrameId,
    /// Physical base address
    pub paddr: u64,
    /// Byte storage
    pub memory: FrameMemory,
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("paddr", &format_args!("{:#x}", self.paddr))
            .finish()
    }
}

/// Resident page using a frame
struct FrameOwner {
    page: Weak<Mutex<Page>>,
    va: u64,
    pmap: Arc<dyn Pmap>,
}

enum FrameState {
    /// In the pool's free queue
    Free,
    /// Leased to a claim that has not assigned it yet
    Reserved,
    /// Backing a resident page
    Owned(FrameOwner),
    /// Chosen as a victim. `released` is set if the owner let go of the
    /// frame meanwhile, in which case a failed eviction frees it.
    Evicting { owner: FrameOwner, released: bool },
}

/// Frame statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames in the pool
    pub total: u32,
    /// Frames not in the free queue
    pub allocated: u32,
    /// Frames backing a page
    pub resident: u32,
    /// Frames reclaimed by eviction
    pub evictions: u64,
}

// ============================================================================
// Frame Table
// ============================================================================

struct FrameTable {
    pool: PhysPool,
    slots: Vec<FrameState>,
    /// Clock hand
    hand: usize,
    evictions: u64,
}

impl FrameTable {
    fn lease(&mut self) -> Option<PhysFrame> {
        let frame = self.pool.alloc_zeroed()?;
        self.slots[frame.index as usize] = FrameState::Reserved;
        Some(frame)
    }

    fn free(&mut self, index: u32) {
        self.slots[index as usize] = FrameState::Free;
        self.pool.free(PhysFrame {
            index,
            paddr: PhysPool::paddr_of(index),
        });
    }

    /// Advance the hand to the next victim and mark it `Evicting`.
    /// `budget` counts slots visited across retries of one request.
    fn select_victim(&mut self, budget: &mut usize) -> Option<(FrameId, Option<PageRef>)> {
        let n = self.slots.len();
        while *budget > 0 {
            *budget -= 1;
            let index = self.hand;
            self.hand = (self.hand + 1) % n;

            let owner = match &self.slots[index] {
                FrameState::Owned(owner) => owner,
                _ => continue,
            };
            if owner.pmap.is_accessed(owner.va) {
                owner.pmap.set_accessed(owner.va, false);
                continue;
            }

            let page = owner.page.upgrade();
            if let FrameState::Owned(owner) =
                core::mem::replace(&mut self.slots[index], FrameState::Reserved)
            {
                self.slots[index] = FrameState::Evicting {
                    owner,
                    released: false,
                };
            }
            return Some((FrameId(index as u32), page));
        }
        None
    }

    /// Undo `select_victim` after a failed eviction
    fn restore(&mut self, id: FrameId) {
        let index = id.0 as usize;
        match core::mem::replace(&mut self.slots[index], FrameState::Reserved) {
            FrameState::Evicting {
                released: true, ..
            } => self.free(id.0),
            FrameState::Evicting { owner, .. } => self.slots[index] = FrameState::Owned(owner),
            other => self.slots[index] = other,
        }
    }
}

// ============================================================================
// Frame Manager
// ============================================================================

/// Process-wide frame allocator
pub struct FrameManager {
    table: Mutex<FrameTable>,
}

impl FrameManager {
    /// Manage a pool of `frame_count` frames
    pub fn new(frame_count: usize) -> Self {
        let mut slots = Vec::with_capacity(frame_count);
        slots.resize_with(frame_count, || FrameState::Free);
        Self {
            table: Mutex::new(FrameTable {
                pool: PhysPool::new(frame_count),
                slots,
                hand: 0,
                evictions: 0,
            }),
        }
    }

    /// Get a zero-filled, unowned frame, evicting if the pool is empty
    pub fn acquire(&self, swap: &SwapManager) -> Result<Frame, VmError> {
        let leased = self.table.lock().lease();
        if let Some(frame) = leased {
            return self.frame(FrameId(frame.index));
        }
        let id = self.evict(swap)?;
        self.frame(id)
    }

    fn frame(&self, id: FrameId) -> Result<Frame, VmError> {
        let memory = self.memory(id).ok_or(VmError::OutOfFrames)?;
        Ok(Frame {
            id,
            paddr: PhysPool::paddr_of(id.0),
            memory,
        })
    }

    /// Record `page` (mapped at `va` in `pmap`) as the frame's owner
    pub fn assign(&self, id: FrameId, page: &PageRef, va: u64, pmap: Arc<dyn Pmap>) {
        let mut table = self.table.lock();
        if let Some(slot) = table.slots.get_mut(id.0 as usize) {
            *slot = FrameState::Owned(FrameOwner {
                page: Arc::downgrade(page),
                va,
                pmap,
            });
        }
    }

    /// Return a frame to the pool. The owning page must already have
    /// dropped its link and mapping.
    pub fn release(&self, id: FrameId) {
        let mut table = self.table.lock();
        match table.slots.get_mut(id.0 as usize) {
            Some(FrameState::Reserved) | Some(FrameState::Owned(_)) => table.free(id.0),
            Some(FrameState::Evicting { released, .. }) => *released = true,
            Some(FrameState::Free) | None => {}
        }
    }

    /// Byte storage of frame `id`
    pub fn memory(&self, id: FrameId) -> Option<FrameMemory> {
        self.table.lock().pool.memory(id.0)
    }

    /// Page currently owning frame `id`
    pub fn owner(&self, id: FrameId) -> Option<PageRef> {
        match self.table.lock().slots.get(id.0 as usize) {
            Some(FrameState::Owned(owner)) => owner.page.upgrade(),
            _ => None,
        }
    }

    /// Virtual address the owner maps frame `id` at
    pub fn owner_va(&self, id: FrameId) -> Option<u64> {
        match self.table.lock().slots.get(id.0 as usize) {
            Some(FrameState::Owned(owner)) => Some(owner.va),
            _ => None,
        }
    }

    /// Get frame statistics
    pub fn stats(&self) -> FrameStats {
        let table = self.table.lock();
        let resident = table
            .slots
            .iter()
            .filter(|s| matches!(s, FrameState::Owned(_) | FrameState::Evicting { .. }))
            .count();
        FrameStats {
            total: table.pool.capacity() as u32,
            allocated: (table.pool.capacity() - table.pool.free_count()) as u32,
            resident: resident as u32,
            evictions: table.evictions,
        }
    }

    /// Reclaim one frame from its owner and hand it back `Reserved`
    fn evict(&self, swap: &SwapManager) -> Result<FrameId, VmError> {
        let mut budget = 2 * self.table.lock().slots.len();
        let mut failure = None;

        loop {
            let selected = self.table.lock().select_victim(&mut budget);
            let (id, page) = match selected {
                Some(victim) => victim,
                None => return Err(failure.unwrap_or(VmError::OutOfFrames)),
            };

            let page = match page {
                Some(page) => page,
                None => {
                    // Owner vanished without releasing; reclaim outright
                    self.detach_orphan(id);
                    return self.finish_eviction(id);
                }
            };
            let mut guard = match page.try_lock() {
                Some(guard) => guard,
                None => {
                    self.table.lock().restore(id);
                    continue;
                }
            };

            if guard.frame != Some(id) {
                // Released while we were choosing it
                drop(guard);
                return self.finish_eviction(id);
            }

            match self.swap_out_victim(id, &mut guard, swap) {
                Ok(()) => {
                    guard.frame = None;
                    crate::println!("vm_frame: evicted va {:#x} from frame {}", guard.va(), id.0);
                    drop(guard);
                    return self.finish_eviction(id);
                }
                Err(e) => {
                    crate::println!("vm_frame: eviction of frame {} failed: {}", id.0, e);
                    drop(guard);
                    self.table.lock().restore(id);
                    failure = VmError::worst(failure, e);
                }
            }
        }
    }

    /// Unmap the victim and save its contents. On failure the mapping and
    /// dirty bit are put back.
    fn swap_out_victim(&self, id: FrameId, page: &mut Page, swap: &SwapManager) -> Result<(), VmError> {
        let (va, pmap) = {
            let table = self.table.lock();
            match &table.slots[id.0 as usize] {
                FrameState::Evicting { owner, .. } => (owner.va, owner.pmap.clone()),
                _ => return Err(VmError::NotResident),
            }
        };
        let memory = self.memory(id).ok_or(VmError::NotResident)?;

        let dirty = pmap.is_dirty(va);
        pmap.remove(va)?;

        let saved = {
            let data = memory.lock();
            page.swap_out(&data, dirty, swap)
        };
        if let Err(e) = saved {
            if pmap.enter(va, PhysPool::paddr_of(id.0), page.is_writable()).is_ok() {
                pmap.set_dirty(va, dirty);
            }
            return Err(e);
        }
        Ok(())
    }

    fn detach_orphan(&self, id: FrameId) {
        let table = self.table.lock();
        if let FrameState::Evicting { owner, .. } = &table.slots[id.0 as usize] {
            if let Err(e) = owner.pmap.remove(owner.va) {
                crate::println!(
                    "vm_frame: unmapping orphaned va {:#x} from frame {} failed: {:?}",
                    owner.va,
                    id.0,
                    e
                );
            }
        }
    }

    fn finish_eviction(&self, id: FrameId) -> Result<FrameId, VmError> {
        let memory = {
            let mut table = self.table.lock();
            table.slots[id.0 as usize] = FrameState::Reserved;
            table.evictions += 1;
            table.pool.memory(id.0)
        };
        counter!(C_VM_EVICTIONS);
        if let Some(memory) = memory {
            memory.lock().fill(0);
        }
        Ok(id)
    }
}
