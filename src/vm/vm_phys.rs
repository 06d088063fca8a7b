//! Physical Frame Pool
//!
//! The fixed-size pool of user frames handed out to the frame allocator.
//! Each frame has its own byte storage so page contents can be copied,
//! zeroed and transferred to swap without holding the pool lock.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::vm::vm_param::PAGE_SIZE;

/// Base of the user pool in the physical address space
pub const USER_POOL_BASE: u64 = 0x0020_0000;

/// Contents of one physical frame
pub type FrameData = [u8; PAGE_SIZE];

/// Shared handle to a frame's storage
pub type FrameMemory = Arc<Mutex<Box<FrameData>>>;

/// A frame leased out of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame {
    /// Index within the pool
    pub index: u32,
    /// Physical base address
    pub paddr: u64,
}

/// Fixed-size pool of physical frames
pub struct PhysPool {
    /// Storage, indexed by frame index
    memory: Vec<FrameMemory>,
    /// Free frame indices
    free_queue: VecDeque<u32>,
}

impl PhysPool {
    /// Create a pool of `frame_count` frames, all free
    pub fn new(frame_count: usize) -> Self {
        let mut memory = Vec::with_capacity(frame_count);
        let mut free_queue = VecDeque::with_capacity(frame_count);
        for index in 0..frame_count {
            memory.push(Arc::new(Mutex::new(Box::new([0u8; PAGE_SIZE]))));
            free_queue.push_back(index as u32);
        }

        Self { memory, free_queue }
    }

    /// Physical address of frame `index`
    pub const fn paddr_of(index: u32) -> u64 {
        USER_POOL_BASE + (index as u64) * PAGE_SIZE as u64
    }

    /// Take a free frame and zero it
    pub fn alloc_zeroed(&mut self) -> Option<PhysFrame> {
        let index = self.free_queue.pop_front()?;
        self.memory[index as usize].lock().fill(0);
        Some(PhysFrame {
            index,
            paddr: Self::paddr_of(index),
        })
    }

    /// Return a frame to the pool
    pub fn free(&mut self, frame: PhysFrame) {
        debug_assert!(!self.free_queue.contains(&frame.index));
        self.free_queue.push_back(frame.index);
    }

    /// Storage handle for frame `index`
    pub fn memory(&self, index: u32) -> Option<FrameMemory> {
        self.memory.get(index as usize).cloned()
    }

    /// Total frame count
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Frames not currently leased
    pub fn free_count(&self) -> usize {
        self.free_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = PhysPool::new(2);
        let a = pool.alloc_zeroed().unwrap();
        let b = pool.alloc_zeroed().unwrap();
        assert_ne!(a.paddr, b.paddr);
        assert!(pool.alloc_zeroed().is_none());
        assert_eq!(pool.free_count(), 0);

        pool.free(a);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.alloc_zeroed().map(|f| f.index), Some(a.index));
    }

    #[test]
    fn test_frames_come_back_zeroed() {
        let mut pool = PhysPool::new(1);
        let frame = pool.alloc_zeroed().unwrap();
        pool.memory(frame.index).unwrap().lock()[10] = 0xAA;
        pool.free(frame);

        let again = pool.alloc_zeroed().unwrap();
        assert!(pool.memory(again.index).unwrap().lock().iter().all(|&b| b == 0));
    }
}
