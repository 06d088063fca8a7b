//! Kernel Event Counters
//!
//! Kernel-wide counters for the paging paths: faults, stack growth, lazy
//! loads, swap traffic, eviction and fork. They are process-wide and only
//! ever increase, so tests compare deltas between two snapshots.

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// VM counter type (atomically updated)
#[derive(Debug)]
pub struct VmCounter {
    value: AtomicU64,
    name: &'static str,
}

impl VmCounter {
    /// Create a new counter
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment counter by n
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Get counter name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// VM Counters
// ============================================================================

/// Page faults entering the resolver
pub static C_VM_FAULTS: VmCounter = VmCounter::new("vm_faults");
/// Faults that terminated the process
pub static C_VM_FATAL_FAULTS: VmCounter = VmCounter::new("vm_fatal_faults");
/// Stack pages added by growth
pub static C_VM_STACK_GROWTHS: VmCounter = VmCounter::new("vm_stack_growths");
/// Lazy-load descriptors run
pub static C_VM_LAZY_LOADS: VmCounter = VmCounter::new("vm_lazy_loads");
/// Anonymous pages restored from swap
pub static C_VM_SWAP_INS: VmCounter = VmCounter::new("vm_swap_ins");
/// Anonymous pages written to swap
pub static C_VM_SWAP_OUTS: VmCounter = VmCounter::new("vm_swap_outs");
/// Frames reclaimed by the clock
pub static C_VM_EVICTIONS: VmCounter = VmCounter::new("vm_evictions");
/// Dirty file pages written back
pub static C_VM_FILE_WRITEBACKS: VmCounter = VmCounter::new("vm_file_writebacks");
/// Address spaces duplicated
pub static C_VM_FORKS: VmCounter = VmCounter::new("vm_forks");

// ============================================================================
// Counter Macros (compile-time switchable)
// ============================================================================

/// Whether counters are enabled
pub const VM_COUNTERS_ENABLED: bool = true;

/// Increment counter (only if counters enabled)
#[macro_export]
macro_rules! counter {
    ($counter:expr) => {
        if $crate::kern::counters::VM_COUNTERS_ENABLED {
            $counter.inc();
        }
    };
}

// ============================================================================
// Snapshots
// ============================================================================

/// All counter values at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub faults: u64,
    pub fatal_faults: u64,
    pub stack_growths: u64,
    pub lazy_loads: u64,
    pub swap_ins: u64,
    pub swap_outs: u64,
    pub evictions: u64,
    pub file_writebacks: u64,
    pub forks: u64,
}

impl CounterSnapshot {
    /// Take a snapshot of all counters
    pub fn capture() -> Self {
        Self {
            faults: C_VM_FAULTS.get(),
            fatal_faults: C_VM_FATAL_FAULTS.get(),
            stack_growths: C_VM_STACK_GROWTHS.get(),
            lazy_loads: C_VM_LAZY_LOADS.get(),
            swap_ins: C_VM_SWAP_INS.get(),
            swap_outs: C_VM_SWAP_OUTS.get(),
            evictions: C_VM_EVICTIONS.get(),
            file_writebacks: C_VM_FILE_WRITEBACKS.get(),
            forks: C_VM_FORKS.get(),
        }
    }

    /// Counts accumulated since `earlier`
    pub fn since(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            faults: self.faults - earlier.faults,
            fatal_faults: self.fatal_faults - earlier.fatal_faults,
            stack_growths: self.stack_growths - earlier.stack_growths,
            lazy_loads: self.lazy_loads - earlier.lazy_loads,
            swap_ins: self.swap_ins - earlier.swap_ins,
            swap_outs: self.swap_outs - earlier.swap_outs,
            evictions: self.evictions - earlier.evictions,
            file_writebacks: self.file_writebacks - earlier.file_writebacks,
            forks: self.forks - earlier.forks,
        }
    }
}

/// Take a snapshot of all counters
pub fn snapshot() -> CounterSnapshot {
    CounterSnapshot::capture()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        let counter = VmCounter::new("test");
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
        assert_eq!(counter.name(), "test");
    }

    #[test]
    fn test_snapshot_delta() {
        let before = snapshot();
        counter!(C_VM_FORKS);
        let delta = snapshot().since(&before);
        assert!(delta.forks >= 1);
    }
}
