//! VM Fault - Page Fault Handling
//!
//! Entered once per hardware page fault. Resolution order:
//!
//! 1. Kernel address: fatal.
//! 2. Protection violation on a present page: fatal (no page is ever
//!    shared copy-on-write, so a write to a read-only mapping is a bug in
//!    the process).
//! 3. Not present with an SPT entry: claim the page.
//! 4. Not present without an entry: grow the stack if the access is a
//!    stack access, otherwise fatal.
//!
//! A resolved fault re-executes the faulting instruction; a fatal one ends
//! the process with [`FatalFault::exit_status`].
//!
//! ## Stack growth
//!
//! A fault at `a` with stack pointer `rsp` grows the stack iff
//!
//! ```text
//! USER_STACK - stack_limit <= a < USER_STACK   and   a + STACK_SLACK >= rsp
//! ```
//!
//! `STACK_SLACK` covers `push`, which faults one word below `rsp` before
//! moving it. Kernel-mode faults on user addresses use the stack pointer
//! saved at kernel entry, never the kernel's own.

use core::fmt;

use crate::counter;
use crate::kern::counters::{C_VM_FATAL_FAULTS, C_VM_FAULTS, C_VM_STACK_GROWTHS};
use crate::vm::vm_error::VmError;
use crate::vm::vm_map::AddressSpace;
use crate::vm::vm_param::{is_kernel_vaddr, trunc_page, PAGE_SIZE, STACK_SLACK, USER_STACK};

// ============================================================================
// Fault Description
// ============================================================================

/// A hardware page fault as reported by the trap layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting address
    pub addr: u64,
    /// Raised by user-mode code
    pub user: bool,
    /// Access was a write
    pub write: bool,
    /// Page not present (as opposed to a protection violation)
    pub not_present: bool,
    /// Stack pointer at the time of the fault
    pub rsp: u64,
}

impl PageFault {
    /// User-mode fault
    pub fn user(addr: u64, write: bool, not_present: bool, rsp: u64) -> Self {
        Self {
            addr,
            user: true,
            write,
            not_present,
            rsp,
        }
    }

    /// Not-present fault taken by the kernel while touching user memory
    pub fn kernel(addr: u64, write: bool) -> Self {
        Self {
            addr,
            user: false,
            write,
            not_present: true,
            rsp: 0,
        }
    }
}

/// Result of a resolved fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A registered page was made resident
    Claimed,
    /// The stack grew to cover the address
    StackGrown,
    /// Another thread resolved the same page first
    AlreadyResident,
}

/// Fault that ends the faulting process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalFault {
    /// Address in kernel space
    KernelAddress,
    /// Write to a present read-only page
    WriteProtect,
    /// Write fault on a registered page that is not writable
    ReadOnlyWrite,
    /// No page registered and not a stack access
    Unmapped,
    /// Stack access beyond the maximum stack size
    StackLimit,
    /// Fault shape the resolver does not handle
    Unrecoverable,
    /// A recoverable fault whose resolution failed
    ResolveFailed(VmError),
}

impl FatalFault {
    /// Exit status of the terminated process
    pub fn exit_status(&self) -> i32 {
        -1
    }
}

impl fmt::Display for FatalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalFault::KernelAddress => write!(f, "kernel address"),
            FatalFault::WriteProtect => write!(f, "write to read-only page"),
            FatalFault::ReadOnlyWrite => write!(f, "write fault on read-only page"),
            FatalFault::Unmapped => write!(f, "unmapped address"),
            FatalFault::StackLimit => write!(f, "stack limit exceeded"),
            FatalFault::Unrecoverable => write!(f, "unrecoverable fault"),
            FatalFault::ResolveFailed(e) => write!(f, "resolution failed: {}", e),
        }
    }
}

impl From<VmError> for FatalFault {
    fn from(err: VmError) -> Self {
        FatalFault::ResolveFailed(err)
    }
}

// ============================================================================
// Fault Resolution
// ============================================================================

impl AddressSpace {
    /// Resolve a page fault in this address space
    pub fn handle_fault(&self, fault: &PageFault) -> Result<FaultOutcome, FatalFault> {
        counter!(C_VM_FAULTS);
        let result = self.resolve_fault(fault);
        if let Err(fatal) = &result {
            counter!(C_VM_FATAL_FAULTS);
            crate::println!(
                "vm_fault: space {}: fatal {} at {:#x} ({}, {})",
                self.id(),
                fatal,
                fault.addr,
                if fault.user { "user" } else { "kernel" },
                if fault.write { "write" } else { "read" }
            );
        }
        result
    }

    fn resolve_fault(&self, fault: &PageFault) -> Result<FaultOutcome, FatalFault> {
        if is_kernel_vaddr(fault.addr) {
            return Err(FatalFault::KernelAddress);
        }
        if !fault.not_present {
            return Err(match fault.write {
                true => FatalFault::WriteProtect,
                false => FatalFault::Unrecoverable,
            });
        }

        if let Some(page_ref) = self.find_page(fault.addr) {
            let mut page = page_ref.lock();
            if fault.write && !page.is_writable() {
                return Err(FatalFault::ReadOnlyWrite);
            }
            if page.is_resident() {
                return Ok(FaultOutcome::AlreadyResident);
            }
            self.claim_locked(&page_ref, &mut page)?;
            return Ok(FaultOutcome::Claimed);
        }

        let rsp = match fault.user {
            true => fault.rsp,
            false => self.user_rsp(),
        };
        if !self.is_stack_access(fault.addr, rsp) {
            return Err(match self.near_stack_pointer(fault.addr, rsp) {
                true => FatalFault::StackLimit,
                false => FatalFault::Unmapped,
            });
        }
        self.grow_stack(fault.addr)?;
        Ok(FaultOutcome::StackGrown)
    }

    /// Whether a not-present fault at `addr` with stack pointer `rsp`
    /// should grow the stack
    pub fn is_stack_access(&self, addr: u64, rsp: u64) -> bool {
        let limit = self.system().config().stack_limit;
        addr >= USER_STACK.saturating_sub(limit)
            && addr < USER_STACK
            && self.near_stack_pointer(addr, rsp)
    }

    fn near_stack_pointer(&self, addr: u64, rsp: u64) -> bool {
        addr < USER_STACK && addr.saturating_add(STACK_SLACK) >= rsp
    }

    /// Extend the stack down to the page containing `addr`, claiming each
    /// new page
    pub(crate) fn grow_stack(&self, addr: u64) -> Result<(), VmError> {
        let target = trunc_page(addr);
        let mut stack = self.stack.lock();

        while stack.bottom > target {
            let va = stack.bottom - PAGE_SIZE as u64;
            if self.find_page(va).is_none() {
                self.allocate_stack_page(va)?;
            }
            self.claim_page(va)?;
            stack.bottom = va;
            counter!(C_VM_STACK_GROWTHS);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::counters;
    use crate::vm::memory_object::{BackingFile, MemFile};
    use crate::vm::vm_page::{LazyLoad, PageType};
    use crate::vm::vm_param::KERN_BASE;
    use crate::vm::vm_swap::RamDisk;
    use crate::vm::{VmConfig, VmSystem};
    use alloc::boxed::Box;
    use alloc::sync::Arc;

    fn space(frames: usize) -> AddressSpace {
        let system = VmSystem::new(
            VmConfig {
                frame_count: frames,
                ..VmConfig::default()
            },
            Box::new(RamDisk::with_slots(32)),
        );
        AddressSpace::new(system)
    }

    #[test]
    fn test_stack_growth_just_below_rsp() {
        let space = space(4);
        let rsp = space.setup_initial_stack().unwrap() - PAGE_SIZE as u64;
        let addr = rsp - 4;

        let outcome = space.handle_fault(&PageFault::user(addr, true, true, rsp));
        assert_eq!(outcome, Ok(FaultOutcome::StackGrown));

        let expected = trunc_page(rsp) - PAGE_SIZE as u64;
        let info = space.page_info(addr).unwrap();
        assert_eq!(info.va, expected);
        assert!(info.resident && info.stack);
        assert_eq!(info.page_type, PageType::Anon);
        assert_eq!(space.stack_bottom(), expected);
    }

    #[test]
    fn test_far_below_stack_is_fatal() {
        let space = space(4);
        let rsp = space.setup_initial_stack().unwrap() - 16;
        let pages = space.page_count();

        let outcome = space.handle_fault(&PageFault::user(rsp - 200_000, false, true, rsp));
        assert_eq!(outcome, Err(FatalFault::Unmapped));
        assert_eq!(outcome.unwrap_err().exit_status(), -1);
        assert_eq!(space.page_count(), pages);
    }

    #[test]
    fn test_stack_limit_is_fatal() {
        let space = space(4);
        let limit = space.system().config().stack_limit;
        let addr = USER_STACK - limit - 8;
        let outcome = space.handle_fault(&PageFault::user(addr, true, true, addr));
        assert_eq!(outcome, Err(FatalFault::StackLimit));
        assert!(space.page_info(addr).is_none());
    }

    #[test]
    fn test_stack_window_boundaries() {
        let space = space(1);
        let limit = space.system().config().stack_limit;
        let low = USER_STACK - limit;

        assert!(space.is_stack_access(low, low));
        assert!(!space.is_stack_access(low - 1, low - 1));
        assert!(space.is_stack_access(low + 100, low + 100 + STACK_SLACK));
        assert!(!space.is_stack_access(low + 100, low + 101 + STACK_SLACK));
        assert!(!space.is_stack_access(USER_STACK, USER_STACK));
    }

    #[test]
    fn test_kernel_address_is_fatal() {
        let space = space(1);
        let outcome = space.handle_fault(&PageFault::user(KERN_BASE + 0x1000, false, true, USER_STACK));
        assert_eq!(outcome, Err(FatalFault::KernelAddress));
    }

    #[test]
    fn test_write_protect_is_fatal() {
        let space = space(2);
        space.allocate_lazy_page(PageType::Anon, 0x1000, false, None).unwrap();
        space.claim_page(0x1000).unwrap();

        let outcome = space.handle_fault(&PageFault::user(0x1000, true, false, USER_STACK));
        assert_eq!(outcome, Err(FatalFault::WriteProtect));
        assert!(crate::console::backlog_contains("write to read-only page"));

        let read = space.handle_fault(&PageFault::user(0x1000, false, false, USER_STACK));
        assert_eq!(read, Err(FatalFault::Unrecoverable));
    }

    #[test]
    fn test_write_fault_on_read_only_lazy_page() {
        let space = space(2);
        space.allocate_lazy_page(PageType::Anon, 0x1000, false, None).unwrap();
        let outcome = space.handle_fault(&PageFault::user(0x1000, true, true, USER_STACK));
        assert_eq!(outcome, Err(FatalFault::ReadOnlyWrite));
        assert!(!space.page_info(0x1000).unwrap().resident);
    }

    #[test]
    fn test_lazy_load_runs_once() {
        let space = space(4);
        let file = MemFile::new(&[5u8; PAGE_SIZE]);
        let init = Arc::new(LazyLoad::new(file.handle(), 0, PAGE_SIZE, 0).unwrap());
        space.allocate_lazy_page(PageType::Anon, 0x40_0000, false, Some(init)).unwrap();

        let before = counters::snapshot();
        let fault = PageFault::user(0x40_0010, false, true, USER_STACK);
        assert_eq!(space.handle_fault(&fault), Ok(FaultOutcome::Claimed));
        assert_eq!(space.handle_fault(&fault), Ok(FaultOutcome::AlreadyResident));
        let delta = counters::snapshot().since(&before);
        assert!(delta.lazy_loads >= 1);

        let info = space.page_info(0x40_0000).unwrap();
        assert_eq!(info.page_type, PageType::Anon);
        // Rewriting the file cannot reach the page any more
        file.write_at(&[9], 0x10);
        assert_eq!(space.access(0x40_0010, false, |data, off| data[off]), Ok(5));
    }

    #[test]
    fn test_failed_claim_is_fatal() {
        let space = space(1);
        let file = MemFile::new(&[]);
        let init = Arc::new(LazyLoad::new(file.handle(), 0, 16, PAGE_SIZE - 16).unwrap());
        space.allocate_lazy_page(PageType::Anon, 0x1000, false, Some(init)).unwrap();
        let outcome = space.handle_fault(&PageFault::user(0x1000, false, true, USER_STACK));
        assert_eq!(outcome, Err(FatalFault::ResolveFailed(VmError::FileIo)));
    }

    #[test]
    fn test_kernel_fault_uses_saved_rsp() {
        let space = space(4);
        let rsp = space.setup_initial_stack().unwrap() - PAGE_SIZE as u64 - 32;
        space.set_user_rsp(rsp);
        let outcome = space.handle_fault(&PageFault::kernel(rsp, true));
        assert_eq!(outcome, Ok(FaultOutcome::StackGrown));
    }

    #[test]
    fn test_concurrent_faults_on_one_page() {
        use std::thread;

        let space = Arc::new(space(4));
        let file = MemFile::new(&[3u8; PAGE_SIZE]);
        let init = Arc::new(LazyLoad::new(file.handle(), 0, PAGE_SIZE, 0).unwrap());
        space.allocate_lazy_page(PageType::Anon, 0x40_0000, true, Some(init)).unwrap();

        let handles: alloc::vec::Vec<_> = (0..4)
            .map(|_| {
                let space = space.clone();
                thread::spawn(move || space.handle_fault(&PageFault::user(0x40_0000, false, true, USER_STACK)))
            })
            .collect();
        let outcomes: alloc::vec::Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let claimed = outcomes.iter().filter(|o| **o == Ok(FaultOutcome::Claimed)).count();
        assert_eq!(claimed, 1);
        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert_eq!(space.system().frames().stats().resident, 1);
    }
}
