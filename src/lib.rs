//! demand_pager - Demand-paged virtual memory for a teaching kernel
//!
//! Resolves page faults, backs virtual pages with lazily loaded executable
//! segments, anonymous memory and file mappings, manages a bounded frame
//! pool with eviction to swap, and duplicates address spaces on fork.
//!
//! The MMU, the swap block device and the file system are reached through
//! the [`vm::Pmap`], [`vm::BlockDevice`] and [`vm::BackingFile`] traits.

#![cfg_attr(not(test), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod types;

pub mod console;
pub mod kern;
pub mod vm;

use alloc::boxed::Box;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "demand_pager";

/// Bring up console and the VM subsystem at kernel start
pub fn init(config: vm::VmConfig, swap_device: Box<dyn vm::BlockDevice>) {
    console::init();
    vm::init(config, swap_device);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "demand_pager");
        assert!(!VERSION.is_empty());
    }
}
