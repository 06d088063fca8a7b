//! Kern subsystem - Core kernel services used by the VM
//!
//! Event counters and the user-memory copy routines system calls use.

pub mod copyio;
pub mod counters;

pub use copyio::{copyin, copyout, validate_user_buffer, CopyError, CopyResult};
pub use counters::{snapshot, CounterSnapshot, VmCounter};
