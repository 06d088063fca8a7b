//! VM Errors
//!
//! Failure values returned by every fallible VM operation. Low-level
//! failures travel up unchanged; only the fault resolver and the fork path
//! decide what the process sees.

use core::fmt;

use crate::vm::pmap::PmapError;

/// VM operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// An SPT entry already exists at that virtual page
    DuplicateMapping,
    /// No SPT entry (or mapping region) at that address
    NotMapped,
    /// Address is outside user space, null or misaligned
    BadAddress,
    /// Frame pool exhausted and no victim could be evicted
    OutOfFrames,
    /// Every swap slot is in use
    SwapFull,
    /// Swap device read or write failed
    SwapIo,
    /// Backing file transferred fewer bytes than required
    FileIo,
    /// Hardware mapping operation failed
    Pmap(PmapError),
    /// File-backed page created without a lazy-load descriptor
    NoDescriptor,
    /// Operation needs a resident page
    NotResident,
    /// Malformed request (length, alignment, empty file)
    InvalidArgument,
}

impl VmError {
    /// Rank used when several failures have to be reported as one.
    ///
    /// Lost data (I/O) outranks lost resources, which outranks caller mistakes.
    pub fn severity(&self) -> u8 {
        match self {
            VmError::SwapIo | VmError::FileIo => 4,
            VmError::Pmap(_) => 3,
            VmError::OutOfFrames | VmError::SwapFull => 2,
            VmError::NotResident | VmError::NoDescriptor => 1,
            VmError::DuplicateMapping
            | VmError::NotMapped
            | VmError::BadAddress
            | VmError::InvalidArgument => 0,
        }
    }

    /// Keep whichever of two outcomes is worse
    pub fn worst(current: Option<VmError>, next: VmError) -> Option<VmError> {
        match current {
            Some(cur) if cur.severity() >= next.severity() => Some(cur),
            _ => Some(next),
        }
    }
}

impl From<PmapError> for VmError {
    fn from(err: PmapError) -> Self {
        VmError::Pmap(err)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::DuplicateMapping => write!(f, "page already mapped"),
            VmError::NotMapped => write!(f, "no page at address"),
            VmError::BadAddress => write!(f, "bad user address"),
            VmError::OutOfFrames => write!(f, "out of physical frames"),
            VmError::SwapFull => write!(f, "swap space exhausted"),
            VmError::SwapIo => write!(f, "swap device I/O error"),
            VmError::FileIo => write!(f, "short file transfer"),
            VmError::Pmap(e) => write!(f, "pmap: {:?}", e),
            VmError::NoDescriptor => write!(f, "missing lazy-load descriptor"),
            VmError::NotResident => write!(f, "page not resident"),
            VmError::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_keeps_highest_severity() {
        let mut acc = None;
        acc = VmError::worst(acc, VmError::NotMapped);
        acc = VmError::worst(acc, VmError::FileIo);
        acc = VmError::worst(acc, VmError::OutOfFrames);
        assert_eq!(acc, Some(VmError::FileIo));
    }

    #[test]
    fn test_pmap_conversion() {
        let err: VmError = PmapError::AlreadyMapped.into();
        assert_eq!(err, VmError::Pmap(PmapError::AlreadyMapped));
    }
}
