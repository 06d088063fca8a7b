//! VM Page - Virtual Page Backing Policy
//!
//! A [`Page`] records how one virtual page gets its contents, independent of
//! whether a frame currently backs it. The variant is a tagged union over
//! the three page kinds and every page operation is one `match` on it:
//!
//! | operation  | uninit                       | anonymous          | file-backed              |
//! |------------|------------------------------|--------------------|--------------------------|
//! | `swap_in`  | run lazy load, become target | swap slot or zero  | read range, zero tail    |
//! | `swap_out` | not resident                 | write to a slot    | write back if dirty      |
//! | `destroy`  | drop descriptor              | free swap slot     | write back, close handle |
//!
//! A page leaves `uninit` exactly once, inside [`Page::swap_in`].

use alloc::sync::Arc;
use spin::Mutex;

use crate::vm::memory_object::BackingFile;
use crate::vm::vm_anon::AnonPage;
use crate::vm::vm_error::VmError;
use crate::vm::vm_file::FilePage;
use crate::vm::vm_frame::FrameId;
use crate::vm::vm_param::PAGE_SIZE;
use crate::vm::vm_phys::FrameData;
use crate::vm::vm_swap::SwapManager;
use crate::vm::vm_uninit::UninitPage;

// ============================================================================
// Page Type
// ============================================================================

/// Page variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Not yet materialized
    Uninit = 0,
    /// Backed by swap
    Anon = 1,
    /// Backed by a file
    File = 2,
}

// ============================================================================
// Page Flags
// ============================================================================

/// Page attribute flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(u32);

impl PageFlags {
    /// User may write the page
    pub const WRITABLE: Self = Self(0x0001);
    /// Page belongs to the user stack
    pub const STACK: Self = Self(0x0002);

    /// Empty flags
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Get bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Check if contains flags
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union with another flags
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Writable flag from a bool
    pub const fn writable(writable: bool) -> Self {
        if writable {
            Self::WRITABLE
        } else {
            Self::empty()
        }
    }
}

// ============================================================================
// Lazy-Load Descriptor
// ============================================================================

/// How to materialize a page's first contents.
///
/// Immutable once built and shared (`Arc`) between a parent and its forked
/// children, each of which loads its own copy.
pub struct LazyLoad {
    /// Source file
    pub file: Arc<dyn BackingFile>,
    /// Offset of the first byte to read
    pub offset: u64,
    /// Bytes read from the file
    pub read_bytes: usize,
    /// Bytes zero-filled after the read
    pub zero_bytes: usize,
}

impl LazyLoad {
    /// Build a descriptor; `read_bytes + zero_bytes` must be one page
    pub fn new(
        file: Arc<dyn BackingFile>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<Self, VmError> {
        if read_bytes + zero_bytes != PAGE_SIZE {
            return Err(VmError::InvalidArgument);
        }
        Ok(Self {
            file,
            offset,
            read_bytes,
            zero_bytes,
        })
    }

    /// Fill `frame` from the file, zeroing the tail
    pub fn load(&self, frame: &mut FrameData) -> Result<(), VmError> {
        let (head, tail) = frame.split_at_mut(self.read_bytes);
        if self.file.read_at(head, self.offset) != self.read_bytes {
            return Err(VmError::FileIo);
        }
        tail.fill(0);
        Ok(())
    }
}

impl core::fmt::Debug for LazyLoad {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LazyLoad")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish()
    }
}

// ============================================================================
// Page
// ============================================================================

/// Variant-specific state
#[derive(Debug)]
pub enum PageKind {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

/// SPT entry handle; the frame table keeps only a `Weak` to it
pub type PageRef = Arc<Mutex<Page>>;

/// One virtual page of an address space
#[derive(Debug)]
pub struct Page {
    /// Page-aligned virtual address
    va: u64,
    /// Attribute flags
    flags: PageFlags,
    /// Backing frame while resident
    pub(crate) frame: Option<FrameId>,
    /// Variant state
    pub(crate) kind: PageKind,
}

impl Page {
    /// Create a pending page that becomes `target` on first fault
    pub fn new_uninit(
        va: u64,
        target: PageType,
        flags: PageFlags,
        init: Option<Arc<LazyLoad>>,
    ) -> Self {
        Self {
            va,
            flags,
            frame: None,
            kind: PageKind::Uninit(UninitPage::new(target, init)),
        }
    }

    /// Virtual address
    pub fn va(&self) -> u64 {
        self.va
    }

    /// Attribute flags
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Check if page is writable
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PageFlags::WRITABLE)
    }

    /// Check if page belongs to the stack
    pub fn is_stack(&self) -> bool {
        self.flags.contains(PageFlags::STACK)
    }

    /// Backing frame, if resident
    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    /// Check if page is resident
    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Current variant tag
    pub fn page_type(&self) -> PageType {
        match self.kind {
            PageKind::Uninit(_) => PageType::Uninit,
            PageKind::Anon(_) => PageType::Anon,
            PageKind::File(_) => PageType::File,
        }
    }

    /// Type the page has, or will have once materialized
    pub fn target_type(&self) -> PageType {
        match &self.kind {
            PageKind::Uninit(uninit) => uninit.target(),
            _ => self.page_type(),
        }
    }

    /// Populate `frame` with this page's contents
    pub fn swap_in(&mut self, frame: &mut FrameData, swap: &SwapManager) -> Result<(), VmError> {
        match &mut self.kind {
            PageKind::Uninit(uninit) => {
                let kind = uninit.swap_in(frame)?;
                self.kind = kind;
                Ok(())
            }
            PageKind::Anon(anon) => anon.swap_in(frame, swap),
            PageKind::File(file) => file.swap_in(frame),
        }
    }

    /// Persist the contents of `frame` before it is reclaimed
    pub fn swap_out(&mut self, frame: &FrameData, dirty: bool, swap: &SwapManager) -> Result<(), VmError> {
        let writable = self.is_writable();
        match &mut self.kind {
            PageKind::Uninit(_) => Err(VmError::NotResident),
            PageKind::Anon(anon) => anon.swap_out(frame, swap),
            PageKind::File(file) => file.swap_out(frame, writable, dirty),
        }
    }

    /// Release variant resources. `resident` carries the frame contents and
    /// dirty bit when the page is still in memory. The record itself is
    /// freed by whoever drops the last handle.
    pub fn destroy(
        &mut self,
        resident: Option<(&FrameData, bool)>,
        swap: &SwapManager,
    ) -> Result<(), VmError> {
        let writable = self.is_writable();
        match &mut self.kind {
            PageKind::Uninit(uninit) => {
                uninit.destroy();
                Ok(())
            }
            PageKind::Anon(anon) => {
                anon.destroy(swap);
                Ok(())
            }
            PageKind::File(file) => match resident {
                Some((frame, dirty)) => file.swap_out(frame, writable, dirty),
                None => Ok(()),
            },
        }
    }

    /// Descriptor equivalent to this page's backing, for building a copy
    pub(crate) fn descriptor(&self) -> Option<Arc<LazyLoad>> {
        match &self.kind {
            PageKind::Uninit(uninit) => uninit.init().cloned(),
            PageKind::Anon(_) => None,
            PageKind::File(file) => Some(Arc::new(file.descriptor())),
        }
    }
}
