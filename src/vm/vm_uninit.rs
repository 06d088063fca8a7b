//! Uninitialized Pages
//!
//! Every page starts here. The first swap-in runs the lazy-load descriptor
//! (or zero-fills when there is none) and hands back the page's permanent
//! variant.

use alloc::sync::Arc;

use crate::counter;
use crate::kern::counters::C_VM_LAZY_LOADS;
use crate::vm::vm_anon::AnonPage;
use crate::vm::vm_error::VmError;
use crate::vm::vm_file::FilePage;
use crate::vm::vm_page::{LazyLoad, PageKind, PageType};
use crate::vm::vm_phys::FrameData;

/// Pending page state
#[derive(Debug)]
pub struct UninitPage {
    /// Variant after materialization
    target: PageType,
    /// Initial contents; `None` means zero-fill
    init: Option<Arc<LazyLoad>>,
}

impl UninitPage {
    pub fn new(target: PageType, init: Option<Arc<LazyLoad>>) -> Self {
        Self { target, init }
    }

    pub fn target(&self) -> PageType {
        self.target
    }

    pub fn init(&self) -> Option<&Arc<LazyLoad>> {
        self.init.as_ref()
    }

    /// Materialize into `frame` and return the variant the page becomes
    pub fn swap_in(&mut self, frame: &mut FrameData) -> Result<PageKind, VmError> {
        match &self.init {
            Some(init) => {
                init.load(frame)?;
                counter!(C_VM_LAZY_LOADS);
            }
            None => frame.fill(0),
        }

        match self.target {
            PageType::Anon => Ok(PageKind::Anon(AnonPage::new())),
            PageType::File => {
                let init = self.init.as_ref().ok_or(VmError::NoDescriptor)?;
                Ok(PageKind::File(FilePage::from_descriptor(init)))
            }
            PageType::Uninit => Err(VmError::InvalidArgument),
        }
    }

    pub fn destroy(&mut self) {
        self.init = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::memory_object::MemFile;
    use crate::vm::vm_param::PAGE_SIZE;

    #[test]
    fn test_zero_fill_without_descriptor() {
        let mut uninit = UninitPage::new(PageType::Anon, None);
        let mut frame = [0x55u8; PAGE_SIZE];
        let kind = uninit.swap_in(&mut frame).unwrap();
        assert!(matches!(kind, PageKind::Anon(_)));
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_file_target_needs_descriptor() {
        let mut uninit = UninitPage::new(PageType::File, None);
        let mut frame = [0u8; PAGE_SIZE];
        assert!(matches!(uninit.swap_in(&mut frame), Err(VmError::NoDescriptor)));
    }

    #[test]
    fn test_file_target_keeps_range() {
        let file = MemFile::new(&[3u8; 50]);
        let init = Arc::new(LazyLoad::new(file.handle(), 0, 50, PAGE_SIZE - 50).unwrap());
        let mut uninit = UninitPage::new(PageType::File, Some(init));
        let mut frame = [0u8; PAGE_SIZE];
        match uninit.swap_in(&mut frame).unwrap() {
            PageKind::File(page) => assert_eq!(page.read_bytes(), 50),
            other => panic!("unexpected {:?}", other),
        }
    }
}
