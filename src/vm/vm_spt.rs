//! Supplemental Page Table
//!
//! Per-address-space record of which virtual pages exist and how they are
//! backed, whether or not a hardware mapping is currently installed.
//! Keyed by page-aligned virtual address; keys are unique.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::vm::vm_error::VmError;
use crate::vm::vm_page::{Page, PageRef};
use crate::vm::vm_param::trunc_page;

/// virtual page -> page
#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<u64, PageRef>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page containing `va`
    pub fn find(&self, va: u64) -> Option<PageRef> {
        self.pages.get(&trunc_page(va)).cloned()
    }

    /// Add `page`. An occupied key is never overwritten.
    pub fn insert(&mut self, page: Page) -> Result<PageRef, VmError> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(VmError::DuplicateMapping);
        }
        let page = Arc::new(Mutex::new(page));
        self.pages.insert(va, page.clone());
        Ok(page)
    }

    /// Detach the page containing `va`; destroying it is the caller's job
    pub fn remove(&mut self, va: u64) -> Option<PageRef> {
        self.pages.remove(&trunc_page(va))
    }

    pub fn contains(&self, va: u64) -> bool {
        self.pages.contains_key(&trunc_page(va))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Entries in ascending address order
    pub fn iter(&self) -> impl Iterator<Item = (u64, &PageRef)> + '_ {
        self.pages.iter().map(|(va, page)| (*va, page))
    }

    /// Detach every entry, in ascending address order
    pub fn drain(&mut self) -> Vec<PageRef> {
        core::mem::take(&mut self.pages).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::vm_page::{PageFlags, PageType};

    fn anon(va: u64) -> Page {
        Page::new_uninit(va, PageType::Anon, PageFlags::WRITABLE, None)
    }

    #[test]
    fn test_find_rounds_down() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(anon(0x40_0000)).unwrap();
        assert!(spt.find(0x40_0fff).is_some());
        assert!(spt.find(0x40_1000).is_none());
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut spt = SupplementalPageTable::new();
        let first = spt.insert(anon(0x1000)).unwrap();
        assert_eq!(spt.insert(anon(0x1000)).map(|_| ()), Err(VmError::DuplicateMapping));
        // The original entry survives
        assert!(Arc::ptr_eq(&spt.find(0x1000).unwrap(), &first));
    }

    #[test]
    fn test_remove_and_drain() {
        let mut spt = SupplementalPageTable::new();
        for va in [0x3000, 0x1000, 0x2000] {
            spt.insert(anon(va)).unwrap();
        }
        assert!(spt.remove(0x2010).is_some());
        assert!(!spt.contains(0x2000));

        let order: Vec<u64> = spt.iter().map(|(va, _)| va).collect();
        assert_eq!(order, [0x1000, 0x3000]);
        assert_eq!(spt.drain().len(), 2);
        assert!(spt.is_empty());
    }
}
