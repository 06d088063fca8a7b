//! Address Space Duplication
//!
//! `fork` gives the child private, eagerly copied pages; nothing is shared
//! copy-on-write. Per parent page:
//!
//! - still uninit: the child registers the same descriptor and loads its
//!   own copy on first fault
//! - stack: the child rebuilds its stack (the top page through
//!   [`AddressSpace::setup_initial_stack`]) and the contents are copied
//! - anything else: the parent page is made resident if it was swapped
//!   out, the child page is claimed, and the frame is copied byte for byte
//!   along with its dirty bit
//!
//! The parent must be quiesced for the duration. On failure the child is
//! left holding whatever it got so far, all of it reachable from its SPT for
//! teardown.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::counter;
use crate::kern::counters::C_VM_FORKS;
use crate::vm::vm_error::VmError;
use crate::vm::vm_file::MmapRegion;
use crate::vm::vm_map::AddressSpace;
use crate::vm::vm_page::{LazyLoad, Page, PageKind, PageRef, PageType};
use crate::vm::vm_param::{PAGE_SIZE, USER_STACK};

/// Make `child` an independent copy of `parent`
pub fn duplicate_address_space(child: &AddressSpace, parent: &AddressSpace) -> Result<(), VmError> {
    let result = copy_pages(child, parent);
    match &result {
        Ok(()) => counter!(C_VM_FORKS),
        Err(e) => crate::println!(
            "vm_fork: duplicating space {} into {} failed: {}",
            parent.id(),
            child.id(),
            e
        ),
    }
    result
}

fn copy_pages(child: &AddressSpace, parent: &AddressSpace) -> Result<(), VmError> {
    // Regions first, so file pages can pick up the child's own handles
    {
        let parent_maps = parent.mmaps.lock();
        let mut child_maps = child.mmaps.lock();
        for (start, region) in parent_maps.iter() {
            child_maps.insert(
                *start,
                MmapRegion {
                    start: region.start,
                    page_count: region.page_count,
                    file: region.file.reopen(),
                },
            );
        }
    }
    child.set_user_rsp(parent.user_rsp());

    let pages: Vec<(u64, PageRef)> = parent
        .spt
        .lock()
        .iter()
        .map(|(va, page)| (va, page.clone()))
        .collect();

    for (va, parent_ref) in pages {
        let mut parent_page = parent_ref.lock();
        let writable = parent_page.is_writable();

        if parent_page.is_stack() {
            copy_stack_page(child, parent, &parent_ref, &mut parent_page)?;
            continue;
        }

        if let PageKind::Uninit(_) = parent_page.kind {
            let init = child_descriptor(child, parent_page.target_type(), va, parent_page.descriptor())?;
            child.allocate_lazy_page(parent_page.target_type(), va, writable, init)?;
            continue;
        }

        let init = child_descriptor(child, parent_page.page_type(), va, parent_page.descriptor())?;
        child.allocate_lazy_page(parent_page.page_type(), va, writable, init)?;
        copy_resident(child, parent, &parent_ref, &mut parent_page)?;
    }
    Ok(())
}

/// Descriptor for the child's copy, rebound to the child's mapping handle
/// for file-backed pages
fn child_descriptor(
    child: &AddressSpace,
    ty: PageType,
    va: u64,
    parent: Option<Arc<LazyLoad>>,
) -> Result<Option<Arc<LazyLoad>>, VmError> {
    let parent = match (ty, parent) {
        (PageType::File, Some(parent)) => parent,
        (_, parent) => return Ok(parent),
    };
    let file = match child.region_at(va) {
        Some(region) => region.file,
        None => parent.file.reopen(),
    };
    LazyLoad::new(file, parent.offset, parent.read_bytes, parent.zero_bytes).map(|d| Some(Arc::new(d)))
}

fn copy_stack_page(
    child: &AddressSpace,
    parent: &AddressSpace,
    parent_ref: &PageRef,
    parent_page: &mut Page,
) -> Result<(), VmError> {
    let va = parent_page.va();
    if va == USER_STACK - PAGE_SIZE as u64 {
        child.setup_initial_stack()?;
        child.set_user_rsp(parent.user_rsp());
    } else {
        child.allocate_stack_page(va)?;
        let mut stack = child.stack.lock();
        stack.bottom = stack.bottom.min(va);
    }

    if let PageKind::Uninit(_) = parent_page.kind {
        return Ok(());
    }
    copy_resident(child, parent, parent_ref, parent_page)
}

/// Copy the parent's frame into a freshly claimed child frame
fn copy_resident(
    child: &AddressSpace,
    parent: &AddressSpace,
    parent_ref: &PageRef,
    parent_page: &mut Page,
) -> Result<(), VmError> {
    let va = parent_page.va();
    parent.claim_locked(parent_ref, parent_page)?;

    let child_ref = child.find_page(va).ok_or(VmError::NotMapped)?;
    let mut child_page = child_ref.lock();
    child.claim_locked(&child_ref, &mut child_page)?;

    let frames = parent.system().frames();
    let src = parent_page
        .frame()
        .and_then(|id| frames.memory(id))
        .ok_or(VmError::NotResident)?;
    let dst = child_page
        .frame()
        .and_then(|id| frames.memory(id))
        .ok_or(VmError::NotResident)?;

    dst.lock().copy_from_slice(&src.lock()[..]);
    if parent.pmap().is_dirty(va) {
        child.pmap().set_dirty(va, true);
    }
    Ok(())
}

impl AddressSpace {
    /// Create a child address space duplicating this one. A failed copy is
    /// torn down before the error is returned.
    pub fn fork(&self) -> Result<AddressSpace, VmError> {
        let child = AddressSpace::new(self.system().clone());
        if let Err(e) = duplicate_address_space(&child, self) {
            let _ = child.teardown();
            return Err(e);
        }
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::memory_object::{BackingFile, MemFile};
    use crate::vm::vm_fault::PageFault;
    use crate::vm::vm_swap::RamDisk;
    use crate::vm::{VmConfig, VmSystem};
    use alloc::boxed::Box;

    fn system(frames: usize, slots: u64) -> Arc<VmSystem> {
        VmSystem::new(
            VmConfig {
                frame_count: frames,
                ..VmConfig::default()
            },
            Box::new(RamDisk::with_slots(slots)),
        )
    }

    fn byte(space: &AddressSpace, va: u64) -> u8 {
        space.access(va, false, |d, o| d[o]).unwrap()
    }

    fn poke(space: &AddressSpace, va: u64, value: u8) {
        space.access(va, true, |d, o| d[o] = value).unwrap();
    }

    #[test]
    fn test_child_pages_are_independent() {
        let parent = AddressSpace::new(system(8, 8));
        parent.setup_initial_stack().unwrap();
        parent.allocate_lazy_page(PageType::Anon, 0x1000, true, None).unwrap();
        poke(&parent, 0x1000, 0x11);
        poke(&parent, USER_STACK - 8, 0x22);

        let child = parent.fork().unwrap();
        assert!(child.pmap().is_dirty(0x1000));
        assert_eq!(byte(&child, 0x1000), 0x11);
        assert_eq!(byte(&child, USER_STACK - 8), 0x22);
        assert!(child.page_info(USER_STACK - 8).unwrap().stack);

        poke(&child, 0x1000, 0x33);
        poke(&parent, USER_STACK - 8, 0x44);
        assert_eq!(byte(&parent, 0x1000), 0x11);
        assert_eq!(byte(&child, USER_STACK - 8), 0x22);
    }

    #[test]
    fn test_lazy_pages_stay_lazy() {
        let file = MemFile::new(&[6u8; PAGE_SIZE]);
        let parent = AddressSpace::new(system(4, 4));
        parent.map_segment(&file.handle(), 0, 0x40_0000, PAGE_SIZE, 0, false).unwrap();

        let child = parent.fork().unwrap();
        let info = child.page_info(0x40_0000).unwrap();
        assert_eq!(info.page_type, PageType::Uninit);
        assert!(!info.resident);
        assert_eq!(byte(&child, 0x40_0000), 6);
        assert_eq!(parent.page_info(0x40_0000).unwrap().page_type, PageType::Uninit);
    }

    #[test]
    fn test_grown_stack_is_copied() {
        let parent = AddressSpace::new(system(8, 8));
        let top = parent.setup_initial_stack().unwrap();
        let deep = top - 2 * PAGE_SIZE as u64 - 16;
        parent
            .handle_fault(&PageFault::user(deep, true, true, deep))
            .unwrap();
        poke(&parent, deep, 0x77);

        let child = parent.fork().unwrap();
        assert_eq!(child.stack_bottom(), parent.stack_bottom());
        assert_eq!(byte(&child, deep), 0x77);
        assert_eq!(child.resident_pages(), parent.resident_pages());
    }

    #[test]
    fn test_swapped_out_parent_page_is_copied() {
        let system = system(2, 8);
        let parent = AddressSpace::new(system.clone());
        for (i, va) in [0x1000u64, 0x2000, 0x3000].iter().enumerate() {
            parent.allocate_lazy_page(PageType::Anon, *va, true, None).unwrap();
            poke(&parent, *va, i as u8 + 1);
        }
        assert!(system.frames().stats().evictions >= 1);
        assert_eq!(parent.resident_pages().len(), 2);

        // Child and parent share two frames, so copying churns through swap
        let child = AddressSpace::new(system.clone());
        duplicate_address_space(&child, &parent).unwrap();
        drop(child);
        assert_eq!(byte(&parent, 0x1000), 1);
        assert_eq!(byte(&parent, 0x2000), 2);
        assert_eq!(byte(&parent, 0x3000), 3);
    }

    #[test]
    fn test_mapping_is_inherited() {
        let file = MemFile::new(&[1u8; 32]);
        let parent = AddressSpace::new(system(4, 4));
        let addr = parent.mmap(0x1000_0000, 32, true, &file.handle(), 0).unwrap();
        poke(&parent, addr, 9);

        let child = parent.fork().unwrap();
        assert!(child.region_at(addr).is_some());
        assert_eq!(byte(&child, addr), 9);
        assert_eq!(byte(&child, addr + 1), 1);

        child.munmap(addr).unwrap();
        assert!(parent.region_at(addr).is_some());
    }

    #[test]
    fn test_failed_fork_leaves_nothing_behind() {
        let system = system(1, 1);
        let parent = AddressSpace::new(system.clone());
        parent.allocate_lazy_page(PageType::Anon, 0x1000, true, None).unwrap();
        poke(&parent, 0x1000, 1);

        // The only frame belongs to the parent page being copied
        assert_eq!(parent.fork().map(|_| ()), Err(VmError::OutOfFrames));
        assert_eq!(system.frames().stats().allocated, 1);
        assert_eq!(byte(&parent, 0x1000), 1);
        assert!(crate::console::backlog_contains("vm_fork: duplicating space"));
    }

    #[test]
    fn test_image_denial_stays_with_parent() {
        let file = MemFile::new(&[0u8; PAGE_SIZE]);
        let parent = AddressSpace::new(system(2, 2));
        parent.deny_image_writes(file.handle());
        let child = parent.fork().unwrap();
        drop(child);
        assert!(file.write_denied());
        drop(parent);
        assert!(!file.write_denied());
    }
}
