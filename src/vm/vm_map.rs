//! VM Map - Address Space Management
//!
//! An [`AddressSpace`] is one process's view of memory: its supplemental
//! page table, the pmap holding its hardware mappings, the stack watermark,
//! the file mappings it has made and the executable it runs.
//!
//! Lock order, outermost first:
//! stack → mmaps → spt → page → frame table / frame memory → swap bitmap.
//! The SPT lock is never held while a page lock is taken; lookups clone the
//! page handle out first.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::types::SpaceId;
use crate::vm::memory_object::BackingFile;
use crate::vm::pmap::{Pmap, SoftPmap};
use crate::vm::vm_error::VmError;
use crate::vm::vm_file::MmapRegion;
use crate::vm::vm_page::{LazyLoad, Page, PageFlags, PageRef, PageType};
use crate::vm::vm_param::{
    is_page_aligned, is_user_vaddr, page_offset, round_page, trunc_page, PAGE_SIZE, USER_STACK,
};
use crate::vm::vm_phys::FrameData;
use crate::vm::vm_spt::SupplementalPageTable;
use crate::vm::VmSystem;

/// Stack bookkeeping
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackState {
    /// Lowest stack page; `USER_STACK` while there is no stack
    pub(crate) bottom: u64,
    /// User stack pointer saved at the last kernel entry
    pub(crate) user_rsp: u64,
}

/// Snapshot of one SPT entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub va: u64,
    pub page_type: PageType,
    pub target_type: PageType,
    pub writable: bool,
    pub resident: bool,
    pub stack: bool,
}

/// Virtual address space of one process
pub struct AddressSpace {
    id: SpaceId,
    system: Arc<VmSystem>,
    pmap: Arc<dyn Pmap>,
    pub(crate) spt: Mutex<SupplementalPageTable>,
    pub(crate) stack: Mutex<StackState>,
    pub(crate) mmaps: Mutex<BTreeMap<u64, MmapRegion>>,
    image: Mutex<Option<Arc<dyn BackingFile>>>,
}

impl AddressSpace {
    /// Create an empty address space with a software pmap
    pub fn new(system: Arc<VmSystem>) -> Self {
        Self::with_pmap(system, Arc::new(SoftPmap::new()))
    }

    /// Create an empty address space over `pmap`
    pub fn with_pmap(system: Arc<VmSystem>, pmap: Arc<dyn Pmap>) -> Self {
        Self {
            id: SpaceId::new(),
            system,
            pmap,
            spt: Mutex::new(SupplementalPageTable::new()),
            stack: Mutex::new(StackState {
                bottom: USER_STACK,
                user_rsp: USER_STACK,
            }),
            mmaps: Mutex::new(BTreeMap::new()),
            image: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn system(&self) -> &Arc<VmSystem> {
        &self.system
    }

    pub fn pmap(&self) -> &Arc<dyn Pmap> {
        &self.pmap
    }

    // ========================================================================
    // Page registration
    // ========================================================================

    /// Register a lazy page that becomes `ty` on first fault
    pub fn allocate_lazy_page(
        &self,
        ty: PageType,
        va: u64,
        writable: bool,
        init: Option<Arc<LazyLoad>>,
    ) -> Result<(), VmError> {
        if !is_page_aligned(va) || !is_user_vaddr(va) {
            return Err(VmError::BadAddress);
        }
        match ty {
            PageType::Uninit => return Err(VmError::InvalidArgument),
            PageType::File if init.is_none() => return Err(VmError::NoDescriptor),
            _ => {}
        }
        self.insert_page(Page::new_uninit(va, ty, PageFlags::writable(writable), init))
            .map(|_| ())
    }

    pub(crate) fn insert_page(&self, page: Page) -> Result<PageRef, VmError> {
        let va = page.va();
        if !is_page_aligned(va) || !is_user_vaddr(va) {
            return Err(VmError::BadAddress);
        }
        self.spt.lock().insert(page)
    }

    pub(crate) fn find_page(&self, va: u64) -> Option<PageRef> {
        self.spt.lock().find(va)
    }

    pub(crate) fn allocate_stack_page(&self, va: u64) -> Result<PageRef, VmError> {
        let flags = PageFlags::WRITABLE.union(PageFlags::STACK);
        self.insert_page(Page::new_uninit(va, PageType::Anon, flags, None))
    }

    /// Register an executable segment: one lazy anonymous page per page of
    /// `read_bytes + zero_bytes`, reading `read_bytes` from `file` at
    /// `offset` and zero-filling the rest.
    ///
    /// Pages registered before a failure stay behind for teardown.
    pub fn map_segment(
        &self,
        file: &Arc<dyn BackingFile>,
        offset: u64,
        upage: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        if (read_bytes + zero_bytes) % PAGE_SIZE != 0 || offset % PAGE_SIZE as u64 != 0 {
            return Err(VmError::InvalidArgument);
        }
        if !is_page_aligned(upage) {
            return Err(VmError::BadAddress);
        }

        let (mut read_left, mut zero_left) = (read_bytes, zero_bytes);
        let (mut va, mut ofs) = (upage, offset);
        while read_left > 0 || zero_left > 0 {
            let page_read = read_left.min(PAGE_SIZE);
            let page_zero = PAGE_SIZE - page_read;

            let init = match page_read {
                0 => None,
                _ => Some(Arc::new(LazyLoad::new(file.clone(), ofs, page_read, page_zero)?)),
            };
            self.allocate_lazy_page(PageType::Anon, va, writable, init)?;

            read_left -= page_read;
            zero_left -= page_zero.min(zero_left);
            va += PAGE_SIZE as u64;
            ofs += page_read as u64;
        }
        Ok(())
    }

    /// Keep `file` write-protected until teardown
    pub fn deny_image_writes(&self, file: Arc<dyn BackingFile>) {
        file.deny_write();
        if let Some(previous) = self.image.lock().replace(file) {
            previous.allow_write();
        }
    }

    // ========================================================================
    // Residency
    // ========================================================================

    /// Make the registered page containing `va` resident
    pub fn claim_page(&self, va: u64) -> Result<(), VmError> {
        let page_ref = self.find_page(va).ok_or(VmError::NotMapped)?;
        let mut page = page_ref.lock();
        self.claim_locked(&page_ref, &mut page)
    }

    /// Back `page` with a frame: acquire, load, map, then publish the frame
    /// link. No-op for a resident page. Every failure leaves the page
    /// non-resident with its frame returned.
    pub(crate) fn claim_locked(&self, page_ref: &PageRef, page: &mut Page) -> Result<(), VmError> {
        if page.is_resident() {
            return Ok(());
        }

        let frames = self.system.frames();
        let swap = self.system.swap();
        let frame = frames.acquire(swap)?;
        page.frame = Some(frame.id);

        let loaded = {
            let mut data = frame.memory.lock();
            page.swap_in(&mut **data, swap)
        };
        let mapped = loaded.and_then(|()| {
            self.pmap
                .enter(page.va(), frame.paddr, page.is_writable())
                .map_err(VmError::from)
        });
        if let Err(e) = mapped {
            page.frame = None;
            frames.release(frame.id);
            return Err(e);
        }

        frames.assign(frame.id, page_ref, page.va(), self.pmap.clone());
        Ok(())
    }

    /// Remove the page containing `va`, writing back and freeing whatever
    /// backs it
    pub fn remove_page(&self, va: u64) -> Result<(), VmError> {
        let page = self.spt.lock().remove(va).ok_or(VmError::NotMapped)?;
        self.destroy_page(&page)
    }

    pub(crate) fn destroy_page(&self, page_ref: &PageRef) -> Result<(), VmError> {
        let frames = self.system.frames();
        let swap = self.system.swap();
        let mut page = page_ref.lock();

        let id = match page.frame.take() {
            Some(id) => id,
            None => return page.destroy(None, swap),
        };

        let va = page.va();
        let dirty = self.pmap.is_dirty(va);
        let unmapped = self.pmap.remove(va).map_err(VmError::from);
        let destroyed = match frames.memory(id) {
            Some(memory) => {
                let data = memory.lock();
                page.destroy(Some((&**data, dirty)), swap)
            }
            None => page.destroy(None, swap),
        };
        frames.release(id);

        match (destroyed, unmapped) {
            (Err(a), Err(b)) => Err(VmError::worst(Some(a), b).unwrap_or(a)),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Run `f` on the bytes backing `va`, faulting the page in first.
    /// Marks the page accessed, and dirty for writes.
    pub(crate) fn access<R>(
        &self,
        va: u64,
        write: bool,
        f: impl FnOnce(&mut FrameData, usize) -> R,
    ) -> Result<R, crate::vm::vm_fault::FatalFault> {
        use crate::vm::vm_fault::{FatalFault, PageFault};

        let page_ref = match self.find_page(va) {
            Some(page) => page,
            None => {
                self.handle_fault(&PageFault::kernel(va, write))?;
                self.find_page(va)
                    .ok_or(FatalFault::ResolveFailed(VmError::NotMapped))?
            }
        };

        let mut page = page_ref.lock();
        if write && !page.is_writable() {
            return Err(match page.is_resident() {
                true => FatalFault::WriteProtect,
                false => FatalFault::ReadOnlyWrite,
            });
        }
        self.claim_locked(&page_ref, &mut page)
            .map_err(FatalFault::ResolveFailed)?;

        let id = page.frame().ok_or(FatalFault::ResolveFailed(VmError::NotResident))?;
        let memory = self
            .system
            .frames()
            .memory(id)
            .ok_or(FatalFault::ResolveFailed(VmError::NotResident))?;

        let result = {
            let mut data = memory.lock();
            f(&mut **data, page_offset(va))
        };
        self.pmap.set_accessed(va, true);
        if write {
            self.pmap.set_dirty(va, true);
        }
        Ok(result)
    }

    // ========================================================================
    // Stack
    // ========================================================================

    /// Create and claim the top stack page; returns the initial stack pointer
    pub fn setup_initial_stack(&self) -> Result<u64, VmError> {
        let mut stack = self.stack.lock();
        let va = USER_STACK - PAGE_SIZE as u64;

        let page_ref = self.allocate_stack_page(va)?;
        let claimed = {
            let mut page = page_ref.lock();
            self.claim_locked(&page_ref, &mut page)
        };
        if let Err(e) = claimed {
            self.spt.lock().remove(va);
            return Err(e);
        }

        stack.bottom = stack.bottom.min(va);
        stack.user_rsp = USER_STACK;
        Ok(USER_STACK)
    }

    /// Record the user stack pointer at kernel entry
    pub fn set_user_rsp(&self, rsp: u64) {
        self.stack.lock().user_rsp = rsp;
    }

    pub fn user_rsp(&self) -> u64 {
        self.stack.lock().user_rsp
    }

    /// Lowest stack page, or `USER_STACK` before the stack exists
    pub fn stack_bottom(&self) -> u64 {
        self.stack.lock().bottom
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn page_info(&self, va: u64) -> Option<PageInfo> {
        let page_ref = self.find_page(va)?;
        let page = page_ref.lock();
        Some(PageInfo {
            va: page.va(),
            page_type: page.page_type(),
            target_type: page.target_type(),
            writable: page.is_writable(),
            resident: page.is_resident(),
            stack: page.is_stack(),
        })
    }

    /// Addresses of resident pages, ascending
    pub fn resident_pages(&self) -> Vec<u64> {
        let pages: Vec<PageRef> = self.spt.lock().iter().map(|(_, p)| p.clone()).collect();
        pages
            .iter()
            .filter_map(|p| {
                let page = p.lock();
                page.is_resident().then(|| page.va())
            })
            .collect()
    }

    pub fn page_count(&self) -> usize {
        self.spt.lock().len()
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Destroy every page, release every frame and swap slot, and drop the
    /// executable's write denial. Keeps going past failures and reports the
    /// worst one. Safe to call more than once.
    pub fn teardown(&self) -> Result<(), VmError> {
        let mut worst = None;

        let regions: Vec<MmapRegion> = {
            let mut mmaps = self.mmaps.lock();
            core::mem::take(&mut *mmaps).into_values().collect()
        };
        for region in regions {
            if let Err(e) = self.unmap_region(&region) {
                worst = VmError::worst(worst, e);
            }
        }

        let pages = self.spt.lock().drain();
        for page in pages {
            if let Err(e) = self.destroy_page(&page) {
                worst = VmError::worst(worst, e);
            }
        }

        if let Some(image) = self.image.lock().take() {
            image.allow_write();
        }
        self.stack.lock().bottom = USER_STACK;

        match worst {
            Some(e) => {
                crate::println!("vm_map: teardown of space {} reported {}", self.id, e);
                Err(e)
            }
            None => Ok(()),
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("pages", &self.page_count())
            .finish()
    }
}

/// Round `len` bytes starting at a page boundary up to whole pages
pub(crate) fn page_span(len: u64) -> u64 {
    round_page(len) / PAGE_SIZE as u64
}

/// Page-aligned addresses `[start, start + pages * PAGE_SIZE)`
pub(crate) fn page_range(start: u64, pages: u64) -> impl Iterator<Item = u64> {
    (0..pages).map(move |i| trunc_page(start) + i * PAGE_SIZE as u64)
}
