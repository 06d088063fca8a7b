//! File-Backed Pages and File Mappings
//!
//! A file-backed page mirrors `read_bytes` of a file starting at `offset`;
//! the rest of the page is zero. Clean pages are simply dropped on
//! eviction and read again later. Dirty pages of a writable mapping are
//! written back, never past `read_bytes`, so a mapping cannot grow its file.
//!
//! `mmap` registers one lazy file-backed page per page of the request and
//! records the region so `munmap` and teardown can find every page again.
//! Each region holds its own reopened handle.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::counter;
use crate::kern::counters::C_VM_FILE_WRITEBACKS;
use crate::vm::memory_object::BackingFile;
use crate::vm::vm_error::VmError;
use crate::vm::vm_map::{page_range, page_span, AddressSpace};
use crate::vm::vm_page::{LazyLoad, PageType};
use crate::vm::vm_param::{is_page_aligned, is_user_vaddr, KERN_BASE, PAGE_SIZE, USER_STACK};
use crate::vm::vm_phys::FrameData;

// ============================================================================
// File Page
// ============================================================================

/// File-backed page state
pub struct FilePage {
    file: Arc<dyn BackingFile>,
    offset: u64,
    read_bytes: usize,
    zero_bytes: usize,
}

impl FilePage {
    /// Page mirroring the range described by `init`
    pub fn from_descriptor(init: &LazyLoad) -> Self {
        Self {
            file: init.file.clone(),
            offset: init.offset,
            read_bytes: init.read_bytes,
            zero_bytes: init.zero_bytes,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    /// Re-read the range from the file
    pub fn swap_in(&mut self, frame: &mut FrameData) -> Result<(), VmError> {
        let (head, tail) = frame.split_at_mut(self.read_bytes);
        if self.file.read_at(head, self.offset) != self.read_bytes {
            return Err(VmError::FileIo);
        }
        tail.fill(0);
        Ok(())
    }

    /// Write the range back if the page is writable and was written
    pub fn swap_out(&mut self, frame: &FrameData, writable: bool, dirty: bool) -> Result<(), VmError> {
        if !(writable && dirty) {
            return Ok(());
        }
        if self.file.write_at(&frame[..self.read_bytes], self.offset) != self.read_bytes {
            return Err(VmError::FileIo);
        }
        counter!(C_VM_FILE_WRITEBACKS);
        Ok(())
    }

    /// Descriptor producing this page's contents from the file
    pub fn descriptor(&self) -> LazyLoad {
        LazyLoad {
            file: self.file.clone(),
            offset: self.offset,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
        }
    }
}

impl core::fmt::Debug for FilePage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FilePage")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .finish()
    }
}

// ============================================================================
// Mapping Regions
// ============================================================================

/// One live `mmap`
#[derive(Clone)]
pub struct MmapRegion {
    /// First mapped page
    pub start: u64,
    /// Pages in the mapping
    pub page_count: u64,
    /// Handle owned by the mapping
    pub file: Arc<dyn BackingFile>,
}

impl MmapRegion {
    pub fn end(&self) -> u64 {
        self.start + self.page_count * PAGE_SIZE as u64
    }

    pub fn contains(&self, va: u64) -> bool {
        va >= self.start && va < self.end()
    }

    pub fn pages(&self) -> impl Iterator<Item = u64> {
        page_range(self.start, self.page_count)
    }
}

impl core::fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmapRegion")
            .field("start", &format_args!("{:#x}", self.start))
            .field("page_count", &self.page_count)
            .finish()
    }
}

impl AddressSpace {
    /// Map `length` bytes of `file` from `offset` at `addr`. Bytes past the
    /// end of the file read as zero. Returns the mapped address.
    pub fn mmap(
        &self,
        addr: u64,
        length: usize,
        writable: bool,
        file: &Arc<dyn BackingFile>,
        offset: u64,
    ) -> Result<u64, VmError> {
        if addr == 0 || !is_page_aligned(addr) || !is_user_vaddr(addr) {
            return Err(VmError::BadAddress);
        }
        if length == 0 || offset % PAGE_SIZE as u64 != 0 {
            return Err(VmError::InvalidArgument);
        }

        let page_count = page_span(length as u64);
        let end = addr
            .checked_add(page_count * PAGE_SIZE as u64)
            .filter(|&end| end <= KERN_BASE)
            .ok_or(VmError::BadAddress)?;

        offset
            .checked_add(page_count * PAGE_SIZE as u64)
            .ok_or(VmError::InvalidArgument)?;

        let handle = file.reopen();
        let file_len = handle.length();
        if file_len == 0 {
            return Err(VmError::InvalidArgument);
        }

        let mut mmaps = self.mmaps.lock();
        let stack_low = USER_STACK.saturating_sub(self.system().config().stack_limit);
        if addr < USER_STACK && end > stack_low {
            return Err(VmError::DuplicateMapping);
        }
        if page_range(addr, page_count).any(|va| self.spt.lock().contains(va)) {
            return Err(VmError::DuplicateMapping);
        }

        let mut read_left = (length as u64).min(file_len.saturating_sub(offset)) as usize;
        let mut registered = Vec::new();
        let mut ofs = offset;
        for va in page_range(addr, page_count) {
            let page_read = read_left.min(PAGE_SIZE);
            let init = LazyLoad::new(handle.clone(), ofs, page_read, PAGE_SIZE - page_read).map(Arc::new);
            let added = init.and_then(|init| self.allocate_lazy_page(PageType::File, va, writable, Some(init)));
            if let Err(e) = added {
                for va in registered {
                    let _ = self.remove_page(va);
                }
                return Err(e);
            }
            registered.push(va);
            read_left -= page_read;
            ofs += PAGE_SIZE as u64;
        }

        mmaps.insert(
            addr,
            MmapRegion {
                start: addr,
                page_count,
                file: handle,
            },
        );
        Ok(addr)
    }

    /// Remove the mapping starting at `addr`, writing dirty pages back
    pub fn munmap(&self, addr: u64) -> Result<(), VmError> {
        let region = self.mmaps.lock().remove(&addr).ok_or(VmError::NotMapped)?;
        self.unmap_region(&region)
    }

    pub(crate) fn unmap_region(&self, region: &MmapRegion) -> Result<(), VmError> {
        let mut worst = None;
        for va in region.pages() {
            match self.remove_page(va) {
                Ok(()) | Err(VmError::NotMapped) => {}
                Err(e) => worst = VmError::worst(worst, e),
            }
        }
        match worst {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Mapping covering `va`
    pub fn region_at(&self, va: u64) -> Option<MmapRegion> {
        self.mmaps
            .lock()
            .values()
            .find(|region| region.contains(va))
            .cloned()
    }
}
