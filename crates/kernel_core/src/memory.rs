use hal::{
    is_page_aligned, page_align_up, Access, Errno, FrameAllocator, MemoryMap, PagingOps, PhysAddr,
    Range, Region, VirtAddr, PAGE_SIZE,
};
use log::{debug, trace};

/// One isolated virtual address space.
///
/// Page-table storage is delegated to the architecture adapter `P`. The
/// physical allocator is not owned and is passed to every operation that
/// may allocate or free.
#[derive(Debug)]
pub struct MemoryContext<P: PagingOps> {
    paging: P,
    map: MemoryMap,
    phys_offset: u64,
    active: bool,
}

impl<P: PagingOps> MemoryContext<P> {
    /// Creates an empty address space with the given layout.
    pub fn new<F: FrameAllocator>(map: MemoryMap, frames: &mut F) -> Result<Self, Errno> {
        let paging = P::create(frames)?;
        Ok(Self {
            paging,
            map,
            phys_offset: frames.phys_offset(),
            active: false,
        })
    }

    /// Layout of this address space.
    pub fn memory_map(&self) -> &MemoryMap {
        &self.map
    }

    /// Architecture tables backing this context.
    pub fn paging(&self) -> &P {
        &self.paging
    }

    /// Returns true while this context is loaded in the MMU.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Loads this context into the MMU.
    pub fn activate(&mut self) {
        self.paging.activate();
        self.active = true;
    }

    /// Records that another context was loaded.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    fn flush(&self, virt: VirtAddr) {
        if self.active {
            self.paging.flush(virt);
        }
    }

    /// Maps one page.
    pub fn map<F: FrameAllocator>(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        access: Access,
        frames: &mut F,
    ) -> Result<(), Errno> {
        self.paging.map(virt, phys, access, frames)?;
        self.flush(virt);
        Ok(())
    }

    /// Removes one page mapping. The physical page is not freed.
    pub fn unmap(&mut self, virt: VirtAddr) -> Result<(), Errno> {
        self.paging.unmap(virt)?;
        self.flush(virt);
        Ok(())
    }

    /// Translates a virtual address.
    pub fn lookup(&self, virt: VirtAddr) -> Result<PhysAddr, Errno> {
        self.paging.lookup(virt)
    }

    /// Returns the access flags of the page containing `virt`.
    pub fn access(&self, virt: VirtAddr) -> Result<Access, Errno> {
        self.paging.access(virt)
    }

    fn is_mapped(&self, virt: VirtAddr) -> bool {
        self.paging.lookup(virt).is_ok()
    }

    /// Finds the first run of unmapped pages of `size` bytes in `region`.
    pub fn find_free(&self, size: u64, region: Region) -> Result<VirtAddr, Errno> {
        if size == 0 {
            return Err(Errno::InvalidArgument);
        }
        let window = self.map.range(region);
        let needed = page_align_up(size) / PAGE_SIZE;
        let end = window.base + window.size;
        let mut start = window.base;
        let mut found = 0;
        let mut addr = window.base;

        while addr < end {
            if self.is_mapped(addr) {
                found = 0;
                start = addr + PAGE_SIZE;
            } else {
                found += 1;
                if found == needed {
                    return Ok(start);
                }
            }
            addr += PAGE_SIZE;
        }
        Err(Errno::OutOfMemory)
    }

    /// Maps a contiguous range, allocating physical memory if
    /// `range.phys` is zero.
    ///
    /// On failure every page mapped so far is removed again and any memory
    /// allocated here is released.
    pub fn map_range<F: FrameAllocator>(
        &mut self,
        range: &mut Range,
        frames: &mut F,
    ) -> Result<(), Errno> {
        if range.size == 0 || !is_page_aligned(range.virt) || !is_page_aligned(range.phys) {
            return Err(Errno::InvalidArgument);
        }
        let pages = range.page_count();
        let allocated = range.phys == 0;
        if allocated {
            range.phys = frames.allocate(pages * PAGE_SIZE)?;
        }

        for page in 0..pages {
            let offset = page * PAGE_SIZE;
            if let Err(err) = self.map(range.virt + offset, range.phys + offset, range.access, frames) {
                debug!(target: "mem", "map_range {:#x} failed at page {page}: {err:?}", range.virt);
                for undo in 0..page {
                    let virt = range.virt + undo * PAGE_SIZE;
                    if let Err(unmap) = self.unmap(virt) {
                        debug!(target: "mem", "unwinding {virt:#x} failed: {unmap:?}");
                    }
                }
                if allocated {
                    release_pages(frames, range.phys, pages);
                    range.phys = 0;
                }
                return Err(err);
            }
        }
        trace!(target: "mem", "mapped {:#x}+{:#x} -> {:#x}", range.virt, range.size, range.phys);
        Ok(())
    }

    /// Maps a range backed by independently allocated pages.
    pub fn map_range_sparse<F: FrameAllocator>(
        &mut self,
        range: &Range,
        frames: &mut F,
    ) -> Result<(), Errno> {
        if range.size == 0 || !is_page_aligned(range.virt) {
            return Err(Errno::InvalidArgument);
        }
        for page in 0..range.page_count() {
            let virt = range.virt + page * PAGE_SIZE;
            let mapped = frames.allocate(PAGE_SIZE).and_then(|phys| {
                self.map(virt, phys, range.access, frames).inspect_err(|_| {
                    if let Err(release) = frames.release(phys) {
                        debug!(target: "mem", "returning frame {phys:#x} failed: {release:?}");
                    }
                })
            });
            if let Err(err) = mapped {
                let done = Range::new(range.virt, 0, page * PAGE_SIZE, range.access);
                if let Err(release) = self.release_range(&done, frames) {
                    debug!(target: "mem", "unwinding sparse map at {:#x} failed: {release:?}", range.virt);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Unmaps every page of a range. Physical memory is kept.
    pub fn unmap_range(&mut self, range: &Range) -> Result<(), Errno> {
        if !is_page_aligned(range.virt) {
            return Err(Errno::InvalidArgument);
        }
        for page in 0..range.page_count() {
            self.unmap(range.virt + page * PAGE_SIZE)?;
        }
        Ok(())
    }

    /// Frees the physical page mapped at `virt` without unmapping it.
    pub fn release<F: FrameAllocator>(&mut self, virt: VirtAddr, frames: &mut F) -> Result<(), Errno> {
        let phys = self.lookup(virt)?;
        frames.release(phys - phys % PAGE_SIZE)
    }

    /// Frees and unmaps every mapped page of a range.
    ///
    /// Pages that are not mapped are skipped. Pages outside the managed
    /// physical pool (device windows) are only unmapped.
    pub fn release_range<F: FrameAllocator>(
        &mut self,
        range: &Range,
        frames: &mut F,
    ) -> Result<(), Errno> {
        if !is_page_aligned(range.virt) {
            return Err(Errno::InvalidArgument);
        }
        for page in 0..range.page_count() {
            let virt = range.virt + page * PAGE_SIZE;
            if let Ok(phys) = self.lookup(virt) {
                // Device windows are outside the pool and only unmapped.
                if let Err(err) = frames.release(phys) {
                    trace!(target: "mem", "{virt:#x} -> {phys:#x} not returned: {err:?}");
                }
                self.unmap(virt)?;
            }
        }
        Ok(())
    }

    /// Frees and unmaps everything mapped inside `region`.
    pub fn release_region<F: FrameAllocator>(
        &mut self,
        region: Region,
        frames: &mut F,
    ) -> Result<(), Errno> {
        let window = self.map.range(region);
        let range = Range::new(window.base, 0, window.size, Access::empty());
        self.release_range(&range, frames)
    }

    /// Copies user memory at `virt` into `buf`.
    ///
    /// Every touched page must be mapped user readable.
    pub fn read_bytes(&self, virt: VirtAddr, buf: &mut [u8]) -> Result<(), Errno> {
        let mut done = 0;
        while done < buf.len() {
            let addr = virt.checked_add(done as u64).ok_or(Errno::InvalidAddress)?;
            let chunk = chunk_len(addr, buf.len() - done);
            let phys = self.checked_lookup(addr, Access::USER | Access::READABLE)?;
            // SAFETY: phys is a mapped page and the chunk stays inside it.
            unsafe {
                let src = (phys + self.phys_offset) as *const u8;
                core::ptr::copy_nonoverlapping(src, buf[done..].as_mut_ptr(), chunk);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copies `data` into user memory at `virt`.
    ///
    /// Every touched page must be mapped user writable.
    pub fn write_bytes(&mut self, virt: VirtAddr, data: &[u8]) -> Result<(), Errno> {
        let mut done = 0;
        while done < data.len() {
            let addr = virt.checked_add(done as u64).ok_or(Errno::InvalidAddress)?;
            let chunk = chunk_len(addr, data.len() - done);
            let phys = self.checked_lookup(addr, Access::USER | Access::WRITABLE)?;
            // SAFETY: phys is a mapped page and the chunk stays inside it.
            unsafe {
                let dst = (phys + self.phys_offset) as *mut u8;
                core::ptr::copy_nonoverlapping(data[done..].as_ptr(), dst, chunk);
            }
            done += chunk;
        }
        Ok(())
    }

    fn checked_lookup(&self, virt: VirtAddr, required: Access) -> Result<PhysAddr, Errno> {
        let phys = self.lookup(virt)?;
        if !self.access(virt)?.contains(required) {
            return Err(Errno::AccessViolation);
        }
        Ok(phys)
    }

    /// Frees the page tables. Every region must already be released.
    pub fn destroy<F: FrameAllocator>(mut self, frames: &mut F) {
        self.paging.release_tables(frames);
    }
}

fn chunk_len(addr: VirtAddr, remaining: usize) -> usize {
    let room = (PAGE_SIZE - addr % PAGE_SIZE) as usize;
    room.min(remaining)
}

/// Returns `pages` contiguous frames starting at `phys` to the allocator.
pub fn release_pages<F: FrameAllocator>(frames: &mut F, phys: PhysAddr, pages: u64) {
    for page in 0..pages {
        let frame = phys + page * PAGE_SIZE;
        if let Err(err) = frames.release(frame) {
            debug!(target: "mem", "frame {frame:#x} not returned: {err:?}");
        }
    }
}

/// Fills physical memory through the kernel direct map.
///
/// # Safety
///
/// `[phys, phys + len)` must be memory the caller owns.
pub unsafe fn fill_physical<F: FrameAllocator>(frames: &F, phys: PhysAddr, len: usize, value: u8) {
    core::ptr::write_bytes((phys + frames.phys_offset()) as *mut u8, value, len);
}

/// Copies bytes into physical memory through the kernel direct map.
///
/// # Safety
///
/// `[phys, phys + data.len())` must be memory the caller owns.
pub unsafe fn copy_to_physical<F: FrameAllocator>(frames: &F, phys: PhysAddr, data: &[u8]) {
    core::ptr::copy_nonoverlapping(
        data.as_ptr(),
        (phys + frames.phys_offset()) as *mut u8,
        data.len(),
    );
}
