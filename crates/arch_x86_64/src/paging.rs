use core::sync::atomic::{AtomicU64, Ordering};

use hal::{is_page_aligned, Access, Errno, FrameAllocator, PagingOps, PhysAddr, VirtAddr, PAGE_SIZE};
use x86_64::structures::paging::{PageTable, PageTableFlags, PageTableIndex};

/// First root-table slot of the kernel half.
const KERNEL_HALF: usize = 256;
const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// Records the boot page tables whose upper half every address space
/// shares.
pub fn set_kernel_root(root: PhysAddr) {
    KERNEL_ROOT.store(root, Ordering::Relaxed);
}

/// Physical address of the root table loaded in CR3.
#[cfg(target_os = "none")]
pub fn active_root() -> PhysAddr {
    let (frame, _) = x86_64::registers::control::Cr3::read();
    frame.start_address().as_u64()
}

/// Four-level x86_64 page tables of one address space.
///
/// Tables are reached through the direct map. The upper half of the root
/// is copied from the kernel root and never freed here.
#[derive(Debug)]
pub struct X86Paging {
    root: PhysAddr,
    phys_offset: u64,
}

fn indices(virt: VirtAddr) -> [PageTableIndex; 4] {
    let virt = x86_64::VirtAddr::new_truncate(virt);
    [virt.p4_index(), virt.p3_index(), virt.p2_index(), virt.p1_index()]
}

fn leaf_flags(access: Access) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT;
    if access.contains(Access::WRITABLE) {
        flags |= PageTableFlags::WRITABLE;
    }
    if access.contains(Access::USER) {
        flags |= PageTableFlags::USER_ACCESSIBLE;
    }
    if !access.contains(Access::EXECUTABLE) {
        flags |= PageTableFlags::NO_EXECUTE;
    }
    if access.intersects(Access::UNCACHED | Access::DEVICE) {
        flags |= PageTableFlags::NO_CACHE | PageTableFlags::WRITE_THROUGH;
    }
    flags
}

fn access_of(flags: PageTableFlags) -> Access {
    let mut access = Access::READABLE;
    if flags.contains(PageTableFlags::WRITABLE) {
        access |= Access::WRITABLE;
    }
    if flags.contains(PageTableFlags::USER_ACCESSIBLE) {
        access |= Access::USER;
    }
    if !flags.contains(PageTableFlags::NO_EXECUTE) {
        access |= Access::EXECUTABLE;
    }
    if flags.contains(PageTableFlags::NO_CACHE) {
        access |= Access::UNCACHED;
    }
    access
}

impl X86Paging {
    pub(crate) fn with_kernel_half<F: FrameAllocator>(
        frames: &mut F,
        kernel_root: Option<PhysAddr>,
    ) -> Result<Self, Errno> {
        let paging = Self {
            root: frames.allocate(PAGE_SIZE)?,
            phys_offset: frames.phys_offset(),
        };
        paging.clear(paging.root);
        if let Some(kernel_root) = kernel_root {
            // SAFETY: both roots are page-table pages reachable through the
            // direct map and distinct.
            let (source, target) = unsafe { (paging.table(kernel_root), paging.table(paging.root)) };
            for index in KERNEL_HALF..512 {
                target[index] = source[index].clone();
            }
        }
        Ok(paging)
    }

    /// # Safety
    ///
    /// `phys` must be a page-table page owned by this address space or the
    /// kernel root, and no other reference to it may be live.
    #[allow(clippy::mut_from_ref)]
    unsafe fn table(&self, phys: PhysAddr) -> &mut PageTable {
        &mut *((phys + self.phys_offset) as *mut PageTable)
    }

    fn clear(&self, phys: PhysAddr) {
        // SAFETY: freshly allocated page inside the direct map.
        unsafe { core::ptr::write_bytes((phys + self.phys_offset) as *mut u8, 0, PAGE_SIZE as usize) };
    }

    /// Walks to the last level table of `virt`, creating tables on the way
    /// when `frames` is given.
    fn walk<F: FrameAllocator>(
        &self,
        virt: VirtAddr,
        mut frames: Option<&mut F>,
    ) -> Result<(PhysAddr, PageTableIndex), Errno> {
        let [p4, p3, p2, p1] = indices(virt);
        let mut table = self.root;
        for index in [p4, p3, p2] {
            // SAFETY: `table` is the root or a table reached from it.
            let entry = unsafe { &mut self.table(table)[index] };
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(Errno::AlreadyExists);
            }
            if entry.is_unused() {
                let frames = frames.as_deref_mut().ok_or(Errno::InvalidAddress)?;
                let next = frames.allocate(PAGE_SIZE)?;
                self.clear(next);
                let flags = PageTableFlags::PRESENT
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::USER_ACCESSIBLE;
                entry.set_addr(x86_64::PhysAddr::new(next), flags);
            }
            table = entry.addr().as_u64();
        }
        Ok((table, p1))
    }

    /// Finds the entry mapping `virt`, following huge pages.
    fn translate(&self, virt: VirtAddr) -> Result<(PhysAddr, PageTableFlags), Errno> {
        let mut table = self.root;
        let mut span = 512 * 512 * 512 * 512 * PAGE_SIZE;
        for index in indices(virt) {
            // SAFETY: `table` is the root or a table reached from it.
            let entry = unsafe { &self.table(table)[index] };
            if entry.is_unused() {
                return Err(Errno::InvalidAddress);
            }
            span /= 512;
            let flags = entry.flags();
            if span == PAGE_SIZE || flags.contains(PageTableFlags::HUGE_PAGE) {
                let base = entry.addr().as_u64() & ADDRESS_MASK & !(span - 1);
                return Ok((base + virt % span, flags));
            }
            table = entry.addr().as_u64();
        }
        Err(Errno::InvalidAddress)
    }

    fn release_level<F: FrameAllocator>(
        &self,
        table: PhysAddr,
        level: u8,
        range: core::ops::Range<usize>,
        frames: &mut F,
    ) {
        for index in range {
            // SAFETY: `table` belongs to this address space.
            let entry = unsafe { &self.table(table)[index] };
            if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                continue;
            }
            let next = entry.addr().as_u64();
            if level > 2 {
                self.release_level(next, level - 1, 0..512, frames);
            }
            let _ = frames.release(next);
        }
    }
}

impl PagingOps for X86Paging {
    fn create<F: FrameAllocator>(frames: &mut F) -> Result<Self, Errno> {
        let kernel_root = match KERNEL_ROOT.load(Ordering::Relaxed) {
            0 => None,
            root => Some(root),
        };
        Self::with_kernel_half(frames, kernel_root)
    }

    fn map<F: FrameAllocator>(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        access: Access,
        frames: &mut F,
    ) -> Result<(), Errno> {
        if !is_page_aligned(virt) || !is_page_aligned(phys) {
            return Err(Errno::InvalidArgument);
        }
        let (table, index) = self.walk(virt, Some(frames))?;
        // SAFETY: `table` was reached from the root.
        let entry = unsafe { &mut self.table(table)[index] };
        if !entry.is_unused() {
            return Err(Errno::AlreadyExists);
        }
        entry.set_addr(x86_64::PhysAddr::new(phys), leaf_flags(access));
        Ok(())
    }

    fn unmap(&mut self, virt: VirtAddr) -> Result<(), Errno> {
        if !is_page_aligned(virt) {
            return Err(Errno::InvalidArgument);
        }
        match self.walk::<NoFrames>(virt, None) {
            Ok((table, index)) => {
                // SAFETY: `table` was reached from the root.
                unsafe { self.table(table)[index].set_unused() };
                Ok(())
            }
            Err(Errno::InvalidAddress) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn lookup(&self, virt: VirtAddr) -> Result<PhysAddr, Errno> {
        self.translate(virt).map(|(phys, _)| phys)
    }

    fn access(&self, virt: VirtAddr) -> Result<Access, Errno> {
        self.translate(virt).map(|(_, flags)| access_of(flags))
    }

    fn activate(&self) {
        #[cfg(target_os = "none")]
        {
            use x86_64::registers::control::{Cr3, Cr3Flags};
            use x86_64::structures::paging::PhysFrame;
            let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(self.root));
            // SAFETY: the root carries the shared kernel half.
            unsafe { Cr3::write(frame, Cr3Flags::empty()) };
        }
    }

    fn flush(&self, _virt: VirtAddr) {
        #[cfg(target_os = "none")]
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new_truncate(_virt));
    }

    fn root(&self) -> PhysAddr {
        self.root
    }

    fn release_tables<F: FrameAllocator>(&mut self, frames: &mut F) {
        self.release_level(self.root, 4, 0..KERNEL_HALF, frames);
        let _ = frames.release(self.root);
    }
}

/// Allocator type for walks that must not create tables.
struct NoFrames;

impl FrameAllocator for NoFrames {
    fn allocate(&mut self, _size: u64) -> Result<PhysAddr, Errno> {
        Err(Errno::OutOfMemory)
    }

    fn release(&mut self, _phys: PhysAddr) -> Result<(), Errno> {
        Ok(())
    }

    fn claim(&mut self, _phys: PhysAddr, _size: u64) -> Result<(), Errno> {
        Ok(())
    }

    fn phys_offset(&self) -> u64 {
        0
    }

    fn total(&self) -> u64 {
        0
    }

    fn available(&self) -> u64 {
        0
    }
}
