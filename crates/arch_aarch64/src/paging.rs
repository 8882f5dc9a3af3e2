use bitflags::bitflags;
use hal::{is_page_aligned, Access, Errno, FrameAllocator, PagingOps, PhysAddr, VirtAddr, PAGE_SIZE};

const ENTRIES: usize = 512;
const LEVELS: usize = 4;
/// Output address bits 47:12 of a descriptor.
const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_F000;

bitflags! {
    /// Stage 1 translation descriptor bits for the 4 KiB granule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Descriptor: u64 {
        const VALID = 1 << 0;
        /// Table descriptor at levels 0..2, page descriptor at level 3.
        const TABLE_OR_PAGE = 1 << 1;
        /// AttrIndx 1: Device-nGnRE in MAIR_EL1.
        const ATTR_DEVICE = 1 << 2;
        /// AttrIndx 2: Normal non-cacheable in MAIR_EL1.
        const ATTR_NON_CACHEABLE = 1 << 3;
        /// AP[1]: accessible from EL0.
        const EL0_ACCESS = 1 << 6;
        /// AP[2]: read-only.
        const READ_ONLY = 1 << 7;
        const INNER_SHAREABLE = 0b11 << 8;
        const ACCESSED = 1 << 10;
        const NOT_GLOBAL = 1 << 11;
        const PRIVILEGED_EXECUTE_NEVER = 1 << 53;
        const USER_EXECUTE_NEVER = 1 << 54;
    }
}

impl Descriptor {
    fn page(access: Access) -> Self {
        let mut bits = Self::VALID
            | Self::TABLE_OR_PAGE
            | Self::ACCESSED
            | Self::INNER_SHAREABLE
            | Self::NOT_GLOBAL;
        if access.contains(Access::DEVICE) {
            bits |= Self::ATTR_DEVICE;
        } else if access.contains(Access::UNCACHED) {
            bits |= Self::ATTR_NON_CACHEABLE;
        }
        if !access.contains(Access::WRITABLE) {
            bits |= Self::READ_ONLY;
        }
        let user = access.contains(Access::USER);
        if user {
            bits |= Self::EL0_ACCESS;
        }
        // The kernel never executes user pages.
        let executable = access.contains(Access::EXECUTABLE);
        if user || !executable {
            bits |= Self::PRIVILEGED_EXECUTE_NEVER;
        }
        if !user || !executable {
            bits |= Self::USER_EXECUTE_NEVER;
        }
        bits
    }

    fn access(self) -> Access {
        let mut access = Access::READABLE;
        if !self.contains(Self::READ_ONLY) {
            access |= Access::WRITABLE;
        }
        let user = self.contains(Self::EL0_ACCESS);
        if user {
            access |= Access::USER;
        }
        let never = if user {
            Self::USER_EXECUTE_NEVER
        } else {
            Self::PRIVILEGED_EXECUTE_NEVER
        };
        if !self.contains(never) {
            access |= Access::EXECUTABLE;
        }
        if self.contains(Self::ATTR_DEVICE) {
            access |= Access::DEVICE;
        }
        if self.contains(Self::ATTR_NON_CACHEABLE) {
            access |= Access::UNCACHED;
        }
        access
    }
}

fn index(virt: VirtAddr, level: usize) -> usize {
    let shift = 39 - 9 * level;
    ((virt >> shift) as usize) & (ENTRIES - 1)
}

/// Four-level TTBR0 translation tables of one address space.
///
/// The kernel lives in the TTBR1 half, so nothing is shared with other
/// address spaces.
#[derive(Debug)]
pub struct AArch64Paging {
    root: PhysAddr,
    phys_offset: u64,
}

impl AArch64Paging {
    /// # Safety
    ///
    /// `phys` must be a table page of this address space with no other live
    /// reference.
    #[allow(clippy::mut_from_ref)]
    unsafe fn table(&self, phys: PhysAddr) -> &mut [u64; ENTRIES] {
        &mut *((phys + self.phys_offset) as *mut [u64; ENTRIES])
    }

    fn new_table<F: FrameAllocator>(&self, frames: &mut F) -> Result<PhysAddr, Errno> {
        let phys = frames.allocate(PAGE_SIZE)?;
        // SAFETY: freshly allocated page inside the direct map.
        unsafe { core::ptr::write_bytes((phys + self.phys_offset) as *mut u8, 0, PAGE_SIZE as usize) };
        Ok(phys)
    }

    /// Returns the last level table covering `virt`, creating the missing
    /// levels when `frames` is given.
    fn leaf_table<F: FrameAllocator>(
        &self,
        virt: VirtAddr,
        mut frames: Option<&mut F>,
    ) -> Result<PhysAddr, Errno> {
        let mut table = self.root;
        for level in 0..LEVELS - 1 {
            // SAFETY: `table` is the root or reached from it.
            let entry = unsafe { &mut self.table(table)[index(virt, level)] };
            if *entry & Descriptor::VALID.bits() == 0 {
                let frames = frames.as_deref_mut().ok_or(Errno::InvalidAddress)?;
                let next = self.new_table(frames)?;
                *entry = next | (Descriptor::VALID | Descriptor::TABLE_OR_PAGE).bits();
            } else if *entry & Descriptor::TABLE_OR_PAGE.bits() == 0 {
                // Block mapping.
                return Err(Errno::AlreadyExists);
            }
            table = *entry & ADDRESS_MASK;
        }
        Ok(table)
    }

    /// Raw level 3 descriptor of `virt`.
    pub fn descriptor(&self, virt: VirtAddr) -> Result<u64, Errno> {
        let table = self.leaf_table::<NoFrames>(virt, None)?;
        // SAFETY: `table` was reached from the root.
        let raw = unsafe { self.table(table)[index(virt, LEVELS - 1)] };
        if raw & Descriptor::VALID.bits() == 0 {
            return Err(Errno::InvalidAddress);
        }
        Ok(raw)
    }

    fn release_level<F: FrameAllocator>(&self, table: PhysAddr, level: usize, frames: &mut F) {
        for slot in 0..ENTRIES {
            // SAFETY: `table` belongs to this address space.
            let raw = unsafe { self.table(table)[slot] };
            let table_bits = (Descriptor::VALID | Descriptor::TABLE_OR_PAGE).bits();
            if raw & table_bits != table_bits {
                continue;
            }
            let next = raw & ADDRESS_MASK;
            if level + 1 < LEVELS - 1 {
                self.release_level(next, level + 1, frames);
            }
            let _ = frames.release(next);
        }
    }
}

impl PagingOps for AArch64Paging {
    fn create<F: FrameAllocator>(frames: &mut F) -> Result<Self, Errno> {
        let mut paging = Self {
            root: 0,
            phys_offset: frames.phys_offset(),
        };
        paging.root = paging.new_table(frames)?;
        Ok(paging)
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
        let table = self.leaf_table(virt, Some(frames))?;
        // SAFETY: `table` was reached from the root.
        let entry = unsafe { &mut self.table(table)[index(virt, LEVELS - 1)] };
        if *entry & Descriptor::VALID.bits() != 0 {
            return Err(Errno::AlreadyExists);
        }
        *entry = (phys & ADDRESS_MASK) | Descriptor::page(access).bits();
        Ok(())
    }

    fn unmap(&mut self, virt: VirtAddr) -> Result<(), Errno> {
        if !is_page_aligned(virt) {
            return Err(Errno::InvalidArgument);
        }
        match self.leaf_table::<NoFrames>(virt, None) {
            Ok(table) => {
                // SAFETY: `table` was reached from the root.
                unsafe { self.table(table)[index(virt, LEVELS - 1)] = 0 };
                Ok(())
            }
            Err(Errno::InvalidAddress) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn lookup(&self, virt: VirtAddr) -> Result<PhysAddr, Errno> {
        Ok((self.descriptor(virt)? & ADDRESS_MASK) + virt % PAGE_SIZE)
    }

    fn access(&self, virt: VirtAddr) -> Result<Access, Errno> {
        Ok(Descriptor::from_bits_truncate(self.descriptor(virt)?).access())
    }

    fn activate(&self) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        // SAFETY: the kernel runs from TTBR1, so swapping TTBR0 only changes
        // the user half.
        unsafe {
            core::arch::asm!(
                "msr ttbr0_el1, {root}",
                "isb",
                "tlbi vmalle1is",
                "dsb ish",
                "isb",
                root = in(reg) self.root,
            );
        }
    }

    fn flush(&self, _virt: VirtAddr) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        // SAFETY: invalidating a TLB entry has no memory effects.
        unsafe {
            core::arch::asm!(
                "dsb ishst",
                "tlbi vaae1is, {page}",
                "dsb ish",
                "isb",
                page = in(reg) _virt >> 12,
            );
        }
    }

    fn root(&self) -> PhysAddr {
        self.root
    }

    fn release_tables<F: FrameAllocator>(&mut self, frames: &mut F) {
        self.release_level(self.root, 0, frames);
        let _ = frames.release(self.root);
    }
}

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

#[cfg(test)]
mod tests {
    use super::*;
    use arch_host::HostMemory;
    use kernel_core::BitmapAllocator;

    fn arena(pages: usize) -> (HostMemory, BitmapAllocator) {
        let memory = HostMemory::new(pages);
        let frames = BitmapAllocator::new(memory.base(), memory.base() + memory.size(), 0);
        (memory, frames)
    }

    #[test]
    fn user_data_page_encoding() {
        let (_memory, mut frames) = arena(16);
        let mut paging = AArch64Paging::create(&mut frames).expect("create should succeed");
        paging
            .map(0x40_0000, 0x8000, Access::READABLE | Access::WRITABLE | Access::USER, &mut frames)
            .expect("map should succeed");
        let raw = Descriptor::from_bits_truncate(paging.descriptor(0x40_0000).expect("mapped"));
        assert!(raw.contains(Descriptor::VALID | Descriptor::TABLE_OR_PAGE | Descriptor::ACCESSED));
        assert!(raw.contains(Descriptor::EL0_ACCESS));
        assert!(!raw.contains(Descriptor::READ_ONLY));
        assert!(raw.contains(Descriptor::USER_EXECUTE_NEVER | Descriptor::PRIVILEGED_EXECUTE_NEVER));
        assert_eq!(paging.lookup(0x40_0042), Ok(0x8042));
    }

    #[test]
    fn user_code_is_not_kernel_executable() {
        let (_memory, mut frames) = arena(16);
        let mut paging = AArch64Paging::create(&mut frames).expect("create should succeed");
        let code = Access::READABLE | Access::EXECUTABLE | Access::USER;
        paging.map(0x40_0000, 0x8000, code, &mut frames).expect("map should succeed");
        let raw = Descriptor::from_bits_truncate(paging.descriptor(0x40_0000).expect("mapped"));
        assert!(raw.contains(Descriptor::READ_ONLY | Descriptor::PRIVILEGED_EXECUTE_NEVER));
        assert!(!raw.contains(Descriptor::USER_EXECUTE_NEVER));
        assert_eq!(paging.access(0x40_0000), Ok(code));
    }

    #[test]
    fn device_and_uncached_attributes() {
        let (_memory, mut frames) = arena(16);
        let mut paging = AArch64Paging::create(&mut frames).expect("create should succeed");
        let device = Access::READABLE | Access::WRITABLE | Access::DEVICE;
        let uncached = Access::READABLE | Access::UNCACHED;
        paging.map(0x40_0000, 0x9000_0000, device, &mut frames).expect("map should succeed");
        paging.map(0x40_1000, 0x9000_1000, uncached, &mut frames).expect("map should succeed");
        assert_eq!(paging.access(0x40_0000), Ok(device));
        assert_eq!(paging.access(0x40_1000), Ok(uncached));
    }

    #[test]
    fn duplicate_unaligned_and_unmapped() {
        let (_memory, mut frames) = arena(16);
        let mut paging = AArch64Paging::create(&mut frames).expect("create should succeed");
        paging.map(0x40_0000, 0x8000, Access::READABLE, &mut frames).expect("map should succeed");
        assert_eq!(paging.map(0x40_0000, 0x9000, Access::READABLE, &mut frames), Err(Errno::AlreadyExists));
        assert_eq!(paging.map(0x40_0800, 0x9000, Access::READABLE, &mut frames), Err(Errno::InvalidArgument));
        assert_eq!(paging.unmap(0x40_0000), Ok(()));
        assert_eq!(paging.unmap(0x40_0000), Ok(()));
        assert_eq!(paging.unmap(0x7000_0000), Ok(()));
        assert_eq!(paging.lookup(0x40_0000), Err(Errno::InvalidAddress));
    }

    #[test]
    fn intermediate_table_exhaustion_is_out_of_memory() {
        let (_memory, mut frames) = arena(3);
        let mut paging = AArch64Paging::create(&mut frames).expect("create should succeed");
        assert_eq!(
            paging.map(0x40_0000, 0x8000, Access::READABLE, &mut frames),
            Err(Errno::OutOfMemory)
        );
    }

    #[test]
    fn release_returns_every_table() {
        let (_memory, mut frames) = arena(32);
        let before = frames.free_count();
        let mut paging = AArch64Paging::create(&mut frames).expect("create should succeed");
        for virt in [0x40_0000, 0x4000_0000, 0x80_0000_0000] {
            paging.map(virt, 0x8000, Access::READABLE, &mut frames).expect("map should succeed");
        }
        paging.release_tables(&mut frames);
        assert_eq!(frames.free_count(), before);
    }
}
