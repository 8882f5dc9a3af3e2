use hal::{page_align_down, page_align_up, PhysAddr};

/// Boot information passed from platform-specific code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo<'a> {
    pub memory_map: &'a [MemoryRegion],
    pub kernel_start: PhysAddr,
    pub kernel_end: PhysAddr,
    /// Contents of the boot image module, if the loader provided one.
    pub boot_image: Option<&'a [u8]>,
}

/// Describes a contiguous physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: PhysAddr,
    pub end: PhysAddr,
    pub kind: MemoryKind,
}

/// Enumerates the physical memory region types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Usable,
    Reserved,
    Mmio,
}

impl MemoryRegion {
    /// Size in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BootInfo<'_> {
    /// Largest page-aligned usable window, the pool handed to the frame
    /// allocator.
    pub fn largest_usable(&self) -> Option<(PhysAddr, PhysAddr)> {
        self.memory_map
            .iter()
            .filter(|region| region.kind == MemoryKind::Usable)
            .map(|region| (page_align_up(region.start), page_align_down(region.end)))
            .filter(|(start, end)| start < end)
            .max_by_key(|(start, end)| end - start)
    }

    /// Total bytes of usable memory reported by the loader.
    pub fn usable_bytes(&self) -> u64 {
        self.memory_map
            .iter()
            .filter(|region| region.kind == MemoryKind::Usable)
            .map(MemoryRegion::len)
            .sum()
    }
}
