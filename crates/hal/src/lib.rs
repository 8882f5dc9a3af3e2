#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;

/// Physical address type.
pub type PhysAddr = u64;

/// Virtual address type.
pub type VirtAddr = u64;

/// Size of a page in bytes on every supported architecture.
pub const PAGE_SIZE: u64 = 4096;

/// Error codes shared by every kernel interface.
///
/// The numeric codes are part of the system-call ABI. Zero is reserved for
/// success and never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Errno {
    InvalidArgument = 1,
    NotFound = 2,
    AlreadyExists = 3,
    OutOfMemory = 4,
    AccessViolation = 5,
    InvalidAddress = 6,
    ChannelFull = 7,
    WakeupPending = 8,
    RetryAgain = 9,
    IoError = 10,
    Unimplemented = 11,
}

impl Errno {
    /// Returns the ABI code for this error.
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Converts an ABI code back into an error.
    pub const fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Errno::InvalidArgument,
            2 => Errno::NotFound,
            3 => Errno::AlreadyExists,
            4 => Errno::OutOfMemory,
            5 => Errno::AccessViolation,
            6 => Errno::InvalidAddress,
            7 => Errno::ChannelFull,
            8 => Errno::WakeupPending,
            9 => Errno::RetryAgain,
            10 => Errno::IoError,
            11 => Errno::Unimplemented,
            _ => return None,
        })
    }

    /// Returns true for conditions the caller is expected to retry.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Errno::ChannelFull | Errno::WakeupPending | Errno::RetryAgain
        )
    }
}

bitflags! {
    /// Access permissions of a virtual mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const EXECUTABLE = 1 << 2;
        const USER = 1 << 3;
        const UNCACHED = 1 << 4;
        const DEVICE = 1 << 5;
    }
}

/// Describes one mapping request or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
    pub size: u64,
    pub access: Access,
}

impl Range {
    /// Creates a range description.
    pub const fn new(virt: VirtAddr, phys: PhysAddr, size: u64, access: Access) -> Self {
        Self {
            virt,
            phys,
            size,
            access,
        }
    }

    /// Number of pages covered, rounding a partial trailing page up.
    pub const fn page_count(&self) -> u64 {
        page_align_up(self.size) / PAGE_SIZE
    }
}

/// Logical regions of a virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    KernelData,
    KernelPrivate,
    UserData,
    UserHeap,
    UserStack,
    UserPrivate,
    UserShare,
    UserArgs,
}

impl Region {
    /// All regions in table order.
    pub const ALL: [Region; 8] = [
        Region::KernelData,
        Region::KernelPrivate,
        Region::UserData,
        Region::UserHeap,
        Region::UserStack,
        Region::UserPrivate,
        Region::UserShare,
        Region::UserArgs,
    ];

    /// Regions owned by a process and released when it is destroyed.
    pub const USER_OWNED: [Region; 5] = [
        Region::UserData,
        Region::UserHeap,
        Region::UserStack,
        Region::UserPrivate,
        Region::UserArgs,
    ];

    /// Returns true for regions a process may map into itself.
    pub const fn is_user(self) -> bool {
        !matches!(self, Region::KernelData | Region::KernelPrivate)
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

/// Base and size of one logical region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionWindow {
    pub base: VirtAddr,
    pub size: u64,
}

impl RegionWindow {
    /// Returns true if `[virt, virt + size)` lies inside the window.
    pub fn contains(&self, virt: VirtAddr, size: u64) -> bool {
        match (virt.checked_add(size), self.base.checked_add(self.size)) {
            (Some(end), Some(limit)) => virt >= self.base && end <= limit,
            _ => false,
        }
    }
}

/// Per-architecture layout of a virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryMap {
    windows: [RegionWindow; 8],
}

impl MemoryMap {
    /// Creates an empty map.
    pub const fn new() -> Self {
        Self {
            windows: [RegionWindow { base: 0, size: 0 }; 8],
        }
    }

    /// Sets the window of a region, returning the updated map.
    pub fn with(mut self, region: Region, base: VirtAddr, size: u64) -> Self {
        self.windows[region.slot()] = RegionWindow { base, size };
        self
    }

    /// Returns the window of a region.
    pub const fn range(&self, region: Region) -> RegionWindow {
        self.windows[region.slot()]
    }

    /// Returns the region containing `virt`, if any.
    pub fn region_of(&self, virt: VirtAddr) -> Option<Region> {
        Region::ALL
            .into_iter()
            .find(|region| self.range(*region).contains(virt, 1))
    }

    /// Returns the user region holding all of `[virt, virt + size)`.
    pub fn user_region_of(&self, virt: VirtAddr, size: u64) -> Option<Region> {
        Region::ALL
            .into_iter()
            .filter(|region| region.is_user())
            .find(|region| self.range(*region).contains(virt, size.max(1)))
    }
}

/// Source of page-aligned physical memory.
pub trait FrameAllocator {
    /// Allocates `size` bytes of contiguous, page-aligned physical memory.
    fn allocate(&mut self, size: u64) -> Result<PhysAddr, Errno>;

    /// Returns one page to the allocator.
    fn release(&mut self, phys: PhysAddr) -> Result<(), Errno>;

    /// Marks a specific physical window as in use.
    fn claim(&mut self, phys: PhysAddr, size: u64) -> Result<(), Errno>;

    /// Offset of the kernel direct map of physical memory.
    fn phys_offset(&self) -> u64;

    /// Total managed bytes.
    fn total(&self) -> u64;

    /// Bytes currently available.
    fn available(&self) -> u64;
}

/// Architecture memory adapter: one set of page tables.
///
/// Implementations are selected at build time through [`Arch::Paging`].
pub trait PagingOps: Sized {
    /// Creates an empty address space.
    fn create<F: FrameAllocator>(frames: &mut F) -> Result<Self, Errno>;

    /// Maps one page. Fails `AlreadyExists` if `virt` is mapped and
    /// `OutOfMemory` if an intermediate table cannot be allocated.
    fn map<F: FrameAllocator>(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        access: Access,
        frames: &mut F,
    ) -> Result<(), Errno>;

    /// Removes the mapping of one page. Unmapped pages are left alone.
    fn unmap(&mut self, virt: VirtAddr) -> Result<(), Errno>;

    /// Returns the physical page mapped at `virt`.
    fn lookup(&self, virt: VirtAddr) -> Result<PhysAddr, Errno>;

    /// Returns the access flags of the page mapped at `virt`.
    fn access(&self, virt: VirtAddr) -> Result<Access, Errno>;

    /// Loads these tables into the MMU.
    fn activate(&self);

    /// Invalidates the cached translation of `virt`.
    fn flush(&self, virt: VirtAddr);

    /// Physical address of the root table.
    fn root(&self) -> PhysAddr;

    /// Frees every table page owned by this address space.
    fn release_tables<F: FrameAllocator>(&mut self, frames: &mut F);
}

/// Data cache maintenance.
pub trait CacheOps {
    /// Pushes the cache lines of the page at `virt` to memory.
    fn clean_data(&self, virt: VirtAddr);
}

/// Saved register state of a process.
pub trait CpuContext {
    /// Creates a context that starts at `entry` with the given stack.
    fn new(entry: VirtAddr, stack: VirtAddr, privileged: bool) -> Self;

    /// Restarts execution at `entry`, keeping the stack.
    fn reset(&mut self, entry: VirtAddr);

    /// Sets the stack pointer.
    fn set_stack(&mut self, top: VirtAddr);

    /// Sets the value returned by the pending system call.
    fn set_return_value(&mut self, value: usize);

    /// Returns the saved program counter.
    fn program_counter(&self) -> VirtAddr;
}

/// Compile-time binding of an architecture.
pub trait Arch {
    type Paging: PagingOps;
    type Cache: CacheOps + Default;
    type Context: CpuContext;

    /// Short architecture name for diagnostics.
    const NAME: &'static str;

    /// Virtual layout of every process address space.
    fn memory_map() -> MemoryMap;

    /// Timer interrupt frequency in Hz.
    fn timer_frequency() -> u32;

    fn enable_irq(_vector: u32) -> Result<(), Errno> {
        Err(Errno::Unimplemented)
    }

    fn disable_irq(_vector: u32) -> Result<(), Errno> {
        Err(Errno::Unimplemented)
    }

    /// Reads `width` bytes (1, 2 or 4) from an I/O port.
    fn port_read(_port: u16, _width: u8) -> Result<u32, Errno> {
        Err(Errno::Unimplemented)
    }

    /// Writes `width` bytes (1, 2 or 4) to an I/O port.
    fn port_write(_port: u16, _width: u8, _value: u32) -> Result<(), Errno> {
        Err(Errno::Unimplemented)
    }

    fn reboot() -> Result<(), Errno> {
        Err(Errno::Unimplemented)
    }

    fn shutdown() -> Result<(), Errno> {
        Err(Errno::Unimplemented)
    }
}

/// Returns true if `value` is page aligned.
pub const fn is_page_aligned(value: u64) -> bool {
    value % PAGE_SIZE == 0
}

/// Rounds `value` up to the next page boundary.
pub const fn page_align_up(value: u64) -> u64 {
    value.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Rounds `value` down to a page boundary.
pub const fn page_align_down(value: u64) -> u64 {
    value - (value % PAGE_SIZE)
}
