//! Software implementation of the architecture boundary.
//!
//! Used to run the kernel core on the development host. Physical memory is
//! a page-aligned heap arena and the direct map is the identity, so a
//! physical address is also a valid host pointer.

mod memory;
mod paging;

use std::cell::Cell;

use hal::{Arch, CacheOps, CpuContext, MemoryMap, Region, VirtAddr};

pub use memory::HostMemory;
pub use paging::HostPaging;

/// Cache that is always coherent. Counts clean requests.
#[derive(Debug, Default)]
pub struct HostCache {
    cleans: Cell<usize>,
}

impl HostCache {
    /// Number of `clean_data` calls so far.
    pub fn clean_count(&self) -> usize {
        self.cleans.get()
    }
}

impl CacheOps for HostCache {
    fn clean_data(&self, _virt: VirtAddr) {
        self.cleans.set(self.cleans.get() + 1);
    }
}

/// Register state of a host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostContext {
    pub pc: VirtAddr,
    pub sp: VirtAddr,
    pub ret: usize,
    pub privileged: bool,
}

impl CpuContext for HostContext {
    fn new(entry: VirtAddr, stack: VirtAddr, privileged: bool) -> Self {
        Self {
            pc: entry,
            sp: stack,
            ret: 0,
            privileged,
        }
    }

    fn reset(&mut self, entry: VirtAddr) {
        self.pc = entry;
        self.ret = 0;
    }

    fn set_stack(&mut self, top: VirtAddr) {
        self.sp = top;
    }

    fn set_return_value(&mut self, value: usize) {
        self.ret = value;
    }

    fn program_counter(&self) -> VirtAddr {
        self.pc
    }
}

/// Host architecture binding.
#[derive(Debug)]
pub struct HostArch;

impl HostArch {
    pub const TIMER_FREQUENCY: u32 = 100;
}

impl Arch for HostArch {
    type Paging = HostPaging;
    type Cache = HostCache;
    type Context = HostContext;

    const NAME: &'static str = "host";

    fn memory_map() -> MemoryMap {
        MemoryMap::new()
            .with(Region::KernelData, 0xFFFF_8000_0000_0000, 0x4000_0000)
            .with(Region::KernelPrivate, 0xFFFF_8000_4000_0000, 0x4000_0000)
            .with(Region::UserData, 0x0040_0000, 0x0FC0_0000)
            .with(Region::UserHeap, 0x1000_0000, 0x1000_0000)
            .with(Region::UserStack, 0x2000_0000, 0x0010_0000)
            .with(Region::UserPrivate, 0x3000_0000, 0x1000_0000)
            .with(Region::UserShare, 0x4000_0000, 0x1000_0000)
            .with(Region::UserArgs, 0x5000_0000, 0x0001_0000)
    }

    fn timer_frequency() -> u32 {
        Self::TIMER_FREQUENCY
    }
}
