#![cfg_attr(not(test), no_std)]

mod paging;

use hal::{Arch, CacheOps, CpuContext, MemoryMap, Region, VirtAddr};

pub use paging::{AArch64Paging, Descriptor};

/// Generic timer interrupt rate.
pub const TIMER_FREQUENCY: u32 = 100;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
const PSCI_SYSTEM_OFF: u64 = 0x8400_0008;
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
const PSCI_SYSTEM_RESET: u64 = 0x8400_0009;

/// Busy-loop using `wfe`.
pub fn halt_loop() -> ! {
    loop {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        // SAFETY: waiting for an event has no side effects.
        unsafe {
            core::arch::asm!("wfe");
        }
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        core::hint::spin_loop();
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
fn psci_call(function: u64) -> Result<(), hal::Errno> {
    // SAFETY: PSCI power calls do not return on success.
    unsafe { core::arch::asm!("hvc #0", inout("x0") function => _, options(nomem, nostack)) };
    Err(hal::Errno::IoError)
}

/// Cache maintenance by virtual address.
#[derive(Debug, Default)]
pub struct ArmCache;

impl ArmCache {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    fn line_size() -> u64 {
        let ctr: u64;
        // SAFETY: CTR_EL0 is readable at EL1.
        unsafe { core::arch::asm!("mrs {}, ctr_el0", out(reg) ctr) };
        4 << ((ctr >> 16) & 0xF)
    }
}

impl CacheOps for ArmCache {
    fn clean_data(&self, _virt: VirtAddr) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        {
            let line = Self::line_size();
            let start = hal::page_align_down(_virt);
            let mut addr = start;
            while addr < start + hal::PAGE_SIZE {
                // SAFETY: cleaning a mapped line only writes it back.
                unsafe { core::arch::asm!("dc cvac, {}", in(reg) addr) };
                addr += line;
            }
            // SAFETY: barrier only.
            unsafe { core::arch::asm!("dsb ish") };
        }
    }
}

/// Saved EL0 register state.
///
/// System calls pass the number in `x8` and arguments in `x0..x4`; the
/// result comes back in `x0`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArmContext {
    pub x: [u64; 31],
    pub sp_el0: u64,
    pub elr: u64,
    pub spsr: u64,
}

impl ArmContext {
    /// EL0t with all interrupts unmasked.
    const SPSR_EL0: u64 = 0;

    pub fn api_number(&self) -> usize {
        self.x[8] as usize
    }

    pub fn api_args(&self) -> [usize; 5] {
        [self.x[0], self.x[1], self.x[2], self.x[3], self.x[4]].map(|value| value as usize)
    }
}

impl CpuContext for ArmContext {
    fn new(entry: VirtAddr, stack: VirtAddr, _privileged: bool) -> Self {
        Self {
            sp_el0: stack,
            elr: entry,
            spsr: Self::SPSR_EL0,
            ..Self::default()
        }
    }

    fn reset(&mut self, entry: VirtAddr) {
        *self = Self::new(entry, self.sp_el0, false);
    }

    fn set_stack(&mut self, top: VirtAddr) {
        self.sp_el0 = top;
    }

    fn set_return_value(&mut self, value: usize) {
        self.x[0] = value as u64;
    }

    fn program_counter(&self) -> VirtAddr {
        self.elr
    }
}

/// AArch64 binding of the kernel core.
#[derive(Debug)]
pub struct AArch64Arch;

impl Arch for AArch64Arch {
    type Paging = AArch64Paging;
    type Cache = ArmCache;
    type Context = ArmContext;

    const NAME: &'static str = "aarch64";

    fn memory_map() -> MemoryMap {
        MemoryMap::new()
            .with(Region::KernelData, 0xFFFF_0000_0000_0000, 0x0000_4000_0000_0000)
            .with(Region::KernelPrivate, 0xFFFF_FF80_0000_0000, 0x0000_0040_0000_0000)
            .with(Region::UserData, 0x0000_0000_0040_0000, 0x0000_0000_3FC0_0000)
            .with(Region::UserHeap, 0x0000_0000_4000_0000, 0x0000_003F_C000_0000)
            .with(Region::UserStack, 0x0000_0040_0000_0000, 0x0000_0000_4000_0000)
            .with(Region::UserPrivate, 0x0000_1000_0000_0000, 0x0000_1000_0000_0000)
            .with(Region::UserShare, 0x0000_2000_0000_0000, 0x0000_1000_0000_0000)
            .with(Region::UserArgs, 0x0000_FFFF_0000_0000, 0x0000_0000_1000_0000)
    }

    fn timer_frequency() -> u32 {
        TIMER_FREQUENCY
    }

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    fn reboot() -> Result<(), hal::Errno> {
        psci_call(PSCI_SYSTEM_RESET)
    }

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    fn shutdown() -> Result<(), hal::Errno> {
        psci_call(PSCI_SYSTEM_OFF)
    }
}
