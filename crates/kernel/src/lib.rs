#![no_std]
#![feature(alloc_error_handler)]

extern crate alloc;

pub mod allocator;
pub mod boot;
pub mod console;
pub mod logger;
#[cfg(feature = "x86_64")]
mod trap;

use kernel_core::BootInfo;
use log::{info, LevelFilter};

/// Parks the CPU for good.
pub fn halt() -> ! {
    #[cfg(feature = "x86_64")]
    arch_x86_64::halt_loop();
    #[cfg(not(feature = "x86_64"))]
    loop {
        core::hint::spin_loop();
    }
}

/// Kernel entrypoint invoked by the bootloader.
///
/// `phys_offset` is where the loader maps all physical memory.
pub fn entry(boot_info: BootInfo<'static>, phys_offset: u64) -> ! {
    allocator::init_heap();
    logger::init(LevelFilter::Info);
    info!(
        target: "boot",
        "regions={} usable={} KiB kernel=[{:#x}-{:#x}] heap={} KiB",
        boot_info.memory_map.len(),
        boot_info.usable_bytes() / 1024,
        boot_info.kernel_start,
        boot_info.kernel_end,
        allocator::free_bytes() / 1024
    );

    #[cfg(feature = "x86_64")]
    trap::start(&boot_info, phys_offset);

    #[cfg(not(feature = "x86_64"))]
    {
        let _ = phys_offset;
        log::error!(target: "boot", "no architecture selected");
        halt()
    }
}
