use kernel_core::{BootInfo, MemoryKind, MemoryRegion};
use limine::memory_map::{Entry, EntryType};
use limine::response::MemoryMapResponse;
use spin::Once;

const MAX_MEMORY_REGIONS: usize = 128;

static MEMORY_REGIONS: Once<([MemoryRegion; MAX_MEMORY_REGIONS], usize)> = Once::new();

/// Builds a BootInfo structure from the Limine memory map, the kernel
/// placement and the boot image module.
///
/// Entries past the first `MAX_MEMORY_REGIONS` are dropped.
pub fn build_boot_info(
    memory_map: &MemoryMapResponse,
    kernel_start: u64,
    kernel_end: u64,
    boot_image: Option<&'static [u8]>,
) -> BootInfo<'static> {
    let (regions, count) = MEMORY_REGIONS.call_once(|| {
        let mut regions = [MemoryRegion {
            start: 0,
            end: 0,
            kind: MemoryKind::Reserved,
        }; MAX_MEMORY_REGIONS];
        let mut count = 0;
        for (slot, entry) in regions.iter_mut().zip(memory_map.entries()) {
            *slot = map_entry(entry);
            count += 1;
        }
        (regions, count)
    });

    BootInfo {
        memory_map: &regions[..*count],
        kernel_start,
        kernel_end,
        boot_image,
    }
}

/// Bootloader-reclaimable memory still holds the page tables every
/// address space shares, so only plain usable memory is handed out.
fn map_entry(entry: &Entry) -> MemoryRegion {
    let kind = match entry.entry_type {
        EntryType::USABLE => MemoryKind::Usable,
        EntryType::FRAMEBUFFER => MemoryKind::Mmio,
        _ => MemoryKind::Reserved,
    };
    MemoryRegion {
        start: entry.base,
        end: entry.base.saturating_add(entry.length),
        kind,
    }
}
