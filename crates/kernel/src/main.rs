#![no_std]
#![no_main]

use core::panic::PanicInfo;

#[cfg(feature = "x86_64")]
use limine::request::{
    ExecutableAddressRequest, ExecutableFileRequest, HhdmRequest, MemoryMapRequest,
    ModuleRequest, RequestsEndMarker, RequestsStartMarker,
};
#[cfg(feature = "x86_64")]
use limine::BaseRevision;

use kernel::kprintln;

#[cfg(feature = "x86_64")]
use kernel::boot::build_boot_info;

#[cfg(feature = "x86_64")]
#[used]
#[link_section = ".limine_requests.start"]
static LIMINE_START: RequestsStartMarker = RequestsStartMarker::new();

#[cfg(feature = "x86_64")]
#[used]
#[link_section = ".limine_requests"]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(0);

#[cfg(feature = "x86_64")]
#[used]
#[link_section = ".limine_requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[cfg(feature = "x86_64")]
#[used]
#[link_section = ".limine_requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[cfg(feature = "x86_64")]
#[used]
#[link_section = ".limine_requests"]
static EXECUTABLE_FILE_REQUEST: ExecutableFileRequest = ExecutableFileRequest::new();

#[cfg(feature = "x86_64")]
#[used]
#[link_section = ".limine_requests"]
static EXECUTABLE_ADDRESS_REQUEST: ExecutableAddressRequest = ExecutableAddressRequest::new();

#[cfg(feature = "x86_64")]
#[used]
#[link_section = ".limine_requests"]
static MODULE_REQUEST: ModuleRequest = ModuleRequest::new();

#[cfg(feature = "x86_64")]
#[used]
#[link_section = ".limine_requests.end"]
static LIMINE_END: RequestsEndMarker = RequestsEndMarker::new();

#[cfg(feature = "x86_64")]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    kernel::console::init_early();
    kprintln!("kernel: limine entry");
    if !BASE_REVISION.is_supported() {
        kprintln!("kernel: unsupported limine base revision");
        kernel::halt();
    }

    let Some(memory_map) = MEMORY_MAP_REQUEST.get_response() else {
        kprintln!("kernel: limine memory map response missing");
        kernel::halt();
    };
    let Some(hhdm) = HHDM_REQUEST.get_response() else {
        kprintln!("kernel: limine direct map response missing");
        kernel::halt();
    };
    let (Some(exec_file), Some(exec_addr)) = (
        EXECUTABLE_FILE_REQUEST.get_response(),
        EXECUTABLE_ADDRESS_REQUEST.get_response(),
    ) else {
        kprintln!("kernel: limine executable response missing");
        kernel::halt();
    };

    let kernel_start = exec_addr.physical_base();
    let kernel_end = kernel_start + exec_file.file().size();

    // The first module is the boot image.
    let boot_image = MODULE_REQUEST
        .get_response()
        .and_then(|response| response.modules().first().copied())
        .map(|module| {
            // SAFETY: the loader maps every module for the kernel's
            // lifetime and never reuses that memory.
            unsafe { core::slice::from_raw_parts(module.addr() as *const u8, module.size() as usize) }
        });

    let boot_info = build_boot_info(memory_map, kernel_start, kernel_end, boot_image);
    kernel::entry(boot_info, hhdm.offset())
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kprintln!("panic: {}", info);
    kernel::halt()
}
