use core::alloc::Layout;

use linked_list_allocator::LockedHeap;

/// Holds the frame bitmap, the process table and every boot image copy.
const HEAP_SIZE: usize = 8 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[link_section = ".bss.heap"]
static mut HEAP_SPACE: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// Initializes the kernel heap allocator.
pub fn init_heap() {
    // SAFETY: called once before the first allocation; the heap array is
    // never touched directly afterwards.
    unsafe {
        ALLOCATOR
            .lock()
            .init(core::ptr::addr_of_mut!(HEAP_SPACE) as *mut u8, HEAP_SIZE);
    }
}

/// Bytes still free in the kernel heap.
pub fn free_bytes() -> usize {
    ALLOCATOR.lock().free()
}

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    log::error!(target: "heap", "out of kernel heap allocating {} bytes", layout.size());
    crate::halt()
}
