use std::alloc::{alloc_zeroed, dealloc, Layout};

use hal::{PhysAddr, PAGE_SIZE};

/// Page-aligned arena standing in for physical memory.
///
/// Addresses handed out by an allocator over this arena are real host
/// pointers, so the direct-map offset is zero.
#[derive(Debug)]
pub struct HostMemory {
    base: *mut u8,
    layout: Layout,
}

impl HostMemory {
    /// Allocates an arena of `pages` zeroed pages.
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages.max(1) * PAGE_SIZE as usize, PAGE_SIZE as usize)
            .expect("arena layout should be valid");
        // SAFETY: layout has a non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "host arena allocation failed");
        Self { base, layout }
    }

    /// First physical address of the arena.
    pub fn base(&self) -> PhysAddr {
        self.base as PhysAddr
    }

    /// Size of the arena in bytes.
    pub fn size(&self) -> u64 {
        self.layout.size() as u64
    }

    /// Returns true if `phys` lies inside the arena.
    pub fn contains(&self, phys: PhysAddr) -> bool {
        phys >= self.base() && phys < self.base() + self.size()
    }

    /// Reads `len` bytes at `phys`.
    pub fn read(&self, phys: PhysAddr, len: usize) -> Vec<u8> {
        assert!(self.contains(phys) && self.contains(phys + len as u64 - 1));
        // SAFETY: the range was checked to lie inside the arena.
        unsafe { std::slice::from_raw_parts(phys as *const u8, len).to_vec() }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: base was returned by alloc_zeroed with this layout.
        unsafe { dealloc(self.base, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_is_page_aligned_and_zeroed() {
        let memory = HostMemory::new(4);
        assert_eq!(memory.base() % PAGE_SIZE, 0);
        assert_eq!(memory.size(), 4 * PAGE_SIZE);
        assert!(memory.read(memory.base(), 64).iter().all(|byte| *byte == 0));
        assert!(!memory.contains(memory.base() + memory.size()));
    }
}
