use alloc::vec;
use alloc::vec::Vec;

use hal::{page_align_down, page_align_up, Errno, FrameAllocator, PhysAddr, PAGE_SIZE};

/// Size of a physical frame in bytes.
pub const FRAME_SIZE: u64 = PAGE_SIZE;

/// Bitmap allocator over one contiguous physical window.
///
/// Allocation is first fit over runs of free frames, so multi-page
/// requests are physically contiguous.
#[derive(Debug)]
pub struct BitmapAllocator {
    base: PhysAddr,
    frames: usize,
    used: Vec<u64>,
    free: usize,
    phys_offset: u64,
}

impl BitmapAllocator {
    /// Creates an allocator for `[start, end)` whose frames are reachable
    /// by the kernel at `phys + phys_offset`.
    pub fn new(start: PhysAddr, end: PhysAddr, phys_offset: u64) -> Self {
        let base = page_align_up(start);
        let end = page_align_down(end);
        let frames = if end > base {
            ((end - base) / FRAME_SIZE) as usize
        } else {
            0
        };
        Self {
            base,
            frames,
            used: vec![0; frames.div_ceil(64)],
            free: frames,
            phys_offset,
        }
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Returns true if the frame at `phys` is allocated.
    pub fn is_allocated(&self, phys: PhysAddr) -> bool {
        self.frame_index(phys).is_some_and(|index| self.test(index))
    }

    fn frame_index(&self, phys: PhysAddr) -> Option<usize> {
        if phys < self.base || phys % FRAME_SIZE != 0 {
            return None;
        }
        let index = ((phys - self.base) / FRAME_SIZE) as usize;
        (index < self.frames).then_some(index)
    }

    fn test(&self, index: usize) -> bool {
        self.used[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize, used: bool) {
        let word = &mut self.used[index / 64];
        let bit = 1 << (index % 64);
        if used {
            *word |= bit;
            self.free -= 1;
        } else {
            *word &= !bit;
            self.free += 1;
        }
    }

    fn find_run(&self, count: usize) -> Option<usize> {
        let mut start = 0;
        let mut run = 0;
        for index in 0..self.frames {
            if self.test(index) {
                run = 0;
                start = index + 1;
                continue;
            }
            run += 1;
            if run == count {
                return Some(start);
            }
        }
        None
    }
}

impl FrameAllocator for BitmapAllocator {
    fn allocate(&mut self, size: u64) -> Result<PhysAddr, Errno> {
        if size == 0 {
            return Err(Errno::InvalidArgument);
        }
        let count = (page_align_up(size) / FRAME_SIZE) as usize;
        if count > self.free {
            return Err(Errno::OutOfMemory);
        }
        let start = self.find_run(count).ok_or(Errno::OutOfMemory)?;
        for index in start..start + count {
            self.set(index, true);
        }
        Ok(self.base + start as u64 * FRAME_SIZE)
    }

    fn release(&mut self, phys: PhysAddr) -> Result<(), Errno> {
        let index = self.frame_index(phys).ok_or(Errno::InvalidArgument)?;
        if !self.test(index) {
            return Err(Errno::NotFound);
        }
        self.set(index, false);
        Ok(())
    }

    fn claim(&mut self, phys: PhysAddr, size: u64) -> Result<(), Errno> {
        if phys % FRAME_SIZE != 0 || size == 0 {
            return Err(Errno::InvalidArgument);
        }
        let pages = page_align_up(size) / FRAME_SIZE;
        let managed: Vec<usize> = (0..pages)
            .filter_map(|page| self.frame_index(phys + page * FRAME_SIZE))
            .collect();
        if managed.iter().any(|index| self.test(*index)) {
            return Err(Errno::AlreadyExists);
        }
        for index in managed {
            self.set(index, true);
        }
        Ok(())
    }

    fn phys_offset(&self) -> u64 {
        self.phys_offset
    }

    fn total(&self) -> u64 {
        self.frames as u64 * FRAME_SIZE
    }

    fn available(&self) -> u64 {
        self.free as u64 * FRAME_SIZE
    }
}
