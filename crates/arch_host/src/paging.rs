use std::cell::Cell;
use std::collections::BTreeMap;

use hal::{is_page_aligned, Access, Errno, FrameAllocator, PagingOps, PhysAddr, VirtAddr, PAGE_SIZE};

const ENTRIES_PER_TABLE: u64 = 512;
const DIRECTORY_SPAN: u64 = ENTRIES_PER_TABLE * PAGE_SIZE;

#[derive(Debug, Clone, Copy)]
struct Entry {
    phys: PhysAddr,
    access: Access,
}

#[derive(Debug)]
struct Directory {
    frame: PhysAddr,
    entries: BTreeMap<u64, Entry>,
}

/// Two-level software page table.
///
/// Each 2 MiB window needs a directory page taken from the frame
/// allocator, like an intermediate hardware table level.
#[derive(Debug)]
pub struct HostPaging {
    root: PhysAddr,
    directories: BTreeMap<u64, Directory>,
    activations: Cell<usize>,
    flushes: Cell<usize>,
}

impl HostPaging {
    /// Number of times these tables were activated.
    pub fn activation_count(&self) -> usize {
        self.activations.get()
    }

    /// Number of single-page translation flushes.
    pub fn flush_count(&self) -> usize {
        self.flushes.get()
    }

    /// Number of directory pages currently allocated.
    pub fn directory_count(&self) -> usize {
        self.directories.len()
    }

    fn entry(&self, virt: VirtAddr) -> Result<&Entry, Errno> {
        self.directories
            .get(&(virt / DIRECTORY_SPAN))
            .and_then(|directory| directory.entries.get(&(virt / PAGE_SIZE)))
            .ok_or(Errno::InvalidAddress)
    }
}

impl PagingOps for HostPaging {
    fn create<F: FrameAllocator>(frames: &mut F) -> Result<Self, Errno> {
        let root = frames.allocate(PAGE_SIZE)?;
        Ok(Self {
            root,
            directories: BTreeMap::new(),
            activations: Cell::new(0),
            flushes: Cell::new(0),
        })
    }

    fn map<F: FrameAllocator>(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        access: Access,
        frames: &mut F,
    ) -> Result<(), Errno> {
        if !is_page_aligned(virt) || !is_page_aligned(phys) {
            return Err(Errno::InvalidArgument);
        }
        let key = virt / DIRECTORY_SPAN;
        if !self.directories.contains_key(&key) {
            let frame = frames.allocate(PAGE_SIZE)?;
            self.directories.insert(
                key,
                Directory {
                    frame,
                    entries: BTreeMap::new(),
                },
            );
        }
        let directory = self
            .directories
            .get_mut(&key)
            .ok_or(Errno::OutOfMemory)?;
        let page = virt / PAGE_SIZE;
        if directory.entries.contains_key(&page) {
            return Err(Errno::AlreadyExists);
        }
        directory.entries.insert(page, Entry { phys, access });
        Ok(())
    }

    fn unmap(&mut self, virt: VirtAddr) -> Result<(), Errno> {
        if !is_page_aligned(virt) {
            return Err(Errno::InvalidArgument);
        }
        if let Some(directory) = self.directories.get_mut(&(virt / DIRECTORY_SPAN)) {
            directory.entries.remove(&(virt / PAGE_SIZE));
        }
        Ok(())
    }

    fn lookup(&self, virt: VirtAddr) -> Result<PhysAddr, Errno> {
        Ok(self.entry(virt)?.phys + virt % PAGE_SIZE)
    }

    fn access(&self, virt: VirtAddr) -> Result<Access, Errno> {
        Ok(self.entry(virt)?.access)
    }

    fn activate(&self) {
        self.activations.set(self.activations.get() + 1);
    }

    fn flush(&self, _virt: VirtAddr) {
        self.flushes.set(self.flushes.get() + 1);
    }

    fn root(&self) -> PhysAddr {
        self.root
    }

    fn release_tables<F: FrameAllocator>(&mut self, frames: &mut F) {
        for (_, directory) in std::mem::take(&mut self.directories) {
            let _ = frames.release(directory.frame);
        }
        let _ = frames.release(self.root);
    }
}
