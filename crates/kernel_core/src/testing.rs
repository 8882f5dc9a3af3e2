//! Host fixtures shared by the unit tests.

use alloc::string::String;
use alloc::vec::Vec;
use core::mem::size_of;

use arch_host::{HostArch, HostCache, HostMemory};
use hal::{Access, Arch, Errno, Range, VirtAddr, PAGE_SIZE};
use kernel_abi::{decode_result, BootProcess, ProcessEvent, ProcessId};

use crate::channel::{ChannelMode, MemoryChannel};
use crate::config::KernelConfig;
use crate::kernel::Kernel;
use crate::pmm::BitmapAllocator;
use crate::process::Process;

pub(crate) const USER_RW: Access = Access::READABLE
    .union(Access::WRITABLE)
    .union(Access::USER);

/// Host arena plus an allocator handing out its pages.
pub(crate) struct TestMemory {
    pub arena: HostMemory,
    pub frames: BitmapAllocator,
}

impl TestMemory {
    pub fn new(pages: usize) -> Self {
        let arena = HostMemory::new(pages);
        let frames = BitmapAllocator::new(arena.base(), arena.base() + arena.size(), 0);
        Self { arena, frames }
    }
}

/// Kernel instance backed by its own arena.
///
/// The kernel is declared first so it is dropped before the arena.
pub(crate) struct TestKernel {
    pub kernel: Kernel<HostArch, BitmapAllocator>,
    _arena: HostMemory,
}

impl TestKernel {
    pub fn new(pages: usize) -> Self {
        let arena = HostMemory::new(pages);
        let frames = BitmapAllocator::new(arena.base(), arena.base() + arena.size(), 0);
        Self {
            kernel: Kernel::new(frames, KernelConfig::default()),
            _arena: arena,
        }
    }
}

/// User scratch page mapped by [`TestKernel::boot`].
pub(crate) const BUFFER: VirtAddr = 0x3000_0000;

/// Boot entry without segments.
pub(crate) fn boot_entry(name: &str, privileged: bool) -> BootProcess {
    BootProcess {
        name: name.into(),
        privileged,
        entry: 0x40_0000,
        args: String::new(),
        segments: Vec::new(),
    }
}

impl TestKernel {
    /// Loads one process per flag and maps a scratch page at `BUFFER` in
    /// each.
    pub fn boot(&mut self, privileged: &[bool]) -> Vec<ProcessId> {
        let image: Vec<BootProcess> = privileged
            .iter()
            .enumerate()
            .map(|(index, privileged)| boot_entry(&alloc::format!("p{index}"), *privileged))
            .collect();
        let ids = self
            .kernel
            .load_boot_processes(&image)
            .expect("boot image should load");
        for id in &ids {
            let mut range = Range::new(BUFFER, 0, PAGE_SIZE, USER_RW);
            self.kernel
                .processes
                .get_mut(*id)
                .expect("process should exist")
                .memory_mut()
                .map_range(&mut range, &mut self.kernel.frames)
                .expect("scratch page should map");
        }
        ids
    }

    /// Issues a system call as `pid`, switching to it first.
    pub fn call(&mut self, pid: ProcessId, number: usize, args: [usize; 5]) -> Result<usize, Errno> {
        if self.kernel.processes.current() != Some(pid) {
            self.kernel
                .schedule(Some(pid))
                .expect("caller should be runnable");
        }
        let word = self
            .kernel
            .api(number, args)
            .expect("some process should stay runnable");
        decode_result(word)
    }

    /// Writes into the user memory of `pid`.
    pub fn poke(&mut self, pid: ProcessId, virt: VirtAddr, data: &[u8]) {
        self.kernel
            .processes
            .get_mut(pid)
            .expect("process should exist")
            .memory_mut()
            .write_bytes(virt, data)
            .expect("user memory should be writable");
    }

    /// Reads the user memory of `pid`.
    pub fn peek(&self, pid: ProcessId, virt: VirtAddr, len: usize) -> Vec<u8> {
        let mut data = alloc::vec![0; len];
        self.kernel
            .processes
            .get(pid)
            .expect("process should exist")
            .memory()
            .read_bytes(virt, &mut data)
            .expect("user memory should be readable");
        data
    }
}

/// Drains the kernel event channel of a host process.
pub(crate) fn take_events<A: Arch>(process: &Process<A>) -> Vec<ProcessEvent> {
    let range = process.kernel_channel_range();
    let mut consumer = MemoryChannel::<HostCache>::new(ChannelMode::Consumer, size_of::<ProcessEvent>())
        .expect("consumer should be created");
    // SAFETY: the host direct map is the identity and the channel pages stay
    // mapped while the process lives.
    unsafe {
        consumer
            .set_virtual(range.phys as *mut u8, (range.phys + PAGE_SIZE) as *mut u8, false)
            .expect("consumer should bind");
    }
    let mut events = Vec::new();
    while let Ok(event) = consumer.read_record::<ProcessEvent>() {
        events.push(event);
    }
    events
}
