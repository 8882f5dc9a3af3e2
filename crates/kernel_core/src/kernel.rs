use alloc::vec::Vec;

use hal::{
    page_align_down, page_align_up, Access, Arch, CpuContext, Errno, FrameAllocator, Range,
    Region, PAGE_SIZE,
};
use kernel_abi::{encode_result, BootProcess, ProcessId};
use log::{debug, error, info};

use crate::config::{KernelConfig, BOOT_STACK_PAGES};
use crate::memory::{copy_to_physical, fill_physical};
use crate::process::ProcessState;
use crate::process_manager::{ProcessManager, Switch};

/// Scheduling request left behind by a system-call handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Yield {
    /// Keep running the caller if it is still runnable.
    Stay,
    /// Pick the next ready process.
    Next,
    /// Switch to this process.
    To(ProcessId),
}

/// One core's kernel instance: the frame allocator, the process table and
/// the tick counter, threaded through every entry point.
pub struct Kernel<A: Arch, F: FrameAllocator> {
    pub(crate) config: KernelConfig,
    pub(crate) frames: F,
    pub(crate) processes: ProcessManager<A>,
    pub(crate) cache: A::Cache,
    pub(crate) ticks: u64,
    pub(crate) yield_request: Yield,
}

impl<A: Arch, F: FrameAllocator> Kernel<A, F> {
    /// Creates a kernel with an empty process table.
    pub fn new(frames: F, config: KernelConfig) -> Self {
        info!(
            target: "boot",
            "{} core {} with {} KiB free",
            A::NAME,
            config.core_id,
            frames.available() / 1024
        );
        Self {
            processes: ProcessManager::new(config.core_id, config.max_processes),
            config,
            frames,
            cache: A::Cache::default(),
            ticks: 0,
            yield_request: Yield::Stay,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn frames(&self) -> &F {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut F {
        &mut self.frames
    }

    pub fn processes(&self) -> &ProcessManager<A> {
        &self.processes
    }

    pub fn processes_mut(&mut self) -> &mut ProcessManager<A> {
        &mut self.processes
    }

    /// Timer ticks since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Handles a system call from the running process.
    ///
    /// The encoded result is stored in the caller's context before any
    /// switch happens, and also returned. `Err` means no process is left to
    /// run.
    pub fn api(&mut self, number: usize, args: [usize; 5]) -> Result<usize, Errno> {
        let caller = self.processes.current().ok_or(Errno::NotFound)?;
        self.yield_request = Yield::Stay;
        let result = self.dispatch(caller, number, args);
        if let Err(err) = result {
            debug!(target: "api", "{caller:?} api {number} op {} failed: {err:?}", args[0]);
        }
        let word = encode_result(result);
        if let Ok(process) = self.processes.get_mut(caller) {
            process.context_mut().set_return_value(word);
        }

        let still_running = self
            .processes
            .get(caller)
            .is_ok_and(|process| process.state() == ProcessState::Running);
        match core::mem::replace(&mut self.yield_request, Yield::Stay) {
            Yield::To(target) => {
                self.schedule(Some(target))?;
            }
            Yield::Next => {
                self.schedule(None)?;
            }
            Yield::Stay if !still_running => {
                self.schedule(None)?;
            }
            Yield::Stay => {}
        }
        Ok(word)
    }

    /// Advances time by one tick.
    ///
    /// Expired sleepers become ready. The CPU only changes hands here if it
    /// is idle.
    pub fn timer_tick(&mut self) -> Result<Option<Switch>, Errno> {
        self.ticks += 1;
        if self.cpu_idle() {
            self.schedule(None)
        } else {
            self.processes.expire_timers(self.ticks);
            Ok(None)
        }
    }

    /// Notifies the watchers of an interrupt vector.
    pub fn interrupt(&mut self, vector: u32) -> Result<Option<Switch>, Errno> {
        let notified = self.processes.interrupt_notify(vector);
        if notified > 0 && self.cpu_idle() {
            self.schedule(None)
        } else {
            Ok(None)
        }
    }

    /// True when nothing but the idle process holds the CPU.
    fn cpu_idle(&self) -> bool {
        match self.processes.current_process() {
            Ok(process) => {
                Some(process.id()) == self.processes.idle()
                    || process.state() != ProcessState::Running
            }
            Err(_) => true,
        }
    }

    /// Runs a scheduling pass.
    pub fn schedule(&mut self, target: Option<ProcessId>) -> Result<Option<Switch>, Errno> {
        self.processes.schedule(self.ticks, target).inspect_err(|err| {
            error!(target: "sched", "no process to run (target {target:?}): {err:?}");
        })
    }

    /// Creates the boot process set and marks every entry ready.
    ///
    /// Processes are created in table order, so the first entries receive
    /// the well-known server ids. Any failure is fatal.
    pub fn load_boot_processes(&mut self, image: &[BootProcess]) -> Result<Vec<ProcessId>, Errno> {
        let mut loaded = Vec::with_capacity(image.len());
        for entry in image {
            let id = self.processes.create(
                ProcessId::KERNEL,
                entry.entry,
                A::memory_map(),
                entry.privileged,
                &mut self.frames,
            )?;
            if let Err(err) = self.load_boot_process(id, entry) {
                error!(target: "boot", "failed to load {}: {err:?}", entry.name);
                if let Err(remove) = self.processes.remove(id, 0, &mut self.frames) {
                    error!(target: "boot", "cannot unwind {id:?}: {remove:?}");
                }
                return Err(err);
            }
            info!(target: "boot", "loaded {} as {id:?} entry {:#x}", entry.name, entry.entry);
            loaded.push(id);
        }
        Ok(loaded)
    }

    fn load_boot_process(&mut self, id: ProcessId, entry: &BootProcess) -> Result<(), Errno> {
        let frames = &mut self.frames;
        let process = self.processes.get_mut(id)?;
        let map = *process.memory().memory_map();

        for segment in &entry.segments {
            let base = page_align_down(segment.virt);
            let end = segment
                .virt
                .checked_add(segment.size)
                .ok_or(Errno::InvalidArgument)?;
            let size = page_align_up(end) - base;
            let mut range = Range::new(base, 0, size, segment.access | Access::USER);
            process.memory_mut().map_range(&mut range, frames)?;
            // SAFETY: map_range just allocated these frames for the segment
            // and the parser keeps `data` within `size`.
            unsafe {
                fill_physical(frames, range.phys, size as usize, 0);
                copy_to_physical(frames, range.phys + (segment.virt - base), &segment.data);
            }
        }

        let args = entry.args.as_bytes();
        let mut range = Range::new(
            map.range(Region::UserArgs).base,
            0,
            page_align_up(args.len() as u64 + 1),
            Access::USER | Access::READABLE | Access::WRITABLE,
        );
        process.memory_mut().map_range(&mut range, frames)?;
        // SAFETY: freshly allocated for the argument page.
        unsafe {
            fill_physical(frames, range.phys, range.size as usize, 0);
            copy_to_physical(frames, range.phys, args);
        }

        let stack = map.range(Region::UserStack);
        let size = BOOT_STACK_PAGES * PAGE_SIZE;
        let mut range = Range::new(
            stack.base + stack.size - size,
            0,
            size,
            Access::USER | Access::READABLE | Access::WRITABLE,
        );
        process.memory_mut().map_range(&mut range, frames)?;
        // SAFETY: freshly allocated for the stack.
        unsafe { fill_physical(frames, range.phys, size as usize, 0) };
        process.context_mut().set_stack(stack.base + stack.size);

        self.processes.resume(id)
    }
}
