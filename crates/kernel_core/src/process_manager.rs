use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use hal::{Arch, Errno, FrameAllocator, MemoryMap, VirtAddr};
use kernel_abi::{ProcessEvent, ProcessEventKind, ProcessId};
use log::{debug, info, warn};

use crate::process::{Process, ProcessState};
use crate::scheduler::Scheduler;
use crate::shares::remove_shares;

struct Slot<A: Arch> {
    generation: u16,
    process: Option<Process<A>>,
}

/// Result of a scheduling pass that changed the running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub from: Option<ProcessId>,
    pub to: ProcessId,
}

/// Table of every process on one core.
///
/// Slots are reused after removal with a bumped generation, so ids held
/// from before the reuse stop resolving.
pub struct ProcessManager<A: Arch> {
    slots: Vec<Slot<A>>,
    max_processes: usize,
    core_id: u32,
    scheduler: Scheduler,
    current: Option<ProcessId>,
    previous: Option<ProcessId>,
    idle: Option<ProcessId>,
    irq_watchers: BTreeMap<u32, Vec<ProcessId>>,
}

impl<A: Arch> ProcessManager<A> {
    /// Creates an empty table.
    pub fn new(core_id: u32, max_processes: usize) -> Self {
        Self {
            slots: Vec::new(),
            max_processes: max_processes.min(ProcessId::ANY.index() as usize - 3),
            core_id,
            scheduler: Scheduler::new(),
            current: None,
            previous: None,
            idle: None,
            irq_watchers: BTreeMap::new(),
        }
    }

    /// Core this table belongs to.
    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    /// Creates a stopped process.
    ///
    /// The slot stays free if the process cannot be constructed.
    pub fn create<F: FrameAllocator>(
        &mut self,
        parent: ProcessId,
        entry: VirtAddr,
        map: MemoryMap,
        privileged: bool,
        frames: &mut F,
    ) -> Result<ProcessId, Errno> {
        let index = match self.slots.iter().position(|slot| slot.process.is_none()) {
            Some(index) => index,
            None if self.slots.len() < self.max_processes => {
                self.slots.push(Slot {
                    generation: 0,
                    process: None,
                });
                self.slots.len() - 1
            }
            None => return Err(Errno::OutOfMemory),
        };
        let slot = &mut self.slots[index];
        let id = ProcessId::for_index_and_gen(index as u16, slot.generation);
        let process = Process::new(id, parent, entry, privileged, map, self.core_id, frames)?;
        slot.process = Some(process);
        info!(target: "proc", "created {id:?} parent {parent:?} entry {entry:#x}");
        Ok(id)
    }

    fn slot_of(&self, id: ProcessId) -> Result<usize, Errno> {
        if id.is_sentinel() {
            return Err(Errno::NotFound);
        }
        let index = id.index() as usize;
        match self.slots.get(index) {
            Some(slot) if slot.generation == id.generation() && slot.process.is_some() => Ok(index),
            _ => Err(Errno::NotFound),
        }
    }

    /// Looks up a live process.
    pub fn get(&self, id: ProcessId) -> Result<&Process<A>, Errno> {
        let index = self.slot_of(id)?;
        self.slots[index].process.as_ref().ok_or(Errno::NotFound)
    }

    /// Looks up a live process for mutation.
    pub fn get_mut(&mut self, id: ProcessId) -> Result<&mut Process<A>, Errno> {
        let index = self.slot_of(id)?;
        self.slots[index].process.as_mut().ok_or(Errno::NotFound)
    }

    /// Borrows two different processes at once.
    pub fn pair_mut(
        &mut self,
        a: ProcessId,
        b: ProcessId,
    ) -> Result<(&mut Process<A>, &mut Process<A>), Errno> {
        let (ia, ib) = (self.slot_of(a)?, self.slot_of(b)?);
        if ia == ib {
            return Err(Errno::InvalidArgument);
        }
        let (low, high) = (ia.min(ib), ia.max(ib));
        let (head, tail) = self.slots.split_at_mut(high);
        let low_process = head[low].process.as_mut().ok_or(Errno::NotFound)?;
        let high_process = tail[0].process.as_mut().ok_or(Errno::NotFound)?;
        Ok(if ia < ib {
            (low_process, high_process)
        } else {
            (high_process, low_process)
        })
    }

    /// Replaces `SELF` by the running process.
    pub fn resolve(&self, id: ProcessId) -> Result<ProcessId, Errno> {
        if id.is_self() {
            self.current.ok_or(Errno::NotFound)
        } else {
            self.get(id).map(Process::id)
        }
    }

    /// Running process.
    pub fn current(&self) -> Option<ProcessId> {
        self.current
    }

    /// Process that ran before the last switch.
    pub fn previous(&self) -> Option<ProcessId> {
        self.previous
    }

    /// Process selected when nothing else is ready.
    pub fn idle(&self) -> Option<ProcessId> {
        self.idle
    }

    pub fn current_process(&self) -> Result<&Process<A>, Errno> {
        self.get(self.current.ok_or(Errno::NotFound)?)
    }

    pub fn current_process_mut(&mut self) -> Result<&mut Process<A>, Errno> {
        self.get_mut(self.current.ok_or(Errno::NotFound)?)
    }

    /// Registers the idle process.
    pub fn set_idle(&mut self, id: ProcessId) -> Result<(), Errno> {
        self.get(id)?;
        self.idle = Some(id);
        debug!(target: "sched", "idle process is {id:?}");
        Ok(())
    }

    /// Number of live processes.
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.process.is_some()).count()
    }

    /// Iterates over every live process.
    pub fn iter(&self) -> impl Iterator<Item = &Process<A>> {
        self.slots.iter().filter_map(|slot| slot.process.as_ref())
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Process<A>> {
        self.slots.iter_mut().filter_map(|slot| slot.process.as_mut())
    }

    /// Destroys a process.
    ///
    /// Shares with live peers are detached and each peer receives a
    /// `ProcessTerminated` event. Processes waiting for `id` become ready
    /// with `status` as their wait result.
    pub fn remove<F: FrameAllocator>(
        &mut self,
        id: ProcessId,
        status: usize,
        frames: &mut F,
    ) -> Result<(), Errno> {
        let index = self.slot_of(id)?;
        let peers = self.get(id)?.shares().peers();
        for peer in peers {
            match self.pair_mut(id, peer) {
                Ok((dying, other)) => {
                    if let Err(err) = remove_shares(dying.share_endpoint(), Some(other.shares_mut()), peer, frames) {
                        warn!(target: "proc", "detaching {id:?} from {peer:?} failed: {err:?}");
                    }
                    let event = ProcessEvent::new(ProcessEventKind::ProcessTerminated, id.raw());
                    if let Err(err) = other.raise_event(&event) {
                        warn!(target: "proc", "{peer:?} missed termination of {id:?}: {err:?}");
                    }
                }
                Err(_) => {
                    let dying = self.get_mut(id)?;
                    if let Err(err) = remove_shares(dying.share_endpoint(), None, peer, frames) {
                        warn!(target: "proc", "detaching {id:?} from gone {peer:?} failed: {err:?}");
                    }
                }
            }
        }

        let slot = &mut self.slots[index];
        let process = slot.process.take().ok_or(Errno::NotFound)?;
        slot.generation = slot.generation.wrapping_add(1);
        for reference in [&mut self.current, &mut self.previous, &mut self.idle] {
            if *reference == Some(id) {
                *reference = None;
            }
        }
        for watchers in self.irq_watchers.values_mut() {
            watchers.retain(|watcher| *watcher != id);
        }
        for waiter in self.iter_mut() {
            if waiter.state() == ProcessState::Waiting && waiter.wait_target() == Some(id) {
                let _ = waiter.join(status);
            }
        }
        process.destroy(frames);
        info!(target: "proc", "removed {id:?} status {status}");
        Ok(())
    }

    pub(crate) fn expire_timers(&mut self, now: u64) {
        for process in self.iter_mut() {
            if process.expire_sleep(now) {
                debug!(target: "sched", "{:?} timer expired", process.id());
            }
        }
    }

    /// Chooses the next process and switches to it.
    ///
    /// Sleep timers are checked first. With an explicit `target` that
    /// process runs if it is runnable. Otherwise the next ready process in
    /// round-robin order runs, falling back to the idle process. Returns
    /// `Ok(None)` if the running process stays on the CPU and `NotFound`
    /// if nothing at all can run.
    pub fn schedule(&mut self, now: u64, target: Option<ProcessId>) -> Result<Option<Switch>, Errno> {
        self.expire_timers(now);
        let next = match target {
            Some(target) => {
                let process = self.get(target)?;
                match process.state() {
                    ProcessState::Ready | ProcessState::Running | ProcessState::Stopped => target,
                    _ => return Err(Errno::InvalidArgument),
                }
            }
            None => match self.select_ready() {
                Some(id) => id,
                None => self.idle.ok_or(Errno::NotFound)?,
            },
        };
        self.switch_to(next)
    }

    fn select_ready(&mut self) -> Option<ProcessId> {
        let idle = self.idle;
        let slots = &self.slots;
        let index = self.scheduler.select(slots.len(), |index| {
            slots[index].process.as_ref().is_some_and(|process| {
                Some(process.id()) != idle
                    && matches!(process.state(), ProcessState::Ready | ProcessState::Running)
            })
        })?;
        self.slots[index].process.as_ref().map(Process::id)
    }

    fn switch_to(&mut self, next: ProcessId) -> Result<Option<Switch>, Errno> {
        if self.current == Some(next) {
            self.get_mut(next)?.set_state(ProcessState::Running);
            return Ok(None);
        }
        self.get(next)?;
        let from = self.current;
        if let Some(previous) = from.and_then(|id| self.get_mut(id).ok()) {
            if previous.state() == ProcessState::Running {
                previous.set_state(ProcessState::Ready);
            }
            previous.memory_mut().deactivate();
        }
        let process = self.get_mut(next)?;
        process.set_state(ProcessState::Running);
        process.memory_mut().activate();
        self.previous = from;
        self.current = Some(next);
        debug!(target: "sched", "switch {from:?} -> {next:?}");
        Ok(Some(Switch { from, to: next }))
    }

    /// Wakes a process. A wakeup for a process that is not sleeping is
    /// kept for its next sleep.
    pub fn wakeup(&mut self, id: ProcessId) -> Result<(), Errno> {
        match self.get_mut(id)?.wakeup() {
            Ok(()) | Err(Errno::WakeupPending) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Puts a process to sleep.
    pub fn sleep(&mut self, id: ProcessId, deadline: Option<u64>, ignore_wakeups: bool) -> Result<(), Errno> {
        self.get_mut(id)?.sleep(deadline, ignore_wakeups)
    }

    /// Blocks `waiter` until `target` terminates.
    pub fn wait(&mut self, waiter: ProcessId, target: ProcessId) -> Result<(), Errno> {
        if waiter == target {
            return Err(Errno::InvalidArgument);
        }
        self.get(target)?;
        self.get_mut(waiter)?.wait(target)
    }

    /// Takes a process off the CPU until resumed.
    pub fn stop(&mut self, id: ProcessId) -> Result<(), Errno> {
        self.get_mut(id)?.set_state(ProcessState::Stopped);
        Ok(())
    }

    /// Makes a stopped process ready. Other states are left alone.
    pub fn resume(&mut self, id: ProcessId) -> Result<(), Errno> {
        let process = self.get_mut(id)?;
        if process.state() == ProcessState::Stopped {
            process.set_state(ProcessState::Ready);
        }
        Ok(())
    }

    /// Restarts a process at `entry`.
    pub fn reset(&mut self, id: ProcessId, entry: VirtAddr) -> Result<(), Errno> {
        self.get_mut(id)?.reset(entry);
        Ok(())
    }

    /// Delivers an event to one process.
    pub fn raise_event(&mut self, id: ProcessId, event: &ProcessEvent) -> Result<(), Errno> {
        self.get_mut(id)?.raise_event(event)
    }

    /// Subscribes a process to an interrupt vector.
    pub fn watch_interrupt(&mut self, id: ProcessId, vector: u32) -> Result<(), Errno> {
        self.get(id)?;
        let watchers = self.irq_watchers.entry(vector).or_default();
        if !watchers.contains(&id) {
            watchers.push(id);
        }
        Ok(())
    }

    /// Raises an `Interrupt` event on every watcher of `vector`.
    ///
    /// Returns the number of processes notified.
    pub fn interrupt_notify(&mut self, vector: u32) -> usize {
        let watchers = self.irq_watchers.get(&vector).cloned().unwrap_or_default();
        let event = ProcessEvent::new(ProcessEventKind::Interrupt, vector);
        let mut notified = 0;
        for id in watchers {
            match self.raise_event(id, &event) {
                Ok(()) => notified += 1,
                Err(err) => warn!(target: "proc", "irq {vector} not delivered to {id:?}: {err:?}"),
            }
        }
        notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shares::{create_share, ShareRequest, ShareState};
    use crate::testing::{take_events, TestMemory, USER_RW};
    use arch_host::{HostArch, HostCache};
    use hal::PAGE_SIZE;

    fn spawn(manager: &mut ProcessManager<HostArch>, memory: &mut TestMemory) -> ProcessId {
        let id = manager
            .create(ProcessId::KERNEL, 0x40_0000, HostArch::memory_map(), false, &mut memory.frames)
            .expect("create should succeed");
        manager.resume(id).expect("resume should succeed");
        id
    }

    #[test]
    fn ids_follow_creation_order() {
        let mut memory = TestMemory::new(64);
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        assert_eq!(spawn(&mut manager, &mut memory), ProcessId::CORE_SERVER);
        assert_eq!(spawn(&mut manager, &mut memory), ProcessId::ROOT_FILESYSTEM);
        assert_eq!(manager.count(), 2);
    }

    #[test]
    fn stale_id_is_rejected_after_slot_reuse() {
        let mut memory = TestMemory::new(64);
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        let first = spawn(&mut manager, &mut memory);
        manager
            .remove(first, 0, &mut memory.frames)
            .expect("remove should succeed");
        let second = spawn(&mut manager, &mut memory);
        assert_eq!(second.index(), first.index());
        assert_eq!(second, first.next_generation());
        assert_eq!(manager.get(first).err(), Some(Errno::NotFound));
        assert!(manager.get(second).is_ok());
    }

    #[test]
    fn full_table_reports_out_of_memory() {
        let mut memory = TestMemory::new(64);
        let mut manager = ProcessManager::<HostArch>::new(0, 1);
        spawn(&mut manager, &mut memory);
        let free = memory.frames.free_count();
        let result = manager.create(ProcessId::KERNEL, 0, HostArch::memory_map(), false, &mut memory.frames);
        assert_eq!(result, Err(Errno::OutOfMemory));
        assert_eq!(memory.frames.free_count(), free);
    }

    #[test]
    fn schedule_rotates_and_falls_back_to_idle() {
        let mut memory = TestMemory::new(64);
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        let idle = spawn(&mut manager, &mut memory);
        let a = spawn(&mut manager, &mut memory);
        let b = spawn(&mut manager, &mut memory);
        manager.set_idle(idle).expect("idle should be set");

        let first = manager.schedule(0, None).expect("schedule should succeed");
        assert_eq!(first, Some(Switch { from: None, to: a }));
        assert!(manager.get(a).expect("a exists").memory().is_active());
        let second = manager.schedule(0, None).expect("schedule should succeed");
        assert_eq!(second, Some(Switch { from: Some(a), to: b }));
        assert_eq!(manager.get(a).expect("a exists").state(), ProcessState::Ready);
        assert!(!manager.get(a).expect("a exists").memory().is_active());

        manager.sleep(a, None, false).expect("sleep should succeed");
        manager.sleep(b, None, false).expect("sleep should succeed");
        let third = manager.schedule(0, None).expect("schedule should succeed");
        assert_eq!(third.map(|switch| switch.to), Some(idle));
        assert_eq!(manager.previous(), Some(b));
        assert_eq!(manager.get(b).expect("b exists").state(), ProcessState::Sleeping);
    }

    #[test]
    fn running_process_keeps_cpu_when_alone() {
        let mut memory = TestMemory::new(64);
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        let a = spawn(&mut manager, &mut memory);
        manager.schedule(0, None).expect("schedule should succeed");
        assert_eq!(manager.schedule(0, None), Ok(None));
        assert_eq!(manager.current(), Some(a));
    }

    #[test]
    fn nothing_to_run_is_an_error() {
        let mut memory = TestMemory::new(64);
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        let a = spawn(&mut manager, &mut memory);
        manager.stop(a).expect("stop should succeed");
        assert_eq!(manager.schedule(0, None), Err(Errno::NotFound));
    }

    #[test]
    fn explicit_target_promotes_stopped_and_rejects_sleeping() {
        let mut memory = TestMemory::new(64);
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        let a = spawn(&mut manager, &mut memory);
        let b = spawn(&mut manager, &mut memory);
        manager.stop(b).expect("stop should succeed");
        let switch = manager.schedule(0, Some(b)).expect("schedule should succeed");
        assert_eq!(switch.map(|switch| switch.to), Some(b));
        assert_eq!(manager.get(b).expect("b exists").state(), ProcessState::Running);

        manager.sleep(a, None, false).expect("sleep should succeed");
        assert_eq!(manager.schedule(0, Some(a)), Err(Errno::InvalidArgument));
    }

    #[test]
    fn sleep_timer_expires_before_selection() {
        let mut memory = TestMemory::new(64);
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        let idle = spawn(&mut manager, &mut memory);
        let a = spawn(&mut manager, &mut memory);
        manager.set_idle(idle).expect("idle should be set");
        manager.sleep(a, Some(5), false).expect("sleep should succeed");

        let early = manager.schedule(4, None).expect("schedule should succeed");
        assert_eq!(early.map(|switch| switch.to), Some(idle));
        let late = manager.schedule(5, None).expect("schedule should succeed");
        assert_eq!(late.map(|switch| switch.to), Some(a));
        assert_eq!(manager.get(a).expect("a exists").wakeups(), 0);
    }

    #[test]
    fn waiter_receives_exit_status() {
        let mut memory = TestMemory::new(64);
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        let waiter = spawn(&mut manager, &mut memory);
        let target = spawn(&mut manager, &mut memory);
        assert_eq!(manager.wait(waiter, waiter), Err(Errno::InvalidArgument));
        manager.wait(waiter, target).expect("wait should succeed");
        assert_eq!(manager.get(waiter).expect("waiter exists").state(), ProcessState::Waiting);

        manager
            .remove(target, 7, &mut memory.frames)
            .expect("remove should succeed");
        let waiter = manager.get(waiter).expect("waiter exists");
        assert_eq!(waiter.state(), ProcessState::Ready);
        assert_eq!(waiter.wait_result(), 7);
    }

    #[test]
    fn removing_current_clears_scheduler_references() {
        let mut memory = TestMemory::new(64);
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        let a = spawn(&mut manager, &mut memory);
        manager.set_idle(a).expect("idle should be set");
        manager.schedule(0, None).expect("schedule should succeed");
        manager.remove(a, 0, &mut memory.frames).expect("remove should succeed");
        assert_eq!(manager.current(), None);
        assert_eq!(manager.idle(), None);
    }

    #[test]
    fn termination_detaches_shares_and_notifies_peer() {
        let mut memory = TestMemory::new(96);
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        let a = spawn(&mut manager, &mut memory);
        let b = spawn(&mut manager, &mut memory);
        let request = ShareRequest {
            core_id: 0,
            tag_id: 9,
            size: 2 * PAGE_SIZE,
            access: USER_RW,
        };
        {
            let (pa, pb) = manager.pair_mut(a, b).expect("both processes exist");
            create_share(pa.share_endpoint(), pb.share_endpoint(), request, &HostCache::default(), &mut memory.frames)
                .expect("share should be created");
        }

        manager.remove(a, 0, &mut memory.frames).expect("remove should succeed");
        let peer = manager.get(b).expect("peer exists");
        let share = peer.shares().read_share(a, 0, 9).expect("peer keeps its record");
        assert_eq!(share.state, ShareState::DetachedRemote);
        let events = take_events(peer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_kind(), Ok(ProcessEventKind::ProcessTerminated));
        assert_eq!(events[0].number, a.raw());

        let before = memory.frames.free_count();
        let peer = manager.get_mut(b).expect("peer exists");
        let states = remove_shares(peer.share_endpoint(), None, a, &mut memory.frames)
            .expect("detach should succeed");
        assert_eq!(states, [ShareState::Released]);
        assert_eq!(memory.frames.free_count(), before + 2);
    }

    #[test]
    fn interrupts_reach_every_watcher() {
        let mut memory = TestMemory::new(64);
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        let a = spawn(&mut manager, &mut memory);
        let b = spawn(&mut manager, &mut memory);
        manager.watch_interrupt(a, 4).expect("watch should succeed");
        manager.watch_interrupt(a, 4).expect("watching twice is harmless");
        manager.watch_interrupt(b, 4).expect("watch should succeed");
        assert_eq!(manager.interrupt_notify(4), 2);
        assert_eq!(manager.interrupt_notify(5), 0);

        let events = take_events(manager.get(a).expect("a exists"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_kind(), Ok(ProcessEventKind::Interrupt));
        assert_eq!(events[0].number, 4);

        manager.remove(b, 0, &mut memory.frames).expect("remove should succeed");
        assert_eq!(manager.interrupt_notify(4), 1);
    }

    #[test]
    fn pair_mut_rejects_same_process() {
        let mut memory = TestMemory::new(64);
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        let a = spawn(&mut manager, &mut memory);
        let b = spawn(&mut manager, &mut memory);
        assert!(manager.pair_mut(a, a).is_err());
        let (first, second) = manager.pair_mut(b, a).expect("pair should resolve");
        assert_eq!((first.id(), second.id()), (b, a));
    }
}
