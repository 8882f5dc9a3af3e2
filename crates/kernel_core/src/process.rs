use alloc::vec::Vec;
use core::mem::size_of;

use hal::{
    Access, Arch, CpuContext, Errno, FrameAllocator, MemoryMap, Range, Region, VirtAddr, PAGE_SIZE,
};
use kernel_abi::{encode_result, ProcessEvent, ProcessId};
use log::{trace, warn};

use crate::channel::{ChannelMode, MemoryChannel};
use crate::config::KERNEL_CHANNEL_TAG;
use crate::ipc::MessageQueue;
use crate::memory::{fill_physical, MemoryContext};
use crate::shares::{remove_shares, ProcessShares, ShareEndpoint};

/// Process execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessState {
    /// On the CPU now. At most one process per core.
    Running = 0,
    Ready = 1,
    /// Blocked on a timer or until woken.
    Sleeping = 2,
    /// Constructed but not yet scheduled.
    Stopped = 3,
    /// Blocked until another process terminates.
    Waiting = 4,
}

/// One execution context with its own address space.
#[derive(Debug)]
pub struct Process<A: Arch> {
    id: ProcessId,
    parent: ProcessId,
    state: ProcessState,
    privileged: bool,
    entry: VirtAddr,
    wait_target: Option<ProcessId>,
    wait_result: usize,
    wakeups: usize,
    sleep_deadline: Option<u64>,
    memory: MemoryContext<A::Paging>,
    kernel_channel: MemoryChannel<A::Cache>,
    kernel_channel_range: Range,
    shares: ProcessShares,
    context: A::Context,
    inbox: MessageQueue,
}

impl<A: Arch> Process<A> {
    /// Builds a stopped process with an empty address space and its kernel
    /// event channel.
    ///
    /// Nothing is left allocated if construction fails.
    pub fn new<F: FrameAllocator>(
        id: ProcessId,
        parent: ProcessId,
        entry: VirtAddr,
        privileged: bool,
        map: MemoryMap,
        core_id: u32,
        frames: &mut F,
    ) -> Result<Self, Errno> {
        let mut memory = MemoryContext::new(map, frames)?;
        let mut shares = ProcessShares::new(id);
        let (kernel_channel, kernel_channel_range) =
            match Self::attach_kernel_channel(&mut memory, &mut shares, core_id, frames) {
                Ok(channel) => channel,
                Err(err) => {
                    if let Err(release) = memory.release_region(Region::UserShare, frames) {
                        warn!(target: "proc", "{id:?} leaked its kernel channel: {release:?}");
                    }
                    memory.destroy(frames);
                    return Err(err);
                }
            };
        let stack = map.range(Region::UserStack);

        Ok(Self {
            id,
            parent,
            state: ProcessState::Stopped,
            privileged,
            entry,
            wait_target: None,
            wait_result: 0,
            wakeups: 0,
            sleep_deadline: None,
            memory,
            kernel_channel,
            kernel_channel_range,
            shares,
            context: A::Context::new(entry, stack.base + stack.size, privileged),
            inbox: MessageQueue::new(),
        })
    }

    fn attach_kernel_channel<F: FrameAllocator>(
        memory: &mut MemoryContext<A::Paging>,
        shares: &mut ProcessShares,
        core_id: u32,
        frames: &mut F,
    ) -> Result<(MemoryChannel<A::Cache>, Range), Errno> {
        let size = 2 * PAGE_SIZE;
        let virt = memory.find_free(size, Region::UserShare)?;
        let mut range = Range::new(virt, 0, size, Access::USER | Access::READABLE | Access::WRITABLE);
        memory.map_range(&mut range, frames)?;
        // SAFETY: map_range just allocated these pages for this channel.
        unsafe { fill_physical(frames, range.phys, size as usize, 0) };

        let mut channel = MemoryChannel::new(ChannelMode::Producer, size_of::<ProcessEvent>())?;
        let data = (range.phys + frames.phys_offset()) as *mut u8;
        let feedback = (range.phys + PAGE_SIZE + frames.phys_offset()) as *mut u8;
        // SAFETY: both pages stay mapped in the kernel direct map until the
        // kernel share is released in `destroy`, which unbinds first.
        unsafe { channel.set_virtual(data, feedback, true)? };
        shares.create_local_share(memory, ProcessId::KERNEL, core_id, KERNEL_CHANNEL_TAG, virt, size)?;
        Ok((channel, range))
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn parent(&self) -> ProcessId {
        self.parent
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ProcessState) {
        trace!(target: "proc", "{}: {:?} -> {state:?}", self.id, self.state);
        self.state = state;
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn entry(&self) -> VirtAddr {
        self.entry
    }

    /// Pending wakeups not yet consumed by `sleep`.
    pub fn wakeups(&self) -> usize {
        self.wakeups
    }

    /// Tick at which a timed sleep ends.
    pub fn sleep_deadline(&self) -> Option<u64> {
        self.sleep_deadline
    }

    /// Process this one is waiting for.
    pub fn wait_target(&self) -> Option<ProcessId> {
        self.wait_target
    }

    /// Exit status of the last awaited process.
    pub fn wait_result(&self) -> usize {
        self.wait_result
    }

    pub fn memory(&self) -> &MemoryContext<A::Paging> {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryContext<A::Paging> {
        &mut self.memory
    }

    pub fn shares(&self) -> &ProcessShares {
        &self.shares
    }

    pub(crate) fn shares_mut(&mut self) -> &mut ProcessShares {
        &mut self.shares
    }

    /// Share table and address space, borrowed together.
    pub fn share_endpoint(&mut self) -> ShareEndpoint<'_, A::Paging> {
        ShareEndpoint {
            shares: &mut self.shares,
            memory: &mut self.memory,
        }
    }

    /// User mapping of the kernel event channel: data page then feedback
    /// page.
    pub fn kernel_channel_range(&self) -> Range {
        self.kernel_channel_range
    }

    pub fn context(&self) -> &A::Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut A::Context {
        &mut self.context
    }

    pub fn inbox(&self) -> &MessageQueue {
        &self.inbox
    }

    pub fn inbox_mut(&mut self) -> &mut MessageQueue {
        &mut self.inbox
    }

    /// Puts the process to sleep until woken or until `deadline`.
    ///
    /// A wakeup that arrived earlier is consumed instead and reported as
    /// `WakeupPending`, leaving the state unchanged.
    pub fn sleep(&mut self, deadline: Option<u64>, ignore_wakeups: bool) -> Result<(), Errno> {
        if !matches!(self.state, ProcessState::Running | ProcessState::Ready) {
            return Err(Errno::InvalidArgument);
        }
        if self.wakeups == 0 || ignore_wakeups {
            self.set_state(ProcessState::Sleeping);
            self.sleep_deadline = deadline;
            Ok(())
        } else {
            self.wakeups = 0;
            Err(Errno::WakeupPending)
        }
    }

    /// Records a wakeup and makes a sleeping process ready.
    ///
    /// Returns `WakeupPending` if the process was not sleeping; the wakeup
    /// is then kept for its next `sleep`.
    pub fn wakeup(&mut self) -> Result<(), Errno> {
        self.wakeups += 1;
        if self.state == ProcessState::Sleeping {
            self.set_state(ProcessState::Ready);
            self.sleep_deadline = None;
            Ok(())
        } else {
            Err(Errno::WakeupPending)
        }
    }

    /// Ends a timed sleep whose deadline has passed.
    pub(crate) fn expire_sleep(&mut self, now: u64) -> bool {
        match (self.state, self.sleep_deadline) {
            (ProcessState::Sleeping, Some(deadline)) if deadline <= now => {
                self.set_state(ProcessState::Ready);
                self.sleep_deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Blocks until `target` terminates.
    pub fn wait(&mut self, target: ProcessId) -> Result<(), Errno> {
        if !matches!(self.state, ProcessState::Running | ProcessState::Ready) {
            return Err(Errno::InvalidArgument);
        }
        self.wait_target = Some(target);
        self.set_state(ProcessState::Waiting);
        Ok(())
    }

    /// Completes a wait with the exit status of the awaited process.
    ///
    /// The status also becomes the return value of the pending call.
    pub fn join(&mut self, status: usize) -> Result<(), Errno> {
        if self.state != ProcessState::Waiting {
            return Err(Errno::InvalidArgument);
        }
        self.wait_target = None;
        self.wait_result = status;
        self.context.set_return_value(encode_result(Ok(status)));
        self.set_state(ProcessState::Ready);
        Ok(())
    }

    /// Delivers an event through the kernel channel and wakes the process.
    pub fn raise_event(&mut self, event: &ProcessEvent) -> Result<(), Errno> {
        self.kernel_channel.write_record(event)?;
        self.kernel_channel.flush();
        let _ = self.wakeup();
        Ok(())
    }

    /// Restarts execution at `entry`. Queued messages are dropped.
    pub fn reset(&mut self, entry: VirtAddr) {
        self.entry = entry;
        self.context.reset(entry);
        self.inbox.clear();
    }

    /// Frees every resource of the process.
    ///
    /// Shares with live peers must already have been detached by the
    /// caller. Anything still recorded is treated as peerless.
    pub fn destroy<F: FrameAllocator>(mut self, frames: &mut F) {
        self.kernel_channel.unbind();
        let mut peers: Vec<ProcessId> = self.shares.iter().map(|share| share.pid).collect();
        peers.dedup();
        for pid in peers {
            if let Err(err) = remove_shares(self.share_endpoint(), None, pid, frames) {
                warn!(target: "proc", "{:?} kept shares with {pid:?}: {err:?}", self.id);
            }
        }
        for region in Region::USER_OWNED.into_iter().chain([Region::UserShare]) {
            if let Err(err) = self.memory.release_region(region, frames) {
                warn!(target: "proc", "{:?} leaked part of {region:?}: {err:?}", self.id);
            }
        }
        self.memory.destroy(frames);
    }
}
