//! System-call handlers.
//!
//! Every call carries five argument words. Except for `SystemInfo`, whose
//! first word is the output pointer, the first word selects the operation:
//!
//! | api | arguments after the operation |
//! |---|---|
//! | `PrivExec` | text pointer, text length |
//! | `ProcessCtl` | pid, argument, second argument |
//! | `VmCtl` | pid, `RangeRecord` pointer |
//! | `VmShare` | pid, `ShareRecord` pointer |
//! | `VmCopy` | pid, local address, remote address, size |
//! | `IpcMessage` | pid, `Message` pointer, message size |
//! | `IoCtl` | port, width in bytes, value |

use core::str;

use hal::{page_align_up, Access, Arch, CacheOps, CpuContext, Errno, FrameAllocator, Range, Region, PAGE_SIZE};
use kernel_abi::{
    ApiNumber, IoCtlOp, IpcOp, Message, MessageKind, PrivExecOp, ProcessCtlOp, ProcessEvent,
    ProcessId, ProcessInfo, RangeRecord, ShareRecord, SystemInformation, TimerInfo, VmCopyOp,
    VmCtlOp, VmShareOp, MAX_MESSAGE_SIZE,
};
use log::{info, trace, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::config::CONSOLE_WRITE_MAX;
use crate::kernel::{Kernel, Yield};
use crate::protection::validate_user_buffer;
use crate::shares::{create_share, remove_shares, ShareRequest};

fn pid_arg(raw: usize) -> Result<ProcessId, Errno> {
    u32::try_from(raw)
        .map(ProcessId::from_raw)
        .map_err(|_| Errno::InvalidArgument)
}

impl<A: Arch, F: FrameAllocator> Kernel<A, F> {
    pub(crate) fn dispatch(
        &mut self,
        caller: ProcessId,
        number: usize,
        args: [usize; 5],
    ) -> Result<usize, Errno> {
        let api = ApiNumber::try_from(number)?;
        trace!(target: "api", "{caller:?} {api:?} {args:x?}");
        match api {
            ApiNumber::PrivExec => self.priv_exec(caller, PrivExecOp::try_from(args[0])?, args),
            ApiNumber::ProcessCtl => self.process_ctl(caller, ProcessCtlOp::try_from(args[0])?, args),
            ApiNumber::SystemInfo => self.system_info(caller, args[0]),
            ApiNumber::VmCopy => self.vm_copy(caller, VmCopyOp::try_from(args[0])?, args),
            ApiNumber::VmCtl => self.vm_ctl(caller, VmCtlOp::try_from(args[0])?, args),
            ApiNumber::VmShare => self.vm_share(caller, VmShareOp::try_from(args[0])?, args),
            ApiNumber::IpcMessage => self.ipc_message(caller, IpcOp::try_from(args[0])?, args),
            ApiNumber::IoCtl => self.io_ctl(caller, IoCtlOp::try_from(args[0])?, args),
        }
    }

    fn require_privileged(&self, caller: ProcessId) -> Result<(), Errno> {
        if self.processes.get(caller)?.is_privileged() {
            Ok(())
        } else {
            Err(Errno::AccessViolation)
        }
    }

    /// Acting on another process needs privilege.
    fn require_control(&self, caller: ProcessId, target: ProcessId) -> Result<(), Errno> {
        if caller == target {
            Ok(())
        } else {
            self.require_privileged(caller)
        }
    }

    /// Copies caller-supplied user memory into the kernel.
    fn copy_in(&self, pid: ProcessId, virt: u64, buf: &mut [u8]) -> Result<(), Errno> {
        validate_user_buffer(virt, buf.len())?;
        self.processes.get(pid)?.memory().read_bytes(virt, buf)
    }

    /// Copies kernel data out to user memory.
    fn copy_out(&mut self, pid: ProcessId, virt: u64, data: &[u8]) -> Result<(), Errno> {
        validate_user_buffer(virt, data.len())?;
        self.processes.get_mut(pid)?.memory_mut().write_bytes(virt, data)
    }

    fn read_record<T: FromBytes + IntoBytes>(&self, pid: ProcessId, virt: usize) -> Result<T, Errno> {
        let mut record = T::new_zeroed();
        self.copy_in(pid, virt as u64, record.as_mut_bytes())?;
        Ok(record)
    }

    fn write_record<T: IntoBytes + Immutable>(
        &mut self,
        pid: ProcessId,
        virt: usize,
        record: &T,
    ) -> Result<(), Errno> {
        self.copy_out(pid, virt as u64, record.as_bytes())
    }

    fn priv_exec(&mut self, caller: ProcessId, op: PrivExecOp, args: [usize; 5]) -> Result<usize, Errno> {
        self.require_privileged(caller)?;
        match op {
            PrivExecOp::Idle => {
                self.processes.set_idle(caller)?;
                self.yield_request = Yield::Next;
                Ok(0)
            }
            PrivExecOp::Reboot => A::reboot().map(|()| 0),
            PrivExecOp::Shutdown => A::shutdown().map(|()| 0),
            PrivExecOp::WriteConsole => {
                let len = args[2];
                if len > CONSOLE_WRITE_MAX {
                    return Err(Errno::InvalidArgument);
                }
                let mut buffer = [0u8; CONSOLE_WRITE_MAX];
                self.copy_in(caller, args[1] as u64, &mut buffer[..len])?;
                let text = str::from_utf8(&buffer[..len]).map_err(|_| Errno::InvalidArgument)?;
                info!(target: "console", "{}", text.trim_end_matches('\n'));
                Ok(len)
            }
        }
    }

    fn process_ctl(&mut self, caller: ProcessId, op: ProcessCtlOp, args: [usize; 5]) -> Result<usize, Errno> {
        let pid = pid_arg(args[1])?;
        let (arg, arg2) = (args[2], args[3]);
        match op {
            ProcessCtlOp::Spawn => {
                self.require_privileged(caller)?;
                let id = self.processes.create(
                    caller,
                    arg as u64,
                    A::memory_map(),
                    arg2 != 0,
                    &mut self.frames,
                )?;
                Ok(id.raw() as usize)
            }
            ProcessCtlOp::Kill => {
                let target = self.processes.resolve(pid)?;
                self.require_control(caller, target)?;
                self.processes.remove(target, arg, &mut self.frames)?;
                Ok(0)
            }
            ProcessCtlOp::GetPid => Ok(caller.raw() as usize),
            ProcessCtlOp::GetParent => Ok(self.processes.get(caller)?.parent().raw() as usize),
            ProcessCtlOp::Schedule => {
                self.yield_request = if pid.is_any() || pid.is_self() {
                    Yield::Next
                } else {
                    Yield::To(self.processes.resolve(pid)?)
                };
                Ok(0)
            }
            ProcessCtlOp::Stop => {
                let target = self.processes.resolve(pid)?;
                self.require_control(caller, target)?;
                self.processes.stop(target).map(|()| 0)
            }
            ProcessCtlOp::Resume => {
                let target = self.processes.resolve(pid)?;
                self.require_control(caller, target)?;
                self.processes.resume(target).map(|()| 0)
            }
            ProcessCtlOp::Reset => {
                let target = self.processes.resolve(pid)?;
                self.require_control(caller, target)?;
                self.processes.reset(target, arg as u64).map(|()| 0)
            }
            ProcessCtlOp::Wakeup => {
                let target = self.processes.resolve(pid)?;
                self.processes.wakeup(target).map(|()| 0)
            }
            ProcessCtlOp::WatchIrq => {
                let target = self.processes.resolve(pid)?;
                self.require_control(caller, target)?;
                self.processes.watch_interrupt(target, arg as u32).map(|()| 0)
            }
            ProcessCtlOp::EnableIrq => {
                self.require_privileged(caller)?;
                A::enable_irq(arg as u32).map(|()| 0)
            }
            ProcessCtlOp::DisableIrq => {
                self.require_privileged(caller)?;
                A::disable_irq(arg as u32).map(|()| 0)
            }
            ProcessCtlOp::InfoPid => {
                let target = self.processes.resolve(pid)?;
                let process = self.processes.get(target)?;
                let info = ProcessInfo {
                    id: target.raw(),
                    parent: process.parent().raw(),
                    state: process.state() as u32,
                    privileged: process.is_privileged() as u32,
                    entry: process.entry(),
                };
                self.write_record(caller, arg, &info).map(|()| 0)
            }
            ProcessCtlOp::WaitPid => {
                let target = self.processes.resolve(pid)?;
                // The exit status replaces this result when the target dies.
                self.processes.wait(caller, target).map(|()| 0)
            }
            ProcessCtlOp::InfoTimer => {
                let info = TimerInfo {
                    frequency: self.config.timer_frequency as u64,
                    ticks: self.ticks,
                };
                self.write_record(caller, arg, &info).map(|()| 0)
            }
            ProcessCtlOp::WaitTimer => self
                .processes
                .sleep(caller, Some(arg as u64), true)
                .map(|()| 0),
            ProcessCtlOp::EnterSleep => {
                let deadline = (arg != 0).then_some(arg as u64);
                self.processes.sleep(caller, deadline, false).map(|()| 0)
            }
            ProcessCtlOp::SetStack => {
                let target = self.processes.resolve(pid)?;
                self.require_control(caller, target)?;
                self.processes.get_mut(target)?.context_mut().set_stack(arg as u64);
                Ok(0)
            }
        }
    }

    fn system_info(&mut self, caller: ProcessId, output: usize) -> Result<usize, Errno> {
        let info = SystemInformation {
            core_id: self.config.core_id,
            process_count: self.processes.count() as u32,
            memory_total: self.frames.total(),
            memory_available: self.frames.available(),
            timer_frequency: self.config.timer_frequency as u64,
            ticks: self.ticks,
        };
        self.write_record(caller, output, &info).map(|()| 0)
    }

    /// Ranges named by `VmCtl` must sit inside one user region of `pid`.
    fn require_user_range(&self, pid: ProcessId, range: &Range) -> Result<(), Errno> {
        let size = range.size.max(1);
        validate_user_buffer(range.virt, usize::try_from(size).map_err(|_| Errno::InvalidArgument)?)?;
        let map = self.processes.get(pid)?.memory().memory_map();
        map.user_region_of(range.virt, size)
            .map(|_| ())
            .ok_or(Errno::AccessViolation)
    }

    /// Shared memory is only detached through `VmShare::Delete`.
    fn require_unshared(&self, pid: ProcessId, range: &Range) -> Result<(), Errno> {
        if self.processes.get(pid)?.shares().overlaps(range.virt, range.size) {
            Err(Errno::AccessViolation)
        } else {
            Ok(())
        }
    }

    fn vm_ctl(&mut self, caller: ProcessId, op: VmCtlOp, args: [usize; 5]) -> Result<usize, Errno> {
        let target = self.processes.resolve(pid_arg(args[1])?)?;
        self.require_control(caller, target)?;
        let output = args[2];
        let record: RangeRecord = self.read_record(caller, output)?;
        let mut range = Range::from(record);

        let picks_address = op == VmCtlOp::Map && range.virt == 0;
        if op != VmCtlOp::ClaimPhysical && !picks_address {
            self.require_user_range(target, &range)?;
        }

        match op {
            VmCtlOp::Map => {
                if range.phys != 0 {
                    self.require_privileged(caller)?;
                }
                range.size = page_align_up(range.size);
                range.access |= Access::USER;
                let memory = self.processes.get_mut(target)?.memory_mut();
                if range.virt == 0 {
                    range.virt = memory.find_free(range.size, Region::UserPrivate)?;
                }
                memory.map_range(&mut range, &mut self.frames)?;
                self.write_record(caller, output, &RangeRecord::from(range))
                    .map(|()| 0)
            }
            VmCtlOp::Unmap => {
                self.require_unshared(target, &range)?;
                let memory = self.processes.get_mut(target)?.memory_mut();
                memory.unmap_range(&range).map(|()| 0)
            }
            VmCtlOp::Release => {
                self.require_unshared(target, &range)?;
                let memory = self.processes.get_mut(target)?.memory_mut();
                memory.release_range(&range, &mut self.frames).map(|()| 0)
            }
            VmCtlOp::Lookup => {
                range.phys = self.processes.get(target)?.memory().lookup(range.virt)?;
                self.write_record(caller, output, &RangeRecord::from(range))
                    .map(|()| range.phys as usize)
            }
            VmCtlOp::Access => {
                range.access = self.processes.get(target)?.memory().access(range.virt)?;
                self.write_record(caller, output, &RangeRecord::from(range))
                    .map(|()| range.access.bits() as usize)
            }
            VmCtlOp::CacheClean => {
                let memory = self.processes.get(target)?.memory();
                for page in 0..range.page_count() {
                    let virt = (range.virt & !(PAGE_SIZE - 1)) + page * PAGE_SIZE;
                    let phys = memory.lookup(virt)?;
                    self.cache.clean_data(phys + self.frames.phys_offset());
                }
                Ok(0)
            }
            VmCtlOp::ClaimPhysical => {
                self.require_privileged(caller)?;
                self.frames.claim(range.phys, page_align_up(range.size)).map(|()| 0)
            }
        }
    }

    fn vm_share(&mut self, caller: ProcessId, op: VmShareOp, args: [usize; 5]) -> Result<usize, Errno> {
        let pid = pid_arg(args[1])?;
        let output = args[2];
        match op {
            VmShareOp::Create => {
                let record: ShareRecord = self.read_record(caller, output)?;
                let remote = self.processes.resolve(pid)?;
                let request = ShareRequest {
                    core_id: record.core_id,
                    tag_id: record.tag_id,
                    size: record.range.size,
                    access: Range::from(record.range).access,
                };
                let (local, other) = self.processes.pair_mut(caller, remote)?;
                let (local_share, remote_share) = create_share(
                    local.share_endpoint(),
                    other.share_endpoint(),
                    request,
                    &self.cache,
                    &mut self.frames,
                )?;
                let event = ProcessEvent::share_created(caller.raw(), remote_share.to_record());
                if let Err(err) = other.raise_event(&event) {
                    warn!(target: "share", "{remote:?} missed share from {caller:?}: {err:?}");
                }
                self.write_record(caller, output, &local_share.to_record())
                    .map(|()| 0)
            }
            VmShareOp::Read => {
                let record: ShareRecord = self.read_record(caller, output)?;
                let peer = if pid.is_self() { caller } else { pid };
                let share = self
                    .processes
                    .get(caller)?
                    .shares()
                    .read_share(peer, record.core_id, record.tag_id)?;
                self.write_record(caller, output, &share.to_record())
                    .map(|()| 0)
            }
            VmShareOp::Delete => {
                if pid.is_kernel() {
                    return Err(Errno::AccessViolation);
                }
                let states = match self.processes.pair_mut(caller, pid) {
                    Ok((local, other)) => remove_shares(
                        local.share_endpoint(),
                        Some(other.shares_mut()),
                        pid,
                        &mut self.frames,
                    )?,
                    Err(_) => remove_shares(
                        self.processes.get_mut(caller)?.share_endpoint(),
                        None,
                        pid,
                        &mut self.frames,
                    )?,
                };
                if states.is_empty() {
                    return Err(Errno::NotFound);
                }
                Ok(states.len())
            }
        }
    }

    fn vm_copy(&mut self, caller: ProcessId, op: VmCopyOp, args: [usize; 5]) -> Result<usize, Errno> {
        self.require_privileged(caller)?;
        let target = self.processes.resolve(pid_arg(args[1])?)?;
        let (ours, theirs, size) = (args[2] as u64, args[3] as u64, args[4]);
        let (from, from_addr, to, to_addr) = match op {
            VmCopyOp::Read => (target, theirs, caller, ours),
            VmCopyOp::Write => (caller, ours, target, theirs),
        };

        let mut buffer = [0u8; PAGE_SIZE as usize];
        let mut done = 0;
        while done < size {
            let chunk = (size - done).min(buffer.len());
            let offset = done as u64;
            self.copy_in(from, from_addr + offset, &mut buffer[..chunk])?;
            self.copy_out(to, to_addr + offset, &buffer[..chunk])?;
            done += chunk;
        }
        Ok(done)
    }

    fn ipc_message(&mut self, caller: ProcessId, op: IpcOp, args: [usize; 5]) -> Result<usize, Errno> {
        let pid = pid_arg(args[1])?;
        let (buffer, size) = (args[2], args[3]);
        if size > MAX_MESSAGE_SIZE {
            return Err(Errno::InvalidArgument);
        }
        match op {
            IpcOp::Send => self.ipc_send(caller, pid, buffer, size).map(|()| 0),
            IpcOp::Receive => self.ipc_receive(caller, pid, buffer, size),
            IpcOp::SendReceive => {
                self.ipc_send(caller, pid, buffer, size)?;
                self.ipc_receive(caller, pid, buffer, size)
            }
        }
    }

    fn ipc_send(&mut self, caller: ProcessId, pid: ProcessId, buffer: usize, size: usize) -> Result<(), Errno> {
        let target = self.processes.resolve(pid)?;
        let mut wire = [0u8; MAX_MESSAGE_SIZE];
        self.copy_in(caller, buffer as u64, &mut wire[..size])?;
        let mut message = Message::from_wire(&wire[..size])?;
        message.from = caller.raw();
        message.kind = MessageKind::Ipc as u32;
        self.processes.get_mut(target)?.inbox_mut().push(message)?;
        self.processes.wakeup(target)
    }

    /// Delivers the oldest matching message or puts the caller to sleep.
    ///
    /// An empty inbox yields `RetryAgain`; the caller repeats the receive
    /// once a sender wakes it.
    fn ipc_receive(&mut self, caller: ProcessId, pid: ProcessId, buffer: usize, size: usize) -> Result<usize, Errno> {
        let from = if pid.is_self() { caller } else { pid };
        // Fault on a bad buffer before a message is dequeued.
        self.copy_out(caller, buffer as u64, &[0u8; MAX_MESSAGE_SIZE][..size])?;
        match self.processes.get_mut(caller)?.inbox_mut().take_from(from) {
            Some(message) => {
                self.copy_out(caller, buffer as u64, &message.as_bytes()[..size])?;
                Ok(message.from as usize)
            }
            None => {
                match self.processes.sleep(caller, None, false) {
                    Ok(()) | Err(Errno::WakeupPending) => {}
                    Err(err) => return Err(err),
                }
                Err(Errno::RetryAgain)
            }
        }
    }

    fn io_ctl(&mut self, caller: ProcessId, op: IoCtlOp, args: [usize; 5]) -> Result<usize, Errno> {
        self.require_privileged(caller)?;
        let port = u16::try_from(args[1]).map_err(|_| Errno::InvalidArgument)?;
        let width = match args[2] {
            1 | 2 | 4 => args[2] as u8,
            _ => return Err(Errno::InvalidArgument),
        };
        match op {
            IoCtlOp::Read => A::port_read(port, width).map(|value| value as usize),
            IoCtlOp::Write => A::port_write(port, width, args[3] as u32).map(|()| 0),
        }
    }
}
