use arch_host::{HostArch, HostMemory};
use hal::{Access, Arch, Errno, VirtAddr, PAGE_SIZE};
use kernel_abi::{
    build_boot_image, decode_result, parse_boot_image, ApiNumber, BootProcess, BootSegment,
    IpcOp, ProcessCtlOp, ProcessId, RangeRecord, ShareRecord, VmShareOp,
};
use kernel_core::{BitmapAllocator, Kernel, KernelConfig, ProcessManager, ProcessState, ShareState};
use proptest::prelude::*;
use zerocopy::IntoBytes;

const DATA: VirtAddr = 0x40_0000;
const SELF: usize = ProcessId::SELF.raw() as usize;

struct Machine {
    kernel: Kernel<HostArch, BitmapAllocator>,
    _arena: HostMemory,
}

impl Machine {
    fn boot(processes: &[(&str, bool)]) -> (Self, Vec<ProcessId>) {
        let arena = HostMemory::new(256);
        let frames = BitmapAllocator::new(arena.base(), arena.base() + arena.size(), 0);
        let mut kernel = Kernel::new(frames, KernelConfig::default());

        let image: Vec<BootProcess> = processes
            .iter()
            .map(|(name, privileged)| BootProcess {
                name: name.to_string(),
                privileged: *privileged,
                entry: DATA,
                args: name.to_string(),
                segments: vec![BootSegment {
                    virt: DATA,
                    size: PAGE_SIZE,
                    access: Access::READABLE | Access::WRITABLE,
                    data: name.as_bytes().to_vec(),
                }],
            })
            .collect();
        let bytes = build_boot_image(&image);
        let parsed = parse_boot_image(&bytes).expect("boot image should parse");
        let ids = kernel
            .load_boot_processes(&parsed)
            .expect("boot processes should load");
        (Self { kernel, _arena: arena }, ids)
    }

    fn call(&mut self, pid: ProcessId, api: ApiNumber, args: [usize; 5]) -> Result<usize, Errno> {
        if self.kernel.processes().current() != Some(pid) {
            self.kernel.schedule(Some(pid)).expect("caller should be runnable");
        }
        let word = self
            .kernel
            .api(api as usize, args)
            .expect("a process should remain runnable");
        decode_result(word)
    }

    fn poke(&mut self, pid: ProcessId, virt: VirtAddr, data: &[u8]) {
        self.kernel
            .processes_mut()
            .get_mut(pid)
            .expect("process should exist")
            .memory_mut()
            .write_bytes(virt, data)
            .expect("user memory should be writable");
    }

    fn state(&self, pid: ProcessId) -> ProcessState {
        self.kernel
            .processes()
            .get(pid)
            .expect("process should exist")
            .state()
    }
}

#[test]
fn acceptance_boot_image_to_first_system_call() {
    let (mut machine, ids) = Machine::boot(&[("core", true), ("fs", false)]);
    assert_eq!(ids, [ProcessId::CORE_SERVER, ProcessId::ROOT_FILESYSTEM]);

    let mut name = [0u8; 4];
    machine
        .kernel
        .processes()
        .get(ids[0])
        .expect("core exists")
        .memory()
        .read_bytes(DATA, &mut name)
        .expect("segment should be loaded");
    assert_eq!(&name, b"core");

    let switch = machine.kernel.schedule(None).expect("schedule should succeed");
    assert_eq!(switch.map(|switch| switch.to), Some(ids[0]));
    let pid = machine.call(ids[0], ApiNumber::ProcessCtl, [ProcessCtlOp::GetPid as usize, SELF, 0, 0, 0]);
    assert_eq!(pid, Ok(ProcessId::CORE_SERVER.raw() as usize));
}

#[test]
fn acceptance_shared_memory_outlives_first_detach() {
    let (mut machine, ids) = Machine::boot(&[("a", false), ("b", false)]);
    let (a, b) = (ids[0], ids[1]);
    let request = ShareRecord {
        tag_id: 1,
        range: RangeRecord {
            size: 2 * PAGE_SIZE,
            access: (Access::READABLE | Access::WRITABLE | Access::USER).bits() as u64,
            ..RangeRecord::default()
        },
        ..ShareRecord::default()
    };
    machine.poke(a, DATA, request.as_bytes());
    let before = machine.kernel.frames().free_count();
    machine
        .call(a, ApiNumber::VmShare, [VmShareOp::Create as usize, b.raw() as usize, DATA as usize, 0, 0])
        .expect("share should be created");
    let shared = before - machine.kernel.frames().free_count();
    assert!(shared >= 2);

    machine
        .call(a, ApiNumber::VmShare, [VmShareOp::Delete as usize, b.raw() as usize, 0, 0, 0])
        .expect("first detach should succeed");
    let after_first = machine.kernel.frames().free_count();
    assert!(after_first < before);
    let remote = machine
        .kernel
        .processes()
        .get(b)
        .expect("b exists")
        .shares()
        .read_share(a, 0, 1)
        .expect("b still holds the share");
    assert_eq!(remote.state, ShareState::DetachedRemote);

    machine
        .call(b, ApiNumber::VmShare, [VmShareOp::Delete as usize, a.raw() as usize, 0, 0, 0])
        .expect("second detach should succeed");
    assert_eq!(machine.kernel.frames().free_count(), after_first + 2);
    let gone = machine.kernel.processes().get(b).expect("b exists").shares().read_share(a, 0, 1);
    assert_eq!(gone.err(), Some(Errno::NotFound));
}

#[test]
fn acceptance_waiter_is_released_with_exit_status() {
    let (mut machine, ids) = Machine::boot(&[("shell", false), ("job", false)]);
    let (shell, job) = (ids[0], ids[1]);
    machine
        .call(shell, ApiNumber::ProcessCtl, [ProcessCtlOp::WaitPid as usize, job.raw() as usize, 0, 0, 0])
        .expect("wait should succeed");
    assert_eq!(machine.state(shell), ProcessState::Waiting);

    machine
        .call(job, ApiNumber::ProcessCtl, [ProcessCtlOp::Kill as usize, SELF, 42, 0, 0])
        .expect("exit should succeed");
    let shell = machine.kernel.processes().get(shell).expect("shell exists");
    assert_eq!(shell.state(), ProcessState::Running);
    assert_eq!(shell.wait_result(), 42);
    assert!(machine.kernel.processes().get(job).is_err());
}

#[test]
fn acceptance_wakeup_is_not_lost() {
    let (mut machine, ids) = Machine::boot(&[("server", false), ("client", false)]);
    let (server, client) = (ids[0], ids[1]);
    let sleep = [ProcessCtlOp::EnterSleep as usize, SELF, 0, 0, 0];
    let wake = [ProcessCtlOp::Wakeup as usize, server.raw() as usize, 0, 0, 0];

    machine.call(server, ApiNumber::ProcessCtl, sleep).expect("sleep should succeed");
    assert_eq!(machine.state(server), ProcessState::Sleeping);
    machine.call(client, ApiNumber::ProcessCtl, wake).expect("wakeup should succeed");
    assert_eq!(machine.state(server), ProcessState::Ready);

    machine.call(client, ApiNumber::ProcessCtl, wake).expect("early wakeup should be kept");
    assert_eq!(machine.call(server, ApiNumber::ProcessCtl, sleep), Err(Errno::WakeupPending));
    assert_eq!(machine.state(server), ProcessState::Running);
}

#[test]
fn acceptance_request_reply_over_ipc() {
    let (mut machine, ids) = Machine::boot(&[("server", false), ("client", false)]);
    let (server, client) = (ids[0], ids[1]);
    let any = ProcessId::ANY.raw() as usize;
    let receive = [IpcOp::Receive as usize, any, DATA as usize, 64, 0];

    assert_eq!(machine.call(server, ApiNumber::IpcMessage, receive), Err(Errno::RetryAgain));
    let request = [IpcOp::SendReceive as usize, server.raw() as usize, DATA as usize, 64, 0];
    assert_eq!(machine.call(client, ApiNumber::IpcMessage, request), Err(Errno::RetryAgain));
    assert_eq!(machine.state(client), ProcessState::Sleeping);

    assert_eq!(machine.call(server, ApiNumber::IpcMessage, receive), Ok(client.raw() as usize));
    let reply = [IpcOp::Send as usize, client.raw() as usize, DATA as usize, 64, 0];
    machine.call(server, ApiNumber::IpcMessage, reply).expect("reply should be sent");
    assert_eq!(machine.state(client), ProcessState::Ready);
    let answer = [IpcOp::Receive as usize, server.raw() as usize, DATA as usize, 64, 0];
    assert_eq!(machine.call(client, ApiNumber::IpcMessage, answer), Ok(server.raw() as usize));
}

#[derive(Debug, Clone)]
enum TableOp {
    Create,
    Remove(usize),
}

fn table_op() -> impl Strategy<Value = TableOp> {
    prop_oneof![Just(TableOp::Create), (0usize..8).prop_map(TableOp::Remove)]
}

proptest! {
    #[test]
    fn removed_ids_never_resolve(ops in prop::collection::vec(table_op(), 1..40)) {
        let arena = HostMemory::new(256);
        let mut frames = BitmapAllocator::new(arena.base(), arena.base() + arena.size(), 0);
        let initial = frames.free_count();
        let mut manager = ProcessManager::<HostArch>::new(0, 8);
        let mut live: Vec<ProcessId> = Vec::new();
        let mut dead: Vec<ProcessId> = Vec::new();

        for op in ops {
            match op {
                TableOp::Create => {
                    if let Ok(id) = manager.create(ProcessId::KERNEL, DATA, HostArch::memory_map(), false, &mut frames) {
                        prop_assert!(!live.contains(&id));
                        live.push(id);
                    }
                }
                TableOp::Remove(index) if !live.is_empty() => {
                    let id = live.remove(index % live.len());
                    manager.remove(id, 0, &mut frames).expect("live process should be removable");
                    dead.push(id);
                }
                TableOp::Remove(_) => {}
            }
            for id in &live {
                prop_assert!(manager.get(*id).is_ok());
            }
            for id in &dead {
                prop_assert_eq!(manager.get(*id).err(), Some(Errno::NotFound));
            }
            prop_assert_eq!(manager.count(), live.len());
        }

        for id in live {
            manager.remove(id, 0, &mut frames).expect("cleanup should succeed");
        }
        prop_assert_eq!(frames.free_count(), initial);
    }
}
