//! Boot of the kernel instance and the single trap path into it.
//!
//! Every trap saves the interrupted user frame into the running process,
//! runs the kernel and leaves with the frame of whichever process is
//! running afterwards. With nothing runnable the CPU halts in ring 0 on
//! its own stack until the next interrupt.

use arch_x86_64::{self as arch, TrapFrame, X86Arch, PIC_1_OFFSET, PIC_LINES, SYSCALL_VECTOR};
use hal::Arch;
use kernel_abi::parse_boot_image;
use kernel_core::{BitmapAllocator, BootInfo, Errno, Kernel, KernelConfig, ProcessState};
use log::{error, info, warn};
use spin::Mutex;

type CoreKernel = Kernel<X86Arch, BitmapAllocator>;

static KERNEL: Mutex<Option<CoreKernel>> = Mutex::new(None);

const IDLE_STACK_SIZE: usize = 4096 * 4;

#[repr(align(16))]
struct IdleStack([u8; IDLE_STACK_SIZE]);

static mut IDLE_STACK: IdleStack = IdleStack([0; IDLE_STACK_SIZE]);

/// Frame that parks the CPU in `hlt` with interrupts enabled.
fn idle_frame() -> TrapFrame {
    let top = (&raw const IDLE_STACK) as u64 + IDLE_STACK_SIZE as u64;
    // Entered as if by a call, so the stack sits one slot below alignment.
    TrapFrame::kernel(idle_entry as usize as u64, top - 8)
}

extern "C" fn idle_entry() -> ! {
    arch::halt_loop()
}

fn create_kernel(boot_info: &BootInfo<'static>, phys_offset: u64) -> Result<CoreKernel, Errno> {
    let (start, end) = boot_info.largest_usable().ok_or(Errno::OutOfMemory)?;
    let frames = BitmapAllocator::new(start, end, phys_offset);
    let config = KernelConfig {
        timer_frequency: X86Arch::timer_frequency(),
        ..KernelConfig::default()
    };
    let mut kernel = Kernel::new(frames, config);

    let image = boot_info.boot_image.ok_or(Errno::NotFound)?;
    let processes = parse_boot_image(image)?;
    let ids = kernel.load_boot_processes(&processes)?;
    info!(target: "boot", "{} boot processes loaded", ids.len());
    kernel.schedule(None)?;
    Ok(kernel)
}

/// Builds the kernel, enters the first boot process and never returns.
pub(crate) fn start(boot_info: &BootInfo<'static>, phys_offset: u64) -> ! {
    arch::set_kernel_root(arch::active_root());
    arch::init();

    let kernel = match create_kernel(boot_info, phys_offset) {
        Ok(kernel) => kernel,
        Err(err) => {
            error!(target: "boot", "cannot start: {err:?}");
            crate::halt()
        }
    };
    let first = resume_frame(&kernel);
    *KERNEL.lock() = Some(kernel);
    arch::set_trap_handler(handle_trap);

    // SAFETY: interrupts are still masked, the first process's address
    // space was activated by the scheduler and the frame lives on this
    // stack until iretq consumes it.
    unsafe { arch::enter(&first) }
}

/// Frame of the running process, or the idle frame if none is running.
fn resume_frame(kernel: &CoreKernel) -> TrapFrame {
    match kernel.processes().current_process() {
        Ok(process) if process.state() == ProcessState::Running => *process.context(),
        _ => idle_frame(),
    }
}

fn handle_trap(frame: &mut TrapFrame) {
    let mut guard = KERNEL.lock();
    let Some(kernel) = guard.as_mut() else {
        crate::halt()
    };

    if frame.from_user() {
        if let Ok(process) = kernel.processes_mut().current_process_mut() {
            *process.context_mut() = *frame;
        }
    }

    let vector = frame.vector as u8;
    let result = match vector {
        SYSCALL_VECTOR => kernel.api(frame.api_number(), frame.api_args()).map(|_| ()),
        v if (PIC_1_OFFSET..PIC_1_OFFSET + PIC_LINES).contains(&v) => {
            arch::acknowledge(v);
            match v - PIC_1_OFFSET {
                0 => kernel.timer_tick().map(|_| ()),
                line => kernel.interrupt(u32::from(line)).map(|_| ()),
            }
        }
        _ => {
            error!(
                target: "trap",
                "fatal exception {} error {:#x} at {:#x} in {:?}",
                frame.vector,
                frame.error_code,
                frame.rip,
                kernel.processes().current()
            );
            crate::halt()
        }
    };
    if let Err(err) = result {
        warn!(target: "trap", "vector {vector:#x} left nothing to run: {err:?}");
    }

    *frame = resume_frame(kernel);
}
