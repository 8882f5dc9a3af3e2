//! Trap entry, interrupt descriptor table and the legacy PIC.
//!
//! Every vector enters through a small stub that normalises the stack to a
//! [`TrapFrame`] and calls the handler installed with [`set_trap_handler`].
//! The handler may overwrite the frame to resume a different process.

use spin::{Mutex, Once};
use pic8259::ChainedPics;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::context::{TrapFrame, SYSCALL_VECTOR};
use crate::gdt::DOUBLE_FAULT_IST_INDEX;

/// Primary 8259 PIC offset for hardware interrupts.
pub const PIC_1_OFFSET: u8 = 32;
/// Secondary 8259 PIC offset for hardware interrupts.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;
/// Number of legacy IRQ lines.
pub const IRQ_LINES: u8 = 16;

/// Bytes between consecutive entry stubs.
const STUB_STRIDE: u64 = 16;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });
static IDT: Once<InterruptDescriptorTable> = Once::new();
static TRAP_HANDLER: Once<fn(&mut TrapFrame)> = Once::new();

// Stubs for vectors 0..48 sit STUB_STRIDE bytes apart. Vectors where the
// CPU pushes an error code skip the dummy push.
core::arch::global_asm!(
    r#"
    .section .text
    trap_common:
        push %rax
        push %rbx
        push %rcx
        push %rdx
        push %rsi
        push %rdi
        push %rbp
        push %r8
        push %r9
        push %r10
        push %r11
        push %r12
        push %r13
        push %r14
        push %r15
        mov %rsp, %rdi
        cld
        call {dispatch}
    .global trap_return
    trap_return:
        pop %r15
        pop %r14
        pop %r13
        pop %r12
        pop %r11
        pop %r10
        pop %r9
        pop %r8
        pop %rbp
        pop %rdi
        pop %rsi
        pop %rdx
        pop %rcx
        pop %rbx
        pop %rax
        add $16, %rsp
        iretq

    .balign 16
    .global trap_stubs
    trap_stubs:
    .set vector, 0
    .rept 48
        .balign 16
        .if (vector == 8) || ((vector >= 10) && (vector <= 14)) || (vector == 17) || (vector == 21) || (vector == 29) || (vector == 30)
        .else
        pushq $0
        .endif
        pushq $vector
        jmp trap_common
        .set vector, vector + 1
    .endr

    .balign 16
    .global syscall_stub
    syscall_stub:
        pushq $0
        pushq $0x80
        jmp trap_common
    "#,
    dispatch = sym trap_dispatch,
    options(att_syntax),
);

extern "C" {
    fn trap_stubs();
    fn syscall_stub();
}

/// Leaves the kernel through the common trap exit with `frame`.
///
/// # Safety
///
/// `frame` must describe a resumable context whose address space is
/// active, and interrupts must be masked.
pub unsafe fn enter(frame: &TrapFrame) -> ! {
    // SAFETY: trap_return pops a TrapFrame from the stack pointer.
    unsafe {
        core::arch::asm!(
            "mov {frame}, %rsp",
            "jmp trap_return",
            frame = in(reg) frame as *const TrapFrame,
            options(att_syntax, noreturn),
        )
    }
}

extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    match TRAP_HANDLER.get() {
        Some(handler) => handler(frame),
        None => crate::halt_loop(),
    }
}

/// Installs the function that handles every trap.
pub fn set_trap_handler(handler: fn(&mut TrapFrame)) {
    TRAP_HANDLER.call_once(|| handler);
}

pub(crate) fn init() {
    let idt = IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        let base = trap_stubs as usize as u64;
        let stub = |vector: u64| VirtAddr::new(base + vector * STUB_STRIDE);
        // SAFETY: every stub builds a TrapFrame and returns with iretq.
        unsafe {
            idt.divide_error.set_handler_addr(stub(0));
            idt.debug.set_handler_addr(stub(1));
            idt.breakpoint.set_handler_addr(stub(3));
            idt.invalid_opcode.set_handler_addr(stub(6));
            idt.double_fault
                .set_handler_addr(stub(8))
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
            idt.general_protection_fault.set_handler_addr(stub(13));
            idt.page_fault.set_handler_addr(stub(14));
            for vector in PIC_1_OFFSET..PIC_1_OFFSET + IRQ_LINES {
                idt[vector].set_handler_addr(stub(u64::from(vector)));
            }
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(syscall_stub as usize as u64))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
        idt
    });
    idt.load();

    // SAFETY: the PIC vectors do not overlap CPU exceptions.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        // Everything but the timer stays masked until a driver asks.
        pics.write_masks(0xFE, 0xFF);
    }
}

/// Acknowledges the interrupt on `vector`.
pub fn acknowledge(vector: u8) {
    // SAFETY: called once per delivered PIC interrupt.
    unsafe { PICS.lock().notify_end_of_interrupt(vector) };
}

/// Unmasks or masks one IRQ line.
pub(crate) fn set_line_masked(line: u8, masked: bool) {
    // SAFETY: only the mask registers are touched.
    unsafe {
        let mut pics = PICS.lock();
        let [mut primary, mut secondary] = pics.read_masks();
        let (mask, bit) = match line {
            0..=7 => (&mut primary, line),
            _ => (&mut secondary, line - 8),
        };
        if masked {
            *mask |= 1 << bit;
        } else {
            *mask &= !(1 << bit);
        }
        if !masked && line >= 8 {
            // Cascade line.
            primary &= !(1 << 2);
        }
        pics.write_masks(primary, secondary);
    }
}
