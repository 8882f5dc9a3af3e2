use hal::{CpuContext, VirtAddr};

use crate::gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR};

/// Interrupt enable flag plus the always-set reserved bit.
const RFLAGS_DEFAULT: u64 = 0x202;
/// I/O privilege level 3, granting port access to ring 3.
const RFLAGS_IOPL3: u64 = 0x3000;

/// System-call vector.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Register state pushed by the trap entry stubs.
///
/// Field order matches the stack layout built by `trap_common`: general
/// registers in reverse push order, then the vector and error code, then
/// the frame the CPU pushes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Ring 0 frame that resumes at `entry` on `stack` with interrupts on.
    pub fn kernel(entry: VirtAddr, stack: VirtAddr) -> Self {
        Self {
            rip: entry,
            rsp: stack,
            cs: KERNEL_CODE_SELECTOR,
            ss: KERNEL_DATA_SELECTOR,
            rflags: RFLAGS_DEFAULT,
            ..Self::default()
        }
    }

    /// System-call number in `rax`.
    pub fn api_number(&self) -> usize {
        self.rax as usize
    }

    /// System-call arguments in `rdi`, `rsi`, `rdx`, `r10` and `r8`.
    pub fn api_args(&self) -> [usize; 5] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8].map(|value| value as usize)
    }

    /// Returns true if the trap interrupted ring 3.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

impl CpuContext for TrapFrame {
    fn new(entry: VirtAddr, stack: VirtAddr, privileged: bool) -> Self {
        let mut rflags = RFLAGS_DEFAULT;
        if privileged {
            rflags |= RFLAGS_IOPL3;
        }
        Self {
            rip: entry,
            rsp: stack,
            cs: USER_CODE_SELECTOR,
            ss: USER_DATA_SELECTOR,
            rflags,
            ..Self::default()
        }
    }

    fn reset(&mut self, entry: VirtAddr) {
        *self = Self {
            rip: entry,
            rsp: self.rsp,
            cs: self.cs,
            ss: self.ss,
            rflags: self.rflags,
            ..Self::default()
        };
    }

    fn set_stack(&mut self, top: VirtAddr) {
        self.rsp = top;
    }

    fn set_return_value(&mut self, value: usize) {
        self.rax = value as u64;
    }

    fn program_counter(&self) -> VirtAddr {
        self.rip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_matches_stub_layout() {
        assert_eq!(core::mem::size_of::<TrapFrame>(), 22 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rax), 14 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, vector), 15 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rip), 17 * 8);
    }

    #[test]
    fn only_privileged_processes_get_port_access() {
        let plain = TrapFrame::new(0x40_0000, 0x7000_0000, false);
        let privileged = TrapFrame::new(0x40_0000, 0x7000_0000, true);
        assert_eq!(plain.rflags & RFLAGS_IOPL3, 0);
        assert_eq!(privileged.rflags & RFLAGS_IOPL3, RFLAGS_IOPL3);
        assert!(plain.from_user());
    }

    #[test]
    fn kernel_frames_stay_in_ring_zero() {
        let frame = TrapFrame::kernel(0xFFFF_FFFF_8000_1000, 0xFFFF_FFFF_8010_0000);
        assert!(!frame.from_user());
        assert_eq!(frame.cs, KERNEL_CODE_SELECTOR);
        assert_eq!(frame.rflags & RFLAGS_IOPL3, 0);
    }

    #[test]
    fn api_registers_follow_the_calling_convention() {
        let mut frame = TrapFrame {
            rax: 4,
            rdi: 1,
            rsi: 2,
            rdx: 3,
            r10: 4,
            r8: 5,
            rcx: 99,
            ..TrapFrame::default()
        };
        assert_eq!(frame.api_number(), 4);
        assert_eq!(frame.api_args(), [1, 2, 3, 4, 5]);
        frame.set_return_value(0x2_0000);
        assert_eq!(frame.rax, 0x2_0000);
    }

    #[test]
    fn reset_clears_registers_but_keeps_stack() {
        let mut frame = TrapFrame::new(0x40_0000, 0x7000_0000, true);
        frame.rbx = 7;
        frame.set_stack(0x6000_0000);
        frame.reset(0x40_2000);
        assert_eq!(frame.program_counter(), 0x40_2000);
        assert_eq!(frame.rsp, 0x6000_0000);
        assert_eq!(frame.rbx, 0);
        assert_eq!(frame.rflags & RFLAGS_IOPL3, RFLAGS_IOPL3);
    }
}
