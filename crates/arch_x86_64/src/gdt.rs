/// Ring 0 code selector: GDT slot 1.
pub const KERNEL_CODE_SELECTOR: u64 = 1 << 3;
/// Ring 0 data selector: GDT slot 2.
pub const KERNEL_DATA_SELECTOR: u64 = 2 << 3;
/// Ring 3 code selector: GDT slot 4 with RPL 3.
pub const USER_CODE_SELECTOR: u64 = (4 << 3) | 3;
/// Ring 3 data selector: GDT slot 3 with RPL 3.
pub const USER_DATA_SELECTOR: u64 = (3 << 3) | 3;

#[cfg(target_os = "none")]
mod tables {
    use spin::Once;
    use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
    use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
    use x86_64::structures::tss::TaskStateSegment;
    use x86_64::VirtAddr;

    use super::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR};

    pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
    const STACK_SIZE: usize = 4096 * 5;

    static TSS: Once<TaskStateSegment> = Once::new();
    static GDT: Once<(GlobalDescriptorTable, Selectors)> = Once::new();

    struct Selectors {
        code: SegmentSelector,
        data: SegmentSelector,
        tss: SegmentSelector,
    }

    fn build_tss() -> TaskStateSegment {
        static mut TRAP_STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];
        static mut FAULT_STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

        let mut tss = TaskStateSegment::new();
        let trap = VirtAddr::from_ptr(&raw const TRAP_STACK) + STACK_SIZE as u64;
        let fault = VirtAddr::from_ptr(&raw const FAULT_STACK) + STACK_SIZE as u64;
        // Traps from ring 3 land on one kernel stack; the frame is copied
        // into the process before anything else runs.
        tss.privilege_stack_table[0] = trap;
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = fault;
        tss
    }

    pub fn init() {
        let (gdt, selectors) = GDT.call_once(|| {
            let tss = TSS.call_once(build_tss);
            let mut gdt = GlobalDescriptorTable::new();
            let code = gdt.append(Descriptor::kernel_code_segment());
            let data = gdt.append(Descriptor::kernel_data_segment());
            debug_assert_eq!(u64::from(code.0), KERNEL_CODE_SELECTOR);
            debug_assert_eq!(u64::from(data.0), KERNEL_DATA_SELECTOR);
            let user_data = gdt.append(Descriptor::user_data_segment());
            let user_code = gdt.append(Descriptor::user_code_segment());
            debug_assert_eq!(u64::from(user_data.0), USER_DATA_SELECTOR);
            debug_assert_eq!(u64::from(user_code.0), USER_CODE_SELECTOR);
            let tss = gdt.append(Descriptor::tss_segment(tss));
            (gdt, Selectors { code, data, tss })
        });

        gdt.load();
        // SAFETY: the selectors index the table loaded above.
        unsafe {
            CS::set_reg(selectors.code);
            DS::set_reg(selectors.data);
            ES::set_reg(selectors.data);
            SS::set_reg(selectors.data);
            x86_64::instructions::tables::load_tss(selectors.tss);
        }
    }
}

#[cfg(target_os = "none")]
pub(crate) use tables::{init, DOUBLE_FAULT_IST_INDEX};
