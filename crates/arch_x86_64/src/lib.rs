#![cfg_attr(not(test), no_std)]

mod context;
mod gdt;
#[cfg(target_os = "none")]
mod interrupts;
mod paging;

use hal::{Arch, CacheOps, Errno, MemoryMap, Region, VirtAddr};

pub use context::{TrapFrame, SYSCALL_VECTOR};
pub use gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
#[cfg(target_os = "none")]
pub use interrupts::{acknowledge, enter, set_trap_handler, IRQ_LINES as PIC_LINES, PIC_1_OFFSET};
#[cfg(target_os = "none")]
pub use paging::active_root;
pub use paging::{set_kernel_root, X86Paging};

/// Timer interrupt rate programmed into the PIT.
pub const TIMER_FREQUENCY: u32 = 100;

/// Legacy IRQ lines routed through the PIC.
const IRQ_LINES: u32 = 16;

#[cfg(target_os = "none")]
mod hw {
    use x86_64::instructions::port::Port;

    pub const SERIAL_PORT: u16 = 0x3F8;
    pub const PIT_COMMAND_PORT: u16 = 0x43;
    pub const PIT_CHANNEL0_PORT: u16 = 0x40;
    pub const PIT_BASE_FREQUENCY: u32 = 1_193_182;
    pub const KEYBOARD_CONTROLLER: u16 = 0x64;
    pub const RESET_PULSE: u8 = 0xFE;
    /// ACPI PM1a control port of the QEMU and Bochs chipsets.
    pub const ACPI_PM1A_CONTROL: u16 = 0x604;
    pub const ACPI_SLEEP_S5: u16 = 0x2000;

    pub fn init_pit(frequency_hz: u32) {
        let divisor = PIT_BASE_FREQUENCY / frequency_hz.max(1);
        // SAFETY: the PIT ports are owned by the kernel.
        unsafe {
            Port::new(PIT_COMMAND_PORT).write(0x36u8);
            Port::new(PIT_CHANNEL0_PORT).write((divisor & 0xFF) as u8);
            Port::new(PIT_CHANNEL0_PORT).write((divisor >> 8) as u8);
        }
    }

    pub fn serial_transmit_empty() -> bool {
        // SAFETY: reading the line status register has no side effects.
        unsafe { Port::<u8>::new(SERIAL_PORT + 5).read() & 0x20 != 0 }
    }
}

/// Initializes descriptor tables, the trap stubs, the PIC and the timer.
#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::registers::model_specific::{Efer, EferFlags};

    gdt::init();
    interrupts::init();
    hw::init_pit(TIMER_FREQUENCY);
    // SAFETY: enabling NX only adds a page-table bit the tables already use.
    unsafe { Efer::update(|flags| flags.insert(EferFlags::NO_EXECUTE_ENABLE)) };
}

/// Enables hardware interrupts.
#[cfg(target_os = "none")]
pub fn enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}

/// Busy-loop with the `hlt` instruction.
pub fn halt_loop() -> ! {
    loop {
        #[cfg(target_os = "none")]
        x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

/// Initializes the legacy serial port for early logging.
#[cfg(target_os = "none")]
pub fn init_serial() {
    use x86_64::instructions::port::Port;

    let port = hw::SERIAL_PORT;
    // SAFETY: COM1 is owned by the kernel console.
    unsafe {
        Port::new(port + 1).write(0x00u8);
        Port::new(port + 3).write(0x80u8);
        Port::new(port).write(0x03u8);
        Port::new(port + 1).write(0x00u8);
        Port::new(port + 3).write(0x03u8);
        Port::new(port + 2).write(0xC7u8);
        Port::new(port + 4).write(0x0Bu8);
    }
}

/// Writes a string to the legacy serial port.
#[cfg(target_os = "none")]
pub fn serial_write_str(text: &str) {
    use x86_64::instructions::port::Port;

    for byte in text.bytes() {
        if byte == b'\n' {
            serial_write_byte(b'\r');
        }
        serial_write_byte(byte);
    }

    fn serial_write_byte(byte: u8) {
        while !hw::serial_transmit_empty() {}
        // SAFETY: the transmit register is empty.
        unsafe { Port::new(hw::SERIAL_PORT).write(byte) };
    }
}

/// x86_64 caches are coherent with memory for every mapping we create.
#[derive(Debug, Default)]
pub struct X86Cache;

impl CacheOps for X86Cache {
    fn clean_data(&self, _virt: VirtAddr) {}
}

/// x86_64 binding of the kernel core.
#[derive(Debug)]
pub struct X86Arch;

fn irq_line(vector: u32) -> Result<u8, Errno> {
    if vector < IRQ_LINES {
        Ok(vector as u8)
    } else {
        Err(Errno::InvalidArgument)
    }
}

impl Arch for X86Arch {
    type Paging = X86Paging;
    type Cache = X86Cache;
    type Context = TrapFrame;

    const NAME: &'static str = "x86_64";

    fn memory_map() -> MemoryMap {
        MemoryMap::new()
            .with(Region::KernelData, 0xFFFF_8000_0000_0000, 0x0000_4000_0000_0000)
            .with(Region::KernelPrivate, 0xFFFF_FFFF_8000_0000, 0x4000_0000)
            .with(Region::UserData, 0x0000_0000_0040_0000, 0x0000_0000_3FC0_0000)
            .with(Region::UserHeap, 0x0000_0000_4000_0000, 0x0000_003F_C000_0000)
            .with(Region::UserStack, 0x0000_0040_0000_0000, 0x0000_0000_4000_0000)
            .with(Region::UserPrivate, 0x0000_1000_0000_0000, 0x0000_1000_0000_0000)
            .with(Region::UserShare, 0x0000_2000_0000_0000, 0x0000_1000_0000_0000)
            .with(Region::UserArgs, 0x0000_7FFF_0000_0000, 0x0000_0000_1000_0000)
    }

    fn timer_frequency() -> u32 {
        TIMER_FREQUENCY
    }

    fn enable_irq(vector: u32) -> Result<(), Errno> {
        let _line = irq_line(vector)?;
        #[cfg(target_os = "none")]
        interrupts::set_line_masked(_line, false);
        Ok(())
    }

    fn disable_irq(vector: u32) -> Result<(), Errno> {
        let _line = irq_line(vector)?;
        #[cfg(target_os = "none")]
        interrupts::set_line_masked(_line, true);
        Ok(())
    }

    #[cfg(target_os = "none")]
    fn port_read(port: u16, width: u8) -> Result<u32, Errno> {
        use x86_64::instructions::port::Port;

        // SAFETY: only privileged processes reach port I/O.
        unsafe {
            match width {
                1 => Ok(u32::from(Port::<u8>::new(port).read())),
                2 => Ok(u32::from(Port::<u16>::new(port).read())),
                4 => Ok(Port::<u32>::new(port).read()),
                _ => Err(Errno::InvalidArgument),
            }
        }
    }

    #[cfg(target_os = "none")]
    fn port_write(port: u16, width: u8, value: u32) -> Result<(), Errno> {
        use x86_64::instructions::port::Port;

        // SAFETY: only privileged processes reach port I/O.
        unsafe {
            match width {
                1 => Port::<u8>::new(port).write(value as u8),
                2 => Port::<u16>::new(port).write(value as u16),
                4 => Port::<u32>::new(port).write(value),
                _ => return Err(Errno::InvalidArgument),
            }
        }
        Ok(())
    }

    #[cfg(target_os = "none")]
    fn reboot() -> Result<(), Errno> {
        use x86_64::instructions::port::Port;

        // SAFETY: pulsing the 8042 reset line restarts the machine.
        unsafe { Port::new(hw::KEYBOARD_CONTROLLER).write(hw::RESET_PULSE) };
        Err(Errno::IoError)
    }

    #[cfg(target_os = "none")]
    fn shutdown() -> Result<(), Errno> {
        use x86_64::instructions::port::Port;

        // SAFETY: entering S5 powers the machine off.
        unsafe { Port::new(hw::ACPI_PM1A_CONTROL).write(hw::ACPI_SLEEP_S5) };
        Err(Errno::IoError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_regions_stay_in_the_lower_half() {
        let map = X86Arch::memory_map();
        for region in Region::ALL {
            let window = map.range(region);
            let end = window.base + window.size;
            match region {
                Region::KernelData | Region::KernelPrivate => assert!(window.base >= 0xFFFF_8000_0000_0000),
                _ => assert!(end <= 0x0000_8000_0000_0000, "{region:?} leaks into the kernel half"),
            }
        }
    }

    #[test]
    fn user_regions_do_not_overlap() {
        let map = X86Arch::memory_map();
        let user: [Region; 6] = [
            Region::UserData,
            Region::UserHeap,
            Region::UserStack,
            Region::UserPrivate,
            Region::UserShare,
            Region::UserArgs,
        ];
        for (i, a) in user.iter().enumerate() {
            for b in &user[i + 1..] {
                let (a, b) = (map.range(*a), map.range(*b));
                assert!(a.base + a.size <= b.base || b.base + b.size <= a.base);
            }
        }
    }

    #[test]
    fn only_legacy_lines_can_be_unmasked() {
        assert_eq!(X86Arch::enable_irq(1), Ok(()));
        assert_eq!(X86Arch::disable_irq(15), Ok(()));
        assert_eq!(X86Arch::enable_irq(16), Err(Errno::InvalidArgument));
    }
}
