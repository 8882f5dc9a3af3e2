use core::fmt::{self, Write};

#[cfg(feature = "x86_64")]
use arch_x86_64 as arch;
use spin::Mutex;

/// Serialises writers so lines from the logger never interleave.
static CONSOLE: Mutex<ConsoleWriter> = Mutex::new(ConsoleWriter);

/// Initializes the early serial console.
pub fn init_early() {
    #[cfg(feature = "x86_64")]
    arch::init_serial();
}

pub fn print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        #[cfg(feature = "x86_64")]
        arch::serial_write_str(_s);
        Ok(())
    }
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        $crate::console::print(format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint!("\n");
    }};
    ($($arg:tt)*) => {{
        $crate::kprint!("{}\n", format_args!($($arg)*));
    }};
}
