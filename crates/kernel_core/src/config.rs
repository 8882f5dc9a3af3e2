//! Compile-time limits of the kernel core.

/// Maximum number of live processes per core.
pub const MAX_PROCESSES: usize = 1024;

/// Maximum number of memory shares a single process may hold.
pub const MAXIMUM_MEMORY_SHARES: usize = 32;

/// Maximum number of queued IPC messages per process.
pub const IPC_QUEUE_LEN: usize = 32;

/// Timer frequency used when the architecture does not report one.
pub const DEFAULT_TIMER_FREQUENCY: u32 = 100;

/// Share tag of the per-process kernel event channel.
pub const KERNEL_CHANNEL_TAG: u64 = 0;

/// Pages mapped for each boot process stack.
pub const BOOT_STACK_PAGES: u64 = 4;

/// Longest string accepted by `PrivExec::WriteConsole`.
pub const CONSOLE_WRITE_MAX: usize = 256;

/// Runtime configuration of one kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub core_id: u32,
    pub timer_frequency: u32,
    pub max_processes: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            core_id: 0,
            timer_frequency: DEFAULT_TIMER_FREQUENCY,
            max_processes: MAX_PROCESSES,
        }
    }
}
