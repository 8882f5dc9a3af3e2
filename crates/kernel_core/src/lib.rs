#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod boot;
pub mod channel;
pub mod config;
pub mod ipc;
pub mod kernel;
pub mod memory;
pub mod pmm;
pub mod process;
pub mod process_manager;
pub mod protection;
pub mod scheduler;
pub mod shares;
mod syscall;

#[cfg(test)]
mod testing;

pub use boot::{BootInfo, MemoryKind, MemoryRegion};
pub use channel::{ChannelMode, MemoryChannel};
pub use config::KernelConfig;
pub use hal::Errno;
pub use ipc::MessageQueue;
pub use kernel::Kernel;
pub use memory::MemoryContext;
pub use pmm::{BitmapAllocator, FRAME_SIZE};
pub use process::{Process, ProcessState};
pub use process_manager::{ProcessManager, Switch};
pub use protection::{is_user_address, validate_user_buffer, KERNEL_VIRT_BASE};
pub use scheduler::Scheduler;
pub use shares::{create_share, remove_shares, MemoryShare, ProcessShares, ShareRequest, ShareState};
