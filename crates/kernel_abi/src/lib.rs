#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod api;
pub mod bootimage;
pub mod event;
pub mod message;
pub mod pid;
pub mod records;

pub use api::{
    decode_result, encode_result, ApiNumber, IoCtlOp, IpcOp, PrivExecOp, ProcessCtlOp, VmCopyOp,
    VmCtlOp, VmShareOp,
};
pub use bootimage::{build_boot_image, parse_boot_image, BootProcess, BootSegment};
pub use event::{ProcessEvent, ProcessEventKind};
pub use message::{Message, MessageKind, MAX_MESSAGE_SIZE, MESSAGE_PAYLOAD_SIZE};
pub use pid::ProcessId;
pub use records::{ProcessInfo, RangeRecord, ShareRecord, SystemInformation, TimerInfo};
