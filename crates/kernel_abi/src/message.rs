use hal::Errno;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::pid::ProcessId;

/// Size of every IPC message on the wire.
pub const MAX_MESSAGE_SIZE: usize = 64;

/// Bytes available after the header.
pub const MESSAGE_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - 8;

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    Ipc = 0,
    Irq = 1,
    Fault = 2,
}

impl TryFrom<u32> for MessageKind {
    type Error = Errno;

    fn try_from(value: u32) -> Result<Self, Errno> {
        match value {
            0 => Ok(MessageKind::Ipc),
            1 => Ok(MessageKind::Irq),
            2 => Ok(MessageKind::Fault),
            _ => Err(Errno::InvalidArgument),
        }
    }
}

/// Fixed-size IPC message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Message {
    pub from: u32,
    pub kind: u32,
    pub payload: [u8; MESSAGE_PAYLOAD_SIZE],
}

const_assert_eq!(core::mem::size_of::<Message>(), MAX_MESSAGE_SIZE);

impl Message {
    /// Builds a message, rejecting payloads that do not fit.
    pub fn new(kind: MessageKind, payload: &[u8]) -> Result<Self, Errno> {
        if payload.len() > MESSAGE_PAYLOAD_SIZE {
            return Err(Errno::InvalidArgument);
        }
        let mut message = Self {
            from: ProcessId::KERNEL.raw(),
            kind: kind as u32,
            payload: [0; MESSAGE_PAYLOAD_SIZE],
        };
        message.payload[..payload.len()].copy_from_slice(payload);
        Ok(message)
    }

    /// Decodes a message from the first bytes of `bytes`.
    ///
    /// Shorter inputs are zero padded. Inputs longer than a message are
    /// rejected rather than truncated.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, Errno> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Errno::InvalidArgument);
        }
        let mut raw = [0u8; MAX_MESSAGE_SIZE];
        raw[..bytes.len()].copy_from_slice(bytes);
        Self::read_from_bytes(&raw).map_err(|_| Errno::InvalidArgument)
    }

    /// Sender of the message.
    pub fn sender(&self) -> ProcessId {
        ProcessId::from_raw(self.from)
    }

    /// Type tag of the message.
    pub fn message_kind(&self) -> Result<MessageKind, Errno> {
        MessageKind::try_from(self.kind)
    }
}
