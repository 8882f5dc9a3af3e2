use hal::Errno;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::records::ShareRecord;

/// Kind of an asynchronous kernel notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessEventKind {
    Interrupt = 0,
    ShareCreated = 1,
    ProcessTerminated = 2,
}

impl TryFrom<u32> for ProcessEventKind {
    type Error = Errno;

    fn try_from(value: u32) -> Result<Self, Errno> {
        match value {
            0 => Ok(ProcessEventKind::Interrupt),
            1 => Ok(ProcessEventKind::ShareCreated),
            2 => Ok(ProcessEventKind::ProcessTerminated),
            _ => Err(Errno::InvalidArgument),
        }
    }
}

/// Record delivered through a process's kernel event channel.
///
/// `number` carries the interrupt vector or the process id the event is
/// about. `share` is only meaningful for `ShareCreated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ProcessEvent {
    pub kind: u32,
    pub number: u32,
    pub share: ShareRecord,
}

const_assert_eq!(core::mem::size_of::<ProcessEvent>(), 64);

impl ProcessEvent {
    /// Creates an event without share payload.
    pub fn new(kind: ProcessEventKind, number: u32) -> Self {
        Self {
            kind: kind as u32,
            number,
            share: ShareRecord::default(),
        }
    }

    /// Creates a `ShareCreated` event.
    pub fn share_created(number: u32, share: ShareRecord) -> Self {
        Self {
            kind: ProcessEventKind::ShareCreated as u32,
            number,
            share,
        }
    }

    /// Decoded event kind.
    pub fn event_kind(&self) -> Result<ProcessEventKind, Errno> {
        ProcessEventKind::try_from(self.kind)
    }
}
