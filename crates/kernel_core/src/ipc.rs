use alloc::collections::VecDeque;

use hal::Errno;
use kernel_abi::{Message, ProcessId};

use crate::config::IPC_QUEUE_LEN;

/// Bounded inbox of IPC messages waiting for a process.
#[derive(Debug, Default)]
pub struct MessageQueue {
    queue: VecDeque<Message>,
}

impl MessageQueue {
    /// Creates an empty inbox.
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Enqueues a message. Fails `ChannelFull` when the inbox is full.
    pub fn push(&mut self, message: Message) -> Result<(), Errno> {
        if self.queue.len() >= IPC_QUEUE_LEN {
            return Err(Errno::ChannelFull);
        }
        self.queue.push_back(message);
        Ok(())
    }

    /// Removes the oldest message sent by `from`, or the oldest message at
    /// all when `from` is `ANY`.
    pub fn take_from(&mut self, from: ProcessId) -> Option<Message> {
        if from.is_any() {
            return self.queue.pop_front();
        }
        let position = self
            .queue
            .iter()
            .position(|message| message.sender() == from)?;
        self.queue.remove(position)
    }

    /// Drops every queued message.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Returns the number of queued messages.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
