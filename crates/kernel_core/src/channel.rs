use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use hal::{CacheOps, Errno, VirtAddr, PAGE_SIZE};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Side of a channel this endpoint drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Producer,
    Consumer,
}

/// Single-producer, single-consumer message ring over two shared pages.
///
/// The data page starts with the producer's published index, followed by
/// the message slots. The feedback page holds only the consumer's
/// published index. One slot always stays empty so that a full ring can
/// be told apart from an empty one.
#[derive(Debug)]
pub struct MemoryChannel<C: CacheOps> {
    mode: ChannelMode,
    message_size: usize,
    maximum_messages: usize,
    data: Option<NonNull<u8>>,
    feedback: Option<NonNull<u8>>,
    head: usize,
    cache: C,
}

// SAFETY: the bound pages are only touched through this endpoint and the
// index words are accessed atomically.
unsafe impl<C: CacheOps + Send> Send for MemoryChannel<C> {}

impl<C: CacheOps + Default> MemoryChannel<C> {
    /// Creates an unbound channel endpoint for messages of `message_size`.
    pub fn new(mode: ChannelMode, message_size: usize) -> Result<Self, Errno> {
        if message_size < size_of::<usize>() || message_size >= PAGE_SIZE as usize / 2 {
            return Err(Errno::InvalidArgument);
        }
        Ok(Self {
            mode,
            message_size,
            maximum_messages: PAGE_SIZE as usize / message_size - 1,
            data: None,
            feedback: None,
            head: 0,
            cache: C::default(),
        })
    }
}

impl<C: CacheOps> MemoryChannel<C> {
    /// Binds the endpoint to its two pages.
    ///
    /// With `hard_reset` the local index restarts at zero and is published.
    /// Otherwise the index is reloaded from the page this side owns.
    ///
    /// # Safety
    ///
    /// Both pointers must be page aligned, reference a full page each and
    /// stay valid until the channel is unbound or dropped.
    pub unsafe fn set_virtual(
        &mut self,
        data: *mut u8,
        feedback: *mut u8,
        hard_reset: bool,
    ) -> Result<(), Errno> {
        let data = NonNull::new(data).ok_or(Errno::InvalidArgument)?;
        let feedback = NonNull::new(feedback).ok_or(Errno::InvalidArgument)?;
        if data.as_ptr() as u64 % PAGE_SIZE != 0 || feedback.as_ptr() as u64 % PAGE_SIZE != 0 {
            return Err(Errno::InvalidArgument);
        }
        self.data = Some(data);
        self.feedback = Some(feedback);
        let own = self.own_index()?;
        let head = if hard_reset {
            own.store(0, Ordering::Release);
            0
        } else {
            own.load(Ordering::Acquire) % self.maximum_messages
        };
        self.head = head;
        Ok(())
    }

    /// Detaches the endpoint from its pages.
    pub fn unbind(&mut self) {
        self.data = None;
        self.feedback = None;
    }

    /// Side of the channel.
    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Size of each message in bytes.
    pub fn message_size(&self) -> usize {
        self.message_size
    }

    /// Number of messages that fit before `write` reports `ChannelFull`.
    pub fn capacity(&self) -> usize {
        self.maximum_messages - 1
    }

    /// Cache maintenance backend.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    fn pages(&self) -> Result<(NonNull<u8>, NonNull<u8>), Errno> {
        match (self.data, self.feedback) {
            (Some(data), Some(feedback)) => Ok((data, feedback)),
            _ => Err(Errno::InvalidAddress),
        }
    }

    fn index_at(&self, page: NonNull<u8>) -> &AtomicUsize {
        // SAFETY: pages are page aligned and valid while bound. The index
        // word is only accessed atomically by both sides.
        unsafe { AtomicUsize::from_ptr(page.as_ptr().cast::<usize>()) }
    }

    fn own_index(&self) -> Result<&AtomicUsize, Errno> {
        let (data, feedback) = self.pages()?;
        Ok(match self.mode {
            ChannelMode::Producer => self.index_at(data),
            ChannelMode::Consumer => self.index_at(feedback),
        })
    }

    fn slot(&self, data: NonNull<u8>, index: usize) -> *mut u8 {
        // SAFETY: (index + 1) * message_size + message_size <= PAGE_SIZE
        // because index < maximum_messages.
        unsafe { data.as_ptr().add((index + 1) * self.message_size) }
    }

    /// Appends one message.
    pub fn write(&mut self, message: &[u8]) -> Result<(), Errno> {
        if self.mode != ChannelMode::Producer || message.len() != self.message_size {
            return Err(Errno::InvalidArgument);
        }
        let (data, feedback) = self.pages()?;
        let reader = self.index_at(feedback).load(Ordering::Acquire);
        let next = (self.head + 1) % self.maximum_messages;
        if next == reader {
            return Err(Errno::ChannelFull);
        }
        // SAFETY: the slot lies inside the data page and the consumer does
        // not read it until the new head is published below.
        unsafe {
            core::ptr::copy_nonoverlapping(message.as_ptr(), self.slot(data, self.head), message.len());
        }
        self.head = next;
        self.index_at(data).store(next, Ordering::Release);
        Ok(())
    }

    /// Removes the oldest message into `message`.
    pub fn read(&mut self, message: &mut [u8]) -> Result<(), Errno> {
        if self.mode != ChannelMode::Consumer || message.len() != self.message_size {
            return Err(Errno::InvalidArgument);
        }
        let (data, feedback) = self.pages()?;
        let writer = self.index_at(data).load(Ordering::Acquire);
        if writer == self.head {
            return Err(Errno::NotFound);
        }
        // SAFETY: the producer published this slot before advancing its
        // index and will not reuse it until our index moves past it.
        unsafe {
            core::ptr::copy_nonoverlapping(self.slot(data, self.head), message.as_mut_ptr(), message.len());
        }
        self.head = (self.head + 1) % self.maximum_messages;
        self.index_at(feedback).store(self.head, Ordering::Release);
        Ok(())
    }

    /// Writes a fixed-size record.
    pub fn write_record<T: IntoBytes + Immutable>(&mut self, record: &T) -> Result<(), Errno> {
        self.write(record.as_bytes())
    }

    /// Reads a fixed-size record.
    pub fn read_record<T: FromBytes + IntoBytes>(&mut self) -> Result<T, Errno> {
        let mut record = T::new_zeroed();
        self.read(record.as_mut_bytes())?;
        Ok(record)
    }

    /// Pushes both pages out of the data cache.
    pub fn flush(&self) {
        if let Ok((data, feedback)) = self.pages() {
            self.cache.clean_data(data.as_ptr() as VirtAddr);
            self.cache.clean_data(feedback.as_ptr() as VirtAddr);
        }
    }
}
