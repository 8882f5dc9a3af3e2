use core::fmt;

/// Identity of a process: a table slot plus a reuse generation.
///
/// The low 16 bits select the slot and the high 16 bits count how many
/// times that slot has been reused. A stale id from before a slot was
/// recycled therefore never matches the new occupant.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ProcessId(u32);

impl ProcessId {
    const INDEX_BITS: u32 = 16;
    const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;

    /// Wildcard: any process.
    pub const ANY: Self = Self(0xFFFF);
    /// The calling process.
    pub const SELF: Self = Self(0xFFFE);
    /// The kernel itself.
    pub const KERNEL: Self = Self(0xFFFD);

    /// First boot server: process management services.
    pub const CORE_SERVER: Self = Self(0);
    /// Root filesystem server.
    pub const ROOT_FILESYSTEM: Self = Self(1);
    /// Memory server.
    pub const MEMORY_SERVER: Self = Self(2);
    /// Device server.
    pub const DEVICE_SERVER: Self = Self(3);

    /// Number of slots reserved for the sentinel identities.
    pub const RESERVED_INDICES: u16 = 3;

    /// Builds an id from a slot index and generation.
    pub const fn for_index_and_gen(index: u16, generation: u16) -> Self {
        Self(((generation as u32) << Self::INDEX_BITS) | index as u32)
    }

    /// Rebuilds an id from its ABI encoding.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the ABI encoding.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the slot index.
    pub const fn index(self) -> u16 {
        (self.0 & Self::INDEX_MASK) as u16
    }

    /// Returns the reuse generation.
    pub const fn generation(self) -> u16 {
        (self.0 >> Self::INDEX_BITS) as u16
    }

    /// Returns the id the same slot gets on its next reuse.
    pub const fn next_generation(self) -> Self {
        Self::for_index_and_gen(self.index(), self.generation().wrapping_add(1))
    }

    /// True for ANY, SELF and KERNEL regardless of generation bits.
    pub const fn is_sentinel(self) -> bool {
        self.index() >= 0xFFFF - Self::RESERVED_INDICES + 1
    }

    pub const fn is_any(self) -> bool {
        self.index() == Self::ANY.index()
    }

    pub const fn is_self(self) -> bool {
        self.index() == Self::SELF.index()
    }

    pub const fn is_kernel(self) -> bool {
        self.index() == Self::KERNEL.index()
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            id if id.is_any() => f.write_str("ProcessId(ANY)"),
            id if id.is_self() => f.write_str("ProcessId(SELF)"),
            id if id.is_kernel() => f.write_str("ProcessId(KERNEL)"),
            id => write!(f, "ProcessId({}:{})", id.index(), id.generation()),
        }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}
