use hal::{Access, Range};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Wire form of a memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RangeRecord {
    pub virt: u64,
    pub phys: u64,
    pub size: u64,
    pub access: u64,
}

const_assert_eq!(core::mem::size_of::<RangeRecord>(), 32);

impl From<Range> for RangeRecord {
    fn from(range: Range) -> Self {
        Self {
            virt: range.virt,
            phys: range.phys,
            size: range.size,
            access: range.access.bits() as u64,
        }
    }
}

impl From<RangeRecord> for Range {
    fn from(record: RangeRecord) -> Self {
        Range {
            virt: record.virt,
            phys: record.phys,
            size: record.size,
            access: Access::from_bits_truncate(record.access as u32),
        }
    }
}

/// Wire form of a memory share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ShareRecord {
    pub pid: u32,
    pub core_id: u32,
    pub tag_id: u64,
    pub range: RangeRecord,
    pub attached: u32,
    pub reserved: u32,
}

const_assert_eq!(core::mem::size_of::<ShareRecord>(), 56);

/// Process status returned by `ProcessCtl::InfoPid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ProcessInfo {
    pub id: u32,
    pub parent: u32,
    pub state: u32,
    pub privileged: u32,
    pub entry: u64,
}

/// Timer status returned by `ProcessCtl::InfoTimer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TimerInfo {
    pub frequency: u64,
    pub ticks: u64,
}

/// Core status returned by `SystemInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SystemInformation {
    pub core_id: u32,
    pub process_count: u32,
    pub memory_total: u64,
    pub memory_available: u64,
    pub timer_frequency: u64,
    pub ticks: u64,
}
