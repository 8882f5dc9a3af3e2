use hal::Errno;

macro_rules! abi_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(usize)]
        pub enum $name {
            $($variant = $value),+
        }

        impl TryFrom<usize> for $name {
            type Error = Errno;

            fn try_from(value: usize) -> Result<Self, Errno> {
                match value {
                    $(v if v == $value => Ok($name::$variant),)+
                    _ => Err(Errno::InvalidArgument),
                }
            }
        }
    };
}

abi_enum! {
    /// System-call numbers.
    ApiNumber {
        PrivExec = 1,
        ProcessCtl = 2,
        SystemInfo = 3,
        VmCopy = 4,
        VmCtl = 5,
        VmShare = 6,
        IpcMessage = 7,
        IoCtl = 8,
    }
}

abi_enum! {
    /// Operations of `IpcMessage`.
    IpcOp {
        Send = 0,
        Receive = 1,
        SendReceive = 2,
    }
}

abi_enum! {
    /// Operations of `PrivExec`.
    PrivExecOp {
        Idle = 0,
        Reboot = 1,
        Shutdown = 2,
        WriteConsole = 3,
    }
}

abi_enum! {
    /// Operations of `ProcessCtl`.
    ProcessCtlOp {
        Spawn = 0,
        Kill = 1,
        GetPid = 2,
        GetParent = 3,
        Schedule = 4,
        Stop = 5,
        Resume = 6,
        Reset = 7,
        Wakeup = 8,
        WatchIrq = 9,
        EnableIrq = 10,
        DisableIrq = 11,
        InfoPid = 12,
        WaitPid = 13,
        InfoTimer = 14,
        WaitTimer = 15,
        EnterSleep = 16,
        SetStack = 17,
    }
}

abi_enum! {
    /// Operations of `VmCtl`.
    VmCtlOp {
        Map = 0,
        Unmap = 1,
        Release = 2,
        Lookup = 3,
        Access = 4,
        CacheClean = 5,
        ClaimPhysical = 6,
    }
}

abi_enum! {
    /// Operations of `VmShare`.
    VmShareOp {
        Create = 0,
        Read = 1,
        Delete = 2,
    }
}

abi_enum! {
    /// Operations of `VmCopy`.
    VmCopyOp {
        Read = 0,
        Write = 1,
    }
}

abi_enum! {
    /// Operations of `IoCtl`.
    IoCtlOp {
        Read = 0,
        Write = 1,
    }
}

const CODE_BITS: u32 = 16;
const CODE_MASK: usize = (1 << CODE_BITS) - 1;

/// Packs a system-call result into one machine word.
///
/// The errno code occupies the low 16 bits (zero on success) and the
/// value the remaining bits.
pub fn encode_result(result: Result<usize, Errno>) -> usize {
    match result {
        Ok(value) => value << CODE_BITS,
        Err(errno) => errno.code() as usize,
    }
}

/// Unpacks a word produced by [`encode_result`].
pub fn decode_result(word: usize) -> Result<usize, Errno> {
    match (word & CODE_MASK) as u16 {
        0 => Ok(word >> CODE_BITS),
        code => Err(Errno::from_code(code).unwrap_or(Errno::InvalidArgument)),
    }
}
