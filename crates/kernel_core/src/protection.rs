use hal::{Errno, VirtAddr};

/// Start of the kernel half of every address space.
pub const KERNEL_VIRT_BASE: VirtAddr = 0xFFFF_8000_0000_0000;

/// Returns true if the given virtual address is in user space.
pub fn is_user_address(addr: VirtAddr) -> bool {
    addr < KERNEL_VIRT_BASE
}

/// Validates a buffer passed in from user space.
///
/// Empty buffers are accepted. A buffer that reaches into the kernel half
/// is an `AccessViolation` and one that wraps the address space is
/// `InvalidAddress`.
pub fn validate_user_buffer(addr: VirtAddr, len: usize) -> Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    let end = addr
        .checked_add(len as u64 - 1)
        .ok_or(Errno::InvalidAddress)?;
    if is_user_address(addr) && is_user_address(end) {
        Ok(())
    } else {
        Err(Errno::AccessViolation)
    }
}
