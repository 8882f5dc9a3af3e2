use alloc::string::{String, ToString};
use alloc::vec::Vec;

use hal::{Access, Errno, VirtAddr};

const MAGIC: &[u8; 8] = b"NUCLBOOT";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 8 + 2 + 2;
const PROCESS_HEADER_SIZE: usize = 2 + 2 + 8 + 2 + 2;
const SEGMENT_HEADER_SIZE: usize = 8 + 8 + 4 + 8;
const FLAG_PRIVILEGED: u16 = 1 << 0;

/// One loadable memory segment of a boot process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSegment {
    pub virt: VirtAddr,
    /// Size in memory. Bytes past `data` are zero filled.
    pub size: u64,
    pub access: Access,
    pub data: Vec<u8>,
}

/// A process the kernel starts at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootProcess {
    pub name: String,
    pub privileged: bool,
    pub entry: VirtAddr,
    pub args: String,
    pub segments: Vec<BootSegment>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], Errno> {
        let end = self.offset.checked_add(len).ok_or(Errno::InvalidArgument)?;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(Errno::InvalidArgument)?;
        self.offset = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, Errno> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32, Errno> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64, Errno> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self, len: usize) -> Result<String, Errno> {
        let raw = self.take(len)?;
        let text = core::str::from_utf8(raw).map_err(|_| Errno::InvalidArgument)?;
        Ok(text.to_string())
    }

    fn align(&mut self) {
        self.offset = align_up(self.offset, 8);
    }

    fn ensure(&self, len: usize) -> Result<(), Errno> {
        if self.offset + len > self.bytes.len() {
            return Err(Errno::InvalidArgument);
        }
        Ok(())
    }
}

/// Parses a boot image into its process table.
pub fn parse_boot_image(bytes: &[u8]) -> Result<Vec<BootProcess>, Errno> {
    let mut reader = Reader { bytes, offset: 0 };
    reader.ensure(HEADER_SIZE)?;
    if reader.take(8)? != MAGIC {
        return Err(Errno::InvalidArgument);
    }
    if reader.u16()? != VERSION {
        return Err(Errno::InvalidArgument);
    }
    let count = reader.u16()? as usize;

    let mut processes = Vec::with_capacity(count);
    for _ in 0..count {
        reader.ensure(PROCESS_HEADER_SIZE)?;
        let name_len = reader.u16()? as usize;
        let flags = reader.u16()?;
        let entry = reader.u64()?;
        let args_len = reader.u16()? as usize;
        let segment_count = reader.u16()? as usize;
        let name = reader.string(name_len)?;
        let args = reader.string(args_len)?;
        reader.align();

        let mut segments = Vec::with_capacity(segment_count);
        for _ in 0..segment_count {
            reader.ensure(SEGMENT_HEADER_SIZE)?;
            let virt = reader.u64()?;
            let size = reader.u64()?;
            let access = Access::from_bits(reader.u32()?).ok_or(Errno::InvalidArgument)?;
            let data_len = usize::try_from(reader.u64()?).map_err(|_| Errno::InvalidArgument)?;
            if data_len as u64 > size {
                return Err(Errno::InvalidArgument);
            }
            let data = reader.take(data_len)?.to_vec();
            reader.align();
            segments.push(BootSegment {
                virt,
                size,
                access,
                data,
            });
        }

        processes.push(BootProcess {
            name,
            privileged: flags & FLAG_PRIVILEGED != 0,
            entry,
            args,
            segments,
        });
    }

    Ok(processes)
}

/// Serializes a process table into a boot image.
pub fn build_boot_image(processes: &[BootProcess]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    bytes.extend_from_slice(&(processes.len() as u16).to_le_bytes());

    for process in processes {
        let flags = if process.privileged { FLAG_PRIVILEGED } else { 0 };
        bytes.extend_from_slice(&(process.name.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&flags.to_le_bytes());
        bytes.extend_from_slice(&process.entry.to_le_bytes());
        bytes.extend_from_slice(&(process.args.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&(process.segments.len() as u16).to_le_bytes());
        bytes.extend_from_slice(process.name.as_bytes());
        bytes.extend_from_slice(process.args.as_bytes());
        bytes.resize(align_up(bytes.len(), 8), 0);

        for segment in &process.segments {
            bytes.extend_from_slice(&segment.virt.to_le_bytes());
            bytes.extend_from_slice(&segment.size.to_le_bytes());
            bytes.extend_from_slice(&segment.access.bits().to_le_bytes());
            bytes.extend_from_slice(&(segment.data.len() as u64).to_le_bytes());
            bytes.extend_from_slice(&segment.data);
            bytes.resize(align_up(bytes.len(), 8), 0);
        }
    }

    bytes
}

fn align_up(value: usize, align: usize) -> usize {
    if value % align == 0 {
        value
    } else {
        value + (align - (value % align))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<BootProcess> {
        vec![
            BootProcess {
                name: "core".to_string(),
                privileged: true,
                entry: 0x40_0000,
                args: "/server/core".to_string(),
                segments: vec![
                    BootSegment {
                        virt: 0x40_0000,
                        size: 0x2000,
                        access: Access::READABLE | Access::EXECUTABLE | Access::USER,
                        data: vec![0x90; 17],
                    },
                    BootSegment {
                        virt: 0x60_0000,
                        size: 0x1000,
                        access: Access::READABLE | Access::WRITABLE | Access::USER,
                        data: Vec::new(),
                    },
                ],
            },
            BootProcess {
                name: "rootfs".to_string(),
                privileged: false,
                entry: 0x40_1000,
                args: String::new(),
                segments: Vec::new(),
            },
        ]
    }

    #[test]
    fn boot_image_preserves_process_table() {
        let image = build_boot_image(&sample());
        assert_eq!(image.len() % 8, 0);
        let parsed = parse_boot_image(&image).expect("parse should succeed");
        assert_eq!(parsed, sample());
    }

    #[test]
    fn boot_image_invalid_magic() {
        let mut image = build_boot_image(&[]);
        image[0] = 0x00;
        assert_eq!(parse_boot_image(&image), Err(Errno::InvalidArgument));
    }

    #[test]
    fn boot_image_invalid_version() {
        let mut image = build_boot_image(&[]);
        image[8] = 0x02;
        assert_eq!(parse_boot_image(&image), Err(Errno::InvalidArgument));
    }

    #[test]
    fn boot_image_truncated_anywhere_is_rejected() {
        let image = build_boot_image(&sample());
        for len in [4, HEADER_SIZE + 3, 40, image.len() - 16] {
            assert_eq!(
                parse_boot_image(&image[..len]),
                Err(Errno::InvalidArgument),
                "truncated at {len}"
            );
        }
    }

    #[test]
    fn segment_data_larger_than_size_is_rejected() {
        let mut processes = sample();
        processes[0].segments[1].size = 0;
        processes[0].segments[1].data = vec![1, 2, 3];
        let image = build_boot_image(&processes);
        assert_eq!(parse_boot_image(&image), Err(Errno::InvalidArgument));
    }

    #[test]
    fn unknown_access_bits_are_rejected() {
        let mut image = build_boot_image(&sample());
        // Name and args of the first process take 16 bytes before padding.
        let segment = align_up(HEADER_SIZE + PROCESS_HEADER_SIZE + 16, 8);
        let access_offset = segment + 16;
        image[access_offset + 3] = 0x80;
        assert_eq!(parse_boot_image(&image), Err(Errno::InvalidArgument));
    }
}
