//! Disk image layout and boot linkage
//!
//! An image is the boot sector, optionally a diskmap sector, then the
//! kernel padded to whole sectors. The boot loader learns where the kernel
//! lives either from its own patched disk address packet or from the
//! diskmap sector, never from both.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::boot::{BootSector, PARTITION_TABLE};
use crate::error::{ImageError, Result};
use crate::sector::{self, SECTOR_SIZE};
use crate::symbols::DapOffsets;

/// Real-mode loading ceiling for everything in front of the kernel's end
pub const BOOT_REGION_LIMIT: usize = 1024 * 1024;

/// How the boot loader finds the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Boot sector, kernel. The DAP fields at these offsets get patched.
    Direct(DapOffsets),
    /// Boot sector, diskmap sector, kernel. The boot sector is left as is.
    Diskmap,
}

impl Layout {
    /// Sector index where the kernel starts
    pub fn kernel_offset(&self) -> u16 {
        match self {
            Layout::Direct(_) => 1,
            Layout::Diskmap => 2,
        }
    }

    fn header_sectors(&self) -> usize {
        self.kernel_offset() as usize
    }
}

/// Location record stored in the diskmap sector: two LE u16, then zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diskmap {
    pub kernel_offset: u16,
    pub kernel_size: u16,
}

impl Diskmap {
    pub fn to_sector(self) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[0..2].copy_from_slice(&self.kernel_offset.to_le_bytes());
        sector[2..4].copy_from_slice(&self.kernel_size.to_le_bytes());
        sector
    }
}

/// A fully laid out image, ready to be written.
#[derive(Debug)]
pub struct DiskImage {
    bytes: Vec<u8>,
    pub kernel_offset: u16,
    pub kernel_size: u16,
}

impl DiskImage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Writes the image at the start of `target`, leaving whatever lies
    /// past its end alone.
    pub fn write_to<W: Write + Seek>(&self, target: &mut W) -> std::io::Result<()> {
        target.seek(SeekFrom::Start(0))?;
        target.write_all(self.as_bytes())?;
        target.flush()
    }

    /// Writes onto the file or block device at `path`, creating a file if
    /// needed. An existing file is overwritten in front only, never
    /// truncated.
    pub fn write_file(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ImageError::io(path, e))?;
        self.write_to(&mut file)
            .and_then(|()| file.sync_all())
            .map_err(|e| ImageError::io(path, e))?;
        log::info!(
            "wrote {} bytes to {} (kernel at sector {}, {} sectors)",
            self.len(),
            path.display(),
            self.kernel_offset,
            self.kernel_size
        );
        Ok(())
    }
}

/// Concatenates kernel payloads in order.
pub fn read_kernel<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<u8>> {
    let mut kernel = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let payload = fs::read(path).map_err(|e| ImageError::io(path, e))?;
        log::debug!("{}: {} bytes", path.display(), payload.len());
        kernel.extend_from_slice(&payload);
    }
    Ok(kernel)
}

/// Lays out `boot` and `kernel` according to `layout`.
///
/// Nothing is written here: every check runs before the caller gets an
/// image back, so a failure never leaves a half-built disk behind.
pub fn assemble(
    mut boot: BootSector,
    kernel: &[u8],
    layout: Layout,
    partition_table: Option<&[u8]>,
) -> Result<DiskImage> {
    // 1. Kernel padded to whole sectors, under the 1 MiB ceiling
    let kernel = sector::pad_to_sector(kernel);
    sector::ensure_aligned("kernel", &kernel)?;

    let header_len = layout.header_sectors() * SECTOR_SIZE;
    let total = header_len + kernel.len();
    if total >= BOOT_REGION_LIMIT {
        return Err(ImageError::Capacity {
            actual: total,
            maximum: BOOT_REGION_LIMIT,
        });
    }

    let kernel_offset = layout.kernel_offset();
    let kernel_sectors = kernel.len() / SECTOR_SIZE;
    let kernel_size = u16::try_from(kernel_sectors).map_err(|_| ImageError::FieldOverflow {
        field: "kernel_size",
        value: kernel_sectors,
    })?;

    // 2. Tell the boot loader where the kernel is and how long
    if let Layout::Direct(dap) = layout {
        boot.write_u16(dap.offset, kernel_offset);
        boot.write_u16(dap.size, kernel_size);
        log::trace!(
            "patched dap.offset={} dap.size={}",
            boot.read_u16(dap.offset),
            boot.read_u16(dap.size)
        );
    }

    // 3. Partition table last, so it always survives intact
    if let Some(table) = partition_table {
        if let Layout::Direct(dap) = layout {
            if overlaps_partition_table(&dap) {
                log::warn!("DAP fields {:?} lie inside the partition table region", dap);
            }
        }
        boot.splice_partition_table(table)?;
    }

    // 4. Boot sector, location sector if any, kernel
    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(boot.as_bytes());
    if layout == Layout::Diskmap {
        let diskmap = Diskmap {
            kernel_offset,
            kernel_size,
        };
        bytes.extend_from_slice(&diskmap.to_sector());
    }
    bytes.extend_from_slice(&kernel);

    if !boot.has_boot_signature() {
        log::warn!("boot sector does not end with 0x55AA, firmware will refuse to boot it");
    }
    log::debug!(
        "layout {:?}: kernel_offset={} kernel_size={} total={}",
        layout,
        kernel_offset,
        kernel_size,
        bytes.len()
    );

    Ok(DiskImage {
        bytes,
        kernel_offset,
        kernel_size,
    })
}

fn overlaps_partition_table(dap: &DapOffsets) -> bool {
    [dap.offset, dap.size]
        .iter()
        .any(|&field| field + 2 > PARTITION_TABLE.start && field < PARTITION_TABLE.end)
}
