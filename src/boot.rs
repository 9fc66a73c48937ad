use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::Path;

use crate::error::{ImageError, Result};
use crate::sector::SECTOR_SIZE;

/// MBR tail owned by the partitioning tool: disk signature, the four
/// partition entries and the 0x55AA marker. Copied verbatim, never parsed.
pub const PARTITION_TABLE: Range<usize> = 0x1B8..0x200;

/// Bytes the BIOS expects at the very end of a bootable sector
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Raw partition table region lifted from an existing image
pub type PartitionTable = [u8; PARTITION_TABLE.end - PARTITION_TABLE.start];

/// The first sector of the disk: boot code with patchable fields.
#[derive(Clone, PartialEq, Eq)]
pub struct BootSector {
    bytes: [u8; SECTOR_SIZE],
}

impl BootSector {
    /// Takes a raw boot loader binary, which must be exactly one sector.
    pub fn from_bytes(code: &[u8]) -> Result<Self> {
        let bytes: [u8; SECTOR_SIZE] = code
            .try_into()
            .map_err(|_| ImageError::BootSectorSize { actual: code.len() })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Overwrites the 16-bit little-endian field at `offset`.
    ///
    /// The caller guarantees `offset + 2 <= SECTOR_SIZE`; resolved DAP
    /// offsets are range checked before they get here.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    /// Puts back the partition table a partitioning tool already wrote
    /// so the new boot code does not wipe it.
    pub fn splice_partition_table(&mut self, table: &[u8]) -> Result<()> {
        if table.len() != PARTITION_TABLE.len() {
            return Err(ImageError::PartitionTableSize {
                actual: table.len(),
            });
        }
        self.bytes[PARTITION_TABLE].copy_from_slice(table);
        log::debug!("kept partition table {:02x?}", &self.partition_table()[6..]);
        Ok(())
    }

    pub fn partition_table(&self) -> &[u8] {
        &self.bytes[PARTITION_TABLE]
    }

    pub fn has_boot_signature(&self) -> bool {
        self.bytes[SECTOR_SIZE - 2..] == BOOT_SIGNATURE
    }
}

impl std::fmt::Debug for BootSector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootSector")
            .field("signature", &self.has_boot_signature())
            .finish_non_exhaustive()
    }
}

/// Reads the partition table region out of the first sector of `image`.
pub fn read_partition_table(image: &Path) -> Result<PartitionTable> {
    let mut sector = [0u8; SECTOR_SIZE];
    File::open(image)
        .and_then(|mut file| file.read_exact(&mut sector))
        .map_err(|e| ImageError::io(image, e))?;

    let mut table = [0u8; PARTITION_TABLE.end - PARTITION_TABLE.start];
    table.copy_from_slice(&sector[PARTITION_TABLE]);
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use xshell::Shell;

    fn sample_code() -> Vec<u8> {
        let mut code = vec![0x90u8; SECTOR_SIZE];
        code[SECTOR_SIZE - 2..].copy_from_slice(&BOOT_SIGNATURE);
        code
    }

    #[test]
    fn test_boot_sector_must_be_one_sector() {
        assert!(BootSector::from_bytes(&sample_code()).is_ok());

        let err = BootSector::from_bytes(&[0u8; 510]).unwrap_err();
        assert!(matches!(err, ImageError::BootSectorSize { actual: 510 }));
        let err = BootSector::from_bytes(&[0u8; 1024]).unwrap_err();
        assert!(matches!(err, ImageError::BootSectorSize { actual: 1024 }));
    }

    #[test]
    fn test_write_u16_round_trips_every_value() {
        let mut boot = BootSector::from_bytes(&sample_code()).unwrap();
        for value in 0..=u16::MAX {
            boot.write_u16(0x1C4, value);
            assert_eq!(boot.read_u16(0x1C4), value);
        }
        // Neighbouring bytes stay untouched
        assert_eq!(boot.as_bytes()[0x1C3], 0x90);
        assert_eq!(boot.as_bytes()[0x1C6], 0x90);
    }

    #[test]
    fn test_write_u16_is_little_endian() {
        let mut boot = BootSector::from_bytes(&sample_code()).unwrap();
        boot.write_u16(0x10, 0x1234);
        assert_eq!(&boot.as_bytes()[0x10..0x12], &[0x34, 0x12]);
    }

    #[test]
    fn test_splice_partition_table() {
        let mut boot = BootSector::from_bytes(&sample_code()).unwrap();
        let table: Vec<u8> = (0..PARTITION_TABLE.len() as u8).collect();
        boot.splice_partition_table(&table).unwrap();

        assert_eq!(boot.partition_table(), &table[..]);
        assert_eq!(&boot.as_bytes()[..PARTITION_TABLE.start], &sample_code()[..0x1B8]);
    }

    #[test]
    fn test_splice_rejects_wrong_length() {
        let mut boot = BootSector::from_bytes(&sample_code()).unwrap();
        let err = boot.splice_partition_table(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, ImageError::PartitionTableSize { actual: 64 }));
        assert_eq!(boot.as_bytes(), &sample_code()[..]);
    }

    #[test]
    fn test_boot_signature() {
        let boot = BootSector::from_bytes(&sample_code()).unwrap();
        assert!(boot.has_boot_signature());
        let blank = BootSector::from_bytes(&[0u8; SECTOR_SIZE]).unwrap();
        assert!(!blank.has_boot_signature());
    }

    #[test]
    fn test_read_partition_table_from_image() {
        let sh = Shell::new().unwrap();
        let tmp = sh.create_temp_dir().unwrap();
        let image = tmp.path().join("diskimg");

        let mut mbr = vec![0u8; 4 * SECTOR_SIZE];
        mbr[0x1BE] = 0x80; // active flag of the first entry
        mbr[0x1C2] = 0x83; // Linux partition type
        mbr[0x1FE..0x200].copy_from_slice(&BOOT_SIGNATURE);
        fs::write(&image, &mbr).unwrap();

        let table = read_partition_table(&image).unwrap();
        assert_eq!(&table[..], &mbr[PARTITION_TABLE]);
    }

    #[test]
    fn test_read_partition_table_short_image() {
        let sh = Shell::new().unwrap();
        let tmp = sh.create_temp_dir().unwrap();
        let image = tmp.path().join("tiny");
        fs::write(&image, [0u8; 100]).unwrap();
        assert!(matches!(
            read_partition_table(&image),
            Err(ImageError::Io { .. })
        ));
    }
}
