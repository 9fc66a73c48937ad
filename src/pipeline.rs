use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::boot::{self, BootSector};
use crate::image::{self, DiskImage, Layout};
use crate::symbols::{DapOffsets, SymbolTable};

/// Which layout a build uses, before symbols are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutKind {
    #[default]
    Direct,
    Diskmap,
}

impl LayoutKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "direct" => Some(LayoutKind::Direct),
            "diskmap" => Some(LayoutKind::Diskmap),
            _ => None,
        }
    }
}

/// Inputs of one `assemble` run, all taken from files.
#[derive(Debug, Clone)]
pub struct AssembleJob {
    pub boot: PathBuf,
    /// Linked boot loader ELF or an `nm` listing of it
    pub symbols: Option<PathBuf>,
    pub kernel: Vec<PathBuf>,
    pub layout: LayoutKind,
    /// Image whose first sector holds the partition table to keep
    pub partition_table_from: Option<PathBuf>,
    pub output: PathBuf,
}

impl AssembleJob {
    /// Reads and checks every input, then writes the image.
    ///
    /// The output is only opened once assembly succeeded in memory.
    pub fn run(&self) -> Result<DiskImage> {
        // 1. Boot sector, then the layout it was built for
        let code = fs::read(&self.boot)
            .with_context(|| format!("failed to read boot sector {}", self.boot.display()))?;
        let boot = BootSector::from_bytes(&code)
            .with_context(|| format!("invalid boot sector {}", self.boot.display()))?;

        let layout = match self.layout {
            LayoutKind::Direct => {
                let Some(symbols) = &self.symbols else {
                    bail!("the direct layout needs the boot loader symbols (--symbols)");
                };
                let table = SymbolTable::load(symbols)
                    .with_context(|| format!("failed to load symbols from {}", symbols.display()))?;
                Layout::Direct(DapOffsets::resolve(&table)?)
            }
            LayoutKind::Diskmap => Layout::Diskmap,
        };

        // 2. Payloads and the table to keep
        let kernel = image::read_kernel(&self.kernel)?;
        let partition_table = self
            .partition_table_from
            .as_deref()
            .map(boot::read_partition_table)
            .transpose()?;

        // 3. Everything is checked in memory before the output is touched
        let image = image::assemble(
            boot,
            &kernel,
            layout,
            partition_table.as_ref().map(|table| &table[..]),
        )?;
        image.write_file(&self.output)?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{BOOT_SIGNATURE, PARTITION_TABLE};
    use crate::error::ImageError;
    use crate::image::BOOT_REGION_LIMIT;
    use crate::sector::SECTOR_SIZE;
    use std::path::Path;
    use xshell::Shell;

    const LISTING: &str = "00007c00 T _start\n00007d80 d dap.offset\n00007d82 d dap.size\n";

    fn write_boot(dir: &Path) -> PathBuf {
        let mut code = vec![0xEBu8; SECTOR_SIZE];
        code[SECTOR_SIZE - 2..].copy_from_slice(&BOOT_SIGNATURE);
        let path = dir.join("boot.bin");
        fs::write(&path, code).unwrap();
        path
    }

    fn job(dir: &Path) -> AssembleJob {
        let symbols = dir.join("boot.sym");
        fs::write(&symbols, LISTING).unwrap();
        let kernel = dir.join("kernel.bin");
        fs::write(&kernel, vec![0x42u8; 1300]).unwrap();

        AssembleJob {
            boot: write_boot(dir),
            symbols: Some(symbols),
            kernel: vec![kernel],
            layout: LayoutKind::Direct,
            partition_table_from: None,
            output: dir.join("diskimg"),
        }
    }

    #[test]
    fn test_layout_names() {
        assert_eq!(LayoutKind::from_name("direct"), Some(LayoutKind::Direct));
        assert_eq!(LayoutKind::from_name("diskmap"), Some(LayoutKind::Diskmap));
        assert_eq!(LayoutKind::from_name("gpt"), None);
        assert_eq!(LayoutKind::default(), LayoutKind::Direct);
    }

    #[test]
    fn test_run_direct() {
        let sh = Shell::new().unwrap();
        let tmp = sh.create_temp_dir().unwrap();
        let job = job(tmp.path());

        let image = job.run().unwrap();
        assert_eq!((image.kernel_offset, image.kernel_size), (1, 3));

        let disk = fs::read(&job.output).unwrap();
        assert_eq!(disk.len(), 2048);
        assert_eq!(&disk[0x180..0x184], &[1, 0, 3, 0]);
    }

    #[test]
    fn test_run_preserves_existing_partition_table() {
        let sh = Shell::new().unwrap();
        let tmp = sh.create_temp_dir().unwrap();
        let mut job = job(tmp.path());

        // A partitioned disk, as parted would leave it
        let mut disk = vec![0u8; 64 * SECTOR_SIZE];
        for (i, byte) in disk[PARTITION_TABLE].iter_mut().enumerate() {
            *byte = 0x10 + i as u8;
        }
        let expected = disk[PARTITION_TABLE].to_vec();
        fs::write(&job.output, &disk).unwrap();
        job.partition_table_from = Some(job.output.clone());

        job.run().unwrap();
        let written = fs::read(&job.output).unwrap();
        assert_eq!(written.len(), 64 * SECTOR_SIZE);
        assert_eq!(&written[PARTITION_TABLE], &expected[..]);
        assert!(written[2048..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_missing_symbol_writes_nothing() {
        let sh = Shell::new().unwrap();
        let tmp = sh.create_temp_dir().unwrap();
        let job = job(tmp.path());
        fs::write(job.symbols.as_ref().unwrap(), "00007d80 d dap.offset\n").unwrap();

        let err = job.run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageError>(),
            Some(ImageError::SymbolMissing { name: "dap.size" })
        ));
        assert!(!job.output.exists());
    }

    #[test]
    fn test_direct_needs_symbols() {
        let sh = Shell::new().unwrap();
        let tmp = sh.create_temp_dir().unwrap();
        let mut job = job(tmp.path());
        job.symbols = None;
        assert!(job.run().is_err());

        job.layout = LayoutKind::Diskmap;
        let image = job.run().unwrap();
        assert_eq!(image.kernel_offset, 2);
    }

    #[test]
    fn test_oversized_kernel_writes_nothing() {
        let sh = Shell::new().unwrap();
        let tmp = sh.create_temp_dir().unwrap();
        let job = job(tmp.path());
        fs::write(&job.kernel[0], vec![0x42u8; BOOT_REGION_LIMIT - SECTOR_SIZE]).unwrap();

        let err = job.run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageError>(),
            Some(ImageError::Capacity { actual, maximum })
                if *actual == BOOT_REGION_LIMIT && *maximum == BOOT_REGION_LIMIT
        ));
        assert!(!job.output.exists());
    }

    #[test]
    fn test_oversized_kernel_leaves_existing_image_alone() {
        let sh = Shell::new().unwrap();
        let tmp = sh.create_temp_dir().unwrap();
        let job = job(tmp.path());
        let before = vec![0x5Au8; 8 * SECTOR_SIZE];
        fs::write(&job.output, &before).unwrap();
        fs::write(&job.kernel[0], vec![0x42u8; BOOT_REGION_LIMIT]).unwrap();

        assert!(job.run().is_err());
        assert_eq!(fs::read(&job.output).unwrap(), before);
    }

    #[test]
    fn test_wrong_boot_size_writes_nothing() {
        let sh = Shell::new().unwrap();
        let tmp = sh.create_temp_dir().unwrap();
        let job = job(tmp.path());
        fs::write(&job.boot, [0u8; 446]).unwrap();

        let err = job.run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageError>(),
            Some(ImageError::BootSectorSize { actual: 446 })
        ));
        assert!(!job.output.exists());
    }
}
