use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{ImageError, Result};
use crate::sector::sector_count;

/// Symbol name used when the caller does not pick one
pub const DEFAULT_SIZE_SYMBOL: &str = "KERNEL_SIZE_SECTORS";

/// Combined size of `paths` in whole sectors.
///
/// Sizes are summed first and rounded once, so several payloads that are
/// concatenated into one image count as a single blob.
pub fn sectors_of_files<P: AsRef<Path>>(paths: &[P]) -> Result<u64> {
    let mut total = 0u64;
    for path in paths {
        let path = path.as_ref();
        let len = File::open(path)
            .and_then(|file| file.metadata())
            .and_then(|metadata| {
                if metadata.is_file() {
                    Ok(metadata.len())
                } else {
                    Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"))
                }
            })
            .map_err(|e| ImageError::io(path, e))?;
        log::trace!("{}: {} bytes", path.display(), len);
        total += len;
    }
    Ok(sector_count(total))
}

/// Assembler constant definition, e.g. `KERNEL_SIZE_SECTORS equ 3`.
pub fn symbol_definition(name: &str, sectors: u64) -> String {
    format!("{name} equ {sectors}\n")
}

/// Writes the sector count of `inputs` as a constant into `output`.
pub fn write_symbol_file<P: AsRef<Path>>(
    inputs: &[P],
    name: &str,
    output: &Path,
) -> Result<u64> {
    let sectors = sectors_of_files(inputs)?;
    fs::write(output, symbol_definition(name, sectors))
        .map_err(|e| ImageError::io(PathBuf::from(output), e))?;
    log::info!("{} = {} sectors -> {}", name, sectors, output.display());
    Ok(sectors)
}
