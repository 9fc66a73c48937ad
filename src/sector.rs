//! Sector arithmetic and zero padding

use std::borrow::Cow;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{ImageError, Result};

/// Unit of disk addressing
pub const SECTOR_SIZE: usize = 512;

/// Number of whole sectors needed to hold `bytes`, rounding up.
pub fn sector_count(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE as u64)
}

/// Number of zero bytes that brings `len` up to the next sector boundary.
pub fn padding_for(len: usize) -> usize {
    match len % SECTOR_SIZE {
        0 => 0,
        rest => SECTOR_SIZE - rest,
    }
}

/// Pads `data` with zeros up to the next sector boundary.
///
/// Already aligned input is borrowed back untouched.
pub fn pad_to_sector(data: &[u8]) -> Cow<'_, [u8]> {
    let padding = padding_for(data.len());
    if padding == 0 {
        return Cow::Borrowed(data);
    }
    let mut padded = Vec::with_capacity(data.len() + padding);
    padded.extend_from_slice(data);
    padded.resize(data.len() + padding, 0);
    Cow::Owned(padded)
}

/// Fails unless `data` is a whole number of sectors.
pub fn ensure_aligned(what: &'static str, data: &[u8]) -> Result<()> {
    if data.len() % SECTOR_SIZE != 0 {
        return Err(ImageError::Misaligned {
            what,
            len: data.len(),
        });
    }
    Ok(())
}

/// Grows the file at `path` to a sector boundary by appending zeros.
///
/// Never truncates. Returns the number of bytes appended.
pub fn pad_file(path: &Path) -> Result<usize> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| ImageError::io(path, e))?;
    let len = file
        .metadata()
        .map_err(|e| ImageError::io(path, e))?
        .len();

    let padding = padding_for((len % SECTOR_SIZE as u64) as usize);
    if padding > 0 {
        file.write_all(&vec![0u8; padding])
            .map_err(|e| ImageError::io(path, e))?;
    }
    log::debug!("{}: {} -> {} bytes", path.display(), len, len + padding as u64);
    Ok(padding)
}
