//! Error types for image assembly

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result type for the assembly core
pub type Result<T> = std::result::Result<T, ImageError>;

/// Everything that can stop an image from being assembled
#[derive(Debug)]
pub enum ImageError {
    /// An input or output file could not be read or written
    Io { path: PathBuf, source: io::Error },

    /// The boot sector is not exactly one sector long
    BootSectorSize { actual: usize },

    /// A blob that must be sector aligned is not
    Misaligned { what: &'static str, len: usize },

    /// A required symbol is absent from the symbol table
    SymbolMissing { name: &'static str },

    /// A required symbol appears more than once
    SymbolDuplicate { name: &'static str },

    /// A symbol table line could not be parsed
    SymbolMalformed { line: usize, text: String },

    /// A symbol does not land on a patchable field of the boot sector
    SymbolOutOfRange { name: &'static str, address: u64 },

    /// Boot region does not fit under the real-mode load ceiling
    Capacity { actual: usize, maximum: usize },

    /// A disk address packet value does not fit in 16 bits
    FieldOverflow { field: &'static str, value: usize },

    /// Partition table bytes of the wrong length
    PartitionTableSize { actual: usize },
}

impl ImageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            Self::BootSectorSize { actual } => write!(
                f,
                "boot sector must be exactly {} bytes, got {}",
                crate::sector::SECTOR_SIZE,
                actual
            ),
            Self::Misaligned { what, len } => write!(
                f,
                "{what} is {len} bytes, not a multiple of {}",
                crate::sector::SECTOR_SIZE
            ),
            Self::SymbolMissing { name } => {
                write!(f, "symbol '{name}' not found in the boot loader symbol table")
            }
            Self::SymbolDuplicate { name } => {
                write!(f, "symbol '{name}' is defined more than once")
            }
            Self::SymbolMalformed { line, text } => {
                write!(f, "malformed symbol table line {line}: '{text}'")
            }
            Self::SymbolOutOfRange { name, address } => write!(
                f,
                "symbol '{name}' at {address:#x} is not a 16-bit field inside the boot sector"
            ),
            Self::Capacity { actual, maximum } => write!(
                f,
                "boot sector and kernel take {actual} bytes, must stay below {maximum}"
            ),
            Self::FieldOverflow { field, value } => {
                write!(f, "{field} = {value} does not fit in 16 bits")
            }
            Self::PartitionTableSize { actual } => write!(
                f,
                "partition table must be {} bytes, got {}",
                crate::boot::PARTITION_TABLE.len(),
                actual
            ),
        }
    }
}

impl std::error::Error for ImageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
