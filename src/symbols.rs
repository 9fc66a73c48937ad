//! Boot loader symbol table lookup
//!
//! The boot loader is linked at the real-mode load address, so every
//! symbol address it exports is `BOOT_LOAD_ADDRESS + file offset`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use xshell::{cmd, Shell};

use crate::error::{ImageError, Result};
use crate::sector::SECTOR_SIZE;

/// Where legacy PC firmware loads and runs the boot sector
pub const BOOT_LOAD_ADDRESS: u64 = 0x7C00;

/// Symbol of the disk address packet's starting-sector field
pub const DAP_OFFSET_SYMBOL: &str = "dap.offset";

/// Symbol of the disk address packet's sector-count field
pub const DAP_SIZE_SYMBOL: &str = "dap.size";

const ELF_MAGIC: &[u8; 4] = b"\x7FELF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    address: u64,
    occurrences: usize,
}

/// Parsed `nm`-style listing: symbol name -> linked address.
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: HashMap<String, Entry>,
}

impl SymbolTable {
    /// Parses lines of `<hex-address> <kind> <name>`.
    ///
    /// Lines with fewer than three fields carry no address (undefined
    /// symbols) and are skipped.
    pub fn parse(listing: &str) -> Result<Self> {
        let mut entries: HashMap<String, Entry> = HashMap::new();

        for (index, line) in listing.lines().enumerate() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let &[address, _kind, name] = fields.as_slice() else {
                if !fields.is_empty() {
                    log::trace!("skipping symbol line {}: '{}'", index + 1, line);
                }
                continue;
            };

            let address =
                u64::from_str_radix(address, 16).map_err(|_| ImageError::SymbolMalformed {
                    line: index + 1,
                    text: line.to_string(),
                })?;

            entries
                .entry(name.to_string())
                .and_modify(|entry| {
                    entry.address = address;
                    entry.occurrences += 1;
                })
                .or_insert(Entry {
                    address,
                    occurrences: 1,
                });
        }

        Ok(Self { entries })
    }

    /// Reads a symbol table from `path`.
    ///
    /// A linked ELF is dumped through `nm`; anything else is taken to be
    /// an already generated listing.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path).map_err(|e| ImageError::io(path, e))?;
        let listing = if bytes.starts_with(ELF_MAGIC) {
            let sh = Shell::new()?;
            log::debug!("running nm on {}", path.display());
            cmd!(sh, "nm {path}").read()?
        } else {
            String::from_utf8_lossy(&bytes).into_owned()
        };
        let table = Self::parse(&listing)?;
        log::debug!("{} symbols in {}", table.len(), path.display());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Linked address of `name`, last definition wins.
    #[cfg(test)]
    pub fn address(&self, name: &str) -> Option<u64> {
        self.entries.get(name).map(|entry| entry.address)
    }

    /// Address of a symbol that must be defined exactly once.
    fn unique_address(&self, name: &'static str) -> Result<u64> {
        match self.entries.get(name) {
            None => Err(ImageError::SymbolMissing { name }),
            Some(entry) if entry.occurrences > 1 => Err(ImageError::SymbolDuplicate { name }),
            Some(entry) => Ok(entry.address),
        }
    }
}

/// File-relative offsets of the two 16-bit DAP fields in the boot sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DapOffsets {
    pub offset: usize,
    pub size: usize,
}

impl DapOffsets {
    /// Locates both fields; fails if either symbol is missing, defined
    /// twice, or does not address two bytes inside the boot sector.
    pub fn resolve(table: &SymbolTable) -> Result<Self> {
        let offset = field_offset(table, DAP_OFFSET_SYMBOL)?;
        let size = field_offset(table, DAP_SIZE_SYMBOL)?;
        log::debug!(
            "{} at byte {:#x}, {} at byte {:#x}",
            DAP_OFFSET_SYMBOL,
            offset,
            DAP_SIZE_SYMBOL,
            size
        );
        Ok(Self { offset, size })
    }
}

fn field_offset(table: &SymbolTable, name: &'static str) -> Result<usize> {
    let address = table.unique_address(name)?;
    match address.checked_sub(BOOT_LOAD_ADDRESS) {
        Some(offset) if offset + 2 <= SECTOR_SIZE as u64 => Ok(offset as usize),
        _ => Err(ImageError::SymbolOutOfRange { name, address }),
    }
}
