//! Directory entries.
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0x00 | `inode` u64 (0 = unused slot) |
//! | 0x08 | `rec_len` u16 |
//! | 0x0A | `name_len` u8 |
//! | 0x0B | `file_type` u8 |
//! | 0x0C | name |
//!
//! `rec_len` is a multiple of 4 and an entry never crosses a block. The
//! last entry of a block absorbs the remaining slack.

use cfs_types::{
    ParseError, ensure_slice, read_le_u16, read_le_u64, read_u8, usize_to_u16, write_fixed,
    write_le_u16, write_le_u64, write_u8,
};
use serde::{Deserialize, Serialize};

pub const DIR_ENTRY_HEADER_SIZE: usize = 12;
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Unknown,
    Regular,
    Directory,
    Other(u8),
}

impl FileType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Unknown,
            1 => Self::Regular,
            2 => Self::Directory,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Regular => 1,
            Self::Directory => 2,
            Self::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub inode: u64,
    pub file_type: FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    #[must_use]
    pub fn new(inode: u64, file_type: FileType, name: &[u8]) -> Self {
        Self {
            inode,
            file_type,
            name: name.to_vec(),
        }
    }

    /// Minimum on-disk size: header plus name, padded to 4 bytes.
    #[must_use]
    pub fn actual_size(&self) -> usize {
        (DIR_ENTRY_HEADER_SIZE + self.name.len() + 3) & !3
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Parse all live entries of one directory block.
pub fn parse_dir_block(block: &[u8]) -> Result<Vec<DirEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut offset = 0_usize;

    while offset + DIR_ENTRY_HEADER_SIZE <= block.len() {
        let inode = read_le_u64(block, offset)?;
        let rec_len = usize::from(read_le_u16(block, offset + 8)?);
        let name_len = usize::from(read_u8(block, offset + 10)?);
        let file_type = read_u8(block, offset + 11)?;

        if rec_len < DIR_ENTRY_HEADER_SIZE || rec_len % 4 != 0 {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "directory entry rec_len too small or unaligned",
            });
        }
        let entry_end = offset + rec_len;
        if entry_end > block.len() {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "directory entry extends past block boundary",
            });
        }
        if offset + DIR_ENTRY_HEADER_SIZE + name_len > entry_end {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "name extends past rec_len",
            });
        }

        if inode != 0 {
            entries.push(DirEntry {
                inode,
                file_type: FileType::from_raw(file_type),
                name: ensure_slice(block, offset + DIR_ENTRY_HEADER_SIZE, name_len)?.to_vec(),
            });
        }
        offset = entry_end;
    }

    Ok(entries)
}

#[must_use]
pub fn lookup_in_dir_block(block: &[u8], target: &[u8]) -> Option<DirEntry> {
    parse_dir_block(block)
        .ok()?
        .into_iter()
        .find(|e| e.name == target)
}

fn write_entry(
    block: &mut [u8],
    offset: usize,
    entry: &DirEntry,
    rec_len: usize,
) -> Result<(), ParseError> {
    if entry.name.len() > MAX_NAME_LEN {
        return Err(ParseError::InvalidField {
            field: "name_len",
            reason: "name longer than 255 bytes",
        });
    }
    write_le_u64(block, offset, entry.inode)?;
    write_le_u16(block, offset + 8, usize_to_u16(rec_len, "rec_len")?)?;
    write_u8(block, offset + 10, u8::try_from(entry.name.len()).unwrap_or(u8::MAX))?;
    write_u8(block, offset + 11, entry.file_type.to_raw())?;
    write_fixed(block, offset + DIR_ENTRY_HEADER_SIZE, &entry.name)
}

/// Pack entries into as many directory blocks as needed, in order.
///
/// Always returns at least one block; an empty directory is one block
/// holding a single unused entry.
pub fn pack_dir_blocks(
    entries: &[DirEntry],
    block_size: usize,
) -> Result<Vec<Vec<u8>>, ParseError> {
    let mut blocks = Vec::new();
    let mut block = vec![0_u8; block_size];
    let mut offset = 0_usize;
    let mut last: Option<(usize, &DirEntry)> = None;

    for entry in entries {
        let size = entry.actual_size();
        if size > block_size {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "entry larger than a directory block",
            });
        }
        if offset + size > block_size {
            if let Some((at, prev)) = last.take() {
                write_entry(&mut block, at, prev, block_size - at)?;
            }
            blocks.push(std::mem::replace(&mut block, vec![0_u8; block_size]));
            offset = 0;
        }
        write_entry(&mut block, offset, entry, size)?;
        last = Some((offset, entry));
        offset += size;
    }

    match last {
        Some((at, prev)) => write_entry(&mut block, at, prev, block_size - at)?,
        None => write_le_u16(&mut block, 8, usize_to_u16(block_size, "rec_len")?)?,
    }
    blocks.push(block);
    Ok(blocks)
}
