//! Offline registry hive (regf) decoder.
//!
//! Walks the key tree of a hive file and yields one [`KeyRecord`] per key node.
//! The pipeline only sees the [`HiveDecoder`] trait, so other decoders can be
//! plugged in.
//!
//! Layout notes:
//! - a 4096 byte base block (`regf`) holds the root cell offset
//! - hive bins start right after it; cell offsets are relative to that start
//! - every cell begins with a signed size, negative when allocated

use crate::datetime::format_key_timestamp;
use crate::error::{Error, Result};
use crate::types::KeyRecord;
use byteorder::{LittleEndian, ReadBytesExt};
use encoding::all::ISO_8859_1;
use encoding::{DecoderTrap, Encoding};
use log::debug;
use memmap2::Mmap;
use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

pub const BASE_BLOCK_SIZE: usize = 4096;
const NO_CELL: u32 = 0xFFFF_FFFF;
const KEY_COMP_NAME: u16 = 0x0020;
const VALUE_COMP_NAME: u16 = 0x0001;
const DATA_INLINE: u32 = 0x8000_0000;
/// Largest payload of a single big-data segment
const BIG_DATA_SEGMENT: usize = 16344;

/// Lazy sequence of decoded keys; yields at most one error, then ends
pub type KeyRecords = Box<dyn Iterator<Item = Result<KeyRecord>> + Send>;

/// Turns a hive file into a sequence of key records
pub trait HiveDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<KeyRecords>;
}

/// Decoder for the native regf format
#[derive(Debug, Default, Clone, Copy)]
pub struct RegfDecoder;

impl HiveDecoder for RegfDecoder {
    fn decode(&self, path: &Path) -> Result<KeyRecords> {
        let hive = HiveFile::open(path)?;
        Ok(Box::new(KeyWalker::new(hive)))
    }
}

/// Registry hive header
#[derive(Debug, Clone)]
pub struct HiveHeader {
    pub primary_sequence: u32,
    pub secondary_sequence: u32,
    /// Last written FILETIME
    pub last_written: u64,
    pub major_version: u32,
    pub minor_version: u32,
    /// 0 = primary file, 1 = transaction log
    pub file_type: u32,
    pub root_cell_offset: u32,
    pub hive_bins_size: u32,
}

impl HiveHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let mut signature = [0u8; 4];
        cursor.read_exact(&mut signature)?;
        if &signature != b"regf" {
            return Err(Error::HiveFormat("invalid registry signature".to_string()));
        }

        let primary_sequence = cursor.read_u32::<LittleEndian>()?;
        let secondary_sequence = cursor.read_u32::<LittleEndian>()?;
        let last_written = cursor.read_u64::<LittleEndian>()?;
        let major_version = cursor.read_u32::<LittleEndian>()?;
        let minor_version = cursor.read_u32::<LittleEndian>()?;
        let file_type = cursor.read_u32::<LittleEndian>()?;
        let _file_format = cursor.read_u32::<LittleEndian>()?;
        let root_cell_offset = cursor.read_u32::<LittleEndian>()?;
        let hive_bins_size = cursor.read_u32::<LittleEndian>()?;

        Ok(HiveHeader {
            primary_sequence,
            secondary_sequence,
            last_written,
            major_version,
            minor_version,
            file_type,
            root_cell_offset,
            hive_bins_size,
        })
    }
}

/// A memory mapped hive file
pub struct HiveFile {
    data: Mmap,
    header: HiveHeader,
}

impl HiveFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len() as usize;
        if size < BASE_BLOCK_SIZE {
            return Err(Error::HiveFormat(format!(
                "file is {} bytes, smaller than the {} byte base block",
                size, BASE_BLOCK_SIZE
            )));
        }

        // Read-only mapping; every access below is bounds-checked
        let data = unsafe { Mmap::map(&file)? };
        let header = HiveHeader::parse(&data[..BASE_BLOCK_SIZE])?;
        if header.file_type != 0 {
            return Err(Error::HiveFormat(format!(
                "file type {} is a transaction log, not a primary hive",
                header.file_type
            )));
        }
        if header.primary_sequence != header.secondary_sequence {
            debug!(
                "hive {} is dirty (sequence {} != {}), decoding primary file as is",
                path.display(),
                header.primary_sequence,
                header.secondary_sequence
            );
        }

        Ok(Self { data, header })
    }

    pub fn header(&self) -> &HiveHeader {
        &self.header
    }

    /// Cell payload (without the size field) at a hive bins relative offset
    fn cell(&self, offset: u32) -> Result<&[u8]> {
        let start = BASE_BLOCK_SIZE + offset as usize;
        let size_bytes = self
            .data
            .get(start..start + 4)
            .ok_or_else(|| Error::HiveFormat(format!("cell offset {:#x} is past end of file", offset)))?;
        let size = i32::from_le_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]]);
        let length = size.unsigned_abs() as usize;
        if length < 4 {
            return Err(Error::HiveFormat(format!("cell at {:#x} has size {}", offset, size)));
        }
        self.data
            .get(start + 4..start + length)
            .ok_or_else(|| Error::HiveFormat(format!("cell at {:#x} runs past end of file", offset)))
    }

    fn key_node(&self, offset: u32) -> Result<KeyNode> {
        KeyNode::parse(self.cell(offset)?, offset)
    }

    /// Key node offsets referenced by a subkey list (lf, lh, li, ri)
    ///
    /// Fails once the lists hold more entries than the key declares.
    fn subkey_offsets(&self, list_offset: u32, declared: usize, out: &mut Vec<u32>) -> Result<()> {
        self.collect_subkeys(list_offset, declared, true, out)
    }

    fn collect_subkeys(
        &self,
        list_offset: u32,
        declared: usize,
        allow_index_root: bool,
        out: &mut Vec<u32>,
    ) -> Result<()> {
        let cell = self.cell(list_offset)?;
        if cell.len() < 4 {
            return Err(truncated("subkey list", list_offset));
        }
        let count = u16::from_le_bytes([cell[2], cell[3]]) as usize;
        let signature = &cell[0..2];
        if signature != b"ri" && out.len() + count > declared {
            return Err(Error::HiveFormat(format!(
                "subkey list at {:#x} holds more than the {} subkey(s) its key declares",
                list_offset, declared
            )));
        }

        match signature {
            b"lf" | b"lh" => {
                for i in 0..count {
                    out.push(read_u32(cell, 4 + i * 8).ok_or_else(|| truncated("subkey list", list_offset))?);
                }
            }
            b"li" => {
                for i in 0..count {
                    out.push(read_u32(cell, 4 + i * 4).ok_or_else(|| truncated("subkey list", list_offset))?);
                }
            }
            b"ri" if allow_index_root => {
                for i in 0..count {
                    let nested = read_u32(cell, 4 + i * 4).ok_or_else(|| truncated("index root", list_offset))?;
                    self.collect_subkeys(nested, declared, false, out)?;
                }
            }
            b"ri" => {
                return Err(Error::HiveFormat(format!(
                    "index root at {:#x} is nested inside another index root",
                    list_offset
                )))
            }
            other => {
                return Err(Error::HiveFormat(format!(
                    "unknown subkey list signature {:?} at {:#x}",
                    String::from_utf8_lossy(other),
                    list_offset
                )))
            }
        }
        Ok(())
    }

    /// Decoded (name, rendered data) pairs of a key node
    fn values(&self, key: &KeyNode) -> Result<Vec<(String, String)>> {
        if key.value_count == 0 || key.values_offset == NO_CELL {
            return Ok(Vec::new());
        }
        let list = self.cell(key.values_offset)?;
        // The count is untrusted; the list cell bounds the real number
        let mut values = Vec::with_capacity((key.value_count as usize).min(list.len() / 4));
        for i in 0..key.value_count as usize {
            let offset = read_u32(list, i * 4).ok_or_else(|| truncated("value list", key.values_offset))?;
            let value = ValueKey::parse(self.cell(offset)?, offset)?;
            let data = self.value_data(&value)?;
            values.push((value.name, render_value(value.data_type, &data)));
        }
        Ok(values)
    }

    fn value_data(&self, value: &ValueKey) -> Result<Vec<u8>> {
        if value.data_size & DATA_INLINE != 0 {
            let length = ((value.data_size & !DATA_INLINE) as usize).min(4);
            return Ok(value.data_offset.to_le_bytes()[..length].to_vec());
        }

        let length = value.data_size as usize;
        if length == 0 || value.data_offset == NO_CELL {
            return Ok(Vec::new());
        }

        let cell = self.cell(value.data_offset)?;
        if length > BIG_DATA_SEGMENT && self.header.minor_version >= 4 && cell.starts_with(b"db") {
            return self.big_data(cell, value.data_offset, length);
        }

        cell.get(..length)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| truncated("value data", value.data_offset))
    }

    /// Reassemble a `db` big data block
    fn big_data(&self, block: &[u8], offset: u32, length: usize) -> Result<Vec<u8>> {
        if block.len() < 8 {
            return Err(truncated("big data block", offset));
        }
        let segments = u16::from_le_bytes([block[2], block[3]]) as usize;
        let list_offset = read_u32(block, 4).ok_or_else(|| truncated("big data block", offset))?;
        let list = self.cell(list_offset)?;

        let mut data = Vec::with_capacity(length);
        for i in 0..segments {
            let segment_offset = read_u32(list, i * 4).ok_or_else(|| truncated("big data list", list_offset))?;
            let segment = self.cell(segment_offset)?;
            let take = (length - data.len()).min(BIG_DATA_SEGMENT).min(segment.len());
            data.extend_from_slice(&segment[..take]);
            if data.len() == length {
                break;
            }
        }
        if data.len() < length {
            return Err(truncated("big data", offset));
        }
        Ok(data)
    }
}

/// Key node (nk) fields the walker needs
#[derive(Debug, Clone)]
struct KeyNode {
    name: String,
    last_written: u64,
    subkey_count: u32,
    subkeys_offset: u32,
    value_count: u32,
    values_offset: u32,
}

impl KeyNode {
    fn parse(cell: &[u8], offset: u32) -> Result<Self> {
        if cell.len() < 76 {
            return Err(truncated("key node", offset));
        }
        if &cell[0..2] != b"nk" {
            return Err(Error::HiveFormat(format!("expected 'nk' signature at {:#x}", offset)));
        }

        let mut cursor = Cursor::new(&cell[2..]);
        let flags = cursor.read_u16::<LittleEndian>()?;
        let last_written = cursor.read_u64::<LittleEndian>()?;

        let subkey_count = read_u32(cell, 0x14).unwrap_or(0);
        let subkeys_offset = read_u32(cell, 0x1C).unwrap_or(NO_CELL);
        let value_count = read_u32(cell, 0x24).unwrap_or(0);
        let values_offset = read_u32(cell, 0x28).unwrap_or(NO_CELL);
        let name_length = u16::from_le_bytes([cell[0x48], cell[0x49]]) as usize;

        let raw_name = cell
            .get(0x4C..0x4C + name_length)
            .ok_or_else(|| truncated("key name", offset))?;
        let name = decode_name(raw_name, flags & KEY_COMP_NAME != 0);

        Ok(KeyNode {
            name,
            last_written,
            subkey_count,
            subkeys_offset,
            value_count,
            values_offset,
        })
    }
}

/// Value key (vk)
#[derive(Debug, Clone)]
struct ValueKey {
    name: String,
    data_size: u32,
    data_offset: u32,
    data_type: u32,
}

impl ValueKey {
    fn parse(cell: &[u8], offset: u32) -> Result<Self> {
        if cell.len() < 20 {
            return Err(truncated("value key", offset));
        }
        if &cell[0..2] != b"vk" {
            return Err(Error::HiveFormat(format!("expected 'vk' signature at {:#x}", offset)));
        }

        let mut cursor = Cursor::new(&cell[2..]);
        let name_length = cursor.read_u16::<LittleEndian>()? as usize;
        let data_size = cursor.read_u32::<LittleEndian>()?;
        let data_offset = cursor.read_u32::<LittleEndian>()?;
        let data_type = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        let name = if name_length == 0 {
            "(default)".to_string()
        } else {
            let raw = cell
                .get(0x14..0x14 + name_length)
                .ok_or_else(|| truncated("value name", offset))?;
            decode_name(raw, flags & VALUE_COMP_NAME != 0)
        };

        Ok(ValueKey {
            name,
            data_size,
            data_offset,
            data_type,
        })
    }
}

struct PendingKey {
    offset: u32,
    parent: Option<String>,
}

/// Depth-first, preorder walk over every key of a hive
pub struct KeyWalker {
    hive: HiveFile,
    pending: Vec<PendingKey>,
    visited: HashSet<u32>,
    failed: bool,
}

impl KeyWalker {
    pub fn new(hive: HiveFile) -> Self {
        let root = hive.header().root_cell_offset;
        Self {
            hive,
            pending: vec![PendingKey { offset: root, parent: None }],
            visited: HashSet::new(),
            failed: false,
        }
    }

    fn visit(&mut self, pending: PendingKey) -> Result<KeyRecord> {
        if !self.visited.insert(pending.offset) {
            return Err(Error::HiveFormat(format!(
                "key node at {:#x} is referenced twice",
                pending.offset
            )));
        }

        let key = self.hive.key_node(pending.offset)?;
        let path = match pending.parent {
            Some(parent) => format!("{}\\{}", parent, key.name),
            None => key.name.clone(),
        };

        if key.subkey_count > 0 && key.subkeys_offset != NO_CELL {
            let mut children = Vec::new();
            self.hive
                .subkey_offsets(key.subkeys_offset, key.subkey_count as usize, &mut children)?;
            // Reversed so the first child is popped first
            for offset in children.into_iter().rev() {
                self.pending.push(PendingKey {
                    offset,
                    parent: Some(path.clone()),
                });
            }
        }

        let values = self.hive.values(&key)?;
        Ok(KeyRecord {
            path,
            timestamp: format_key_timestamp(key.last_written),
            values,
        })
    }
}

impl Iterator for KeyWalker {
    type Item = Result<KeyRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let pending = self.pending.pop()?;
        let result = self.visit(pending);
        if result.is_err() {
            self.failed = true;
            self.pending.clear();
        }
        Some(result)
    }
}

fn truncated(what: &str, offset: u32) -> Error {
    Error::HiveFormat(format!("truncated {} at {:#x}", what, offset))
}

fn read_u32(data: &[u8], pos: usize) -> Option<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Key and value names are Latin-1 when compressed, UTF-16LE otherwise
fn decode_name(raw: &[u8], compressed: bool) -> String {
    if compressed {
        ISO_8859_1
            .decode(raw, DecoderTrap::Replace)
            .unwrap_or_else(|_| String::from_utf8_lossy(raw).into_owned())
    } else {
        utf16_string(raw)
    }
}

fn utf16_string(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

const REG_SZ: u32 = 1;
const REG_EXPAND_SZ: u32 = 2;
const REG_DWORD: u32 = 4;
const REG_DWORD_BIG_ENDIAN: u32 = 5;
const REG_LINK: u32 = 6;
const REG_MULTI_SZ: u32 = 7;
const REG_QWORD: u32 = 11;

/// Render value data as the string stored in the table
pub fn render_value(data_type: u32, data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    match data_type {
        REG_SZ | REG_EXPAND_SZ | REG_LINK => utf16_string(data).trim_end_matches('\0').to_string(),
        REG_MULTI_SZ => utf16_string(data)
            .split('\0')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; "),
        REG_DWORD if data.len() >= 4 => {
            u32::from_le_bytes([data[0], data[1], data[2], data[3]]).to_string()
        }
        REG_DWORD_BIG_ENDIAN if data.len() >= 4 => {
            u32::from_be_bytes([data[0], data[1], data[2], data[3]]).to_string()
        }
        REG_QWORD if data.len() >= 8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[..8]);
            u64::from_le_bytes(bytes).to_string()
        }
        _ => data.iter().map(|b| format!("{:02x}", b)).collect(),
    }
}
