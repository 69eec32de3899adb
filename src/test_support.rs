//! Builds small but structurally valid regf hives for tests.

use std::path::{Path, PathBuf};

const NO_CELL: u32 = 0xFFFF_FFFF;
const SEGMENT: usize = 16344;

pub struct FixtureValue {
    name: String,
    data_type: u32,
    data: Vec<u8>,
}

impl FixtureValue {
    pub fn string(name: &str, value: &str) -> Self {
        let mut data = Vec::new();
        for unit in value.encode_utf16().chain(std::iter::once(0)) {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        Self::raw(name, 1, data)
    }

    pub fn dword(name: &str, value: u32) -> Self {
        Self::raw(name, 4, value.to_le_bytes().to_vec())
    }

    pub fn raw(name: &str, data_type: u32, data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            data,
        }
    }
}

pub struct FixtureKey {
    name: String,
    last_written: u64,
    values: Vec<FixtureValue>,
    children: Vec<FixtureKey>,
}

impl FixtureKey {
    pub fn new(name: &str, last_written: u64) -> Self {
        Self {
            name: name.to_string(),
            last_written,
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn child(mut self, key: FixtureKey) -> Self {
        self.children.push(key);
        self
    }

    pub fn value(mut self, value: FixtureValue) -> Self {
        self.values.push(value);
        self
    }
}

/// Lays out cells in a single hive bin, children before parents
pub struct HiveBuilder {
    bins: Vec<u8>,
}

impl HiveBuilder {
    pub fn new() -> Self {
        // Room for the 32 byte hbin header
        Self { bins: vec![0u8; 32] }
    }

    pub fn build(mut self, root: &FixtureKey) -> Vec<u8> {
        let root_offset = self.add_key(root, true);

        let bin_size = self.bins.len().div_ceil(4096) * 4096;
        self.bins.resize(bin_size, 0);
        self.bins[0..4].copy_from_slice(b"hbin");
        self.bins[8..12].copy_from_slice(&(bin_size as u32).to_le_bytes());

        let mut base = vec![0u8; 4096];
        base[0..4].copy_from_slice(b"regf");
        base[4..8].copy_from_slice(&1u32.to_le_bytes());
        base[8..12].copy_from_slice(&1u32.to_le_bytes());
        base[20..24].copy_from_slice(&1u32.to_le_bytes());
        base[24..28].copy_from_slice(&5u32.to_le_bytes());
        base[32..36].copy_from_slice(&1u32.to_le_bytes());
        base[36..40].copy_from_slice(&root_offset.to_le_bytes());
        base[40..44].copy_from_slice(&(bin_size as u32).to_le_bytes());
        base[44..48].copy_from_slice(&1u32.to_le_bytes());

        base.extend_from_slice(&self.bins);
        base
    }

    fn alloc(&mut self, payload: &[u8]) -> u32 {
        let offset = self.bins.len();
        let size = (payload.len() + 4 + 7) & !7;
        self.bins.extend_from_slice(&(-(size as i32)).to_le_bytes());
        self.bins.extend_from_slice(payload);
        self.bins.resize(offset + size, 0);
        offset as u32
    }

    fn add_key(&mut self, key: &FixtureKey, is_root: bool) -> u32 {
        let children: Vec<u32> = key.children.iter().map(|c| self.add_key(c, false)).collect();
        let subkeys_offset = if children.is_empty() {
            NO_CELL
        } else {
            let mut list = b"lf".to_vec();
            list.extend_from_slice(&(children.len() as u16).to_le_bytes());
            for offset in &children {
                list.extend_from_slice(&offset.to_le_bytes());
                list.extend_from_slice(&0u32.to_le_bytes());
            }
            self.alloc(&list)
        };

        let values: Vec<u32> = key.values.iter().map(|v| self.add_value(v)).collect();
        let values_offset = if values.is_empty() {
            NO_CELL
        } else {
            let list: Vec<u8> = values.iter().flat_map(|o| o.to_le_bytes()).collect();
            self.alloc(&list)
        };

        let flags: u16 = if is_root { 0x002C } else { 0x0020 };
        let mut nk = Vec::with_capacity(76 + key.name.len());
        nk.extend_from_slice(b"nk");
        nk.extend_from_slice(&flags.to_le_bytes());
        nk.extend_from_slice(&key.last_written.to_le_bytes());
        nk.extend_from_slice(&0u32.to_le_bytes()); // access bits
        nk.extend_from_slice(&0u32.to_le_bytes()); // parent
        nk.extend_from_slice(&(children.len() as u32).to_le_bytes());
        nk.extend_from_slice(&0u32.to_le_bytes()); // volatile subkeys
        nk.extend_from_slice(&subkeys_offset.to_le_bytes());
        nk.extend_from_slice(&NO_CELL.to_le_bytes());
        nk.extend_from_slice(&(values.len() as u32).to_le_bytes());
        nk.extend_from_slice(&values_offset.to_le_bytes());
        nk.extend_from_slice(&NO_CELL.to_le_bytes()); // security
        nk.extend_from_slice(&NO_CELL.to_le_bytes()); // class name
        nk.extend_from_slice(&[0u8; 20]); // size hints and work var
        nk.extend_from_slice(&(key.name.len() as u16).to_le_bytes());
        nk.extend_from_slice(&0u16.to_le_bytes());
        nk.extend_from_slice(key.name.as_bytes());
        self.alloc(&nk)
    }

    fn add_value(&mut self, value: &FixtureValue) -> u32 {
        let length = value.data.len();
        let (size_field, data_offset) = if length <= 4 {
            let mut inline = [0u8; 4];
            inline[..length].copy_from_slice(&value.data);
            (length as u32 | 0x8000_0000, u32::from_le_bytes(inline))
        } else if length > SEGMENT {
            let segments: Vec<u32> = value.data.chunks(SEGMENT).map(|chunk| self.alloc(chunk)).collect();
            let list: Vec<u8> = segments.iter().flat_map(|o| o.to_le_bytes()).collect();
            let list_offset = self.alloc(&list);
            let mut db = b"db".to_vec();
            db.extend_from_slice(&(segments.len() as u16).to_le_bytes());
            db.extend_from_slice(&list_offset.to_le_bytes());
            (length as u32, self.alloc(&db))
        } else {
            (length as u32, self.alloc(&value.data))
        };

        let (name, flags): (Vec<u8>, u16) = if value.name.is_ascii() {
            (value.name.as_bytes().to_vec(), 0x0001)
        } else {
            (value.name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect(), 0)
        };

        let mut vk = Vec::with_capacity(20 + name.len());
        vk.extend_from_slice(b"vk");
        vk.extend_from_slice(&(name.len() as u16).to_le_bytes());
        vk.extend_from_slice(&size_field.to_le_bytes());
        vk.extend_from_slice(&data_offset.to_le_bytes());
        vk.extend_from_slice(&value.data_type.to_le_bytes());
        vk.extend_from_slice(&flags.to_le_bytes());
        vk.extend_from_slice(&0u16.to_le_bytes());
        vk.extend_from_slice(&name);
        self.alloc(&vk)
    }
}

/// A small hive whose values are tagged with `label`
pub fn sample_hive(label: &str) -> Vec<u8> {
    let root = FixtureKey::new("ROOT", 133_000_000_000_000_000)
        .child(
            FixtureKey::new("Software", 133_100_000_000_000_000)
                .child(FixtureKey::new("Test", 133_400_000_000_000_000))
                .child(
                    FixtureKey::new("Vendor", 133_200_000_000_000_000)
                        .value(FixtureValue::string("Owner", label))
                        .value(FixtureValue::dword("Build", 19045)),
                ),
        )
        .child(
            FixtureKey::new("Select", 133_300_000_000_000_000)
                .value(FixtureValue::dword("Current", 1))
                .value(FixtureValue::string("Note", &format!("{}, \"quoted\"", label))),
        );
    HiveBuilder::new().build(&root)
}

pub fn write_sample_hive(dir: &Path, file_name: &str, label: &str) -> PathBuf {
    let path = dir.join(file_name);
    std::fs::write(&path, sample_hive(label)).expect("write fixture hive");
    path
}
