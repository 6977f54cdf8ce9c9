// Persistent key/value store.
//
// The store survives power cycles. Three backing shapes share one
// operation surface: a byte-addressable medium (EEPROM or emulated
// flash) indexed by an on-medium directory, a filesystem directory
// with one file per key, and whatever a platform plugs in behind
// the KvBackend trait.
//
// Medium layout:
//
//   offset 0 .. DIR_BYTES    directory
//   offset DIR_BYTES .. end  data area (packed allocations)
//
//   directory := { magic u32, version u32, entry_count u32,
//                  entries[MAX_KEYS] of { key [32]u8, offset u32, size u32 } }
//
// A wrong magic at open time means the medium is blank or damaged;
// the directory is zero-initialized and rewritten. Writes find the
// first free gap large enough or append at the tail; deletes leave
// a hole that later writes reuse.
//
// Mutations between begin_transaction and end_transaction update
// the in-memory directory only; the directory reaches the medium at
// commit. Data bytes may land earlier, but without a committed
// directory entry they are unreachable after a restart, which is
// what makes the bracket atomic at the directory's granularity.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use log::{debug, warn};


pub const DIRECTORY_MAGIC: u32 = 0x5073_746F;   // "Psto"
pub const DIRECTORY_VERSION: u32 = 1;
pub const MAX_KEYS: usize = 32;
pub const MAX_KEY_LENGTH: usize = 32;

const ENTRY_BYTES: usize = MAX_KEY_LENGTH + 4 + 4;
const DIR_BYTES: usize = 12 + MAX_KEYS * ENTRY_BYTES;


#[derive(Clone, Debug, PartialEq)]
pub enum StoreError {
    ReadOnly,
    NoSpace,
    DirectoryFull,
    KeyTooLong,
    InvalidKey,
    NotFound,
    TransactionActive,
    NoTransaction,
    Corrupt,
    Io(String),
}

pub type Result<T> = core::result::Result<T, StoreError>;


// ---------------------------------------------------------------------------
// Media

// Byte-addressable backing storage: a RAM chip, a memory-mapped
// flash window, a single file.
pub trait Medium {
    fn size(&self) -> usize;
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}


// Emulated EEPROM. Clones share the same underlying cells, which is
// how tests model a power cycle: drop the store, open a new one
// over a clone of the medium.
#[derive(Clone)]
pub struct MemMedium {
    cells: Rc<RefCell<Vec<u8>>>,
}

impl MemMedium {
    pub fn new(size: usize) -> MemMedium {
        MemMedium {
            cells: Rc::new(RefCell::new(vec![0; size])),
        }
    }
}

impl Medium for MemMedium {
    fn size(&self) -> usize {
        self.cells.borrow().len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let cells = self.cells.borrow();
        let end = offset + buf.len();
        if end > cells.len() {
            return Err(StoreError::Io(format!("read past end: {}", end)));
        }
        buf.copy_from_slice(&cells[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let mut cells = self.cells.borrow_mut();
        let end = offset + data.len();
        if end > cells.len() {
            return Err(StoreError::Io(format!("write past end: {}", end)));
        }
        cells[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}


// A single backing file, cached in RAM, flushed whole. The cache is
// the EEPROM model again; the file is just its persistence.
pub struct FileMedium {
    path: PathBuf,
    cells: Vec<u8>,
}

impl FileMedium {
    pub fn open(path: PathBuf, size: usize) -> Result<FileMedium> {
        let mut cells = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => Vec::new(),
        };
        cells.resize(size, 0);
        Ok(FileMedium { path, cells })
    }
}

impl Medium for FileMedium {
    fn size(&self) -> usize {
        self.cells.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len();
        if end > self.cells.len() {
            return Err(StoreError::Io(format!("read past end: {}", end)));
        }
        buf.copy_from_slice(&self.cells[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset + data.len();
        if end > self.cells.len() {
            return Err(StoreError::Io(format!("write past end: {}", end)));
        }
        self.cells[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        fs::write(&self.path, &self.cells)
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}


// ---------------------------------------------------------------------------
// Backends

pub trait KvBackend {
    fn write(&mut self, key: &str, data: &[u8]) -> Result<()>;
    fn read(&self, key: &str) -> Result<Vec<u8>>;
    fn exists(&self, key: &str) -> bool;
    fn delete(&mut self, key: &str) -> Result<()>;
    fn keys(&self) -> Vec<String>;
    fn size_of(&self, key: &str) -> Result<usize>;
    fn commit(&mut self) -> Result<()>;
    fn clear(&mut self) -> Result<()>;
    fn free_space(&self) -> Option<usize>;
    fn total_space(&self) -> Option<usize>;
}


#[derive(Clone, Debug)]
struct DirEntry {
    key: String,
    offset: u32,
    size: u32,
}


// Directory-indexed store over a byte-addressable medium.
pub struct MediumBackend {
    medium: Box<dyn Medium>,
    entries: Vec<DirEntry>,
}

impl MediumBackend {
    pub fn open(medium: Box<dyn Medium>) -> Result<MediumBackend> {
        if medium.size() < DIR_BYTES + 64 {
            return Err(StoreError::Io(String::from("medium too small")));
        }

        let mut backend = MediumBackend {
            medium,
            entries: Vec::new(),
        };

        if backend.load_directory().is_err() {
            warn!("storage: directory invalid, reinitializing");
            backend.entries.clear();
            backend.save_directory()?;
        }

        Ok(backend)
    }

    fn load_directory(&mut self) -> Result<()> {
        let mut raw = vec![0u8; DIR_BYTES];
        self.medium.read(0, &mut raw)?;

        let magic = u32_at(&raw, 0);
        let version = u32_at(&raw, 4);
        let count = u32_at(&raw, 8) as usize;

        if magic != DIRECTORY_MAGIC || version != DIRECTORY_VERSION
            || count > MAX_KEYS {
            return Err(StoreError::Corrupt);
        }

        self.entries.clear();
        for i in 0..count {
            let base = 12 + i * ENTRY_BYTES;
            let key_bytes = &raw[base..base + MAX_KEY_LENGTH];
            let len = key_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(MAX_KEY_LENGTH);
            let key = String::from_utf8_lossy(&key_bytes[..len]).into_owned();
            let offset = u32_at(&raw, base + MAX_KEY_LENGTH);
            let size = u32_at(&raw, base + MAX_KEY_LENGTH + 4);

            if (offset as usize) < DIR_BYTES
                || offset as usize + size as usize > self.medium.size() {
                return Err(StoreError::Corrupt);
            }

            self.entries.push(DirEntry { key, offset, size });
        }

        Ok(())
    }

    fn save_directory(&mut self) -> Result<()> {
        let mut raw = vec![0u8; DIR_BYTES];
        put_u32(&mut raw, 0, DIRECTORY_MAGIC);
        put_u32(&mut raw, 4, DIRECTORY_VERSION);
        put_u32(&mut raw, 8, self.entries.len() as u32);

        for (i, entry) in self.entries.iter().enumerate() {
            let base = 12 + i * ENTRY_BYTES;
            let key = entry.key.as_bytes();
            raw[base..base + key.len()].copy_from_slice(key);
            put_u32(&mut raw, base + MAX_KEY_LENGTH, entry.offset);
            put_u32(&mut raw, base + MAX_KEY_LENGTH + 4, entry.size);
        }

        self.medium.write(0, &raw)?;
        self.medium.flush()
    }

    fn find(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.key == key)
    }

    // First-fit scan of the gaps between live extents; falls back
    // to the tail.
    fn allocate(&self, size: usize) -> Result<u32> {
        let mut extents: Vec<(usize, usize)> = self.entries
            .iter()
            .map(|e| (e.offset as usize, e.size as usize))
            .collect();
        extents.sort();

        let mut cursor = DIR_BYTES;
        for (offset, extent_size) in extents {
            if offset.saturating_sub(cursor) >= size {
                return Ok(cursor as u32);
            }
            cursor = offset + extent_size;
        }

        if cursor + size <= self.medium.size() {
            Ok(cursor as u32)
        } else {
            Err(StoreError::NoSpace)
        }
    }
}

impl KvBackend for MediumBackend {
    fn write(&mut self, key: &str, data: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::KeyTooLong);
        }

        // Replacing a key frees its old extent before the fit scan.
        if let Some(index) = self.find(key) {
            self.entries.remove(index);
        } else if self.entries.len() >= MAX_KEYS {
            return Err(StoreError::DirectoryFull);
        }

        let offset = self.allocate(data.len())?;
        self.medium.write(offset as usize, data)?;

        self.entries.push(DirEntry {
            key: String::from(key),
            offset,
            size: data.len() as u32,
        });

        Ok(())
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let index = self.find(key).ok_or(StoreError::NotFound)?;
        let entry = &self.entries[index];
        let mut buf = vec![0u8; entry.size as usize];
        self.medium.read(entry.offset as usize, &mut buf)?;
        Ok(buf)
    }

    fn exists(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        if let Some(index) = self.find(key) {
            self.entries.remove(index);
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    fn size_of(&self, key: &str) -> Result<usize> {
        let index = self.find(key).ok_or(StoreError::NotFound)?;
        Ok(self.entries[index].size as usize)
    }

    fn commit(&mut self) -> Result<()> {
        self.save_directory()
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.save_directory()
    }

    fn free_space(&self) -> Option<usize> {
        let used: usize = self.entries.iter().map(|e| e.size as usize).sum();
        Some(self.medium.size().saturating_sub(DIR_BYTES + used))
    }

    fn total_space(&self) -> Option<usize> {
        Some(self.medium.size())
    }
}


// One file per key under a root directory: the SD-card shape.
pub struct DirBackend {
    root: PathBuf,
}

impl DirBackend {
    pub fn open(root: PathBuf) -> Result<DirBackend> {
        fs::create_dir_all(&root)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(DirBackend { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl KvBackend for DirBackend {
    fn write(&mut self, key: &str, data: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::KeyTooLong);
        }
        fs::write(self.path_for(key), data)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        fs::read(self.path_for(key)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound
            } else {
                StoreError::Io(e.to_string())
            }
        })
    }

    fn exists(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Ok(dir) = fs::read_dir(&self.root) {
            for entry in dir.flatten() {
                if let Ok(name) = entry.file_name().into_string() {
                    keys.push(name);
                }
            }
        }
        keys
    }

    fn size_of(&self, key: &str) -> Result<usize> {
        fs::metadata(self.path_for(key))
            .map(|m| m.len() as usize)
            .map_err(|_| StoreError::NotFound)
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        for key in self.keys() {
            self.delete(&key)?;
        }
        Ok(())
    }

    fn free_space(&self) -> Option<usize> {
        None
    }

    fn total_space(&self) -> Option<usize> {
        None
    }
}


// ---------------------------------------------------------------------------
// RLE compression

pub mod rle {
    use super::{Result, StoreError};

    pub const MARKER: [u8; 2] = [0xAB, 0xCD];

    const CONTROL_RUN: u8 = 0;
    const CONTROL_LITERAL: u8 = 1;
    const MIN_RUN: usize = 4;
    const MAX_BLOCK: usize = 255;

    pub fn compress(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() / 2 + 8);
        out.extend_from_slice(&MARKER);

        let mut i = 0;
        let mut literal_start = 0;

        let flush_literal = |out: &mut Vec<u8>, from: usize, to: usize| {
            let mut start = from;
            while start < to {
                let len = (to - start).min(MAX_BLOCK);
                out.push(CONTROL_LITERAL);
                out.push(len as u8);
                out.extend_from_slice(&data[start..start + len]);
                start += len;
            }
        };

        while i < data.len() {
            let byte = data[i];
            let mut run = 1;
            while i + run < data.len()
                && data[i + run] == byte
                && run < MAX_BLOCK {
                run += 1;
            }

            if run >= MIN_RUN {
                flush_literal(&mut out, literal_start, i);
                out.push(CONTROL_RUN);
                out.push(run as u8);
                out.push(byte);
                i += run;
                literal_start = i;
            } else {
                i += run;
            }
        }
        flush_literal(&mut out, literal_start, data.len());

        out
    }

    pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 2 || data[..2] != MARKER {
            return Err(StoreError::Corrupt);
        }

        let mut out = Vec::with_capacity(data.len() * 2);
        let mut i = 2;

        while i < data.len() {
            match data[i] {
                CONTROL_RUN => {
                    if i + 2 >= data.len() {
                        return Err(StoreError::Corrupt);
                    }
                    let len = data[i + 1] as usize;
                    let byte = data[i + 2];
                    out.resize(out.len() + len, byte);
                    i += 3;
                },
                CONTROL_LITERAL => {
                    if i + 1 >= data.len() {
                        return Err(StoreError::Corrupt);
                    }
                    let len = data[i + 1] as usize;
                    if i + 2 + len > data.len() {
                        return Err(StoreError::Corrupt);
                    }
                    out.extend_from_slice(&data[i + 2..i + 2 + len]);
                    i += 2 + len;
                },
                _ => return Err(StoreError::Corrupt),
            }
        }

        Ok(out)
    }
}


// ---------------------------------------------------------------------------
// Store facade

const COMPRESS_THRESHOLD: usize = 16;


pub struct PersistentStore {
    backend: Box<dyn KvBackend>,
    read_only: bool,
    transaction_active: bool,
    compression: bool,
}

impl PersistentStore {
    pub fn new(backend: Box<dyn KvBackend>) -> PersistentStore {
        PersistentStore {
            backend,
            read_only: false,
            transaction_active: false,
            compression: false,
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn set_compression(&mut self, enable: bool) {
        self.compression = enable;
    }

    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey);
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::KeyTooLong);
        }
        for c in key.bytes() {
            // Graphic ASCII only; path separators are rejected so
            // the filesystem backend cannot be steered.
            if c <= 0x20 || c > 0x7E || c == b'/' || c == b'\\' {
                return Err(StoreError::InvalidKey);
            }
        }
        Ok(())
    }

    pub fn write(&mut self, key: &str, data: &[u8]) -> Result<()> {
        Self::validate_key(key)?;
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }

        let stored;
        if self.compression && data.len() > COMPRESS_THRESHOLD {
            let packed = rle::compress(data);
            if packed.len() < data.len() {
                debug!("storage: {} compressed {} -> {}",
                       key, data.len(), packed.len());
                stored = packed;
            } else {
                stored = data.to_vec();
            }
        } else {
            stored = data.to_vec();
        }

        self.backend.write(key, &stored)?;

        if !self.transaction_active {
            self.backend.commit()?;
        }
        Ok(())
    }

    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        Self::validate_key(key)?;
        let raw = self.backend.read(key)?;

        if self.compression && raw.len() >= 2 && raw[..2] == rle::MARKER {
            rle::decompress(&raw)
        } else {
            // Legacy value written before compression was enabled.
            Ok(raw)
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        Self::validate_key(key).is_ok() && self.backend.exists(key)
    }

    // Deleting a missing key is not an error.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        Self::validate_key(key)?;
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.backend.delete(key)?;
        if !self.transaction_active {
            self.backend.commit()?;
        }
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.backend.keys()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.backend
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect()
    }

    pub fn size_of(&self, key: &str) -> Result<usize> {
        Self::validate_key(key)?;
        self.backend.size_of(key)
    }

    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction_active {
            return Err(StoreError::TransactionActive);
        }
        self.transaction_active = true;
        Ok(())
    }

    pub fn end_transaction(&mut self) -> Result<()> {
        if !self.transaction_active {
            return Err(StoreError::NoTransaction);
        }
        self.transaction_active = false;
        self.backend.commit()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_active
    }

    pub fn commit(&mut self) -> Result<()> {
        self.backend.commit()
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.backend.clear()
    }

    pub fn free_space(&self) -> Option<usize> {
        self.backend.free_space()
    }

    pub fn total_space(&self) -> Option<usize> {
        self.backend.total_space()
    }
}


fn u32_at(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        raw[offset],
        raw[offset + 1],
        raw[offset + 2],
        raw[offset + 3],
    ])
}

fn put_u32(raw: &mut [u8], offset: usize, value: u32) {
    raw[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
