//! Key-addressed record store backing both sequence databases and index
//! containers.
//!
//! A store is a pair of files: an append-only data file holding raw record
//! bytes, and a key-index file mapping each u32 key to its (offset, length)
//! in the data file. Writers stream records during build; readers memory-map
//! the data file and resolve keys by binary search, handing out zero-copy
//! slices. Records are aligned so mapped blocks can be reinterpreted as
//! typed slices.
//!
//! # Key-index file format
//! - magic "SSIX", format version u32
//! - record count u64
//! - per record: key u32, offset u64, length u64 (sorted by key)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use crate::constants::{
    MAX_STORE_RECORDS, STORE_INDEX_MAGIC, STORE_INDEX_VERSION, STORE_RECORD_ALIGN,
};
use crate::error::{Result, SieveError};

/// One key-index record: where a record's bytes live in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: u32,
    pub offset: u64,
    pub len: u64,
}

/// A contiguous byte region, either owned or a view into a shared mapping.
///
/// Built tables own their buffers; loaded tables hold views into the
/// container's read-only mapping. Both expose the same slice contract.
#[derive(Debug, Clone)]
pub enum ByteBlock {
    Owned(Vec<u8>),
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
}

impl ByteBlock {
    pub fn empty() -> Self {
        ByteBlock::Owned(Vec::new())
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            ByteBlock::Owned(v) => v.as_slice(),
            ByteBlock::Mapped { map, offset, len } => &map[*offset..*offset + *len],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ByteBlock::Owned(v) => v.len(),
            ByteBlock::Mapped { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutable access to the underlying buffer; None for mapped views.
    pub(crate) fn as_mut_vec(&mut self) -> Option<&mut Vec<u8>> {
        match self {
            ByteBlock::Owned(v) => Some(v),
            ByteBlock::Mapped { .. } => None,
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Streaming store writer. Records are appended to the data file as they
/// arrive; the key index is held in memory and written by `finish`.
pub struct StoreWriter {
    data: BufWriter<File>,
    data_path: PathBuf,
    index_path: PathBuf,
    entries: Vec<IndexEntry>,
    offset: u64,
}

impl StoreWriter {
    pub fn create(data_path: &Path, index_path: &Path) -> Result<Self> {
        let file = File::create(data_path)
            .map_err(|e| SieveError::io(data_path, "create", e))?;
        Ok(StoreWriter {
            data: BufWriter::new(file),
            data_path: data_path.to_path_buf(),
            index_path: index_path.to_path_buf(),
            entries: Vec::new(),
            offset: 0,
        })
    }

    /// Append one record under `key`. Pads to the record alignment first so
    /// readers can cast the mapped block to typed slices.
    pub fn write(&mut self, key: u32, bytes: &[u8]) -> Result<()> {
        if self.entries.len() as u64 >= MAX_STORE_RECORDS {
            return Err(SieveError::overflow(
                "store record count",
                MAX_STORE_RECORDS as usize,
                self.entries.len() + 1,
            ));
        }
        let pad = (STORE_RECORD_ALIGN - self.offset % STORE_RECORD_ALIGN) % STORE_RECORD_ALIGN;
        if pad > 0 {
            let zeros = [0u8; STORE_RECORD_ALIGN as usize];
            self.data
                .write_all(&zeros[..pad as usize])
                .map_err(|e| SieveError::io(&self.data_path, "write", e))?;
            self.offset += pad;
        }
        self.data
            .write_all(bytes)
            .map_err(|e| SieveError::io(&self.data_path, "write", e))?;
        self.entries.push(IndexEntry {
            key,
            offset: self.offset,
            len: bytes.len() as u64,
        });
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Flush the data file and write the key-index file.
    pub fn finish(mut self) -> Result<()> {
        self.data
            .flush()
            .map_err(|e| SieveError::io(&self.data_path, "flush", e))?;

        self.entries.sort_unstable_by_key(|e| e.key);
        if let Some(w) = self.entries.windows(2).find(|w| w[0].key == w[1].key) {
            return Err(SieveError::validation(format!(
                "duplicate store key {}",
                w[0].key
            )));
        }

        let file = File::create(&self.index_path)
            .map_err(|e| SieveError::io(&self.index_path, "create", e))?;
        let mut writer = BufWriter::new(file);
        let io = |e| SieveError::io(&self.index_path, "write", e);
        writer.write_all(STORE_INDEX_MAGIC).map_err(io)?;
        writer
            .write_all(&STORE_INDEX_VERSION.to_le_bytes())
            .map_err(io)?;
        writer
            .write_all(&(self.entries.len() as u64).to_le_bytes())
            .map_err(io)?;
        for e in &self.entries {
            writer.write_all(&e.key.to_le_bytes()).map_err(io)?;
            writer.write_all(&e.offset.to_le_bytes()).map_err(io)?;
            writer.write_all(&e.len.to_le_bytes()).map_err(io)?;
        }
        writer.flush().map_err(io)?;
        Ok(())
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Read-only store handle. The data file is memory-mapped once at open;
/// `get` and `block` return views into that mapping without copying.
pub struct StoreReader {
    entries: Vec<IndexEntry>,
    map: Option<Arc<Mmap>>,
    data_path: PathBuf,
    index_path: PathBuf,
}

impl StoreReader {
    pub fn open(data_path: &Path, index_path: &Path) -> Result<Self> {
        let entries = read_index_file(index_path)?;
        let file = File::open(data_path)
            .map_err(|e| SieveError::io(data_path, "open", e))?;
        let file_len = file
            .metadata()
            .map_err(|e| SieveError::io(data_path, "stat", e))?
            .len();

        // An empty data file cannot be mapped; an empty store is still valid.
        let map = if file_len == 0 {
            None
        } else {
            let m = unsafe { Mmap::map(&file) }
                .map_err(|e| SieveError::io(data_path, "map", e))?;
            Some(Arc::new(m))
        };

        let end = entries.iter().map(|e| e.offset + e.len).max().unwrap_or(0);
        if end > file_len {
            return Err(SieveError::format(
                data_path,
                format!("index addresses {} bytes but data file has {}", end, file_len),
            ));
        }

        Ok(StoreReader {
            entries,
            map,
            data_path: data_path.to_path_buf(),
            index_path: index_path.to_path_buf(),
        })
    }

    /// Open only the key index, without touching the data file. Used for
    /// inspecting side copies of index files.
    pub fn open_index_only(index_path: &Path) -> Result<Self> {
        let entries = read_index_file(index_path)?;
        Ok(StoreReader {
            entries,
            map: None,
            data_path: PathBuf::new(),
            index_path: index_path.to_path_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Sum of record lengths, excluding alignment padding.
    pub fn total_data_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.len).sum()
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    fn find(&self, key: u32) -> Option<&IndexEntry> {
        self.entries
            .binary_search_by_key(&key, |e| e.key)
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Zero-copy record bytes by key.
    pub fn get(&self, key: u32) -> Option<&[u8]> {
        let e = self.find(key)?;
        if e.len == 0 {
            return Some(&[]);
        }
        let map = self.map.as_ref()?;
        Some(&map[e.offset as usize..(e.offset + e.len) as usize])
    }

    /// Record bytes by position in key order.
    pub fn get_by_index(&self, idx: usize) -> Option<&[u8]> {
        let e = self.entries.get(idx)?;
        if e.len == 0 {
            return Some(&[]);
        }
        let map = self.map.as_ref()?;
        Some(&map[e.offset as usize..(e.offset + e.len) as usize])
    }

    /// Byte placement of a record without reading it.
    pub fn offset_of(&self, key: u32) -> Option<(u64, u64)> {
        self.find(key).map(|e| (e.offset, e.len))
    }

    /// A shared view of a record, keeping the mapping alive. The table's
    /// external-data initializer consumes these so postings and sequence
    /// bytes stay mapped rather than eagerly materialized.
    pub fn block(&self, key: u32) -> Option<ByteBlock> {
        let e = self.find(key)?;
        if e.len == 0 {
            return Some(ByteBlock::empty());
        }
        let map = self.map.as_ref()?;
        Some(ByteBlock::Mapped {
            map: Arc::clone(map),
            offset: e.offset as usize,
            len: e.len as usize,
        })
    }
}

fn read_index_file(path: &Path) -> Result<Vec<IndexEntry>> {
    let file = File::open(path).map_err(|e| SieveError::io(path, "open", e))?;
    let mut reader = BufReader::new(file);
    let mut buf4 = [0u8; 4];
    let mut buf8 = [0u8; 8];
    let io = |e| SieveError::io(path, "read", e);

    reader.read_exact(&mut buf4).map_err(io)?;
    if &buf4 != STORE_INDEX_MAGIC {
        return Err(SieveError::format(path, "invalid magic (expected SSIX)"));
    }
    reader.read_exact(&mut buf4).map_err(io)?;
    let version = u32::from_le_bytes(buf4);
    if version != STORE_INDEX_VERSION {
        return Err(SieveError::format(
            path,
            format!(
                "unsupported store index version {} (expected {})",
                version, STORE_INDEX_VERSION
            ),
        ));
    }
    reader.read_exact(&mut buf8).map_err(io)?;
    let count = u64::from_le_bytes(buf8);
    if count > MAX_STORE_RECORDS {
        return Err(SieveError::overflow(
            "store record count",
            MAX_STORE_RECORDS as usize,
            count as usize,
        ));
    }

    let mut entries = Vec::with_capacity(count as usize);
    let mut prev_key: Option<u32> = None;
    for _ in 0..count {
        reader.read_exact(&mut buf4).map_err(io)?;
        let key = u32::from_le_bytes(buf4);
        reader.read_exact(&mut buf8).map_err(io)?;
        let offset = u64::from_le_bytes(buf8);
        reader.read_exact(&mut buf8).map_err(io)?;
        let len = u64::from_le_bytes(buf8);
        if let Some(p) = prev_key {
            if key <= p {
                return Err(SieveError::format(
                    path,
                    format!("keys not strictly increasing ({} after {})", key, p),
                ));
            }
        }
        prev_key = Some(key);
        entries.push(IndexEntry { key, offset, len });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(dir: &TempDir) -> (PathBuf, PathBuf) {
        (dir.path().join("test.dat"), dir.path().join("test.idx"))
    }

    #[test]
    fn test_write_read_roundtrip() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let (data, index) = paths(&dir);

        let mut writer = StoreWriter::create(&data, &index)?;
        writer.write(2, b"second record")?;
        writer.write(0, b"first")?;
        writer.write(1, &[0xAB; 17])?;
        writer.finish()?;

        let reader = StoreReader::open(&data, &index)?;
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.get(0), Some(&b"first"[..]));
        assert_eq!(reader.get(2), Some(&b"second record"[..]));
        assert_eq!(reader.get(1).unwrap().len(), 17);
        assert_eq!(reader.get(99), None);
        assert_eq!(reader.total_data_bytes(), 13 + 5 + 17);
        Ok(())
    }

    #[test]
    fn test_records_are_aligned() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let (data, index) = paths(&dir);

        let mut writer = StoreWriter::create(&data, &index)?;
        writer.write(0, b"abc")?;
        writer.write(1, b"defgh")?;
        writer.finish()?;

        let reader = StoreReader::open(&data, &index)?;
        for e in reader.entries() {
            assert_eq!(e.offset % STORE_RECORD_ALIGN, 0);
        }
        Ok(())
    }

    #[test]
    fn test_duplicate_key_rejected() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let (data, index) = paths(&dir);

        let mut writer = StoreWriter::create(&data, &index)?;
        writer.write(7, b"a")?;
        writer.write(7, b"b")?;
        let err = writer.finish().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        Ok(())
    }

    #[test]
    fn test_empty_store() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let (data, index) = paths(&dir);

        StoreWriter::create(&data, &index)?.finish()?;
        let reader = StoreReader::open(&data, &index)?;
        assert!(reader.is_empty());
        assert_eq!(reader.get(0), None);
        Ok(())
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let (data, index) = paths(&dir);
        std::fs::write(&data, b"").unwrap();
        std::fs::write(&index, b"NOPE\x01\x00\x00\x00").unwrap();

        let err = StoreReader::open(&data, &index).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_block_matches_get() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let (data, index) = paths(&dir);

        let mut writer = StoreWriter::create(&data, &index)?;
        writer.write(3, b"mapped view")?;
        writer.finish()?;

        let reader = StoreReader::open(&data, &index)?;
        let block = reader.block(3).unwrap();
        assert_eq!(block.as_slice(), reader.get(3).unwrap());
        Ok(())
    }

    #[test]
    fn test_index_only_open() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let (data, index) = paths(&dir);

        let mut writer = StoreWriter::create(&data, &index)?;
        writer.write(0, b"xyz")?;
        writer.finish()?;

        let reader = StoreReader::open_index_only(&index)?;
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.offset_of(0), Some((0, 3)));
        assert_eq!(reader.get(0), None);
        Ok(())
    }
}
