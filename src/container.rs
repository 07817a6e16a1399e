//! Persistent index container: partitioned build and memory-mapped load.
//!
//! The container is a record store (see [`crate::store`]) whose key space
//! combines a record kind with a partition index. Per partition it holds
//! the postings block, the per-code entry size table, scalar totals, and
//! the sequence lookup bytes; two global records hold the metadata and the
//! format version string.
//!
//! Loading never re-derives the index from the source sequences: scalar
//! records are read by value and the large blocks are handed to the table
//! as mapped views.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::info;

use crate::constants::{INDEX_FORMAT_VERSION, SOURCE_INDEX_SUFFIX};
use crate::error::{Result, SieveError};
use crate::sequence::{Alphabet, Sequence};
use crate::store::{StoreReader, StoreWriter};
use crate::table::{IndexTable, POSTING_SIZE};

// ============================================================================
// Key space
// ============================================================================

/// Closed set of record kinds stored in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordKind {
    Version = 0,
    Entries = 1,
    EntrySizes = 2,
    EntriesNum = 3,
    SeqCount = 4,
    Meta = 5,
    SeqIndexData = 6,
    SeqIndexDataSize = 7,
    SeqIndexSeqSize = 8,
}

impl RecordKind {
    fn name(self) -> &'static str {
        match self {
            RecordKind::Version => "VERSION",
            RecordKind::Entries => "ENTRIES",
            RecordKind::EntrySizes => "ENTRIESIZES",
            RecordKind::EntriesNum => "ENTRIESNUM",
            RecordKind::SeqCount => "SEQCOUNT",
            RecordKind::Meta => "META",
            RecordKind::SeqIndexData => "SEQINDEXDATA",
            RecordKind::SeqIndexDataSize => "SEQINDEXDATASIZE",
            RecordKind::SeqIndexSeqSize => "SEQINDEXSEQSIZE",
        }
    }
}

/// Composite container key: kind in the high bits, partition index in the
/// low 16. VERSION and META are partition-independent and use the global
/// form.
pub(crate) fn record_key(kind: RecordKind, step: u32) -> u32 {
    debug_assert!(step <= MAX_SPLIT_COUNT as u32);
    ((kind as u32) << 16) | step
}

pub(crate) fn global_key(kind: RecordKind) -> u32 {
    record_key(kind, 0)
}

/// Partition indices must fit the low 16 bits of a key.
pub(crate) const MAX_SPLIT_COUNT: usize = u16::MAX as usize;

// ============================================================================
// Metadata
// ============================================================================

/// Candidate-generation mode. Only local matching exists; the flag is kept
/// in the metadata so foreign containers with other modes are rejected as a
/// configuration error rather than misread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Local,
}

impl MatchMode {
    pub fn flag(self) -> i32 {
        match self {
            MatchMode::Local => 1,
        }
    }

    pub fn from_flag(flag: i32) -> Result<Self> {
        match flag {
            1 => Ok(MatchMode::Local),
            other => Err(SieveError::config(format!(
                "match mode {} is not supported",
                other
            ))),
        }
    }
}

/// Global container metadata, serialized as six little-endian i32s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMeta {
    pub kmer_size: i32,
    pub alphabet_size: i32,
    /// Reserved; always zero.
    pub skip: i32,
    pub split_count: i32,
    pub match_mode: i32,
    pub spaced: i32,
}

impl IndexMeta {
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        for (i, v) in [
            self.kmer_size,
            self.alphabet_size,
            self.skip,
            self.split_count,
            self.match_mode,
            self.spaced,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 24 {
            return Err(SieveError::validation(format!(
                "metadata record is {} bytes, expected 24",
                bytes.len()
            )));
        }
        let mut v = [0i32; 6];
        for (i, slot) in v.iter_mut().enumerate() {
            *slot = i32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Ok(IndexMeta {
            kmer_size: v[0],
            alphabet_size: v[1],
            skip: v[2],
            split_count: v[3],
            match_mode: v[4],
            spaced: v[5],
        })
    }
}

/// Build-time configuration for one container.
#[derive(Debug, Clone)]
pub struct IndexParams {
    pub kmer_size: usize,
    pub alphabet_size: usize,
    pub split_count: usize,
    pub spaced: bool,
    pub match_mode: MatchMode,
}

// ============================================================================
// Partitioning
// ============================================================================

/// Contiguous sequence range of partition `step`, balancing the residue
/// count sum across all `split_count` partitions. Boundaries fall at the
/// first sequence whose cumulative residue count reaches each multiple of
/// the ideal share, so no partition exceeds it by more than one sequence.
pub(crate) fn decompose_by_residue_count(
    lens: &[u64],
    split_count: usize,
    step: usize,
) -> Range<usize> {
    let total: u64 = lens.iter().sum();
    let boundary = |c: usize| -> usize {
        let target = total * c as u64 / split_count as u64;
        let mut cum = 0u64;
        for (i, &l) in lens.iter().enumerate() {
            if cum >= target {
                return i;
            }
            cum += l;
        }
        lens.len()
    };
    boundary(step)..boundary(step + 1)
}

// ============================================================================
// Build
// ============================================================================

/// Two-pass table construction over one contiguous sequence range of the
/// source store. Also used by the calibration loop for whole-database
/// tables.
pub fn build_table_for_range(
    source: &StoreReader,
    alphabet: &Alphabet,
    kmer_size: usize,
    spaced: bool,
    range: Range<usize>,
) -> Result<IndexTable> {
    let mut table = IndexTable::new(alphabet.size(), kmer_size, range.start as u32)?;
    let mut seq = Sequence::new(kmer_size, alphabet.size(), spaced)?;

    for idx in range.clone() {
        let data = source
            .get_by_index(idx)
            .ok_or_else(|| SieveError::validation(format!("missing sequence record {}", idx)))?;
        seq.map_sequence(idx as u32, alphabet, data)?;
        table.count_sequence(&seq)?;
    }
    table.finalize_counts()?;
    for idx in range {
        let data = source
            .get_by_index(idx)
            .ok_or_else(|| SieveError::validation(format!("missing sequence record {}", idx)))?;
        seq.map_sequence(idx as u32, alphabet, data)?;
        table.insert_sequence(&seq)?;
    }
    table.finish()?;
    Ok(table)
}

fn write_partition(writer: &mut StoreWriter, table: &IndexTable, step: u32) -> Result<()> {
    let key = |kind: RecordKind| record_key(kind, step);
    let log_write = |kind: RecordKind| info!("write record {} step {}", kind.name(), step);

    log_write(RecordKind::Entries);
    writer.write(key(RecordKind::Entries), table.entries_bytes())?;

    log_write(RecordKind::EntrySizes);
    let mut sizes = Vec::with_capacity(table.table_size() * 8);
    for w in table.offsets().windows(2) {
        sizes.extend_from_slice(&(w[1] - w[0]).to_le_bytes());
    }
    writer.write(key(RecordKind::EntrySizes), &sizes)?;

    log_write(RecordKind::EntriesNum);
    writer.write(
        key(RecordKind::EntriesNum),
        &(table.entries_num() as i64).to_le_bytes(),
    )?;

    log_write(RecordKind::SeqCount);
    writer.write(
        key(RecordKind::SeqCount),
        &(table.sequence_count() as u64).to_le_bytes(),
    )?;

    let lookup = table.sequence_lookup();
    log_write(RecordKind::SeqIndexData);
    writer.write(key(RecordKind::SeqIndexData), lookup.data())?;

    log_write(RecordKind::SeqIndexDataSize);
    writer.write(
        key(RecordKind::SeqIndexDataSize),
        &(lookup.data_size() as i64).to_le_bytes(),
    )?;

    log_write(RecordKind::SeqIndexSeqSize);
    let mut len_bytes = Vec::with_capacity(lookup.sequence_count() * 4);
    for len in lookup.lengths() {
        len_bytes.extend_from_slice(&len.to_le_bytes());
    }
    writer.write(key(RecordKind::SeqIndexSeqSize), &len_bytes)?;

    Ok(())
}

/// Build a complete index container from a source sequence store.
///
/// Partitions are processed one at a time and released before the next
/// starts, so peak memory is bounded by the largest partition rather than
/// the whole database. A verbatim copy of the source store's index file is
/// placed next to the container for offline pairing diagnostics.
pub fn build_index(
    source: &StoreReader,
    params: &IndexParams,
    out_data: &Path,
    out_index: &Path,
) -> Result<()> {
    if params.split_count == 0 || params.split_count > MAX_SPLIT_COUNT {
        return Err(SieveError::validation(format!(
            "split count must be in 1..={} (got {})",
            MAX_SPLIT_COUNT, params.split_count
        )));
    }
    // The typed mode makes this exhaustive today; foreign flags are caught
    // by MatchMode::from_flag on the load path.
    match params.match_mode {
        MatchMode::Local => {}
    }
    let alphabet = Alphabet::for_size(params.alphabet_size)?;
    let lens: Vec<u64> = source.entries().iter().map(|e| e.len).collect();

    let mut writer = StoreWriter::create(out_data, out_index)?;
    for step in 0..params.split_count {
        let range = decompose_by_residue_count(&lens, params.split_count, step);
        info!(
            "partition {}/{}: sequences {}..{}",
            step + 1,
            params.split_count,
            range.start,
            range.end
        );
        let table = build_table_for_range(
            source,
            &alphabet,
            params.kmer_size,
            params.spaced,
            range,
        )?;
        write_partition(&mut writer, &table, step as u32)?;
    }

    info!("write record {}", RecordKind::Meta.name());
    let meta = IndexMeta {
        kmer_size: params.kmer_size as i32,
        alphabet_size: params.alphabet_size as i32,
        skip: 0,
        split_count: params.split_count as i32,
        match_mode: params.match_mode.flag(),
        spaced: params.spaced as i32,
    };
    writer.write(global_key(RecordKind::Meta), &meta.to_bytes())?;

    info!("write record {}", RecordKind::Version.name());
    writer.write(
        global_key(RecordKind::Version),
        INDEX_FORMAT_VERSION.as_bytes(),
    )?;

    let side_path = source_index_copy_path(out_data);
    info!("copy source index to {}", side_path.display());
    fs::copy(source.index_path(), &side_path)
        .map_err(|e| SieveError::io(&side_path, "copy", e))?;

    writer.finish()?;
    info!("index build complete");
    Ok(())
}

/// Path of the verbatim source-index copy placed next to a container.
pub fn source_index_copy_path(out_data: &Path) -> PathBuf {
    let mut name = out_data.as_os_str().to_os_string();
    name.push(SOURCE_INDEX_SUFFIX);
    PathBuf::from(name)
}

/// Open the source-index copy stored next to a container, index only.
pub fn open_source_index_copy(container_data: &Path) -> Result<StoreReader> {
    StoreReader::open_index_only(&source_index_copy_path(container_data))
}

// ============================================================================
// Load
// ============================================================================

/// True iff the store holds a VERSION record whose content byte-prefix
/// matches the current format version. Anything else, including a missing
/// record or a stale version, means "not a usable index"; callers fall
/// back to rebuilding rather than treating the file as corrupt.
pub fn is_index_container(reader: &StoreReader) -> bool {
    match reader.get(global_key(RecordKind::Version)) {
        Some(bytes) => bytes.starts_with(INDEX_FORMAT_VERSION.as_bytes()),
        None => false,
    }
}

fn record_bytes<'a>(reader: &'a StoreReader, kind: RecordKind, step: u32) -> Result<&'a [u8]> {
    reader.get(record_key(kind, step)).ok_or_else(|| {
        SieveError::format(
            reader.data_path(),
            format!("missing record {} step {}", kind.name(), step),
        )
    })
}

fn read_i64_record(reader: &StoreReader, kind: RecordKind, step: u32) -> Result<i64> {
    let bytes = record_bytes(reader, kind, step)?;
    let arr: [u8; 8] = bytes.try_into().map_err(|_| {
        SieveError::format(
            reader.data_path(),
            format!("record {} has {} bytes, expected 8", kind.name(), bytes.len()),
        )
    })?;
    Ok(i64::from_le_bytes(arr))
}

fn read_u64_record(reader: &StoreReader, kind: RecordKind, step: u32) -> Result<u64> {
    read_i64_record(reader, kind, step).map(|v| v as u64)
}

/// Decode and log the container's global metadata.
pub fn load_metadata(reader: &StoreReader) -> Result<IndexMeta> {
    let version = record_bytes(reader, RecordKind::Version, 0)?;
    info!("index version: {}", String::from_utf8_lossy(version));

    let meta = IndexMeta::from_bytes(record_bytes(reader, RecordKind::Meta, 0)?)?;
    info!("k-mer size:     {}", meta.kmer_size);
    info!("alphabet size:  {}", meta.alphabet_size);
    info!("skip:           {}", meta.skip);
    info!("split:          {}", meta.split_count);
    info!("match mode:     {}", meta.match_mode);
    info!("spaced:         {}", meta.spaced);
    Ok(meta)
}

/// Reconstruct one partition's table from the container without touching
/// the source database. The postings and sequence bytes stay memory-mapped;
/// only the size tables are materialized to rebuild offsets.
pub fn load_partition(reader: &StoreReader, step: u32) -> Result<IndexTable> {
    let meta = load_metadata(reader)?;
    MatchMode::from_flag(meta.match_mode)?;
    if (step as i32) >= meta.split_count {
        return Err(SieveError::validation(format!(
            "partition {} out of range (container has {})",
            step, meta.split_count
        )));
    }

    let entries_num = read_i64_record(reader, RecordKind::EntriesNum, step)?;
    let seq_count = read_u64_record(reader, RecordKind::SeqCount, step)?;
    let data_size = read_i64_record(reader, RecordKind::SeqIndexDataSize, step)?;
    if entries_num < 0 || data_size < 0 {
        return Err(SieveError::format(
            reader.data_path(),
            format!(
                "negative record sizes (entries {}, data {})",
                entries_num, data_size
            ),
        ));
    }

    // Global id of the partition's first sequence is the sum of the
    // preceding partitions' sequence counts.
    let mut seq_id_offset = 0u64;
    for s in 0..step {
        seq_id_offset += read_u64_record(reader, RecordKind::SeqCount, s)?;
    }

    let sizes_bytes = record_bytes(reader, RecordKind::EntrySizes, step)?;
    if sizes_bytes.len() % 8 != 0 {
        return Err(SieveError::format(
            reader.data_path(),
            "entry size table is not a whole number of u64 records",
        ));
    }
    let entry_counts: Vec<u64> = sizes_bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();

    let len_bytes = record_bytes(reader, RecordKind::SeqIndexSeqSize, step)?;
    if len_bytes.len() as u64 != seq_count * 4 {
        return Err(SieveError::format(
            reader.data_path(),
            format!(
                "sequence length table has {} bytes for {} sequences",
                len_bytes.len(),
                seq_count
            ),
        ));
    }
    let seq_lengths: Vec<u32> = len_bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();

    let entries = reader.block(record_key(RecordKind::Entries, step)).ok_or_else(|| {
        SieveError::format(reader.data_path(), format!("missing ENTRIES step {}", step))
    })?;
    if entries.len() as u64 != entries_num as u64 * POSTING_SIZE as u64 {
        return Err(SieveError::format(
            reader.data_path(),
            format!(
                "postings block is {} bytes for {} postings",
                entries.len(),
                entries_num
            ),
        ));
    }
    let seq_data = reader
        .block(record_key(RecordKind::SeqIndexData, step))
        .ok_or_else(|| {
            SieveError::format(
                reader.data_path(),
                format!("missing SEQINDEXDATA step {}", step),
            )
        })?;
    if seq_data.len() as u64 != data_size as u64 {
        return Err(SieveError::format(
            reader.data_path(),
            format!(
                "sequence data block is {} bytes, recorded size {}",
                seq_data.len(),
                data_size
            ),
        ));
    }

    IndexTable::from_external(
        meta.alphabet_size as usize,
        meta.kmer_size as usize,
        seq_id_offset as u32,
        &entry_counts,
        entries,
        &seq_lengths,
        seq_data,
    )
}
