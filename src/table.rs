//! The inverted k-mer index table.
//!
//! Maps every possible k-mer code to the postings (sequence id, position)
//! recording its occurrences in one database partition. The offset table
//! has exactly `alphabet_size^kmer_size + 1` entries; postings for code i
//! occupy `[offsets[i], offsets[i+1])` in one contiguous block, so lookup
//! is O(1) with no per-code headers.
//!
//! Construction is a two-pass counting sort: the first pass counts postings
//! per code to size the offset table, the second writes each posting at its
//! precomputed cursor. This avoids growable per-code lists and their
//! reallocation.
//!
//! A table either owns its postings (build path) or wraps read-only views
//! into a container's mapping (load path); both back the same read
//! interface.

use bytemuck::{Pod, Zeroable};

use crate::constants::MAX_TABLE_SIZE;
use crate::error::{Result, SieveError};
use crate::lookup::SequenceLookup;
use crate::sequence::Sequence;
use crate::store::ByteBlock;

/// One k-mer occurrence. Fixed-size record, castable straight from a
/// mapped postings block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Posting {
    pub seq_id: u32,
    pub pos: u32,
}

/// Serialized posting record size in bytes.
pub const POSTING_SIZE: usize = std::mem::size_of::<Posting>();

enum PostingStorage {
    Owned(Vec<Posting>),
    Mapped(ByteBlock),
}

impl PostingStorage {
    fn as_postings(&self) -> &[Posting] {
        match self {
            PostingStorage::Owned(v) => v.as_slice(),
            // Alignment is validated when the mapped block is accepted.
            PostingStorage::Mapped(b) => bytemuck::cast_slice(b.as_slice()),
        }
    }
}

pub struct IndexTable {
    alphabet_size: usize,
    kmer_size: usize,
    table_size: usize,
    /// `table_size + 1` posting-count offsets.
    offsets: Vec<u64>,
    entries: PostingStorage,
    /// Build-phase state: per-code counts during the first pass, then
    /// write cursors during the second. None once frozen.
    cursors: Option<Vec<u64>>,
    lookup: SequenceLookup,
    /// Global id of the partition's first sequence; postings carry global
    /// ids while the lookup is indexed locally.
    seq_id_offset: u32,
    entries_num: u64,
}

impl IndexTable {
    /// Start a two-pass build for one partition.
    pub fn new(alphabet_size: usize, kmer_size: usize, seq_id_offset: u32) -> Result<Self> {
        let table_size = table_size_for(alphabet_size, kmer_size)?;
        Ok(IndexTable {
            alphabet_size,
            kmer_size,
            table_size,
            offsets: Vec::new(),
            entries: PostingStorage::Owned(Vec::new()),
            cursors: Some(vec![0u64; table_size]),
            lookup: SequenceLookup::new(),
            seq_id_offset,
            entries_num: 0,
        })
    }

    /// First pass: count this sequence's k-mers per code.
    pub fn count_sequence(&mut self, seq: &Sequence) -> Result<()> {
        debug_assert_eq!(seq.alphabet_size(), self.alphabet_size);
        let counts = self
            .cursors
            .as_mut()
            .ok_or_else(|| SieveError::validation("table is frozen, cannot count"))?;
        if !self.offsets.is_empty() {
            return Err(SieveError::validation(
                "count_sequence called after finalize_counts",
            ));
        }
        for (code, _pos) in seq.kmer_codes() {
            counts[code] += 1;
        }
        Ok(())
    }

    /// Turn counts into the offset table and allocate the postings block.
    pub fn finalize_counts(&mut self) -> Result<()> {
        let counts = self
            .cursors
            .as_mut()
            .ok_or_else(|| SieveError::validation("table is frozen"))?;
        let mut offsets = Vec::with_capacity(self.table_size + 1);
        let mut acc = 0u64;
        offsets.push(0);
        for c in counts.iter_mut() {
            let count = *c;
            // Counts become write cursors for the fill pass.
            *c = acc;
            acc += count;
            offsets.push(acc);
        }
        self.entries_num = acc;
        self.offsets = offsets;
        self.entries = PostingStorage::Owned(vec![
            Posting::zeroed();
            usize::try_from(acc).map_err(|_| {
                SieveError::validation("postings block exceeds addressable memory")
            })?
        ]);
        Ok(())
    }

    /// Second pass: write this sequence's postings at the precomputed
    /// cursors and append it to the sequence lookup. Sequences must arrive
    /// in the same order as the count pass.
    pub fn insert_sequence(&mut self, seq: &Sequence) -> Result<()> {
        let expected = self.seq_id_offset + self.lookup.sequence_count() as u32;
        if seq.id != expected {
            return Err(SieveError::validation(format!(
                "sequence {} inserted out of order (expected {})",
                seq.id, expected
            )));
        }
        let cursors = self
            .cursors
            .as_mut()
            .ok_or_else(|| SieveError::validation("table is frozen, cannot insert"))?;
        let entries = match &mut self.entries {
            PostingStorage::Owned(v) => v,
            PostingStorage::Mapped(_) => {
                return Err(SieveError::validation("cannot insert into a mapped table"))
            }
        };
        for (code, pos) in seq.kmer_codes() {
            entries[cursors[code] as usize] = Posting {
                seq_id: seq.id,
                pos,
            };
            cursors[code] += 1;
        }
        self.lookup.append(seq.codes())?;
        Ok(())
    }

    /// Freeze the table after the fill pass, verifying every code's cursor
    /// landed exactly on the next code's offset.
    pub fn finish(&mut self) -> Result<()> {
        let cursors = self
            .cursors
            .take()
            .ok_or_else(|| SieveError::validation("table already frozen"))?;
        for (i, &cursor) in cursors.iter().enumerate() {
            if cursor != self.offsets[i + 1] {
                return Err(SieveError::validation(format!(
                    "k-mer {} has {} postings filled but {} counted",
                    i,
                    cursor - self.offsets[i],
                    self.offsets[i + 1] - self.offsets[i]
                )));
            }
        }
        Ok(())
    }

    /// Reconstruct a frozen table from a container partition's byte ranges
    /// without re-scanning any sequence.
    pub fn from_external(
        alphabet_size: usize,
        kmer_size: usize,
        seq_id_offset: u32,
        entry_counts: &[u64],
        entries: ByteBlock,
        seq_lengths: &[u32],
        seq_data: ByteBlock,
    ) -> Result<Self> {
        let table_size = table_size_for(alphabet_size, kmer_size)?;
        if entry_counts.len() != table_size {
            return Err(SieveError::validation(format!(
                "entry size table has {} slots, expected {}",
                entry_counts.len(),
                table_size
            )));
        }
        let mut offsets = Vec::with_capacity(table_size + 1);
        let mut acc = 0u64;
        offsets.push(0);
        for &count in entry_counts {
            acc += count;
            offsets.push(acc);
        }
        if acc * POSTING_SIZE as u64 != entries.len() as u64 {
            return Err(SieveError::validation(format!(
                "postings block is {} bytes, counts sum to {} postings",
                entries.len(),
                acc
            )));
        }
        if bytemuck::try_cast_slice::<u8, Posting>(entries.as_slice()).is_err() {
            return Err(SieveError::validation(
                "postings block is not aligned for direct access",
            ));
        }
        let lookup = SequenceLookup::from_external(seq_lengths, seq_data)?;
        Ok(IndexTable {
            alphabet_size,
            kmer_size,
            table_size,
            offsets,
            entries: PostingStorage::Mapped(entries),
            cursors: None,
            lookup,
            seq_id_offset,
            entries_num: acc,
        })
    }

    /// Postings for one k-mer code. O(1).
    #[inline]
    pub fn lookup(&self, code: usize) -> &[Posting] {
        let start = self.offsets[code] as usize;
        let end = self.offsets[code + 1] as usize;
        &self.entries.as_postings()[start..end]
    }

    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    pub fn kmer_size(&self) -> usize {
        self.kmer_size
    }

    pub fn table_size(&self) -> usize {
        self.table_size
    }

    pub fn entries_num(&self) -> u64 {
        self.entries_num
    }

    pub fn sequence_count(&self) -> usize {
        self.lookup.sequence_count()
    }

    pub fn seq_id_offset(&self) -> u32 {
        self.seq_id_offset
    }

    /// Global id one past this partition's last sequence.
    pub fn seq_id_end(&self) -> u32 {
        self.seq_id_offset + self.lookup.sequence_count() as u32
    }

    pub fn sequence_lookup(&self) -> &SequenceLookup {
        &self.lookup
    }

    /// The posting-count offset table (`table_size + 1` entries).
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Raw postings bytes for serialization.
    pub fn entries_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.entries.as_postings())
    }
}

fn table_size_for(alphabet_size: usize, kmer_size: usize) -> Result<usize> {
    let size = alphabet_size
        .checked_pow(kmer_size as u32)
        .ok_or_else(|| {
            SieveError::validation(format!(
                "table size {}^{} overflows",
                alphabet_size, kmer_size
            ))
        })?;
    if size > MAX_TABLE_SIZE {
        return Err(SieveError::overflow(
            "k-mer table size",
            MAX_TABLE_SIZE,
            size,
        ));
    }
    Ok(size)
}
