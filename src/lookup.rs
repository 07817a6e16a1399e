//! Compact per-partition sequence store.
//!
//! Holds the concatenated mapped residue codes of every sequence in a
//! partition plus a per-sequence offset table, giving O(1) access by local
//! sequence index. Built incrementally alongside the inverted index, or
//! reconstructed from a container's mapped bytes and persisted lengths.

use crate::constants::MAX_SEQUENCE_LENGTH;
use crate::error::{Result, SieveError};
use crate::store::ByteBlock;

pub struct SequenceLookup {
    /// `sequence_count + 1` entries; offsets are contiguous, so
    /// `offsets[i+1] - offsets[i]` is sequence i's length and the final
    /// entry equals the data size.
    offsets: Vec<u64>,
    data: ByteBlock,
}

impl SequenceLookup {
    pub fn new() -> Self {
        SequenceLookup {
            offsets: vec![0],
            data: ByteBlock::empty(),
        }
    }

    pub fn with_capacity(seq_count: usize, data_bytes: usize) -> Self {
        let mut offsets = Vec::with_capacity(seq_count + 1);
        offsets.push(0);
        SequenceLookup {
            offsets,
            data: ByteBlock::Owned(Vec::with_capacity(data_bytes)),
        }
    }

    /// Append the next sequence's mapped codes. Only valid on the build
    /// path where the data block is owned.
    pub fn append(&mut self, codes: &[u8]) -> Result<()> {
        if codes.len() > MAX_SEQUENCE_LENGTH {
            return Err(SieveError::overflow(
                "sequence length",
                MAX_SEQUENCE_LENGTH,
                codes.len(),
            ));
        }
        let data = self
            .data
            .as_mut_vec()
            .ok_or_else(|| SieveError::validation("cannot append to a mapped sequence lookup"))?;
        data.extend_from_slice(codes);
        self.offsets.push(data.len() as u64);
        Ok(())
    }

    /// Rebuild a lookup over external bytes from persisted per-sequence
    /// lengths. The offset table is the running sum of the lengths.
    pub fn from_external(lengths: &[u32], data: ByteBlock) -> Result<Self> {
        let mut offsets = Vec::with_capacity(lengths.len() + 1);
        let mut acc = 0u64;
        offsets.push(0);
        for &len in lengths {
            acc += len as u64;
            offsets.push(acc);
        }
        if acc != data.len() as u64 {
            return Err(SieveError::validation(format!(
                "sequence lengths sum to {} but data block has {} bytes",
                acc,
                data.len()
            )));
        }
        Ok(SequenceLookup { offsets, data })
    }

    pub fn sequence_count(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Mapped residue codes of the sequence at local index `i`.
    pub fn sequence(&self, i: usize) -> &[u8] {
        let start = self.offsets[i] as usize;
        let end = self.offsets[i + 1] as usize;
        &self.data.as_slice()[start..end]
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn data_size(&self) -> u64 {
        *self.offsets.last().unwrap()
    }

    /// Per-sequence lengths as persisted in the container.
    pub fn lengths(&self) -> Vec<u32> {
        self.offsets
            .windows(2)
            .map(|w| (w[1] - w[0]) as u32)
            .collect()
    }
}

impl Default for SequenceLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_retrieve() -> Result<()> {
        let mut lookup = SequenceLookup::new();
        lookup.append(&[0, 1, 2, 3])?;
        lookup.append(&[4, 5])?;
        lookup.append(&[])?;
        lookup.append(&[6, 7, 8])?;

        assert_eq!(lookup.sequence_count(), 4);
        assert_eq!(lookup.sequence(0), &[0, 1, 2, 3]);
        assert_eq!(lookup.sequence(1), &[4, 5]);
        assert_eq!(lookup.sequence(2), &[] as &[u8]);
        assert_eq!(lookup.sequence(3), &[6, 7, 8]);
        assert_eq!(lookup.data_size(), 9);
        Ok(())
    }

    #[test]
    fn test_lengths_sum_to_data_size() -> Result<()> {
        let mut lookup = SequenceLookup::new();
        lookup.append(&[1; 10])?;
        lookup.append(&[2; 7])?;

        let lengths = lookup.lengths();
        assert_eq!(lengths, vec![10, 7]);
        assert_eq!(
            lengths.iter().map(|&l| l as u64).sum::<u64>(),
            lookup.data_size()
        );
        Ok(())
    }

    #[test]
    fn test_external_roundtrip() -> Result<()> {
        let mut built = SequenceLookup::new();
        built.append(&[3, 1, 4])?;
        built.append(&[1, 5])?;

        let rebuilt = SequenceLookup::from_external(
            &built.lengths(),
            ByteBlock::Owned(built.data().to_vec()),
        )?;
        assert_eq!(rebuilt.sequence_count(), built.sequence_count());
        assert_eq!(rebuilt.sequence(0), built.sequence(0));
        assert_eq!(rebuilt.sequence(1), built.sequence(1));
        Ok(())
    }

    #[test]
    fn test_external_length_mismatch_rejected() {
        let err = SequenceLookup::from_external(&[4], ByteBlock::Owned(vec![0; 3])).unwrap_err();
        assert!(err.to_string().contains("lengths sum"));
    }
}
