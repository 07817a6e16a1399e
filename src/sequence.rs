//! Residue alphabets and query/target sequences with k-mer enumeration.
//!
//! An [`Alphabet`] maps residue bytes to small integer codes; a
//! [`Sequence`] owns the mapped code buffer for one database record and
//! enumerates its k-mer windows, exact or spaced. Sequences are designed
//! for reuse: one per worker thread, re-mapped for each record.

use crate::constants::{MAX_KMER_SIZE, MAX_SEQUENCE_LENGTH};
use crate::error::{Result, SieveError};

/// Canonical amino acid ordering used by the built-in scoring tables.
/// X (position 20) absorbs unknown residues.
pub(crate) const CANONICAL_AMINO: &[u8; 21] = b"ACDEFGHIKLMNPQRSTVWYX";

/// Residue groupings for the reduced amino alphabets. Unknowns always fold
/// into the trailing X group.
const REDUCED_11: &[&str] = &["LVIM", "C", "A", "G", "ST", "P", "FYW", "EDNQ", "KR", "H", "X"];
const REDUCED_9: &[&str] = &["LVIMC", "AG", "ST", "P", "FYW", "EDNQ", "KR", "H", "X"];
const REDUCED_5: &[&str] = &["LVIMC", "AGSTP", "FYW", "EDNQKRH", "X"];

/// Maps residue bytes to codes in `[0, size)`.
#[derive(Debug, Clone)]
pub struct Alphabet {
    size: usize,
    to_code: [u8; 256],
    residues: Vec<u8>,
    /// Canonical amino indices merged into each code; empty for
    /// non-amino alphabets.
    groups: Vec<Vec<usize>>,
}

impl Alphabet {
    /// The full 21-letter amino acid alphabet (20 residues plus X).
    pub fn amino() -> Self {
        let groups = (0..CANONICAL_AMINO.len()).map(|i| vec![i]).collect();
        Self::from_groups(CANONICAL_AMINO.to_vec(), groups)
    }

    /// A reduced amino alphabet merging fixed residue groups.
    /// Supported sizes: 11, 9, 5.
    pub fn reduced_amino(size: usize) -> Result<Self> {
        let grouping: &[&str] = match size {
            11 => REDUCED_11,
            9 => REDUCED_9,
            5 => REDUCED_5,
            _ => {
                return Err(SieveError::validation(format!(
                    "unsupported reduced alphabet size {} (supported: 11, 9, 5)",
                    size
                )))
            }
        };
        let mut residues = Vec::with_capacity(grouping.len());
        let mut groups = Vec::with_capacity(grouping.len());
        for members in grouping {
            let bytes = members.as_bytes();
            residues.push(bytes[0]);
            groups.push(
                bytes
                    .iter()
                    .map(|&b| canonical_index(b).expect("group table uses canonical residues"))
                    .collect(),
            );
        }
        Ok(Self::from_groups(residues, groups))
    }

    /// The 4-letter nucleotide alphabet.
    pub fn dna() -> Self {
        Self::from_groups(b"ACGT".to_vec(), Vec::new())
    }

    /// Resolve an alphabet by its configured size.
    pub fn for_size(size: usize) -> Result<Self> {
        match size {
            21 => Ok(Self::amino()),
            11 | 9 | 5 => Self::reduced_amino(size),
            4 => Ok(Self::dna()),
            _ => Err(SieveError::validation(format!(
                "unsupported alphabet size {} (supported: 21, 11, 9, 5, 4)",
                size
            ))),
        }
    }

    fn from_groups(residues: Vec<u8>, groups: Vec<Vec<usize>>) -> Self {
        let size = residues.len();
        // Unknown bytes map to the last code (X for amino alphabets).
        let mut to_code = [(size - 1) as u8; 256];
        for (code, &r) in residues.iter().enumerate() {
            to_code[r as usize] = code as u8;
            to_code[r.to_ascii_lowercase() as usize] = code as u8;
        }
        if !groups.is_empty() {
            for (code, members) in groups.iter().enumerate() {
                for &m in members {
                    let r = CANONICAL_AMINO[m];
                    to_code[r as usize] = code as u8;
                    to_code[r.to_ascii_lowercase() as usize] = code as u8;
                }
            }
        }
        Alphabet {
            size,
            to_code,
            residues,
            groups,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn code(&self, residue: u8) -> u8 {
        self.to_code[residue as usize]
    }

    pub fn residue(&self, code: u8) -> u8 {
        self.residues[code as usize]
    }

    /// Canonical amino indices behind each code; empty for non-amino
    /// alphabets.
    pub(crate) fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }
}

pub(crate) fn canonical_index(residue: u8) -> Option<usize> {
    CANONICAL_AMINO.iter().position(|&r| r == residue)
}

/// Spaced sampling pattern for a given k-mer weight. Sampled positions are
/// marked true; patterns begin and end on sampled positions.
fn spaced_pattern(kmer_size: usize) -> Result<Vec<bool>> {
    let pattern: &[u8] = match kmer_size {
        4 => b"11011",
        5 => b"1101101",
        6 => b"11011011",
        7 => b"110110111",
        8 => b"1101101111",
        _ => {
            return Err(SieveError::validation(format!(
                "no spaced pattern defined for k-mer size {} (supported: 4..=8)",
                kmer_size
            )))
        }
    };
    Ok(pattern.iter().map(|&c| c == b'1').collect())
}

/// One mapped sequence with its k-mer enumeration configuration.
#[derive(Debug)]
pub struct Sequence {
    pub id: u32,
    kmer_size: usize,
    alphabet_size: usize,
    pattern: Vec<bool>,
    code: Vec<u8>,
}

impl Sequence {
    pub fn new(kmer_size: usize, alphabet_size: usize, spaced: bool) -> Result<Self> {
        if kmer_size == 0 || kmer_size > MAX_KMER_SIZE {
            return Err(SieveError::validation(format!(
                "k-mer size must be in 1..={} (got {})",
                MAX_KMER_SIZE, kmer_size
            )));
        }
        if alphabet_size < 2 {
            return Err(SieveError::validation(format!(
                "alphabet size must be at least 2 (got {})",
                alphabet_size
            )));
        }
        let pattern = if spaced {
            spaced_pattern(kmer_size)?
        } else {
            vec![true; kmer_size]
        };
        Ok(Sequence {
            id: 0,
            kmer_size,
            alphabet_size,
            pattern,
            code: Vec::new(),
        })
    }

    /// Re-fill this sequence from raw residue bytes. The code buffer is
    /// reused across calls.
    pub fn map_sequence(&mut self, id: u32, alphabet: &Alphabet, residues: &[u8]) -> Result<()> {
        if residues.len() > MAX_SEQUENCE_LENGTH {
            return Err(SieveError::overflow(
                "sequence length",
                MAX_SEQUENCE_LENGTH,
                residues.len(),
            ));
        }
        self.id = id;
        self.code.clear();
        self.code.reserve(residues.len());
        self.code.extend(residues.iter().map(|&r| alphabet.code(r)));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn codes(&self) -> &[u8] {
        &self.code
    }

    pub fn kmer_size(&self) -> usize {
        self.kmer_size
    }

    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    pub fn spaced(&self) -> bool {
        self.pattern.len() != self.kmer_size
    }

    /// Window span covered by one k-mer; larger than `kmer_size` for
    /// spaced patterns.
    pub fn effective_kmer_span(&self) -> usize {
        self.pattern.len()
    }

    /// Number of k-mer windows this sequence produces.
    pub fn window_count(&self) -> usize {
        (self.code.len() + 1).saturating_sub(self.pattern.len())
    }

    /// Iterate (k-mer code, start position) over every window.
    pub fn kmer_codes(&self) -> KmerCodes<'_> {
        KmerCodes { seq: self, pos: 0 }
    }
}

/// Iterator over a sequence's base-`alphabet_size` encoded k-mer windows.
pub struct KmerCodes<'a> {
    seq: &'a Sequence,
    pos: usize,
}

impl Iterator for KmerCodes<'_> {
    type Item = (usize, u32);

    fn next(&mut self) -> Option<Self::Item> {
        let span = self.seq.pattern.len();
        if self.pos + span > self.seq.code.len() {
            return None;
        }
        let mut code = 0usize;
        for (j, &sampled) in self.seq.pattern.iter().enumerate() {
            if sampled {
                code = code * self.seq.alphabet_size + self.seq.code[self.pos + j] as usize;
            }
        }
        let pos = self.pos as u32;
        self.pos += 1;
        Some((code, pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amino_mapping() {
        let a = Alphabet::amino();
        assert_eq!(a.size(), 21);
        assert_eq!(a.code(b'A'), 0);
        assert_eq!(a.code(b'a'), 0);
        assert_eq!(a.code(b'C'), 1);
        assert_eq!(a.code(b'X'), 20);
        // Unknown residues fold into X.
        assert_eq!(a.code(b'*'), 20);
        assert_eq!(a.code(b'B'), 20);
    }

    #[test]
    fn test_reduced_alphabet_merges_groups() {
        let a = Alphabet::reduced_amino(5).unwrap();
        assert_eq!(a.size(), 5);
        // L, V, I, M, C share a group.
        assert_eq!(a.code(b'L'), a.code(b'V'));
        assert_eq!(a.code(b'L'), a.code(b'C'));
        assert_ne!(a.code(b'L'), a.code(b'F'));
    }

    #[test]
    fn test_for_size_rejects_unknown() {
        assert!(Alphabet::for_size(21).is_ok());
        assert!(Alphabet::for_size(4).is_ok());
        assert!(Alphabet::for_size(7).is_err());
    }

    #[test]
    fn test_exact_kmer_enumeration() {
        let a = Alphabet::dna();
        let mut seq = Sequence::new(3, 4, false).unwrap();
        seq.map_sequence(0, &a, b"ACGTA").unwrap();

        let kmers: Vec<_> = seq.kmer_codes().collect();
        assert_eq!(kmers.len(), 3);
        assert_eq!(seq.window_count(), 3);
        // ACG = 0*16 + 1*4 + 2
        assert_eq!(kmers[0], (6, 0));
        // CGT = 1*16 + 2*4 + 3
        assert_eq!(kmers[1], (27, 1));
        // GTA = 2*16 + 3*4 + 0
        assert_eq!(kmers[2], (44, 2));
    }

    #[test]
    fn test_ten_residue_sequence_has_eight_kmers() {
        let a = Alphabet::dna();
        let mut seq = Sequence::new(3, 4, false).unwrap();
        seq.map_sequence(0, &a, b"ACGTACGTAC").unwrap();
        assert_eq!(seq.kmer_codes().count(), 8);
    }

    #[test]
    fn test_spaced_kmer_skips_positions() {
        let a = Alphabet::dna();
        let mut seq = Sequence::new(4, 4, true).unwrap();
        assert_eq!(seq.effective_kmer_span(), 5);
        // Pattern 11011 samples positions 0, 1, 3, 4.
        seq.map_sequence(0, &a, b"ACGTC").unwrap();
        let kmers: Vec<_> = seq.kmer_codes().collect();
        assert_eq!(kmers.len(), 1);
        // A, C, T, C = ((0*4+1)*4+3)*4+1
        assert_eq!(kmers[0], (29, 0));
    }

    #[test]
    fn test_spaced_pattern_weight_matches_kmer_size() {
        for k in 4..=8 {
            let p = spaced_pattern(k).unwrap();
            assert_eq!(p.iter().filter(|&&b| b).count(), k);
            assert!(p[0] && p[p.len() - 1]);
        }
        assert!(spaced_pattern(3).is_err());
    }

    #[test]
    fn test_sequence_shorter_than_span_yields_nothing() {
        let a = Alphabet::dna();
        let mut seq = Sequence::new(5, 4, false).unwrap();
        seq.map_sequence(0, &a, b"ACG").unwrap();
        assert_eq!(seq.kmer_codes().count(), 0);
        assert_eq!(seq.window_count(), 0);
    }
}
