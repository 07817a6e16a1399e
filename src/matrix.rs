//! Residue substitution scoring and precomputed short-window neighborhoods.
//!
//! [`SubstitutionMatrix`] holds the residue-pair score table; the built-in
//! BLOSUM62 covers the amino alphabets, with reduced alphabets scored by
//! averaging member residues. [`ExtendedSubstitutionMatrix`] expands a
//! substitution matrix to windows of length 2 or 3: for every window code
//! it stores all candidate windows sorted by descending score, which the
//! matcher slices at a per-position threshold to turn exact k-mer probes
//! into similarity neighborhoods.

use crate::error::{Result, SieveError};
use crate::sequence::Alphabet;

/// BLOSUM62 over the canonical ordering ACDEFGHIKLMNPQRSTVWYX.
#[rustfmt::skip]
const BLOSUM62: [[i16; 21]; 21] = [
    [ 4,  0, -2, -1, -2,  0, -2, -1, -1, -1, -1, -2, -1, -1, -1,  1,  0,  0, -3, -2, -1],
    [ 0,  9, -3, -4, -2, -3, -3, -1, -3, -1, -1, -3, -3, -3, -3, -1, -1, -1, -2, -2, -1],
    [-2, -3,  6,  2, -3, -1, -1, -3, -1, -4, -3,  1, -1,  0, -2,  0, -1, -3, -4, -3, -1],
    [-1, -4,  2,  5, -3, -2,  0, -3,  1, -3, -2,  0, -1,  2,  0,  0, -1, -2, -3, -2, -1],
    [-2, -2, -3, -3,  6, -3, -1,  0, -3,  0,  0, -3, -4, -3, -3, -2, -2, -1,  1,  3, -1],
    [ 0, -3, -1, -2, -3,  6, -2, -4, -2, -4, -3,  0, -2, -2, -2,  0, -2, -3, -2, -3, -1],
    [-2, -3, -1,  0, -1, -2,  8, -3, -1, -3, -2,  1, -2,  0,  0, -1, -2, -3, -2,  2, -1],
    [-1, -1, -3, -3,  0, -4, -3,  4, -3,  2,  1, -3, -3, -3, -3, -2, -1,  3, -3, -1, -1],
    [-1, -3, -1,  1, -3, -2, -1, -3,  5, -2, -1,  0, -1,  1,  2,  0, -1, -2, -3, -2, -1],
    [-1, -1, -4, -3,  0, -4, -3,  2, -2,  4,  2, -3, -3, -2, -2, -2, -1,  1, -2, -1, -1],
    [-1, -1, -3, -2,  0, -3, -2,  1, -1,  2,  5, -2, -2,  0, -1, -1, -1,  1, -1, -1, -1],
    [-2, -3,  1,  0, -3,  0,  1, -3,  0, -3, -2,  6, -2,  0,  0,  1,  0, -3, -4, -2, -1],
    [-1, -3, -1, -1, -4, -2, -2, -3, -1, -3, -2, -2,  7, -1, -2, -1, -1, -2, -4, -3, -1],
    [-1, -3,  0,  2, -3, -2,  0, -3,  1, -2,  0,  0, -1,  5,  1,  0, -1, -2, -2, -1, -1],
    [-1, -3, -2,  0, -3, -2,  0, -3,  2, -2, -1,  0, -2,  1,  5, -1, -1, -3, -3, -2, -1],
    [ 1, -1,  0,  0, -2,  0, -1, -2,  0, -2, -1,  1, -1,  0, -1,  4,  1, -2, -3, -2, -1],
    [ 0, -1, -1, -1, -2, -2, -2, -1, -1, -1, -1,  0, -1, -1, -1,  1,  5,  0, -2, -2, -1],
    [ 0, -1, -3, -2, -1, -3, -3,  3, -2,  1,  1, -3, -2, -2, -3, -2,  0,  4, -3, -1, -1],
    [-3, -2, -4, -3,  1, -2, -2, -3, -3, -2, -1, -4, -4, -2, -3, -3, -2, -3, 11,  2, -1],
    [-2, -2, -3, -2,  3, -3,  2, -1, -2, -1, -1, -2, -3, -1, -2, -2, -2, -1,  2,  7, -1],
    [-1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1],
];

/// Residue-pair score table over one alphabet.
#[derive(Debug, Clone)]
pub struct SubstitutionMatrix {
    alphabet_size: usize,
    scores: Vec<i16>,
}

impl SubstitutionMatrix {
    /// BLOSUM62 scores for an amino alphabet. Reduced alphabets score a
    /// group pair as the rounded average over all member pairs.
    pub fn blosum62(alphabet: &Alphabet) -> Result<Self> {
        let groups = alphabet.groups();
        if groups.is_empty() {
            return Err(SieveError::validation(
                "BLOSUM62 scoring requires an amino alphabet",
            ));
        }
        let n = alphabet.size();
        let mut scores = vec![0i16; n * n];
        for (a, ga) in groups.iter().enumerate() {
            for (b, gb) in groups.iter().enumerate() {
                let mut sum = 0i64;
                for &ia in ga {
                    for &ib in gb {
                        sum += BLOSUM62[ia][ib] as i64;
                    }
                }
                let avg = (sum as f64 / (ga.len() * gb.len()) as f64).round() as i16;
                scores[a * n + b] = avg;
            }
        }
        Ok(SubstitutionMatrix {
            alphabet_size: n,
            scores,
        })
    }

    /// Flat match/mismatch scoring, used for nucleotide alphabets.
    pub fn uniform(alphabet_size: usize, matched: i16, mismatched: i16) -> Self {
        let mut scores = vec![mismatched; alphabet_size * alphabet_size];
        for i in 0..alphabet_size {
            scores[i * alphabet_size + i] = matched;
        }
        SubstitutionMatrix {
            alphabet_size,
            scores,
        }
    }

    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    #[inline]
    pub fn score(&self, a: u8, b: u8) -> i16 {
        self.scores[a as usize * self.alphabet_size + b as usize]
    }
}

/// One candidate window and its similarity score against a source window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoredKmer {
    pub code: u32,
    pub score: i16,
}

/// Precomputed neighborhoods for every window of a fixed short length.
///
/// `neighborhood(code)` returns every window of the same length ordered by
/// descending substitution score against `code`; callers walk the prefix
/// above their threshold. Window lengths 2 and 3 are the building blocks
/// the matcher composes into full k-mer neighborhoods.
pub struct ExtendedSubstitutionMatrix {
    window: usize,
    alphabet_size: usize,
    neighbors: Vec<Vec<ScoredKmer>>,
}

impl ExtendedSubstitutionMatrix {
    pub fn new(sub: &SubstitutionMatrix, window: usize) -> Result<Self> {
        if !(window == 2 || window == 3) {
            return Err(SieveError::validation(format!(
                "extended matrix window must be 2 or 3 (got {})",
                window
            )));
        }
        let a = sub.alphabet_size();
        let n = a.pow(window as u32);

        // Residue decomposition of every window code, computed once.
        let mut decoded = vec![[0u8; 3]; n];
        for (code, slot) in decoded.iter_mut().enumerate() {
            let mut rest = code;
            for j in (0..window).rev() {
                slot[j] = (rest % a) as u8;
                rest /= a;
            }
        }

        let mut neighbors = Vec::with_capacity(n);
        for source in &decoded {
            let mut row: Vec<ScoredKmer> = decoded
                .iter()
                .enumerate()
                .map(|(cand_code, cand)| {
                    let mut score = 0i16;
                    for j in 0..window {
                        score += sub.score(source[j], cand[j]);
                    }
                    ScoredKmer {
                        code: cand_code as u32,
                        score,
                    }
                })
                .collect();
            row.sort_unstable_by(|x, y| y.score.cmp(&x.score).then(x.code.cmp(&y.code)));
            neighbors.push(row);
        }

        Ok(ExtendedSubstitutionMatrix {
            window,
            alphabet_size: a,
            neighbors,
        })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    /// All same-length windows ordered by descending score against `code`.
    #[inline]
    pub fn neighborhood(&self, code: usize) -> &[ScoredKmer] {
        &self.neighbors[code]
    }

    /// Highest achievable score for `code`, its self-match.
    #[inline]
    pub fn best_score(&self, code: usize) -> i16 {
        self.neighbors[code][0].score
    }
}
