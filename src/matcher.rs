//! Candidate generation: matching a query sequence against an index table.
//!
//! For every query k-mer the matcher expands a neighborhood of similar
//! k-mers through the precomputed length-2 and length-3 extended
//! substitution matrices, probes the inverted index for each, and
//! accumulates hits per target sequence. Local matching tracks the
//! diagonal (query position minus target position) of the previous hit per
//! target; a second hit on the same diagonal is a double match and raises
//! the target's score. Targets whose score reaches the cutoff are emitted
//! as candidates for downstream extension.
//!
//! A matcher owns mutable per-target scratch, so each worker thread uses
//! its own instance over the shared read-only table and matrices.

use crate::container::MatchMode;
use crate::error::{Result, SieveError};
use crate::matrix::ExtendedSubstitutionMatrix;
use crate::sequence::Sequence;
use crate::table::IndexTable;

/// Per-query aggregate statistics. Summed over a query set these estimate
/// the population k-mer match probability.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueryStats {
    /// Similar k-mers generated per query position.
    pub kmers_per_pos: f64,
    /// Postings touched, exact and expanded.
    pub db_matches: u64,
    /// Same-diagonal repeat hits (local mode).
    pub double_matches: u64,
}

/// One candidate target emitted for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub seq_id: u32,
    /// Accumulated double-match count.
    pub score: u32,
    /// Diagonal of the last hit, for seeding ungapped extension.
    pub diagonal: i32,
}

/// Decomposes k-mers into length-3 and length-2 chunks and expands the
/// cartesian product of the chunk neighborhoods above a score threshold.
struct KmerGenerator {
    alphabet_size: usize,
    chunk_lens: Vec<usize>,
    /// a^(total length of the chunks right of chunk i); divides a full
    /// code down to chunk i's position.
    chunk_divisors: Vec<usize>,
    output: Vec<usize>,
}

const NO_DIAGONAL: i32 = i32::MIN;

impl KmerGenerator {
    fn new(kmer_size: usize, alphabet_size: usize) -> Result<Self> {
        if kmer_size < 2 {
            return Err(SieveError::config(format!(
                "query matching requires k-mer size >= 2 (got {})",
                kmer_size
            )));
        }
        let mut chunk_lens = Vec::new();
        let mut rest = kmer_size;
        while rest > 4 {
            chunk_lens.push(3);
            rest -= 3;
        }
        match rest {
            2 | 3 => chunk_lens.push(rest),
            4 => chunk_lens.extend([2, 2]),
            _ => unreachable!(),
        }

        let mut chunk_divisors = vec![1usize; chunk_lens.len()];
        for i in (0..chunk_lens.len().saturating_sub(1)).rev() {
            chunk_divisors[i] =
                chunk_divisors[i + 1] * alphabet_size.pow(chunk_lens[i + 1] as u32);
        }

        Ok(KmerGenerator {
            alphabet_size,
            chunk_lens,
            chunk_divisors,
            output: Vec::new(),
        })
    }

    /// All k-mer codes whose summed chunk scores against `code` reach the
    /// threshold, assembled from the sorted chunk neighborhoods with
    /// best-remaining-score pruning. The source k-mer itself is included
    /// whenever its self-score passes.
    fn expand(
        &mut self,
        code: usize,
        threshold: i32,
        two_mer: &ExtendedSubstitutionMatrix,
        three_mer: &ExtendedSubstitutionMatrix,
    ) -> &[usize] {
        self.output.clear();

        let n = self.chunk_lens.len();
        let mut lists = Vec::with_capacity(n);
        for i in 0..n {
            let span = self.chunk_lens[i];
            let chunk_code =
                (code / self.chunk_divisors[i]) % self.alphabet_size.pow(span as u32);
            let list = match span {
                2 => two_mer.neighborhood(chunk_code),
                3 => three_mer.neighborhood(chunk_code),
                _ => unreachable!(),
            };
            lists.push(list);
        }

        // best_rest[i] = sum of the best chunk scores from chunk i on.
        let mut best_rest = vec![0i32; n + 1];
        for i in (0..n).rev() {
            best_rest[i] = best_rest[i + 1] + lists[i][0].score as i32;
        }

        self.expand_chunk(0, 0, 0, threshold, &lists, &best_rest);
        &self.output
    }

    fn expand_chunk(
        &mut self,
        chunk: usize,
        partial_code: usize,
        partial_score: i32,
        threshold: i32,
        lists: &[&[crate::matrix::ScoredKmer]],
        best_rest: &[i32],
    ) {
        if chunk == lists.len() {
            self.output.push(partial_code);
            return;
        }
        let place = self.alphabet_size.pow(self.chunk_lens[chunk] as u32);
        for s in lists[chunk] {
            let score = partial_score + s.score as i32;
            // Lists are sorted by descending score; once even the best
            // completion falls below the threshold, the rest cannot pass.
            if score + best_rest[chunk + 1] < threshold {
                break;
            }
            self.expand_chunk(
                chunk + 1,
                partial_code * place + s.code as usize,
                score,
                threshold,
                lists,
                best_rest,
            );
        }
    }
}

pub struct QueryMatcher<'a> {
    table: &'a IndexTable,
    two_mer: &'a ExtendedSubstitutionMatrix,
    three_mer: &'a ExtendedSubstitutionMatrix,
    kmer_threshold: i32,
    generator: KmerGenerator,
    /// Last hit diagonal per global target id; NO_DIAGONAL when untouched.
    diagonals: Vec<i32>,
    match_counts: Vec<u16>,
    touched: Vec<u32>,
}

impl<'a> QueryMatcher<'a> {
    pub fn new(
        table: &'a IndexTable,
        two_mer: &'a ExtendedSubstitutionMatrix,
        three_mer: &'a ExtendedSubstitutionMatrix,
        kmer_threshold: i32,
        mode: MatchMode,
    ) -> Result<Self> {
        match mode {
            MatchMode::Local => {}
        }
        if two_mer.alphabet_size() != table.alphabet_size()
            || three_mer.alphabet_size() != table.alphabet_size()
        {
            return Err(SieveError::validation(
                "extended matrices and table use different alphabets",
            ));
        }
        let generator = KmerGenerator::new(table.kmer_size(), table.alphabet_size())?;
        let scratch = table.seq_id_end() as usize;
        Ok(QueryMatcher {
            table,
            two_mer,
            three_mer,
            kmer_threshold,
            generator,
            diagonals: vec![NO_DIAGONAL; scratch],
            match_counts: vec![0; scratch],
            touched: Vec::new(),
        })
    }

    /// Match one query against the table. Candidates are targets whose
    /// double-match score reached `score_cutoff`, ordered by descending
    /// score then id. Passing `u32::MAX` collects statistics only.
    pub fn match_query(
        &mut self,
        seq: &Sequence,
        score_cutoff: u32,
    ) -> (Vec<Candidate>, QueryStats) {
        for &t in &self.touched {
            self.diagonals[t as usize] = NO_DIAGONAL;
            self.match_counts[t as usize] = 0;
        }
        self.touched.clear();

        let mut generated: u64 = 0;
        let mut db_matches: u64 = 0;
        let mut double_matches: u64 = 0;

        for (code, qpos) in seq.kmer_codes() {
            let similar =
                self.generator
                    .expand(code, self.kmer_threshold, self.two_mer, self.three_mer);
            generated += similar.len() as u64;
            for &scode in similar {
                for p in self.table.lookup(scode) {
                    db_matches += 1;
                    let t = p.seq_id as usize;
                    let diag = qpos as i32 - p.pos as i32;
                    if self.diagonals[t] == NO_DIAGONAL {
                        self.touched.push(p.seq_id);
                    } else if self.diagonals[t] == diag {
                        double_matches += 1;
                        self.match_counts[t] = self.match_counts[t].saturating_add(1);
                    }
                    self.diagonals[t] = diag;
                }
            }
        }

        let mut candidates = Vec::new();
        for &t in &self.touched {
            let score = self.match_counts[t as usize] as u32;
            if score >= score_cutoff {
                candidates.push(Candidate {
                    seq_id: t,
                    score,
                    diagonal: self.diagonals[t as usize],
                });
            }
        }
        candidates.sort_unstable_by(|a, b| b.score.cmp(&a.score).then(a.seq_id.cmp(&b.seq_id)));

        let positions = seq.window_count().max(1) as f64;
        let stats = QueryStats {
            kmers_per_pos: generated as f64 / positions,
            db_matches,
            double_matches,
        };
        (candidates, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::build_table_for_range;
    use crate::matrix::SubstitutionMatrix;
    use crate::sequence::Alphabet;
    use crate::store::{StoreReader, StoreWriter};
    use tempfile::TempDir;

    fn dna_store(dir: &TempDir, seqs: &[&[u8]]) -> StoreReader {
        let data = dir.path().join("db.dat");
        let index = dir.path().join("db.idx");
        let mut writer = StoreWriter::create(&data, &index).unwrap();
        for (i, s) in seqs.iter().enumerate() {
            writer.write(i as u32, s).unwrap();
        }
        writer.finish().unwrap();
        StoreReader::open(&data, &index).unwrap()
    }

    fn matrices(alphabet_size: usize) -> (ExtendedSubstitutionMatrix, ExtendedSubstitutionMatrix) {
        let sub = SubstitutionMatrix::uniform(alphabet_size, 3, -1);
        (
            ExtendedSubstitutionMatrix::new(&sub, 2).unwrap(),
            ExtendedSubstitutionMatrix::new(&sub, 3).unwrap(),
        )
    }

    #[test]
    fn test_exact_self_match_produces_double_matches() {
        let dir = TempDir::new().unwrap();
        let source = dna_store(&dir, &[b"ACGTACGTACGT", b"TTTTTTTTTTTT"]);
        let alphabet = Alphabet::dna();
        let table = build_table_for_range(&source, &alphabet, 3, false, 0..2).unwrap();
        let (two, three) = matrices(4);

        // Threshold equal to the self-score admits only exact k-mers.
        let mut matcher = QueryMatcher::new(&table, &two, &three, 9, MatchMode::Local).unwrap();
        let mut seq = Sequence::new(3, 4, false).unwrap();
        seq.map_sequence(0, &alphabet, b"ACGTACGTACGT").unwrap();

        let (candidates, stats) = matcher.match_query(&seq, 1);
        // Sequence 0 matches itself along diagonal 0 repeatedly.
        assert!(candidates.iter().any(|c| c.seq_id == 0 && c.diagonal == 0));
        assert!(stats.double_matches > 0);
        assert!(stats.db_matches >= stats.double_matches);
        // Only exact probes: one similar k-mer per position.
        assert!((stats.kmers_per_pos - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_lower_threshold_expands_neighborhood() {
        let dir = TempDir::new().unwrap();
        let source = dna_store(&dir, &[b"ACGTACGTAC"]);
        let alphabet = Alphabet::dna();
        let table = build_table_for_range(&source, &alphabet, 3, false, 0..1).unwrap();
        let (two, three) = matrices(4);

        let mut seq = Sequence::new(3, 4, false).unwrap();
        seq.map_sequence(0, &alphabet, b"ACGTACGTAC").unwrap();

        let mut exact = QueryMatcher::new(&table, &two, &three, 9, MatchMode::Local).unwrap();
        let (_, exact_stats) = exact.match_query(&seq, u32::MAX);

        // One mismatch costs 4 (3 - -1); threshold 5 admits all
        // single-substitution k-mers.
        let mut fuzzy = QueryMatcher::new(&table, &two, &three, 5, MatchMode::Local).unwrap();
        let (_, fuzzy_stats) = fuzzy.match_query(&seq, u32::MAX);

        assert!(fuzzy_stats.kmers_per_pos > exact_stats.kmers_per_pos);
        assert!(fuzzy_stats.db_matches >= exact_stats.db_matches);
    }

    #[test]
    fn test_statistics_only_cutoff_emits_no_candidates() {
        let dir = TempDir::new().unwrap();
        let source = dna_store(&dir, &[b"ACGTACGTACGT"]);
        let alphabet = Alphabet::dna();
        let table = build_table_for_range(&source, &alphabet, 3, false, 0..1).unwrap();
        let (two, three) = matrices(4);

        let mut matcher = QueryMatcher::new(&table, &two, &three, 9, MatchMode::Local).unwrap();
        let mut seq = Sequence::new(3, 4, false).unwrap();
        seq.map_sequence(0, &alphabet, b"ACGTACGTACGT").unwrap();

        let (candidates, stats) = matcher.match_query(&seq, u32::MAX);
        assert!(candidates.is_empty());
        assert!(stats.db_matches > 0);
    }

    #[test]
    fn test_unrelated_query_finds_nothing_exact() {
        let dir = TempDir::new().unwrap();
        let source = dna_store(&dir, &[b"AAAAAAAAAA"]);
        let alphabet = Alphabet::dna();
        let table = build_table_for_range(&source, &alphabet, 3, false, 0..1).unwrap();
        let (two, three) = matrices(4);

        let mut matcher = QueryMatcher::new(&table, &two, &three, 9, MatchMode::Local).unwrap();
        let mut seq = Sequence::new(3, 4, false).unwrap();
        seq.map_sequence(0, &alphabet, b"GGGGGGGGGG").unwrap();

        let (candidates, stats) = matcher.match_query(&seq, 1);
        assert!(candidates.is_empty());
        assert_eq!(stats.db_matches, 0);
    }

    #[test]
    fn test_scratch_resets_between_queries() {
        let dir = TempDir::new().unwrap();
        let source = dna_store(&dir, &[b"ACGTACGTACGT"]);
        let alphabet = Alphabet::dna();
        let table = build_table_for_range(&source, &alphabet, 3, false, 0..1).unwrap();
        let (two, three) = matrices(4);

        let mut matcher = QueryMatcher::new(&table, &two, &three, 9, MatchMode::Local).unwrap();
        let mut seq = Sequence::new(3, 4, false).unwrap();

        seq.map_sequence(0, &alphabet, b"ACGTACGTACGT").unwrap();
        let (first, _) = matcher.match_query(&seq, 1);

        seq.map_sequence(1, &alphabet, b"GGGGGGGG").unwrap();
        let (second, _) = matcher.match_query(&seq, 1);
        assert!(second.is_empty());

        seq.map_sequence(2, &alphabet, b"ACGTACGTACGT").unwrap();
        let (third, _) = matcher.match_query(&seq, 1);
        assert_eq!(first, third);
    }

    #[test]
    fn test_generator_chunk_layout() {
        for (k, expected) in [
            (2, vec![2]),
            (3, vec![3]),
            (4, vec![2, 2]),
            (5, vec![3, 2]),
            (6, vec![3, 3]),
            (7, vec![3, 2, 2]),
            (8, vec![3, 3, 2]),
        ] {
            let g = KmerGenerator::new(k, 4).unwrap();
            assert_eq!(g.chunk_lens, expected, "k = {}", k);
        }
        assert!(KmerGenerator::new(1, 4).is_err());
    }

    #[test]
    fn test_generator_expansion_respects_threshold() {
        let (two, three) = matrices(4);
        let mut g = KmerGenerator::new(4, 4).unwrap();

        // Self-score for k=4 is 12; threshold 12 keeps only the source.
        let similar = g.expand(0, 12, &two, &three);
        assert_eq!(similar, &[0]);

        // Threshold 8 admits one substitution anywhere (12 - 4 = 8):
        // 4 positions times 3 alternatives, plus the source itself.
        let similar = g.expand(0, 8, &two, &three);
        assert_eq!(similar.len(), 13);
        assert!(similar.contains(&0));

        // An impossible threshold yields nothing.
        let similar = g.expand(0, 100, &two, &three);
        assert!(similar.is_empty());
    }
}
