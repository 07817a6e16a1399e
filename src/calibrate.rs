//! Empirical threshold calibration.
//!
//! Sweeps k-mer length, alphabet size, and k-mer score threshold against a
//! real target database, measuring the achieved k-mer match probability and
//! wall-clock cost of each configuration. The output log is the basis for
//! choosing an operating point trading sensitivity against speed.
//!
//! Timing is advisory, not preemptive: a completed run that was too fast to
//! trust is discarded, and a run that got slow enough ends its threshold
//! sweep, since lowering the threshold further only increases cost.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Deserialize;

use crate::constants::{
    DEFAULT_QUERY_SET_SIZE, LOCAL_MATCH_PROB_NORM, MAX_SWEEP_RUN_SECS, MIN_TIMED_RUN_SECS,
};
use crate::container::{build_table_for_range, MatchMode};
use crate::error::{Result, SieveError};
use crate::matcher::QueryMatcher;
use crate::matrix::{ExtendedSubstitutionMatrix, SubstitutionMatrix};
use crate::sequence::{Alphabet, Sequence};
use crate::store::StoreReader;

/// Parameter grid for one calibration sweep, loaded from TOML.
#[derive(Debug, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_alphabet_sizes")]
    pub alphabet_sizes: Vec<usize>,
    #[serde(default = "default_kmer_sizes")]
    pub kmer_sizes: Vec<usize>,
    #[serde(default = "default_spaced")]
    pub spaced: Vec<bool>,
    /// Low end of the per-position threshold sweep, scaled by k-mer size
    /// and squared alphabet ratio.
    #[serde(default = "default_thr_min")]
    pub kmer_thr_per_pos_min: i32,
    /// High end of the per-position threshold sweep, scaled by k-mer size.
    #[serde(default = "default_thr_max")]
    pub kmer_thr_per_pos_max: i32,
    #[serde(default = "default_query_set_size")]
    pub query_set_size: usize,
}

fn default_alphabet_sizes() -> Vec<usize> {
    vec![21]
}

fn default_kmer_sizes() -> Vec<usize> {
    vec![6, 7]
}

fn default_spaced() -> Vec<bool> {
    vec![true]
}

fn default_thr_min() -> i32 {
    1
}

fn default_thr_max() -> i32 {
    25
}

fn default_query_set_size() -> usize {
    DEFAULT_QUERY_SET_SIZE
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            alphabet_sizes: default_alphabet_sizes(),
            kmer_sizes: default_kmer_sizes(),
            spaced: default_spaced(),
            kmer_thr_per_pos_min: default_thr_min(),
            kmer_thr_per_pos_max: default_thr_max(),
            query_set_size: default_query_set_size(),
        }
    }
}

/// Parse a calibration config from a TOML file.
pub fn parse_calibration_config(path: &Path) -> Result<CalibrationConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| SieveError::io(path, "read", e))?;
    toml::from_str(&contents).map_err(|e| {
        SieveError::validation(format!("failed to parse calibration config: {}", e))
    })
}

/// One logged calibration measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRecord {
    pub kmers_per_pos: f64,
    pub match_probability: f64,
    pub db_matches: u64,
    pub double_matches: u64,
    pub kmer_size: usize,
    pub alphabet_size: usize,
    pub spaced: bool,
    pub local: bool,
    pub threshold: i32,
    pub elapsed_secs: u64,
}

/// What to do with a completed timing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Too fast to be a meaningful sample; do not log it.
    Discard,
    /// Log the run and continue lowering the threshold.
    Record,
    /// Log the run, then abandon this threshold sweep.
    RecordAndBreak,
}

/// Timing decision for a run that took `elapsed_secs` whole seconds.
pub fn sweep_action(elapsed_secs: u64) -> SweepAction {
    if elapsed_secs <= MIN_TIMED_RUN_SECS {
        SweepAction::Discard
    } else if elapsed_secs >= MAX_SWEEP_RUN_SECS {
        SweepAction::RecordAndBreak
    } else {
        SweepAction::Record
    }
}

/// Population k-mer match probability from summed per-query statistics.
///
/// Local matching counts double (same-diagonal) matches and divides by a
/// fixed normalization constant on top of the length product; global-style
/// matching divides raw match counts by the length product alone. The two
/// regimes are deliberately not interchangeable.
pub fn kmer_match_probability(
    local: bool,
    db_matches: u64,
    double_matches: u64,
    query_len_sum: u64,
    target_len_sum: u64,
) -> f64 {
    let len_product = query_len_sum as f64 * target_len_sum as f64;
    if local {
        (double_matches as f64 / len_product) / LOCAL_MATCH_PROB_NORM
    } else {
        db_matches as f64 / len_product
    }
}

/// Run the full calibration sweep over a target database, appending one TSV
/// line per kept run to `log_path` and returning the kept records.
///
/// The query set is a fixed-seed sample of the target database itself. Each
/// threshold run matches every query in parallel with per-thread matchers
/// and reduces the statistics afterwards.
pub fn run_calibration(
    db_data: &Path,
    db_index: &Path,
    config: &CalibrationConfig,
    log_path: &Path,
) -> Result<Vec<CalibrationRecord>> {
    let reader = StoreReader::open(db_data, db_index)?;
    if reader.is_empty() {
        return Err(SieveError::validation(
            "calibration requires a non-empty target database",
        ));
    }
    let lens: Vec<u64> = reader.entries().iter().map(|e| e.len).collect();
    let target_len_sum: u64 = lens.iter().sum();
    let n = reader.len();

    let mut rng = StdRng::seed_from_u64(1);
    let count = config.query_set_size.min(n);
    let query_ids: Vec<usize> = (0..count).map(|_| rng.gen_range(0..n)).collect();
    let query_len_sum: u64 = query_ids.iter().map(|&i| lens[i]).sum();
    info!(
        "query set: {} sequences, {} residues; target: {} sequences, {} residues",
        count,
        query_len_sum,
        n,
        target_len_sum
    );

    let log_file = File::create(log_path).map_err(|e| SieveError::io(log_path, "create", e))?;
    let mut log_out = BufWriter::new(log_file);

    let mut records = Vec::new();
    for &a in &config.alphabet_sizes {
        let alphabet = Alphabet::for_size(a)?;
        let sub = if alphabet.groups().is_empty() {
            SubstitutionMatrix::uniform(a, 3, -1)
        } else {
            SubstitutionMatrix::blosum62(&alphabet)?
        };
        info!("building extended matrices for alphabet size {}", a);
        let two_mer = ExtendedSubstitutionMatrix::new(&sub, 2)?;
        let three_mer = ExtendedSubstitutionMatrix::new(&sub, 3)?;

        for &spaced in &config.spaced {
            for &k in &config.kmer_sizes {
                info!("calibrating a = {}, k = {}, spaced = {}", a, k, spaced);
                let table = build_table_for_range(&reader, &alphabet, k, spaced, 0..n)?;

                // Validate matcher parameters once; per-thread instances
                // below reuse the same validated inputs.
                QueryMatcher::new(&table, &two_mer, &three_mer, 0, MatchMode::Local)?;

                let thr_min = ((config.kmer_thr_per_pos_min * k as i32) as f32
                    * (a as f32 / 21.0).powi(2)) as i32;
                let thr_max = config.kmer_thr_per_pos_max * k as i32;
                let decr = if k >= 6 { 2 } else { 1 };
                info!("omitting runs with too short running time");

                let mut thr = thr_max;
                while thr >= thr_min {
                    let start = Instant::now();
                    let (kpp_sum, db_matches, double_matches) = query_ids
                        .par_iter()
                        .map_init(
                            || {
                                (
                                    Sequence::new(k, a, spaced)
                                        .expect("sequence parameters validated above"),
                                    QueryMatcher::new(
                                        &table,
                                        &two_mer,
                                        &three_mer,
                                        thr,
                                        MatchMode::Local,
                                    )
                                    .expect("matcher parameters validated above"),
                                )
                            },
                            |(seq, matcher), &qid| {
                                let data = reader
                                    .get_by_index(qid)
                                    .expect("query sampled from this store");
                                seq.map_sequence(qid as u32, &alphabet, data)
                                    .expect("target sequence already indexed");
                                let (_, stats) = matcher.match_query(seq, u32::MAX);
                                (stats.kmers_per_pos, stats.db_matches, stats.double_matches)
                            },
                        )
                        .reduce(
                            || (0.0f64, 0u64, 0u64),
                            |x, y| (x.0 + y.0, x.1 + y.1, x.2 + y.2),
                        );
                    let elapsed_secs = start.elapsed().as_secs();

                    let action = sweep_action(elapsed_secs);
                    if action == SweepAction::Discard {
                        thr -= decr;
                        continue;
                    }

                    let record = CalibrationRecord {
                        kmers_per_pos: kpp_sum / count as f64,
                        match_probability: kmer_match_probability(
                            true,
                            db_matches,
                            double_matches,
                            query_len_sum,
                            target_len_sum,
                        ),
                        db_matches,
                        double_matches,
                        kmer_size: k,
                        alphabet_size: a,
                        spaced,
                        local: true,
                        threshold: thr,
                        elapsed_secs,
                    };
                    info!(
                        "k-mer threshold {}: {:.4} k-mers/pos, match probability {:.3e}, {} s",
                        thr, record.kmers_per_pos, record.match_probability, elapsed_secs
                    );
                    write_record(&mut log_out, &record)
                        .map_err(|e| SieveError::io(log_path, "write", e))?;
                    records.push(record);

                    if action == SweepAction::RecordAndBreak {
                        info!("run exceeded {} s, moving to next parameters", MAX_SWEEP_RUN_SECS);
                        break;
                    }
                    thr -= decr;
                }
            }
        }
    }

    log_out
        .flush()
        .map_err(|e| SieveError::io(log_path, "flush", e))?;
    Ok(records)
}

fn write_record(out: &mut impl Write, r: &CalibrationRecord) -> std::io::Result<()> {
    writeln!(
        out,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        r.kmers_per_pos,
        r.match_probability,
        r.db_matches,
        r.double_matches,
        r.kmer_size,
        r.alphabet_size,
        r.spaced as i32,
        r.local as i32,
        r.threshold,
        r.elapsed_secs
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreWriter;
    use tempfile::TempDir;

    #[test]
    fn test_sweep_action_boundaries() {
        assert_eq!(sweep_action(0), SweepAction::Discard);
        assert_eq!(sweep_action(2), SweepAction::Discard);
        assert_eq!(sweep_action(3), SweepAction::Record);
        assert_eq!(sweep_action(1199), SweepAction::Record);
        assert_eq!(sweep_action(1200), SweepAction::RecordAndBreak);
        assert_eq!(sweep_action(1300), SweepAction::RecordAndBreak);
    }

    #[test]
    fn test_local_match_probability_normalization() {
        let p = kmer_match_probability(true, 0, 1000, 50_000, 2_000_000);
        let expected = 1000.0 / (50_000.0 * 2_000_000.0) / 256.0;
        assert_eq!(p, expected);
    }

    #[test]
    fn test_global_match_probability_unnormalized() {
        let p = kmer_match_probability(false, 1000, 0, 50_000, 2_000_000);
        let expected = 1000.0 / (50_000.0 * 2_000_000.0);
        assert_eq!(p, expected);
        // The two regimes differ by exactly the normalization constant.
        let local = kmer_match_probability(true, 0, 1000, 50_000, 2_000_000);
        assert_eq!(local * 256.0, p);
    }

    #[test]
    fn test_config_defaults() {
        let config: CalibrationConfig = toml::from_str("").unwrap();
        assert_eq!(config.alphabet_sizes, vec![21]);
        assert_eq!(config.kmer_sizes, vec![6, 7]);
        assert_eq!(config.spaced, vec![true]);
        assert_eq!(config.kmer_thr_per_pos_min, 1);
        assert_eq!(config.kmer_thr_per_pos_max, 25);
    }

    #[test]
    fn test_config_overrides() {
        let config: CalibrationConfig = toml::from_str(
            "alphabet_sizes = [4]\nkmer_sizes = [3]\nspaced = [false]\nquery_set_size = 10",
        )
        .unwrap();
        assert_eq!(config.alphabet_sizes, vec![4]);
        assert_eq!(config.kmer_sizes, vec![3]);
        assert_eq!(config.query_set_size, 10);
    }

    #[test]
    fn test_fast_runs_are_discarded_not_logged() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("db.dat");
        let index = dir.path().join("db.idx");
        let log = dir.path().join("calib.tsv");

        let mut writer = StoreWriter::create(&data, &index)?;
        writer.write(0, b"ACGTACGTACGTACGT")?;
        writer.write(1, b"TTGACATTGACATTGA")?;
        writer.finish()?;

        let config = CalibrationConfig {
            alphabet_sizes: vec![4],
            kmer_sizes: vec![3],
            spaced: vec![false],
            kmer_thr_per_pos_min: 1,
            kmer_thr_per_pos_max: 4,
            query_set_size: 2,
        };
        // A two-sequence sweep finishes far below the timing floor, so
        // every run is discarded and the log stays empty.
        let records = run_calibration(&data, &index, &config, &log)?;
        assert!(records.is_empty());
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "");
        Ok(())
    }
}
