use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use needletail::parse_fastx_file;
use rayon::prelude::*;

use seqsieve::calibrate::{parse_calibration_config, run_calibration, CalibrationConfig};
use seqsieve::container::{
    build_index, build_table_for_range, is_index_container, load_metadata, load_partition,
    IndexParams, MatchMode,
};
use seqsieve::logging::init_logger;
use seqsieve::matcher::{Candidate, QueryMatcher};
use seqsieve::matrix::{ExtendedSubstitutionMatrix, SubstitutionMatrix};
use seqsieve::sequence::{Alphabet, Sequence};
use seqsieve::store::{StoreReader, StoreWriter};
use seqsieve::table::IndexTable;

#[derive(Parser)]
#[command(name = "seqsieve")]
#[command(about = "K-mer prefiltering for sequence similarity search", long_about = None)]
struct Cli {
    /// Verbose progress logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert FASTA/FASTQ files into a sequence store
    Createdb {
        /// Input sequence files
        #[arg(short, long, required = true)]
        input: Vec<PathBuf>,

        /// Output store path (key index lands next to it)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Build a persistent k-mer index container from a sequence store
    Index {
        /// Source sequence store
        #[arg(short, long)]
        db: PathBuf,

        /// Output container path
        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, default_value_t = 6)]
        kmer_size: usize,

        #[arg(short, long, default_value_t = 21)]
        alphabet_size: usize,

        /// Number of partitions; raise to bound build memory
        #[arg(short, long, default_value_t = 1)]
        split: usize,

        /// Sample k-mer positions with a spaced pattern
        #[arg(long)]
        spaced: bool,
    },

    /// Find candidate similar target sequences for every query
    Search {
        /// Query sequence store
        #[arg(short, long)]
        query: PathBuf,

        /// Target sequence store
        #[arg(short, long)]
        db: PathBuf,

        /// Prebuilt index container; tables are rebuilt from the target
        /// store when this is absent or not a usable index
        #[arg(short, long)]
        index: Option<PathBuf>,

        #[arg(short, long, default_value_t = 6)]
        kmer_size: usize,

        #[arg(short, long, default_value_t = 21)]
        alphabet_size: usize,

        #[arg(long)]
        spaced: bool,

        /// Minimum k-mer similarity score for neighborhood expansion
        #[arg(short = 't', long, default_value_t = 15)]
        kmer_threshold: i32,

        /// Minimum double-match score for emitting a candidate
        #[arg(short, long, default_value_t = 1)]
        min_score: u32,

        /// Output TSV (query key, target key, score, diagonal)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Sweep index parameters against a target database
    Calibrate {
        /// Target sequence store
        #[arg(short, long)]
        db: PathBuf,

        /// TOML parameter grid; defaults are used when absent
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output TSV log
        #[arg(short, long)]
        log: PathBuf,
    },
}

/// Key-index path convention: the store's data path plus ".idx".
fn store_index_path(data: &Path) -> PathBuf {
    let mut name = data.as_os_str().to_os_string();
    name.push(".idx");
    PathBuf::from(name)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match cli.command {
        Commands::Createdb { input, output } => create_db(&input, &output),
        Commands::Index {
            db,
            output,
            kmer_size,
            alphabet_size,
            split,
            spaced,
        } => {
            let source = StoreReader::open(&db, &store_index_path(&db))
                .with_context(|| format!("failed to open sequence store '{}'", db.display()))?;
            let params = IndexParams {
                kmer_size,
                alphabet_size,
                split_count: split,
                spaced,
                match_mode: MatchMode::Local,
            };
            build_index(&source, &params, &output, &store_index_path(&output))
                .with_context(|| format!("failed to build index '{}'", output.display()))?;
            Ok(())
        }
        Commands::Search {
            query,
            db,
            index,
            kmer_size,
            alphabet_size,
            spaced,
            kmer_threshold,
            min_score,
            output,
        } => search(
            &query,
            &db,
            index.as_deref(),
            kmer_size,
            alphabet_size,
            spaced,
            kmer_threshold,
            min_score,
            &output,
        ),
        Commands::Calibrate { db, config, log } => {
            let config = match config {
                Some(path) => parse_calibration_config(&path)
                    .with_context(|| format!("failed to load config '{}'", path.display()))?,
                None => CalibrationConfig::default(),
            };
            let records = run_calibration(&db, &store_index_path(&db), &config, &log)
                .context("calibration failed")?;
            info!("calibration finished with {} recorded runs", records.len());
            Ok(())
        }
    }
}

fn create_db(inputs: &[PathBuf], output: &Path) -> Result<()> {
    let mut writer = StoreWriter::create(output, &store_index_path(output))
        .with_context(|| format!("failed to create store '{}'", output.display()))?;
    let mut id: u32 = 0;
    for input in inputs {
        let mut reader = parse_fastx_file(input)
            .with_context(|| format!("failed to open '{}'", input.display()))?;
        let mut file_count = 0u64;
        while let Some(record) = reader.next() {
            let record =
                record.with_context(|| format!("failed to parse '{}'", input.display()))?;
            writer.write(id, &record.seq())?;
            id = id
                .checked_add(1)
                .ok_or_else(|| anyhow!("sequence count exceeds u32 key space"))?;
            file_count += 1;
        }
        info!("{}: {} sequences", input.display(), file_count);
    }
    writer.finish()?;
    info!("wrote {} sequences to {}", id, output.display());
    Ok(())
}

/// Loaded or rebuilt tables plus the enumeration parameters they were
/// built with.
struct SearchTables {
    tables: Vec<IndexTable>,
    kmer_size: usize,
    alphabet_size: usize,
    spaced: bool,
}

fn open_tables(
    target: &StoreReader,
    index: Option<&Path>,
    kmer_size: usize,
    alphabet_size: usize,
    spaced: bool,
) -> Result<SearchTables> {
    if let Some(index_path) = index {
        match StoreReader::open(index_path, &store_index_path(index_path)) {
            Ok(container) if is_index_container(&container) => {
                let meta = load_metadata(&container)?;
                let mut tables = Vec::with_capacity(meta.split_count as usize);
                for step in 0..meta.split_count as u32 {
                    tables.push(load_partition(&container, step)?);
                }
                info!(
                    "loaded {} partition(s) from {}",
                    tables.len(),
                    index_path.display()
                );
                return Ok(SearchTables {
                    tables,
                    kmer_size: meta.kmer_size as usize,
                    alphabet_size: meta.alphabet_size as usize,
                    spaced: meta.spaced != 0,
                });
            }
            Ok(_) => warn!(
                "'{}' is not a usable index, rebuilding tables from the target store",
                index_path.display()
            ),
            Err(e) => warn!(
                "could not open index '{}' ({}), rebuilding tables from the target store",
                index_path.display(),
                e
            ),
        }
    }
    let alphabet = Alphabet::for_size(alphabet_size)?;
    let table = build_table_for_range(target, &alphabet, kmer_size, spaced, 0..target.len())?;
    Ok(SearchTables {
        tables: vec![table],
        kmer_size,
        alphabet_size,
        spaced,
    })
}

#[allow(clippy::too_many_arguments)]
fn search(
    query_path: &Path,
    db_path: &Path,
    index: Option<&Path>,
    kmer_size: usize,
    alphabet_size: usize,
    spaced: bool,
    kmer_threshold: i32,
    min_score: u32,
    output: &Path,
) -> Result<()> {
    let target = StoreReader::open(db_path, &store_index_path(db_path))
        .with_context(|| format!("failed to open target store '{}'", db_path.display()))?;
    let queries = StoreReader::open(query_path, &store_index_path(query_path))
        .with_context(|| format!("failed to open query store '{}'", query_path.display()))?;

    let search_tables = open_tables(&target, index, kmer_size, alphabet_size, spaced)?;
    let alphabet = Alphabet::for_size(search_tables.alphabet_size)?;
    let sub = if alphabet.groups().is_empty() {
        SubstitutionMatrix::uniform(alphabet.size(), 3, -1)
    } else {
        SubstitutionMatrix::blosum62(&alphabet)?
    };
    info!("building extended substitution matrices");
    let two_mer = ExtendedSubstitutionMatrix::new(&sub, 2)?;
    let three_mer = ExtendedSubstitutionMatrix::new(&sub, 3)?;

    // Validate the per-thread state once; worker threads construct the
    // same state from the same validated inputs.
    Sequence::new(
        search_tables.kmer_size,
        alphabet.size(),
        search_tables.spaced,
    )?;
    for table in &search_tables.tables {
        QueryMatcher::new(table, &two_mer, &three_mer, kmer_threshold, MatchMode::Local)?;
    }

    // One matcher per partition per worker; the tables and matrices are
    // shared read-only.
    let per_query: Vec<Vec<Candidate>> = (0..queries.len())
        .into_par_iter()
        .map_init(
            || {
                let seq = Sequence::new(
                    search_tables.kmer_size,
                    alphabet.size(),
                    search_tables.spaced,
                )
                .expect("table parameters validated at load");
                let matchers: Vec<QueryMatcher> = search_tables
                    .tables
                    .iter()
                    .map(|t| {
                        QueryMatcher::new(t, &two_mer, &three_mer, kmer_threshold, MatchMode::Local)
                            .expect("table parameters validated at load")
                    })
                    .collect();
                (seq, matchers)
            },
            |(seq, matchers), qidx| {
                let data = queries.get_by_index(qidx).expect("query index in range");
                seq.map_sequence(qidx as u32, &alphabet, data)
                    .expect("query maps into the alphabet");
                let mut all = Vec::new();
                for matcher in matchers.iter_mut() {
                    let (candidates, _) = matcher.match_query(seq, min_score);
                    all.extend(candidates);
                }
                all.sort_unstable_by(|a, b| b.score.cmp(&a.score).then(a.seq_id.cmp(&b.seq_id)));
                all
            },
        )
        .collect();

    let out_file =
        File::create(output).with_context(|| format!("failed to create '{}'", output.display()))?;
    let mut out = BufWriter::new(out_file);
    let mut emitted = 0u64;
    for (qidx, candidates) in per_query.iter().enumerate() {
        let query_key = queries.entries()[qidx].key;
        for c in candidates {
            let target_key = target
                .entries()
                .get(c.seq_id as usize)
                .map(|e| e.key)
                .ok_or_else(|| anyhow!("candidate id {} outside target store", c.seq_id))?;
            writeln!(out, "{}\t{}\t{}\t{}", query_key, target_key, c.score, c.diagonal)?;
            emitted += 1;
        }
    }
    out.flush()?;
    info!(
        "{} candidates for {} queries written to {}",
        emitted,
        queries.len(),
        output.display()
    );
    Ok(())
}
