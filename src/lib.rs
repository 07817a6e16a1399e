//! seqsieve: the prefiltering stage of a sequence-similarity search engine.
//!
//! Builds a disk-persisted, memory-mappable inverted index keyed by short
//! fixed-length k-mers over a sequence database, and uses it to find
//! candidate similar sequences for a query before any alignment is run.
//!
//! # Pipeline
//!
//! source store -> [`container::build_index`] (partitioned) ->
//! index container -> [`container::load_partition`] (memory-mapped) ->
//! [`table::IndexTable`] -> [`matcher::QueryMatcher`] -> candidates.
//!
//! [`calibrate`] closes the loop: it sweeps k-mer length, alphabet size,
//! and match-score threshold against a real database to pick an operating
//! point balancing sensitivity and speed.

pub mod calibrate;
pub mod container;
pub mod error;
pub mod logging;
pub mod lookup;
pub mod matcher;
pub mod matrix;
pub mod sequence;
pub mod store;
pub mod table;

pub(crate) mod constants;

pub use constants::{INDEX_FORMAT_VERSION, MAX_SWEEP_RUN_SECS, MIN_TIMED_RUN_SECS};
pub use container::{
    build_index, is_index_container, load_metadata, load_partition, IndexMeta, IndexParams,
    MatchMode,
};
pub use error::{Result, SieveError};
pub use matcher::{Candidate, QueryMatcher, QueryStats};
pub use table::{IndexTable, Posting};
