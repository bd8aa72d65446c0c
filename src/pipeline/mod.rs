//! Change-event pipeline.
//!
//! - `dedup`: in-batch textual deduplication
//! - `resolver`: cross-time duplicate resolution over embeddings
//! - `orchestrator`: one ingest event in, persisted change events out

pub mod dedup;
pub mod orchestrator;
pub mod resolver;

pub use dedup::{dedupe, jaccard, token_set};
pub use orchestrator::{AnalysisPhases, IngestProcessor, Orchestrator};
pub use resolver::{Decision, DuplicateResolver, FLAG_THRESHOLD, MERGE_THRESHOLD, Resolution, decide};
