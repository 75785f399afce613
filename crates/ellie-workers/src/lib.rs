//! # ellie-workers
//!
//! The write side of the memory engine. Each worker is an independent
//! cooperative polling loop that processes one bounded batch per run and
//! coordinates with the others only through the store:
//!
//! - **Ingestion**: chat messages → candidate memories, per-room cursors.
//! - **Dedup**: near-duplicate clusters → LLM-reviewed keep/deprecate/merge.
//! - **Taxonomy**: unclassified memories → validated taxonomy paths.
//! - **Synthesis**: frequently mentioned entities → one canonical definition.
//! - **Backfill**: memories without vectors → embeddings.

pub mod backfill;
pub mod dedup;
pub mod ingestion;
pub mod runner;
pub mod synthesis;
pub mod taxonomy;

pub use backfill::{BackfillStore, BackfillWorker};
pub use dedup::{DedupApplication, DedupStore, DedupWorker, LlmDedupReviewer};
pub use ingestion::{IngestionStore, IngestionWorker, extractor_from_config};
pub use runner::{Worker, run_worker, spawn_worker};
pub use synthesis::{LlmSynthesizer, SynthesisStore, SynthesisWorker, SynthesisWrite, Synthesizer};
pub use taxonomy::{Assignment, LlmTaxonomyClassifier, TaxonomyStore, TaxonomyWorker};
