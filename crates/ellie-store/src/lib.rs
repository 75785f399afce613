//! # ellie-store
//!
//! SQLite persistence for the memory engine. A single [`SqliteStore`]
//! implements every store capability the workers and the retrieval layer
//! declare:
//!
//! - **Memories**: active/deprecated rows with supersession pointers and vectors.
//! - **Chat**: raw messages plus per-room ingestion cursors.
//! - **Curation**: taxonomy assignments, the dedup reviewed-pairs ledger,
//!   entity mentions and synthesized definitions.
//! - **Retrieval**: lexical search, strategy versions and the injection ledger.

pub mod retrieval;
pub mod store;
pub mod workers;

pub use store::SqliteStore;
