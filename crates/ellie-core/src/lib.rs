//! # ellie-core
//!
//! Core types, errors, and primitives for the Ellie long-term memory engine.
//! This crate defines the shared vocabulary used by every other crate in the workspace:
//! memories, chat messages, taxonomy nodes, entities, and the retrieval tuning knobs.

pub mod error;
pub mod similarity;
pub mod text;
pub mod types;

pub use error::{EllieError, Result};
pub use similarity::cosine_similarity;
pub use types::*;
