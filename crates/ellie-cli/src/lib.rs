//! # ellie-cli
//!
//! Command-line interface for the Ellie memory engine.
//!
//! ## Commands
//!
//! - `ellie run`: Run the background workers until Ctrl-C
//! - `ellie retrieve`: Answer a query through the retrieval cascade
//! - `ellie plan`: Show the retrieval plan for a query
//! - `ellie inject`: Decide what to surface proactively for a message
//! - `ellie evaluate`: Check labeled cases against the quality gates
//! - `ellie tune`: Run one gated tuning attempt
//! - `ellie config`: Show configuration

pub mod commands;

pub use commands::Cli;
