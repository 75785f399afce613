//! # ellie-config
//!
//! Configuration system for the Ellie memory engine. Reads from `ellie.toml`
//! and environment variables, in that precedence order, then validates.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::EllieConfig;
pub use schema::{ConfigWarning, QualityGates, WarningSeverity};
