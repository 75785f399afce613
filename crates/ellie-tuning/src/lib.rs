//! # ellie-tuning
//!
//! Offline quality loop for retrieval: labeled fixtures are scored against
//! quality gates, and the tuner hill-climbs the retrieval knobs one step at a
//! time, applying only strictly better, non-regressing configs and writing an
//! audit record for every attempt.

pub mod applier;
pub mod audit;
pub mod evaluator;
pub mod fixture;
pub mod replay;
pub mod tuner;

pub use applier::{FileConfigApplier, load_applied};
pub use audit::{AttemptStatus, AuditLog, JsonlAuditLog, TuningAttempt};
pub use evaluator::{EvalMetrics, EvalReport, Evaluator, GateResult, check_gates, compute_metrics};
pub use fixture::{EvalCase, ScoredId, load_fixtures, parse_fixtures};
pub use replay::{FixtureReplay, replay_case};
pub use tuner::{ConfigApplier, Decision, Evaluate, Mutation, RandomSource, ThreadRandom, TunedParam, Tuner, decide, mutate, normalize};
