//! # ellie-retrieval
//!
//! Read side of the memory engine:
//!
//! - **Cascade**: room context, then project + org memories, then chat
//!   history, then raw JSONL logs, stopping at the first tier with results.
//! - **Plan**: an org's retrieval strategy rendered for one query.
//! - **Injection**: scoring and bundling of memories surfaced unsolicited
//!   into a live room, with per-room cooldown.

pub mod cascade;
pub mod injection;
pub mod injector;
pub mod logscan;
pub mod plan;

pub use cascade::{
    LogHit, LogScanner, MemoryHit, RetrievalCascade, RetrievalItem, RetrievalOutcome, RetrievalRequest,
    RetrievalStore, Tier,
};
pub use injection::{InjectionBundle, InjectionCandidate, ScoredCandidate, build_bundle, render_bundle, score_candidate};
pub use injector::{CandidateSource, InjectionRecord, InjectionStore, ProactiveInjector};
pub use logscan::JsonlLogScanner;
pub use plan::{
    PlanScope, PlanStep, RetrievalPlan, RetrievalPlanner, RetrievalStrategy, StrategyStep, StrategyStore,
    TopicExpansion, build_plan,
};
