//! Gated hill-climbing over the retrieval tuning knobs.
//!
//! One attempt mutates a single parameter by one step, evaluates baseline and
//! candidate, and applies the candidate only when it clears its own gates,
//! regresses no core metric and improves at least one. Sensitivity and scope
//! are copied through untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use ellie_core::{Result, TunerConfig};

use crate::audit::{AttemptStatus, AuditLog, TuningAttempt};
use crate::evaluator::{EvalMetrics, EvalReport};

/// Lowest minimum relevance the tuner will ever set.
pub const MIN_RELEVANCE_FLOOR: f64 = 0.50;
pub const MIN_RELEVANCE_CEILING: f64 = 0.95;
pub const MIN_RELEVANCE_STEP: f64 = 0.02;
pub const MAX_RESULTS_RANGE: (usize, usize) = (1, 10);
pub const MAX_CHARS_RANGE: (usize, usize) = (400, 4000);
pub const MAX_CHARS_STEP: usize = 200;

/// Difference below which two metric values count as equal.
const EPSILON: f64 = 1e-9;

/// Source of randomness for parameter and direction choice.
pub trait RandomSource: Send + Sync {
    fn next_u64(&self) -> u64;
}

/// Thread-local RNG from `rand`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_u64(&self) -> u64 {
        rand::random::<u64>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunedParam {
    MinRelevance,
    MaxResults,
    MaxChars,
}

impl TunedParam {
    pub const ALL: [TunedParam; 3] = [TunedParam::MinRelevance, TunedParam::MaxResults, TunedParam::MaxChars];
}

/// A single-parameter change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub param: TunedParam,
    pub from: f64,
    pub to: f64,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Clamp every tunable knob into its bounds.
pub fn normalize(config: &TunerConfig) -> TunerConfig {
    let min_relevance = if config.min_relevance.is_finite() {
        round2(config.min_relevance.clamp(MIN_RELEVANCE_FLOOR, MIN_RELEVANCE_CEILING))
    } else {
        MIN_RELEVANCE_FLOOR
    };
    TunerConfig {
        min_relevance,
        max_results: config.max_results.clamp(MAX_RESULTS_RANGE.0, MAX_RESULTS_RANGE.1),
        max_chars: config.max_chars.clamp(MAX_CHARS_RANGE.0, MAX_CHARS_RANGE.1),
        sensitivity: config.sensitivity,
        scope: config.scope,
    }
}

fn step_f64(value: f64, up: bool, lo: f64, hi: f64) -> Option<f64> {
    let next = |up: bool| round2(if up { value + MIN_RELEVANCE_STEP } else { value - MIN_RELEVANCE_STEP });
    [up, !up]
        .into_iter()
        .map(next)
        .find(|v| *v >= lo - EPSILON && *v <= hi + EPSILON)
}

fn step_usize(value: usize, step: usize, up: bool, lo: usize, hi: usize) -> Option<usize> {
    let next = |up: bool| if up { value.checked_add(step) } else { value.checked_sub(step) };
    [up, !up]
        .into_iter()
        .filter_map(next)
        .find(|v| (lo..=hi).contains(v))
}

/// Move one randomly chosen knob one step in a random direction, flipping
/// direction at a bound. `None` when the chosen knob cannot move at all.
pub fn mutate(config: &TunerConfig, rng: &dyn RandomSource) -> Option<(TunerConfig, Mutation)> {
    let param = TunedParam::ALL[(rng.next_u64() % TunedParam::ALL.len() as u64) as usize];
    let up = rng.next_u64() % 2 == 0;
    let mut candidate = config.clone();

    let (from, to) = match param {
        TunedParam::MinRelevance => {
            let to = step_f64(config.min_relevance, up, MIN_RELEVANCE_FLOOR, MIN_RELEVANCE_CEILING)?;
            candidate.min_relevance = to;
            (config.min_relevance, to)
        }
        TunedParam::MaxResults => {
            let to = step_usize(config.max_results, 1, up, MAX_RESULTS_RANGE.0, MAX_RESULTS_RANGE.1)?;
            candidate.max_results = to;
            (config.max_results as f64, to as f64)
        }
        TunedParam::MaxChars => {
            let to = step_usize(config.max_chars, MAX_CHARS_STEP, up, MAX_CHARS_RANGE.0, MAX_CHARS_RANGE.1)?;
            candidate.max_chars = to;
            (config.max_chars as f64, to as f64)
        }
    };
    Some((candidate, Mutation { param, from, to }))
}

/// Outcome of comparing a candidate report to the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Apply,
    Skip(&'static str),
}

#[derive(Clone, Copy)]
enum Direction {
    Higher,
    Lower,
}

fn core_metrics(m: &EvalMetrics) -> [(Option<f64>, Direction); 4] {
    [
        (m.precision_at_k, Direction::Higher),
        (m.false_injection_rate, Direction::Lower),
        (m.recovery_success_rate, Direction::Higher),
        (m.p95_latency_ms, Direction::Lower),
    ]
}

/// Positive when `candidate` is better than `baseline`, negative when worse.
fn delta(baseline: Option<f64>, candidate: Option<f64>, direction: Direction) -> f64 {
    match (baseline, candidate) {
        (Some(b), Some(c)) => match direction {
            Direction::Higher => c - b,
            Direction::Lower => b - c,
        },
        _ => 0.0,
    }
}

pub fn decide(baseline: &EvalReport, candidate: &EvalReport) -> Decision {
    if !candidate.passed {
        return Decision::Skip("candidate_failed_gates");
    }
    let deltas: Vec<f64> = core_metrics(&baseline.metrics)
        .iter()
        .zip(core_metrics(&candidate.metrics).iter())
        .map(|((b, dir), (c, _))| delta(*b, *c, *dir))
        .collect();
    if deltas.iter().any(|d| *d < -EPSILON) {
        return Decision::Skip("regression");
    }
    if !deltas.iter().any(|d| *d > EPSILON) {
        return Decision::Skip("no_objective_improvement");
    }
    Decision::Apply
}

/// Scores a tuning config, usually by replaying labeled fixtures.
#[async_trait]
pub trait Evaluate: Send + Sync {
    async fn evaluate(&self, config: &TunerConfig) -> Result<EvalReport>;
}

/// Makes a tuning config live.
#[async_trait]
pub trait ConfigApplier: Send + Sync {
    async fn apply(&self, config: &TunerConfig) -> Result<()>;
}

pub struct Tuner {
    evaluator: Arc<dyn Evaluate>,
    applier: Arc<dyn ConfigApplier>,
    audit: Arc<dyn AuditLog>,
    rng: Arc<dyn RandomSource>,
    min_interval: chrono::Duration,
}

impl Tuner {
    pub fn new(
        evaluator: Arc<dyn Evaluate>,
        applier: Arc<dyn ConfigApplier>,
        audit: Arc<dyn AuditLog>,
        min_interval: std::time::Duration,
    ) -> Self {
        Self {
            evaluator,
            applier,
            audit,
            rng: Arc::new(ThreadRandom),
            min_interval: chrono::Duration::from_std(min_interval).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn with_rng(mut self, rng: Arc<dyn RandomSource>) -> Self {
        self.rng = rng;
        self
    }

    /// Run one tuning attempt against `current` and record it.
    pub async fn tune_once(&self, current: &TunerConfig, now: DateTime<Utc>) -> Result<TuningAttempt> {
        let baseline = normalize(current);

        if let Some(last) = self.audit.last_applied_at().await? {
            if now.signed_duration_since(last) < self.min_interval {
                info!(last_applied = %last, "tuning rate limited");
                return self
                    .finish(TuningAttempt::new(AttemptStatus::RateLimited, baseline, now).with_reason("rate_limited"))
                    .await;
            }
        }

        let Some((candidate, mutation)) = mutate(&baseline, self.rng.as_ref()) else {
            return self
                .finish(TuningAttempt::new(AttemptStatus::Skipped, baseline, now).with_reason("no_mutation"))
                .await;
        };

        let mut attempt = TuningAttempt::new(AttemptStatus::Skipped, baseline.clone(), now);
        attempt.candidate = Some(candidate.clone());
        attempt.mutation = Some(mutation);

        let reports = match self.evaluator.evaluate(&baseline).await {
            Ok(b) => self.evaluator.evaluate(&candidate).await.map(|c| (b, c)),
            Err(e) => Err(e),
        };
        let (baseline_report, candidate_report) = match reports {
            Ok(r) => r,
            Err(e) => {
                attempt.reason = Some("evaluation_failed".into());
                attempt.error = Some(e.to_string());
                self.audit.record(&attempt).await?;
                return Err(e);
            }
        };
        let decision = decide(&baseline_report, &candidate_report);
        attempt.baseline_report = Some(baseline_report);
        attempt.candidate_report = Some(candidate_report);

        match decision {
            Decision::Skip(reason) => {
                attempt.reason = Some(reason.into());
            }
            Decision::Apply => match self.applier.apply(&candidate).await {
                Ok(()) => attempt.status = AttemptStatus::Applied,
                Err(apply_err) => {
                    warn!(error = %apply_err, "applying tuned config failed, rolling back");
                    attempt.reason = Some("apply_failed".into());
                    match self.applier.apply(&baseline).await {
                        Ok(()) => {
                            attempt.status = AttemptStatus::RolledBack;
                            attempt.error = Some(apply_err.to_string());
                        }
                        Err(rollback_err) => {
                            attempt.status = AttemptStatus::RollbackFailed;
                            attempt.error = Some(format!("{apply_err}; rollback: {rollback_err}"));
                        }
                    }
                }
            },
        }
        self.finish(attempt).await
    }

    async fn finish(&self, attempt: TuningAttempt) -> Result<TuningAttempt> {
        self.audit.record(&attempt).await?;
        info!(
            status = %attempt.status,
            reason = attempt.reason.as_deref().unwrap_or(""),
            param = ?attempt.mutation.as_ref().map(|m| m.param),
            "tuning attempt recorded"
        );
        Ok(attempt)
    }
}
