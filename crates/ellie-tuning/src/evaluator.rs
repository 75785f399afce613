//! Retrieval quality metrics and their gates.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use ellie_config::QualityGates;

use crate::fixture::EvalCase;

/// Aggregated metrics. `None` means no case applied to the metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub cases: usize,
    pub precision_at_k: Option<f64>,
    pub false_injection_rate: Option<f64>,
    pub recovery_success_rate: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub ellie_precision: Option<f64>,
    pub ellie_recall: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    AtLeast,
    AtMost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub metric: String,
    pub value: Option<f64>,
    pub threshold: f64,
    pub kind: GateKind,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub metrics: EvalMetrics,
    pub gates: Vec<GateResult>,
    pub passed: bool,
}

impl EvalReport {
    pub fn failed_gates(&self) -> impl Iterator<Item = &GateResult> {
        self.gates.iter().filter(|g| !g.passed)
    }
}

fn ratio(num: f64, den: f64) -> Option<f64> {
    if den > 0.0 { Some(num / den) } else { None }
}

fn mean(values: &[f64]) -> Option<f64> {
    ratio(values.iter().sum(), values.len() as f64)
}

/// Nearest-rank percentile of an unsorted sample.
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

/// Hits among the top `k` retrieved ids, divided by `k`.
pub fn precision_at_k(case: &EvalCase, k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    let relevant: HashSet<&str> = case.relevant_ids.iter().map(String::as_str).collect();
    let hits = case
        .retrieved_ids
        .iter()
        .take(k)
        .filter(|id| relevant.contains(id.as_str()))
        .count();
    hits as f64 / k as f64
}

pub fn compute_metrics(cases: &[EvalCase], k: usize) -> EvalMetrics {
    let triggering: Vec<&EvalCase> = cases.iter().filter(|c| c.should_inject).collect();
    let quiet: Vec<&EvalCase> = cases.iter().filter(|c| !c.should_inject).collect();
    let recoveries: Vec<&EvalCase> = cases.iter().filter(|c| c.recovery_attempted).collect();

    let precisions: Vec<f64> = triggering.iter().map(|c| precision_at_k(c, k)).collect();
    let false_injections = quiet.iter().filter(|c| c.injected).count();
    let recovered = recoveries.iter().filter(|c| c.recovered).count();
    let latencies: Vec<f64> = cases.iter().map(|c| c.latency_ms).collect();

    let injected: u64 = triggering.iter().map(|c| c.injected_count).sum();
    let referenced: u64 = triggering.iter().map(|c| c.referenced_count).sum();
    let missed: u64 = triggering.iter().map(|c| c.missed_count).sum();

    EvalMetrics {
        cases: cases.len(),
        precision_at_k: mean(&precisions),
        false_injection_rate: ratio(false_injections as f64, quiet.len() as f64),
        recovery_success_rate: ratio(recovered as f64, recoveries.len() as f64),
        p95_latency_ms: percentile(&latencies, 95.0),
        ellie_precision: ratio(referenced as f64, injected as f64),
        ellie_recall: ratio(referenced as f64, (referenced + missed) as f64),
    }
}

fn gate(metric: &str, value: Option<f64>, threshold: f64, kind: GateKind) -> GateResult {
    let passed = match (value, kind) {
        (None, _) => true,
        (Some(v), GateKind::AtLeast) => v >= threshold,
        (Some(v), GateKind::AtMost) => v <= threshold,
    };
    GateResult {
        metric: metric.to_string(),
        value,
        threshold,
        kind,
        passed,
    }
}

pub fn check_gates(metrics: &EvalMetrics, gates: &QualityGates) -> Vec<GateResult> {
    use GateKind::{AtLeast, AtMost};
    vec![
        gate("precision_at_k", metrics.precision_at_k, gates.min_precision_at_k, AtLeast),
        gate(
            "false_injection_rate",
            metrics.false_injection_rate,
            gates.max_false_injection_rate,
            AtMost,
        ),
        gate(
            "recovery_success_rate",
            metrics.recovery_success_rate,
            gates.min_recovery_success_rate,
            AtLeast,
        ),
        gate("p95_latency_ms", metrics.p95_latency_ms, gates.max_p95_latency_ms, AtMost),
        gate("ellie_precision", metrics.ellie_precision, gates.min_ellie_precision, AtLeast),
        gate("ellie_recall", metrics.ellie_recall, gates.min_ellie_recall, AtLeast),
    ]
}

/// Computes metrics over labeled cases and checks them against fixed gates.
#[derive(Debug, Clone)]
pub struct Evaluator {
    k: usize,
    gates: QualityGates,
}

impl Evaluator {
    pub fn new(k: usize, gates: QualityGates) -> Self {
        Self { k: k.max(1), gates }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn evaluate(&self, cases: &[EvalCase]) -> EvalReport {
        let metrics = compute_metrics(cases, self.k);
        let gates = check_gates(&metrics, &self.gates);
        let passed = gates.iter().all(|g| g.passed);
        EvalReport { metrics, gates, passed }
    }
}
