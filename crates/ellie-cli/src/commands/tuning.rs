use chrono::Utc;
use console::style;
use std::path::PathBuf;
use std::sync::Arc;

use ellie_config::EllieConfig;
use ellie_core::{EllieError, Result};
use ellie_tuning::{
    AttemptStatus, EvalReport, Evaluator, FileConfigApplier, FixtureReplay, JsonlAuditLog, Tuner, load_applied,
    load_fixtures,
};

fn fmt_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"))
}

fn print_report(report: &EvalReport) {
    println!("Cases: {}", report.metrics.cases);
    for gate in &report.gates {
        let verdict = if gate.passed {
            style("pass").green()
        } else {
            style("FAIL").red().bold()
        };
        println!(
            "  {:<24} {:>8}  ({:?} {})  {}",
            gate.metric,
            fmt_metric(gate.value),
            gate.kind,
            gate.threshold,
            verdict
        );
    }
}

pub(super) fn cmd_evaluate(config: EllieConfig, fixtures: PathBuf, json: bool) -> Result<()> {
    let cases = load_fixtures(&fixtures)?;
    let report = Evaluator::new(config.evaluator.k, config.evaluator.gates.clone()).evaluate(&cases);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if report.passed {
        return Ok(());
    }
    let failed: Vec<&str> = report.failed_gates().map(|g| g.metric.as_str()).collect();
    Err(EllieError::Validation(format!("quality gates failed: {}", failed.join(", "))))
}

pub(super) async fn cmd_tune(config: EllieConfig, fixtures: PathBuf, json: bool) -> Result<()> {
    let cases = load_fixtures(&fixtures)?;
    let evaluator = Evaluator::new(config.evaluator.k, config.evaluator.gates.clone());
    let applied_path = config.tuner.applied_config_path.clone();
    let current = load_applied(&applied_path)?.unwrap_or_else(|| config.retrieval.tuning.clone());

    let tuner = Tuner::new(
        Arc::new(FixtureReplay::new(cases, evaluator)),
        Arc::new(FileConfigApplier::new(applied_path.clone())),
        Arc::new(JsonlAuditLog::new(config.tuner.audit_path.clone())),
        config.tuner.min_interval(),
    );
    let attempt = tuner.tune_once(&current, Utc::now()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&attempt)?);
        return Ok(());
    }
    println!("Tuning attempt {}: {}", attempt.id, attempt.status);
    if let Some(ref reason) = attempt.reason {
        println!("  reason: {reason}");
    }
    if let Some(ref m) = attempt.mutation {
        println!("  mutation: {:?} {} -> {}", m.param, m.from, m.to);
    }
    match attempt.status {
        AttemptStatus::Applied => println!("  written to {}", applied_path.display()),
        AttemptStatus::RollbackFailed => {
            return Err(EllieError::Store(
                attempt.error.unwrap_or_else(|| "rollback failed".into()),
            ));
        }
        _ => {}
    }
    Ok(())
}
