use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use ellie_core::{Result, TunerConfig};

use crate::evaluator::EvalReport;
use crate::tuner::Mutation;

/// Terminal state of one tuning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Applied,
    Skipped,
    RateLimited,
    RolledBack,
    RollbackFailed,
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttemptStatus::Applied => "applied",
            AttemptStatus::Skipped => "skipped",
            AttemptStatus::RateLimited => "rate_limited",
            AttemptStatus::RolledBack => "rolled_back",
            AttemptStatus::RollbackFailed => "rollback_failed",
        };
        f.write_str(s)
    }
}

/// One audit record, written whatever the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningAttempt {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub baseline: TunerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<TunerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation: Option<Mutation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_report: Option<EvalReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_report: Option<EvalReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TuningAttempt {
    pub fn new(status: AttemptStatus, baseline: TunerConfig, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            at,
            status,
            reason: None,
            baseline,
            candidate: None,
            mutation: None,
            baseline_report: None,
            candidate_report: None,
            error: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

/// Append-only record of tuning attempts.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, attempt: &TuningAttempt) -> Result<()>;

    /// Timestamp of the most recent `applied` attempt.
    async fn last_applied_at(&self) -> Result<Option<DateTime<Utc>>>;
}

/// NDJSON audit file, one attempt per line.
pub struct JsonlAuditLog {
    path: PathBuf,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every readable attempt, oldest first. Corrupt lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<TuningAttempt>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut attempts = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TuningAttempt>(line) {
                Ok(a) => attempts.push(a),
                Err(e) => warn!(path = %self.path.display(), line = idx + 1, error = %e, "unreadable audit record"),
            }
        }
        Ok(attempts)
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn record(&self, attempt: &TuningAttempt) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut line = serde_json::to_string(attempt)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn last_applied_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .read_all()
            .await?
            .iter()
            .filter(|a| a.status == AttemptStatus::Applied)
            .map(|a| a.at)
            .max())
    }
}
