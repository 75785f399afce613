use ellie_core::TunerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration, maps to `ellie.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EllieConfig {
    pub store: StoreConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub ingestion: IngestionConfig,
    pub dedup: DedupConfig,
    pub taxonomy: TaxonomyConfig,
    pub synthesis: SynthesisConfig,
    pub backfill: BackfillConfig,
    pub retrieval: RetrievalConfig,
    pub injection: InjectionConfig,
    pub evaluator: EvaluatorConfig,
    pub tuner: TunerSettings,
    pub logging: LoggingConfig,
}

// ── Store ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("ellie.db"),
        }
    }
}

// ── LLM gateway ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL of the gateway.
    pub base_url: String,
    /// Model used for extraction, dedup review, classification and synthesis.
    pub model: String,
    /// API key. Falls back to `OPENAI_API_KEY` when unset.
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
            timeout_secs: 60,
            temperature: 0.0,
            max_tokens: 2048,
        }
    }
}

// ── Embeddings ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "openai" or "ollama".
    pub provider: String,
    pub model: String,
    /// Expected vector length; responses of any other length are rejected.
    pub dims: usize,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "text-embedding-3-small".into(),
            dims: 1536,
            base_url: None,
            api_key: None,
        }
    }
}

// ── Workers ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    /// Messages fetched per room per run.
    pub batch_size: usize,
    pub max_rooms_per_run: usize,
    /// Messages shorter than this are treated as low-signal.
    pub min_message_chars: usize,
    /// Memory content is truncated to this many characters.
    pub max_content_chars: usize,
    /// "heuristic" or "llm".
    pub extractor: String,
    /// Character ceiling of one extraction prompt.
    pub window_char_budget: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 15,
            batch_size: 200,
            max_rooms_per_run: 50,
            min_message_chars: 20,
            max_content_chars: 2000,
            extractor: "heuristic".into(),
            window_char_budget: 24_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    /// Minimum cosine similarity for two memories to be a candidate pair.
    pub similarity_threshold: f32,
    /// Upper bound on memories scanned per org per run (the scan is O(n²)).
    pub max_scan_memories: usize,
    pub max_clusters_per_run: usize,
    /// A cluster whose review failed is not reviewed again for this long.
    pub retry_after_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 300,
            similarity_threshold: 0.88,
            max_scan_memories: 500,
            max_clusters_per_run: 20,
            retry_after_secs: 21_600,
        }
    }
}

impl DedupConfig {
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxonomyConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    /// Extra LLM attempts after the first malformed answer.
    pub max_retries: u32,
    /// A memory whose attempts were all malformed waits this long before the
    /// next try, behind memories never attempted.
    pub retry_after_secs: u64,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 60,
            batch_size: 25,
            max_retries: 2,
            retry_after_secs: 3600,
        }
    }
}

impl TaxonomyConfig {
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    /// Entities need at least this many mentions before synthesis.
    pub min_mentions: u32,
    /// Source memories fed into one synthesis prompt.
    pub max_sources: usize,
    pub batch_size: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 600,
            min_mentions: 3,
            max_sources: 20,
            batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub batch_size: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 30,
            batch_size: 32,
        }
    }
}

// ── Retrieval & injection ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Used when a caller asks for zero results.
    pub default_limit: usize,
    /// Snippets are truncated to this many characters.
    pub snippet_chars: usize,
    /// Directory of raw `*.jsonl` logs scanned as the last resort tier. Per-org
    /// logs live in `<log_dir>/<org_id>/`; shared files at the top need `org_id` tags.
    pub log_dir: Option<PathBuf>,
    /// Knobs the tuner is allowed to move.
    pub tuning: TunerConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            snippet_chars: 280,
            log_dir: None,
            tuning: TunerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// A memory injected into a room is not injected there again for this long.
    pub cooldown_secs: u64,
    /// Candidates fetched before scoring.
    pub candidate_limit: usize,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 6 * 60 * 60,
            candidate_limit: 25,
        }
    }
}

// ── Evaluation & tuning ────────────────────────────────────────

/// Pass/fail thresholds every evaluator metric must clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGates {
    pub min_precision_at_k: f64,
    pub max_false_injection_rate: f64,
    pub min_recovery_success_rate: f64,
    pub max_p95_latency_ms: f64,
    pub min_ellie_precision: f64,
    pub min_ellie_recall: f64,
}

impl Default for QualityGates {
    fn default() -> Self {
        Self {
            min_precision_at_k: 0.60,
            max_false_injection_rate: 0.10,
            min_recovery_success_rate: 0.90,
            max_p95_latency_ms: 1500.0,
            min_ellie_precision: 0.50,
            min_ellie_recall: 0.50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// K of precision@K.
    pub k: usize,
    pub gates: QualityGates,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            k: 5,
            gates: QualityGates::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerSettings {
    /// No tuning attempt within this window after an applied change.
    pub min_interval_secs: u64,
    /// Append-only NDJSON audit log of tuning attempts.
    pub audit_path: PathBuf,
    /// Where an applied `[retrieval.tuning]` section is written.
    pub applied_config_path: PathBuf,
}

impl TunerSettings {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            min_interval_secs: 6 * 60 * 60,
            audit_path: PathBuf::from("tuning-audit.jsonl"),
            applied_config_path: PathBuf::from("retrieval-tuning.toml"),
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
        };
        write!(f, "{} {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " ({})", h)?;
        }
        Ok(())
    }
}

impl EllieConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();
        let error = |field: &str, message: String, hint: Option<&str>| ConfigWarning {
            field: field.into(),
            message,
            severity: WarningSeverity::Error,
            hint: hint.map(String::from),
        };

        // ── Embeddings ───
        if self.embedding.dims == 0 {
            warnings.push(error("embedding.dims", "dims is 0".into(), Some("Set to the model's vector length, e.g. 1536")));
        }
        let valid_providers = ["openai", "ollama"];
        if !valid_providers.contains(&self.embedding.provider.as_str()) {
            warnings.push(error(
                "embedding.provider",
                format!("unknown provider '{}'", self.embedding.provider),
                Some("Valid values: openai, ollama"),
            ));
        }

        // ── Ingestion ───
        let valid_extractors = ["heuristic", "llm"];
        if !valid_extractors.contains(&self.ingestion.extractor.as_str()) {
            warnings.push(error(
                "ingestion.extractor",
                format!("unknown extractor '{}'", self.ingestion.extractor),
                Some("Valid values: heuristic, llm"),
            ));
        }
        if self.ingestion.batch_size == 0 {
            warnings.push(error("ingestion.batch_size", "batch_size is 0".into(), None));
        }
        if self.ingestion.window_char_budget < self.ingestion.max_content_chars + 2048 {
            warnings.push(error(
                "ingestion.window_char_budget",
                format!(
                    "budget {} cannot hold one message of {} chars plus the prompt header",
                    self.ingestion.window_char_budget, self.ingestion.max_content_chars
                ),
                Some("Raise the budget or lower ingestion.max_content_chars"),
            ));
        }

        // ── Dedup ───
        let t = self.dedup.similarity_threshold;
        if !(0.0..=1.0).contains(&t) {
            warnings.push(error("dedup.similarity_threshold", format!("threshold {t} is out of range"), Some("Must be between 0.0 and 1.0")));
        } else if t < 0.8 {
            warnings.push(ConfigWarning {
                field: "dedup.similarity_threshold".into(),
                message: format!("threshold {t} is low, unrelated memories may be clustered"),
                severity: WarningSeverity::Warning,
                hint: Some("0.85 - 0.92 is typical".into()),
            });
        }
        if self.dedup.max_scan_memories > 5_000 {
            warnings.push(ConfigWarning {
                field: "dedup.max_scan_memories".into(),
                message: format!("{} memories per run means {} comparisons", self.dedup.max_scan_memories, self.dedup.max_scan_memories.pow(2) / 2),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Retrieval tuning ───
        let tuning = &self.retrieval.tuning;
        if !(0.0..=1.0).contains(&tuning.min_relevance) {
            warnings.push(error("retrieval.tuning.min_relevance", format!("{} is out of range", tuning.min_relevance), None));
        }
        if tuning.max_results == 0 || tuning.max_results > 10 {
            warnings.push(error("retrieval.tuning.max_results", format!("{} is out of range", tuning.max_results), Some("Must be between 1 and 10")));
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
