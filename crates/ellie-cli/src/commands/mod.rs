use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use ellie_config::{ConfigLoader, EllieConfig};
use ellie_core::{EllieError, Result};
use ellie_llm::embedding::{OllamaEmbedding, OpenAiEmbedding};
use ellie_llm::{EmbeddingProvider, LlmGateway, OpenAiGateway};
use ellie_store::SqliteStore;

mod retrieve;
mod run;
mod tuning;

/// Ellie: long-term memory and retrieval engine for multi-agent conversations
#[derive(Parser)]
#[command(name = "ellie", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to ellie.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background workers (ingestion, dedup, taxonomy, synthesis, backfill) until Ctrl-C
    Run {
        /// Run every enabled worker once and exit
        #[arg(long)]
        once: bool,
    },
    /// Answer a query through the retrieval cascade
    Retrieve {
        /// Org to search
        org: Uuid,
        /// Free-text query
        query: String,
        /// Room the query comes from
        #[arg(long)]
        room: Option<Uuid>,
        /// Project the query belongs to
        #[arg(long)]
        project: Option<Uuid>,
        /// Maximum results (0 uses retrieval.default_limit)
        #[arg(short = 'n', long, default_value = "0")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the retrieval plan an org's strategy builds for a query
    Plan {
        org: Uuid,
        query: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Decide what to surface proactively for an incoming room message
    Inject {
        org: Uuid,
        room: Uuid,
        /// The incoming message
        message: String,
        #[arg(long)]
        project: Option<Uuid>,
        /// Score by lexical overlap only, without calling the embedding provider
        #[arg(long)]
        lexical: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Evaluate labeled cases against the quality gates
    Evaluate {
        /// NDJSON file of evaluation cases
        #[arg(short, long)]
        fixtures: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one gated tuning attempt over the retrieval knobs
    Tune {
        /// NDJSON file of evaluation cases with recorded candidates
        #[arg(short, long)]
        fixtures: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > [logging].level
        let log_level = if self.verbose {
            "debug".to_string()
        } else if self.quiet {
            "error".to_string()
        } else {
            self.log_level.clone().unwrap_or_else(|| config.logging.level.clone())
        };
        init_tracing(&log_level, &config.logging.format);

        match self.command {
            Commands::Run { once } => run::cmd_run(config, once).await,
            Commands::Retrieve {
                org,
                query,
                room,
                project,
                limit,
                json,
            } => retrieve::cmd_retrieve(config, org, query, room, project, limit, json).await,
            Commands::Plan { org, query, json } => retrieve::cmd_plan(config, org, query, json).await,
            Commands::Inject {
                org,
                room,
                message,
                project,
                lexical,
                json,
            } => retrieve::cmd_inject(config, org, room, project, message, lexical, json).await,
            Commands::Evaluate { fixtures, json } => tuning::cmd_evaluate(config, fixtures, json),
            Commands::Tune { fixtures, json } => tuning::cmd_tune(config, fixtures, json).await,
            Commands::Config { json } => Self::cmd_config(config, json),
            Commands::Completions { shell } => Self::cmd_completions(shell),
        }
    }

    fn cmd_config(config: EllieConfig, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| EllieError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_completions(shell: Shell) -> Result<()> {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "ellie", &mut std::io::stdout());
        Ok(())
    }
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    // Logs go to stderr so command output stays pipeable.
    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

// ── Shared wiring ──────────────────────────────────────────────

pub(crate) fn open_store(config: &EllieConfig) -> Result<Arc<SqliteStore>> {
    Ok(Arc::new(SqliteStore::open(&config.store.db_path)?))
}

pub(crate) fn build_gateway(config: &EllieConfig) -> Arc<dyn LlmGateway> {
    let llm = &config.llm;
    Arc::new(
        OpenAiGateway::new(llm.model.clone())
            .with_api_key(llm.api_key.clone())
            .with_base_url(llm.base_url.clone())
            .with_sampling(llm.temperature, llm.max_tokens)
            .with_timeout(Duration::from_secs(llm.timeout_secs)),
    )
}

pub(crate) fn build_embedder(config: &EllieConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let emb = &config.embedding;
    match emb.provider.as_str() {
        "openai" => {
            let key = emb.api_key.clone().or_else(|| config.llm.api_key.clone());
            let mut provider = OpenAiEmbedding::new(key).with_model(emb.model.clone(), emb.dims);
            if let Some(ref url) = emb.base_url {
                provider = provider.with_base_url(url.clone());
            }
            Ok(Arc::new(provider))
        }
        "ollama" => {
            let mut provider = OllamaEmbedding::new(&emb.model, emb.dims);
            if let Some(ref url) = emb.base_url {
                provider = provider.with_base_url(url.clone());
            }
            Ok(Arc::new(provider))
        }
        other => Err(EllieError::ConfigValidation {
            field: "embedding.provider".into(),
            reason: format!("unknown provider '{other}'"),
        }),
    }
}
