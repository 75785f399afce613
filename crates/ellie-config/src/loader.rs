use std::path::{Path, PathBuf};
use tracing::{info, warn};

use ellie_core::{EllieError, Result};

use crate::schema::EllieConfig;

/// Loads the Ellie configuration from disk and the environment.
pub struct ConfigLoader {
    config: EllieConfig,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > ELLIE_CONFIG env > ~/.ellie/ellie.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("ELLIE_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ellie")
            .join("ellie.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            Self::parse(&raw, &config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            EllieConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => return Err(EllieError::Config(e)),
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Parse a TOML document into a config.
    pub fn parse(raw: &str, origin: &Path) -> Result<EllieConfig> {
        toml::from_str::<EllieConfig>(raw).map_err(|e| {
            EllieError::Config(format!("failed to parse {}: {}", origin.display(), e))
        })
    }

    /// Get a snapshot of the loaded config.
    pub fn get(&self) -> EllieConfig {
        self.config.clone()
    }

    /// Path the config was (or would have been) read from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (ELLIE_DB_PATH, ELLIE_LOG_LEVEL, etc.)
    pub fn apply_env_overrides(mut config: EllieConfig) -> EllieConfig {
        if let Ok(v) = std::env::var("ELLIE_DB_PATH") {
            config.store.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ELLIE_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("ELLIE_LLM_MODEL") {
            config.llm.model = v;
        }
        if let Ok(v) = std::env::var("ELLIE_LLM_BASE_URL") {
            config.llm.base_url = v;
        }
        // API keys: the config file wins, the environment is the fallback.
        if config.llm.api_key.is_none() {
            if let Ok(v) = std::env::var("OPENAI_API_KEY") {
                config.llm.api_key = Some(v);
            }
        }
        if config.embedding.api_key.is_none() {
            config.embedding.api_key = config.llm.api_key.clone();
        }
        config
    }
}
