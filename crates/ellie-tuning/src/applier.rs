use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use ellie_core::{EllieError, Result, TunerConfig};

use crate::tuner::ConfigApplier;

#[derive(Debug, Serialize, Deserialize)]
struct AppliedFile {
    retrieval: AppliedRetrieval,
}

#[derive(Debug, Serialize, Deserialize)]
struct AppliedRetrieval {
    tuning: TunerConfig,
}

/// Writes applied tuning as a `[retrieval.tuning]` TOML document.
pub struct FileConfigApplier {
    path: PathBuf,
}

impl FileConfigApplier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read a previously applied tuning file, if there is one.
pub fn load_applied(path: &Path) -> Result<Option<TunerConfig>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let file: AppliedFile = toml::from_str(&raw)
        .map_err(|e| EllieError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
    Ok(Some(file.retrieval.tuning))
}

#[async_trait]
impl ConfigApplier for FileConfigApplier {
    async fn apply(&self, config: &TunerConfig) -> Result<()> {
        let doc = AppliedFile {
            retrieval: AppliedRetrieval { tuning: config.clone() },
        };
        let body = toml::to_string_pretty(&doc)
            .map_err(|e| std::io::Error::other(format!("failed to render tuning config: {e}")))?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Atomic replace.
        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        info!(
            path = %self.path.display(),
            min_relevance = config.min_relevance,
            max_results = config.max_results,
            max_chars = config.max_chars,
            "tuning config applied"
        );
        Ok(())
    }
}
