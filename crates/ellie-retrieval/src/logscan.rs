//! Raw JSONL transcript scanning, the last tier before "no information".

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use ellie_core::{OrgId, Result};

use crate::cascade::{LogHit, LogScanner};

/// Fields tried, in order, when a line parses as a JSON object.
const TEXT_FIELDS: [&str; 3] = ["text", "content", "message"];

/// Case-insensitive substring search over `*.jsonl` transcripts.
///
/// Files in `<dir>/<org_id>/` belong to that org. Files directly in `<dir>`
/// are shared, so only their lines tagged with the caller's `org_id` are
/// returned. A tagged line of another org is never returned.
pub struct JsonlLogScanner {
    dir: PathBuf,
}

/// Whether a file's lines need an `org_id` tag to be visible.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Org,
    Shared,
}

impl JsonlLogScanner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The org's own files first, then the shared ones, each sorted by name.
    async fn log_files(&self, org_id: OrgId) -> Result<Vec<(PathBuf, Ownership)>> {
        let own = jsonl_files(&self.dir.join(org_id.to_string())).await?;
        let shared = jsonl_files(&self.dir).await?;
        Ok(own
            .into_iter()
            .map(|p| (p, Ownership::Org))
            .chain(shared.into_iter().map(|p| (p, Ownership::Shared)))
            .collect())
    }
}

async fn jsonl_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "jsonl") && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// The searchable text of one line plus the org it claims to belong to.
fn line_text(line: &str) -> (String, Option<String>) {
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(serde_json::Value::Object(obj)) => {
            let org = obj.get("org_id").and_then(|v| v.as_str()).map(String::from);
            let text = TEXT_FIELDS
                .iter()
                .find_map(|f| obj.get(*f).and_then(|v| v.as_str()))
                .map(String::from)
                .unwrap_or_else(|| line.to_string());
            (text, org)
        }
        _ => (line.to_string(), None),
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[async_trait]
impl LogScanner for JsonlLogScanner {
    async fn scan(&self, org_id: OrgId, query: &str, limit: usize) -> Result<Vec<LogHit>> {
        let needle = query.trim().to_lowercase();
        let mut hits = Vec::new();
        if needle.is_empty() || limit == 0 {
            return Ok(hits);
        }
        let org = org_id.to_string();

        for (path, ownership) in self.log_files(org_id).await? {
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "unreadable log file, skipping");
                    continue;
                }
            };
            for (idx, line) in raw.split(|b| *b == b'\n').enumerate() {
                let line = String::from_utf8_lossy(line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (text, line_org) = line_text(line);
                let visible = match line_org {
                    Some(o) => o == org,
                    None => ownership == Ownership::Org,
                };
                if !visible {
                    continue;
                }
                if text.to_lowercase().contains(&needle) {
                    hits.push(LogHit {
                        location: format!("{}:{}", file_label(&path), idx + 1),
                        text,
                    });
                    if hits.len() >= limit {
                        debug!(dir = %self.dir.display(), "log scan hit limit");
                        return Ok(hits);
                    }
                }
            }
        }
        Ok(hits)
    }
}
