use std::{io, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, warn};

use crate::generation::TokenUsage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub instruction: String,
    pub user_text: String,
    pub ai_response: String,
    pub token_usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct InteractionInput {
    pub user_id: String,
    pub instruction: String,
    pub user_text: String,
    pub ai_response: String,
    pub token_usage: TokenUsage,
}

#[derive(Clone)]
pub struct InteractionLog {
    path: PathBuf,
    write_gate: Arc<Mutex<()>>,
}

impl InteractionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Best-effort: a failed write is logged and otherwise ignored.
    pub async fn record(&self, input: InteractionInput) {
        if let Err(error) = self.append(input).await {
            warn!(
                path = %self.path.display(),
                error = %format!("{error:#}"),
                "failed to record interaction"
            );
        }
    }

    pub async fn append(&self, input: InteractionInput) -> Result<()> {
        let entry = Interaction {
            timestamp: Utc::now(),
            user_id: input.user_id,
            instruction: input.instruction,
            user_text: input.user_text,
            ai_response: input.ai_response,
            token_usage: input.token_usage,
        };
        let mut line = serde_json::to_string(&entry).context("failed to serialize interaction")?;
        line.push('\n');

        let _gate = self.write_gate.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush().await.context("failed to flush interaction log")?;

        Ok(())
    }

    /// Newest entries first. Lines that do not parse are skipped.
    pub async fn recent(&self, limit: usize) -> Result<Vec<Interaction>> {
        let bounded_limit = limit.clamp(1, 1000);
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read {}", self.path.display()));
            }
        };

        let mut skipped = 0usize;
        let entries = raw
            .lines()
            .rev()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Interaction>(line) {
                Ok(entry) => Some(entry),
                Err(_) => {
                    skipped += 1;
                    None
                }
            })
            .take(bounded_limit)
            .collect::<Vec<Interaction>>();

        if skipped > 0 {
            debug!(skipped, "skipped malformed interaction log lines");
        }

        Ok(entries)
    }
}
