//! Notification sinks for selected batches.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jobscout_core::NotificationBatch;
use thiserror::Error;
use tokio::fs;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing batch: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transport failed: {0}")]
    Transport(String),
}

/// Delivers one batch. Failures are reported, never retried by the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, batch: &NotificationBatch) -> Result<(), NotifyError>;
}

/// Emits each selected posting as a log event.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, batch: &NotificationBatch) -> Result<(), NotifyError> {
        for (rank, item) in batch.items.iter().enumerate() {
            info!(
                run_id = %batch.run_id,
                rank = rank + 1,
                id = %item.id,
                score = item.score,
                title = %item.posting.title,
                company = %item.posting.company,
                url = %item.posting.url,
                "matching posting"
            );
        }
        Ok(())
    }
}

/// Writes `<reports_dir>/<run_id>/brief.md` and `batch.json`.
#[derive(Debug, Clone)]
pub struct ReportNotifier {
    reports_dir: PathBuf,
}

impl ReportNotifier {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    pub fn run_dir(&self, batch: &NotificationBatch) -> PathBuf {
        self.reports_dir.join(batch.run_id.to_string())
    }
}

#[async_trait]
impl Notifier for ReportNotifier {
    fn name(&self) -> &'static str {
        "report"
    }

    async fn send(&self, batch: &NotificationBatch) -> Result<(), NotifyError> {
        let run_dir = self.run_dir(batch);
        fs::create_dir_all(&run_dir).await.map_err(|source| NotifyError::Io {
            path: run_dir.clone(),
            source,
        })?;

        write(&run_dir.join("brief.md"), render_brief(batch).into_bytes()).await?;
        write(&run_dir.join("batch.json"), serde_json::to_vec_pretty(batch)?).await?;

        info!(dir = %run_dir.display(), items = batch.len(), "wrote match report");
        Ok(())
    }
}

async fn write(path: &Path, bytes: Vec<u8>) -> Result<(), NotifyError> {
    fs::write(path, bytes).await.map_err(|source| NotifyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn render_brief(batch: &NotificationBatch) -> String {
    let mut brief = format!(
        "# Job matches\n\n- Run ID: `{}`\n- Created: {}\n- Cutoff: {:.3}\n- Matches: {}\n",
        batch.run_id,
        batch.created_at.to_rfc3339(),
        batch.cutoff,
        batch.len()
    );
    for (rank, item) in batch.items.iter().enumerate() {
        let posting = &item.posting;
        brief.push_str(&format!(
            "\n## {}. {} ({:.3})\n\n- Company: {}\n- Location: {}\n",
            rank + 1,
            posting.title,
            item.score,
            dash_if_empty(&posting.company),
            dash_if_empty(&posting.location),
        ));
        if !posting.posted_at.is_empty() {
            brief.push_str(&format!("- Posted: {}\n", posting.posted_at));
        }
        if !posting.url.is_empty() {
            brief.push_str(&format!("- Link: <{}>\n", posting.url));
        }
    }
    brief
}

fn dash_if_empty(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}
