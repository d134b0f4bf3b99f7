//! Posting snapshot storage + HTTP fetch utilities for jobscout.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobscout_core::{Posting, PostingId, RawPosting};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-storage";

/// Snapshot layout version written by [`PostingStore::save`].
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Persisted state exists but cannot be used. Fatal: continuing would
    /// forget which postings were already notified.
    #[error("posting store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("unknown posting {0}")]
    UnknownPosting(PostingId),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing posting store: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Refreshed { content_changed: bool },
}

impl UpsertOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::Created)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    format_version: u32,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
    postings: BTreeMap<PostingId, Posting>,
}

/// Durable keyed collection of every posting seen so far.
///
/// The whole snapshot lives in memory during a run and is written back as a
/// single JSON document with a temp-file rename, so a reader only ever sees
/// the previous or the next complete snapshot.
#[derive(Debug, Clone)]
pub struct PostingStore {
    path: PathBuf,
    postings: BTreeMap<PostingId, Posting>,
}

impl PostingStore {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            postings: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot at `path`. A missing file is a first run and yields
    /// an empty store; an unreadable or unparsable file is [`StoreError::Corrupt`].
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let exists = fs::try_exists(&path).await.map_err(|source| StoreError::Io {
            action: "checking",
            path: path.clone(),
            source,
        })?;
        if !exists {
            info!(path = %path.display(), "no posting store yet; starting empty");
            return Ok(Self::empty(path));
        }

        let bytes = fs::read(&path).await.map_err(|source| StoreError::Io {
            action: "reading",
            path: path.clone(),
            source,
        })?;
        let document: SnapshotDocument =
            serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        if document.format_version != FORMAT_VERSION {
            return Err(StoreError::Corrupt {
                path,
                reason: format!(
                    "unsupported format_version {} (expected {FORMAT_VERSION})",
                    document.format_version
                ),
            });
        }

        info!(
            path = %path.display(),
            postings = document.postings.len(),
            "loaded posting store"
        );
        Ok(Self {
            path,
            postings: document.postings,
        })
    }

    pub fn content_hash(raw: &RawPosting) -> String {
        let mut hasher = Sha256::new();
        for part in [&raw.title, &raw.company, &raw.location, &raw.description] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }

    /// Inserts an unseen posting or refreshes a known one.
    ///
    /// Known postings keep `first_seen` and `notified`; non-empty incoming
    /// fields replace the stored ones since posters edit their listings.
    pub fn upsert(&mut self, raw: &RawPosting, now: DateTime<Utc>) -> (PostingId, UpsertOutcome) {
        let raw = raw.cleaned();
        let id = PostingId::derive(&raw);

        let existing = match self.postings.entry(id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(Posting {
                    title: raw.title.clone(),
                    company: raw.company.clone(),
                    location: raw.location.clone(),
                    description: raw.description.clone(),
                    url: raw.url.clone(),
                    posted_at: raw.posted_at.clone(),
                    first_seen: now,
                    last_seen: now,
                    notified: false,
                    last_score: None,
                    content_hash: Self::content_hash(&raw),
                    normalized_text: String::new(),
                });
                debug!(%id, "inserted posting");
                return (id, UpsertOutcome::Created);
            }
        };

        if now > existing.last_seen {
            existing.last_seen = now;
        }
        refresh_field(&mut existing.title, &raw.title);
        refresh_field(&mut existing.company, &raw.company);
        refresh_field(&mut existing.location, &raw.location);
        refresh_field(&mut existing.description, &raw.description);
        refresh_field(&mut existing.url, &raw.url);
        refresh_field(&mut existing.posted_at, &raw.posted_at);

        let merged = RawPosting {
            title: existing.title.clone(),
            company: existing.company.clone(),
            location: existing.location.clone(),
            description: existing.description.clone(),
            ..RawPosting::default()
        };
        let hash = Self::content_hash(&merged);
        let content_changed = hash != existing.content_hash;
        if content_changed {
            existing.content_hash = hash;
            existing.last_score = None;
            existing.normalized_text.clear();
            debug!(%id, "posting content changed");
        }
        (id, UpsertOutcome::Refreshed { content_changed })
    }

    /// Sets the notified flag. Returns whether the flag changed; repeated
    /// calls are no-ops.
    pub fn mark_notified(&mut self, id: &PostingId) -> Result<bool, StoreError> {
        let posting = self.get_mut(id)?;
        let flipped = !posting.notified;
        posting.notified = true;
        Ok(flipped)
    }

    pub fn record_score(&mut self, id: &PostingId, score: f64) -> Result<(), StoreError> {
        self.get_mut(id)?.last_score = Some(score);
        Ok(())
    }

    pub fn set_normalized_text(&mut self, id: &PostingId, text: String) -> Result<(), StoreError> {
        self.get_mut(id)?.normalized_text = text;
        Ok(())
    }

    /// Drops postings not re-observed within `max_age` of `now`. Notified
    /// postings are kept regardless of age so a relisting is never re-sent.
    pub fn prune_stale(&mut self, now: DateTime<Utc>, max_age: chrono::Duration) -> usize {
        let cutoff = now - max_age;
        let before = self.postings.len();
        self.postings
            .retain(|_, posting| posting.notified || posting.last_seen >= cutoff);
        before - self.postings.len()
    }

    /// Clears every notified flag. Returns how many were set.
    pub fn reset_notified(&mut self) -> usize {
        let mut cleared = 0;
        for posting in self.postings.values_mut() {
            if posting.notified {
                posting.notified = false;
                cleared += 1;
            }
        }
        cleared
    }

    pub fn get(&self, id: &PostingId) -> Option<&Posting> {
        self.postings.get(id)
    }

    fn get_mut(&mut self, id: &PostingId) -> Result<&mut Posting, StoreError> {
        self.postings
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownPosting(id.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PostingId, &Posting)> {
        self.postings.iter()
    }

    pub fn postings(&self) -> &BTreeMap<PostingId, Posting> {
        &self.postings
    }

    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    /// Persists the full snapshot using a same-directory temp file and an
    /// atomic rename. On failure the previous snapshot is left untouched.
    pub async fn save(&self) -> Result<(), StoreError> {
        let document = SnapshotDocument {
            format_version: FORMAT_VERSION,
            saved_at: Some(Utc::now()),
            postings: self.postings.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|source| StoreError::Io {
                action: "creating store directory",
                path: parent.clone(),
                source,
            })?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "postings.json".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        if let Err(err) = write_synced(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                action: "renaming temp store into",
                path: self.path.clone(),
                source,
            });
        }

        info!(
            path = %self.path.display(),
            postings = self.postings.len(),
            bytes = bytes.len(),
            "saved posting store"
        );
        Ok(())
    }
}

fn refresh_field(current: &mut String, incoming: &str) {
    if !incoming.is_empty() && current != incoming {
        *current = incoming.to_string();
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |action: &'static str| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StoreError::Io {
            action,
            path,
            source,
        }
    };
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .map_err(io_err("opening temp store"))?;
    file.write_all(bytes).await.map_err(io_err("writing temp store"))?;
    file.flush().await.map_err(io_err("flushing temp store"))?;
    file.sync_all().await.map_err(io_err("syncing temp store"))?;
    Ok(())
}

/// Whether a failed request may be tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    /// Throttling and server-side failures are worth another attempt.
    pub fn for_status(status: StatusCode) -> Self {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }

    pub fn for_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Doubling delay starting at `base_delay`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Wait before retry number `attempt_index`, or `None` once the retries
    /// are spent or the wait alone would run into `deadline`.
    pub fn next_delay(
        &self,
        attempt_index: usize,
        now: Instant,
        deadline: Option<Instant>,
    ) -> Option<Duration> {
        if attempt_index >= self.max_retries {
            return None;
        }
        let delay = self.delay_for_attempt(attempt_index);
        match deadline {
            Some(deadline) if now + delay >= deadline => None,
            _ => Some(delay),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Minimum spacing between consecutive requests.
    pub request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            request_interval: Duration::from_millis(1500),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    request_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("deadline reached before {url} answered")]
    DeadlineExceeded { url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            request_interval: config.request_interval,
            last_request: Mutex::new(None),
            backoff: config.backoff,
        })
    }

    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.request_interval).await;
        }
        *last = Some(Instant::now());
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        self.fetch_text_until(url, None).await
    }

    /// Like [`fetch_text`](Self::fetch_text), but gives up at `deadline`:
    /// retries that cannot finish in time are not attempted and an in-flight
    /// request is abandoned.
    pub async fn fetch_text_until(
        &self,
        url: &str,
        deadline: Option<Instant>,
    ) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", url);
        let attempts = self.fetch_with_retries(url, deadline).instrument(span);
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, attempts)
                .await
                .map_err(|_| HttpError::DeadlineExceeded {
                    url: url.to_string(),
                })?,
            None => attempts.await,
        }
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        deadline: Option<Instant>,
    ) -> Result<FetchedResponse, HttpError> {
        let mut attempt = 0;
        loop {
            self.pace().await;
            let (disposition, err) = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    (
                        RetryDisposition::for_status(status),
                        HttpError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        },
                    )
                }
                Err(err) => (RetryDisposition::for_error(&err), HttpError::Request(err)),
            };

            let delay = match disposition {
                RetryDisposition::Retryable => {
                    self.backoff.next_delay(attempt, Instant::now(), deadline)
                }
                RetryDisposition::NonRetryable => None,
            };
            let Some(delay) = delay else {
                return Err(err);
            };
            debug!(attempt, ?delay, error = %err, "retrying request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
