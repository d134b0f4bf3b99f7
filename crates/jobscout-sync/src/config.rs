//! `jobscout.yaml` plus `JOBSCOUT_*` environment overrides.

use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use jobscout_adapters::CrawlQuery;
use jobscout_core::Profile;
use serde::{Deserialize, Serialize};

use crate::select::{MatchPolicy, ThresholdPolicy, TitleFilter};
use crate::similarity::Analyzer;

pub const DEFAULT_CONFIG_FILE: &str = "jobscout.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobscoutConfig {
    pub profile: ProfileConfig,
    pub queries: Vec<CrawlQuery>,
    pub source: SourceConfig,
    pub matching: MatchingConfig,
    pub similarity: SimilarityConfig,
    pub crawl: CrawlConfig,
    pub storage: StorageConfig,
    pub reports: ReportsConfig,
    pub notifier: NotifierKind,
    /// Relative paths resolve against this directory (the config file's).
    #[serde(skip)]
    pub workspace_root: PathBuf,
}

impl Default for JobscoutConfig {
    fn default() -> Self {
        Self {
            profile: ProfileConfig::default(),
            queries: Vec::new(),
            source: SourceConfig::default(),
            matching: MatchingConfig::default(),
            similarity: SimilarityConfig::default(),
            crawl: CrawlConfig::default(),
            storage: StorageConfig::default(),
            reports: ReportsConfig::default(),
            notifier: NotifierKind::default(),
            workspace_root: PathBuf::from("."),
        }
    }
}

/// Inline text wins over `file`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub text: Option<String>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Fixture {
        path: PathBuf,
    },
    Html {
        #[serde(default = "default_html_source_id")]
        source_id: String,
        search_url: String,
        #[serde(default = "default_page_size")]
        page_size: usize,
    },
}

fn default_html_source_id() -> String {
    "listings".to_string()
}

fn default_page_size() -> usize {
    25
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Fixture {
            path: PathBuf::from("fixtures/sample/bundle.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub threshold: ThresholdPolicy,
    pub max_batch: Option<usize>,
    /// Re-rank postings scored in earlier runs but never notified.
    pub rescore_unnotified: bool,
    /// Refresh scores of notified postings too. They are never re-sent.
    pub rescore_notified: bool,
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold: ThresholdPolicy::default(),
            max_batch: None,
            rescore_unnotified: true,
            rescore_notified: false,
            include_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
        }
    }
}

impl MatchingConfig {
    pub fn policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.threshold,
            max_batch: self.max_batch,
            title_filter: TitleFilter::new(&self.include_keywords, &self.exclude_keywords),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub analyzer: Analyzer,
    pub stop_words: bool,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            analyzer: Analyzer::default(),
            stop_words: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub query_timeout_ms: u64,
    /// Wall-clock budget for the whole crawl phase.
    pub crawl_budget_ms: u64,
    pub request_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 60_000,
            crawl_budget_ms: 300_000,
            request_delay_ms: 1_500,
            http_timeout_secs: 20,
            user_agent: "jobscout-bot/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub store_path: PathBuf,
    /// Postings unseen for longer than this are dropped. `None` keeps all.
    pub retention_days: Option<u32>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("state/postings.json"),
            retention_days: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportsConfig {
    pub dir: PathBuf,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("reports"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    Log,
    #[default]
    Report,
}

impl JobscoutConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.workspace_root = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `JOBSCOUT_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("JOBSCOUT_STORE_PATH") {
            self.storage.store_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("JOBSCOUT_REPORTS_DIR") {
            self.reports.dir = PathBuf::from(dir);
        }
        if let Some(user_agent) = lookup("JOBSCOUT_USER_AGENT") {
            self.crawl.user_agent = user_agent;
        }
        if let Some(secs) = lookup("JOBSCOUT_HTTP_TIMEOUT_SECS") {
            self.crawl.http_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("JOBSCOUT_HTTP_TIMEOUT_SECS={secs:?} is not a number"))?;
        }
        if let Some(value) = lookup("JOBSCOUT_THRESHOLD") {
            let value = value
                .trim()
                .parse()
                .with_context(|| format!("JOBSCOUT_THRESHOLD={value:?} is not a number"))?;
            self.matching.threshold = ThresholdPolicy::Absolute { value };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.queries.is_empty(), "at least one query must be configured");
        for query in &self.queries {
            ensure!(
                !query.keywords.trim().is_empty(),
                "queries must have keywords"
            );
        }
        match self.matching.threshold {
            ThresholdPolicy::Absolute { value } => ensure!(
                value.is_finite() && (0.0..=1.0).contains(&value),
                "absolute threshold must be within [0, 1], got {value}"
            ),
            ThresholdPolicy::RelativeToBest { fraction } => ensure!(
                fraction.is_finite() && fraction > 0.0 && fraction <= 1.0,
                "relative threshold fraction must be within (0, 1], got {fraction}"
            ),
        }
        if self.matching.max_batch == Some(0) {
            bail!("max_batch must be at least 1 when set");
        }
        if let Analyzer::CharNgrams { min, max } = self.similarity.analyzer {
            ensure!(
                min >= 1 && min <= max,
                "char_ngrams needs 1 <= min <= max, got {min}..{max}"
            );
        }
        ensure!(self.crawl.query_timeout_ms > 0, "crawl.query_timeout_ms must be positive");
        if let SourceConfig::Html { page_size, .. } = &self.source {
            ensure!(*page_size > 0, "source.page_size must be positive");
        }
        Ok(())
    }

    /// Resolves `path` against the workspace root unless already absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.resolve(&self.storage.store_path)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.resolve(&self.reports.dir)
    }

    pub fn load_profile(&self) -> Result<Profile> {
        if let Some(text) = self.profile.text.as_deref().filter(|t| !t.trim().is_empty()) {
            return Ok(Profile::new(text));
        }
        let Some(file) = &self.profile.file else {
            bail!("profile.text or profile.file must be configured");
        };
        let path = self.resolve(file);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading profile {}", path.display()))?;
        ensure!(!text.trim().is_empty(), "profile {} is empty", path.display());
        Ok(Profile::new(text))
    }
}
