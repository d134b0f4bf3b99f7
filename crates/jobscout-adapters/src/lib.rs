//! Posting source contracts + fixture and HTML listing sources.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jobscout_core::{clean_field, normalize_key_fragment, RawPosting};
use jobscout_storage::{HttpError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "jobscout-adapters";

/// One search issued against the listings site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlQuery {
    pub keywords: String,
    #[serde(default)]
    pub location: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

fn default_max_pages() -> usize {
    1
}

impl CrawlQuery {
    pub fn new(keywords: impl Into<String>) -> Self {
        Self {
            keywords: keywords.into(),
            location: String::new(),
            max_pages: default_max_pages(),
        }
    }

    pub fn label(&self) -> String {
        if self.location.is_empty() {
            self.keywords.clone()
        } else {
            format!("{} @ {}", self.keywords, self.location)
        }
    }
}

/// Per-query fetch failure. Transient by contract: callers skip the query
/// and keep going.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("parsing listing page {url}: {reason}")]
    Parse { url: String, reason: String },
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait PostingSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Fetches raw postings for `query`. May return fewer results than the
    /// site holds.
    ///
    /// Implementations must return by `deadline`. A source that has already
    /// collected some postings when the deadline arrives returns them as a
    /// partial success rather than an error.
    async fn fetch_postings(
        &self,
        query: &CrawlQuery,
        deadline: Instant,
    ) -> Result<Vec<RawPosting>, FetchError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    #[serde(default)]
    pub captured_from_url: Option<String>,
    pub queries: Vec<FixtureQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureQuery {
    pub keywords: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub postings: Vec<RawPosting>,
    /// Captured listing page, relative to the bundle file.
    #[serde(default)]
    pub listing_html: Option<String>,
    #[serde(skip)]
    pub listing_html_text: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut bundle: FixtureBundle =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    hydrate_listing_html(path, &mut bundle)?;
    Ok(bundle)
}

fn hydrate_listing_html(bundle_path: &Path, bundle: &mut FixtureBundle) -> Result<()> {
    let base = bundle_path.parent().unwrap_or_else(|| Path::new("."));
    for query in &mut bundle.queries {
        let Some(rel_path) = &query.listing_html else {
            continue;
        };
        let raw_path = base.join(rel_path);
        let text = fs::read_to_string(&raw_path)
            .with_context(|| format!("reading fixture listing {}", raw_path.display()))?;
        query.listing_html_text = Some(text);
    }
    Ok(())
}

/// Replays captured postings instead of touching the network.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    bundle: FixtureBundle,
    base_url: Url,
}

impl FixtureSource {
    pub fn new(bundle: FixtureBundle) -> Result<Self> {
        let base = bundle
            .captured_from_url
            .as_deref()
            .unwrap_or("https://fixtures.invalid/");
        let base_url =
            Url::parse(base).with_context(|| format!("parsing fixture base url {base}"))?;
        Ok(Self { bundle, base_url })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(load_fixture_bundle(path)?)
    }

    fn matches(fixture: &FixtureQuery, query: &CrawlQuery) -> bool {
        normalize_key_fragment(&fixture.keywords) == normalize_key_fragment(&query.keywords)
            && (fixture.location.is_empty()
                || normalize_key_fragment(&fixture.location)
                    == normalize_key_fragment(&query.location))
    }
}

#[async_trait]
impl PostingSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.bundle.source_id
    }

    async fn fetch_postings(
        &self,
        query: &CrawlQuery,
        _deadline: Instant,
    ) -> Result<Vec<RawPosting>, FetchError> {
        let mut postings = Vec::new();
        for fixture in self.bundle.queries.iter().filter(|f| Self::matches(f, query)) {
            postings.extend(fixture.postings.iter().cloned());
            if let Some(html) = &fixture.listing_html_text {
                postings.extend(parse_listing_html(html, &self.base_url)?);
            }
        }
        debug!(
            fixture_id = %self.bundle.fixture_id,
            query = %query.label(),
            count = postings.len(),
            "replayed fixture postings"
        );
        Ok(postings)
    }
}

/// Fetches the site's public listing pages over plain HTTP and parses the
/// job cards. No scripting, no session.
#[derive(Debug)]
pub struct HtmlListingSource {
    source_id: String,
    search_url: Url,
    page_size: usize,
    http: HttpFetcher,
}

impl HtmlListingSource {
    pub fn new(
        source_id: impl Into<String>,
        search_url: &str,
        page_size: usize,
        http: HttpFetcher,
    ) -> Result<Self> {
        let search_url =
            Url::parse(search_url).with_context(|| format!("parsing search url {search_url}"))?;
        Ok(Self {
            source_id: source_id.into(),
            search_url,
            page_size: page_size.max(1),
            http,
        })
    }

    pub fn page_url(&self, query: &CrawlQuery, page: usize) -> Url {
        let mut url = self.search_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("keywords", &query.keywords);
            if !query.location.is_empty() {
                pairs.append_pair("location", &query.location);
            }
            if page > 0 {
                pairs.append_pair("start", &(page * self.page_size).to_string());
            }
        }
        url
    }
}

#[async_trait]
impl PostingSource for HtmlListingSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_postings(
        &self,
        query: &CrawlQuery,
        deadline: Instant,
    ) -> Result<Vec<RawPosting>, FetchError> {
        let mut collected = Vec::new();
        for page in 0..query.max_pages.max(1) {
            let url = self.page_url(query, page);
            let response = match self.http.fetch_text_until(url.as_str(), Some(deadline)).await {
                Ok(response) => response,
                Err(err) if collected.is_empty() => return Err(err.into()),
                Err(err) => {
                    warn!(
                        query = %query.label(),
                        page,
                        kept = collected.len(),
                        error = %err,
                        "listing page failed; keeping earlier pages"
                    );
                    break;
                }
            };
            let base = Url::parse(&response.final_url).unwrap_or_else(|_| url.clone());
            let postings =
                parse_listing_html(&response.body, &base).map_err(|err| FetchError::Parse {
                    url: url.to_string(),
                    reason: err.to_string(),
                })?;
            info!(query = %query.label(), page, count = postings.len(), "parsed listing page");
            if postings.is_empty() {
                break;
            }
            collected.extend(postings);
        }
        Ok(collected)
    }
}

const CARD_SELECTORS: &[&str] = &[
    "div.base-card",
    "div.job-search-card",
    "div[data-entity-urn*=\"job\"]",
    "li.result-card",
    "div.base-search-card",
];

const TITLE_SELECTORS: &[&str] = &[
    "h3.base-search-card__title",
    "h3.job-search-card__title",
    ".job-search-card__title a",
    "h3 a",
    "h3",
];

const COMPANY_SELECTORS: &[&str] = &[
    "h4.base-search-card__subtitle",
    "h4.job-search-card__subtitle",
    ".job-search-card__subtitle-link",
    ".base-search-card__subtitle a",
];

const LOCATION_SELECTORS: &[&str] = &[
    "span.job-search-card__location",
    ".job-search-card__location",
    ".base-search-card__metadata span",
];

const LINK_SELECTORS: &[&str] = &["a.base-card__full-link", "h3 a", "a[href]"];

const DESCRIPTION_SELECTORS: &[&str] = &[
    ".job-search-card__snippet",
    ".base-search-card__snippet",
    ".job-description",
];

const DATE_SELECTORS: &[&str] = &["time.job-search-card__listdate", "time"];

fn parse_selectors(selectors: &[&str]) -> Result<Vec<Selector>, FetchError> {
    selectors
        .iter()
        .map(|s| {
            Selector::parse(s).map_err(|e| FetchError::Message(format!("selector {s}: {e}")))
        })
        .collect()
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let text = clean_field(&text);
    if !text.is_empty() {
        return Some(text);
    }
    ["title", "aria-label"]
        .iter()
        .filter_map(|attr| element.value().attr(attr))
        .map(clean_field)
        .find(|value| !value.is_empty())
}

fn first_text(card: ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    selectors
        .iter()
        .flat_map(|sel| card.select(sel))
        .find_map(element_text)
}

fn first_href(card: ElementRef<'_>, selectors: &[Selector], base: &Url) -> Option<String> {
    selectors
        .iter()
        .flat_map(|sel| card.select(sel))
        .filter_map(|el| el.value().attr("href"))
        .find_map(|href| base.join(href.trim()).ok())
        .map(|url| url.to_string())
}

fn site_id(card: ElementRef<'_>, urn_selector: &Selector) -> Option<String> {
    let from_attrs = |el: ElementRef<'_>| {
        el.value()
            .attr("data-entity-urn")
            .and_then(|urn| urn.rsplit(':').next())
            .or_else(|| el.value().attr("data-job-id"))
            .map(clean_field)
            .filter(|id| !id.is_empty())
    };
    from_attrs(card).or_else(|| card.select(urn_selector).find_map(from_attrs))
}

fn posted_at(card: ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    selectors
        .iter()
        .flat_map(|sel| card.select(sel))
        .find_map(|el| {
            el.value()
                .attr("datetime")
                .map(clean_field)
                .filter(|v| !v.is_empty())
                .or_else(|| element_text(el))
        })
}

/// Parses the job cards of one listing page. Cards without a title or a link
/// are skipped; missing company/location/description become empty strings.
pub fn parse_listing_html(html: &str, base: &Url) -> Result<Vec<RawPosting>, FetchError> {
    let document = Html::parse_document(html);
    let cards = parse_selectors(CARD_SELECTORS)?;
    let titles = parse_selectors(TITLE_SELECTORS)?;
    let companies = parse_selectors(COMPANY_SELECTORS)?;
    let locations = parse_selectors(LOCATION_SELECTORS)?;
    let links = parse_selectors(LINK_SELECTORS)?;
    let descriptions = parse_selectors(DESCRIPTION_SELECTORS)?;
    let dates = parse_selectors(DATE_SELECTORS)?;
    let urn = Selector::parse("[data-entity-urn], [data-job-id]")
        .map_err(|e| FetchError::Message(e.to_string()))?;

    // First card selector that matches anything wins, like the site's own
    // layouts which never mix card styles on one page.
    let Some(card_elements) = cards
        .iter()
        .map(|sel| document.select(sel).collect::<Vec<_>>())
        .find(|found| !found.is_empty())
    else {
        return Ok(Vec::new());
    };

    let mut postings = Vec::with_capacity(card_elements.len());
    for card in card_elements {
        let Some(title) = first_text(card, &titles) else {
            continue;
        };
        let Some(url) = first_href(card, &links, base) else {
            continue;
        };
        postings.push(RawPosting {
            id: site_id(card, &urn).unwrap_or_default(),
            title,
            company: first_text(card, &companies).unwrap_or_default(),
            location: first_text(card, &locations).unwrap_or_default(),
            description: first_text(card, &descriptions).unwrap_or_default(),
            url,
            posted_at: posted_at(card, &dates).unwrap_or_default(),
        });
    }
    Ok(postings)
}
