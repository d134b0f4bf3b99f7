//! Core domain model for jobscout: raw and stored postings, profile, notification batches.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-core";

/// Loose handoff record from a posting source into the pipeline.
///
/// Sources disagree on shape, so every field tolerates being absent, `null`
/// or a scalar; all of them end up as plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawPosting {
    #[serde(default, deserialize_with = "loose_text")]
    pub id: String,
    #[serde(default, deserialize_with = "loose_text")]
    pub title: String,
    #[serde(default, deserialize_with = "loose_text")]
    pub company: String,
    #[serde(default, deserialize_with = "loose_text")]
    pub location: String,
    #[serde(default, deserialize_with = "loose_text")]
    pub description: String,
    #[serde(default, deserialize_with = "loose_text")]
    pub url: String,
    #[serde(default, deserialize_with = "loose_text")]
    pub posted_at: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseText {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

fn loose_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<LooseText>::deserialize(deserializer)?;
    Ok(match value {
        Some(LooseText::Text(s)) => s,
        Some(LooseText::Int(n)) => n.to_string(),
        Some(LooseText::Float(n)) => n.to_string(),
        Some(LooseText::Bool(b)) => b.to_string(),
        None => String::new(),
    })
}

impl RawPosting {
    /// Trimmed copy with redacted values (the site masks hidden companies
    /// as runs of `*`) replaced by empty strings.
    pub fn cleaned(&self) -> Self {
        Self {
            id: clean_field(&self.id),
            title: clean_field(&self.title),
            company: clean_field(&self.company),
            location: clean_field(&self.location),
            description: clean_field(&self.description),
            url: clean_field(&self.url),
            posted_at: clean_field(&self.posted_at),
        }
    }
}

pub fn clean_field(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.chars().all(|c| c == '*') {
        String::new()
    } else {
        trimmed.to_string()
    }
}

/// Stable identity of a posting inside the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostingId(String);

impl PostingId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derives the identity from the site-assigned id, falling back to the
    /// canonical URL and finally to the title/company/location triple.
    pub fn derive(raw: &RawPosting) -> Self {
        let site_id = raw.id.trim();
        if !site_id.is_empty() {
            return Self(format!("site:{site_id}"));
        }
        if let Some(url) = canonical_url(&raw.url) {
            return Self(format!("url:{url}"));
        }
        let triple = format!(
            "{}|{}|{}",
            normalize_key_fragment(&raw.title),
            normalize_key_fragment(&raw.company),
            normalize_key_fragment(&raw.location)
        );
        Self(format!(
            "tcl:{}",
            Uuid::new_v5(&Uuid::NAMESPACE_URL, triple.as_bytes())
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Absolute URL without query string, fragment or trailing slash.
pub fn canonical_url(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut url = Url::parse(trimmed).ok()?;
    url.set_query(None);
    url.set_fragment(None);
    let rendered = url.to_string();
    Some(rendered.trim_end_matches('/').to_string())
}

pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical persisted posting. The identity is the key of the snapshot map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub posted_at: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub notified: bool,
    pub last_score: Option<f64>,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub normalized_text: String,
}

impl Posting {
    /// Text compared against the profile, before normalization.
    pub fn document_text(&self) -> String {
        [
            self.title.as_str(),
            self.company.as_str(),
            self.location.as_str(),
            self.description.as_str(),
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// The user's target text. Read-only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub text: String,
}

impl Profile {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredPosting {
    pub id: PostingId,
    pub score: f64,
    pub posting: Posting,
}

/// Ordered postings selected by one run. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationBatch {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub cutoff: f64,
    pub items: Vec<ScoredPosting>,
}

impl NotificationBatch {
    pub fn empty(run_id: Uuid, created_at: DateTime<Utc>, cutoff: f64) -> Self {
        Self {
            run_id,
            created_at,
            cutoff,
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> Vec<PostingId> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, url: &str) -> RawPosting {
        RawPosting {
            id: id.to_string(),
            title: "Backend Engineer".to_string(),
            company: "Acme".to_string(),
            location: "Remote".to_string(),
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn site_id_wins_over_url() {
        let id = PostingId::derive(&raw("4012", "https://jobs.example.com/view/4012?trk=abc"));
        assert_eq!(id.as_str(), "site:4012");
    }

    #[test]
    fn url_identity_ignores_tracking_query() {
        let a = PostingId::derive(&raw("", "https://jobs.example.com/view/4012/?trk=abc"));
        let b = PostingId::derive(&raw("", "https://jobs.example.com/view/4012#apply"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "url:https://jobs.example.com/view/4012");
    }

    #[test]
    fn triple_identity_is_stable_across_case_and_punctuation() {
        let mut a = raw("", "");
        let mut b = raw("", "");
        a.title = "Backend Engineer!".to_string();
        b.title = "backend  engineer".to_string();
        assert_eq!(PostingId::derive(&a), PostingId::derive(&b));
        assert!(PostingId::derive(&a).as_str().starts_with("tcl:"));
    }

    #[test]
    fn loose_fields_accept_null_and_numbers() {
        let parsed: RawPosting = serde_json::from_str(
            r#"{"id": 77, "title": "Data Analyst", "company": null, "extra": true}"#,
        )
        .unwrap();
        assert_eq!(parsed.id, "77");
        assert_eq!(parsed.company, "");
        assert_eq!(parsed.description, "");
    }

    #[test]
    fn cleaned_drops_masked_values() {
        let mut posting = raw("1", "");
        posting.company = " ******** ".to_string();
        posting.title = "  Analyst ".to_string();
        let cleaned = posting.cleaned();
        assert_eq!(cleaned.company, "");
        assert_eq!(cleaned.title, "Analyst");
    }
}
