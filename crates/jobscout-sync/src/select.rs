//! Threshold + novelty selection and the notified-flag commit.

use chrono::{DateTime, Utc};
use jobscout_core::{NotificationBatch, Posting, ScoredPosting};
use jobscout_storage::{PostingStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::similarity::RankedScore;

/// Scores are corpus-relative, so the cutoff is either configured per run or
/// derived from the best score of the run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ThresholdPolicy {
    Absolute { value: f64 },
    RelativeToBest { fraction: f64 },
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        ThresholdPolicy::Absolute { value: 0.3 }
    }
}

impl ThresholdPolicy {
    pub fn cutoff(&self, best: Option<f64>) -> f64 {
        match *self {
            ThresholdPolicy::Absolute { value } => value,
            ThresholdPolicy::RelativeToBest { fraction } => match best {
                Some(best) if best > 0.0 => best * fraction,
                _ => f64::INFINITY,
            },
        }
    }
}

/// Case-insensitive substring rule on titles: at least one include keyword
/// (when any are configured) and no exclude keyword.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TitleFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl TitleFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        let lower = |words: &[String]| {
            words
                .iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>()
        };
        Self {
            include: lower(include),
            exclude: lower(exclude),
        }
    }

    pub fn accepts(&self, title: &str) -> bool {
        let title = title.to_lowercase();
        let included = self.include.is_empty() || self.include.iter().any(|k| title.contains(k));
        included && !self.exclude.iter().any(|k| title.contains(k))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatchPolicy {
    pub threshold: ThresholdPolicy,
    pub max_batch: Option<usize>,
    pub title_filter: TitleFilter,
}

pub struct MatchSelector {
    policy: MatchPolicy,
}

impl MatchSelector {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    fn eligible(&self, posting: &Posting, score: f64, cutoff: f64) -> bool {
        score >= cutoff && !posting.notified && self.policy.title_filter.accepts(&posting.title)
    }

    /// Records every score, picks the postings that clear the cutoff and were
    /// never notified, and marks them notified before returning the batch.
    ///
    /// `ranked` must already be in rank order. Marking happens here, ahead of
    /// any delivery attempt: a selected posting is never offered again even
    /// if the notifier later fails.
    pub fn select_and_mark(
        &self,
        store: &mut PostingStore,
        ranked: &[RankedScore],
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<NotificationBatch, StoreError> {
        for entry in ranked {
            store.record_score(&entry.id, entry.score)?;
        }

        let cutoff = self.policy.threshold.cutoff(ranked.first().map(|r| r.score));
        let limit = self.policy.max_batch.unwrap_or(usize::MAX);

        let mut selected = Vec::new();
        for entry in ranked {
            if selected.len() >= limit {
                break;
            }
            let Some(posting) = store.get(&entry.id) else {
                continue;
            };
            if self.eligible(posting, entry.score, cutoff) {
                selected.push(entry);
            } else {
                debug!(
                    id = %entry.id,
                    score = entry.score,
                    notified = posting.notified,
                    "not selected"
                );
            }
        }

        let mut batch = NotificationBatch::empty(run_id, now, cutoff);
        for entry in selected {
            store.mark_notified(&entry.id)?;
            if let Some(posting) = store.get(&entry.id) {
                batch.items.push(ScoredPosting {
                    id: entry.id.clone(),
                    score: entry.score,
                    posting: posting.clone(),
                });
            }
        }

        info!(
            %run_id,
            ranked = ranked.len(),
            cutoff,
            selected = batch.len(),
            "selected notification batch"
        );
        Ok(batch)
    }
}
