//! TF-IDF vector space and cosine ranking of postings against the profile.
//!
//! Weights are rebuilt from scratch on every call; scores are only
//! comparable within one corpus.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jobscout_core::PostingId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Analyzer {
    /// Whitespace tokens of the normalized text.
    #[default]
    Words,
    /// Character n-grams inside space-padded words.
    CharNgrams { min: usize, max: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub id: &'a PostingId,
    pub text: &'a str,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedScore {
    pub id: PostingId,
    pub score: f64,
    pub first_seen: DateTime<Utc>,
}

/// Score order: higher first, then fresher postings, then identity.
pub fn rank_order(a: &RankedScore, b: &RankedScore) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.first_seen.cmp(&a.first_seen))
        .then_with(|| a.id.cmp(&b.id))
}

type TermVector = HashMap<String, f64>;

#[derive(Debug, Clone, Default)]
pub struct SimilarityEngine {
    analyzer: Analyzer,
}

impl SimilarityEngine {
    pub fn new(analyzer: Analyzer) -> Self {
        Self { analyzer }
    }

    /// Scores every candidate against `profile_text` and returns them in
    /// [`rank_order`]. No candidates means no comparison and an empty result.
    pub fn rank(&self, candidates: &[Candidate<'_>], profile_text: &str) -> Vec<RankedScore> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut counts: Vec<TermVector> = candidates
            .iter()
            .map(|candidate| self.term_counts(candidate.text))
            .collect();
        counts.push(self.term_counts(profile_text));

        let idf = inverse_document_frequency(&counts);
        let mut vectors: Vec<TermVector> = counts
            .into_iter()
            .map(|tf| weighted_unit_vector(tf, &idf))
            .collect();
        let profile = vectors.pop().unwrap_or_default();

        let mut ranked: Vec<RankedScore> = candidates
            .iter()
            .zip(&vectors)
            .map(|(candidate, vector)| RankedScore {
                id: candidate.id.clone(),
                score: cosine(vector, &profile),
                first_seen: candidate.first_seen,
            })
            .collect();
        ranked.sort_by(rank_order);
        ranked
    }

    fn term_counts(&self, text: &str) -> TermVector {
        let mut counts = TermVector::new();
        match self.analyzer {
            Analyzer::Words => {
                for token in text.split_whitespace() {
                    *counts.entry(token.to_string()).or_default() += 1.0;
                }
            }
            Analyzer::CharNgrams { min, max } => {
                let min = min.max(1);
                let max = max.max(min);
                for word in text.split_whitespace() {
                    let padded: Vec<char> = format!(" {word} ").chars().collect();
                    for n in min..=max {
                        if n > padded.len() {
                            break;
                        }
                        for window in padded.windows(n) {
                            *counts.entry(window.iter().collect()).or_default() += 1.0;
                        }
                    }
                }
            }
        }
        counts
    }
}

/// Smoothed IDF: `ln((1 + n) / (1 + df)) + 1`.
fn inverse_document_frequency(documents: &[TermVector]) -> HashMap<String, f64> {
    let mut document_frequency: HashMap<&str, usize> = HashMap::new();
    for document in documents {
        for term in document.keys() {
            *document_frequency.entry(term.as_str()).or_default() += 1;
        }
    }
    let n = documents.len() as f64;
    document_frequency
        .into_iter()
        .map(|(term, df)| {
            let idf = ((1.0 + n) / (1.0 + df as f64)).ln() + 1.0;
            (term.to_string(), idf)
        })
        .collect()
}

fn weighted_unit_vector(mut tf: TermVector, idf: &HashMap<String, f64>) -> TermVector {
    for (term, weight) in tf.iter_mut() {
        *weight *= idf.get(term).copied().unwrap_or(1.0);
    }
    let norm = tf.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm > 0.0 {
        for weight in tf.values_mut() {
            *weight /= norm;
        }
    }
    tf
}

/// Dot product of two unit vectors; zero vectors score 0.
fn cosine(a: &TermVector, b: &TermVector) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f64 = small
        .iter()
        .filter_map(|(term, weight)| large.get(term).map(|other| weight * other))
        .sum();
    dot.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).single().unwrap()
    }

    fn rank(
        engine: &SimilarityEngine,
        docs: &[(&str, &str, u32)],
        profile: &str,
    ) -> Vec<RankedScore> {
        let ids: Vec<PostingId> = docs.iter().map(|(id, _, _)| PostingId::new(*id)).collect();
        let candidates: Vec<Candidate<'_>> = docs
            .iter()
            .zip(&ids)
            .map(|((_, text, day), id)| Candidate {
                id,
                text,
                first_seen: at(*day),
            })
            .collect();
        engine.rank(&candidates, profile)
    }

    #[test]
    fn no_candidates_yields_no_scores() {
        let engine = SimilarityEngine::default();
        assert!(engine.rank(&[], "backend engineer").is_empty());
    }

    #[test]
    fn single_posting_identical_to_profile_scores_maximum() {
        let engine = SimilarityEngine::default();
        let ranked = rank(&engine, &[("a", "rust backend engineer", 1)], "rust backend engineer");
        assert_eq!(ranked.len(), 1);
        assert!((ranked[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn identical_posting_outranks_partial_matches() {
        let engine = SimilarityEngine::default();
        let ranked = rank(
            &engine,
            &[
                ("partial", "backend engineer python", 1),
                ("exact", "backend distributed systems engineer", 1),
                ("none", "graphic designer", 1),
            ],
            "backend distributed systems engineer",
        );
        assert_eq!(ranked[0].id.as_str(), "exact");
        assert!(ranked.iter().all(|r| r.score <= ranked[0].score));
        assert_eq!(ranked[2].id.as_str(), "none");
        assert_eq!(ranked[2].score, 0.0);
    }

    #[test]
    fn scenario_scores_clear_threshold() {
        let engine = SimilarityEngine::default();
        let ranked = rank(
            &engine,
            &[
                ("a", "senior backend engineer distributed systems", 1),
                ("b", "graphic designer", 1),
            ],
            "backend distributed systems engineer",
        );
        assert_eq!(ranked[0].id.as_str(), "a");
        assert!(ranked[0].score > 0.8 && ranked[0].score < 0.9);
        assert_eq!(ranked[1].score, 0.0);
    }

    #[test]
    fn ties_prefer_fresher_postings() {
        let engine = SimilarityEngine::default();
        let ranked = rank(
            &engine,
            &[("older", "data analyst", 1), ("newer", "data analyst", 5)],
            "data analyst sql",
        );
        assert_eq!(ranked[0].score, ranked[1].score);
        assert_eq!(ranked[0].id.as_str(), "newer");
    }

    #[test]
    fn empty_documents_score_zero() {
        let engine = SimilarityEngine::default();
        let ranked = rank(&engine, &[("blank", "", 1), ("hit", "rust", 1)], "rust");
        let blank = ranked.iter().find(|r| r.id.as_str() == "blank").unwrap();
        assert_eq!(blank.score, 0.0);
        assert!(engine_scores_are_finite(&ranked));
    }

    #[test]
    fn char_ngrams_tolerate_spelling_variants() {
        let engine = SimilarityEngine::new(Analyzer::CharNgrams { min: 2, max: 4 });
        let ranked = rank(
            &engine,
            &[("variant", "microsoft corp", 1), ("other", "globex", 1)],
            "microsoft corporation",
        );
        assert_eq!(ranked[0].id.as_str(), "variant");
        assert!(ranked[0].score > 0.5);
    }

    fn engine_scores_are_finite(ranked: &[RankedScore]) -> bool {
        ranked.iter().all(|r| r.score.is_finite())
    }
}
