//! Canonical text form shared by postings and the profile.
//!
//! Rules, applied in order:
//! 1. Unicode lower-casing.
//! 2. Anything that is not alphanumeric becomes a space, except `+` and `#`
//!    directly after a word (`c++`, `c#`, `f#`).
//! 3. Whitespace collapses to single spaces.
//! 4. With stop words enabled, common English function words and
//!    single-character tokens are dropped.

use std::collections::HashSet;
use std::sync::LazyLock;

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "about", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been", "but",
        "by", "can", "do", "for", "from", "has", "have", "if", "in", "into", "is", "it", "its",
        "may", "more", "no", "not", "of", "on", "or", "our", "such", "that", "the", "their",
        "then", "there", "these", "they", "this", "to", "us", "was", "we", "were", "will", "with",
        "you", "your",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalizer {
    stop_words: bool,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self { stop_words: true }
    }
}

impl Normalizer {
    pub fn new(stop_words: bool) -> Self {
        Self { stop_words }
    }

    pub fn normalize(&self, raw: &str) -> String {
        let mut buffer = String::with_capacity(raw.len());
        let mut in_word = false;
        for c in raw.chars() {
            if c.is_alphanumeric() {
                buffer.extend(c.to_lowercase());
                in_word = true;
            } else if in_word && (c == '+' || c == '#') {
                buffer.push(c);
            } else {
                buffer.push(' ');
                in_word = false;
            }
        }

        buffer
            .split_whitespace()
            .filter(|token| !self.stop_words || self.keeps(token))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn keeps(&self, token: &str) -> bool {
        let symbolic = token.ends_with('+') || token.ends_with('#');
        (symbolic || token.chars().count() > 1) && !STOP_WORDS.contains(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_strips_punctuation_and_collapses_whitespace() {
        let normalizer = Normalizer::new(false);
        assert_eq!(
            normalizer.normalize("  Senior   Backend-Engineer,\n(Distributed Systems)! "),
            "senior backend engineer distributed systems"
        );
    }

    #[test]
    fn keeps_language_names_with_symbols() {
        let normalizer = Normalizer::default();
        assert_eq!(
            normalizer.normalize("C++ / C# and F# developer"),
            "c++ c# f# developer"
        );
    }

    #[test]
    fn drops_stop_words_and_single_letters() {
        let normalizer = Normalizer::default();
        assert_eq!(
            normalizer.normalize("The engineer of a team in R and Go"),
            "engineer team go"
        );
    }

    #[test]
    fn is_deterministic_and_idempotent() {
        let normalizer = Normalizer::default();
        let once = normalizer.normalize("Rust / Tokio — async services, 5+ years");
        assert_eq!(once, normalizer.normalize("Rust / Tokio — async services, 5+ years"));
        assert_eq!(once, normalizer.normalize(&once));
    }

    #[test]
    fn empty_and_symbol_only_input_is_empty() {
        let normalizer = Normalizer::default();
        assert_eq!(normalizer.normalize(""), "");
        assert_eq!(normalizer.normalize("*** --- !!!"), "");
    }
}
