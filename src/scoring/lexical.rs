use async_trait::async_trait;
use std::collections::HashSet;

use super::{ScoringError, ScoringProvider};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "did", "do", "does", "for", "from", "had",
    "has", "have", "how", "i", "in", "is", "it", "its", "of", "on", "or", "that", "the", "this",
    "to", "was", "were", "what", "when", "where", "which", "who", "why", "will", "with",
];

/// Lowercased alphanumeric tokens with stopwords removed.
pub fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn term_set(text: &str) -> HashSet<String> {
    terms(text).into_iter().collect()
}

/// Share of `needles` found in `haystack`; 0 when there is nothing to find.
fn coverage(needles: &HashSet<String>, haystack: &HashSet<String>) -> f64 {
    if needles.is_empty() {
        return 0.0;
    }
    needles.intersection(haystack).count() as f64 / needles.len() as f64
}

/// Offline provider scoring by term overlap. Deterministic and free, useful
/// for smoke runs and comparisons between retrieval settings.
#[derive(Debug, Default)]
pub struct LexicalProvider;

impl LexicalProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ScoringProvider for LexicalProvider {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn answer_correctness(
        &self,
        _query: &str,
        response: &str,
        expected: &str,
    ) -> Result<f64, ScoringError> {
        let got = term_set(response);
        let want = term_set(expected);
        let precision = coverage(&got, &want);
        let recall = coverage(&want, &got);
        if precision + recall == 0.0 {
            return Ok(0.0);
        }
        Ok(2.0 * precision * recall / (precision + recall))
    }

    async fn answer_relevance(&self, query: &str, response: &str) -> Result<f64, ScoringError> {
        Ok(coverage(&term_set(query), &term_set(response)))
    }

    async fn context_relevance(&self, query: &str, context: &str) -> Result<f64, ScoringError> {
        Ok(coverage(&term_set(query), &term_set(context)))
    }

    async fn groundedness(
        &self,
        contexts: &[String],
        response: &str,
    ) -> Result<f64, ScoringError> {
        let support: HashSet<String> = contexts.iter().flat_map(|c| terms(c)).collect();
        Ok(coverage(&term_set(response), &support))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terms() {
        assert_eq!(
            terms("When did the Harbor freeze?"),
            vec!["harbor".to_string(), "freeze".to_string()]
        );
        assert!(terms("... !!").is_empty());
    }

    #[tokio::test]
    async fn test_answer_correctness_f1() {
        let p = LexicalProvider::new();
        let exact = p
            .answer_correctness("q", "Paris France", "paris france")
            .await
            .unwrap();
        assert!((exact - 1.0).abs() < f64::EPSILON);

        let partial = p.answer_correctness("q", "Paris", "Paris France").await.unwrap();
        assert!((partial - 2.0 / 3.0).abs() < 1e-9);

        let none = p.answer_correctness("q", "Berlin", "Paris").await.unwrap();
        assert_eq!(none, 0.0);
    }

    #[tokio::test]
    async fn test_relevance_and_groundedness() {
        let p = LexicalProvider::new();
        assert_eq!(
            p.answer_relevance("harbor freeze", "the harbor froze").await.unwrap(),
            0.5
        );
        let grounded = p
            .groundedness(&["harbor froze january".to_string()], "harbor froze")
            .await
            .unwrap();
        assert_eq!(grounded, 1.0);
        assert_eq!(p.groundedness(&[], "").await.unwrap(), 0.0);
    }
}
