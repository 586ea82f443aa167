pub mod lexical;
pub mod openai;

pub use lexical::LexicalProvider;
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::error::HarnessError;

pub const FEEDBACKS_PER_QUERY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    AnswerCorrectness,
    AnswerRelevance,
    ContextRelevance,
    Groundedness,
}

impl FeedbackKind {
    pub const ALL: [FeedbackKind; FEEDBACKS_PER_QUERY] = [
        Self::AnswerCorrectness,
        Self::AnswerRelevance,
        Self::ContextRelevance,
        Self::Groundedness,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnswerCorrectness => "answer_correctness",
            Self::AnswerRelevance => "answer_relevance",
            Self::ContextRelevance => "context_relevance",
            Self::Groundedness => "groundedness",
        }
    }
}

impl fmt::Display for FeedbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown feedback function '{}'", s))
    }
}

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unusable provider response: {0}")]
    Response(String),

    #[error("scoring timed out after {0:?}")]
    Timeout(Duration),
}

/// Source of the raw scores behind the feedback functions. All scores are
/// in [0, 1].
#[async_trait]
pub trait ScoringProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn answer_correctness(
        &self,
        query: &str,
        response: &str,
        expected: &str,
    ) -> Result<f64, ScoringError>;

    async fn answer_relevance(&self, query: &str, response: &str) -> Result<f64, ScoringError>;

    async fn context_relevance(&self, query: &str, context: &str) -> Result<f64, ScoringError>;

    async fn groundedness(&self, contexts: &[String], response: &str)
        -> Result<f64, ScoringError>;
}

/// The recorded interaction a feedback function is evaluated on.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackInput {
    pub query: String,
    pub response: String,
    pub contexts: Vec<String>,
    pub expected: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackOutcome {
    Score(f64),
    Skip(String),
}

pub async fn evaluate(
    provider: &dyn ScoringProvider,
    kind: FeedbackKind,
    input: &FeedbackInput,
) -> Result<FeedbackOutcome, ScoringError> {
    let score = match kind {
        FeedbackKind::AnswerCorrectness => {
            let Some(expected) = input.expected.as_deref().filter(|e| !e.trim().is_empty())
            else {
                return Ok(FeedbackOutcome::Skip("no golden answer for query".into()));
            };
            provider
                .answer_correctness(&input.query, &input.response, expected)
                .await?
        }
        FeedbackKind::AnswerRelevance => {
            provider
                .answer_relevance(&input.query, &input.response)
                .await?
        }
        FeedbackKind::ContextRelevance => {
            if input.contexts.is_empty() {
                return Ok(FeedbackOutcome::Skip("no retrieved context".into()));
            }
            let mut total = 0.0;
            for context in &input.contexts {
                total += provider.context_relevance(&input.query, context).await?;
            }
            total / input.contexts.len() as f64
        }
        FeedbackKind::Groundedness => {
            if input.contexts.is_empty() {
                return Ok(FeedbackOutcome::Skip("no retrieved context".into()));
            }
            provider
                .groundedness(&input.contexts, &input.response)
                .await?
        }
    };
    Ok(FeedbackOutcome::Score(score.clamp(0.0, 1.0)))
}

/// Build the scoring provider named in the config (or overridden on the
/// command line).
pub fn build_provider(
    config: &Config,
    name_override: Option<&str>,
    model_override: Option<&str>,
) -> Result<Arc<dyn ScoringProvider>, HarnessError> {
    let name = name_override.unwrap_or(&config.scoring_provider);
    let model = model_override
        .map(str::to_string)
        .or_else(|| config.scoring_model.clone());

    match name.to_ascii_lowercase().as_str() {
        "lexical" => Ok(Arc::new(LexicalProvider::new())),
        "openai" => {
            let api_key = config.openai_api_key.clone().ok_or_else(|| {
                HarnessError::configuration("OPENAI_API_KEY must be set for the openai provider")
            })?;
            let provider = OpenAiProvider::new(
                &config.openai_base_url,
                api_key,
                model,
                Duration::from_secs(config.scoring_timeout_secs),
            )
            .map_err(|e| HarnessError::configuration(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        other => Err(HarnessError::configuration(format!(
            "unsupported scoring provider '{}' (expected lexical or openai)",
            other
        ))),
    }
}
