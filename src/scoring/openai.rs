use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use super::{ScoringError, ScoringProvider};

const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

const SYSTEM_PROMPT: &str = "You are a strict grader for a retrieval-augmented QA system. \
Reply with a single integer rating from 0 (worst) to 10 (best) and nothing else.";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// LLM-as-judge provider for any OpenAI-compatible chat completions API.
pub struct OpenAiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(
        base_url: &str,
        api_key: String,
        model: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ScoringError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }

    async fn rate(&self, prompt: String) -> Result<f64, ScoringError> {
        let request = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let body: ChatResponse = resp.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ScoringError::Response("empty completion".into()))?;
        debug!(model = %self.model, reply = %content, "Judge reply");
        parse_rating(&content)
    }
}

/// Extract the first 0-10 rating from a judge reply, normalised to [0, 1].
pub fn parse_rating(reply: &str) -> Result<f64, ScoringError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\d+(\.\d+)?").expect("valid rating pattern"));

    let value: f64 = re
        .find(reply)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| ScoringError::Response(format!("no rating in reply: {:?}", reply)))?;
    if !(0.0..=10.0).contains(&value) {
        return Err(ScoringError::Response(format!(
            "rating {} outside 0-10",
            value
        )));
    }
    Ok(value / 10.0)
}

#[async_trait]
impl ScoringProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn answer_correctness(
        &self,
        query: &str,
        response: &str,
        expected: &str,
    ) -> Result<f64, ScoringError> {
        self.rate(format!(
            "How well does the RESPONSE agree with the EXPECTED answer to the QUESTION?\n\
             QUESTION: {}\nEXPECTED: {}\nRESPONSE: {}",
            query, expected, response
        ))
        .await
    }

    async fn answer_relevance(&self, query: &str, response: &str) -> Result<f64, ScoringError> {
        self.rate(format!(
            "How relevant is the RESPONSE to the QUESTION?\nQUESTION: {}\nRESPONSE: {}",
            query, response
        ))
        .await
    }

    async fn context_relevance(&self, query: &str, context: &str) -> Result<f64, ScoringError> {
        self.rate(format!(
            "How relevant is the CONTEXT for answering the QUESTION?\nQUESTION: {}\nCONTEXT: {}",
            query, context
        ))
        .await
    }

    async fn groundedness(
        &self,
        contexts: &[String],
        response: &str,
    ) -> Result<f64, ScoringError> {
        self.rate(format!(
            "How well are the statements in the RESPONSE supported by the SOURCES?\n\
             SOURCES:\n{}\nRESPONSE: {}",
            contexts.join("\n---\n"),
            response
        ))
        .await
    }
}
