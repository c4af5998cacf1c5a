//! Mid-turn delegation to a secondary reasoning model
//!
//! The primary low-latency model is instructed (see [`crate::persona`]) to say
//! one of a fixed set of phrases when a query is too complex for it. Matching
//! those phrases in the streaming transcript is the whole trigger mechanism:
//! deterministic, cheap, and independent of the model's internals.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Phrases the persona prompt tells the primary model to emit verbatim
pub const DEFAULT_TRIGGER_PHRASES: &[&str] = &[
    "let me think",
    "let me research",
    "give me a moment",
    "that's a good question",
    "i'll need to look into",
];

/// Spoken when the reasoning gateway fails; the conversation must recover
/// audibly rather than hang silently.
pub const FALLBACK_ANSWER: &str = "I'm sorry, I wasn't able to finish looking \
into that just now. Could you ask me again in a moment?";

/// Instruction wrapper for injecting a delegated answer as a user turn
pub const INJECTION_WRAPPER: &str =
    "Read this analysis aloud naturally, as if it were your own thinking:";

/// Case-insensitive substring matcher over an injectable phrase list
#[derive(Debug, Clone)]
pub struct TriggerMatcher {
    phrases: Vec<String>,
}

impl TriggerMatcher {
    /// Create a matcher from a phrase list; phrases are lowercased.
    #[must_use]
    pub fn new<S: AsRef<str>>(phrases: &[S]) -> Self {
        Self {
            phrases: phrases
                .iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Check whether `text` contains any trigger phrase.
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        let haystack = text.to_lowercase();
        self.phrases.iter().any(|p| haystack.contains(p.as_str()))
    }

    #[must_use]
    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TRIGGER_PHRASES)
    }
}

/// Answer returned by the reasoning gateway
#[derive(Debug, Clone, Deserialize)]
pub struct ReasoningAnswer {
    pub answer: String,
    #[serde(default, rename = "usedSearch")]
    pub used_search: bool,
}

/// Request body sent to the reasoning gateway
#[derive(Debug, Serialize)]
struct ReasoningRequest<'a> {
    query: &'a str,
    context: &'a str,
}

/// Produces a deeper answer for a delegated query
#[async_trait]
pub trait ReasoningGateway: Send + Sync {
    /// Ask the gateway for an answer to `query`, given recent-turn `context`.
    async fn answer(&self, query: &str, context: &str) -> Result<ReasoningAnswer>;
}

/// HTTP reasoning gateway client
pub struct HttpReasoningGateway {
    client: reqwest::Client,
    url: String,
}

impl HttpReasoningGateway {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl ReasoningGateway for HttpReasoningGateway {
    async fn answer(&self, query: &str, context: &str) -> Result<ReasoningAnswer> {
        tracing::debug!(query, "sending delegated query to reasoning gateway");

        let response = self
            .client
            .post(&self.url)
            .json(&ReasoningRequest { query, context })
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "reasoning gateway request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "reasoning gateway error");
            return Err(Error::Reasoning(format!(
                "reasoning gateway error {status}: {body}"
            )));
        }

        let answer: ReasoningAnswer = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse reasoning response");
            e
        })?;

        tracing::info!(
            used_search = answer.used_search,
            chars = answer.answer.len(),
            "delegated answer received"
        );
        Ok(answer)
    }
}
