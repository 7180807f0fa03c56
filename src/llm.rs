//! # Text Completion Port
//!
//! The planner and writer stages only ever see [`TextCompletion`]: an
//! ordered list of turns goes in, the extracted text comes out. Provider
//! response shapes and provider errors stay behind this interface.
//!
//! Two implementations exist:
//! - [`MockCompletion`]: deterministic, offline, used when no key is set
//! - [`RigCompletion`]: an OpenAI chat model driven through Rig

use std::time::Duration;

use async_trait::async_trait;
use rig::client::{CompletionClient, ProviderClient};
use rig::completion::Prompt;
use rig::providers::openai;
use tracing::{debug, warn};

use crate::state::{Message, Role};

/// Prefix of the sentinel returned when the live provider fails.
pub const COMPLETION_UNAVAILABLE: &str = "[completion unavailable";

/// Text completion capability.
///
/// Implementations must be total: provider failures are reported as a
/// sentinel string, never as an error.
#[async_trait]
pub trait TextCompletion: Send + Sync {
    /// Complete a conversation and return the assistant's text.
    async fn complete(&self, turns: &[Message]) -> String;

    /// Provider name for logging
    fn name(&self) -> &str;
}

// =============================================================================
// MOCK
// =============================================================================
/// Offline completion that echoes the last turn.
#[derive(Debug, Clone, Default)]
pub struct MockCompletion;

impl MockCompletion {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TextCompletion for MockCompletion {
    async fn complete(&self, turns: &[Message]) -> String {
        let last = turns.last().map(|m| m.content.as_str()).unwrap_or_default();
        format!("[mock response] Processed: {}", last)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// =============================================================================
// RIG / OPENAI
// =============================================================================
/// Live completion through Rig's OpenAI client.
///
/// System turns are joined into the agent preamble; the last human turn is
/// the prompt.
pub struct RigCompletion {
    client: openai::Client,
    model: String,
    temperature: f64,
    timeout: Duration,
}

impl RigCompletion {
    /// Create a provider with an explicit API key and model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let api_key: String = api_key.into();
        Self {
            client: openai::Client::from_val(api_key.into()),
            model: model.into(),
            temperature: 0.7,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn prompt(&self, turns: &[Message]) -> Result<String, String> {
        let mut builder = self.client.agent(&self.model);

        if let Some(preamble) = system_preamble(turns) {
            builder = builder.preamble(&preamble);
        }

        let agent = builder.temperature(self.temperature).build();

        let prompt = turns
            .iter()
            .rfind(|m| m.role == Role::Human)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        debug!(model = %self.model, prompt_len = prompt.len(), "Sending completion request");

        agent.prompt(&prompt).await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl TextCompletion for RigCompletion {
    async fn complete(&self, turns: &[Message]) -> String {
        match tokio::time::timeout(self.timeout, self.prompt(turns)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(model = %self.model, error = %e, "Completion failed");
                unavailable(&e)
            }
            Err(_) => {
                warn!(model = %self.model, timeout_secs = self.timeout.as_secs(), "Completion timed out");
                unavailable("timed out")
            }
        }
    }

    fn name(&self) -> &str {
        "openai"
    }
}

fn unavailable(reason: &str) -> String {
    format!("{}: {}]", COMPLETION_UNAVAILABLE, reason)
}

/// Join all system turns into one preamble.
fn system_preamble(turns: &[Message]) -> Option<String> {
    let system: Vec<&str> = turns
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    }
}
