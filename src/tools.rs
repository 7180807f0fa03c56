//! # Web Search Port
//!
//! The research stage only sees [`WebSearch`]: a query goes in, one string of
//! result snippets comes out. Two implementations:
//! - [`MockSearch`]: deterministic placeholder, no network
//! - [`TavilySearch`]: the Tavily Search API over reqwest
//!
//! Like the completion port, search is total. Empty results and provider
//! failures come back as sentinel strings.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default Tavily endpoint
const TAVILY_BASE_URL: &str = "https://api.tavily.com";

/// Maximum retry attempts for transient failures
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds)
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// Default bound on one `search()` call, retries included
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on a single HTTP attempt
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Snippets are concatenated up to this many characters
const MAX_OUTPUT_CHARS: usize = 4000;

/// Web search capability.
#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Search the web and fold up to `max_results` hits into one string.
    async fn search(&self, query: &str, max_results: usize) -> String;

    /// Provider name for logging
    fn name(&self) -> &str;
}

/// Sentinel for a search that succeeded but found nothing.
pub fn no_results(query: &str) -> String {
    format!("[no results for '{}']", query)
}

/// Sentinel for a search the provider could not serve.
pub fn search_unavailable(query: &str, reason: &str) -> String {
    format!("[search unavailable for '{}': {}]", query, reason)
}

// =============================================================================
// MOCK
// =============================================================================
/// Offline search returning a labeled placeholder.
#[derive(Debug, Clone, Default)]
pub struct MockSearch;

impl MockSearch {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WebSearch for MockSearch {
    async fn search(&self, query: &str, _max_results: usize) -> String {
        format!("[mock search results for '{}']", query)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// =============================================================================
// TAVILY
// =============================================================================
/// Typed errors for the Tavily API. They never leave this module.
#[derive(Debug, Error)]
pub enum TavilyError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("unauthorized - check API key")]
    Unauthorized,

    #[error("rate limited - too many requests")]
    RateLimited,

    #[error("server error ({0}): {1}")]
    ServerError(u16, String),

    #[error("HTTP error ({0}): {1}")]
    HttpError(u16, String),

    #[error("failed to parse response: {0}")]
    ParseError(String),
}

impl TavilyError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            TavilyError::Timeout
                | TavilyError::Connection(_)
                | TavilyError::RateLimited
                | TavilyError::ServerError(_, _)
        )
    }
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    query: &'a str,
    max_results: usize,
    search_depth: &'static str,
    include_answer: bool,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

/// Live search through the Tavily Search API.
pub struct TavilySearch {
    api_key: String,
    client: Client,
    base_url: String,
    /// Bound on the whole call, retries and backoff included
    call_timeout: Duration,
    request_timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl TavilySearch {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: Client::new(),
            base_url: TAVILY_BASE_URL.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: MAX_RETRIES,
            retry_base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
        }
    }

    /// Point the client at another endpoint (used by tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Bound the whole `search()` call. A single attempt never outlives it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self.request_timeout = self.request_timeout.min(timeout);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout.min(self.call_timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    async fn execute_with_retry(
        &self,
        request: &TavilyRequest<'_>,
    ) -> Result<TavilyResponse, TavilyError> {
        let mut attempt = 0;
        loop {
            match self.execute_single_request(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Tavily request failed, will retry");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute_single_request(
        &self,
        request: &TavilyRequest<'_>,
    ) -> Result<TavilyResponse, TavilyError> {
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TavilyError::Timeout
                } else if e.is_connect() {
                    TavilyError::Connection(e.to_string())
                } else {
                    TavilyError::Network(e.to_string())
                }
            })?;

        let status = response.status();

        if status.is_success() {
            return response
                .json::<TavilyResponse>()
                .await
                .map_err(|e| TavilyError::ParseError(e.to_string()));
        }

        let error_text = response.text().await.unwrap_or_default();

        match status.as_u16() {
            401 => Err(TavilyError::Unauthorized),
            429 => Err(TavilyError::RateLimited),
            500..=599 => Err(TavilyError::ServerError(status.as_u16(), error_text)),
            code => Err(TavilyError::HttpError(code, error_text)),
        }
    }
}

#[async_trait]
impl WebSearch for TavilySearch {
    async fn search(&self, query: &str, max_results: usize) -> String {
        info!(query = %query, "Performing web search");

        let request = TavilyRequest {
            query,
            max_results: max_results.clamp(1, 20),
            search_depth: "basic",
            include_answer: false,
        };

        let call = self.execute_with_retry(&request);
        let outcome = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(query = %query, timeout_secs = self.call_timeout.as_secs(), "Search timed out");
                return search_unavailable(query, "timed out");
            }
        };

        match outcome {
            Ok(response) if response.results.is_empty() => {
                warn!(query = %query, "No search results found");
                no_results(query)
            }
            Ok(response) => {
                info!(query = %query, count = response.results.len(), "Search completed");
                format_results(&response.results, max_results)
            }
            Err(e) => {
                warn!(query = %query, error = %e, "Search failed");
                search_unavailable(query, &e.to_string())
            }
        }
    }

    fn name(&self) -> &str {
        "tavily"
    }
}

/// Concatenate result snippets and cut the whole at [`MAX_OUTPUT_CHARS`].
fn format_results(results: &[TavilyResult], max_results: usize) -> String {
    let joined = results
        .iter()
        .take(max_results)
        .map(|r| format!("{} ({}): {}", r.title, r.url, r.content.trim()))
        .collect::<Vec<_>>()
        .join("\n");

    truncate_chars(&joined, MAX_OUTPUT_CHARS)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            debug!(original_len = text.len(), "Truncating search output");
            format!("{}...[truncated]", &text[..cut])
        }
        None => text.to_string(),
    }
}
