//! # Configuration Module
//!
//! Loads provider credentials and tuning knobs from environment variables
//! (and an optional `.env` file). The research core never reads the
//! environment itself: it only learns, through [`Config::live_completion`]
//! and [`Config::live_search`], whether a live provider is available.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================
/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{name} has an invalid value '{value}': {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Invalid(String),
}

// =============================================================================
// CONFIGURATION STRUCT
// =============================================================================
/// Main configuration for the research agent.
///
/// # Rust Concept: Option for "maybe configured"
///
/// API keys are `Option<String>`: `None` means the provider is not
/// configured and the offline mock port is used instead.
#[derive(Clone)]
pub struct Config {
    /// OpenAI API key for the live text-completion port
    pub openai_api_key: Option<String>,

    /// Chat model used by the live text-completion port
    pub model: String,

    /// Tavily API key for the live web-search port
    pub tavily_api_key: Option<String>,

    /// Temperature for LLM responses (0.0 = deterministic, 2.0 = creative)
    pub temperature: f64,

    /// Maximum number of search results folded into one research step
    pub max_search_results: usize,

    /// Upper bound on a single provider call
    pub provider_timeout: Duration,

    /// JSON file holding the run-log
    pub runs_path: PathBuf,

    /// Address the HTTP/WebSocket server binds to
    pub host: String,
    pub port: u16,

    /// Log filter for the application
    pub log_level: String,
}

// Keys must never end up in logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("tavily_api_key", &self.tavily_api_key.as_ref().map(|_| "***"))
            .field("temperature", &self.temperature)
            .field("max_search_results", &self.max_search_results)
            .field("provider_timeout", &self.provider_timeout)
            .field("runs_path", &self.runs_path)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("log_level", &self.log_level)
            .finish()
    }
}

// =============================================================================
// DEFAULT IMPLEMENTATION
// =============================================================================
impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            model: "gpt-4o-mini".to_string(),
            tavily_api_key: None,

            // Moderate temperature - balanced between creativity and focus
            temperature: 0.7,

            // Three snippets per research goal
            max_search_results: 3,

            provider_timeout: Duration::from_secs(60),
            runs_path: PathBuf::from("runs.json"),
            host: "127.0.0.1".to_string(),
            port: 8000,
            log_level: "info".to_string(),
        }
    }
}

// =============================================================================
// CONFIGURATION LOADING
// =============================================================================
impl Config {
    /// Load configuration from environment variables.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    /// Blank key variables count as unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut config = Config::default();

        config.openai_api_key = non_empty_var("OPENAI_API_KEY");
        config.tavily_api_key = non_empty_var("TAVILY_API_KEY");

        if let Some(val) = non_empty_var("OPENAI_MODEL") {
            config.model = val;
        }

        if let Ok(val) = env::var("TEMPERATURE") {
            config.temperature = parse_var("TEMPERATURE", &val)?;
        }

        if let Ok(val) = env::var("MAX_SEARCH_RESULTS") {
            config.max_search_results = parse_var("MAX_SEARCH_RESULTS", &val)?;
        }

        if let Ok(val) = env::var("PROVIDER_TIMEOUT_SECS") {
            config.provider_timeout = Duration::from_secs(parse_var("PROVIDER_TIMEOUT_SECS", &val)?);
        }

        if let Some(val) = non_empty_var("RUNS_PATH") {
            config.runs_path = PathBuf::from(val);
        }

        if let Some(val) = non_empty_var("HOST") {
            config.host = val;
        }

        if let Ok(val) = env::var("PORT") {
            config.port = parse_var("PORT", &val)?;
        }

        if let Ok(val) = env::var("RUST_LOG") {
            config.log_level = val;
        }

        Ok(config)
    }

    /// Validate the configuration before anything is built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "TEMPERATURE must be between 0.0 and 2.0, got: {}",
                self.temperature
            )));
        }

        if self.max_search_results == 0 {
            return Err(ConfigError::Invalid(
                "MAX_SEARCH_RESULTS must be at least 1".to_string(),
            ));
        }

        if self.provider_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "PROVIDER_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("OPENAI_MODEL cannot be empty".to_string()));
        }

        Ok(())
    }

    /// Whether the live text-completion provider can be used.
    pub fn live_completion(&self) -> bool {
        self.openai_api_key.is_some()
    }

    /// Whether the live web-search provider can be used.
    pub fn live_search(&self) -> bool {
        self.tavily_api_key.is_some()
    }

    /// Names of the provider keys that are not configured.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.live_completion() {
            missing.push("OPENAI_API_KEY");
        }
        if !self.live_search() {
            missing.push("TAVILY_API_KEY");
        }
        missing
    }

    /// `host:port` for the server listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

// =============================================================================
// UNIT TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.model, "gpt-4o-mini");
        assert!((config.temperature - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.max_search_results, 3);
        assert_eq!(config.address(), "127.0.0.1:8000");
        assert!(!config.live_completion());
        assert!(!config.live_search());
    }

    #[test]
    fn test_config_validation_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_temperature() {
        let mut config = Config::default();
        config.temperature = 3.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_search_results() {
        let mut config = Config::default();
        config.max_search_results = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_timeout() {
        let mut config = Config::default();
        config.provider_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_keys() {
        let mut config = Config::default();
        assert_eq!(config.missing_keys(), vec!["OPENAI_API_KEY", "TAVILY_API_KEY"]);

        config.tavily_api_key = Some("tvly-test".to_string());
        assert_eq!(config.missing_keys(), vec!["OPENAI_API_KEY"]);
        assert!(config.live_search());
    }

    #[test]
    fn test_debug_redacts_keys() {
        let mut config = Config::default();
        config.openai_api_key = Some("sk-secret".to_string());
        let printed = format!("{:?}", config);
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn test_parse_var_reports_name() {
        let err = parse_var::<usize>("MAX_SEARCH_RESULTS", "many").unwrap_err();
        assert!(err.to_string().contains("MAX_SEARCH_RESULTS"));
    }
}
