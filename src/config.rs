//! Configuration loading
//!
//! Sources, later ones winning: built-in defaults, an optional TOML file,
//! then `GOVERNOR__SECTION__FIELD` environment variables. A `.env` file is
//! read first if present.

use crate::error::{GovernorError, Result};
use crate::limiter::{IMAGES, REQUESTS, TOKENS};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub limiter: LimiterConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub conversations: ConversationsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from `.env`, an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            ::config::Environment::with_prefix("GOVERNOR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GovernorError::Configuration(e.to_string()))?;

        if config.remote.api_key.is_none() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                config.remote.api_key = Some(SecretString::new(key));
            }
        }

        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        ::config::Config::builder()
            .add_source(::config::File::from_str(toml, ::config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GovernorError::Configuration(e.to_string()))
    }
}

/// Remote API settings
#[derive(Debug, Deserialize)]
pub struct RemoteConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Bearer token; falls back to `OPENAI_API_KEY`
    #[serde(default)]
    pub api_key: Option<SecretString>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_image_model")]
    pub image_model: String,

    #[serde(default = "default_image_size")]
    pub image_size: String,
}

fn default_api_url() -> String { "https://api.openai.com/v1".to_string() }
fn default_model() -> String { "gpt-3.5-turbo".to_string() }
fn default_temperature() -> f32 { 0.3 }
fn default_timeout_ms() -> u64 { 60_000 }
fn default_image_model() -> String { "dall-e-3".to_string() }
fn default_image_size() -> String { "1024x1024".to_string() }

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            timeout_ms: default_timeout_ms(),
            image_model: default_image_model(),
            image_size: default_image_size(),
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Rate limits shared by all outbound calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Interval the limits apply to, in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Max units per interval, by resource; merged over the defaults
    #[serde(default = "default_limits", deserialize_with = "merge_limits")]
    pub limits: HashMap<String, u64>,

    /// Wait before a transient failure is retried, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_interval_secs() -> u64 { 60 }
fn default_retry_backoff_ms() -> u64 { 1000 }

fn default_limits() -> HashMap<String, u64> {
    HashMap::from([
        (REQUESTS.to_string(), 3500),
        (TOKENS.to_string(), 90_000),
        (IMAGES.to_string(), 5),
    ])
}

// A partial table overrides only the resources it names.
fn merge_limits<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let overrides = HashMap::<String, u64>::deserialize(deserializer)?;
    let mut limits = default_limits();
    limits.extend(overrides);
    Ok(limits)
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            limits: default_limits(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl LimiterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Context window settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Input ceiling; the model's known context size when unset
    #[serde(default)]
    pub max_context_tokens: Option<usize>,

    /// Tokens added to the estimate for the expected reply
    #[serde(default)]
    pub completion_reserve_tokens: u64,
}

/// Conversation listing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationsConfig {
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

fn default_list_limit() -> usize { crate::conversation::DEFAULT_LIST_LIMIT }

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self {
            list_limit: default_list_limit(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}
