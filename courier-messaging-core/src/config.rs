// courier-messaging-core/src/config.rs
//! Broker address, facade options and per-call overrides.
//!
//! `Settings` and `Options` are fixed once a facade is built. Per-call
//! [`CallOptions`] are merged into a fresh `Options` value with
//! [`Options::merged`]; the facade's own copy is never touched.

use std::{env, path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tracing::Span;

/// Reconnect delays in milliseconds, indexed by consecutive failed dials.
pub const DEFAULT_BACKOFF_MS: [u64; 9] = [100, 200, 500, 1000, 2000, 4000, 8000, 16000, 32000];
pub const DEFAULT_HEARTBEAT_SECS: u16 = 30;
pub const DEFAULT_PREFETCH: u16 = 1;
pub const DEFAULT_BROADCAST_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Broker address. Missing fields fall back to `AMQP_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub user: String,
    pub password: String,
    pub host: String,
    pub vhost: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            user: env::var("AMQP_LOGIN").unwrap_or_default(),
            password: env::var("AMQP_PASSWORD").unwrap_or_default(),
            host: env::var("AMQP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            vhost: env::var("AMQP_VHOST").unwrap_or_default(),
        }
    }

    /// Renders `amqp://[user:password@]host[/vhost]?heartbeat=N`.
    ///
    /// Credentials are only included when both user and password are set.
    pub fn amqp_url(&self, heartbeat: u16) -> String {
        let mut url = String::from("amqp://");
        if !self.user.is_empty() && !self.password.is_empty() {
            url.push_str(&encode(&self.user));
            url.push(':');
            url.push_str(&encode(&self.password));
            url.push('@');
        }
        url.push_str(&self.host);
        if !self.vhost.is_empty() {
            url.push('/');
            url.push_str(&encode(&self.vhost));
        }
        url.push_str(&format!("?heartbeat={heartbeat}"));
        url
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Facade-wide options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Re-establish `on_queue`/`on_broadcast` consumers after their channel dies.
    pub retry_on_error: bool,
    /// AMQP heartbeat in seconds.
    pub heartbeat: u16,
    /// Span every manager and facade log line is recorded in.
    #[serde(skip, default = "Span::none")]
    pub span: Span,
    /// Backoff sequence in milliseconds.
    pub timeout: Vec<u64>,
    pub prefetch: Option<u16>,
    pub ack: bool,
    pub max: Option<usize>,
    pub timeout_ms: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            retry_on_error: false,
            heartbeat: DEFAULT_HEARTBEAT_SECS,
            span: Span::none(),
            timeout: DEFAULT_BACKOFF_MS.to_vec(),
            prefetch: None,
            ack: false,
            max: None,
            timeout_ms: None,
        }
    }
}

impl Options {
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_backoff(mut self, timeout: Vec<u64>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_on_error(mut self, retry: bool) -> Self {
        self.retry_on_error = retry;
        self
    }

    /// A copy of these options with the call-site overrides applied.
    pub fn merged(&self, call: &CallOptions) -> Options {
        Options {
            prefetch: call.prefetch.or(self.prefetch),
            ack: call.ack.unwrap_or(self.ack),
            max: call.max.or(self.max),
            timeout_ms: call.timeout_ms.or(self.timeout_ms),
            ..self.clone()
        }
    }

    pub fn effective_prefetch(&self) -> u16 {
        self.prefetch.unwrap_or(DEFAULT_PREFETCH)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_BROADCAST_TIMEOUT_MS))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_empty() {
            return Err(ConfigError::Invalid("backoff sequence is empty".into()));
        }
        if self.prefetch == Some(0) {
            return Err(ConfigError::Invalid("prefetch must be at least 1".into()));
        }
        if self.max == Some(0) {
            return Err(ConfigError::Invalid("max must be at least 1".into()));
        }
        Ok(())
    }
}

/// Per-call overrides for `ack`, `prefetch`, `max` and `timeout_ms`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct CallOptions {
    pub ack: Option<bool>,
    pub prefetch: Option<u16>,
    pub max: Option<usize>,
    pub timeout_ms: Option<u64>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ack(mut self, ack: bool) -> Self {
        self.ack = Some(ack);
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn max(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// File form of the facade configuration.
///
/// ```toml
/// [settings]
/// host = "rabbit:5672"
/// vhost = "/"
///
/// [options]
/// heartbeat = 15
/// timeout = [100, 500, 1000]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub settings: Settings,
    pub options: Options,
}

impl MessagingConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: MessagingConfig = toml::from_str(raw)?;
        config.options.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}
