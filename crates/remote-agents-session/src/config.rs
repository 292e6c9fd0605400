//! Client settings and timing knobs.

use std::{path::Path, time::Duration};

use remote_agents_core::{SettingsError, SettingsProvider};
use serde::{Deserialize, Deserializer};
use url::Url;

/// Default silence allowed while a request is outstanding.
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Timers and limits used by the session controller.
///
/// In TOML every duration is given in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Quiet period before a text snapshot is emitted.
    #[serde(rename = "debounce_ms", deserialize_with = "millis")]
    pub debounce: Duration,
    /// How often the watchdog checks for silence.
    #[serde(rename = "watchdog_poll_ms", deserialize_with = "millis")]
    pub watchdog_poll: Duration,
    /// How long an abort waits for the server before resolving locally.
    #[serde(rename = "abort_timeout_ms", deserialize_with = "millis")]
    pub abort_timeout: Duration,
    /// Recheck interval while a send waits for a connection.
    #[serde(rename = "deferred_send_ms", deserialize_with = "millis")]
    pub deferred_send: Duration,
    /// Bound on dial plus liveness probe.
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Duration,
    /// How long a deferred model switch waits for the current request.
    #[serde(rename = "model_switch_timeout_ms", deserialize_with = "millis")]
    pub model_switch_timeout: Duration,
    /// Send attempts per message before it is dropped.
    pub max_retries: u32,
    /// Delay before retry `n` (1-based) is `retry_delays[n - 1]`.
    #[serde(rename = "retry_delays_ms", deserialize_with = "millis_list")]
    pub retry_delays: Vec<Duration>,
    /// First reconnect delay.
    #[serde(rename = "reconnect_base_ms", deserialize_with = "millis")]
    pub reconnect_base: Duration,
    /// Attempt number after which the reconnect delay stops doubling.
    pub reconnect_growth_cap: u32,
    /// Upper bound (exclusive) of the random reconnect jitter.
    #[serde(rename = "reconnect_jitter_ms", deserialize_with = "millis")]
    pub reconnect_jitter: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            watchdog_poll: Duration::from_secs(5),
            abort_timeout: Duration::from_secs(3),
            deferred_send: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            model_switch_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
            reconnect_base: Duration::from_secs(1),
            reconnect_growth_cap: 4,
            reconnect_jitter: Duration::from_millis(500),
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn millis_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
    let raw = Vec::<u64>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(Duration::from_millis).collect())
}

fn secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

const fn default_processing_timeout() -> Duration {
    DEFAULT_PROCESSING_TIMEOUT
}

/// File-backed settings.
///
/// ```toml
/// server_url = "https://agents.example.com"
/// auth_token = "..."
/// processing_timeout_secs = 600
///
/// [timing]
/// debounce_ms = 80
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    /// Base URL of the service (`http`, `https`, `ws` or `wss`).
    pub server_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(
        default = "default_processing_timeout",
        rename = "processing_timeout_secs",
        deserialize_with = "secs"
    )]
    pub processing_timeout: Duration,
    #[serde(default)]
    pub timing: Timing,
}

impl ClientSettings {
    /// Settings with defaults for everything but the URL.
    #[must_use]
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            auth_token: None,
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            timing: Timing::default(),
        }
    }

    /// Attach a bearer credential.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Override the processing timeout.
    #[must_use]
    pub const fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    /// Parse settings from TOML and check the URL resolves.
    ///
    /// # Errors
    /// Returns error if the TOML is invalid or the URL cannot be resolved.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(raw)?;
        resolve_endpoint(&settings.server_url)?;
        Ok(settings)
    }

    /// Load settings from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }
}

impl SettingsProvider for ClientSettings {
    fn endpoint(&self) -> Result<Url, SettingsError> {
        resolve_endpoint(&self.server_url)
    }

    fn processing_timeout(&self) -> Duration {
        self.processing_timeout
    }

    fn auth_token(&self) -> Option<String> {
        self.auth_token.clone()
    }
}

/// Turn a configured base URL into the websocket endpoint.
///
/// `http`/`https` map to `ws`/`wss`, and an empty path becomes `/ws`.
///
/// # Errors
/// Returns error if the URL does not parse or uses another scheme.
pub fn resolve_endpoint(raw: &str) -> Result<Url, SettingsError> {
    let mut url =
        Url::parse(raw.trim()).map_err(|e| SettingsError::InvalidEndpoint(format!("{raw}: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(SettingsError::UnsupportedScheme(other.to_owned())),
    };
    url.set_scheme(scheme)
        .map_err(|()| SettingsError::UnsupportedScheme(url.scheme().to_owned()))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}
