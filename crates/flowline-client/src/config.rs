use std::env;
use std::time::Duration;

use url::Url;

use crate::error::ConnectionError;
use crate::telemetry::logging::LogConfig;

/// Host used when the caller does not name one.
pub const DEFAULT_ENDPOINT: &str = "runtime.flowline.dev";

const RECOGNIZED_SCHEMES: [&str; 4] = ["https", "http", "wss", "ws"];

/// Connection and retry settings for a flowline client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub endpoint: String,
    pub credential: Option<String>,
    /// Whether lost or failed links are retried.
    pub reconnection: bool,
    pub reconnection_attempts: u32,
    /// Base delay; the n-th retry waits roughly `n * reconnection_delay`.
    pub reconnection_delay: Duration,
    pub reconnection_delay_max: Duration,
    /// Jitter applied to every delay, as a fraction of it (0.0 ..= 1.0).
    pub randomization_factor: f64,
    pub connect_timeout: Duration,
    /// Global subscriber installed by `connect`; `None` leaves logging to
    /// the embedding application.
    pub log: Option<LogConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            credential: None,
            reconnection: true,
            reconnection_attempts: 10,
            reconnection_delay: Duration::from_secs(1),
            reconnection_delay_max: Duration::from_secs(5),
            randomization_factor: 0.5,
            connect_timeout: Duration::from_secs(20),
            log: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from `FLOWLINE_*` environment variables, falling
    /// back to defaults for anything missing or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let endpoint = env::var("FLOWLINE_ENDPOINT")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.endpoint);
        let credential = env::var("FLOWLINE_TOKEN")
            .ok()
            .filter(|value| !value.is_empty());
        let reconnection = env::var("FLOWLINE_RECONNECT")
            .map(|value| !matches!(value.trim(), "0" | "false" | "off"))
            .unwrap_or(defaults.reconnection);
        let reconnection_attempts = env::var("FLOWLINE_RECONNECT_ATTEMPTS")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(defaults.reconnection_attempts);
        let connect_timeout = env::var("FLOWLINE_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.connect_timeout);

        Self {
            endpoint,
            credential,
            reconnection,
            reconnection_attempts,
            connect_timeout,
            log: LogConfig::from_env(),
            ..defaults
        }
    }
}

/// Normalize a caller-supplied endpoint into a URL with a scheme.
///
/// Bare hosts get `https://`; `http`, `https`, `ws` and `wss` are kept as given.
pub fn normalize_endpoint(endpoint: &str) -> Result<Url, ConnectionError> {
    let invalid = |reason: String| ConnectionError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };

    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(invalid("endpoint is empty".into()));
    }

    let candidate = match trimmed.split_once("://") {
        Some((scheme, _)) if RECOGNIZED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) => {
            trimmed.to_string()
        }
        Some((scheme, _)) => return Err(invalid(format!("unsupported scheme {scheme:?}"))),
        None => format!("https://{trimmed}"),
    };

    let url = Url::parse(&candidate).map_err(|err| invalid(err.to_string()))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("endpoint has no host".into()));
    }
    Ok(url)
}
