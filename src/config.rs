//! Environment-driven configuration.
//!
//! Settings come from `DELIVERY_*` environment variables, optionally seeded
//! from a `.env` file. Only the API URL and the auth token are required.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;
use tracing::debug;
use zeroize::Zeroizing;

use crate::api::{normalize_base_url, DEFAULT_TIMEOUT};
use crate::error::ConfigError;
use crate::tracking::{ReconnectPolicy, TrackingClientConfig, DEFAULT_FALLBACK_REFRESH};

pub const ENV_API_URL: &str = "DELIVERY_API_URL";
pub const ENV_SOCKET_URL: &str = "DELIVERY_SOCKET_URL";
pub const ENV_AUTH_TOKEN: &str = "DELIVERY_AUTH_TOKEN";
pub const ENV_USER_ID: &str = "DELIVERY_USER_ID";
pub const ENV_DRIVER_ID: &str = "DELIVERY_DRIVER_ID";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "DELIVERY_REQUEST_TIMEOUT_SECS";
pub const ENV_FALLBACK_REFRESH_SECS: &str = "DELIVERY_FALLBACK_REFRESH_SECS";
pub const ENV_RECONNECT_BASE_MS: &str = "DELIVERY_RECONNECT_BASE_MS";
pub const ENV_RECONNECT_MAX_MS: &str = "DELIVERY_RECONNECT_MAX_MS";
pub const ENV_LOG_DIR: &str = "DELIVERY_LOG_DIR";
pub const ENV_LOG_JSON: &str = "DELIVERY_LOG_JSON";

/// Path of the live channel when it is derived from the API URL.
const DEFAULT_SOCKET_PATH: &str = "/ws";

#[derive(Clone)]
pub struct Config {
    pub api_url: String,
    pub socket_url: String,
    pub auth_token: Zeroizing<String>,
    pub user_id: Option<String>,
    pub driver_id: Option<String>,
    pub request_timeout: Duration,
    /// `None` when set to 0.
    pub fallback_refresh: Option<Duration>,
    pub reconnect: ReconnectPolicy,
    pub log_dir: Option<PathBuf>,
    pub log_json: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_url", &self.api_url)
            .field("socket_url", &self.socket_url)
            .field("auth_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("driver_id", &self.driver_id)
            .field("request_timeout", &self.request_timeout)
            .field("fallback_refresh", &self.fallback_refresh)
            .field("reconnect", &self.reconnect)
            .field("log_dir", &self.log_dir)
            .field("log_json", &self.log_json)
            .finish()
    }
}

/// Load `.env` from the working directory (or a parent) if there is one.
/// Variables already set in the environment win.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => debug!(path = %path.display(), "Loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => eprintln!("Warning: Could not load .env file: {e}"),
    }
}

/// `http(s)://host[:port]/...` to `ws(s)://host[:port]/ws`.
pub fn derive_socket_url(api_url: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::Invalid {
        key: ENV_API_URL,
        value: api_url.to_string(),
    };
    let mut url = Url::parse(api_url).map_err(|_| invalid())?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return Err(invalid()),
    };
    url.set_scheme(scheme).map_err(|_| invalid())?;
    url.set_path(DEFAULT_SOCKET_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_url = normalize_base_url(&get(ENV_API_URL).ok_or(ConfigError::Missing(ENV_API_URL))?);
        Url::parse(&api_url).map_err(|_| ConfigError::Invalid {
            key: ENV_API_URL,
            value: api_url.clone(),
        })?;

        let socket_url = match get(ENV_SOCKET_URL) {
            Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => url,
            Some(url) => {
                return Err(ConfigError::Invalid {
                    key: ENV_SOCKET_URL,
                    value: url,
                })
            }
            None => derive_socket_url(&api_url)?,
        };

        let auth_token = Zeroizing::new(get(ENV_AUTH_TOKEN).ok_or(ConfigError::Missing(ENV_AUTH_TOKEN))?);

        let request_timeout = match parse_u64(&get, ENV_REQUEST_TIMEOUT_SECS)? {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    key: ENV_REQUEST_TIMEOUT_SECS,
                    value: "0".into(),
                })
            }
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_TIMEOUT,
        };

        let fallback_refresh = match parse_u64(&get, ENV_FALLBACK_REFRESH_SECS)? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_FALLBACK_REFRESH),
        };

        let defaults = ReconnectPolicy::default();
        let base = parse_u64(&get, ENV_RECONNECT_BASE_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.base);
        let max = parse_u64(&get, ENV_RECONNECT_MAX_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.max);
        if max < base {
            return Err(ConfigError::Invalid {
                key: ENV_RECONNECT_MAX_MS,
                value: max.as_millis().to_string(),
            });
        }

        let log_json = match get(ENV_LOG_JSON).map(|v| v.to_lowercase()) {
            None => false,
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
            Some(v) => {
                return Err(ConfigError::Invalid {
                    key: ENV_LOG_JSON,
                    value: v,
                })
            }
        };

        Ok(Self {
            api_url,
            socket_url,
            auth_token,
            user_id: get(ENV_USER_ID),
            driver_id: get(ENV_DRIVER_ID),
            request_timeout,
            fallback_refresh,
            reconnect: ReconnectPolicy {
                base,
                max,
                ..defaults
            },
            log_dir: get(ENV_LOG_DIR).map(PathBuf::from),
            log_json,
        })
    }

    pub fn tracking_config(&self) -> TrackingClientConfig {
        TrackingClientConfig {
            socket_url: self.socket_url.clone(),
            fallback_refresh: self.fallback_refresh,
            reconnect: self.reconnect.clone(),
        }
    }

    /// The driver id, required by the delivery update endpoints.
    pub fn require_driver_id(&self) -> Result<&str, ConfigError> {
        self.driver_id
            .as_deref()
            .ok_or(ConfigError::Missing(ENV_DRIVER_ID))
    }
}

fn parse_u64(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    get(key)
        .map(|v| v.parse::<u64>().map_err(|_| ConfigError::Invalid { key, value: v }))
        .transpose()
}
