//! Client configuration.
//!
//! Holds the backend endpoints, request timeouts and local directories used
//! by every other module. Values come from defaults, optionally overridden
//! by `ORDERIT_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Default timeout for gateway requests (30 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the login call; the request is aborted when it elapses.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Proactive token refresh interval. Access tokens expire after 120 minutes.
pub const PROACTIVE_REFRESH_INTERVAL: Duration = Duration::from_secs(105 * 60);

/// Window during which repeated login-required signals collapse into one.
pub const LOGIN_REDIRECT_DEBOUNCE: Duration = Duration::from_secs(3);

const DEFAULT_API_URL: &str = "https://api.orderit.app";

const ENV_API_URL: &str = "ORDERIT_API_URL";
const ENV_WS_URL: &str = "ORDERIT_WS_URL";
const ENV_DATA_DIR: &str = "ORDERIT_DATA_DIR";
const ENV_LOG_DIR: &str = "ORDERIT_LOG_DIR";
const ENV_REQUEST_TIMEOUT: &str = "ORDERIT_REQUEST_TIMEOUT_SECS";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Normalised REST base URL, without trailing slash.
    pub api_url: String,
    /// WebSocket endpoint for live updates.
    pub ws_url: String,
    pub request_timeout: Duration,
    pub login_timeout: Duration,
    pub refresh_interval: Duration,
    pub redirect_debounce: Duration,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl ClientConfig {
    /// Build a config for the given backend with default timeouts and
    /// platform data directories.
    pub fn new(api_url: &str) -> Self {
        let api_url = normalize_base_url(api_url);
        let ws_url = derive_ws_url(&api_url);
        let data_dir = default_data_dir();
        Self {
            api_url,
            ws_url,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            login_timeout: LOGIN_TIMEOUT,
            refresh_interval: PROACTIVE_REFRESH_INTERVAL,
            redirect_debounce: LOGIN_REDIRECT_DEBOUNCE,
            log_dir: data_dir.join("logs"),
            data_dir,
        }
    }

    /// Build a config from `ORDERIT_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let api_url = env_non_empty(ENV_API_URL).unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let mut config = Self::new(&api_url);

        if let Some(ws) = env_non_empty(ENV_WS_URL) {
            config.ws_url = ws;
        }
        if let Some(dir) = env_non_empty(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
            config.log_dir = config.data_dir.join("logs");
        }
        if let Some(dir) = env_non_empty(ENV_LOG_DIR) {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_non_empty(ENV_REQUEST_TIMEOUT).and_then(|v| v.parse::<u64>().ok())
        {
            if secs > 0 {
                config.request_timeout = Duration::from_secs(secs);
            }
        }
        config
    }

    /// Resolve a gateway path against the base URL. Absolute URLs pass
    /// through untouched.
    pub fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if path.starts_with('/') {
            format!("{}{path}", self.api_url)
        } else {
            format!("{}/{path}", self.api_url)
        }
    }

    /// Location of the local SQLite database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("orderit.db")
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Normalise the backend URL:
/// - trim whitespace
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// The socket endpoint lives on the same host; only the scheme changes.
fn derive_ws_url(api_url: &str) -> String {
    let host = api_url
        .strip_prefix("https://")
        .map(|rest| format!("wss://{rest}"))
        .or_else(|| {
            api_url
                .strip_prefix("http://")
                .map(|rest| format!("ws://{rest}"))
        })
        .unwrap_or_else(|| api_url.to_string());
    format!("{host}/socket.io/?EIO=4&transport=websocket")
}

fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("app.orderit.client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn normalize_adds_scheme_and_strips_slashes() {
        assert_eq!(normalize_base_url("api.example.com/"), "https://api.example.com");
        assert_eq!(normalize_base_url("  localhost:3000// "), "http://localhost:3000");
        assert_eq!(
            normalize_base_url("http://10.0.0.2:8080/api/"),
            "http://10.0.0.2:8080/api"
        );
    }

    #[test]
    fn resolve_joins_relative_paths_and_keeps_absolute_urls() {
        let config = ClientConfig::new("https://api.example.com");
        assert_eq!(
            config.resolve("/reservations/r1"),
            "https://api.example.com/reservations/r1"
        );
        assert_eq!(config.resolve("orders"), "https://api.example.com/orders");
        assert_eq!(
            config.resolve("https://cdn.example.com/qr.png"),
            "https://cdn.example.com/qr.png"
        );
    }

    #[test]
    fn ws_url_follows_api_scheme() {
        let secure = ClientConfig::new("https://api.example.com");
        assert_eq!(
            secure.ws_url,
            "wss://api.example.com/socket.io/?EIO=4&transport=websocket"
        );
        let local = ClientConfig::new("localhost:5000");
        assert!(local.ws_url.starts_with("ws://localhost:5000/"));
    }

    #[test]
    #[serial]
    fn from_env_reads_overrides() {
        std::env::set_var(ENV_API_URL, "staging.orderit.app/");
        std::env::set_var(ENV_DATA_DIR, "/tmp/orderit-test");
        std::env::set_var(ENV_REQUEST_TIMEOUT, "7");
        std::env::remove_var(ENV_WS_URL);
        std::env::remove_var(ENV_LOG_DIR);

        let config = ClientConfig::from_env();
        assert_eq!(config.api_url, "https://staging.orderit.app");
        assert_eq!(config.request_timeout, Duration::from_secs(7));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/orderit-test/orderit.db"));
        assert_eq!(config.log_dir, PathBuf::from("/tmp/orderit-test/logs"));

        std::env::remove_var(ENV_API_URL);
        std::env::remove_var(ENV_DATA_DIR);
        std::env::remove_var(ENV_REQUEST_TIMEOUT);
    }

    #[test]
    #[serial]
    fn from_env_ignores_invalid_timeout() {
        std::env::set_var(ENV_REQUEST_TIMEOUT, "soon");
        let config = ClientConfig::from_env();
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        std::env::remove_var(ENV_REQUEST_TIMEOUT);
    }
}
