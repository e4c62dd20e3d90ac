//! Environment-driven configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Host for both endpoints.
pub const ENV_HOST: &str = "HYVIEW_HOST";
/// Port of the requester's geometry streaming server.
pub const ENV_PORT: &str = "HYVIEW_PORT";
/// Port of the host's session control server.
pub const ENV_APP_PORT: &str = "HYVIEW_APP_PORT";
/// Directory holding cached geometry artifacts.
pub const ENV_CACHE_DIR: &str = "HYVIEW_CACHE_DIR";
/// Plugin search path.
pub const ENV_PLUGIN_PATH: &str = "HYVIEW_PLUGIN_PATH";
/// Log level used when `RUST_LOG` is unset.
pub const ENV_LOGGING_LEVEL: &str = "HYVIEW_LOGGING_LEVEL";
/// Host status poll interval while a build waits for the host.
pub const ENV_HEARTBEAT_MS: &str = "HYVIEW_HEARTBEAT_MS";

/// Runtime configuration shared by the requester and the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Host both servers bind to and clients connect to.
    pub host: String,
    /// Requester geometry streaming port.
    pub port: u16,
    /// Host session control port.
    pub app_port: u16,
    /// Cache artifact directory.
    pub cache_dir: PathBuf,
    /// Plugin search path, if any.
    pub plugin_path: Option<String>,
    /// Raw log level name.
    pub logging_level: String,
    /// Interval between host status polls during a blocked build.
    #[serde(with = "duration_ms")]
    pub heartbeat: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4242,
            app_port: 4241,
            cache_dir: PathBuf::from("/tmp/hyview"),
            plugin_path: None,
            logging_level: "DEBUG".to_string(),
            heartbeat: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup, falling back to
    /// defaults for anything missing or blank.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(host) = get(ENV_HOST) {
            config.host = host;
        }
        if let Some(port) = get(ENV_PORT) {
            config.port = parse_number(ENV_PORT, &port)?;
        }
        if let Some(port) = get(ENV_APP_PORT) {
            config.app_port = parse_number(ENV_APP_PORT, &port)?;
        }
        if let Some(dir) = get(ENV_CACHE_DIR) {
            config.cache_dir = expand_home(Path::new(&dir));
        }
        config.plugin_path = get(ENV_PLUGIN_PATH);
        if let Some(level) = get(ENV_LOGGING_LEVEL) {
            config.logging_level = level;
        }
        if let Some(ms) = get(ENV_HEARTBEAT_MS) {
            config.heartbeat = Duration::from_millis(parse_number(ENV_HEARTBEAT_MS, &ms)?);
        }

        Ok(config)
    }

    /// `host:port` of the requester's streaming server.
    pub fn requester_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `host:port` of the host's control server.
    pub fn app_addr(&self) -> String {
        format!("{}:{}", self.host, self.app_port)
    }

    /// Tracing filter directive for [`Config::logging_level`].
    pub fn log_directive(&self) -> &'static str {
        log_directive(&self.logging_level)
    }
}

/// Map a log level name onto a tracing filter directive.
///
/// Unknown names fall back to `debug`.
pub fn log_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "CRITICAL" | "FATAL" | "ERROR" => "error",
        "WARN" | "WARNING" => "warn",
        "INFO" => "info",
        "NOTSET" => "trace",
        _ => "debug",
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a number, got {value:?}")))
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    path.to_path_buf()
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.requester_addr(), "127.0.0.1:4242");
        assert_eq!(config.app_addr(), "127.0.0.1:4241");
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/hyview"));
        assert_eq!(config.heartbeat, Duration::from_secs(5));
        assert!(config.plugin_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            (ENV_HOST, "10.0.0.2"),
            (ENV_PORT, "5000"),
            (ENV_APP_PORT, "5001"),
            (ENV_CACHE_DIR, "/var/cache/hyview"),
            (ENV_PLUGIN_PATH, "/a:/b"),
            (ENV_LOGGING_LEVEL, "WARNING"),
            (ENV_HEARTBEAT_MS, "250"),
        ]))
        .unwrap();

        assert_eq!(config.requester_addr(), "10.0.0.2:5000");
        assert_eq!(config.app_addr(), "10.0.0.2:5001");
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/hyview"));
        assert_eq!(config.plugin_path.as_deref(), Some("/a:/b"));
        assert_eq!(config.log_directive(), "warn");
        assert_eq!(config.heartbeat, Duration::from_millis(250));
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = Config::from_lookup(lookup(&[(ENV_PORT, "  "), (ENV_PLUGIN_PATH, "")])).unwrap();
        assert_eq!(config.port, 4242);
        assert!(config.plugin_path.is_none());
    }

    #[test]
    fn test_bad_port_names_the_variable() {
        let err = Config::from_lookup(lookup(&[(ENV_APP_PORT, "lots")])).unwrap_err();
        assert!(err.to_string().contains(ENV_APP_PORT));
    }

    #[test]
    fn test_log_directive_mapping() {
        assert_eq!(log_directive("CRITICAL"), "error");
        assert_eq!(log_directive("fatal"), "error");
        assert_eq!(log_directive("WARN"), "warn");
        assert_eq!(log_directive("INFO"), "info");
        assert_eq!(log_directive("NOTSET"), "trace");
        assert_eq!(log_directive("DEBUG"), "debug");
        assert_eq!(log_directive("chatty"), "debug");
    }

    #[test]
    fn test_heartbeat_serializes_as_millis() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("\"heartbeat\":5000"));
    }
}
