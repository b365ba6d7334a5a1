// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_HTTP_PORT: u16 = 3774;
const DEFAULT_ENV_FILE: &str = "watchlog.env";
const DEFAULT_INTEGRATIONS_FILE: &str = "integration.json";
const DEFAULT_GITLAB_STATE_FILE: &str = "gitlab-state.json";
const DEFAULT_WATCHLIST_FILE: &str = "log-watchlist.json";
const DEFAULT_NGINX_ACCESS_LOG: &str = "/var/log/nginx/access.log";
const DEFAULT_NGINX_HOST: &str = "127.0.0.1";
const DEFAULT_NGINX_PORT: u16 = 80;
const DEFAULT_NGINX_HEALTHCHECK_TIMEOUT_MS: u64 = 2000;
const DEFAULT_CUSTOM_METRICS_FLUSH_SECS: u64 = 10;
const DEFAULT_SYSTEM_METRICS_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("invalid {service} integration: {reason}")]
    Integration {
        service: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct NginxSettings {
    pub enabled: bool,
    pub access_log: PathBuf,
    pub host: String,
    pub port: u16,
    pub healthcheck_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Collector base url. Without it nothing is forwarded.
    pub server: Option<String>,
    pub api_key: Option<String>,
    /// Explicit machine uuid, usually written back by a previous run.
    pub uuid: Option<String>,
    pub env_file: PathBuf,
    pub log_level: String,
    pub http_port: u16,
    pub integrations_path: PathBuf,
    pub gitlab_state_path: PathBuf,
    pub watchlist_path: PathBuf,
    pub monitor_system: bool,
    pub system_metrics_interval: Duration,
    pub custom_metrics_flush_interval: Duration,
    pub nginx: NginxSettings,
}

impl Config {
    pub fn new() -> anyhow::Result<Config> {
        let server = non_empty_var("WATCHLOG_SERVER");
        let api_key = non_empty_var("WATCHLOG_APIKEY");
        let uuid = non_empty_var("UUID");

        let http_port = parse_var("WATCHLOG_PORT", DEFAULT_HTTP_PORT)?;
        let custom_metrics_flush_secs =
            parse_var("CUSTOM_METRICS_FLUSH_SECS", DEFAULT_CUSTOM_METRICS_FLUSH_SECS)?;
        let system_metrics_secs =
            parse_var("SYSTEM_METRICS_INTERVAL_SECS", DEFAULT_SYSTEM_METRICS_SECS)?;

        let nginx = NginxSettings {
            enabled: bool_var("MONITOR_NGINX", false)?,
            access_log: path_var("NGINX_ACCESS_LOG", DEFAULT_NGINX_ACCESS_LOG),
            host: non_empty_var("NGINX_HOST").unwrap_or_else(|| DEFAULT_NGINX_HOST.to_string()),
            port: parse_var("NGINX_PORT", DEFAULT_NGINX_PORT)?,
            healthcheck_timeout: Duration::from_millis(parse_var(
                "NGINX_HEALTHCHECK_TIMEOUT_MS",
                DEFAULT_NGINX_HEALTHCHECK_TIMEOUT_MS,
            )?),
        };

        Ok(Config {
            server,
            api_key,
            uuid,
            env_file: env_file_path(),
            log_level: log_level(),
            http_port,
            integrations_path: path_var("WATCHLOG_INTEGRATIONS", DEFAULT_INTEGRATIONS_FILE),
            gitlab_state_path: path_var("WATCHLOG_GITLAB_STATE", DEFAULT_GITLAB_STATE_FILE),
            watchlist_path: path_var("WATCHLOG_WATCHLIST", DEFAULT_WATCHLIST_FILE),
            monitor_system: bool_var("MONITOR_SYSTEM", true)?,
            system_metrics_interval: Duration::from_secs(system_metrics_secs.max(1)),
            custom_metrics_flush_interval: Duration::from_secs(custom_metrics_flush_secs.max(1)),
            nginx,
        })
    }
}

/// `WATCHLOG_ENV_FILE`, readable before the env file itself is loaded.
pub fn env_file_path() -> PathBuf {
    path_var("WATCHLOG_ENV_FILE", DEFAULT_ENV_FILE)
}

pub fn log_level() -> String {
    env::var("WATCHLOG_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string())
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn path_var(name: &str, default: &str) -> PathBuf {
    non_empty_var(name).map_or_else(|| PathBuf::from(default), PathBuf::from)
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match non_empty_var(name) {
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}

fn bool_var(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match non_empty_var(name) {
        Some(value) => parse_bool(&value).ok_or(ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Exports `KEY=VALUE` lines of `path` into the process environment without
/// overriding variables that are already set. Returns how many were applied.
pub fn load_env_file(path: &Path) -> Result<usize, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut applied = 0;
    for (key, value) in parse_env_lines(&contents) {
        if env::var_os(&key).is_none() {
            env::set_var(&key, value);
            applied += 1;
        }
    }
    Ok(applied)
}

fn parse_env_lines(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// One entry of the integrations file. Service specific fields stay in `settings`.
#[derive(Debug, Clone, Deserialize)]
pub struct IntegrationDescriptor {
    pub service: String,
    #[serde(default)]
    pub monitor: bool,
    #[serde(flatten)]
    pub settings: serde_json::Map<String, Value>,
}

impl IntegrationDescriptor {
    pub fn settings_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.settings.clone()))
    }
}

pub fn load_integrations(path: &Path) -> Result<Vec<IntegrationDescriptor>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// The first monitored entry for `service`.
pub fn find_monitored<'a>(
    integrations: &'a [IntegrationDescriptor],
    service: &str,
) -> Option<&'a IntegrationDescriptor> {
    integrations
        .iter()
        .find(|descriptor| descriptor.service == service && descriptor.monitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "WATCHLOG_SERVER",
        "WATCHLOG_APIKEY",
        "WATCHLOG_PORT",
        "MONITOR_NGINX",
        "MONITOR_SYSTEM",
        "NGINX_PORT",
        "CUSTOM_METRICS_FLUSH_SECS",
    ];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        let config = Config::new().unwrap();
        assert_eq!(config.server, None);
        assert_eq!(config.http_port, 3774);
        assert!(config.monitor_system);
        assert!(!config.nginx.enabled);
        assert_eq!(
            config.nginx.access_log,
            PathBuf::from("/var/log/nginx/access.log")
        );
        assert_eq!(config.custom_metrics_flush_interval, Duration::from_secs(10));
    }

    #[test]
    #[serial]
    fn test_overrides_and_toggles() {
        clear();
        env::set_var("WATCHLOG_SERVER", "https://collector.example.com");
        env::set_var("WATCHLOG_APIKEY", " key ");
        env::set_var("MONITOR_NGINX", "yes");
        env::set_var("MONITOR_SYSTEM", "false");
        env::set_var("NGINX_PORT", "8080");
        let config = Config::new().unwrap();
        assert_eq!(
            config.server.as_deref(),
            Some("https://collector.example.com")
        );
        assert_eq!(config.api_key.as_deref(), Some("key"));
        assert!(config.nginx.enabled);
        assert!(!config.monitor_system);
        assert_eq!(config.nginx.port, 8080);
        clear();
    }

    #[test]
    #[serial]
    fn test_invalid_port_is_an_error() {
        clear();
        env::set_var("WATCHLOG_PORT", "not-a-port");
        let err = Config::new().unwrap_err();
        assert!(err.to_string().contains("WATCHLOG_PORT"));
        clear();
    }

    #[test]
    fn test_parse_env_lines() {
        let parsed = parse_env_lines("# comment\nWATCHLOG_APIKEY=\"abc\"\n\nexport UUID=u-1\nbroken\n");
        assert_eq!(
            parsed,
            vec![
                ("WATCHLOG_APIKEY".to_string(), "abc".to_string()),
                ("UUID".to_string(), "u-1".to_string()),
            ]
        );
    }

    #[test]
    #[serial]
    fn test_load_env_file_does_not_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchlog.env");
        fs::write(&path, "WATCHLOG_SERVER=http://from-file\nWATCHLOG_APIKEY=file-key\n").unwrap();
        clear();
        env::set_var("WATCHLOG_SERVER", "http://from-env");
        assert_eq!(load_env_file(&path).unwrap(), 1);
        assert_eq!(env::var("WATCHLOG_SERVER").unwrap(), "http://from-env");
        assert_eq!(env::var("WATCHLOG_APIKEY").unwrap(), "file-key");
        assert_eq!(load_env_file(&dir.path().join("missing.env")).unwrap(), 0);
        clear();
    }

    #[test]
    fn test_load_integrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("integration.json");
        fs::write(
            &path,
            r#"[
                {"service": "redis", "monitor": false, "host": "localhost", "port": 6379},
                {"service": "gitlab", "monitor": true, "token": "glpat-x", "projects": [1]}
            ]"#,
        )
        .unwrap();
        let integrations = load_integrations(&path).unwrap();
        assert_eq!(integrations.len(), 2);
        assert!(find_monitored(&integrations, "redis").is_none());
        let gitlab = find_monitored(&integrations, "gitlab").unwrap();
        assert_eq!(gitlab.settings["token"], "glpat-x");

        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_integrations(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
