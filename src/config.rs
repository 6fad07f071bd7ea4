use std::{fmt::Display, str::FromStr, time::Duration};

use anyhow::{anyhow, bail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format {other:?}"),
        }
    }
}

/// Runtime settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    /// Base URL of the REST user/group-chat service. When unset the SQLite
    /// store answers auth and directory lookups itself.
    pub directory_url: Option<String>,
    pub directory_service_token: Option<String>,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub auth_timeout: Duration,
    pub max_message_len: usize,
    pub upstream_retries: u32,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8081".to_owned(),
            database_url: "sqlite::memory:".to_owned(),
            directory_url: None,
            directory_service_token: None,
            idle_timeout: Duration::from_secs(90),
            reap_interval: Duration::from_secs(15),
            auth_timeout: Duration::from_secs(10),
            max_message_len: 4000,
            upstream_retries: 3,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Config::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Config {
            bind_addr: non_empty("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: non_empty("DATABASE_URL").unwrap_or(defaults.database_url),
            directory_url: non_empty("DIRECTORY_URL"),
            directory_service_token: non_empty("DIRECTORY_SERVICE_TOKEN"),
            idle_timeout: secs(non_empty("IDLE_TIMEOUT_SECS"), "IDLE_TIMEOUT_SECS")?
                .unwrap_or(defaults.idle_timeout),
            reap_interval: secs(non_empty("REAP_INTERVAL_SECS"), "REAP_INTERVAL_SECS")?
                .unwrap_or(defaults.reap_interval),
            auth_timeout: secs(non_empty("AUTH_TIMEOUT_SECS"), "AUTH_TIMEOUT_SECS")?
                .unwrap_or(defaults.auth_timeout),
            max_message_len: parse(non_empty("MAX_MESSAGE_LEN"), "MAX_MESSAGE_LEN")?
                .unwrap_or(defaults.max_message_len),
            upstream_retries: parse(non_empty("UPSTREAM_RETRIES"), "UPSTREAM_RETRIES")?
                .unwrap_or(defaults.upstream_retries),
            log_format: parse(non_empty("LOG_FORMAT"), "LOG_FORMAT")?
                .unwrap_or(defaults.log_format),
        };

        if config.idle_timeout.is_zero() {
            bail!("IDLE_TIMEOUT_SECS must be positive");
        }
        if config.reap_interval.is_zero() {
            bail!("REAP_INTERVAL_SECS must be positive");
        }
        if config.max_message_len == 0 {
            bail!("MAX_MESSAGE_LEN must be positive");
        }
        Ok(config)
    }
}

fn parse<T>(value: Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .map(|v| v.trim().parse::<T>().map_err(|e| anyhow!("invalid {key}={v:?}: {e}")))
        .transpose()
}

fn secs(value: Option<String>, key: &str) -> anyhow::Result<Option<Duration>> {
    Ok(parse::<u64>(value, key)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8081");
        assert_eq!(config.database_url, "sqlite::memory:");
        assert!(config.directory_url.is_none());
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn overrides() {
        let config = config(&[
            ("DIRECTORY_URL", "http://localhost:8080/api/v1"),
            ("IDLE_TIMEOUT_SECS", "30"),
            ("MAX_MESSAGE_LEN", "280"),
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "  "),
        ])
        .unwrap();
        assert_eq!(config.directory_url.as_deref(), Some("http://localhost:8080/api/v1"));
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.max_message_len, 280);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.database_url, "sqlite::memory:");
    }

    #[test]
    fn rejects_garbage() {
        let err = config(&[("AUTH_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("AUTH_TIMEOUT_SECS"));
        assert!(config(&[("IDLE_TIMEOUT_SECS", "0")]).is_err());
    }
}
