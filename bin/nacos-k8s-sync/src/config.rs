//! Runtime configuration read from the environment

use std::time::Duration;
use sync_core::ControllerConfig;
use sync_nacos::NacosOptions;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },

    #[error("sync direction {0} is not supported, only to-nacos is")]
    UnsupportedDirection(Direction),
}

/// Which side of the sync is the source of truth
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    ToNacos,
    ToK8s,
    Both,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ToNacos => write!(f, "to-nacos"),
            Direction::ToK8s => write!(f, "to-k8s"),
            Direction::Both => write!(f, "both"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Empty watches every namespace
    pub watched_namespace: String,
    pub direction: Direction,
    pub nacos: NacosOptions,
    pub controller: ControllerConfig,
    pub log_format: LogFormat,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let direction = match var("SYNC_DIRECTION").as_deref().map(str::trim) {
            None | Some("to-nacos") => Direction::ToNacos,
            Some("to-k8s") => Direction::ToK8s,
            Some("both") => Direction::Both,
            Some(other) => return Err(invalid("SYNC_DIRECTION", other)),
        };
        if direction != Direction::ToNacos {
            return Err(ConfigError::UnsupportedDirection(direction));
        }

        let servers: Vec<String> = var("NACOS_SERVERS")
            .ok_or(ConfigError::Missing("NACOS_SERVERS"))?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if servers.is_empty() {
            return Err(ConfigError::Missing("NACOS_SERVERS"));
        }

        let defaults = NacosOptions::default();
        let port = parse_or(&var, "NACOS_PORT", defaults.port)?;
        if port == 0 {
            return Err(invalid("NACOS_PORT", "0"));
        }
        let nacos = NacosOptions {
            namespace_id: var("NACOS_NAMESPACE").unwrap_or_default(),
            servers,
            port,
            context_path: var("NACOS_CONTEXT_PATH").unwrap_or(defaults.context_path),
            timeout: Duration::from_millis(parse_or(
                &var,
                "NACOS_TIMEOUT_MS",
                defaults.timeout.as_millis() as u64,
            )?),
            beat_interval: defaults.beat_interval,
        };

        let controller_defaults = ControllerConfig::default();
        let max_attempts = parse_or(&var, "SYNC_MAX_ATTEMPTS", controller_defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid("SYNC_MAX_ATTEMPTS", "0"));
        }
        let controller = ControllerConfig {
            max_attempts,
            retry_delay: Duration::from_millis(parse_or(
                &var,
                "SYNC_RETRY_DELAY_MS",
                controller_defaults.retry_delay.as_millis() as u64,
            )?),
            ..controller_defaults
        };

        let log_format = match var("LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => return Err(invalid("LOG_FORMAT", other)),
        };

        Ok(Self {
            watched_namespace: var("SYNC_WATCHED_NAMESPACE").unwrap_or_default(),
            direction,
            nacos,
            controller,
            log_format,
        })
    }
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
    }
}

fn parse_or<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value.trim().parse().map_err(|_| invalid(name, &value)),
        None => Ok(default),
    }
}
