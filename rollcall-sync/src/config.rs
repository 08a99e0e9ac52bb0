//! Environment-driven configuration for the hub binary.
//!
//! | Variable                    | Default          |
//! |-----------------------------|------------------|
//! | `ROLLCALL_BIND`             | `0.0.0.0:$PORT`  |
//! | `PORT`                      | `4000`           |
//! | `ROLLCALL_PATH`             | `/rollcall-ws`   |
//! | `ROLLCALL_RATE_WINDOW_SECS` | `60` (1..=86400) |
//! | `ROLLCALL_RATE_CAPACITY`    | `120`            |
//! | `ROLLCALL_SEALED`           | `false`          |
//! | `ROLLCALL_STORE`            | `file`           |
//! | `ROLLCALL_DATA`             | `data.json`      |

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::hub::HubConfig;
use crate::model::PayloadMode;
use crate::rate_limit::MAX_WINDOW;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Which [`crate::storage::DocumentStore`] implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    Memory,
    #[default]
    File,
    RocksDb,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "file" | "json" => Ok(StoreBackend::File),
            "rocksdb" | "rocks" => Ok(StoreBackend::RocksDb),
            other => Err(format!("unknown store backend `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// File path for `File`, directory for `RocksDb`, unused for `Memory`
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            path: PathBuf::from("data.json"),
        }
    }
}

impl StoreSettings {
    /// Read `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend: StoreBackend = parse_or(&lookup, "ROLLCALL_STORE", StoreBackend::default())?;
        let path = match lookup("ROLLCALL_DATA") {
            Some(path) => PathBuf::from(path),
            None if backend == StoreBackend::RocksDb => PathBuf::from("rollcall-db"),
            None => Self::default().path,
        };
        Ok(Self { backend, path })
    }
}

impl HubConfig {
    /// Read `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = HubConfig::default();

        if let Some(bind) = lookup("ROLLCALL_BIND") {
            config.bind_addr = bind;
        } else if lookup("PORT").is_some() {
            let port: u16 = parse_or(&lookup, "PORT", 4000)?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }

        if let Some(path) = lookup("ROLLCALL_PATH") {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid {
                    key: "ROLLCALL_PATH",
                    value: path,
                    reason: "must start with '/'".into(),
                });
            }
            config.path = path;
        }

        let window_secs: u64 = parse_or(
            &lookup,
            "ROLLCALL_RATE_WINDOW_SECS",
            config.rate_limit.window.as_secs(),
        )?;
        if window_secs == 0 || window_secs > MAX_WINDOW.as_secs() {
            return Err(ConfigError::Invalid {
                key: "ROLLCALL_RATE_WINDOW_SECS",
                value: window_secs.to_string(),
                reason: format!("window must be between 1 and {} seconds", MAX_WINDOW.as_secs()),
            });
        }
        config.rate_limit.window = Duration::from_secs(window_secs);
        config.rate_limit.capacity =
            parse_or(&lookup, "ROLLCALL_RATE_CAPACITY", config.rate_limit.capacity)?;

        if parse_flag(&lookup, "ROLLCALL_SEALED")? {
            config.payload_mode = PayloadMode::Sealed;
        }

        Ok(config)
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(parsed),
            Err(e) => {
                log::warn!("Invalid {key} value: {e}");
                Err(ConfigError::Invalid {
                    key,
                    reason: e.to_string(),
                    value,
                })
            }
        },
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<bool, ConfigError> {
    let Some(value) = lookup(key) else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected a boolean".into(),
        }),
    }
}
