use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::engine::HoldPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("both DAYBOOK_TLS_CERT and DAYBOOK_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Server settings, read from `DAYBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub hold_policy: HoldPolicy,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "daybook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            hold_policy: HoldPolicy::Checked,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            bind: lookup("DAYBOOK_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "DAYBOOK_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("DAYBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("DAYBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "DAYBOOK_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "DAYBOOK_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            hold_policy: parsed(&lookup, "DAYBOOK_HOLD_POLICY")?.unwrap_or(defaults.hold_policy),
            tls_cert: lookup("DAYBOOK_TLS_CERT"),
            tls_key: lookup("DAYBOOK_TLS_KEY"),
            metrics_port: parsed(&lookup, "DAYBOOK_METRICS_PORT")?,
        };
        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("daybook.wal")
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
