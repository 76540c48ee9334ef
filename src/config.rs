use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_ADDR: &str = "0.0.0.0:2052";
pub const DEFAULT_TLS_CERT: &str = "ssl/room/certificate.pem";
pub const DEFAULT_TLS_KEY: &str = "ssl/room/private.key";

/// Per-connection bounds applied by every session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// How long a connection may stay silent before it is presumed dead.
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub outbound_capacity: usize,
}

impl SessionLimits {
    /// How often an idle connection is pinged: three tries per idle window.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.idle_timeout / 3).max(Duration::from_millis(1))
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        SessionLimits {
            idle_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(10),
            outbound_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub limits: SessionLimits,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: ([0, 0, 0, 0], 2052).into(),
            tls_cert: PathBuf::from(DEFAULT_TLS_CERT),
            tls_key: PathBuf::from(DEFAULT_TLS_KEY),
            limits: SessionLimits::default(),
        }
    }
}

impl Config {
    /// Read `RELAY_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SessionLimits::default();

        let addr = parse(&lookup, "RELAY_ADDR", DEFAULT_ADDR.parse().ok())?;
        let idle = parse(&lookup, "RELAY_IDLE_TIMEOUT_SECS", Some(defaults.idle_timeout.as_secs()))?;
        let write = parse(&lookup, "RELAY_WRITE_TIMEOUT_SECS", Some(defaults.write_timeout.as_secs()))?;
        let capacity = parse(&lookup, "RELAY_OUTBOUND_CAPACITY", Some(defaults.outbound_capacity))?;

        if capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "RELAY_OUTBOUND_CAPACITY",
                value: "0".to_string(),
            });
        }
        if idle == 0 {
            return Err(ConfigError::Invalid {
                key: "RELAY_IDLE_TIMEOUT_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Config {
            addr,
            tls_cert: lookup("RELAY_TLS_CERT").map_or_else(|| PathBuf::from(DEFAULT_TLS_CERT), PathBuf::from),
            tls_key: lookup("RELAY_TLS_KEY").map_or_else(|| PathBuf::from(DEFAULT_TLS_KEY), PathBuf::from),
            limits: SessionLimits {
                idle_timeout: Duration::from_secs(idle),
                write_timeout: Duration::from_secs(write),
                outbound_capacity: capacity,
            },
        })
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: Option<T>) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => default.ok_or(ConfigError::Invalid {
            key,
            value: String::new(),
        }),
    }
}
