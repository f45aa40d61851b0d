// src/config.rs
//
// Layered configuration: built-in defaults, then an optional Settings.toml,
// then environment variables prefixed APP__, the same precedence
// `artisan_middleware::config::AppConfig` used.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

pub const DEFAULT_SOCKET_ADDRESS: &str = "/var/run/serviced.sock";
pub const DEFAULT_SOCKET_PERMISSIONS: u32 = 0o777;
pub const DEFAULT_LOG_PATH: &str = "/var/log/serviced.log";

/// Runtime settings for the supervisor daemon.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Path to the control-RPC Unix domain socket.
    pub socket_path: String,

    /// Permission bits applied to the socket after bind.
    pub socket_permissions: u32,

    /// Path to the log file sink (in addition to stdout).
    pub log_path: String,

    /// Whether debug-level logging is enabled.
    pub debug_mode: bool,

    /// Poll interval in milliseconds used by the `/proc`-based fallback
    /// process-event source, on targets without a native kqueue facility.
    pub poll_interval_ms: u64,

    /// Seconds a job's `requires` may stay unsatisfied before it is logged
    /// to aid operators.
    pub unsatisfied_requires_warn_after_secs: u64,
}

impl AppConfig {
    /// Loads configuration from defaults, `Settings.toml`, `Settings.<RUN_MODE>.toml`,
    /// and `APP__`-prefixed environment variables, in that order of precedence.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("socket_path", DEFAULT_SOCKET_ADDRESS)?
            .set_default("socket_permissions", DEFAULT_SOCKET_PERMISSIONS as i64)?
            .set_default("log_path", DEFAULT_LOG_PATH)?
            .set_default("debug_mode", true)?
            .set_default("poll_interval_ms", 250i64)?
            .set_default("unsatisfied_requires_warn_after_secs", 60i64)?;

        let builder = builder.add_source(File::with_name("Settings").required(false));
        let builder = builder
            .add_source(File::with_name(&format!("Settings.{}", run_mode)).required(false));
        let builder = builder.add_source(Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Convenience constructor for tests and examples.
    pub fn dummy() -> Self {
        AppConfig {
            socket_path: DEFAULT_SOCKET_ADDRESS.to_owned(),
            socket_permissions: DEFAULT_SOCKET_PERMISSIONS,
            log_path: DEFAULT_LOG_PATH.to_owned(),
            debug_mode: true,
            poll_interval_ms: 250,
            unsatisfied_requires_warn_after_secs: 60,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.socket_path.is_empty() {
            return Err("socket_path must be provided".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_validates() {
        assert!(AppConfig::dummy().validate().is_ok());
    }

    #[test]
    fn empty_socket_path_fails_validation() {
        let mut cfg = AppConfig::dummy();
        cfg.socket_path = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_poll_interval_fails_validation() {
        let mut cfg = AppConfig::dummy();
        cfg.poll_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }
}
