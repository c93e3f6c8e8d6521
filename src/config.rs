//! Configuration for the director
//!
//! Everything here is built once at startup and shared read-only as
//! `Arc<DirectorConfig>`; no component mutates policy after that.

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use director_shared::limits;
use std::time::Duration;

/// How commands reach devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RelayMode {
    /// Talk to the relay's HTTP API
    #[default]
    Http,
    /// In-process relay that records commands (for development)
    Simulated,
}

/// Relay connection settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub mode: RelayMode,
    /// Base URL of the relay API
    pub url: String,
    /// API key sent as basic-auth password
    pub api_key: String,
    /// Upper bound on any single relay call
    pub timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::Http,
            url: String::new(),
            api_key: String::new(),
            timeout: Duration::from_millis(limits::RELAY_TIMEOUT_MS),
        }
    }
}

/// Deployment policy toggles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Profiles are signed before they reach the relay
    pub sign_profiles: bool,
    /// Remove previously installed profiles before the initial install
    pub reset_profiles_at_enrollment: bool,
    /// Push every profile again when a device's build number changes
    pub push_on_new_build: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            sign_profiles: false,
            reset_profiles_at_enrollment: false,
            push_on_new_build: true,
        }
    }
}

/// Reconciliation loop settings
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Duration,
    /// Device information older than this is requested again
    pub info_request_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(limits::RECONCILE_INTERVAL_SECS),
            info_request_interval: Duration::from_secs(limits::INFO_REQUEST_INTERVAL_SECS),
        }
    }
}

/// Checkin queue settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: limits::CHECKIN_QUEUE_CAPACITY,
            workers: limits::CHECKIN_WORKERS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirectorConfig {
    pub relay: RelayConfig,
    pub policy: Policy,
    pub reconcile: ReconcileConfig,
    pub queue: QueueConfig,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Command line and environment surface
#[derive(Debug, Clone, Parser)]
#[command(name = "fleet-director", version, about = "Drives enrolled devices to a configured state")]
pub struct Cli {
    /// Relay API base URL
    #[arg(long, env = "RELAY_URL", default_value = "")]
    pub relay_url: String,

    /// Relay API key
    #[arg(long, env = "RELAY_API_KEY", default_value = "", hide_env_values = true)]
    pub relay_api_key: String,

    #[arg(long, env = "RELAY_MODE", value_enum, default_value_t = RelayMode::Http)]
    pub relay_mode: RelayMode,

    /// Relay call timeout in seconds
    #[arg(long, env = "RELAY_TIMEOUT_SECS", default_value_t = limits::RELAY_TIMEOUT_MS / 1000)]
    pub relay_timeout_secs: u64,

    /// Sign profiles prior to sending them to the relay
    #[arg(long, env = "SIGN", default_value_t = false, action = clap::ArgAction::Set)]
    pub sign: bool,

    /// Reset device profiles when the device enrolls
    #[arg(long, env = "RESET_DEVICE_PROFILES", default_value_t = false, action = clap::ArgAction::Set)]
    pub reset_device_profiles: bool,

    /// Re-push profiles if the device's build number changes
    #[arg(long, env = "PUSH_NEW_BUILD", default_value_t = true, action = clap::ArgAction::Set)]
    pub push_new_build: bool,

    /// Seconds between reconciliation sweeps
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = limits::RECONCILE_INTERVAL_SECS)]
    pub reconcile_interval_secs: u64,

    /// Seconds after which device information is requested again
    #[arg(long, env = "INFO_REQUEST_INTERVAL_SECS", default_value_t = limits::INFO_REQUEST_INTERVAL_SECS)]
    pub info_request_interval_secs: u64,

    #[arg(long, env = "CHECKIN_WORKERS", default_value_t = limits::CHECKIN_WORKERS)]
    pub workers: usize,

    #[arg(long, env = "CHECKIN_QUEUE_CAPACITY", default_value_t = limits::CHECKIN_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    #[arg(long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,
}

impl Cli {
    /// Validate the surface and freeze it into a config value
    pub fn into_config(self) -> Result<DirectorConfig> {
        if self.relay_mode == RelayMode::Http {
            if self.relay_url.is_empty() {
                bail!("relay URL missing");
            }
            if self.relay_api_key.is_empty() {
                bail!("relay API key missing");
            }
        }
        if self.workers == 0 {
            bail!("at least one checkin worker is required");
        }
        if self.queue_capacity == 0 {
            bail!("checkin queue capacity must be positive");
        }
        if self.reconcile_interval_secs == 0 {
            bail!("reconcile interval must be positive");
        }

        Ok(DirectorConfig {
            relay: RelayConfig {
                mode: self.relay_mode,
                url: self.relay_url,
                api_key: self.relay_api_key,
                timeout: Duration::from_secs(self.relay_timeout_secs.max(1)),
            },
            policy: Policy {
                sign_profiles: self.sign,
                reset_profiles_at_enrollment: self.reset_device_profiles,
                push_on_new_build: self.push_new_build,
            },
            reconcile: ReconcileConfig {
                interval: Duration::from_secs(self.reconcile_interval_secs),
                info_request_interval: Duration::from_secs(self.info_request_interval_secs),
            },
            queue: QueueConfig {
                capacity: self.queue_capacity,
                workers: self.workers,
            },
            log_level: self.log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["fleet-director"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_http_mode_requires_url_and_key() {
        let cli = parse(&["--relay-url", "", "--relay-api-key", ""]);
        assert!(cli.into_config().is_err());

        let cli = parse(&["--relay-url", "https://relay.example", "--relay-api-key", ""]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn test_policy_flags() {
        let config = parse(&[
            "--relay-mode",
            "simulated",
            "--reset-device-profiles",
            "true",
            "--push-new-build",
            "false",
            "--log-level",
            "debug",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.relay.mode, RelayMode::Simulated);
        assert!(config.policy.reset_profiles_at_enrollment);
        assert!(!config.policy.push_on_new_build);
        assert_eq!(config.log_level.as_filter(), "debug");
    }

    #[test]
    fn test_rejects_zero_workers() {
        let cli = parse(&["--relay-mode", "simulated", "--workers", "0"]);
        assert!(cli.into_config().is_err());
    }
}
