// Configuration File Support
//
// This module provides configuration file parsing for the IPS harness.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from the XDG config directory: ~/.config/ips-harness/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rounds::payload::PayloadSpec;

/// Shortest accepted accept/read timeout for a round
pub const MIN_ACCEPT_TIMEOUT_MS: u64 = 3000;

/// Longest accepted accept/read timeout for a round
pub const MAX_ACCEPT_TIMEOUT_MS: u64 = 5000;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Firewall rule configuration
    pub firewall: FirewallConfig,

    /// Echo round configuration
    pub rounds: RoundsConfig,

    /// Subject process configuration
    pub subject: SubjectConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Firewall configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FirewallConfig {
    /// NFQUEUE number the subject reads from
    pub queue_num: u16,

    /// Chain the redirect rule is inserted into
    pub chain: String,

    /// Position the harness inserts at and deletes from
    pub rule_position: usize,

    /// Timeout for each iptables invocation
    pub command_timeout_secs: u64,

    /// iptables binary to invoke
    pub binary: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            queue_num: 33,
            chain: "INPUT".to_string(),
            rule_position: 1,
            command_timeout_secs: 5,
            binary: "iptables".to_string(),
        }
    }
}

/// Echo round configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoundsConfig {
    /// TCP port the receiver listens on (0 picks an ephemeral port)
    pub port: u16,

    /// Address the receiver binds to
    pub bind_address: String,

    /// Address the sender connects to
    pub connect_address: String,

    /// Rounds per phase
    pub round_count: usize,

    /// Bound on accept and on the first read
    pub accept_timeout_ms: u64,

    /// Delay after each round before the next one starts
    pub settle_delay_ms: u64,

    /// Receive buffer size in bytes
    pub buffer_size: usize,

    /// Listen backlog
    pub backlog: u32,

    /// Token repeated to build permitted payloads
    pub base_token: String,

    /// Substring the subject must suppress
    pub forbidden_marker: String,

    /// Text placed before the marker in forbidden payloads
    pub forbidden_prefix: String,

    /// Text placed after the marker in forbidden payloads
    pub forbidden_suffix: String,
}

impl Default for RoundsConfig {
    fn default() -> Self {
        Self {
            port: 2222,
            bind_address: "0.0.0.0".to_string(),
            connect_address: "127.0.0.1".to_string(),
            round_count: 5,
            accept_timeout_ms: MAX_ACCEPT_TIMEOUT_MS,
            settle_delay_ms: 300,
            buffer_size: 1024,
            backlog: 10,
            base_token: "IPS-Testing-Script-".to_string(),
            forbidden_marker: "badword".to_string(),
            forbidden_prefix: "IPS-Testing-".to_string(),
            forbidden_suffix: "-Script-".to_string(),
        }
    }
}

impl RoundsConfig {
    /// Accept/read timeout as a duration
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    /// Settling delay as a duration
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Payload generation rule for this configuration
    pub fn payload_spec(&self) -> PayloadSpec {
        PayloadSpec {
            base_token: self.base_token.clone(),
            forbidden_marker: self.forbidden_marker.clone(),
            forbidden_prefix: self.forbidden_prefix.clone(),
            forbidden_suffix: self.forbidden_suffix.clone(),
        }
    }
}

/// Subject process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubjectConfig {
    /// Path to the subject executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,

    /// Extra arguments passed to the subject
    pub args: Vec<String>,

    /// Working directory for the subject (a fresh temp dir when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// How long to wait after spawning before checking for early exit
    pub startup_probe_ms: u64,

    /// How long a stopping subject gets after SIGINT
    pub grace_period_ms: u64,
}

impl Default for SubjectConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            working_dir: None,
            startup_probe_ms: 500,
            grace_period_ms: 2000,
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. If the config file does not exist, returns the
    /// default configuration with environment overrides applied.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;

            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/ips-harness/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("org", "ips-harness", "ips-harness") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("ips-harness")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - IPS_HARNESS_LOG_LEVEL
    /// - IPS_HARNESS_LOG_FORMAT
    /// - IPS_HARNESS_PORT
    /// - IPS_HARNESS_QUEUE_NUM
    /// - IPS_HARNESS_SUBJECT
    fn apply_env_overrides(self) -> Self {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    fn apply_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("IPS_HARNESS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("IPS_HARNESS_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(port) = lookup("IPS_HARNESS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.rounds.port = port;
            }
        }
        if let Some(queue) = lookup("IPS_HARNESS_QUEUE_NUM") {
            if let Ok(queue) = queue.parse::<u16>() {
                self.firewall.queue_num = queue;
            }
        }
        if let Some(subject) = lookup("IPS_HARNESS_SUBJECT") {
            if !subject.is_empty() {
                self.subject.executable = Some(PathBuf::from(subject));
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.firewall.rule_position == 0 {
            anyhow::bail!("Firewall rule position is 1-based and must be > 0");
        }
        if self.firewall.chain.is_empty() {
            anyhow::bail!("Firewall chain must not be empty");
        }
        if self.firewall.command_timeout_secs == 0 {
            anyhow::bail!("Firewall command timeout must be > 0");
        }

        let rounds = &self.rounds;
        if rounds.round_count == 0 {
            anyhow::bail!("Round count must be > 0");
        }
        if !(MIN_ACCEPT_TIMEOUT_MS..=MAX_ACCEPT_TIMEOUT_MS).contains(&rounds.accept_timeout_ms) {
            anyhow::bail!(
                "Accept timeout must be between {} and {} ms, got {}",
                MIN_ACCEPT_TIMEOUT_MS,
                MAX_ACCEPT_TIMEOUT_MS,
                rounds.accept_timeout_ms
            );
        }
        if rounds.buffer_size == 0 {
            anyhow::bail!("Receive buffer size must be > 0");
        }
        if rounds.backlog == 0 {
            anyhow::bail!("Listen backlog must be > 0");
        }
        if rounds.base_token.is_empty() {
            anyhow::bail!("Base token must not be empty");
        }
        if rounds.forbidden_marker.is_empty() {
            anyhow::bail!("Forbidden marker must not be empty");
        }
        if rounds.base_token.contains(&rounds.forbidden_marker) {
            anyhow::bail!(
                "Base token {:?} contains the forbidden marker {:?}",
                rounds.base_token,
                rounds.forbidden_marker
            );
        }
        rounds
            .bind_address
            .parse::<std::net::IpAddr>()
            .with_context(|| format!("Invalid bind address: {}", rounds.bind_address))?;
        rounds
            .connect_address
            .parse::<std::net::IpAddr>()
            .with_context(|| format!("Invalid connect address: {}", rounds.connect_address))?;

        // The largest payload plus its terminator must fit the receive buffer.
        let largest = self
            .rounds
            .payload_spec()
            .forbidden_case(rounds.round_count)
            .payload
            .len()
            .max(self.rounds.payload_spec().permitted_case(rounds.round_count).payload.len());
        if largest + 1 > rounds.buffer_size {
            anyhow::bail!(
                "Largest payload ({} bytes) does not fit the {} byte receive buffer",
                largest,
                rounds.buffer_size
            );
        }

        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.firewall.queue_num, 33);
        assert_eq!(config.firewall.rule_position, 1);
        assert_eq!(config.rounds.port, 2222);
        assert_eq!(config.rounds.round_count, 5);
        assert_eq!(config.rounds.buffer_size, 1024);
        assert_eq!(config.rounds.base_token, "IPS-Testing-Script-");
        assert!(config.subject.executable.is_none());
    }

    #[test]
    fn test_config_validation_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_accept_timeout_bounds() {
        let mut config = Config::default();
        config.rounds.accept_timeout_ms = 2999;
        assert!(config.validate().is_err());

        config.rounds.accept_timeout_ms = 5001;
        assert!(config.validate().is_err());

        config.rounds.accept_timeout_ms = 3000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_rule_position() {
        let mut config = Config::default();
        config.firewall.rule_position = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_marker_in_base_token() {
        let mut config = Config::default();
        config.rounds.forbidden_marker = "Testing".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_payload_exceeds_buffer() {
        let mut config = Config::default();
        config.rounds.buffer_size = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_address() {
        let mut config = Config::default();
        config.rounds.bind_address = "not-an-ip".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let path = PathBuf::from("/nonexistent/ips-harness/config.toml");
        let config = Config::load_from_path(&path);
        assert!(config.is_ok());
    }

    #[test]
    fn test_load_valid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging]
level = "debug"
format = "json"

[firewall]
queue_num = 7
chain = "INPUT"

[rounds]
port = 4444
round_count = 3
accept_timeout_ms = 3000
forbidden_marker = "evil"

[subject]
executable = "/opt/ips/ips"
args = ["--queue", "7"]
grace_period_ms = 1000
"#;

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.firewall.queue_num, 7);
        assert_eq!(config.rounds.round_count, 3);
        assert_eq!(config.rounds.forbidden_marker, "evil");
        assert_eq!(config.subject.executable, Some(PathBuf::from("/opt/ips/ips")));
        assert_eq!(config.subject.args, vec!["--queue", "7"]);
        assert_eq!(config.subject.grace_period_ms, 1000);
        // Untouched fields keep their defaults
        assert_eq!(config.rounds.buffer_size, 1024);
        assert_eq!(config.subject.startup_probe_ms, 500);
    }

    #[test]
    fn test_load_invalid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging
level = "debug"
"#;

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path());
        assert!(config.is_err());
    }

    #[test]
    fn test_overrides() {
        let env = overrides(&[
            ("IPS_HARNESS_LOG_LEVEL", "debug"),
            ("IPS_HARNESS_LOG_FORMAT", "json"),
            ("IPS_HARNESS_PORT", "9999"),
            ("IPS_HARNESS_QUEUE_NUM", "12"),
            ("IPS_HARNESS_SUBJECT", "/usr/local/bin/ips"),
        ]);

        let config = Config::default().apply_overrides_from(|k| env.get(k).cloned());

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.rounds.port, 9999);
        assert_eq!(config.firewall.queue_num, 12);
        assert_eq!(
            config.subject.executable,
            Some(PathBuf::from("/usr/local/bin/ips"))
        );
    }

    #[test]
    fn test_overrides_invalid_values() {
        let env = overrides(&[
            ("IPS_HARNESS_PORT", "70000"),
            ("IPS_HARNESS_QUEUE_NUM", "abc"),
            ("IPS_HARNESS_SUBJECT", ""),
        ]);

        let config = Config::default().apply_overrides_from(|k| env.get(k).cloned());

        assert_eq!(config.rounds.port, 2222);
        assert_eq!(config.firewall.queue_num, 33);
        assert!(config.subject.executable.is_none());
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.ends_with("config.toml"));
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
