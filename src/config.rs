//! TOML configuration for lanspeed.
//!
//! A layered model: compiled-in defaults, overridden by a TOML file found
//! via `--config`, the `LANSPEED_CONFIG` environment variable, or the
//! standard system location. The resulting value is built once at process
//! start and shared read-only.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "LANSPEED_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/lanspeed/lanspeed.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the lanspeed process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeedConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub payload: PayloadConfig,
    #[serde(default)]
    pub test: TestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SpeedConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded lanspeed configuration");
        Ok(config)
    }

    /// Resolve configuration in order:
    /// 1. An explicit path (from the command line). A failure here is an error.
    /// 2. The path in `LANSPEED_CONFIG`.
    /// 3. `/etc/lanspeed/lanspeed.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    /// Try the environment variable and the system location, falling back
    /// to defaults when neither yields a usable file.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "LANSPEED_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.payload.chunk_size == 0 {
            anyhow::bail!("payload.chunk_size must be greater than zero");
        }
        if self.test.sample_interval_ms == 0 {
            anyhow::bail!("test.sample_interval_ms must be greater than zero");
        }
        if self.test.default_duration_sec == 0 {
            anyhow::bail!("test.default_duration_sec must be greater than zero");
        }
        if self.test.default_duration_sec > self.test.max_duration_sec {
            anyhow::bail!(
                "test.default_duration_sec ({}) exceeds test.max_duration_sec ({})",
                self.test.default_duration_sec,
                self.test.max_duration_sec
            );
        }
        self.server
            .control_address
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid server.control_address: {}", self.server.control_address))?;
        self.server
            .bulk_address
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid server.bulk_address: {}", self.server.bulk_address))?;
        if !self.server.ws_path.starts_with('/') {
            anyhow::bail!("server.ws_path must start with '/'");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the HTTP / WebSocket control channel.
    pub control_address: String,
    /// Address for the raw TCP bulk-transfer listener.
    pub bulk_address: String,
    /// Route the WebSocket upgrade is served on.
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_address: "0.0.0.0:8080".to_string(),
            bulk_address: "0.0.0.0:3001".to_string(),
            ws_path: "/ws".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Test payload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    /// Size of one payload block in bytes. Default: 8 MiB.
    pub chunk_size: usize,
    /// Content of each block.
    pub fill: PayloadFill,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024 * 1024,
            fill: PayloadFill::Random,
        }
    }
}

/// What a payload block is filled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFill {
    /// Bytes from the OS entropy source; incompressible.
    Random,
    /// A zeroed buffer. Only meaningful when nothing on the path compresses.
    Zero,
}

// ---------------------------------------------------------------------------
// Test
// ---------------------------------------------------------------------------

/// Test run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Duration used when a `start` carries no duration (or zero).
    pub default_duration_sec: u64,
    /// Upper bound on a requested duration.
    pub max_duration_sec: u64,
    /// Pacing delay between samples.
    pub sample_interval_ms: u64,
    /// How each sample is taken.
    pub strategy: Strategy,
    /// Deadline for dialing the bulk listener.
    pub connect_timeout_sec: u64,
    /// Deadline for a single block transfer.
    pub io_timeout_sec: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            default_duration_sec: 10,
            max_duration_sec: 300,
            sample_interval_ms: 1000,
            strategy: Strategy::Pull,
            connect_timeout_sec: 5,
            io_timeout_sec: 10,
        }
    }
}

impl TestConfig {
    /// Effective run duration for a requested number of seconds.
    ///
    /// Absent or zero falls back to the default; anything above the
    /// maximum is clamped.
    pub fn run_duration(&self, requested: Option<u64>) -> Duration {
        let secs = match requested {
            Some(0) | None => self.default_duration_sec,
            Some(s) => s.min(self.max_duration_sec),
        };
        Duration::from_secs(secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_sec)
    }
}

/// Measurement strategy for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Dial the bulk listener and time draining one block to end-of-stream.
    Pull,
    /// Send the block over the control channel as a binary frame.
    Push,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = SpeedConfig::default();

        assert_eq!(cfg.server.control_address, "0.0.0.0:8080");
        assert_eq!(cfg.server.bulk_address, "0.0.0.0:3001");
        assert_eq!(cfg.server.ws_path, "/ws");

        assert_eq!(cfg.payload.chunk_size, 8 * 1024 * 1024);
        assert_eq!(cfg.payload.fill, PayloadFill::Random);

        assert_eq!(cfg.test.default_duration_sec, 10);
        assert_eq!(cfg.test.max_duration_sec, 300);
        assert_eq!(cfg.test.sample_interval_ms, 1000);
        assert_eq!(cfg.test.strategy, Strategy::Pull);
        assert_eq!(cfg.test.connect_timeout_sec, 5);
        assert_eq!(cfg.test.io_timeout_sec, 10);

        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Text);

        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[server]
control_address = "127.0.0.1:9000"
bulk_address = "127.0.0.1:9001"
ws_path = "/speed"

[payload]
chunk_size = 1048576
fill = "zero"

[test]
default_duration_sec = 5
max_duration_sec = 60
sample_interval_ms = 500
strategy = "push"
connect_timeout_sec = 2
io_timeout_sec = 3

[logging]
level = "debug"
format = "json"
"#;

        let cfg: SpeedConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.server.control_address, "127.0.0.1:9000");
        assert_eq!(cfg.server.bulk_address, "127.0.0.1:9001");
        assert_eq!(cfg.server.ws_path, "/speed");
        assert_eq!(cfg.payload.chunk_size, 1_048_576);
        assert_eq!(cfg.payload.fill, PayloadFill::Zero);
        assert_eq!(cfg.test.default_duration_sec, 5);
        assert_eq!(cfg.test.max_duration_sec, 60);
        assert_eq!(cfg.test.sample_interval(), Duration::from_millis(500));
        assert_eq!(cfg.test.strategy, Strategy::Push);
        assert_eq!(cfg.test.connect_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.test.io_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[payload]
chunk_size = 4096
"#;
        let cfg: SpeedConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.payload.chunk_size, 4096);
        assert_eq!(cfg.payload.fill, PayloadFill::Random);
        assert_eq!(cfg.server.control_address, "0.0.0.0:8080");
        assert_eq!(cfg.test.strategy, Strategy::Pull);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: SpeedConfig = toml::from_str("").unwrap();
        let defaults = SpeedConfig::default();
        assert_eq!(cfg.server.bulk_address, defaults.server.bulk_address);
        assert_eq!(cfg.payload.chunk_size, defaults.payload.chunk_size);
        assert_eq!(cfg.test.sample_interval_ms, defaults.test.sample_interval_ms);
    }

    #[test]
    fn test_run_duration_defaults_and_clamps() {
        let test = TestConfig::default();
        assert_eq!(test.run_duration(None), Duration::from_secs(10));
        assert_eq!(test.run_duration(Some(0)), Duration::from_secs(10));
        assert_eq!(test.run_duration(Some(3)), Duration::from_secs(3));
        assert_eq!(test.run_duration(Some(10_000)), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = SpeedConfig::default();
        cfg.payload.chunk_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SpeedConfig::default();
        cfg.test.sample_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SpeedConfig::default();
        cfg.test.default_duration_sec = 600;
        assert!(cfg.validate().is_err());

        let mut cfg = SpeedConfig::default();
        cfg.server.bulk_address = "not-an-address".into();
        assert!(cfg.validate().is_err());

        let mut cfg = SpeedConfig::default();
        cfg.server.ws_path = "ws".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lanspeed.toml");
        std::fs::write(
            &path,
            r#"
[server]
bulk_address = "0.0.0.0:4444"
"#,
        )
        .unwrap();

        let cfg = SpeedConfig::load(&path).unwrap();
        assert_eq!(cfg.server.bulk_address, "0.0.0.0:4444");

        let resolved = SpeedConfig::resolve(Some(&path)).unwrap();
        assert_eq!(resolved.server.bulk_address, "0.0.0.0:4444");
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = SpeedConfig::load(Path::new("/nonexistent/path/lanspeed.toml"));
        assert!(result.is_err());
        assert!(SpeedConfig::resolve(Some(Path::new("/nonexistent/lanspeed.toml"))).is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = SpeedConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: SpeedConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg.server.control_address, back.server.control_address);
        assert_eq!(cfg.test.strategy, back.test.strategy);
    }
}
