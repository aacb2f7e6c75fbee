//! Configuration management with environment variable support.
//!
//! Every timing bound and path the harness uses can be overridden from the
//! environment. Values that fail to parse fall back to the default.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `INTERCOM_HARNESS_CAPTURE_BIND` | Capture listener bind address | `0.0.0.0` |
//! | `INTERCOM_HARNESS_CAPTURE_PORT` | Capture UDP port | `5514` |
//! | `INTERCOM_HARNESS_CAPTURE_DIR` | Directory for per-device log streams | `./logsDomofon` |
//! | `INTERCOM_HARNESS_STAGE_DELAY_MS` | Delay before each channel command | `3000` |
//! | `INTERCOM_HARNESS_SETTLE_DELAY_MS` | Delay between command and first log read | `3000` |
//! | `INTERCOM_HARNESS_POLL_DEADLINE_MS` | Wall-clock budget for finding a confirmation | `7000` |
//! | `INTERCOM_HARNESS_POLL_INTERVAL_MS` | Sleep between follow reads | `250` |
//! | `INTERCOM_HARNESS_CORRELATION_WINDOW_SECS` | Max command/record timestamp delta | `10` |
//! | `INTERCOM_HARNESS_CONFIRM_PATTERN` | Regex a confirming record must match | `STAT/DOOR1:\s*1` |
//! | `INTERCOM_HARNESS_HTTP_TIMEOUT_SECS` | Device HTTP request timeout | `5` |
//! | `INTERCOM_HARNESS_MQTT_HOST` | Broker host for relay/key channels | `localhost` |
//! | `INTERCOM_HARNESS_MQTT_PORT` | Broker port | `1883` |
//! | `INTERCOM_HARNESS_MQTT_USER` | Broker login | unset |
//! | `INTERCOM_HARNESS_MQTT_PASSWORD` | Broker password | unset |
//! | `INTERCOM_HARNESS_DEVICE_CONFIG` | Device config file | `./config.txt` |
//! | `INTERCOM_HARNESS_LOG_DIR` | Run artifact directory | `./logs` |
//! | `INTERCOM_HARNESS_PROGRESS_INTERVAL_MS` | Progress feed interval | `500` |
//! | `INTERCOM_HARNESS_PROBE_TIMEOUT_SECS` | Reachability probe timeout | `1` |
//! | `INTERCOM_HARNESS_TEST_TIMEOUT_SECS` | Per-test timeout in a device worker | `3600` |
//! | `INTERCOM_HARNESS_MAX_PARALLEL` | Concurrent device workers, 0 = one per device | `0` |
//! | `INTERCOM_HARNESS_PROBE_ACCEPTANCE` | Drop unreachable devices in acceptance runs | `true` |
//! | `INTERCOM_HARNESS_PROBE_REGRESSION` | Drop unreachable devices in regression runs | `false` |
//! | `INTERCOM_HARNESS_PROBE_SELECTED` | Drop unreachable devices in selected runs | `true` |
//! | `INTERCOM_HARNESS_STOP_NOTICE` | Text shown on device displays when a run is stopped | unset |
//! | `INTERCOM_HARNESS_HTTP_BIND` | Run-control HTTP bind address | `127.0.0.1:5000` |
//!
//! # Example
//!
//! ```bash
//! export INTERCOM_HARNESS_CAPTURE_PORT=5515
//! export INTERCOM_HARNESS_MQTT_HOST=broker.lab.local
//! export INTERCOM_HARNESS_POLL_DEADLINE_MS=10000
//! ```

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

// ============================================================================
// Default Values
// ============================================================================

/// Default capture listener bind address
pub const DEFAULT_CAPTURE_BIND: &str = "0.0.0.0";

/// Default capture UDP port
pub const DEFAULT_CAPTURE_PORT: u16 = 5514;

/// Default directory holding per-device log streams
pub const DEFAULT_CAPTURE_DIR: &str = "./logsDomofon";

/// Default delay before each channel command (milliseconds)
pub const DEFAULT_STAGE_DELAY_MS: u64 = 3_000;

/// Default settle delay after a command (milliseconds)
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 3_000;

/// Default poll deadline (milliseconds)
pub const DEFAULT_POLL_DEADLINE_MS: u64 = 7_000;

/// Default sleep between follow reads (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Default correlation window (seconds)
pub const DEFAULT_CORRELATION_WINDOW_SECS: u64 = 10;

/// Default pattern of a door-open confirmation record
pub const DEFAULT_CONFIRM_PATTERN: &str = r"STAT/DOOR1:\s*1";

/// Default device HTTP timeout (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 5;

/// Default MQTT broker host
pub const DEFAULT_MQTT_HOST: &str = "localhost";

/// Default MQTT broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default device config path
pub const DEFAULT_DEVICE_CONFIG: &str = "./config.txt";

/// Default run artifact directory
pub const DEFAULT_LOG_DIR: &str = "./logs";

/// Default progress feed interval (milliseconds)
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 500;

/// Default reachability probe timeout (seconds)
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 1;

/// Default per-test timeout (seconds)
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 3_600;

/// Default run-control HTTP bind address
pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:5000";

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_CAPTURE_BIND: &str = "INTERCOM_HARNESS_CAPTURE_BIND";
pub const ENV_CAPTURE_PORT: &str = "INTERCOM_HARNESS_CAPTURE_PORT";
pub const ENV_CAPTURE_DIR: &str = "INTERCOM_HARNESS_CAPTURE_DIR";
pub const ENV_STAGE_DELAY_MS: &str = "INTERCOM_HARNESS_STAGE_DELAY_MS";
pub const ENV_SETTLE_DELAY_MS: &str = "INTERCOM_HARNESS_SETTLE_DELAY_MS";
pub const ENV_POLL_DEADLINE_MS: &str = "INTERCOM_HARNESS_POLL_DEADLINE_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "INTERCOM_HARNESS_POLL_INTERVAL_MS";
pub const ENV_CORRELATION_WINDOW_SECS: &str = "INTERCOM_HARNESS_CORRELATION_WINDOW_SECS";
pub const ENV_CONFIRM_PATTERN: &str = "INTERCOM_HARNESS_CONFIRM_PATTERN";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "INTERCOM_HARNESS_HTTP_TIMEOUT_SECS";
pub const ENV_MQTT_HOST: &str = "INTERCOM_HARNESS_MQTT_HOST";
pub const ENV_MQTT_PORT: &str = "INTERCOM_HARNESS_MQTT_PORT";
pub const ENV_MQTT_USER: &str = "INTERCOM_HARNESS_MQTT_USER";
pub const ENV_MQTT_PASSWORD: &str = "INTERCOM_HARNESS_MQTT_PASSWORD";
pub const ENV_DEVICE_CONFIG: &str = "INTERCOM_HARNESS_DEVICE_CONFIG";
pub const ENV_LOG_DIR: &str = "INTERCOM_HARNESS_LOG_DIR";
pub const ENV_PROGRESS_INTERVAL_MS: &str = "INTERCOM_HARNESS_PROGRESS_INTERVAL_MS";
pub const ENV_PROBE_TIMEOUT_SECS: &str = "INTERCOM_HARNESS_PROBE_TIMEOUT_SECS";
pub const ENV_TEST_TIMEOUT_SECS: &str = "INTERCOM_HARNESS_TEST_TIMEOUT_SECS";
pub const ENV_MAX_PARALLEL: &str = "INTERCOM_HARNESS_MAX_PARALLEL";
pub const ENV_PROBE_ACCEPTANCE: &str = "INTERCOM_HARNESS_PROBE_ACCEPTANCE";
pub const ENV_PROBE_REGRESSION: &str = "INTERCOM_HARNESS_PROBE_REGRESSION";
pub const ENV_PROBE_SELECTED: &str = "INTERCOM_HARNESS_PROBE_SELECTED";
pub const ENV_STOP_NOTICE: &str = "INTERCOM_HARNESS_STOP_NOTICE";
pub const ENV_HTTP_BIND: &str = "INTERCOM_HARNESS_HTTP_BIND";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration for the harness
#[derive(Debug, Clone)]
pub struct Config {
    /// Log capture service
    pub capture: CaptureSettings,
    /// Confirmation engine timing
    pub confirm: ConfirmSettings,
    /// Device-facing transports
    pub transport: TransportSettings,
    /// Orchestration runner
    pub runner: RunnerSettings,
}

/// Capture service settings
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Address the UDP listener binds to
    pub bind: String,
    /// UDP port
    pub port: u16,
    /// Directory holding per-device streams
    pub dir: PathBuf,
}

/// Timing bounds of the confirmation engine
#[derive(Debug, Clone)]
pub struct ConfirmSettings {
    pub stage_delay: Duration,
    pub settle_delay: Duration,
    /// Wall-clock budget for polling, measured from poll start
    pub poll_deadline: Duration,
    pub poll_interval: Duration,
    /// Max |record - command| timestamp delta for an accepted confirmation
    pub correlation_window: Duration,
    pub confirm_pattern: String,
}

/// HTTP and MQTT settings for talking to devices
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub http_timeout: Duration,
    pub mqtt: MqttSettings,
}

/// Broker used by the relay and key channels
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Orchestration runner settings
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub device_config: PathBuf,
    pub log_dir: PathBuf,
    pub progress_interval: Duration,
    pub probe_timeout: Duration,
    pub test_timeout: Duration,
    /// Concurrent device workers; 0 means one per device
    pub max_parallel: usize,
    pub probe_policy: ProbePolicy,
    pub stop_notice: Option<String>,
    pub http_bind: String,
}

/// Which run modes drop unreachable devices before dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub acceptance: bool,
    pub regression: bool,
    pub selected: bool,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            acceptance: true,
            regression: false,
            selected: true,
        }
    }
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            capture: CaptureSettings::from_env(),
            confirm: ConfirmSettings::from_env(),
            transport: TransportSettings::from_env(),
            runner: RunnerSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            capture: CaptureSettings::defaults(),
            confirm: ConfirmSettings::defaults(),
            transport: TransportSettings::defaults(),
            runner: RunnerSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl CaptureSettings {
    pub fn from_env() -> Self {
        Self {
            bind: env_string(ENV_CAPTURE_BIND, DEFAULT_CAPTURE_BIND),
            port: env_parse(ENV_CAPTURE_PORT, DEFAULT_CAPTURE_PORT),
            dir: PathBuf::from(env_string(ENV_CAPTURE_DIR, DEFAULT_CAPTURE_DIR)),
        }
    }

    pub fn defaults() -> Self {
        Self {
            bind: DEFAULT_CAPTURE_BIND.to_string(),
            port: DEFAULT_CAPTURE_PORT,
            dir: PathBuf::from(DEFAULT_CAPTURE_DIR),
        }
    }

    /// Socket address string for the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl ConfirmSettings {
    pub fn from_env() -> Self {
        Self {
            stage_delay: env_millis(ENV_STAGE_DELAY_MS, DEFAULT_STAGE_DELAY_MS),
            settle_delay: env_millis(ENV_SETTLE_DELAY_MS, DEFAULT_SETTLE_DELAY_MS),
            poll_deadline: env_millis(ENV_POLL_DEADLINE_MS, DEFAULT_POLL_DEADLINE_MS),
            poll_interval: env_millis(ENV_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS),
            correlation_window: env_secs(
                ENV_CORRELATION_WINDOW_SECS,
                DEFAULT_CORRELATION_WINDOW_SECS,
            ),
            confirm_pattern: env_string(ENV_CONFIRM_PATTERN, DEFAULT_CONFIRM_PATTERN),
        }
    }

    pub fn defaults() -> Self {
        Self {
            stage_delay: Duration::from_millis(DEFAULT_STAGE_DELAY_MS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            poll_deadline: Duration::from_millis(DEFAULT_POLL_DEADLINE_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            correlation_window: Duration::from_secs(DEFAULT_CORRELATION_WINDOW_SECS),
            confirm_pattern: DEFAULT_CONFIRM_PATTERN.to_string(),
        }
    }
}

impl TransportSettings {
    pub fn from_env() -> Self {
        Self {
            http_timeout: env_secs(ENV_HTTP_TIMEOUT_SECS, DEFAULT_HTTP_TIMEOUT_SECS),
            mqtt: MqttSettings {
                host: env_string(ENV_MQTT_HOST, DEFAULT_MQTT_HOST),
                port: env_parse(ENV_MQTT_PORT, DEFAULT_MQTT_PORT),
                user: env::var(ENV_MQTT_USER).ok().filter(|s| !s.is_empty()),
                password: env::var(ENV_MQTT_PASSWORD).ok(),
            },
        }
    }

    pub fn defaults() -> Self {
        Self {
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            mqtt: MqttSettings {
                host: DEFAULT_MQTT_HOST.to_string(),
                port: DEFAULT_MQTT_PORT,
                user: None,
                password: None,
            },
        }
    }
}

impl RunnerSettings {
    pub fn from_env() -> Self {
        let defaults = ProbePolicy::default();
        Self {
            device_config: PathBuf::from(env_string(ENV_DEVICE_CONFIG, DEFAULT_DEVICE_CONFIG)),
            log_dir: PathBuf::from(env_string(ENV_LOG_DIR, DEFAULT_LOG_DIR)),
            progress_interval: env_millis(
                ENV_PROGRESS_INTERVAL_MS,
                DEFAULT_PROGRESS_INTERVAL_MS,
            ),
            probe_timeout: env_secs(ENV_PROBE_TIMEOUT_SECS, DEFAULT_PROBE_TIMEOUT_SECS),
            test_timeout: env_secs(ENV_TEST_TIMEOUT_SECS, DEFAULT_TEST_TIMEOUT_SECS),
            max_parallel: env_parse(ENV_MAX_PARALLEL, 0),
            probe_policy: ProbePolicy {
                acceptance: env_flag(ENV_PROBE_ACCEPTANCE, defaults.acceptance),
                regression: env_flag(ENV_PROBE_REGRESSION, defaults.regression),
                selected: env_flag(ENV_PROBE_SELECTED, defaults.selected),
            },
            stop_notice: env::var(ENV_STOP_NOTICE).ok().filter(|s| !s.trim().is_empty()),
            http_bind: env_string(ENV_HTTP_BIND, DEFAULT_HTTP_BIND),
        }
    }

    pub fn defaults() -> Self {
        Self {
            device_config: PathBuf::from(DEFAULT_DEVICE_CONFIG),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            test_timeout: Duration::from_secs(DEFAULT_TEST_TIMEOUT_SECS),
            max_parallel: 0,
            probe_policy: ProbePolicy::default(),
            stop_notice: None,
            http_bind: DEFAULT_HTTP_BIND.to_string(),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    parse_or_default(key, env::var(key).ok().as_deref(), default)
}

/// Parse a raw setting; an unparsable value warns and keeps the default
fn parse_or_default<T: FromStr>(key: &str, raw: Option<&str>, default: T) -> T {
    let Some(value) = raw else {
        return default;
    };
    match value.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(key, value, "invalid value, using default");
            default
        }
    }
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(key, default))
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default))
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| parse_flag(&v))
        .unwrap_or(default)
}

/// Parse a boolean switch the way operators usually write one
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
