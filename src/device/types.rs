use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

/// Config key holding the device address (`host[:port]`)
pub const KEY_ADDRESS: &str = "IP_CAMERA";
/// Config key holding the login
pub const KEY_LOGIN: &str = "LOGIN";
/// Config key holding the password
pub const KEY_PASSWORD: &str = "PASSWORD";

/// Defaults applied to optional parameters when a block is loaded
pub const PARAM_DEFAULTS: &[(&str, &str)] = &[
    ("MAX_SCREENSHOTS", "10000"),
    ("DOOR_ATTEMPTS", "3"),
    ("RESET", "0"),
    ("TEXT", "Test"),
    ("DURATION", "2"),
];

/// Network address of a device: host plus optional port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub host: String,
    pub port: Option<u16>,
}

impl DeviceAddress {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host[:port]`, the authority part of device URLs
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// Base URL for HTTP requests to this device
    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AddressError(s.to_string()))?;
                (host, Some(port))
            }
            None => (s, None),
        };
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(AddressError(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

/// A device address that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed device address '{0}'")]
pub struct AddressError(pub String);

/// Login and secret used for device HTTP basic auth
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            secret: secret.into(),
        }
    }
}

/// One device block from the config file
///
/// `params` holds what the block declared, in file order; `defaults` holds the
/// optional parameters that were absent and got filled in at load time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub params: IndexMap<String, String>,
    pub defaults: IndexMap<String, String>,
}

impl DeviceConfig {
    /// Build a config from declared parameters, applying [`PARAM_DEFAULTS`]
    pub fn from_params(params: IndexMap<String, String>) -> Self {
        let defaults = PARAM_DEFAULTS
            .iter()
            .filter(|(key, _)| !params.contains_key(*key))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Self { params, defaults }
    }

    /// Declared value, or the load-time default
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .or_else(|| self.defaults.get(key))
            .map(String::as_str)
    }

    /// Raw address string as written in the config
    pub fn address_raw(&self) -> &str {
        self.param(KEY_ADDRESS).unwrap_or("")
    }

    pub fn address(&self) -> Result<DeviceAddress, AddressError> {
        self.address_raw().parse()
    }

    /// Host part of the address, used for reachability probes and log streams
    pub fn host(&self) -> &str {
        let raw = self.address_raw().trim();
        match raw.rsplit_once(':') {
            Some((host, _)) => host,
            None => raw,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(
            self.param(KEY_LOGIN).unwrap_or(""),
            self.param(KEY_PASSWORD).unwrap_or(""),
        )
    }

    /// Numeric parameter; a missing, unparsable or non-positive value falls
    /// back to `default` with a warning.
    pub fn param_u32(&self, key: &str, default: u32) -> u32 {
        match self.param(key).map(|v| v.trim().parse::<u32>()) {
            Some(Ok(value)) if value > 0 => value,
            Some(Ok(_)) | Some(Err(_)) => {
                warn!(
                    host = %self.host(),
                    key,
                    value = self.param(key).unwrap_or(""),
                    default,
                    "invalid numeric parameter, using default"
                );
                default
            }
            None => default,
        }
    }

    /// `KEY=VALUE` pairs of the declared parameters, space separated
    pub fn summary_line(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result type for device config loading
pub type DeviceConfigResult<T> = Result<T, DeviceConfigError>;

/// Errors loading the device config file
#[derive(Debug, thiserror::Error)]
pub enum DeviceConfigError {
    #[error("device config {path} not found")]
    NotFound { path: PathBuf },

    #[error("failed to read device config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
