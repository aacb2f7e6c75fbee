use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::actuation::{ActuationError, LogSource};
use crate::config::{ConfirmSettings, TransportSettings};
use crate::device::{Credentials, DeviceAddress, DeviceConfig};

/// Value recorded in one `name: value` slot of a device block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outcome {
    Flag(bool),
    Text(String),
    Report(serde_json::Value),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Flag(true) => f.write_str("True"),
            Outcome::Flag(false) => f.write_str("False"),
            Outcome::Text(text) => f.write_str(text),
            Outcome::Report(serde_json::Value::String(text)) => f.write_str(text),
            Outcome::Report(value) => write!(f, "{}", value),
        }
    }
}

impl From<bool> for Outcome {
    fn from(value: bool) -> Self {
        Outcome::Flag(value)
    }
}

impl From<String> for Outcome {
    fn from(value: String) -> Self {
        Outcome::Text(value)
    }
}

impl From<&str> for Outcome {
    fn from(value: &str) -> Self {
        Outcome::Text(value.to_string())
    }
}

impl From<u32> for Outcome {
    fn from(value: u32) -> Self {
        Outcome::Report(value.into())
    }
}

/// What a device test returns: its headline outcome plus named details,
/// rendered as `<test>_<detail>` lines after the headline.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutput {
    pub outcome: Outcome,
    pub details: IndexMap<String, Outcome>,
}

impl TestOutput {
    pub fn new(outcome: impl Into<Outcome>) -> Self {
        Self {
            outcome: outcome.into(),
            details: IndexMap::new(),
        }
    }

    pub fn detail(mut self, name: impl Into<String>, value: impl Into<Outcome>) -> Self {
        self.details.insert(name.into(), value.into());
        self
    }
}

/// Everything a device test may touch while running against one device
#[derive(Clone)]
pub struct TestContext {
    pub device: DeviceConfig,
    pub address: DeviceAddress,
    pub credentials: Credentials,
    pub transport: TransportSettings,
    pub confirm: ConfirmSettings,
    /// Device log streams, for tests that confirm actions from the log
    pub logs: Arc<dyn LogSource>,
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("address", &self.address)
            .field("login", &self.credentials.login)
            .finish_non_exhaustive()
    }
}

/// Result type for device tests
pub type TestResult<T> = Result<T, TestError>;

/// Failure of a single test; rendered as `Error: <message>` in its slot
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error(transparent)]
    Actuation(#[from] ActuationError),

    #[error("invalid parameter {key}={value}")]
    InvalidParameter { key: String, value: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("test panicked")]
    Panicked,
}

impl TestError {
    /// The slot value recorded for this failure
    pub fn to_outcome(&self) -> Outcome {
        Outcome::Text(format!("Error: {}", self))
    }
}
