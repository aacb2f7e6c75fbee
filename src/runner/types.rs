use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::capture::CaptureError;
use crate::config::ProbePolicy;
use crate::device::{DeviceConfig, DeviceConfigError};
use crate::suite::Outcome;

/// Which tests a run executes and how its log is labelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Full suite, artifact prefix `logacceptance`
    Acceptance,
    /// Full suite, artifact prefix `Regression`
    Regression,
    /// Named subset in the given order, artifact prefix `selected`
    Selected(Vec<String>),
}

impl RunMode {
    /// Build a mode from its name; `tests` is only used by `selected`.
    pub fn from_name(name: &str, tests: Vec<String>) -> RunResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "acceptance" => Ok(RunMode::Acceptance),
            "regression" => Ok(RunMode::Regression),
            "selected" => {
                let tests: Vec<String> = tests
                    .into_iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
                if tests.is_empty() {
                    return Err(RunError::NoTestsSelected);
                }
                Ok(RunMode::Selected(tests))
            }
            _ => Err(RunError::UnknownMode(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunMode::Acceptance => "acceptance",
            RunMode::Regression => "regression",
            RunMode::Selected(_) => "selected",
        }
    }

    /// File-name prefix of the run artifact
    pub fn prefix(&self) -> &'static str {
        match self {
            RunMode::Acceptance => "logacceptance",
            RunMode::Regression => "Regression",
            RunMode::Selected(_) => "selected",
        }
    }

    /// Whether device blocks end with `elapsed_secs` / `finished_at` lines
    pub fn timing_lines(&self) -> bool {
        !matches!(self, RunMode::Selected(_))
    }

    /// Whether unreachable devices are dropped before dispatch
    pub fn probes(&self, policy: &ProbePolicy) -> bool {
        match self {
            RunMode::Acceptance => policy.acceptance,
            RunMode::Regression => policy.regression,
            RunMode::Selected(_) => policy.selected,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Selected(tests) => write!(f, "selected ({})", tests.join(", ")),
            other => f.write_str(other.name()),
        }
    }
}

/// Everything one device worker produced
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceResult {
    pub config: DeviceConfig,
    /// Test slots in execution order, details already flattened
    pub outcomes: IndexMap<String, Outcome>,
    pub elapsed: Duration,
    pub finished_at: NaiveDateTime,
}

/// Snapshot of the current or last run, as served to progress consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    /// Percent of dispatched devices finished, rounded down
    pub progress: u8,
    pub done: bool,
    /// Rendered run log, present once `done`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
}

impl RunStatus {
    /// Nothing running, nothing to report
    pub fn idle() -> Self {
        Self {
            progress: 0,
            done: true,
            result: None,
            artifact: None,
        }
    }

    pub(crate) fn started() -> Self {
        Self {
            progress: 0,
            done: false,
            result: None,
            artifact: None,
        }
    }
}

/// Result type for run control
pub type RunResult<T> = Result<T, RunError>;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("a run is already active")]
    Busy,

    #[error("unknown run mode '{0}'")]
    UnknownMode(String),

    #[error("no tests selected")]
    NoTestsSelected,

    #[error("capture service failed to start: {0}")]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    DeviceConfig(#[from] DeviceConfigError),

    #[error("failed to write run log {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run task failed: {0}")]
    Task(String),
}
