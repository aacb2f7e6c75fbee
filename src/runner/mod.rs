//! Multi-device test orchestration: load devices, filter unreachable ones,
//! run one worker per device and render the canonical run log.

pub mod artifact;
pub mod render;
pub mod run;
pub mod types;
pub mod worker;

pub use artifact::{latest_artifact, list_artifacts, write_artifact};
pub use render::{
    NO_DEVICES, NO_REACHABLE_DEVICE, ParsedBlock, ParsedRunLog, RunSummary, parse_run_log,
    render_device_block, render_run_log,
};
pub use run::Runner;
pub use types::{DeviceResult, RunError, RunMode, RunResult, RunStatus};
pub use worker::{UNKNOWN_TEST, WORKER_FAILED};
