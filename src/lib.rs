//! Intercom harness - acceptance and regression runs against networked
//! intercom devices.
//!
//! This crate provides:
//! - A UDP syslog capture service filing records per device and day, with
//!   full and incremental (follow) reads
//! - An actuation engine that opens a door over REST and MQTT channels and
//!   confirms each command from the device's own log
//! - A runner that fans tests out across devices, reports progress, honours
//!   stop requests and writes a canonical run log
//!
//! # Example
//!
//! ```rust,no_run
//! use intercom_harness::config::Config;
//! use intercom_harness::runner::{RunMode, Runner};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let runner = Runner::new(&Config::from_env());
//! runner.start(RunMode::Acceptance).await?;
//! let status = runner.wait().await;
//! println!("{}", status.result.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod actuation;
pub mod capture;
pub mod config;
pub mod device;
pub mod probe;
pub mod runner;
pub mod server;
pub mod suite;

// Re-export capture types
pub use capture::{CaptureError, CaptureResult, CaptureService, LogRecord, LogStore};

// Re-export actuation types
pub use actuation::{
    ActuationChannel, ActuationError, ActuationReport, ConfirmationEngine, LogSource,
    default_channels,
};

// Re-export device config
pub use device::{Credentials, DeviceAddress, DeviceConfig, load_device_configs};

// Re-export runner and test registry
pub use runner::{DeviceResult, RunError, RunMode, RunStatus, Runner, parse_run_log, render_run_log};
pub use suite::{DeviceTest, Outcome, TestRegistry, list_tests};
