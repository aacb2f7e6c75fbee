//! Push-log capture: a UDP listener that files syslog-like datagrams into
//! per-device, per-day streams and serves full or incremental reads.

pub mod record;
pub mod service;
pub mod store;
pub mod types;

pub use record::{Envelope, LogRecord, RECEIPT_FORMAT};
pub use service::CaptureService;
pub use store::{LogStore, RAW_STREAM, SERVER_STREAM};
pub use types::{CaptureError, CaptureResult, CaptureState};
