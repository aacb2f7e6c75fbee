//! Issue an action through every channel and prove it happened from the
//! device's own log stream.
//!
//! Two independent bounds apply to every issuance:
//! - the poll deadline limits how long we wait for the device's log to reach
//!   us, measured on the monotonic clock from poll start;
//! - the correlation window limits how far the accepted record's receipt time
//!   may be from the command time, so that a matching line caused by some
//!   other event is not taken as confirmation.

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, Timelike};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actuation::channel::ActuationChannel;
use crate::actuation::types::{
    ActuationAttempt, ActuationError, ActuationReport, ActuationResult, ChannelTally,
};
use crate::capture::{CaptureResult, CaptureService, LogRecord};
use crate::config::ConfirmSettings;
use crate::device::{Credentials, DeviceAddress};

/// Incremental access to a device's log stream
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Records appended since `caller`'s previous call for this host
    async fn follow(&self, host: &str, caller: &str) -> CaptureResult<Vec<LogRecord>>;
}

#[async_trait]
impl LogSource for CaptureService {
    async fn follow(&self, host: &str, caller: &str) -> CaptureResult<Vec<LogRecord>> {
        self.read(host, caller, true).await
    }
}

/// Signed `record - command` delta in seconds when it lies inside `window`
pub fn correlate(
    command_at: NaiveDateTime,
    record_at: NaiveDateTime,
    window: Duration,
) -> Option<i64> {
    let delta = (record_at - command_at).num_seconds();
    (delta.unsigned_abs() <= window.as_secs()).then_some(delta)
}

/// Runs confirmation rounds against one log source
pub struct ConfirmationEngine {
    logs: Arc<dyn LogSource>,
    timing: ConfirmSettings,
    pattern: Regex,
}

impl ConfirmationEngine {
    pub fn new(logs: Arc<dyn LogSource>, timing: ConfirmSettings) -> ActuationResult<Self> {
        let pattern = Regex::new(&timing.confirm_pattern)?;
        Ok(Self {
            logs,
            timing,
            pattern,
        })
    }

    /// Run `rounds` full rounds over `channels` in order.
    ///
    /// A channel's transport failure only marks that attempt unmatched. The
    /// call fails only when nothing can be issued at all.
    pub async fn confirm(
        &self,
        device: &DeviceAddress,
        credentials: &Credentials,
        channels: &[Arc<dyn ActuationChannel>],
        rounds: u32,
    ) -> ActuationResult<ActuationReport> {
        if device.host.trim().is_empty() || device.host.chars().any(char::is_whitespace) {
            return Err(ActuationError::InvalidAddress(device.to_string()));
        }
        if channels.is_empty() {
            return Err(ActuationError::NoChannels);
        }

        let caller = format!("actuation@{}", device.authority());
        let mut tallies: Vec<ChannelTally> = channels
            .iter()
            .map(|c| ChannelTally {
                channel: c.name().to_string(),
                matched: 0,
                total: rounds,
            })
            .collect();
        let mut attempts = Vec::new();

        for round in 1..=rounds {
            for (index, channel) in channels.iter().enumerate() {
                let attempt = self
                    .attempt(round, channel.as_ref(), device, credentials, &caller)
                    .await;
                if attempt.matched {
                    tallies[index].matched += 1;
                }
                attempts.push(attempt);
            }
        }

        let report = ActuationReport {
            rounds,
            channels: tallies,
            attempts,
        };
        info!(device = %device, summary = %report.summary(), "actuation confirmation finished");
        Ok(report)
    }

    async fn attempt(
        &self,
        round: u32,
        channel: &dyn ActuationChannel,
        device: &DeviceAddress,
        credentials: &Credentials,
        caller: &str,
    ) -> ActuationAttempt {
        tokio::time::sleep(self.timing.stage_delay).await;

        let command_at = wall_clock_now();
        let mut attempt = ActuationAttempt {
            round,
            channel: channel.name().to_string(),
            command_at,
            matched: false,
            record_at: None,
            delta_secs: None,
            error: None,
        };

        if let Err(e) = channel.issue(device, credentials).await {
            warn!(device = %device, channel = channel.name(), round, error = %e, "command not issued");
            attempt.error = Some(e.to_string());
            return attempt;
        }

        tokio::time::sleep(self.timing.settle_delay).await;

        match self.await_confirmation(&device.host, caller, command_at).await {
            Some((record_at, delta)) => {
                debug!(device = %device, channel = channel.name(), round, delta, "confirmed");
                attempt.matched = true;
                attempt.record_at = Some(record_at);
                attempt.delta_secs = Some(delta);
            }
            None => {
                info!(device = %device, channel = channel.name(), round, "no confirming record");
            }
        }
        attempt
    }

    /// Poll the device stream until an accepted record shows up or the poll
    /// deadline passes.
    async fn await_confirmation(
        &self,
        host: &str,
        caller: &str,
        command_at: NaiveDateTime,
    ) -> Option<(NaiveDateTime, i64)> {
        let deadline = Instant::now() + self.timing.poll_deadline;

        loop {
            let records = match self.logs.follow(host, caller).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(host, error = %e, "follow read failed");
                    Vec::new()
                }
            };
            if Instant::now() > deadline {
                return None;
            }
            if let Some(found) = self.accept(&records, command_at) {
                return Some(found);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            tokio::time::sleep(self.timing.poll_interval.min(remaining)).await;
        }
    }

    fn accept(&self, records: &[LogRecord], command_at: NaiveDateTime) -> Option<(NaiveDateTime, i64)> {
        records.iter().find_map(|record| {
            let record_at = record.received_at?;
            let delta = correlate(command_at, record_at, self.timing.correlation_window)?;
            self.pattern.is_match(&record.line).then_some((record_at, delta))
        })
    }
}

fn wall_clock_now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuation::types::ChannelError;
    use chrono::DateTime;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn at(epoch: i64) -> NaiveDateTime {
        DateTime::from_timestamp(epoch, 0).unwrap().naive_utc()
    }

    #[test]
    fn test_correlation_window_boundary() {
        let window = Duration::from_secs(10);
        assert_eq!(correlate(at(1000), at(1009), window), Some(9));
        assert_eq!(correlate(at(1000), at(1010), window), Some(10));
        assert_eq!(correlate(at(1000), at(1011), window), None);
        assert_eq!(correlate(at(1000), at(991), window), Some(-9));
        assert_eq!(correlate(at(1000), at(989), window), None);
    }

    fn timing() -> ConfirmSettings {
        ConfirmSettings {
            stage_delay: Duration::from_secs(3),
            settle_delay: Duration::from_secs(3),
            poll_deadline: Duration::from_secs(7),
            poll_interval: Duration::from_millis(250),
            correlation_window: Duration::from_secs(10),
            confirm_pattern: r"STAT/DOOR1:\s*1".to_string(),
        }
    }

    fn record(message: &str, offset_secs: i64) -> LogRecord {
        let received = wall_clock_now() + chrono::Duration::seconds(offset_secs);
        LogRecord::from_payload(
            &format!("<134>Oct 19 10:00:01 cam {}", message),
            "10.0.0.5:40000".parse().unwrap(),
            received,
        )
    }

    /// Releases each scripted record once the monotonic clock passes its
    /// release offset from the first read.
    struct ScriptedLogs {
        script: Mutex<Vec<(Duration, LogRecord)>>,
        started: Mutex<Option<Instant>>,
        reads: AtomicU32,
    }

    impl ScriptedLogs {
        fn new(script: Vec<(Duration, LogRecord)>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                started: Mutex::new(None),
                reads: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl LogSource for ScriptedLogs {
        async fn follow(&self, _host: &str, _caller: &str) -> CaptureResult<Vec<LogRecord>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let started = *self.started.lock().unwrap().get_or_insert_with(Instant::now);
            let elapsed = started.elapsed();
            let mut script = self.script.lock().unwrap();
            let (due, later): (Vec<_>, Vec<_>) =
                script.drain(..).partition(|(release, _)| *release <= elapsed);
            *script = later;
            Ok(due.into_iter().map(|(_, r)| r).collect())
        }
    }

    struct FakeChannel {
        name: &'static str,
        fail: bool,
        issued: AtomicU32,
    }

    impl FakeChannel {
        fn ok(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: false,
                issued: AtomicU32::new(0),
            })
        }

        fn broken(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: true,
                issued: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ActuationChannel for FakeChannel {
        fn name(&self) -> &str {
            self.name
        }

        async fn issue(&self, _: &DeviceAddress, _: &Credentials) -> Result<(), ChannelError> {
            self.issued.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ChannelError::UnexpectedStatus(500))
            } else {
                Ok(())
            }
        }
    }

    fn device() -> DeviceAddress {
        DeviceAddress::new("10.0.0.5", Some(85))
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_record_confirms() {
        let logs = ScriptedLogs::new(vec![(Duration::ZERO, record("STAT/DOOR1: 1", 6))]);
        let engine = ConfirmationEngine::new(logs, timing()).unwrap();
        let channels: Vec<Arc<dyn ActuationChannel>> = vec![FakeChannel::ok("api")];

        let report = engine
            .confirm(&device(), &Credentials::default(), &channels, 1)
            .await
            .unwrap();
        assert_eq!(report.tally("api").unwrap().matched, 1);
        assert!(report.attempts[0].matched);
        assert!(report.attempts[0].delta_secs.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_outside_window_is_ignored() {
        let logs = ScriptedLogs::new(vec![(Duration::ZERO, record("STAT/DOOR1: 1", -60))]);
        let engine = ConfirmationEngine::new(logs, timing()).unwrap();
        let channels: Vec<Arc<dyn ActuationChannel>> = vec![FakeChannel::ok("api")];

        let report = engine
            .confirm(&device(), &Credentials::default(), &channels, 1)
            .await
            .unwrap();
        assert_eq!(report.tally("api").unwrap().matched, 0);
        assert!(report.attempts[0].error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_matching_text_is_ignored() {
        let logs = ScriptedLogs::new(vec![(Duration::ZERO, record("STAT/DOOR1: 0", 0))]);
        let engine = ConfirmationEngine::new(logs, timing()).unwrap();
        let channels: Vec<Arc<dyn ActuationChannel>> = vec![FakeChannel::ok("api")];

        let report = engine
            .confirm(&device(), &Credentials::default(), &channels, 1)
            .await
            .unwrap();
        assert_eq!(report.tally("api").unwrap().matched, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_deadline_boundary() {
        // Arrives 8s after polling began: past the 7s deadline.
        let late = ScriptedLogs::new(vec![(Duration::from_secs(8), record("STAT/DOOR1: 1", 0))]);
        let engine = ConfirmationEngine::new(late.clone(), timing()).unwrap();
        let channels: Vec<Arc<dyn ActuationChannel>> = vec![FakeChannel::ok("api")];
        let report = engine
            .confirm(&device(), &Credentials::default(), &channels, 1)
            .await
            .unwrap();
        assert!(!report.attempts[0].matched);
        assert!(late.reads.load(Ordering::SeqCst) > 1);

        // Arrives 6s after polling began: inside the deadline.
        let timely = ScriptedLogs::new(vec![(Duration::from_secs(6), record("STAT/DOOR1: 1", 0))]);
        let engine = ConfirmationEngine::new(timely, timing()).unwrap();
        let report = engine
            .confirm(&device(), &Credentials::default(), &channels, 1)
            .await
            .unwrap();
        assert!(report.attempts[0].matched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_failure_is_local() {
        let logs = ScriptedLogs::new(vec![]);
        let engine = ConfirmationEngine::new(logs, timing()).unwrap();
        let broken = FakeChannel::broken("api");
        let relay = FakeChannel::ok("relay");
        let channels: Vec<Arc<dyn ActuationChannel>> = vec![broken.clone(), relay.clone()];

        let report = engine
            .confirm(&device(), &Credentials::default(), &channels, 2)
            .await
            .unwrap();
        assert_eq!(broken.issued.load(Ordering::SeqCst), 2);
        assert_eq!(relay.issued.load(Ordering::SeqCst), 2);
        assert_eq!(report.attempts.len(), 4);
        assert!(report.attempts[0].error.is_some());
        assert!(report.attempts[1].error.is_none());
        assert_eq!(report.summary(), "api: 0/2, relay: 0/2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_address_is_fatal() {
        let engine = ConfirmationEngine::new(ScriptedLogs::new(vec![]), timing()).unwrap();
        let channels: Vec<Arc<dyn ActuationChannel>> = vec![FakeChannel::ok("api")];
        let err = engine
            .confirm(
                &DeviceAddress::new("", None),
                &Credentials::default(),
                &channels,
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActuationError::InvalidAddress(_)));

        let err = engine
            .confirm(&device(), &Credentials::default(), &[], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ActuationError::NoChannels));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut bad = timing();
        bad.confirm_pattern = "(".to_string();
        assert!(ConfirmationEngine::new(ScriptedLogs::new(vec![]), bad).is_err());
    }
}
