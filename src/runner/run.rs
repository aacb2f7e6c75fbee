//! Run control: at most one active run, dispatched in the background.
//!
//! A run owns the capture service for its whole lifetime. Devices are
//! dispatched through a pool of at most `max_parallel` workers (all at once
//! when 0). The stop token is checked before every dispatch; workers already
//! running are never interrupted, so `stop()` returns once they finish or hit
//! their per-test timeout.

use chrono::Local;
use futures::future::join_all;
use futures::{FutureExt, Stream};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::actuation::LogSource;
use crate::capture::CaptureService;
use crate::config::{Config, ConfirmSettings, RunnerSettings, TransportSettings};
use crate::device::{DeviceConfig, load_device_configs};
use crate::probe::{PingProber, Prober, filter_reachable};
use crate::runner::artifact::write_artifact;
use crate::runner::render::{NO_DEVICES, NO_REACHABLE_DEVICE, render_run_log};
use crate::runner::types::{DeviceResult, RunError, RunMode, RunResult, RunStatus};
use crate::runner::worker::{PlannedTest, WorkerEnv, failed_device, run_device};
use crate::suite::{TestRegistry, send_display_message};

/// Handle to the run controller. Cheap to clone; clones share one run slot.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    settings: RunnerSettings,
    transport: TransportSettings,
    confirm: ConfirmSettings,
    registry: TestRegistry,
    capture: CaptureService,
    prober: Arc<dyn Prober>,
    active: Mutex<Option<ActiveRun>>,
    status: watch::Sender<RunStatus>,
}

struct ActiveRun {
    mode: RunMode,
    cancel: CancellationToken,
    /// Taken by the `stop()` call that waits on it
    task: Option<JoinHandle<()>>,
}

/// What a finished dispatch produced
struct RunOutput {
    text: String,
    artifact: Option<std::path::PathBuf>,
}

impl Runner {
    /// Runner with the standard tests, ICMP probing and the configured capture service
    pub fn new(config: &Config) -> Self {
        Self::with_parts(
            config,
            CaptureService::new(&config.capture),
            Arc::new(PingProber::new(config.runner.probe_timeout)),
            TestRegistry::standard(),
        )
    }

    pub fn with_parts(
        config: &Config,
        capture: CaptureService,
        prober: Arc<dyn Prober>,
        registry: TestRegistry,
    ) -> Self {
        let (status, _) = watch::channel(RunStatus::idle());
        Self {
            inner: Arc::new(RunnerInner {
                settings: config.runner.clone(),
                transport: config.transport.clone(),
                confirm: config.confirm.clone(),
                registry,
                capture,
                prober,
                active: Mutex::new(None),
                status,
            }),
        }
    }

    pub fn capture(&self) -> &CaptureService {
        &self.inner.capture
    }

    pub fn registry(&self) -> &TestRegistry {
        &self.inner.registry
    }

    /// Start a run in the background.
    ///
    /// Fails with [`RunError::Busy`] while another run is active, and with
    /// [`RunError::Capture`] when the capture listener cannot be bound.
    pub async fn start(&self, mode: RunMode) -> RunResult<()> {
        let mut slot = self.inner.active.lock().await;
        if let Some(run) = slot.as_ref() {
            if self.in_flight(run) {
                info!(active = %run.mode, requested = %mode, "run rejected, another run is active");
                return Err(RunError::Busy);
            }
        }
        *slot = None;

        self.inner.capture.start().await?;
        self.inner.status.send_replace(RunStatus::started());

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let token = cancel.clone();
        let run_mode = mode.clone();
        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(execute(&inner, &run_mode, &token))
                .catch_unwind()
                .await;
            inner.capture.stop().await;

            let output = match outcome {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    error!(mode = %run_mode, error = %e, "run failed");
                    RunOutput {
                        text: format!("Error: {}", e),
                        artifact: None,
                    }
                }
                Err(_) => {
                    error!(mode = %run_mode, "run task panicked");
                    RunOutput {
                        text: format!("Error: {}", RunError::Task("run panicked".to_string())),
                        artifact: None,
                    }
                }
            };
            inner.status.send_replace(RunStatus {
                progress: 100,
                done: true,
                result: Some(output.text),
                artifact: output.artifact,
            });
            info!(mode = %run_mode, "run finished");
        });

        info!(mode = %mode, "run started");
        *slot = Some(ActiveRun {
            mode,
            cancel,
            task: Some(task),
        });
        Ok(())
    }

    /// Request a stop and wait for the run to wind down.
    ///
    /// Returns the final status, or `None` when no run was active.
    ///
    /// The run stays in its slot while it winds down, so `start()` keeps
    /// answering busy until the final status is published.
    pub async fn stop(&self) -> Option<RunStatus> {
        let task = {
            let mut slot = self.inner.active.lock().await;
            let run = slot.as_mut()?;
            if !self.in_flight(run) {
                *slot = None;
                return None;
            }
            info!(mode = %run.mode, "stop requested");
            run.cancel.cancel();
            run.task.take()
        };

        let Some(task) = task else {
            // Another stop() owns the task; share its outcome.
            return Some(self.wait().await);
        };
        if let Err(e) = task.await {
            error!(error = %e, "run task did not complete");
            self.inner.status.send_if_modified(|s| {
                if s.done {
                    return false;
                }
                s.progress = 100;
                s.done = true;
                s.result = Some(format!("Error: {}", RunError::Task(e.to_string())));
                true
            });
        }

        self.post_stop_notice().await;
        Some(self.status())
    }

    /// Whether a run is in progress
    pub async fn is_active(&self) -> bool {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| self.in_flight(run))
    }

    /// A run counts as active until it has published its final status
    fn in_flight(&self, run: &ActiveRun) -> bool {
        let running = run.task.as_ref().is_none_or(|task| !task.is_finished());
        running && !self.inner.status.borrow().done
    }

    /// Latest snapshot
    pub fn status(&self) -> RunStatus {
        self.inner.status.borrow().clone()
    }

    /// Wait until the current run is done and return its final snapshot
    pub async fn wait(&self) -> RunStatus {
        let mut rx = self.inner.status.subscribe();
        match rx.wait_for(|s| s.done).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        }
    }

    /// Snapshots at the configured interval, ending with the first `done`
    /// snapshot, which carries the rendered log.
    pub fn events(&self) -> impl Stream<Item = RunStatus> + Send + use<> {
        let rx = self.inner.status.subscribe();
        let interval = self.inner.settings.progress_interval;
        futures::stream::unfold((rx, false), move |(rx, finished)| async move {
            if finished {
                return None;
            }
            tokio::time::sleep(interval).await;
            let snapshot = rx.borrow().clone();
            let finished = snapshot.done;
            Some((snapshot, (rx, finished)))
        })
    }

    async fn post_stop_notice(&self) {
        let Some(notice) = self.inner.settings.stop_notice.clone() else {
            return;
        };
        let devices = match load_device_configs(&self.inner.settings.device_config) {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "stop notice skipped");
                return;
            }
        };

        let timeout = self.inner.transport.http_timeout;
        let posts = devices.iter().filter_map(|device| {
            let address = device.address().ok()?;
            let credentials = device.credentials();
            let notice = notice.clone();
            Some(async move {
                if let Err(e) =
                    send_display_message(&address, &credentials, timeout, &notice, 5).await
                {
                    warn!(device = %address, error = %e, "stop notice not delivered");
                }
            })
        });
        join_all(posts).await;
    }
}

async fn execute(
    inner: &Arc<RunnerInner>,
    mode: &RunMode,
    cancel: &CancellationToken,
) -> RunResult<RunOutput> {
    let started = Local::now().naive_local();
    let devices = load_device_configs(&inner.settings.device_config)?;
    if devices.is_empty() {
        warn!(path = %inner.settings.device_config.display(), "no devices configured");
        return Ok(RunOutput {
            text: NO_DEVICES.to_string(),
            artifact: None,
        });
    }

    let (devices, mut warnings) = if mode.probes(&inner.settings.probe_policy) {
        filter_reachable(devices, inner.prober.as_ref()).await
    } else {
        (devices, Vec::new())
    };
    if devices.is_empty() {
        warnings.push(NO_REACHABLE_DEVICE.to_string());
        return Ok(RunOutput {
            text: warnings.join("\n"),
            artifact: None,
        });
    }

    let plan: Arc<Vec<PlannedTest>> = Arc::new(match mode {
        RunMode::Selected(names) => names
            .iter()
            .map(|name| (name.clone(), inner.registry.get(name)))
            .collect(),
        RunMode::Acceptance | RunMode::Regression => inner
            .registry
            .names()
            .into_iter()
            .map(|name| (name.to_string(), inner.registry.get(name)))
            .collect(),
    });
    let env = WorkerEnv {
        transport: inner.transport.clone(),
        confirm: inner.confirm.clone(),
        logs: Arc::new(inner.capture.clone()) as Arc<dyn LogSource>,
        test_timeout: inner.settings.test_timeout,
    };

    let total = devices.len();
    let limit = match inner.settings.max_parallel {
        0 => total,
        n => n.min(total),
    };
    info!(mode = %mode, devices = total, workers = limit, "dispatching devices");

    let mut results: Vec<Option<DeviceResult>> = vec![None; total];
    let mut pending = devices.clone().into_iter().enumerate();
    let mut workers = JoinSet::new();
    let mut completed = 0usize;
    let mut undispatched = 0usize;

    loop {
        while workers.len() < limit {
            if cancel.is_cancelled() {
                undispatched = pending.by_ref().count();
                break;
            }
            let Some((index, device)) = pending.next() else {
                break;
            };
            let plan = plan.clone();
            let env = env.clone();
            workers.spawn(async move { (index, run_device(device, plan, env).await) });
        }

        let Some(joined) = workers.join_next().await else {
            break;
        };
        completed += 1;
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => error!(error = %e, "device worker failed"),
        }
        publish_progress(&inner.status, completed * 100 / total);
    }

    fill_failed_workers(&mut results, &devices, total - undispatched, &plan);

    if undispatched > 0 {
        let note = format!(
            "WARNING: run stopped, {} device(s) not dispatched",
            undispatched
        );
        warn!(undispatched, "run stopped before all devices were dispatched");
        warnings.push(note);
    }

    let results: Vec<DeviceResult> = results.into_iter().flatten().collect();
    let text = render_run_log(&warnings, &results, mode.timing_lines());
    let path = write_artifact(&inner.settings.log_dir, mode.prefix(), started, &text).map_err(
        |source| RunError::Artifact {
            path: inner.settings.log_dir.clone(),
            source,
        },
    )?;
    info!(artifact = %path.display(), "run log written");

    Ok(RunOutput {
        text,
        artifact: Some(path),
    })
}

/// Devices are dispatched in config order, so the first `dispatched` slots
/// must all hold a result; a worker that died leaves its slot empty.
fn fill_failed_workers(
    results: &mut [Option<DeviceResult>],
    devices: &[DeviceConfig],
    dispatched: usize,
    plan: &[PlannedTest],
) {
    for (slot, device) in results.iter_mut().zip(devices).take(dispatched) {
        if slot.is_none() {
            *slot = Some(failed_device(device.clone(), plan));
        }
    }
}

/// Raise the published progress; never lowers it and never reports done.
fn publish_progress(status: &watch::Sender<RunStatus>, percent: usize) {
    let percent = percent.min(100) as u8;
    status.send_if_modified(|s| {
        if percent > s.progress {
            s.progress = percent;
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::LogStore;
    use crate::suite::{DeviceTest, Outcome, TestContext, TestOutput, TestResult};
    use async_trait::async_trait;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Probe(HashSet<&'static str>);

    #[async_trait]
    impl Prober for Probe {
        async fn is_reachable(&self, host: &str) -> bool {
            self.0.contains(host)
        }
    }

    /// `screenshot` that reports `False` after `delay`
    struct SlowScreenshot {
        delay: Duration,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeviceTest for SlowScreenshot {
        fn name(&self) -> &'static str {
            "screenshot"
        }

        async fn run(&self, _ctx: &TestContext) -> TestResult<TestOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(TestOutput::new(Outcome::Flag(false)))
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        runs: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new(config: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("config.txt"), config).unwrap();
            Self {
                dir,
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn log_dir(&self) -> std::path::PathBuf {
            self.dir.path().join("logs")
        }

        fn runner(&self, delay: Duration, max_parallel: usize, up: &[&'static str]) -> Runner {
            let mut config = Config::defaults();
            config.runner.device_config = self.dir.path().join("config.txt");
            config.runner.log_dir = self.log_dir();
            config.runner.progress_interval = Duration::from_millis(10);
            config.runner.max_parallel = max_parallel;

            let mut registry = TestRegistry::new();
            registry.register(Arc::new(SlowScreenshot {
                delay,
                runs: self.runs.clone(),
            }));
            let capture =
                CaptureService::with_store("127.0.0.1:0", LogStore::new(self.dir.path().join("capture")));
            Runner::with_parts(
                &config,
                capture,
                Arc::new(Probe(up.iter().copied().collect())),
                registry,
            )
        }
    }

    fn screenshot_only() -> RunMode {
        RunMode::Selected(vec!["screenshot".to_string()])
    }

    fn artifacts(dir: &Path) -> usize {
        crate::runner::artifact::list_artifacts(dir).unwrap().len()
    }

    const THREE_DEVICES: &str =
        "IP_CAMERA=10.0.0.5:85\n___\nIP_CAMERA=10.0.0.6:85\n___\nIP_CAMERA=10.0.0.7:85\n";

    #[tokio::test]
    async fn test_single_device_scenario() {
        let fx = Fixture::new("IP_CAMERA=10.0.0.5:85\nLOGIN=admin\nPASSWORD=x\n");
        let runner = fx.runner(Duration::ZERO, 0, &["10.0.0.5"]);

        runner.start(screenshot_only()).await.unwrap();
        let status = runner.wait().await;

        assert_eq!(
            status.result.as_deref(),
            Some("IP_CAMERA=10.0.0.5:85 LOGIN=admin PASSWORD=x\nscreenshot: False")
        );
        assert_eq!(status.progress, 100);
        let artifact = status.artifact.unwrap();
        assert!(
            artifact
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("selected_")
        );
        assert!(!runner.capture().is_running().await);
    }

    #[tokio::test]
    async fn test_second_start_is_busy() {
        let fx = Fixture::new("IP_CAMERA=10.0.0.5:85\n");
        let runner = fx.runner(Duration::from_millis(300), 0, &["10.0.0.5"]);

        runner.start(screenshot_only()).await.unwrap();
        let err = runner.start(RunMode::Acceptance).await.unwrap_err();
        assert!(matches!(err, RunError::Busy));

        runner.wait().await;
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
        assert_eq!(artifacts(&fx.log_dir()), 1);

        // A finished run frees the slot.
        runner.start(screenshot_only()).await.unwrap();
        runner.wait().await;
        assert_eq!(fx.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stop_takes_effect_at_next_dispatch() {
        let fx = Fixture::new(THREE_DEVICES);
        let runner = fx.runner(Duration::from_millis(300), 1, &[]);

        runner.start(RunMode::Regression).await.unwrap();
        while fx.runs.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let status = runner.stop().await.unwrap();
        assert!(status.done);
        assert_eq!(status.progress, 100);
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);

        let text = status.result.unwrap();
        assert!(text.starts_with("WARNING: run stopped, 2 device(s) not dispatched\nIP_CAMERA=10.0.0.5:85"));
        assert!(text.contains("screenshot: False"));
        assert!(text.contains("elapsed_secs: "));
        assert!(!runner.capture().is_running().await);

        assert!(runner.stop().await.is_none());
    }

    #[tokio::test]
    async fn test_start_is_busy_while_stop_waits() {
        let fx = Fixture::new("IP_CAMERA=10.0.0.5:85\n");
        let runner = fx.runner(Duration::from_millis(800), 0, &[]);

        runner.start(RunMode::Regression).await.unwrap();
        while fx.runs.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stopping = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = tokio::time::timeout(Duration::from_millis(200), runner.start(RunMode::Regression))
            .await
            .expect("start answers while a stop is waiting");
        assert!(matches!(started, Err(RunError::Busy)));
        let active = tokio::time::timeout(Duration::from_millis(200), runner.is_active())
            .await
            .expect("is_active answers while a stop is waiting");
        assert!(active);

        // A second stop shares the outcome of the first.
        let again = runner.stop().await.unwrap();
        let first = stopping.await.unwrap().unwrap();
        assert!(first.done);
        assert_eq!(first.result, again.result);
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);

        assert!(!runner.is_active().await);
        runner.start(screenshot_only()).await.unwrap();
        runner.wait().await;
        assert_eq!(fx.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dead_worker_still_gets_a_block() {
        let devices = crate::device::parse_device_configs(THREE_DEVICES);
        let plan: Vec<PlannedTest> = vec![("screenshot".to_string(), None)];
        let finished = DeviceResult {
            config: devices[0].clone(),
            outcomes: [("screenshot".to_string(), Outcome::Flag(true))].into_iter().collect(),
            elapsed: Duration::from_secs(1),
            finished_at: Local::now().naive_local(),
        };
        let mut results = vec![Some(finished), None, None];

        fill_failed_workers(&mut results, &devices, 2, &plan);

        assert!(results[2].is_none());
        let results: Vec<DeviceResult> = results.into_iter().flatten().collect();
        let text = render_run_log(&[], &results, false);
        assert_eq!(
            text,
            "IP_CAMERA=10.0.0.5:85\nscreenshot: True\n\n\
             IP_CAMERA=10.0.0.6:85\nscreenshot: Error: device worker failed"
        );
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let fx = Fixture::new("IP_CAMERA=10.0.0.5\n___\nIP_CAMERA=10.0.0.6\n___\nIP_CAMERA=10.0.0.7\n___\nIP_CAMERA=10.0.0.8\n");
        let runner = fx.runner(Duration::from_millis(40), 1, &[]);

        runner.start(RunMode::Regression).await.unwrap();
        let snapshots: Vec<RunStatus> = runner.events().collect().await;

        let percents: Vec<u8> = snapshots.iter().map(|s| s.progress).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
        let last = snapshots.last().unwrap();
        assert!(last.done);
        assert_eq!(last.progress, 100);
        assert!(last.result.is_some());
        assert!(snapshots[..snapshots.len() - 1].iter().all(|s| !s.done && s.result.is_none()));
        assert_eq!(fx.runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_no_reachable_device_cancels_run() {
        let fx = Fixture::new("IP_CAMERA=10.0.0.5:85\n___\nIP_CAMERA=10.0.0.6\n");
        let runner = fx.runner(Duration::ZERO, 0, &[]);

        runner.start(RunMode::Acceptance).await.unwrap();
        let status = runner.wait().await;

        assert_eq!(
            status.result.as_deref(),
            Some(
                "WARNING: device 10.0.0.5 unreachable, excluded from run\n\
                 WARNING: device 10.0.0.6 unreachable, excluded from run\n\
                 WARNING: no device reachable, run cancelled"
            )
        );
        assert_eq!(fx.runs.load(Ordering::SeqCst), 0);
        assert_eq!(artifacts(&fx.log_dir()), 0);
    }

    #[tokio::test]
    async fn test_unreachable_device_is_excluded() {
        let fx = Fixture::new("IP_CAMERA=10.0.0.5:85\n___\nIP_CAMERA=10.0.0.6\n");
        let runner = fx.runner(Duration::ZERO, 0, &["10.0.0.5"]);

        runner.start(screenshot_only()).await.unwrap();
        let text = runner.wait().await.result.unwrap();
        assert_eq!(
            text,
            "WARNING: device 10.0.0.6 unreachable, excluded from run\nIP_CAMERA=10.0.0.5:85\nscreenshot: False"
        );
    }

    #[tokio::test]
    async fn test_empty_config() {
        let fx = Fixture::new("# nothing here\n");
        let runner = fx.runner(Duration::ZERO, 0, &[]);
        runner.start(RunMode::Acceptance).await.unwrap();
        assert_eq!(runner.wait().await.result.as_deref(), Some(NO_DEVICES));
    }

    #[tokio::test]
    async fn test_missing_config_is_reported() {
        let fx = Fixture::new("");
        std::fs::remove_file(fx.dir.path().join("config.txt")).unwrap();
        let runner = fx.runner(Duration::ZERO, 0, &[]);
        runner.start(RunMode::Acceptance).await.unwrap();
        let text = runner.wait().await.result.unwrap();
        assert!(text.starts_with("Error: device config"), "{}", text);
        assert!(!runner.capture().is_running().await);
    }

    #[tokio::test]
    async fn test_capture_bind_failure_propagates() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let runner = Runner::with_parts(
            &Config::defaults(),
            CaptureService::with_store(addr.to_string(), LogStore::new(dir.path())),
            Arc::new(Probe(HashSet::new())),
            TestRegistry::new(),
        );
        let err = runner.start(RunMode::Acceptance).await.unwrap_err();
        assert!(matches!(err, RunError::Capture(_)));
        assert!(!runner.is_active().await);
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let fx = Fixture::new("IP_CAMERA=10.0.0.5\n");
        let runner = fx.runner(Duration::ZERO, 0, &[]);
        assert!(runner.stop().await.is_none());
        assert_eq!(runner.status(), RunStatus::idle());
    }
}
