//! One device worker: run a fixed test list against one device and collect
//! every slot, whatever happens to individual tests.

use chrono::Local;
use futures::FutureExt;
use indexmap::IndexMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::actuation::LogSource;
use crate::config::{ConfirmSettings, TransportSettings};
use crate::device::DeviceConfig;
use crate::runner::types::DeviceResult;
use crate::suite::{DeviceTest, Outcome, TestContext, TestError, TestOutput, TestResult};

/// Slot value for a name with no registered test
pub const UNKNOWN_TEST: &str = "unknown test";

/// Slot value for every test of a device whose worker died
pub const WORKER_FAILED: &str = "Error: device worker failed";

/// A test name and the test it resolved to, if any
pub type PlannedTest = (String, Option<Arc<dyn DeviceTest>>);

/// Shared inputs of every worker in a run
#[derive(Clone)]
pub struct WorkerEnv {
    pub transport: TransportSettings,
    pub confirm: ConfirmSettings,
    pub logs: Arc<dyn LogSource>,
    pub test_timeout: Duration,
}

pub async fn run_device(device: DeviceConfig, plan: Arc<Vec<PlannedTest>>, env: WorkerEnv) -> DeviceResult {
    let started = Instant::now();
    let mut outcomes: IndexMap<String, Outcome> = IndexMap::new();
    info!(device = %device.address_raw(), tests = plan.len(), "device worker started");

    match device.address() {
        Ok(address) => {
            let ctx = TestContext {
                address,
                credentials: device.credentials(),
                device: device.clone(),
                transport: env.transport.clone(),
                confirm: env.confirm.clone(),
                logs: env.logs.clone(),
            };
            for (name, test) in plan.iter() {
                let Some(test) = test else {
                    outcomes.insert(name.clone(), Outcome::from(UNKNOWN_TEST));
                    continue;
                };
                match run_guarded(test.as_ref(), &ctx, env.test_timeout).await {
                    Ok(output) => record(&mut outcomes, name, output),
                    Err(e) => {
                        warn!(device = %ctx.address, test = %name, error = %e, "test failed");
                        outcomes.insert(name.clone(), e.to_outcome());
                    }
                }
            }
        }
        Err(e) => {
            warn!(device = %device.address_raw(), error = %e, "device skipped");
            for (name, test) in plan.iter() {
                let value = match test {
                    Some(_) => Outcome::Text(format!("Error: {}", e)),
                    None => Outcome::from(UNKNOWN_TEST),
                };
                outcomes.insert(name.clone(), value);
            }
        }
    }

    let elapsed = started.elapsed();
    info!(device = %device.address_raw(), elapsed_secs = elapsed.as_secs_f64(), "device worker finished");
    DeviceResult {
        config: device,
        outcomes,
        elapsed,
        finished_at: Local::now().naive_local(),
    }
}

/// Result for a device whose worker task ended without reporting
pub fn failed_device(device: DeviceConfig, plan: &[PlannedTest]) -> DeviceResult {
    let outcomes = plan
        .iter()
        .map(|(name, _)| (name.clone(), Outcome::from(WORKER_FAILED)))
        .collect();
    DeviceResult {
        config: device,
        outcomes,
        elapsed: Duration::ZERO,
        finished_at: Local::now().naive_local(),
    }
}

/// Run one test with a timeout; a panic becomes [`TestError::Panicked`].
async fn run_guarded(test: &dyn DeviceTest, ctx: &TestContext, timeout: Duration) -> TestResult<TestOutput> {
    match tokio::time::timeout(timeout, AssertUnwindSafe(test.run(ctx)).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(TestError::Panicked),
        Err(_) => Err(TestError::Timeout(timeout)),
    }
}

fn record(outcomes: &mut IndexMap<String, Outcome>, name: &str, output: TestOutput) {
    outcomes.insert(name.to_string(), output.outcome);
    for (detail, value) in output.details {
        outcomes.insert(format!("{}_{}", name, detail), value);
    }
}
