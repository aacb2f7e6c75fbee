//! Reachability probing: one ICMP echo per distinct host, all in flight at once.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::device::DeviceConfig;

/// Checks whether a host answers
#[async_trait]
pub trait Prober: Send + Sync {
    async fn is_reachable(&self, host: &str) -> bool;
}

/// Probe with the system `ping` binary, one echo request per host
#[derive(Debug, Clone)]
pub struct PingProber {
    timeout: Duration,
}

impl PingProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn is_reachable(&self, host: &str) -> bool {
        let wait_secs = self.timeout.as_secs().max(1).to_string();
        let child = Command::new("ping")
            .args(["-c", "1", "-W", &wait_secs, host])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        // ping's own -W bounds the wait; the outer timeout covers DNS stalls.
        match tokio::time::timeout(self.timeout + Duration::from_secs(1), child).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!(host, error = %e, "failed to run ping");
                false
            }
            Err(_) => false,
        }
    }
}

/// Warning line for a device dropped before dispatch
pub fn unreachable_warning(host: &str) -> String {
    format!("WARNING: device {} unreachable, excluded from run", host)
}

/// Keep the devices whose host answered, preserving order.
///
/// Each distinct host is probed once, concurrently. Returns the survivors and
/// one warning line per excluded host, in first-seen order.
pub async fn filter_reachable(
    devices: Vec<DeviceConfig>,
    prober: &dyn Prober,
) -> (Vec<DeviceConfig>, Vec<String>) {
    let mut hosts: Vec<String> = Vec::new();
    for device in &devices {
        let host = device.host().to_string();
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }

    let answers = join_all(hosts.iter().map(|host| prober.is_reachable(host))).await;
    let reachable: HashMap<&str, bool> = hosts
        .iter()
        .map(String::as_str)
        .zip(answers)
        .collect();

    let warnings = hosts
        .iter()
        .filter(|host| !reachable[host.as_str()])
        .map(|host| {
            warn!(host = %host, "device unreachable, excluded from run");
            unreachable_warning(host)
        })
        .collect();

    let kept: Vec<DeviceConfig> = devices
        .into_iter()
        .filter(|d| reachable.get(d.host()).copied().unwrap_or(false))
        .collect();
    debug!(kept = kept.len(), probed = hosts.len(), "reachability filter done");

    (kept, warnings)
}
