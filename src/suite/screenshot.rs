//! Snapshot endpoint soak: fetch `/image.jpg` repeatedly and count frames that
//! decode as real images.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::{debug, info};

use crate::suite::types::{TestContext, TestOutput, TestResult};
use crate::suite::{DeviceTest, http_client};

pub const SNAPSHOT_PATH: &str = "/image.jpg";

/// Attempts when `MAX_SCREENSHOTS` is missing or invalid
pub const DEFAULT_MAX_SCREENSHOTS: u32 = 10_000;

/// Give up after this many failures in a row
pub const MAX_CONSECUTIVE_ERRORS: u32 = 100;

/// Minimum success rate, in percent, for a passing run
pub const PASS_RATE: f64 = 90.0;

/// Smallest body accepted as a frame
const MIN_FRAME_BYTES: usize = 1024;

#[derive(Debug, Clone)]
pub struct ScreenshotTest {
    pace: Duration,
}

impl ScreenshotTest {
    pub fn new() -> Self {
        Self::with_pace(Duration::from_millis(10))
    }

    /// Sleep between requests
    pub fn with_pace(pace: Duration) -> Self {
        Self { pace }
    }
}

impl Default for ScreenshotTest {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTest for ScreenshotTest {
    fn name(&self) -> &'static str {
        "screenshot"
    }

    async fn run(&self, ctx: &TestContext) -> TestResult<TestOutput> {
        let max_attempts = ctx.device.param_u32("MAX_SCREENSHOTS", DEFAULT_MAX_SCREENSHOTS);
        let client = http_client(ctx.transport.http_timeout)?;
        let url = format!("{}{}", ctx.address.base_url(), SNAPSHOT_PATH);

        let mut attempts = 0u32;
        let mut successes = 0u32;
        let mut consecutive = 0u32;
        let mut last_error = String::new();

        while attempts < max_attempts {
            attempts += 1;
            match fetch_frame(&client, &url, ctx).await {
                Ok(()) => {
                    successes += 1;
                    consecutive = 0;
                }
                Err(reason) => {
                    consecutive += 1;
                    last_error = reason;
                }
            }

            if attempts % 100 == 0 {
                debug!(device = %ctx.address, attempts, max_attempts, successes, "screenshot progress");
            }
            if consecutive >= MAX_CONSECUTIVE_ERRORS {
                info!(device = %ctx.address, consecutive, error = %last_error, "screenshot run aborted");
                break;
            }
            tokio::time::sleep(self.pace).await;
        }

        let rate = if attempts > 0 {
            f64::from(successes) * 100.0 / f64::from(attempts)
        } else {
            0.0
        };
        let passed = rate >= PASS_RATE;
        info!(device = %ctx.address, attempts, successes, rate, "screenshot run finished");

        Ok(TestOutput::new(passed)
            .detail("success_rate", format!("{:.2}%", rate))
            .detail("attempts", attempts)
            .detail("successes", successes)
            .detail("error_message", if passed { String::new() } else { last_error }))
    }
}

/// One request; `Err` carries the reason the frame was rejected.
async fn fetch_frame(client: &reqwest::Client, url: &str, ctx: &TestContext) -> Result<(), String> {
    let response = client
        .get(url)
        .basic_auth(&ctx.credentials.login, Some(&ctx.credentials.secret))
        .send()
        .await
        .map_err(|e| format!("request failed: {}", e))?;

    let status = response.status();
    if status.as_u16() != 200 {
        return Err(format!("status {}", status.as_u16()));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !content_type.starts_with("image/") {
        return Err(format!("unexpected content type '{}'", content_type));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| format!("body read failed: {}", e))?;
    if body.len() < MIN_FRAME_BYTES {
        return Err(format!("frame too small: {} bytes", body.len()));
    }

    image::load_from_memory(&body).map_err(|e| format!("invalid image: {}", e))?;
    Ok(())
}
