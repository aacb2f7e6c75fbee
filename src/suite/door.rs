//! Door-open confirmation across all channels.

use async_trait::async_trait;

use crate::actuation::{ChannelSet, ConfirmationEngine, default_channels};
use crate::suite::DeviceTest;
use crate::suite::types::{Outcome, TestContext, TestOutput, TestResult};

/// Rounds when `DOOR_ATTEMPTS` is missing or invalid
pub const DEFAULT_DOOR_ATTEMPTS: u32 = 3;

#[derive(Default)]
pub struct OpenDoorTest {
    channels: Option<ChannelSet>,
}

impl OpenDoorTest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed channel set instead of the configured transports
    pub fn with_channels(channels: ChannelSet) -> Self {
        Self {
            channels: Some(channels),
        }
    }
}

#[async_trait]
impl DeviceTest for OpenDoorTest {
    fn name(&self) -> &'static str {
        "open_door"
    }

    async fn run(&self, ctx: &TestContext) -> TestResult<TestOutput> {
        let rounds = ctx.device.param_u32("DOOR_ATTEMPTS", DEFAULT_DOOR_ATTEMPTS);
        let channels = match &self.channels {
            Some(channels) => channels.clone(),
            None => default_channels(&ctx.transport),
        };

        let engine = ConfirmationEngine::new(ctx.logs.clone(), ctx.confirm.clone())?;
        let report = engine
            .confirm(&ctx.address, &ctx.credentials, &channels, rounds)
            .await?;

        let mut output = TestOutput::new(Outcome::Text(report.summary()));
        for tally in &report.channels {
            output = output.detail(
                tally.channel.clone(),
                format!("{}/{}", tally.matched, tally.total),
            );
        }
        Ok(output)
    }
}
