//! Device maintenance actions: factory reset and display messages.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::info;

use crate::device::{Credentials, DeviceAddress};
use crate::suite::types::{TestContext, TestError, TestOutput, TestResult};
use crate::suite::{DeviceTest, http_client};

pub const RESET_PATH: &str = "/cgi-bin/magicBox.cgi?action=resetSystemEx";
pub const DISPLAY_MESSAGE_PATH: &str = "/api/v1/display/message";

/// Factory reset, only when the block sets `RESET=1`
#[derive(Debug, Clone)]
pub struct ResetTest {
    reboot_wait: Duration,
}

impl ResetTest {
    pub fn new() -> Self {
        Self::with_reboot_wait(Duration::from_secs(10))
    }

    pub fn with_reboot_wait(reboot_wait: Duration) -> Self {
        Self { reboot_wait }
    }
}

impl Default for ResetTest {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTest for ResetTest {
    fn name(&self) -> &'static str {
        "reset"
    }

    async fn run(&self, ctx: &TestContext) -> TestResult<TestOutput> {
        match ctx.device.param("RESET").map(str::trim).unwrap_or("0") {
            "0" => Ok(TestOutput::new("factory reset disabled")),
            "1" => {
                let client = http_client(ctx.transport.http_timeout)?;
                let url = format!("{}{}", ctx.address.base_url(), RESET_PATH);
                let status = client
                    .get(&url)
                    .basic_auth(&ctx.credentials.login, Some(&ctx.credentials.secret))
                    .send()
                    .await?
                    .status();
                if !status.is_success() {
                    return Err(TestError::Status(status.as_u16()));
                }
                info!(device = %ctx.address, "factory reset issued, waiting for reboot");
                tokio::time::sleep(self.reboot_wait).await;
                Ok(TestOutput::new("factory reset done"))
            }
            other => Err(TestError::InvalidParameter {
                key: "RESET".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Show `TEXT` on the device display for `DURATION` seconds
#[derive(Debug, Clone, Default)]
pub struct SendTextTest;

#[async_trait]
impl DeviceTest for SendTextTest {
    fn name(&self) -> &'static str {
        "send_text"
    }

    async fn run(&self, ctx: &TestContext) -> TestResult<TestOutput> {
        let text = ctx.device.param("TEXT").unwrap_or("Test");
        let duration = ctx.device.param_u32("DURATION", 2);
        send_display_message(
            &ctx.address,
            &ctx.credentials,
            ctx.transport.http_timeout,
            text,
            duration,
        )
        .await?;
        Ok(TestOutput::new("message sent"))
    }
}

/// `POST` a display message to the device
pub async fn send_display_message(
    address: &DeviceAddress,
    credentials: &Credentials,
    timeout: Duration,
    text: &str,
    duration: u32,
) -> TestResult<()> {
    let client = http_client(timeout)?;
    let url = format!("{}{}", address.base_url(), DISPLAY_MESSAGE_PATH);
    let status = client
        .post(&url)
        .basic_auth(&credentials.login, Some(&credentials.secret))
        .json(&json!({ "text": text, "duration": duration }))
        .send()
        .await?
        .status();
    if !status.is_success() {
        return Err(TestError::Status(status.as_u16()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::test_support::context;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_reset_disabled_by_default() {
        let ctx = context("10.0.0.5:85", &[]);
        let output = ResetTest::with_reboot_wait(Duration::ZERO).run(&ctx).await.unwrap();
        assert_eq!(output.outcome.to_string(), "factory reset disabled");
    }

    #[tokio::test]
    async fn test_reset_invalid_value() {
        let ctx = context("10.0.0.5:85", &[("RESET", "yes")]);
        let err = ResetTest::new().run(&ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid parameter RESET=yes");
    }

    #[tokio::test]
    async fn test_reset_issues_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/cgi-bin/magicBox.cgi")
            .match_query(Matcher::UrlEncoded("action".into(), "resetSystemEx".into()))
            .with_status(200)
            .create_async()
            .await;

        let ctx = context(&server.host_with_port(), &[("RESET", "1")]);
        let output = ResetTest::with_reboot_wait(Duration::ZERO).run(&ctx).await.unwrap();
        assert_eq!(output.outcome.to_string(), "factory reset done");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_text_posts_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", DISPLAY_MESSAGE_PATH)
            .match_body(Matcher::Json(json!({"text": "Hello", "duration": 5})))
            .with_status(200)
            .create_async()
            .await;

        let ctx = context(&server.host_with_port(), &[("TEXT", "Hello"), ("DURATION", "5")]);
        let output = SendTextTest.run(&ctx).await.unwrap();
        assert_eq!(output.outcome.to_string(), "message sent");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_text_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", DISPLAY_MESSAGE_PATH)
            .with_status(401)
            .create_async()
            .await;

        let ctx = context(&server.host_with_port(), &[]);
        let err = SendTextTest.run(&ctx).await.unwrap_err();
        assert!(matches!(err, TestError::Status(401)));
    }
}
