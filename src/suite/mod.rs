//! Per-device tests and the registry the runner dispatches from.
//!
//! Tests are registered explicitly, in the order a full-suite run executes
//! them. A test receives a [`TestContext`] for one device and returns a
//! [`TestOutput`] or a [`TestError`]; the runner turns errors into
//! `Error: <message>` slots so one failing test never affects another.

pub mod door;
pub mod maintenance;
pub mod screenshot;
pub mod types;

pub use door::OpenDoorTest;
pub use maintenance::{ResetTest, SendTextTest, send_display_message};
pub use screenshot::ScreenshotTest;
pub use types::{Outcome, TestContext, TestError, TestOutput, TestResult};

use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;

/// A named check run against one device
#[async_trait]
pub trait DeviceTest: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &TestContext) -> TestResult<TestOutput>;
}

/// Name-to-test table, in registration order
#[derive(Clone, Default)]
pub struct TestRegistry {
    tests: IndexMap<&'static str, Arc<dyn DeviceTest>>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// screenshot, open_door, reset, send_text
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ScreenshotTest::new()));
        registry.register(Arc::new(OpenDoorTest::new()));
        registry.register(Arc::new(ResetTest::new()));
        registry.register(Arc::new(SendTextTest));
        registry
    }

    /// Add a test; a test with the same name replaces the earlier one in place
    pub fn register(&mut self, test: Arc<dyn DeviceTest>) {
        self.tests.insert(test.name(), test);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeviceTest>> {
        self.tests.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tests.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Names of the standard tests, in full-suite order
pub fn list_tests() -> Vec<&'static str> {
    TestRegistry::standard().names()
}

/// HTTP client for device requests
pub(crate) fn http_client(timeout: Duration) -> TestResult<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_order() {
        assert_eq!(list_tests(), vec!["screenshot", "open_door", "reset", "send_text"]);
    }

    #[test]
    fn test_register_replaces_in_place() {
        let mut registry = TestRegistry::standard();
        registry.register(Arc::new(ResetTest::with_reboot_wait(Duration::ZERO)));
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.names()[2], "reset");
        assert!(registry.get("firmware").is_none());
    }
}
