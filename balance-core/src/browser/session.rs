use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::error::ScrapeResult;

/// Snapshot of what the remote surface currently shows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObservedState {
    pub url: String,
    pub text: String,
}

impl ObservedState {
    pub fn new(url: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            text: text.into(),
        }
    }
}

/// One interactive connection to a remote UI, owned by a single retrieval.
///
/// Every method is a suspension point; implementations must bound their own
/// waits so that no call blocks forever.
#[async_trait(?Send)]
pub trait ControllableSession {
    async fn navigate(&self, url: &str) -> ScrapeResult<()>;
    async fn find_and_wait(&self, selector: &str, timeout: Duration) -> ScrapeResult<()>;
    async fn click(&self, selector: &str) -> ScrapeResult<()>;
    async fn type_text(&self, selector: &str, text: &str) -> ScrapeResult<()>;
    async fn current_location(&self) -> ScrapeResult<ObservedState>;
    async fn screenshot(&self) -> ScrapeResult<Vec<u8>>;
    async fn snapshot(&self) -> ScrapeResult<Vec<u8>>;

    /// Releases whatever the session holds open. Called once, after the
    /// retrieval finished either way; the session is not used afterwards.
    async fn close(&self) -> ScrapeResult<()> {
        Ok(())
    }
}

/// Hands out a fresh session per retrieval; sessions are never shared.
#[async_trait(?Send)]
pub trait SessionSource {
    async fn open(&self) -> ScrapeResult<Box<dyn ControllableSession>>;
}
