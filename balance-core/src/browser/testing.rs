//! In-memory sessions for exercising institutions and the login machine
//! without a browser.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::error::{ScrapeError, ScrapeResult};
use super::session::{ControllableSession, ObservedState};

/// Replays a queue of observed states and records every action as text
/// (`"click #signin"`, `"type #otp 552901"`). The last state sticks once the
/// queue is drained.
#[derive(Debug, Default)]
pub struct ScriptedSession {
    states: Mutex<VecDeque<ObservedState>>,
    log: Mutex<Vec<String>>,
    fail_screenshot: bool,
    closes: Arc<AtomicUsize>,
}

impl ScriptedSession {
    pub fn with_states(states: Vec<ObservedState>) -> Self {
        Self {
            states: Mutex::new(states.into()),
            ..Default::default()
        }
    }

    pub fn failing_screenshots(mut self) -> Self {
        self.fail_screenshot = true;
        self
    }

    /// Counts `close` calls into `counter`, which outlives the session.
    pub fn counting_closes(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.closes = counter;
        self
    }

    pub fn actions(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn push(&self, action: String) {
        lock(&self.log).push(action);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait(?Send)]
impl ControllableSession for ScriptedSession {
    async fn navigate(&self, url: &str) -> ScrapeResult<()> {
        self.push(format!("navigate {url}"));
        Ok(())
    }

    async fn find_and_wait(&self, selector: &str, _timeout: Duration) -> ScrapeResult<()> {
        self.push(format!("wait {selector}"));
        Ok(())
    }

    async fn click(&self, selector: &str) -> ScrapeResult<()> {
        self.push(format!("click {selector}"));
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> ScrapeResult<()> {
        self.push(format!("type {selector} {text}"));
        Ok(())
    }

    async fn current_location(&self) -> ScrapeResult<ObservedState> {
        let mut states = lock(&self.states);
        let state = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().cloned()
        };
        Ok(state.unwrap_or_default())
    }

    async fn screenshot(&self) -> ScrapeResult<Vec<u8>> {
        if self.fail_screenshot {
            return Err(ScrapeError::Unexpected("screenshot unavailable".into()));
        }
        Ok(b"\x89PNG".to_vec())
    }

    async fn snapshot(&self) -> ScrapeResult<Vec<u8>> {
        Ok(b"MIME-Version: 1.0".to_vec())
    }

    async fn close(&self) -> ScrapeResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.push("close".to_string());
        Ok(())
    }
}
