mod automation;
mod capture;
mod error;
mod retry;
mod session;

pub mod testing;

pub use automation::{BrowserAutomation, BrowserLauncher, ChromiumSession};
pub use capture::{
    latest_screenshot, search_for_dir, DiagnosticArtifact, DiagnosticCapture, DEFAULT_CAPTURE_ON,
};
pub use error::{ErrorKind, ScrapeError, ScrapeResult};
pub use retry::{RetryOutcome, RetryPolicy};
pub use session::{ControllableSession, ObservedState, SessionSource};
