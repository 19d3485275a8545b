pub mod auth;
pub mod batch;
pub mod browser;
pub mod config;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod net;

pub use auth::{
    acquire_code, LoginSettings, LoginStateMachine, Matcher, MfaChallengeConfig, OtpPoller,
    SearchOrder, SessionState, StateClassifier, StateRule, Transition,
};
pub use batch::{BatchJob, BatchReport, BatchRunner, JobReport, JobStatus};
pub use browser::{
    latest_screenshot, search_for_dir, BrowserAutomation, BrowserLauncher, ChromiumSession,
    ControllableSession, DiagnosticArtifact, DiagnosticCapture, ErrorKind, ObservedState,
    RetryOutcome, RetryPolicy, ScrapeError, ScrapeResult, SessionSource,
};
pub use config::{
    load_scraper_config, ChromiumSection, DiagnosticsSection, InstitutionEntry, LoginSection,
    MfaSection, ObservabilitySection, RetrySection, ScraperConfig,
};
pub use driver::{Credential, Institution, Retrieval, RetrievalOutcome};
pub use error::{ConfigError, Result};
pub use ledger::{JailEntry, LedgerError, LedgerResult, RunLedger, RunRecord};
pub use metrics::{
    render_exposition, render_gauge, to_metrics, Cell, ExtractedTable, Metric, MetricColumns,
    MetricLabels, CURRENT_BALANCE, CURRENT_VALUE, TOTAL_ASSETS,
};
pub use net::{http_client, push_metrics, push_url, request_ok};
pub use url::Url;
