use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ScrapeResult<T> = Result<T, ScrapeError>;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error("element not found: {0}")]
    MissingElement(String),
    #[error("otp source directory not found: {}", .0.display())]
    PathNotFound(PathBuf),
    #[error("no files found in otp source directory {}", .0.display())]
    NoFilesFound(PathBuf),
    #[error("no one-time code tagged {tag} found in {}", dir.display())]
    CodeNotFound { tag: String, dir: PathBuf },
    #[error("password reset required for {0}")]
    PasswordResetRequired(String),
    #[error("no metrics produced for {0}")]
    EmptyMetricSet(String),
    #[error("request to {url} answered with status {status}")]
    NetworkNotOk { url: String, status: u16 },
    #[error("challenge still pending after {0} rounds")]
    ChallengeExhausted(usize),
    #[error("{0} asked for a one-time code but no mfa configuration was supplied")]
    MfaNotConfigured(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<tokio::task::JoinError> for ScrapeError {
    fn from(err: tokio::task::JoinError) -> Self {
        ScrapeError::Unexpected(err.to_string())
    }
}

impl From<regex::Error> for ScrapeError {
    fn from(err: regex::Error) -> Self {
        ScrapeError::Configuration(err.to_string())
    }
}

/// Discriminant of [`ScrapeError`], used for whitelists (capture, retry) and
/// for persisting outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Assertion,
    MissingElement,
    PathNotFound,
    NoFilesFound,
    CodeNotFound,
    PasswordResetRequired,
    EmptyMetricSet,
    NetworkNotOk,
    ChallengeExhausted,
    MfaNotConfigured,
    Network,
    Io,
    Cdp,
    Launch,
    Configuration,
    Unexpected,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 17] = [
        ErrorKind::Timeout,
        ErrorKind::Assertion,
        ErrorKind::MissingElement,
        ErrorKind::PathNotFound,
        ErrorKind::NoFilesFound,
        ErrorKind::CodeNotFound,
        ErrorKind::PasswordResetRequired,
        ErrorKind::EmptyMetricSet,
        ErrorKind::NetworkNotOk,
        ErrorKind::ChallengeExhausted,
        ErrorKind::MfaNotConfigured,
        ErrorKind::Network,
        ErrorKind::Io,
        ErrorKind::Cdp,
        ErrorKind::Launch,
        ErrorKind::Configuration,
        ErrorKind::Unexpected,
    ];

    /// Terminal errors cannot change outcome on a second attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorKind::PasswordResetRequired
                | ErrorKind::EmptyMetricSet
                | ErrorKind::MfaNotConfigured
                | ErrorKind::Configuration
        )
    }

    pub fn is_recoverable(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Assertion => "assertion",
            ErrorKind::MissingElement => "missing_element",
            ErrorKind::PathNotFound => "path_not_found",
            ErrorKind::NoFilesFound => "no_files_found",
            ErrorKind::CodeNotFound => "code_not_found",
            ErrorKind::PasswordResetRequired => "password_reset_required",
            ErrorKind::EmptyMetricSet => "empty_metric_set",
            ErrorKind::NetworkNotOk => "network_not_ok",
            ErrorKind::ChallengeExhausted => "challenge_exhausted",
            ErrorKind::MfaNotConfigured => "mfa_not_configured",
            ErrorKind::Network => "network",
            ErrorKind::Io => "io",
            ErrorKind::Cdp => "cdp",
            ErrorKind::Launch => "launch",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown error kind {value}"))
    }
}

impl ScrapeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScrapeError::Timeout(_) => ErrorKind::Timeout,
            ScrapeError::Assertion(_) => ErrorKind::Assertion,
            ScrapeError::MissingElement(_) => ErrorKind::MissingElement,
            ScrapeError::PathNotFound(_) => ErrorKind::PathNotFound,
            ScrapeError::NoFilesFound(_) => ErrorKind::NoFilesFound,
            ScrapeError::CodeNotFound { .. } => ErrorKind::CodeNotFound,
            ScrapeError::PasswordResetRequired(_) => ErrorKind::PasswordResetRequired,
            ScrapeError::EmptyMetricSet(_) => ErrorKind::EmptyMetricSet,
            ScrapeError::NetworkNotOk { .. } => ErrorKind::NetworkNotOk,
            ScrapeError::ChallengeExhausted(_) => ErrorKind::ChallengeExhausted,
            ScrapeError::MfaNotConfigured(_) => ErrorKind::MfaNotConfigured,
            ScrapeError::Network(_) => ErrorKind::Network,
            ScrapeError::Io(_) => ErrorKind::Io,
            ScrapeError::Cdp(err) => {
                if err.to_string().to_lowercase().contains("timeout") {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Cdp
                }
            }
            ScrapeError::Launch(_) => ErrorKind::Launch,
            ScrapeError::Configuration(_) => ErrorKind::Configuration,
            ScrapeError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}
