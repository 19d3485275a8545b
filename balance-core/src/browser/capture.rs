use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::{FutureExt, LocalBoxFuture};
use serde::Serialize;
use tracing::warn;

use crate::config::DiagnosticsSection;

use super::error::{ErrorKind, ScrapeError, ScrapeResult};
use super::session::ControllableSession;

pub const DEFAULT_CAPTURE_ON: [ErrorKind; 3] = [
    ErrorKind::Timeout,
    ErrorKind::Assertion,
    ErrorKind::MissingElement,
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticArtifact {
    pub screenshot_path: PathBuf,
    pub snapshot_path: PathBuf,
}

impl DiagnosticArtifact {
    pub fn for_failure(error_dir: &Path, institution: &str, at: DateTime<Utc>) -> Self {
        let stem = format!("{}_{}", at.format(TIMESTAMP_FORMAT), institution);
        let screenshot_path = error_dir.join(format!("{stem}.png"));
        let snapshot_path = screenshot_path.with_extension("html");
        Self {
            screenshot_path,
            snapshot_path,
        }
    }
}

/// Persists a screenshot and page snapshot when a wrapped step fails with
/// one of the configured error kinds. The original error is always returned
/// unchanged.
#[derive(Debug)]
pub struct DiagnosticCapture {
    error_dir: PathBuf,
    institution: String,
    capture_on: Vec<ErrorKind>,
    last: Mutex<Option<DiagnosticArtifact>>,
}

impl DiagnosticCapture {
    pub fn new(error_dir: impl Into<PathBuf>, institution: impl Into<String>) -> Self {
        Self {
            error_dir: error_dir.into(),
            institution: institution.into(),
            capture_on: DEFAULT_CAPTURE_ON.to_vec(),
            last: Mutex::new(None),
        }
    }

    pub fn from_config(section: &DiagnosticsSection, institution: impl Into<String>) -> Self {
        Self::new(&section.error_dir, institution).with_capture_on(section.capture_on.clone())
    }

    pub fn with_capture_on(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.capture_on = kinds;
        self
    }

    pub fn error_dir(&self) -> &Path {
        &self.error_dir
    }

    pub fn captures(&self, error: &ScrapeError) -> bool {
        self.capture_on.contains(&error.kind())
    }

    /// Most recent artifact written by this capture, if any.
    pub fn last_artifact(&self) -> Option<DiagnosticArtifact> {
        self.last.lock().ok().and_then(|guard| guard.clone())
    }

    pub async fn run<'s, S, F, Fut, T>(&self, session: &'s S, step: F) -> ScrapeResult<T>
    where
        S: ControllableSession + ?Sized,
        F: FnOnce(&'s S) -> Fut,
        Fut: Future<Output = ScrapeResult<T>>,
    {
        match step(session).await {
            Ok(value) => Ok(value),
            Err(error) => {
                if self.captures(&error) {
                    self.record(session, &error).await;
                }
                Err(error)
            }
        }
    }

    /// Returns `step` augmented with capture-on-failure, for composition with
    /// other wrappers.
    pub fn wrap<'s, S, F, Fut, T>(
        &'s self,
        step: F,
    ) -> impl FnOnce(&'s S) -> LocalBoxFuture<'s, ScrapeResult<T>> + 's
    where
        S: ControllableSession + ?Sized + 's,
        F: FnOnce(&'s S) -> Fut + 's,
        Fut: Future<Output = ScrapeResult<T>> + 's,
        T: 's,
    {
        move |session: &'s S| self.run(session, step).boxed_local()
    }

    async fn record<S>(&self, session: &S, error: &ScrapeError)
    where
        S: ControllableSession + ?Sized,
    {
        match self.capture(session).await {
            Ok(artifact) => {
                warn!(
                    institution = %self.institution,
                    error = %error,
                    screenshot = %artifact.screenshot_path.display(),
                    "saved diagnostic capture"
                );
                if let Ok(mut guard) = self.last.lock() {
                    *guard = Some(artifact);
                }
            }
            Err(capture_error) => {
                warn!(
                    institution = %self.institution,
                    error = %error,
                    capture_error = %capture_error,
                    "failed to save diagnostic capture"
                );
            }
        }
    }

    async fn capture<S>(&self, session: &S) -> ScrapeResult<DiagnosticArtifact>
    where
        S: ControllableSession + ?Sized,
    {
        let artifact = DiagnosticArtifact::for_failure(&self.error_dir, &self.institution, Utc::now());
        tokio::fs::create_dir_all(&self.error_dir).await?;
        let screenshot = session.screenshot().await?;
        tokio::fs::write(&artifact.screenshot_path, screenshot).await?;
        let snapshot = session.snapshot().await?;
        tokio::fs::write(&artifact.snapshot_path, snapshot).await?;
        Ok(artifact)
    }
}

/// Walks `start` and its ancestors for a directory literally named `name`.
pub fn search_for_dir(start: &Path, name: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|ancestor| ancestor.join(name))
        .find(|candidate| candidate.is_dir())
}

/// Newest screenshot in `error_dir`, optionally restricted to one institution.
pub fn latest_screenshot(
    error_dir: &Path,
    institution: Option<&str>,
) -> std::io::Result<Option<PathBuf>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(error_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("png") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if let Some(institution) = institution {
            if !stem.ends_with(&format!("_{institution}")) {
                continue;
            }
        }
        names.push(path);
    }
    names.sort();
    Ok(names.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::ScriptedSession;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn artifact_paths_share_stem() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let artifact = DiagnosticArtifact::for_failure(Path::new("/tmp/errors"), "Chase", at);
        assert_eq!(
            artifact.screenshot_path,
            PathBuf::from("/tmp/errors/2024-05-01T12-30-00.000_Chase.png")
        );
        assert_eq!(
            artifact.snapshot_path,
            PathBuf::from("/tmp/errors/2024-05-01T12-30-00.000_Chase.html")
        );
    }

    #[tokio::test]
    async fn timeout_writes_both_artifacts_and_reraises() {
        let dir = tempdir().unwrap();
        let error_dir = dir.path().join("nested").join("errors");
        let capture = DiagnosticCapture::new(&error_dir, "Chase");
        let session = ScriptedSession::default();

        let result: ScrapeResult<()> = capture
            .run(&session, |_| async {
                Err(ScrapeError::Timeout("landing page".into()))
            })
            .await;

        assert!(matches!(result, Err(ScrapeError::Timeout(ref what)) if what == "landing page"));
        let artifact = capture.last_artifact().expect("artifact recorded");
        assert_eq!(std::fs::read(&artifact.screenshot_path).unwrap(), b"\x89PNG");
        assert_eq!(std::fs::read(&artifact.snapshot_path).unwrap(), b"MIME-Version: 1.0");
        assert_eq!(std::fs::read_dir(&error_dir).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn success_passes_through_without_capture() {
        let dir = tempdir().unwrap();
        let capture = DiagnosticCapture::new(dir.path().join("errors"), "Chase");
        let session = ScriptedSession::default();
        let value = capture.run(&session, |_| async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert!(capture.last_artifact().is_none());
        assert!(!dir.path().join("errors").exists());
    }

    #[tokio::test]
    async fn errors_outside_capture_set_are_not_captured() {
        let dir = tempdir().unwrap();
        let capture = DiagnosticCapture::new(dir.path().join("errors"), "Chase");
        let session = ScriptedSession::default();
        let result: ScrapeResult<()> = capture
            .run(&session, |_| async {
                Err(ScrapeError::PasswordResetRequired("Chase".into()))
            })
            .await;
        assert!(matches!(result, Err(ScrapeError::PasswordResetRequired(_))));
        assert!(!dir.path().join("errors").exists());
    }

    #[tokio::test]
    async fn failed_capture_still_returns_original_error() {
        let dir = tempdir().unwrap();
        let capture = DiagnosticCapture::new(dir.path().join("errors"), "Chase");
        let session = ScriptedSession::default().failing_screenshots();
        let result: ScrapeResult<()> = capture
            .run(&session, |_| async {
                Err(ScrapeError::MissingElement("#signin-button".into()))
            })
            .await;
        assert!(matches!(result, Err(ScrapeError::MissingElement(_))));
        assert!(capture.last_artifact().is_none());
    }

    #[tokio::test]
    async fn wrapped_steps_compose() {
        let dir = tempdir().unwrap();
        let capture = DiagnosticCapture::new(dir.path().join("errors"), "Vanguard");
        let session = ScriptedSession::default();
        let step = capture.wrap::<ScriptedSession, _, _, _>(|session| async move {
            session.navigate("https://example.com").await?;
            Ok::<_, ScrapeError>("done")
        });
        assert_eq!(step(&session).await.unwrap(), "done");
        assert_eq!(session.actions(), vec!["navigate https://example.com"]);
    }

    #[test]
    fn search_for_dir_walks_ancestors() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("errors")).unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(
            search_for_dir(&nested, "errors"),
            Some(dir.path().join("errors"))
        );
        assert_eq!(search_for_dir(&nested, "missing-dir-name"), None);
    }

    #[test]
    fn latest_screenshot_filters_by_institution() {
        let dir = tempdir().unwrap();
        for name in [
            "2024-01-01T00-00-00.000_Chase.png",
            "2024-02-01T00-00-00.000_Chase.png",
            "2024-02-01T00-00-00.000_Chase.html",
            "2024-03-01T00-00-00.000_Zillow.png",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let latest = latest_screenshot(dir.path(), Some("Chase")).unwrap().unwrap();
        assert!(latest.ends_with("2024-02-01T00-00-00.000_Chase.png"));
        let any = latest_screenshot(dir.path(), None).unwrap().unwrap();
        assert!(any.ends_with("2024-03-01T00-00-00.000_Zillow.png"));
    }
}
