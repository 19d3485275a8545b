use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::auth::{LoginSettings, MfaChallengeConfig};
use crate::browser::{DiagnosticCapture, ErrorKind, ScrapeError, SessionSource};
use crate::config::{DiagnosticsSection, InstitutionEntry, ScraperConfig};
use crate::driver::{Credential, Institution, Retrieval, RetrievalOutcome};
use crate::ledger::{JailEntry, RunLedger, RunRecord};
use crate::metrics::Metric;

pub struct BatchJob {
    pub institution: Box<dyn Institution>,
    pub credential: Credential,
    pub mfa: Option<MfaChallengeConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded { outcome: RetrievalOutcome },
    Failed {
        kind: ErrorKind,
        message: String,
        jailed: bool,
    },
    /// Jailed by an earlier run.
    Skipped,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub institution: String,
    #[serde(flatten)]
    pub status: JobStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub jobs: Vec<JobReport>,
}

impl BatchReport {
    pub fn balances(&self) -> Vec<Metric> {
        self.succeeded()
            .flat_map(|outcome| outcome.balances.iter().cloned())
            .collect()
    }

    pub fn values(&self) -> Vec<Metric> {
        self.succeeded()
            .flat_map(|outcome| outcome.values.iter().flatten().cloned())
            .collect()
    }

    pub fn failures(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| matches!(job.status, JobStatus::Failed { .. }))
            .count()
    }

    fn succeeded(&self) -> impl Iterator<Item = &RetrievalOutcome> {
        self.jobs.iter().filter_map(|job| match &job.status {
            JobStatus::Succeeded { outcome } => Some(outcome),
            _ => None,
        })
    }
}

/// Runs retrievals one after another. A failing institution is recorded and,
/// when the failure left a diagnostic capture, jailed; the batch carries on.
/// Ledger trouble is logged and never stops the batch.
pub struct BatchRunner<'a> {
    ledger: &'a RunLedger,
    settings: LoginSettings,
    diagnostics: DiagnosticsSection,
    disabled: Vec<String>,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        ledger: &'a RunLedger,
        settings: LoginSettings,
        diagnostics: DiagnosticsSection,
    ) -> Self {
        Self {
            ledger,
            settings,
            diagnostics,
            disabled: Vec::new(),
        }
    }

    pub fn from_config(ledger: &'a RunLedger, config: &ScraperConfig) -> Self {
        Self::new(
            ledger,
            LoginSettings::from(&config.login),
            config.diagnostics.clone(),
        )
        .with_institutions(&config.institutions)
    }

    /// Entries with `enabled = false` are skipped without opening a session.
    pub fn with_institutions(mut self, entries: &[InstitutionEntry]) -> Self {
        self.disabled = entries
            .iter()
            .filter(|entry| !entry.enabled)
            .map(|entry| entry.name.to_lowercase())
            .collect();
        self
    }

    fn is_disabled(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.disabled.iter().any(|disabled| *disabled == name)
    }

    fn is_jailed(&self, name: &str) -> bool {
        self.ledger.is_jailed(name).unwrap_or_else(|err| {
            warn!(institution = name, error = %err, "could not read jail; running anyway");
            false
        })
    }

    pub async fn run(&self, jobs: &[BatchJob], sessions: &dyn SessionSource) -> BatchReport {
        let mut report = BatchReport::default();
        for job in jobs {
            let name = job.institution.name().to_string();
            let status = if self.is_disabled(&name) {
                info!(institution = %name, "skipping disabled institution");
                JobStatus::Disabled
            } else if self.is_jailed(&name) {
                info!(institution = %name, "skipping jailed institution");
                JobStatus::Skipped
            } else {
                self.run_job(job, sessions).await
            };
            report.jobs.push(JobReport {
                institution: name,
                status,
            });
        }
        info!(
            jobs = report.jobs.len(),
            failures = report.failures(),
            "batch finished"
        );
        report
    }

    async fn run_job(&self, job: &BatchJob, sessions: &dyn SessionSource) -> JobStatus {
        let name = job.institution.name();
        let capture = DiagnosticCapture::from_config(&self.diagnostics, name);
        let started = Instant::now();
        let result = match sessions.open().await {
            Ok(session) => {
                let result = Retrieval::new(self.settings.clone(), &capture)
                    .run(
                        job.institution.as_ref(),
                        session.as_ref(),
                        &job.credential,
                        job.mfa.as_ref(),
                    )
                    .await;
                if let Err(err) = session.close().await {
                    warn!(institution = name, error = %err, "failed to close session");
                }
                result
            }
            Err(err) => Err(err),
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(outcome) => {
                self.record(&RunRecord::success(name, duration_ms));
                JobStatus::Succeeded { outcome }
            }
            Err(err) => {
                error!(institution = name, error = %err, "retrieval failed");
                let screenshot = capture
                    .last_artifact()
                    .map(|artifact| artifact.screenshot_path);
                self.record(&RunRecord::failure(
                    name,
                    duration_ms,
                    &err,
                    screenshot.clone(),
                ));
                let jailed = capture.captures(&err)
                    && match self.ledger.jail(&jail_entry(name, &err, screenshot)) {
                        Ok(()) => true,
                        Err(ledger_err) => {
                            warn!(institution = name, error = %ledger_err, "could not jail institution");
                            false
                        }
                    };
                JobStatus::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                    jailed,
                }
            }
        }
    }

    fn record(&self, run: &RunRecord) {
        if let Err(err) = self.ledger.record_run(run) {
            warn!(institution = %run.institution, error = %err, "could not record run");
        }
    }
}

fn jail_entry(name: &str, err: &ScrapeError, screenshot: Option<std::path::PathBuf>) -> JailEntry {
    JailEntry {
        institution: name.to_string(),
        jailed_at: Utc::now(),
        reason: err.kind(),
        message: err.to_string(),
        screenshot,
    }
}
