use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::auth::{LoginSettings, LoginStateMachine, MfaChallengeConfig, StateClassifier, Transition};
use crate::browser::{ControllableSession, DiagnosticCapture, ScrapeResult};
use crate::metrics::{to_metrics, ExtractedTable, Metric, MetricColumns};

#[derive(Clone)]
pub struct Credential {
    pub identifier: String,
    pub secret: String,
}

impl Credential {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Everything that differs between one bank and the next. The retrieval
/// shape itself (submit, classify, resolve challenge, extract) is shared.
#[async_trait(?Send)]
pub trait Institution {
    fn name(&self) -> &str;

    /// Ordered rules recognising the post-login pages.
    fn classifier(&self) -> &StateClassifier;

    /// Label columns plus the balance column.
    fn columns(&self) -> MetricColumns;

    /// Column holding the USD-equivalent value, for holdings quoted in
    /// another unit.
    fn value_column(&self) -> Option<&str> {
        None
    }

    async fn submit_credentials(
        &self,
        session: &dyn ControllableSession,
        credential: &Credential,
    ) -> ScrapeResult<()>;

    /// Picks the delivery channel before a code is sent. Many sites send
    /// without asking.
    async fn request_code(
        &self,
        _session: &dyn ControllableSession,
        _mfa: &MfaChallengeConfig,
    ) -> ScrapeResult<()> {
        Ok(())
    }

    async fn submit_code(&self, session: &dyn ControllableSession, code: &str)
        -> ScrapeResult<()>;

    async fn extract_tables(
        &self,
        session: &dyn ControllableSession,
    ) -> ScrapeResult<Vec<ExtractedTable>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalOutcome {
    pub balances: Vec<Metric>,
    pub values: Option<Vec<Metric>>,
    pub transitions: Vec<Transition>,
}

/// One login plus extraction against a single institution.
pub struct Retrieval<'a> {
    settings: LoginSettings,
    capture: &'a DiagnosticCapture,
}

impl<'a> Retrieval<'a> {
    pub fn new(settings: LoginSettings, capture: &'a DiagnosticCapture) -> Self {
        Self { settings, capture }
    }

    pub async fn run<I>(
        &self,
        institution: &I,
        session: &dyn ControllableSession,
        credential: &Credential,
        mfa: Option<&MfaChallengeConfig>,
    ) -> ScrapeResult<RetrievalOutcome>
    where
        I: Institution + ?Sized,
    {
        let name = institution.name();
        info!(institution = name, "starting retrieval");

        let mut machine = LoginStateMachine::new(self.settings.clone(), self.capture);
        machine
            .authenticate(institution, session, credential, mfa)
            .await?;

        let tables = self
            .capture
            .run(session, |session| institution.extract_tables(session))
            .await?;

        let columns = institution.columns();
        let balances = to_metrics(&tables, name, &columns)?;
        let values = match institution.value_column() {
            Some(column) => Some(to_metrics(&tables, name, &columns.with_value(column))?),
            None => None,
        };

        info!(
            institution = name,
            balances = balances.len(),
            values = values.as_ref().map(Vec::len).unwrap_or(0),
            "retrieval finished"
        );
        Ok(RetrievalOutcome {
            balances,
            values,
            transitions: machine.history().to_vec(),
        })
    }
}
