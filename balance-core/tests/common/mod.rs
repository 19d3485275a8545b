#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use balance_core::browser::testing::ScriptedSession;
use balance_core::{
    Cell, ControllableSession, Credential, ExtractedTable, Institution, Matcher, MetricColumns,
    ObservedState, ScrapeResult, SessionSource, SessionState, StateClassifier,
};

/// Every session opens straight onto the account dashboard.
#[derive(Debug, Default)]
pub struct DashboardSessions {
    closes: Arc<AtomicUsize>,
}

impl DashboardSessions {
    pub fn closed(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait(?Send)]
impl SessionSource for DashboardSessions {
    async fn open(&self) -> ScrapeResult<Box<dyn ControllableSession>> {
        let session = ScriptedSession::with_states(vec![ObservedState::new(
            "https://bank.test/dashboard",
            "Accounts overview",
        )])
        .counting_closes(self.closes.clone());
        Ok(Box::new(session))
    }
}

/// Test institution whose landing page is recognised by `landing_marker`.
pub struct MockBank {
    pub name: String,
    pub classifier: StateClassifier,
    pub tables: Vec<ExtractedTable>,
    pub value_column: Option<String>,
}

impl MockBank {
    pub fn new(name: &str, landing_marker: &str) -> Self {
        Self {
            name: name.to_string(),
            classifier: StateClassifier::new()
                .rule(
                    "landing",
                    Matcher::url_contains(landing_marker),
                    SessionState::Authenticated,
                )
                .rule(
                    "verify device",
                    Matcher::all(vec![
                        Matcher::url_contains("/auth"),
                        Matcher::text_contains("Enter the code we sent"),
                    ]),
                    SessionState::AwaitingChallenge,
                )
                .rule(
                    "password reset",
                    Matcher::text_contains("reset your password"),
                    SessionState::PasswordResetRequired,
                ),
            tables: vec![accounts_table()],
            value_column: None,
        }
    }
}

pub fn accounts_table() -> ExtractedTable {
    ExtractedTable::new(["account", "account_type", "symbol", "balance", "usd"])
        .named("deposit")
        .row([
            Cell::from(1.0),
            Cell::from("deposit"),
            Cell::from("USD"),
            Cell::from("$100.00"),
            Cell::from("$100.00"),
        ])
        .row([
            Cell::from(2.0),
            Cell::from("brokerage"),
            Cell::from("VTI"),
            Cell::from("4"),
            Cell::from("$980.40"),
        ])
}

#[async_trait(?Send)]
impl Institution for MockBank {
    fn name(&self) -> &str {
        &self.name
    }

    fn classifier(&self) -> &StateClassifier {
        &self.classifier
    }

    fn columns(&self) -> MetricColumns {
        MetricColumns::new("account", "symbol", "balance", "account_type")
    }

    fn value_column(&self) -> Option<&str> {
        self.value_column.as_deref()
    }

    async fn submit_credentials(
        &self,
        session: &dyn ControllableSession,
        credential: &Credential,
    ) -> ScrapeResult<()> {
        session.navigate("https://bank.test/login").await?;
        session
            .find_and_wait("#username", Duration::from_secs(1))
            .await?;
        session.type_text("#username", &credential.identifier).await?;
        session.type_text("#password", &credential.secret).await?;
        session.click("#signin").await
    }

    async fn submit_code(&self, session: &dyn ControllableSession, code: &str) -> ScrapeResult<()> {
        session.type_text("#otp", code).await?;
        session.click("#verify").await
    }

    async fn extract_tables(
        &self,
        _session: &dyn ControllableSession,
    ) -> ScrapeResult<Vec<ExtractedTable>> {
        Ok(self.tables.clone())
    }
}
