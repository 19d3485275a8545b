use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::browser::{ControllableSession, DiagnosticCapture, ScrapeError, ScrapeResult};
use crate::config::LoginSection;
use crate::driver::{Credential, Institution};

use super::otp::{MfaChallengeConfig, OtpPoller};
use super::state::{SessionState, StateClassifier, StateRule};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub max_challenge_rounds: usize,
}

impl Default for LoginSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
            max_challenge_rounds: 2,
        }
    }
}

impl From<&LoginSection> for LoginSettings {
    fn from(section: &LoginSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            timeout: Duration::from_secs(section.timeout_seconds),
            max_challenge_rounds: section.max_challenge_rounds.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub rule: Option<String>,
}

/// Drives one session from `Anonymous` to `Authenticated`.
///
/// Every wait runs inside the [`DiagnosticCapture`], so a classification
/// timeout leaves a screenshot behind before the error propagates.
pub struct LoginStateMachine<'a> {
    settings: LoginSettings,
    capture: &'a DiagnosticCapture,
    state: SessionState,
    history: Vec<Transition>,
}

impl<'a> LoginStateMachine<'a> {
    pub fn new(settings: LoginSettings, capture: &'a DiagnosticCapture) -> Self {
        Self {
            settings,
            capture,
            state: SessionState::Anonymous,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn visited(&self, state: SessionState) -> bool {
        self.history.iter().any(|transition| transition.to == state)
    }

    pub async fn authenticate<I>(
        &mut self,
        institution: &I,
        session: &dyn ControllableSession,
        credential: &Credential,
        mfa: Option<&MfaChallengeConfig>,
    ) -> ScrapeResult<()>
    where
        I: Institution + ?Sized,
    {
        let result = self.drive(institution, session, credential, mfa).await;
        if let Err(error) = &result {
            if self.state != SessionState::PasswordResetRequired {
                warn!(institution = institution.name(), error = %error, "login failed");
                self.transition(SessionState::Error, None);
            }
        }
        result
    }

    async fn drive<I>(
        &mut self,
        institution: &I,
        session: &dyn ControllableSession,
        credential: &Credential,
        mfa: Option<&MfaChallengeConfig>,
    ) -> ScrapeResult<()>
    where
        I: Institution + ?Sized,
    {
        let capture = self.capture;
        capture
            .run(session, |session| {
                institution.submit_credentials(session, credential)
            })
            .await?;
        self.transition(SessionState::Authenticating, None);

        let settings = self.settings.clone();
        let settings = &settings;
        let classifier = institution.classifier();
        let mut rounds = 0usize;
        loop {
            let rule = capture
                .run(session, |session| {
                    await_resolution(classifier, settings, session)
                })
                .await?;
            self.transition(rule.state, Some(rule.name.clone()));

            match rule.state {
                SessionState::Authenticated => {
                    info!(institution = institution.name(), rounds, "authenticated");
                    return Ok(());
                }
                SessionState::PasswordResetRequired => {
                    return Err(ScrapeError::PasswordResetRequired(
                        institution.name().to_string(),
                    ));
                }
                SessionState::AwaitingChallenge => {
                    let mfa = mfa.ok_or_else(|| {
                        ScrapeError::MfaNotConfigured(institution.name().to_string())
                    })?;
                    if rounds >= settings.max_challenge_rounds {
                        return Err(ScrapeError::ChallengeExhausted(rounds));
                    }
                    rounds += 1;
                    info!(institution = institution.name(), round = rounds, "resolving challenge");
                    capture
                        .run(session, |session| institution.request_code(session, mfa))
                        .await?;
                    let code = OtpPoller::new(mfa.clone())?.acquire_code().await?;
                    capture
                        .run(session, |session| institution.submit_code(session, &code))
                        .await?;
                    self.transition(SessionState::Authenticating, None);
                    let departed = capture
                        .run(session, |session| {
                            await_departure(classifier, &rule.name, settings, session)
                        })
                        .await?;
                    if !departed {
                        warn!(
                            institution = institution.name(),
                            rule = %rule.name,
                            "challenge still shown after submitting code"
                        );
                    }
                }
                SessionState::Error => {
                    return Err(ScrapeError::Assertion(format!(
                        "login page matched error rule {}",
                        rule.name
                    )));
                }
                SessionState::Anonymous | SessionState::Authenticating => {
                    return Err(ScrapeError::Unexpected(format!(
                        "rule {} does not resolve the login",
                        rule.name
                    )));
                }
            }
        }
    }

    fn transition(&mut self, to: SessionState, rule: Option<String>) {
        debug!(from = %self.state, to = %to, rule = ?rule, "session transition");
        self.history.push(Transition {
            from: self.state,
            to,
            rule,
        });
        self.state = to;
    }
}

fn is_resolution(state: SessionState) -> bool {
    !matches!(
        state,
        SessionState::Anonymous | SessionState::Authenticating
    )
}

async fn await_resolution(
    classifier: &StateClassifier,
    settings: &LoginSettings,
    session: &dyn ControllableSession,
) -> ScrapeResult<StateRule> {
    let deadline = Instant::now() + settings.timeout;
    loop {
        let observed = session.current_location().await?;
        if let Some(rule) = classifier.classify(&observed) {
            if is_resolution(rule.state) {
                return Ok(rule.clone());
            }
        }
        if Instant::now() >= deadline {
            return Err(ScrapeError::Timeout(format!(
                "session state after login at {}",
                observed.url
            )));
        }
        sleep(settings.poll_interval).await;
    }
}

/// Polls until the page stops matching the challenge rule that was just
/// answered. `false` means it was still shown when the login timeout ran out.
async fn await_departure(
    classifier: &StateClassifier,
    challenge: &str,
    settings: &LoginSettings,
    session: &dyn ControllableSession,
) -> ScrapeResult<bool> {
    let deadline = Instant::now() + settings.timeout;
    loop {
        let observed = session.current_location().await?;
        let still_challenged = classifier
            .classify(&observed)
            .map(|rule| rule.name == challenge)
            .unwrap_or(false);
        if !still_challenged {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(settings.poll_interval).await;
    }
}
