mod common;

use std::time::Duration;

use balance_core::{
    render_exposition, Credential, DiagnosticCapture, ErrorKind, LoginSettings,
    MfaChallengeConfig, ObservedState, Retrieval, ScrapeError, SessionState, TOTAL_ASSETS,
};
use balance_core::browser::testing::ScriptedSession;
use common::MockBank;
use tempfile::TempDir;

fn settings() -> LoginSettings {
    LoginSettings {
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_millis(300),
        max_challenge_rounds: 2,
    }
}

fn credential() -> Credential {
    Credential::new("alice@example.com", "correct horse")
}

#[tokio::test]
async fn direct_login_produces_balances_and_values() {
    let dir = TempDir::new().unwrap();
    let capture = DiagnosticCapture::new(dir.path().join("errors"), "MyBank");
    let session = ScriptedSession::with_states(vec![
        ObservedState::new("https://bank.test/login", "Signing you in"),
        ObservedState::new("https://bank.test/dashboard", "Accounts overview"),
    ]);
    let mut bank = MockBank::new("MyBank", "/dashboard");
    bank.value_column = Some("usd".into());

    let outcome = Retrieval::new(settings(), &capture)
        .run(&bank, &session, &credential(), None)
        .await
        .unwrap();

    assert_eq!(outcome.balances.len(), 2);
    assert_eq!(
        outcome.balances[0].labels.as_array(),
        ["MyBank", "1", "deposit", "USD"]
    );
    assert_eq!(outcome.balances[1].value, 4.0);
    let values = outcome.values.expect("value column declared");
    assert_eq!(values[1].value, 980.4);
    assert!(!outcome
        .transitions
        .iter()
        .any(|transition| transition.to == SessionState::AwaitingChallenge));
    assert_eq!(
        outcome.transitions.last().map(|transition| transition.to),
        Some(SessionState::Authenticated)
    );

    let text = render_exposition(TOTAL_ASSETS, &outcome.balances);
    assert!(text.starts_with(
        "total_assets{institution=\"MyBank\", account=\"1\", account_type=\"deposit\", symbol=\"USD\"} 100\n"
    ));
    assert!(session
        .actions()
        .contains(&"type #password correct horse".to_string()));
}

#[tokio::test]
async fn challenge_is_answered_from_the_otp_directory() {
    let dir = TempDir::new().unwrap();
    let otp_dir = dir.path().join("otp");
    std::fs::create_dir_all(&otp_dir).unwrap();
    std::fs::write(otp_dir.join("bank_2024.txt"), "MyBank: your code is 481932").unwrap();
    let mfa = MfaChallengeConfig {
        timeout: Duration::from_secs(2),
        poll_delay: Duration::from_millis(20),
        ..MfaChallengeConfig::new(&otp_dir, "MyBank")
    };
    let capture = DiagnosticCapture::new(dir.path().join("errors"), "MyBank");
    let session = ScriptedSession::with_states(vec![
        ObservedState::new("https://bank.test/auth", "Enter the code we sent to your phone"),
        ObservedState::new("https://bank.test/dashboard", "Accounts overview"),
    ]);
    let bank = MockBank::new("MyBank", "/dashboard");

    let outcome = Retrieval::new(settings(), &capture)
        .run(&bank, &session, &credential(), Some(&mfa))
        .await
        .unwrap();

    assert!(outcome.values.is_none());
    assert!(outcome
        .transitions
        .iter()
        .any(|transition| transition.to == SessionState::AwaitingChallenge));
    let actions = session.actions();
    assert!(actions.contains(&"type #otp 481932".to_string()));
    assert!(actions.contains(&"click #verify".to_string()));
}

#[tokio::test]
async fn password_reset_is_terminal_and_uncaptured() {
    let dir = TempDir::new().unwrap();
    let capture = DiagnosticCapture::new(dir.path().join("errors"), "MyBank");
    let session = ScriptedSession::with_states(vec![ObservedState::new(
        "https://bank.test/auth",
        "You must reset your password",
    )]);
    let bank = MockBank::new("MyBank", "/dashboard");

    let err = Retrieval::new(settings(), &capture)
        .run(&bank, &session, &credential(), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PasswordResetRequired);
    assert!(err.is_terminal());
    assert!(capture.last_artifact().is_none());
    assert!(!session.actions().iter().any(|action| action.contains("#otp")));
}

#[tokio::test]
async fn tables_without_required_columns_fail_the_retrieval() {
    let dir = TempDir::new().unwrap();
    let capture = DiagnosticCapture::new(dir.path().join("errors"), "MyBank");
    let session = ScriptedSession::with_states(vec![ObservedState::new(
        "https://bank.test/dashboard",
        "Accounts overview",
    )]);
    let mut bank = MockBank::new("MyBank", "/dashboard");
    bank.tables = vec![balance_core::ExtractedTable::new(["account", "balance"]).row(["1", "5"])];

    let err = Retrieval::new(settings(), &capture)
        .run(&bank, &session, &credential(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ScrapeError::EmptyMetricSet(ref name) if name == "MyBank"));
}

#[tokio::test]
async fn login_timeout_leaves_diagnostics_behind() {
    let dir = TempDir::new().unwrap();
    let error_dir = dir.path().join("errors");
    let capture = DiagnosticCapture::new(&error_dir, "MyBank");
    let session = ScriptedSession::with_states(vec![ObservedState::new(
        "https://bank.test/login",
        "Something went wrong",
    )]);
    let bank = MockBank::new("MyBank", "/dashboard");

    let err = Retrieval::new(settings(), &capture)
        .run(&bank, &session, &credential(), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    let artifact = capture.last_artifact().expect("capture recorded");
    assert!(artifact.screenshot_path.starts_with(&error_dir));
    assert!(artifact
        .screenshot_path
        .to_string_lossy()
        .ends_with("_MyBank.png"));
    assert_eq!(std::fs::read(&artifact.snapshot_path).unwrap(), b"MIME-Version: 1.0");
}
