use std::fmt;

use serde::{Deserialize, Serialize};

use crate::browser::ObservedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Anonymous,
    Authenticating,
    AwaitingChallenge,
    Authenticated,
    PasswordResetRequired,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Anonymous => "anonymous",
            SessionState::Authenticating => "authenticating",
            SessionState::AwaitingChallenge => "awaiting_challenge",
            SessionState::Authenticated => "authenticated",
            SessionState::PasswordResetRequired => "password_reset_required",
            SessionState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Predicate over an [`ObservedState`], expressed as data so integrations can
/// declare it in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Matcher {
    UrlContains { value: String },
    UrlPrefix { value: String },
    TextContains { value: String },
    All { of: Vec<Matcher> },
    Any { of: Vec<Matcher> },
    Not { matcher: Box<Matcher> },
}

impl Matcher {
    pub fn url_contains(value: impl Into<String>) -> Self {
        Matcher::UrlContains {
            value: value.into(),
        }
    }

    pub fn url_prefix(value: impl Into<String>) -> Self {
        Matcher::UrlPrefix {
            value: value.into(),
        }
    }

    pub fn text_contains(value: impl Into<String>) -> Self {
        Matcher::TextContains {
            value: value.into(),
        }
    }

    pub fn all(of: Vec<Matcher>) -> Self {
        Matcher::All { of }
    }

    pub fn any(of: Vec<Matcher>) -> Self {
        Matcher::Any { of }
    }

    pub fn not(matcher: Matcher) -> Self {
        Matcher::Not {
            matcher: Box::new(matcher),
        }
    }

    pub fn matches(&self, observed: &ObservedState) -> bool {
        match self {
            Matcher::UrlContains { value } => observed.url.contains(value.as_str()),
            Matcher::UrlPrefix { value } => observed.url.starts_with(value.as_str()),
            Matcher::TextContains { value } => observed.text.contains(value.as_str()),
            Matcher::All { of } => of.iter().all(|matcher| matcher.matches(observed)),
            Matcher::Any { of } => of.iter().any(|matcher| matcher.matches(observed)),
            Matcher::Not { matcher } => !matcher.matches(observed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRule {
    pub name: String,
    pub when: Matcher,
    pub state: SessionState,
}

/// Ordered `(predicate, state)` rules; the first match wins, so the landing
/// page rule belongs first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateClassifier {
    #[serde(default)]
    rules: Vec<StateRule>,
}

impl StateClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, name: impl Into<String>, when: Matcher, state: SessionState) -> Self {
        self.rules.push(StateRule {
            name: name.into(),
            when,
            state,
        });
        self
    }

    pub fn rules(&self) -> &[StateRule] {
        &self.rules
    }

    pub fn classify(&self, observed: &ObservedState) -> Option<&StateRule> {
        self.rules.iter().find(|rule| rule.when.matches(observed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chase() -> StateClassifier {
        StateClassifier::new()
            .rule(
                "landing",
                Matcher::url_contains("dashboard#/dashboard/overview"),
                SessionState::Authenticated,
            )
            .rule(
                "new device",
                Matcher::all(vec![
                    Matcher::url_contains("chase.com/web/auth/"),
                    Matcher::text_contains("We don't recognize this device"),
                ]),
                SessionState::AwaitingChallenge,
            )
            .rule(
                "password reset",
                Matcher::all(vec![
                    Matcher::url_contains("chase.com/web/auth/"),
                    Matcher::text_contains("reset your password"),
                ]),
                SessionState::PasswordResetRequired,
            )
    }

    #[test]
    fn first_matching_rule_wins() {
        let observed = ObservedState::new(
            "https://secure.chase.com/web/auth/dashboard#/dashboard/overview",
            "We don't recognize this device",
        );
        let classifier = chase();
        let rule = classifier.classify(&observed).unwrap();
        assert_eq!(rule.state, SessionState::Authenticated);
        assert_eq!(rule.name, "landing");
    }

    #[test]
    fn unmatched_state_yields_none() {
        let observed = ObservedState::new("https://secure.chase.com/web/auth/", "Loading…");
        assert!(chase().classify(&observed).is_none());
    }

    #[test]
    fn challenge_requires_both_url_and_text() {
        let classifier = chase();
        let text_only = ObservedState::new("https://example.com", "We don't recognize this device");
        assert!(classifier.classify(&text_only).is_none());
        let both = ObservedState::new(
            "https://secure.chase.com/web/auth/",
            "We don't recognize this device",
        );
        assert_eq!(
            classifier.classify(&both).unwrap().state,
            SessionState::AwaitingChallenge
        );
    }

    #[test]
    fn rules_load_from_toml() {
        let source = r#"
            [[rules]]
            name = "landing"
            state = "authenticated"
            when = { kind = "url_prefix", value = "https://workplaceservices.fidelity.com/" }

            [[rules]]
            name = "extra security"
            state = "awaiting_challenge"
            when = { kind = "all", of = [
                { kind = "url_contains", value = "login.fidelity.com" },
                { kind = "not", matcher = { kind = "text_contains", value = "Signed out" } },
                { kind = "text_contains", value = "Extra security step required" },
            ] }
        "#;
        let classifier: StateClassifier = toml::from_str(source).unwrap();
        assert_eq!(classifier.rules().len(), 2);
        let observed = ObservedState::new(
            "https://login.fidelity.com/ftgw",
            "Extra security step required",
        );
        assert_eq!(
            classifier.classify(&observed).unwrap().name,
            "extra security"
        );
    }
}
