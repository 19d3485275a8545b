mod machine;
mod otp;
mod state;

pub use machine::{LoginSettings, LoginStateMachine, Transition};
pub use otp::{acquire_code, MfaChallengeConfig, OtpPoller, SearchOrder};
pub use state::{Matcher, SessionState, StateClassifier, StateRule};
