use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::auth::{MfaChallengeConfig, SearchOrder};
use crate::browser::ErrorKind;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScraperConfig {
    pub chromium: ChromiumSection,
    pub login: LoginSection,
    pub mfa: MfaSection,
    pub retry: RetrySection,
    pub diagnostics: DiagnosticsSection,
    pub observability: ObservabilitySection,
    #[serde(default)]
    pub institutions: Vec<InstitutionEntry>,
}

impl ScraperConfig {
    pub fn institution(&self, name: &str) -> Option<&InstitutionEntry> {
        self.institutions
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
    }

    /// Builds the immutable challenge configuration for one retrieval.
    pub fn mfa_for(&self, institution: &str) -> MfaChallengeConfig {
        let entry = self.institution(institution);
        let tag = match entry {
            Some(entry) => entry.tag.clone().unwrap_or_else(|| entry.name.clone()),
            None => institution.to_string(),
        };
        MfaChallengeConfig {
            contact_option: entry.and_then(|entry| entry.contact_option),
            otp_source_directory: PathBuf::from(&self.mfa.otp_source_directory),
            institute_tag: tag,
            min_digits: self.mfa.min_digits,
            max_digits: self.mfa.max_digits,
            timeout: Duration::from_millis(self.mfa.timeout_ms),
            poll_delay: Duration::from_millis(self.mfa.poll_delay_ms),
            search_order: self.mfa.search_order,
            extension: self.mfa.extension.clone(),
        }
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |reason: String| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        };
        if self.mfa.min_digits == 0 || self.mfa.min_digits > self.mfa.max_digits {
            return Err(invalid(format!(
                "mfa digit range [{}, {}] is empty",
                self.mfa.min_digits, self.mfa.max_digits
            )));
        }
        if self.retry.retries == 0 {
            return Err(invalid("retry.retries must be at least 1".into()));
        }
        if self.login.max_challenge_rounds == 0 {
            return Err(invalid("login.max_challenge_rounds must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    #[serde(default = "default_window_size")]
    pub window_size: [u32; 2],
    pub request_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub user_agents: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_window_size() -> [u32; 2] {
    [1920, 1080]
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginSection {
    pub poll_interval_ms: u64,
    pub timeout_seconds: u64,
    pub element_timeout_seconds: u64,
    pub max_challenge_rounds: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MfaSection {
    pub otp_source_directory: String,
    pub min_digits: usize,
    pub max_digits: usize,
    pub timeout_ms: u64,
    pub poll_delay_ms: u64,
    #[serde(default)]
    pub search_order: SearchOrder,
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_extension() -> String {
    "txt".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub retries: usize,
    pub delay_seconds: u64,
    pub retry_on: Vec<ErrorKind>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticsSection {
    pub error_dir: String,
    pub capture_on: Vec<ErrorKind>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    pub failure_log: String,
    pub ledger_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstitutionEntry {
    pub name: String,
    pub tag: Option<String>,
    pub contact_option: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub fn load_scraper_config<P: AsRef<Path>>(path: P) -> Result<ScraperConfig> {
    let path = path.as_ref();
    let config: ScraperConfig = load_toml(path)?;
    config.validate(path)?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
