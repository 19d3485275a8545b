use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::browser::{ScrapeError, ScrapeResult};

/// How candidate file names are ordered before the first two are examined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchOrder {
    /// Names sorted descending; timestamped names put the latest code first.
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Candidates examined per poll iteration.
const CANDIDATES_PER_POLL: usize = 2;

#[derive(Debug, Clone)]
pub struct MfaChallengeConfig {
    pub contact_option: Option<u32>,
    pub otp_source_directory: PathBuf,
    pub institute_tag: String,
    pub min_digits: usize,
    pub max_digits: usize,
    pub timeout: Duration,
    pub poll_delay: Duration,
    pub search_order: SearchOrder,
    pub extension: String,
}

impl MfaChallengeConfig {
    pub fn new(otp_source_directory: impl Into<PathBuf>, institute_tag: impl Into<String>) -> Self {
        Self {
            contact_option: None,
            otp_source_directory: otp_source_directory.into(),
            institute_tag: institute_tag.into(),
            min_digits: 6,
            max_digits: 6,
            timeout: Duration::from_secs(300),
            poll_delay: Duration::from_secs(5),
            search_order: SearchOrder::NewestFirst,
            extension: "txt".to_string(),
        }
    }
}

/// Resolves a one-time code relayed into a shared directory by an external
/// process. Files are never consumed.
#[derive(Debug, Clone)]
pub struct OtpPoller {
    config: MfaChallengeConfig,
    tag_pattern: Regex,
    digit_runs: Regex,
}

impl OtpPoller {
    pub fn new(config: MfaChallengeConfig) -> ScrapeResult<Self> {
        if config.min_digits == 0 || config.min_digits > config.max_digits {
            return Err(ScrapeError::Configuration(format!(
                "otp digit range [{}, {}] is empty",
                config.min_digits, config.max_digits
            )));
        }
        let tag_pattern = Regex::new(&format!(
            r"(?:^|\W){}(?:\s|:)",
            regex::escape(&config.institute_tag)
        ))?;
        let digit_runs = Regex::new(r"[0-9]+")?;
        Ok(Self {
            config,
            tag_pattern,
            digit_runs,
        })
    }

    pub fn config(&self) -> &MfaChallengeConfig {
        &self.config
    }

    pub async fn acquire_code(&self) -> ScrapeResult<String> {
        let dir = self.config.otp_source_directory.as_path();
        let deadline = Instant::now() + self.config.timeout;
        info!(
            tag = %self.config.institute_tag,
            dir = %dir.display(),
            "waiting for one-time code"
        );

        while !is_dir(dir).await {
            if Instant::now() >= deadline {
                return Err(ScrapeError::PathNotFound(dir.to_path_buf()));
            }
            sleep(self.config.poll_delay).await;
        }

        while !has_entries(dir).await {
            if Instant::now() >= deadline {
                return Err(ScrapeError::NoFilesFound(dir.to_path_buf()));
            }
            sleep(self.config.poll_delay).await;
        }

        loop {
            if let Some(code) = self.scan(dir).await? {
                info!(tag = %self.config.institute_tag, "one-time code found");
                return Ok(code);
            }
            if Instant::now() >= deadline {
                return Err(ScrapeError::CodeNotFound {
                    tag: self.config.institute_tag.clone(),
                    dir: dir.to_path_buf(),
                });
            }
            sleep(self.config.poll_delay).await;
        }
    }

    async fn scan(&self, dir: &Path) -> ScrapeResult<Option<String>> {
        for path in self.candidates(dir).await? {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    if let Some(code) = self.match_code(&content) {
                        debug!(file = %path.display(), "matched one-time code file");
                        return Ok(Some(code));
                    }
                }
                Err(err) => {
                    debug!(file = %path.display(), error = %err, "skipping unreadable code file");
                }
            }
        }
        Ok(None)
    }

    async fn candidates(&self, dir: &Path) -> ScrapeResult<Vec<PathBuf>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name());
        }
        names.sort();
        if self.config.search_order == SearchOrder::NewestFirst {
            names.reverse();
        }
        Ok(names
            .into_iter()
            .take(CANDIDATES_PER_POLL)
            .map(|name| dir.join(name))
            .filter(|path| self.has_expected_extension(path))
            .collect())
    }

    fn has_expected_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(&self.config.extension))
            .unwrap_or(false)
    }

    /// First digit run within the configured length range, provided the text
    /// carries the institute tag.
    pub fn match_code(&self, content: &str) -> Option<String> {
        let text: String = content.chars().filter(|c| *c != '\n' && *c != '\r').collect();
        if !self.tag_pattern.is_match(&text) {
            return None;
        }
        self.digit_runs
            .find_iter(&text)
            .map(|run| run.as_str())
            .find(|run| (self.config.min_digits..=self.config.max_digits).contains(&run.len()))
            .map(str::to_string)
    }
}

pub async fn acquire_code(config: &MfaChallengeConfig) -> ScrapeResult<String> {
    OtpPoller::new(config.clone())?.acquire_code().await
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

async fn has_entries(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}
