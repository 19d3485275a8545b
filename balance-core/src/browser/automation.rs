use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureSnapshotFormat, CaptureSnapshotParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams,
};
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{ChromiumSection, ScraperConfig};

use super::error::{ScrapeError, ScrapeResult};
use super::session::{ControllableSession, ObservedState, SessionSource};

const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_ELEMENT_TIMEOUT: Duration = Duration::from_secs(10);

const VISIBLE_TEXT_SCRIPT: &str =
    "(() => document.body ? (document.body.innerText || '') : '')()";

#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: Arc<ChromiumSection>,
    element_timeout: Duration,
}

impl BrowserLauncher {
    pub fn new(config: ChromiumSection) -> Self {
        Self {
            config: Arc::new(config),
            element_timeout: DEFAULT_ELEMENT_TIMEOUT,
        }
    }

    /// Chromium settings plus the login section's element timeout.
    pub fn from_config(config: &ScraperConfig) -> Self {
        Self::new(config.chromium.clone())
            .with_element_timeout(Duration::from_secs(config.login.element_timeout_seconds))
    }

    /// How long `click` and `type_text` wait for their element to appear.
    pub fn with_element_timeout(mut self, timeout: Duration) -> Self {
        self.element_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ChromiumSection {
        &self.config
    }

    pub fn element_timeout(&self) -> Duration {
        self.element_timeout
    }

    pub async fn launch(&self) -> ScrapeResult<BrowserAutomation> {
        let user_agent = self.select_user_agent();
        let chromium_config = self.build_chromium_config(user_agent.as_deref())?;
        info!(
            headless = self.config.headless,
            width = self.config.window_size[0],
            height = self.config.window_size[1],
            "launching chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| ScrapeError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        Ok(BrowserAutomation {
            browser: Arc::new(browser),
            handler_task: Some(handler_task),
            element_timeout: self.element_timeout,
        })
    }

    fn select_user_agent(&self) -> Option<String> {
        let mut rng = rand::thread_rng();
        self.config.user_agents.choose(&mut rng).cloned()
    }

    fn build_chromium_config(&self, user_agent: Option<&str>) -> ScrapeResult<ChromiumConfig> {
        let [width, height] = self.config.window_size;
        let mut builder = ChromiumConfig::builder().window_size(width, height);

        if let Some(executable) = &self.config.executable_path {
            builder = builder.chrome_executable(executable);
        }
        if !self.config.headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = self.config.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }

        let mut args = vec![format!("--window-size={width},{height}")];
        if let Some(agent) = user_agent {
            args.push(format!("--user-agent={agent}"));
        }
        if self.config.disable_gpu {
            args.push("--disable-gpu".into());
        }
        args.push("--password-store=basic".into());
        args.extend(self.config.extra_args.iter().cloned());

        builder = builder.args(args);

        builder.build().map_err(ScrapeError::Configuration)
    }
}

#[derive(Debug)]
pub struct BrowserAutomation {
    browser: Arc<Browser>,
    handler_task: Option<JoinHandle<()>>,
    element_timeout: Duration,
}

impl BrowserAutomation {
    /// Opens a tab in a browser context of its own, so cookies and storage
    /// never leak between sessions.
    pub async fn new_session(&self) -> ScrapeResult<ChromiumSession> {
        let context = self
            .browser
            .create_browser_context(CreateBrowserContextParams::default())
            .await?;
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context.clone())
            .build()
            .map_err(ScrapeError::Configuration)?;
        let page = match self.browser.new_page(params).await {
            Ok(page) => page,
            Err(err) => {
                if let Err(dispose) = self.browser.dispose_browser_context(context).await {
                    warn!(error = %dispose, "failed to dispose browser context");
                }
                return Err(err.into());
            }
        };
        debug!(context = ?context, "opened browser session");
        Ok(ChromiumSession {
            browser: Arc::clone(&self.browser),
            context,
            page,
            element_timeout: self.element_timeout,
        })
    }

    pub async fn shutdown(mut self) -> ScrapeResult<()> {
        info!("shutting down chromium instance");
        match Arc::get_mut(&mut self.browser) {
            Some(browser) => {
                if let Err(err) = browser.close().await {
                    warn!(error = %err, "failed to close browser gracefully");
                }
            }
            None => {
                warn!("sessions still open at shutdown; stopping handler");
                if let Some(handle) = self.handler_task.take() {
                    handle.abort();
                }
            }
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl SessionSource for BrowserAutomation {
    async fn open(&self) -> ScrapeResult<Box<dyn ControllableSession>> {
        Ok(Box::new(self.new_session().await?))
    }
}

impl Drop for BrowserAutomation {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("BrowserAutomation dropped without explicit shutdown");
            }
        }
    }
}

/// [`ControllableSession`] over a single chromium tab in its own browser
/// context. `close` shuts the tab and disposes the context.
#[derive(Debug)]
pub struct ChromiumSession {
    browser: Arc<Browser>,
    context: BrowserContextId,
    page: Page,
    element_timeout: Duration,
}

impl ChromiumSession {
    pub fn page(&self) -> &Page {
        &self.page
    }

    async fn poll_element(&self, selector: &str, timeout: Duration) -> Option<Element> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(element) = self.page.find_element(selector).await {
                return Some(element);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(ELEMENT_POLL_INTERVAL).await;
        }
    }

    async fn element(&self, selector: &str) -> ScrapeResult<Element> {
        self.poll_element(selector, self.element_timeout)
            .await
            .ok_or_else(|| {
                ScrapeError::MissingElement(format!(
                    "{selector} after {}s",
                    self.element_timeout.as_secs()
                ))
            })
    }
}

#[async_trait(?Send)]
impl ControllableSession for ChromiumSession {
    async fn navigate(&self, url: &str) -> ScrapeResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(ScrapeError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn find_and_wait(&self, selector: &str, timeout: Duration) -> ScrapeResult<()> {
        match self.poll_element(selector, timeout).await {
            Some(_) => Ok(()),
            None => Err(ScrapeError::Timeout(format!("element {selector}"))),
        }
    }

    async fn click(&self, selector: &str) -> ScrapeResult<()> {
        self.element(selector).await?.click().await?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> ScrapeResult<()> {
        let element = self.element(selector).await?;
        element.click().await?;
        element.type_str(text).await?;
        Ok(())
    }

    async fn current_location(&self) -> ScrapeResult<ObservedState> {
        let url = self.page.url().await?.unwrap_or_default();
        let text: String = self
            .page
            .evaluate(VISIBLE_TEXT_SCRIPT)
            .await?
            .into_value()
            .map_err(|err| {
                ScrapeError::Unexpected(format!("failed to decode visible text: {err}"))
            })?;
        Ok(ObservedState { url, text })
    }

    async fn screenshot(&self) -> ScrapeResult<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        Ok(self.page.screenshot(params).await?)
    }

    async fn snapshot(&self) -> ScrapeResult<Vec<u8>> {
        let params = CaptureSnapshotParams::builder()
            .format(CaptureSnapshotFormat::Mhtml)
            .build();
        let response = self.page.execute(params).await?;
        Ok(response.result.data.into_bytes())
    }

    async fn close(&self) -> ScrapeResult<()> {
        if let Err(err) = self.page.clone().close().await {
            warn!(error = %err, "failed to close tab");
        }
        self.browser
            .dispose_browser_context(self.context.clone())
            .await?;
        debug!(context = ?self.context, "closed browser session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_scraper_config;
    use std::path::Path;

    #[test]
    fn launcher_takes_element_timeout_from_login_section() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/scraper.toml");
        let config = load_scraper_config(path).unwrap();
        let launcher = BrowserLauncher::from_config(&config);
        assert_eq!(launcher.element_timeout(), Duration::from_secs(30));
        assert!(launcher.config().headless);

        let default = BrowserLauncher::new(config.chromium.clone());
        assert_eq!(default.element_timeout(), DEFAULT_ELEMENT_TIMEOUT);
    }
}
