use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use sandboxed_rpa::AgentConfig;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::agent_loop::Page;
use crate::dom::{self, PageSnapshot};

/// Single-use headless Chrome for one job. Dropped with the sandbox.
pub struct BrowserSession {
    _browser: Browser,
    tab: Arc<Tab>,
    element_timeout: Duration,
}

impl BrowserSession {
    pub fn launch(config: &AgentConfig) -> Result<Self> {
        let options = LaunchOptions {
            headless: true,
            // Containers run Chrome as root without user namespaces.
            sandbox: false,
            window_size: Some((1280, 800)),
            path: config.chrome_path.as_ref().map(PathBuf::from),
            args: vec![
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-gpu"),
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
            ],
            // The browser sits idle while the model thinks.
            idle_browser_timeout: config.inference.timeout + Duration::from_secs(60),
            ..Default::default()
        };

        info!("starting headless Chrome");
        let browser =
            Browser::new(options).map_err(|e| anyhow!("browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        tab.set_default_timeout(config.navigation_timeout);
        info!("Chrome ready");

        Ok(Self {
            _browser: browser,
            tab,
            element_timeout: config.element_timeout,
        })
    }

    /// Run a blocking driver call off the async runtime.
    async fn with_tab<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .context("browser task panicked")?
    }
}

impl Page for BrowserSession {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.with_tab(move |tab| {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn content(&mut self) -> Result<String> {
        self.with_tab(|tab| tab.get_content()).await
    }

    async fn page_text(&mut self) -> Result<String> {
        self.with_tab(dom::capture_text).await
    }

    async fn observe(&mut self, generation: usize) -> Result<PageSnapshot> {
        self.with_tab(move |tab| dom::capture_snapshot(tab, generation))
            .await
    }

    async fn screenshot(&mut self) -> Result<String> {
        let jpeg = self
            .with_tab(|tab| {
                tab.capture_screenshot(CaptureScreenshotFormatOption::Jpeg, Some(75), None, true)
            })
            .await?;
        Ok(STANDARD.encode(jpeg))
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<()> {
        let (selector, value) = (selector.to_string(), value.to_string());
        let timeout = self.element_timeout;
        self.with_tab(move |tab| {
            let element = tab.wait_for_element_with_custom_timeout(&selector, timeout)?;
            element.click()?;
            element.call_js_fn("function() { this.value = ''; }", vec![], false)?;
            tab.type_str(&value)?;
            debug!(%selector, "filled");
            Ok(())
        })
        .await
    }

    async fn click(&mut self, selector: &str) -> Result<()> {
        let selector = selector.to_string();
        let timeout = self.element_timeout;
        self.with_tab(move |tab| {
            tab.wait_for_element_with_custom_timeout(&selector, timeout)?
                .click()?;
            Ok(())
        })
        .await
    }

    async fn press(&mut self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_tab(move |tab| {
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }
}
