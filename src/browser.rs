use anyhow::Result;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub use chromiumoxide::element::Element;

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None }
    }
}

/// How often element waits re-query the DOM.
const ELEMENT_POLL: Duration = Duration::from_millis(250);

pub struct Browser {
    page: Page,
    browser: OxideBrowser,
    handler: JoinHandle<()>,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Use a unique user data dir per run to avoid ProcessSingleton profile lock conflicts
        // observed when Chromium is restarted rapidly or multiple instances are spawned.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("webpilot-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder.user_data_dir(profile_dir.clone());
        builder = builder
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut events) = OxideBrowser::launch(bcfg).await?;
        let handler = tokio::spawn(async move {
            while let Some(_ev) = events.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        // Ensure a non-zero viewport to avoid screenshot 0-width errors
        let _ = page
            .execute(
                SetDeviceMetricsOverrideParams::builder()
                    .width(1280)
                    .height(800)
                    .device_scale_factor(1.0)
                    .mobile(false)
                    .build()
                    .unwrap(),
            )
            .await;
        Ok(Self { page, browser, handler })
    }

    /// Close the browser and reap the child process.
    pub async fn close(mut self) -> Result<()> {
        self.browser.close().await?;
        self.browser.wait().await?;
        self.handler.abort();
        Ok(())
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn screenshot_png(&self) -> Result<Vec<u8>> {
        let bytes = self
            .page
            .screenshot(
                ScreenshotParamsBuilder::default()
                    .full_page(true)
                    .omit_background(true)
                    .build(),
            )
            .await?;
        Ok(bytes)
    }

    /// Poll for an element matching `selector` until `timeout` elapses.
    /// `Ok(None)` means the deadline passed without a match.
    pub async fn wait_for_present(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Option<Element>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(el) = self.page.find_element(selector).await {
                return Ok(Some(el));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(ELEMENT_POLL).await;
        }
    }

    /// Like [`wait_for_present`](Self::wait_for_present), but the element must
    /// also scroll into view and expose a clickable point.
    pub async fn wait_for_clickable(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Option<Element>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(el) = self.page.find_element(selector).await {
                let interactable =
                    el.scroll_into_view().await.is_ok() && el.clickable_point().await.is_ok();
                if interactable {
                    return Ok(Some(el));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(ELEMENT_POLL).await;
        }
    }

    pub async fn click(&self, el: &Element) -> Result<()> {
        el.click().await?;
        Ok(())
    }

    pub async fn type_into(&self, el: &Element, text: &str) -> Result<()> {
        el.focus().await?;
        el.type_str(text).await?;
        Ok(())
    }

    pub async fn press_enter(&self, el: &Element) -> Result<()> {
        el.press_key("Enter").await?;
        Ok(())
    }
}
