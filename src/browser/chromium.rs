//! Chromium implementation of the page driver
//!
//! Launches one Chrome instance per tab over CDP. Proxies with credentials
//! are routed through a per-tab local forwarder because Chrome accepts no
//! inline proxy auth.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BrowserError, PageDriver};
use crate::proxy::{LocalProxyForwarder, ProxyConfig};

/// Poll interval while waiting for a selector to appear
const SELECTOR_POLL: Duration = Duration::from_millis(200);

/// Find a Chrome/Chromium executable on the system
fn find_chrome() -> Option<std::path::PathBuf> {
    let candidates: Vec<std::path::PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            std::path::PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            std::path::PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(std::path::PathBuf::from(format!(
                r"{}\Google\Chrome\Application\chrome.exe",
                local
            )));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![std::path::PathBuf::from(
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        )]
    } else {
        vec![
            std::path::PathBuf::from("/usr/bin/google-chrome"),
            std::path::PathBuf::from("/usr/bin/google-chrome-stable"),
            std::path::PathBuf::from("/usr/bin/chromium"),
            std::path::PathBuf::from("/usr/bin/chromium-browser"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

/// Keystroke delay bounds in milliseconds, ±50% around the configured base.
/// Saturating so an absurd configured delay cannot overflow.
fn key_delay_bounds(key_delay: Duration) -> (u64, u64) {
    let base_ms = u64::try_from(key_delay.as_millis())
        .unwrap_or(u64::MAX)
        .max(1);
    (base_ms / 2, base_ms.saturating_mul(3) / 2)
}

/// A real browser tab driven over CDP.
pub struct ChromiumDriver {
    /// Display label for logs, e.g. "Tab 2"
    label: String,
    /// Kept so the process can be deliberately leaked on `detach()`
    browser: Mutex<Option<Browser>>,
    page: Page,
    /// Local auth forwarder, if the proxy needed one; leaked on `detach()`
    /// so the running Chrome keeps its proxy
    forwarder: Mutex<Option<LocalProxyForwarder>>,
}

impl ChromiumDriver {
    /// Launch a fresh Chrome instance for the given tab.
    pub async fn launch(
        tab_index: usize,
        headless: bool,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Self, BrowserError> {
        let label = format!("Tab {}", tab_index);
        info!("[{}] Launching browser (headless: {})", label, headless);

        let chrome_path = find_chrome().ok_or_else(|| {
            BrowserError::LaunchFailed(
                "Chrome/Chromium not found. Install Chrome and try again.".to_string(),
            )
        })?;

        // Unique profile per tab to avoid SingletonLock conflicts
        let user_data_dir = std::env::temp_dir()
            .join("soundon-keeper")
            .join("browser_data")
            .join(format!("tab-{}", tab_index));
        let _ = std::fs::create_dir_all(&user_data_dir);

        let mut builder = BrowserConfig::builder()
            .chrome_executable(&chrome_path)
            .user_data_dir(&user_data_dir)
            .window_size(1280, 720)
            .viewport(Viewport {
                width: 1280,
                height: 720,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: false,
                has_touch: false,
            })
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-session-crashed-bubble");

        if headless {
            // Modern Chrome requires --headless=new for proper headless
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }

        // Wire up the proxy. Authenticated upstreams go through a local
        // forwarder; plain ones are handed to Chrome directly.
        let mut forwarder: Option<LocalProxyForwarder> = None;
        if let Some(proxy) = proxy {
            if proxy.requires_auth() {
                let mut fwd = LocalProxyForwarder::new(
                    &proxy.host,
                    proxy.port,
                    proxy.username.as_deref().unwrap_or_default(),
                    proxy.password.as_deref().unwrap_or_default(),
                );
                fwd.start()
                    .await
                    .map_err(|e| BrowserError::LaunchFailed(format!("proxy forwarder: {}", e)))?;
                info!("[{}] Using proxy {} via local forwarder {}", label, proxy.server, fwd.local_url());
                builder = builder.arg(format!("--proxy-server={}", fwd.local_url()));
                forwarder = Some(fwd);
            } else {
                info!("[{}] Using proxy {}", label, proxy.server);
                builder = builder.arg(format!("--proxy-server={}", proxy.server));
            }
        }

        let config = builder
            .build()
            .map_err(BrowserError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        // Drive the CDP event stream for the lifetime of the browser. The
        // JoinHandle is dropped on purpose: the task must outlive a
        // detached driver so a manually-used window stays functional.
        let handler_label = label.clone();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                debug!("[{}] browser event: {:?}", handler_label, event);
            }
            warn!("[{}] Chrome disconnected (event handler ended)", handler_label);
        });

        // Chrome opens with one blank tab; reuse it
        let page = {
            let mut pages = browser
                .pages()
                .await
                .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;
            if pages.is_empty() {
                browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?
            } else {
                pages.remove(0)
            }
        };

        info!("[{}] Browser ready", label);

        Ok(Self {
            label,
            browser: Mutex::new(Some(browser)),
            page,
            forwarder: Mutex::new(forwarder),
        })
    }
}

#[async_trait]
impl PageDriver for ChromiumDriver {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        debug!("[{}] goto {}", self.label, url);
        tokio::time::timeout(timeout, self.page.goto(url))
            .await
            .map_err(|_| BrowserError::Timeout(format!("goto {}", url)))?
            .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;
        Ok(())
    }

    async fn reload(&self, timeout: Duration) -> Result<(), BrowserError> {
        debug!("[{}] reload", self.label);
        tokio::time::timeout(timeout, self.page.reload())
            .await
            .map_err(|_| BrowserError::Timeout("reload".into()))?
            .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        let start = std::time::Instant::now();
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(BrowserError::Timeout(format!(
                    "waiting for selector {}",
                    selector
                )));
            }
            tokio::time::sleep(SELECTOR_POLL).await;
        }
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| BrowserError::ElementNotFound(format!("{}: {}", selector, e)))?;
        element
            .click()
            .await
            .map_err(|e| BrowserError::DriverError(e.to_string()))?;
        Ok(())
    }

    async fn clear(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| BrowserError::ElementNotFound(format!("{}: {}", selector, e)))?;
        element
            .call_js_fn(
                "function() { this.value = ''; this.dispatchEvent(new Event('input', { bubbles: true })); }",
                false,
            )
            .await
            .map_err(|e| BrowserError::DriverError(e.to_string()))?;
        Ok(())
    }

    async fn type_text(&self, text: &str, key_delay: Duration) -> Result<(), BrowserError> {
        // Raw CDP key events with jittered inter-keystroke delay; reads as
        // manual typing rather than a single programmatic fill.
        let mut rng = rand::rngs::StdRng::from_entropy();
        let (low_ms, high_ms) = key_delay_bounds(key_delay);

        for c in text.chars() {
            let key_down = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::KeyDown)
                .text(c.to_string())
                .build()
                .map_err(BrowserError::DriverError)?;
            self.page
                .execute(key_down)
                .await
                .map_err(|e| BrowserError::DriverError(format!("CDP keyDown failed: {}", e)))?;

            let key_up = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::KeyUp)
                .build()
                .map_err(BrowserError::DriverError)?;
            self.page
                .execute(key_up)
                .await
                .map_err(|e| BrowserError::DriverError(format!("CDP keyUp failed: {}", e)))?;

            let delay = rng.gen_range(low_ms..=high_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        Ok(())
    }

    async fn count(&self, selector: &str) -> Result<usize, BrowserError> {
        self.page
            .find_elements(selector)
            .await
            .map(|elements| elements.len())
            .map_err(|e| BrowserError::DriverError(e.to_string()))
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.page
            .url()
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?
            .ok_or_else(|| BrowserError::ConnectionLost("no URL".into()))
    }

    async fn detach(&self) {
        // Leak the Browser handle and the proxy forwarder: dropping either
        // would tear down the Chrome the user wants to keep using.
        if let Some(browser) = self.browser.lock().await.take() {
            std::mem::forget(browser);
        }
        if let Some(fwd) = self.forwarder.lock().await.take() {
            std::mem::forget(fwd);
        }
        info!("[{}] Browser left open for manual use", self.label);
    }
}
