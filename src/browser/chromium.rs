//! chromiumoxide-backed production driver
//!
//! Launches a stealth-configured Chrome egressing through the worker's
//! proxy lease. Proxy credentials are answered over the CDP Fetch domain
//! (Chrome cannot take proxy auth on the command line), and each launch
//! gets a unique user-data temp directory that is removed on close.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EventAuthRequired, EventRequestPaused,
};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use chromiumoxide::page::Page;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::proxy::ProxyConnection;
use crate::session_store::{StorageState, StoredCookie};

use super::{with_deadline, ElementProbe, VoteDriver, VoteSession};

const CHROME_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Hard ceiling on browser construction inside `open`; the launch gate
/// usually applies a tighter one around the whole call
const LAUNCH_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Find a system Chrome/Chromium executable.
///
/// `CHROMIUM_PATH` overrides everything; then well-known install locations
/// per platform; then `which` on Unix.
pub async fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!(path = %path.display(), "using browser from CHROMIUM_PATH");
            return Ok(path);
        }
        warn!(path = %path.display(), "CHROMIUM_PATH points to a missing file");
    }

    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\Chromium\Application\chrome.exe",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for candidate in candidates {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!(path = %path.display(), "found browser executable");
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !found.is_empty() {
                        return Ok(PathBuf::from(found));
                    }
                }
            }
        }
    }

    Err(anyhow!("no Chrome/Chromium executable found"))
}

/// Download a managed Chromium into a cache directory as a fallback when no
/// system browser exists.
pub async fn download_managed_browser() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("votefleet")
        .join("chromium");
    std::fs::create_dir_all(&cache_dir).context("create browser cache directory")?;

    info!(dir = %cache_dir.display(), "downloading managed Chromium");
    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("build fetcher options")?,
    );
    let revision = fetcher.fetch().await.context("fetch managed browser")?;
    info!(path = %revision.executable_path.display(), "managed Chromium ready");
    Ok(revision.executable_path)
}

/// Production driver: one proxied Chrome per `open`
#[derive(Debug, Clone)]
pub struct ChromiumDriver {
    headless: bool,
}

impl ChromiumDriver {
    #[must_use]
    pub fn new(headless: bool) -> Self {
        Self { headless }
    }
}

#[async_trait]
impl VoteDriver for ChromiumDriver {
    async fn open(
        &self,
        proxy: &ProxyConnection,
        storage: Option<StorageState>,
    ) -> Result<Box<dyn VoteSession>> {
        let chrome_path = match find_browser_executable().await {
            Ok(path) => path,
            Err(_) => download_managed_browser().await?,
        };

        let user_data_dir = std::env::temp_dir().join(format!(
            "votefleet_profile_{}",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&user_data_dir).context("create user data directory")?;

        let mut config_builder = BrowserConfigBuilder::default()
            .request_timeout(LAUNCH_REQUEST_TIMEOUT)
            .window_size(1920, 1080)
            .user_data_dir(user_data_dir.clone())
            .chrome_executable(chrome_path)
            .arg(format!("--proxy-server=http://{}", proxy.server))
            .arg(format!("--user-agent={CHROME_USER_AGENT}"))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-background-networking")
            .arg("--disable-hang-monitor")
            .arg("--metrics-recording-only")
            .arg("--password-store=basic")
            .arg("--mute-audio");
        if self.headless {
            config_builder = config_builder.headless_mode(HeadlessMode::default());
        } else {
            config_builder = config_builder.with_head();
        }
        let browser_config = config_builder
            .build()
            .map_err(|e| anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("failed to launch browser")?;

        // The handler MUST be a tracked task: a detached handler outlives a
        // closed browser and spins forever.
        let handler_task = task::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::error!(error = ?e, "browser handler error");
                }
            }
            debug!("browser event handler exited");
        });

        let mut session = ChromiumSession {
            browser: Some(browser),
            handler: Some(handler_task),
            auth_task: None,
            page: None,
            user_data_dir: Some(user_data_dir),
            pending_local_storage: Mutex::new(
                storage
                    .as_ref()
                    .map(|s| s.local_storage.clone())
                    .filter(|m| !m.is_empty()),
            ),
        };

        match session.init_page(proxy, storage.as_ref()).await {
            Ok(()) => Ok(Box::new(session)),
            Err(e) => {
                // Partial construction must not leak a Chrome process.
                session.close().await;
                Err(e)
            }
        }
    }
}

struct ChromiumSession {
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
    auth_task: Option<JoinHandle<()>>,
    page: Option<Page>,
    user_data_dir: Option<PathBuf>,
    /// localStorage restored on first navigation (it is origin-scoped, so it
    /// cannot be written before the page is on the voting origin)
    pending_local_storage: Mutex<Option<HashMap<String, String>>>,
}

#[derive(Debug, Deserialize)]
struct ProbeJs {
    visible: bool,
    #[serde(default)]
    text: String,
}

impl ChromiumSession {
    fn page(&self) -> Result<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| anyhow!("browser session already closed"))
    }

    async fn init_page(&mut self, proxy: &ProxyConnection, storage: Option<&StorageState>) -> Result<()> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| anyhow!("browser missing during init"))?;
        let page = browser
            .new_page("about:blank")
            .await
            .context("create blank page")?;

        self.enable_proxy_auth(&page, proxy).await?;

        if let Some(storage) = storage {
            if !storage.cookies.is_empty() {
                let params = storage
                    .cookies
                    .iter()
                    .filter_map(cookie_to_param)
                    .collect::<Vec<_>>();
                page.set_cookies(params)
                    .await
                    .context("restore session cookies")?;
                debug!(cookies = storage.cookies.len(), "session cookies restored");
            }
        }

        self.page = Some(page);
        Ok(())
    }

    /// Answer proxy auth challenges over the CDP Fetch domain
    async fn enable_proxy_auth(&mut self, page: &Page, proxy: &ProxyConnection) -> Result<()> {
        page.execute(
            fetch::EnableParams::builder()
                .handle_auth_requests(true)
                .build(),
        )
        .await
        .context("enable fetch auth interception")?;

        let mut auth_events = page
            .event_listener::<EventAuthRequired>()
            .await
            .context("listen for auth challenges")?;
        let mut paused_events = page
            .event_listener::<EventRequestPaused>()
            .await
            .context("listen for paused requests")?;

        let auth_page = page.clone();
        let username = proxy.username.clone();
        let password = proxy.password.clone();
        let auth_task = task::spawn(async move {
            loop {
                tokio::select! {
                    event = auth_events.next() => {
                        let Some(event) = event else { break };
                        let params = AuthChallengeResponse::builder()
                            .response(AuthChallengeResponseResponse::ProvideCredentials)
                            .username(username.clone())
                            .password(password.clone())
                            .build()
                            .and_then(|challenge| {
                                ContinueWithAuthParams::builder()
                                    .request_id(event.request_id.clone())
                                    .auth_challenge_response(challenge)
                                    .build()
                            });
                        match params {
                            Ok(params) => {
                                if let Err(e) = auth_page.execute(params).await {
                                    warn!(error = %e, "failed to answer proxy auth challenge");
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to build auth response"),
                        }
                    }
                    event = paused_events.next() => {
                        let Some(event) = event else { break };
                        match ContinueRequestParams::builder()
                            .request_id(event.request_id.clone())
                            .build()
                        {
                            Ok(params) => {
                                let _ = auth_page.execute(params).await;
                            }
                            Err(e) => warn!(error = %e, "failed to build continue request"),
                        }
                    }
                }
            }
            debug!("proxy auth task exited");
        });
        self.auth_task = Some(auth_task);
        Ok(())
    }

    async fn restore_local_storage(&self) -> Result<()> {
        let pending = self.pending_local_storage.lock().take();
        let Some(entries) = pending else {
            return Ok(());
        };
        let page = self.page()?;
        let payload = serde_json::to_string(&entries).context("serialize localStorage")?;
        let script = format!(
            "(() => {{ const data = {payload}; \
             for (const [k, v] of Object.entries(data)) localStorage.setItem(k, v); }})()"
        );
        page.evaluate(script)
            .await
            .context("restore localStorage")?;
        debug!(keys = entries.len(), "localStorage restored");
        Ok(())
    }
}

#[async_trait]
impl VoteSession for ChromiumSession {
    async fn navigate(&self, url: &str, deadline: Duration) -> Result<()> {
        let page = self.page()?;
        with_deadline(
            async {
                page.goto(url).await.context("navigate")?;
                page.wait_for_navigation()
                    .await
                    .context("wait for page load")?;
                Ok(())
            },
            deadline,
            "page navigation",
        )
        .await?;
        self.restore_local_storage().await
    }

    async fn body_text(&self, deadline: Duration) -> Result<String> {
        let page = self.page()?;
        with_deadline(
            async {
                let body = page.find_element("body").await.context("find body")?;
                let text = body.inner_text().await.context("read body text")?;
                Ok(text.unwrap_or_default())
            },
            deadline,
            "page text read",
        )
        .await
    }

    async fn query(&self, selector: &str, deadline: Duration) -> Result<Option<ElementProbe>> {
        let page = self.page()?;
        let selector_literal =
            serde_json::to_string(selector).context("encode selector")?;
        let script = format!(
            "(() => {{ const el = document.querySelector({selector_literal}); \
             if (!el) return null; \
             const rect = el.getBoundingClientRect(); \
             const style = window.getComputedStyle(el); \
             const visible = rect.width > 0 && rect.height > 0 && \
                 style.display !== 'none' && style.visibility !== 'hidden'; \
             return {{ visible, text: el.innerText || '' }}; }})()"
        );
        with_deadline(
            async {
                let value: serde_json::Value = page
                    .evaluate(script)
                    .await
                    .context("probe selector")?
                    .into_value()
                    .map_err(|e| anyhow!("decode probe result: {e}"))?;
                if value.is_null() {
                    return Ok(None);
                }
                let probe: ProbeJs =
                    serde_json::from_value(value).context("parse probe result")?;
                Ok(Some(ElementProbe {
                    visible: probe.visible,
                    text: probe.text,
                }))
            },
            deadline,
            "element probe",
        )
        .await
    }

    async fn click(&self, selector: &str, deadline: Duration) -> Result<()> {
        let page = self.page()?;
        with_deadline(
            async {
                let element = page
                    .find_element(selector)
                    .await
                    .with_context(|| format!("find element {selector}"))?;
                element.click().await.context("click element")?;
                Ok(())
            },
            deadline,
            "element click",
        )
        .await
    }

    async fn storage_state(&self, deadline: Duration) -> Result<StorageState> {
        let page = self.page()?;
        with_deadline(
            async {
                let cookies = page.get_cookies().await.context("read cookies")?;
                let stored = cookies
                    .into_iter()
                    .map(|c| StoredCookie {
                        name: c.name,
                        value: c.value,
                        domain: c.domain,
                        path: c.path,
                        expires: None,
                        http_only: c.http_only,
                        secure: c.secure,
                    })
                    .collect();

                let value: serde_json::Value = page
                    .evaluate(
                        "(() => { const out = {}; \
                         for (let i = 0; i < localStorage.length; i++) { \
                             const k = localStorage.key(i); out[k] = localStorage.getItem(k); } \
                         return out; })()",
                    )
                    .await
                    .context("read localStorage")?
                    .into_value()
                    .map_err(|e| anyhow!("decode localStorage: {e}"))?;
                let local_storage: HashMap<String, String> =
                    serde_json::from_value(value).unwrap_or_default();

                Ok(StorageState {
                    cookies: stored,
                    local_storage,
                })
            },
            deadline,
            "storage capture",
        )
        .await
    }

    async fn close(&mut self) {
        if let Some(task) = self.auth_task.take() {
            task.abort();
        }
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "browser close failed; process kill on drop");
            }
            let _ = browser.wait().await;
        }
        if let Some(task) = self.handler.take() {
            task.abort();
        }
        self.page = None;
        if let Some(dir) = self.user_data_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "failed to remove browser profile");
            }
        }
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        // Backstop only; the worker always calls close() first.
        if let Some(task) = self.auth_task.take() {
            task.abort();
        }
        if let Some(task) = self.handler.take() {
            task.abort();
        }
        if let Some(dir) = self.user_data_dir.take() {
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}

fn cookie_to_param(cookie: &StoredCookie) -> Option<CookieParam> {
    CookieParam::builder()
        .name(cookie.name.clone())
        .value(cookie.value.clone())
        .domain(cookie.domain.clone())
        .path(cookie.path.clone())
        .http_only(cookie.http_only)
        .secure(cookie.secure)
        .build()
        .ok()
}
