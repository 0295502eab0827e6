//! Browser automation surface
//!
//! The orchestration core consumes browsers through the narrow
//! [`VoteDriver`] / [`VoteSession`] seam rather than talking to a concrete
//! automation library: the worker state machine needs exactly navigation,
//! text reads, element probes, clicks and storage capture — all
//! deadline-bounded — and nothing else. The chromiumoxide-backed production
//! driver lives in [`chromium`]; tests substitute scripted fakes.

mod chromium;

pub use chromium::ChromiumDriver;

use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::proxy::ProxyConnection;
use crate::session_store::StorageState;

/// Result of probing one CSS selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementProbe {
    /// Rendered (non-zero box, not display:none / visibility:hidden)
    pub visible: bool,
    /// The element's inner text, whitespace preserved
    pub text: String,
}

/// One live proxied browser with a single page
///
/// Every method that blocks on the browser takes an explicit deadline; a
/// hung renderer must surface as an error, never as an indefinite await.
/// `close` releases the page, the browser process, the event handler task
/// and the on-disk profile; implementations also force cleanup in `Drop`
/// as a backstop.
#[async_trait]
pub trait VoteSession: Send + Sync {
    async fn navigate(&self, url: &str, deadline: Duration) -> Result<()>;

    /// Full visible text of the page body
    async fn body_text(&self, deadline: Duration) -> Result<String>;

    /// Probe a selector; `Ok(None)` when no element matches
    async fn query(&self, selector: &str, deadline: Duration) -> Result<Option<ElementProbe>>;

    async fn click(&self, selector: &str, deadline: Duration) -> Result<()>;

    /// Capture cookies and page-origin localStorage for persistence
    async fn storage_state(&self, deadline: Duration) -> Result<StorageState>;

    /// Release every handle. Must be infallible in effect: after return the
    /// session owns no browser resources even if teardown steps errored.
    async fn close(&mut self);
}

/// Launches proxied browser sessions
#[async_trait]
pub trait VoteDriver: Send + Sync {
    /// Open a browser egressing through `proxy`, restoring `storage` when
    /// present. The caller wraps this in the launch-gate init deadline.
    async fn open(
        &self,
        proxy: &ProxyConnection,
        storage: Option<StorageState>,
    ) -> Result<Box<dyn VoteSession>>;
}

/// Apply a deadline to a browser-blocking operation.
///
/// Mirrors the crawl-side page timeout helper: distinguishes "operation
/// failed" from "operation never came back".
pub async fn with_deadline<F, T>(operation: F, deadline: Duration, what: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "{what} timed out after {}s",
            deadline.as_secs()
        )),
    }
}
