//! The page driver contract
//!
//! Everything the session keeper needs from a browser, and nothing more.
//! Keeping the surface this small lets tests drive the keeper with a
//! scripted in-memory page instead of a real Chrome.

use std::time::Duration;

use async_trait::async_trait;

use super::BrowserError;

/// Narrow automation contract consumed by the session keeper.
///
/// Every call that touches the page carries an explicit timeout (directly or
/// via the implementation) so a keeper blocked in a driver call can still
/// observe its stop signal within bounded time.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate to a URL.
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), BrowserError>;

    /// Reload the current page.
    async fn reload(&self, timeout: Duration) -> Result<(), BrowserError>;

    /// Wait until an element matching `selector` exists.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<(), BrowserError>;

    /// Click the first element matching `selector`.
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    /// Clear the value of the first input matching `selector`.
    async fn clear(&self, selector: &str) -> Result<(), BrowserError>;

    /// Type `text` into the focused element character by character with
    /// `key_delay` between keystrokes.
    async fn type_text(&self, text: &str, key_delay: Duration) -> Result<(), BrowserError>;

    /// Number of elements matching `selector` currently on the page.
    async fn count(&self, selector: &str) -> Result<usize, BrowserError>;

    /// Current page location.
    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Release the underlying browser without closing it. The window stays
    /// open for manual use after the keeper shuts down.
    async fn detach(&self);
}
