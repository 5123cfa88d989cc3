//! Browser error types

use thiserror::Error;

/// Browser-related errors.
///
/// The session keeper treats `Timeout` and every other variant alike as
/// recoverable within a check cycle; the distinction only changes how a
/// failed reload is handled (skip vs. recovery classify).
#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Driver error: {0}")]
    DriverError(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BrowserError {
    /// Whether this is a bounded-timeout failure (as opposed to a generic
    /// driver error).
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrowserError::Timeout(_))
    }
}

impl From<BrowserError> for String {
    fn from(err: BrowserError) -> String {
        err.to_string()
    }
}
