//! SoundOn Login Keeper
//!
//! Keeps one or more authenticated SoundOn sessions alive indefinitely:
//! logs in, periodically verifies the session is still authenticated, and
//! re-authenticates immediately on detected logout, across up to 10
//! independent browser tabs, each optionally routed through its own proxy.

pub mod browser;
pub mod keeper;
pub mod proxy;
pub mod supervisor;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use proxy::ProxyConfig;

/// Application configuration as entered on the control surface.
///
/// Raw user input: validated into a [`StartRequest`] before anything runs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub email: String,
    pub password: String,
    /// Seconds between session checks
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: f64,
    /// Number of parallel tabs (1..=10)
    #[serde(default = "default_tabs")]
    pub tabs: usize,
    /// Proxy string, `ip:port` or `ip:port:user:pass`; empty = no proxy
    #[serde(default)]
    pub proxy: String,
    #[serde(default)]
    pub headless: bool,
    /// Inter-keystroke delay for credential typing, in milliseconds
    #[serde(default = "default_typing_delay_ms")]
    pub typing_delay_ms: u64,
    /// Fail-open vs fail-closed classification when the logout probe errors
    #[serde(default = "default_fail_open")]
    pub assume_logged_in_on_probe_error: bool,
}

fn default_check_interval() -> f64 {
    1.0
}

fn default_tabs() -> usize {
    1
}

fn default_typing_delay_ms() -> u64 {
    80
}

fn default_fail_open() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            password: String::new(),
            check_interval_secs: default_check_interval(),
            tabs: default_tabs(),
            proxy: String::new(),
            headless: false,
            typing_delay_ms: default_typing_delay_ms(),
            assume_logged_in_on_probe_error: default_fail_open(),
        }
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("soundon-keeper").join("logs"))
}

impl AppConfig {
    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("soundon-keeper").join("config.json"))
    }

    /// Load config from file, falling back to defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => warn!("Failed to parse config file: {}", e),
                    },
                    Err(e) => warn!("Failed to read config file: {}", e),
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    } else {
                        info!("Config saved to {:?}", path);
                    }
                }
                Err(e) => error!("Failed to serialize config: {}", e),
            }
        }
    }

    /// Validate into a [`StartRequest`]. Nothing runs if this fails; the
    /// error message is meant to be shown to the user as-is.
    pub fn validated(&self) -> Result<StartRequest, ValidationError> {
        let email = self.email.trim();
        let password = self.password.trim();
        if email.is_empty() || password.is_empty() {
            return Err(ValidationError::MissingCredentials);
        }

        if !self.check_interval_secs.is_finite() || self.check_interval_secs <= 0.0 {
            return Err(ValidationError::InvalidInterval);
        }
        // Values beyond Duration's range are rejected here, not at start time
        let check_interval = Duration::try_from_secs_f64(self.check_interval_secs)
            .map_err(|_| ValidationError::InvalidInterval)?;

        if self.tabs == 0 || self.tabs > 10 {
            return Err(ValidationError::InvalidTabCount);
        }

        let proxy = if self.proxy.trim().is_empty() {
            None
        } else {
            Some(proxy::parse_proxy(&self.proxy).ok_or(ValidationError::InvalidProxy)?)
        };

        Ok(StartRequest {
            email: email.to_string(),
            password: password.to_string(),
            check_interval,
            tab_count: self.tabs,
            proxy,
            headless: self.headless,
            typing_delay: Duration::from_millis(self.typing_delay_ms),
            assume_logged_in_on_probe_error: self.assume_logged_in_on_probe_error,
        })
    }
}

/// Validated configuration handed to the supervisor. Immutable for the
/// lifetime of one batch.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub email: String,
    pub password: String,
    pub check_interval: Duration,
    pub tab_count: usize,
    pub proxy: Option<ProxyConfig>,
    pub headless: bool,
    pub typing_delay: Duration,
    pub assume_logged_in_on_probe_error: bool,
}

/// User-input errors surfaced before any worker starts, plus the one
/// supervisor-level user error (starting a second batch).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please enter both email and password")]
    MissingCredentials,

    #[error("Check interval must be a positive number (e.g. 1, 0.5, 2.5)")]
    InvalidInterval,

    #[error("Number of tabs must be between 1 and 10")]
    InvalidTabCount,

    #[error("Invalid proxy format. Use ip:port or ip:port:user:pass")]
    InvalidProxy,

    #[error("Login keeper is already running")]
    AlreadyRunning,
}

/// One freeform per-tab status line for the control surface.
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub tab: usize,
    pub message: String,
}

/// Initialize logging: console layer plus a daily rolling file under the
/// platform log directory when available.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "soundon-keeper.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            email: "artist@example.com".to_string(),
            password: "hunter2".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validated_defaults() {
        let request = valid_config().validated().unwrap();
        assert_eq!(request.check_interval, Duration::from_secs(1));
        assert_eq!(request.tab_count, 1);
        assert_eq!(request.proxy, None);
        assert_eq!(request.typing_delay, Duration::from_millis(80));
        assert!(request.assume_logged_in_on_probe_error);
    }

    #[test]
    fn test_validated_rejects_missing_credentials() {
        let mut config = valid_config();
        config.password = "   ".to_string();
        assert_eq!(
            config.validated().unwrap_err(),
            ValidationError::MissingCredentials
        );
    }

    #[test]
    fn test_validated_rejects_bad_interval() {
        let mut config = valid_config();
        config.check_interval_secs = 0.0;
        assert_eq!(
            config.validated().unwrap_err(),
            ValidationError::InvalidInterval
        );

        config.check_interval_secs = -2.5;
        assert_eq!(
            config.validated().unwrap_err(),
            ValidationError::InvalidInterval
        );

        // Finite but beyond what a Duration can hold
        config.check_interval_secs = 1e30;
        assert_eq!(
            config.validated().unwrap_err(),
            ValidationError::InvalidInterval
        );
    }

    #[test]
    fn test_validated_accepts_fractional_interval() {
        let mut config = valid_config();
        config.check_interval_secs = 0.5;
        let request = config.validated().unwrap();
        assert_eq!(request.check_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_validated_rejects_tab_count_out_of_range() {
        let mut config = valid_config();
        config.tabs = 0;
        assert_eq!(
            config.validated().unwrap_err(),
            ValidationError::InvalidTabCount
        );

        config.tabs = 11;
        assert_eq!(
            config.validated().unwrap_err(),
            ValidationError::InvalidTabCount
        );
    }

    #[test]
    fn test_validated_parses_proxy() {
        let mut config = valid_config();
        config.proxy = "1.2.3.4:8080:bob:se:cret".to_string();
        let request = config.validated().unwrap();
        let proxy = request.proxy.unwrap();
        assert_eq!(proxy.server, "http://1.2.3.4:8080");
        assert_eq!(proxy.username.as_deref(), Some("bob"));
        assert_eq!(proxy.password.as_deref(), Some("se:cret"));
    }

    #[test]
    fn test_validated_rejects_bad_proxy() {
        let mut config = valid_config();
        config.proxy = "not-a-proxy".to_string();
        assert_eq!(config.validated().unwrap_err(), ValidationError::InvalidProxy);
    }
}
