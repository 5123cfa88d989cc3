//! SoundOn Login Keeper - command-line control surface
//!
//! Collects configuration from the saved config file and environment
//! variables, starts the tab supervisor, and stops it on Ctrl-C. Browser
//! windows are deliberately left open after stop; a second Ctrl-C exits.
//!
//! Environment variables (each overrides the saved config):
//! - `SOUNDON_EMAIL` / `SOUNDON_PASSWORD` - credentials
//! - `SOUNDON_INTERVAL_SECS` - seconds between checks (default: 1)
//! - `SOUNDON_TABS` - number of parallel tabs, 1..=10 (default: 1)
//! - `SOUNDON_PROXY` - ip:port or ip:port:user:pass (default: none)
//! - `SOUNDON_HEADLESS` - "1"/"true" to run headless

use std::sync::Arc;

use tracing::{info, warn};

use soundon_keeper::supervisor::{ChromiumFactory, TabSupervisor};
use soundon_keeper::AppConfig;

fn env_override(config: &mut AppConfig) {
    if let Ok(email) = std::env::var("SOUNDON_EMAIL") {
        config.email = email;
    }
    if let Ok(password) = std::env::var("SOUNDON_PASSWORD") {
        config.password = password;
    }
    if let Ok(value) = std::env::var("SOUNDON_INTERVAL_SECS") {
        match value.parse() {
            Ok(interval) => config.check_interval_secs = interval,
            Err(_) => warn!(
                "Ignoring SOUNDON_INTERVAL_SECS={:?}: not a number, keeping {}",
                value, config.check_interval_secs
            ),
        }
    }
    if let Ok(value) = std::env::var("SOUNDON_TABS") {
        match value.parse() {
            Ok(tabs) => config.tabs = tabs,
            Err(_) => warn!(
                "Ignoring SOUNDON_TABS={:?}: not a number, keeping {}",
                value, config.tabs
            ),
        }
    }
    if let Ok(proxy) = std::env::var("SOUNDON_PROXY") {
        config.proxy = proxy;
    }
    if let Ok(headless) = std::env::var("SOUNDON_HEADLESS") {
        config.headless = matches!(headless.as_str(), "1" | "true" | "yes");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = soundon_keeper::init_logging();

    info!("Starting SoundOn Login Keeper");
    if let Some(dir) = soundon_keeper::log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let mut config = AppConfig::load();
    env_override(&mut config);

    // Validation errors block start with an explanatory message; nothing
    // runs if the input is bad.
    let request = config.validated().map_err(|e| anyhow::anyhow!("{}", e))?;
    config.save();

    info!(
        "Keeping {} account session(s) logged in, checking every {:.1}s",
        request.tab_count,
        request.check_interval.as_secs_f64()
    );

    let supervisor = Arc::new(TabSupervisor::new());
    supervisor
        .start(request, Arc::new(ChromiumFactory))
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    // First Ctrl-C: cooperative stop, browsers stay open
    tokio::signal::ctrl_c().await?;
    info!("Stop requested. Keepers will shut down; browser windows remain open.");
    supervisor.stop().await;

    // Second Ctrl-C: exit the process
    info!("Press Ctrl-C again to exit.");
    tokio::signal::ctrl_c().await?;
    info!("Exiting");

    Ok(())
}
