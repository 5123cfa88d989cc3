//! Tab supervisor
//!
//! Launches one session keeper per requested tab, each with its own browser
//! and proxy, and fans a single cooperative stop signal out to all of them.
//! One batch at a time; stopping is fire-and-forget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::browser::{BrowserError, ChromiumDriver, PageDriver};
use crate::keeper::{KeeperConfig, SessionKeeper};
use crate::{StartRequest, StatusLine, ValidationError};

/// Cooperative cancellation token shared by every keeper in a batch.
///
/// Created cleared when a batch starts, set once by a stop request, and
/// only ever polled by keepers. A new batch gets a fresh signal.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Builds the page driver a keeper will own. Injectable so tests can hand
/// keepers a scripted page instead of a real Chrome.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self, config: &KeeperConfig) -> Result<Box<dyn PageDriver>, BrowserError>;
}

/// The production factory: one Chrome instance per tab.
pub struct ChromiumFactory;

#[async_trait]
impl DriverFactory for ChromiumFactory {
    async fn create(&self, config: &KeeperConfig) -> Result<Box<dyn PageDriver>, BrowserError> {
        let driver =
            ChromiumDriver::launch(config.tab_index, config.headless, config.proxy.as_ref()).await?;
        Ok(Box::new(driver))
    }
}

/// A running keeper: its background task paired with the batch stop signal
/// it watches. Reaped only once the task has observed the stop and returned;
/// the underlying browser session is deliberately left open.
struct KeeperHandle {
    tab_index: usize,
    task: JoinHandle<()>,
}

struct Batch {
    stop: StopSignal,
    handles: Vec<KeeperHandle>,
}

/// Supervises one batch of session keepers.
pub struct TabSupervisor {
    batch: Mutex<Option<Batch>>,
    status: Option<UnboundedSender<StatusLine>>,
}

impl TabSupervisor {
    pub fn new() -> Self {
        Self {
            batch: Mutex::new(None),
            status: None,
        }
    }

    /// Attach a status line sink handed to every keeper.
    pub fn with_status(mut self, status: UnboundedSender<StatusLine>) -> Self {
        self.status = Some(status);
        self
    }

    pub async fn is_running(&self) -> bool {
        self.batch.lock().await.is_some()
    }

    /// Start one keeper per tab. Rejects the request if a batch is already
    /// active, without touching the running batch.
    pub async fn start(
        &self,
        request: StartRequest,
        factory: Arc<dyn DriverFactory>,
    ) -> Result<(), ValidationError> {
        let mut batch = self.batch.lock().await;
        if batch.is_some() {
            return Err(ValidationError::AlreadyRunning);
        }

        info!(
            "Starting {} tab(s), checking every {:.1}s{}",
            request.tab_count,
            request.check_interval.as_secs_f64(),
            request
                .proxy
                .as_ref()
                .map(|p| format!(", proxy {}", p.server))
                .unwrap_or_default(),
        );

        let stop = StopSignal::new();
        let mut handles = Vec::with_capacity(request.tab_count);

        for tab_index in 1..=request.tab_count {
            let config = KeeperConfig {
                email: request.email.clone(),
                password: request.password.clone(),
                check_interval: request.check_interval,
                tab_index,
                proxy: request.proxy.clone(),
                headless: request.headless,
                typing_delay: request.typing_delay,
                assume_logged_in_on_probe_error: request.assume_logged_in_on_probe_error,
            };
            let factory = factory.clone();
            let keeper_stop = stop.clone();
            let status = self.status.clone();

            let task = tokio::spawn(async move {
                let driver = match factory.create(&config).await {
                    Ok(driver) => driver,
                    Err(e) => {
                        // Fatal for this tab only; siblings are unaffected
                        error!("[Tab {}] Failed to launch browser: {}", config.tab_index, e);
                        if let Some(tx) = &status {
                            let _ = tx.send(StatusLine {
                                tab: config.tab_index,
                                message: format!("Failed to launch browser: {}", e),
                            });
                        }
                        return;
                    }
                };

                let mut keeper = SessionKeeper::new(config, driver);
                if let Some(tx) = status {
                    keeper = keeper.with_status(tx);
                }
                if let Err(e) = keeper.run(keeper_stop).await {
                    warn!("{}", e);
                }
            });

            handles.push(KeeperHandle { tab_index, task });
        }

        *batch = Some(Batch { stop, handles });
        Ok(())
    }

    /// Request a cooperative stop of the active batch.
    ///
    /// Sets the StopSignal and returns immediately; keepers acknowledge on
    /// their own schedule and their handles are reaped off to the side.
    /// Returns whether a batch was actually running.
    pub async fn stop(&self) -> bool {
        let mut batch = self.batch.lock().await;
        match batch.take() {
            Some(batch) => {
                info!("Stop requested, signalling {} keeper(s)", batch.handles.len());
                batch.stop.set();

                tokio::spawn(async move {
                    for handle in batch.handles {
                        if let Err(e) = handle.task.await {
                            warn!("[Tab {}] Keeper task failed: {}", handle.tab_index, e);
                        }
                    }
                    info!("All keepers stopped. Browser windows remain open.");
                });
                true
            }
            None => {
                warn!("Stop requested but no batch is running");
                false
            }
        }
    }
}

impl Default for TabSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
