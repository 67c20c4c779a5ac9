//! In-process periodic stuck scan.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use super::{DEFAULT_STUCK_THRESHOLD, StuckReport, Tracker};

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Time between scans.
    pub interval: Duration,
    pub threshold: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            threshold: DEFAULT_STUCK_THRESHOLD,
        }
    }
}

/// Runs the stuck detector on a fixed interval until shut down.
#[derive(Clone)]
pub struct StuckWatcher {
    tracker: Tracker,
    config: WatchConfig,
    shutdown: Arc<Notify>,
}

impl StuckWatcher {
    pub fn new(tracker: Tracker, config: WatchConfig) -> Self {
        Self {
            tracker,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the watcher to stop. Safe to call before `run` starts.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Loop until shutdown, scanning once per interval.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            threshold_ms = self.config.threshold.as_millis() as u64,
            "stuck watcher started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("stuck watcher shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            self.tick().await;
        }
    }

    /// One scan. Errors are logged, never propagated.
    pub async fn tick(&self) -> Option<StuckReport> {
        match self
            .tracker
            .detect_and_mark_stuck(self.config.threshold)
            .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "stuck scan failed");
                None
            }
        }
    }
}
