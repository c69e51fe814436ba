//! Periodic removal of expired dynamic leases.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::lease::Family;
use crate::manager::LeaseManager;

/// Longest gap between two reap passes.
pub const MAX_REAP_INTERVAL: Duration = Duration::from_secs(60);

const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Told about every finished reap pass.
#[async_trait]
pub trait ReapListener: Send + Sync {
    /// Called after each pass with the number of leases it removed.
    async fn reaped(&self, count: usize);
}

/// Sweeps every interface's lease tables on a fixed interval.
///
/// The interval is the smallest configured lease duration, capped at
/// [`MAX_REAP_INTERVAL`] and never below one second.
#[derive(Clone)]
pub struct ExpiryReaper {
    managers: Vec<Arc<LeaseManager>>,
    interval: Duration,
    listener: Option<Arc<dyn ReapListener>>,
}

impl std::fmt::Debug for ExpiryReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryReaper")
            .field("managers", &self.managers)
            .field("interval", &self.interval)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl ExpiryReaper {
    pub fn new(managers: Vec<Arc<LeaseManager>>) -> Self {
        let interval = managers
            .iter()
            .flat_map(|manager| {
                [Family::V4, Family::V6]
                    .into_iter()
                    .filter_map(|family| manager.lease_duration(family))
            })
            .min()
            .unwrap_or(MAX_REAP_INTERVAL)
            .clamp(MIN_REAP_INTERVAL, MAX_REAP_INTERVAL);

        Self {
            managers,
            interval,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ReapListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_REAP_INTERVAL);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs one pass as of `now` and returns how many leases were removed.
    pub async fn reap_at(&self, now: DateTime<Utc>) -> usize {
        let mut total = 0;
        for manager in &self.managers {
            total += manager.reap_expired(now).await.len();
        }
        if total > 0 {
            debug!("Reap pass removed {} expired lease(s)", total);
        }
        if let Some(listener) = &self.listener {
            listener.reaped(total).await;
        }
        total
    }

    pub async fn reap_once(&self) -> usize {
        self.reap_at(Utc::now()).await
    }

    /// Starts the periodic pass on the tokio runtime.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        info!("Starting lease reaper, interval {:?}", self.interval);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.reap_once().await;
                    }
                    _ = &mut shutdown_rx => break,
                }
            }

            info!("Lease reaper stopped");
        });

        ReaperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running reaper task.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stops the reaper and waits for an in-flight pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(error) = self.task.await {
            warn!("Lease reaper task failed: {}", error);
        }
    }
}
