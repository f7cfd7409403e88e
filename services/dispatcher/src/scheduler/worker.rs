//! Scheduler background worker.
//!
//! Runs one scheduling pass per interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use jobplane_scheduling::PassSettings;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::store::SchedulerStore;
use super::task_manager::{TaskManager, TaskManagerError};

/// Scheduler worker that drives the task manager.
pub struct SchedulerWorker<S> {
    task_manager: TaskManager<S>,
    interval: Duration,
}

impl<S: SchedulerStore> SchedulerWorker<S> {
    /// Create a new scheduler worker.
    pub fn new(store: Arc<S>, settings: PassSettings, interval: Duration) -> Self {
        Self {
            task_manager: TaskManager::new(store, settings),
            interval,
        }
    }

    /// Run the scheduler worker until shutdown is signaled.
    ///
    /// A failed pass is logged and retried on the next tick.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            control_plane_group = %self.task_manager.settings().control_plane_group,
            "Starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_pass().await {
                        error!(error = %e, "Scheduling pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single pass.
    pub async fn run_pass(&self) -> Result<(), TaskManagerError> {
        let report = self.task_manager.schedule().await?;

        if report.started() > 0 || !report.dispatch_failures.is_empty() {
            info!(
                started = report.started(),
                dispatch_failures = report.dispatch_failures.len(),
                "Scheduling pass applied"
            );
        }

        Ok(())
    }
}
