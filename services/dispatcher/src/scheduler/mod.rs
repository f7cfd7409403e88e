//! Scheduler host: loads state, runs passes, writes decisions back.
//!
//! The decision logic lives in `jobplane-scheduling`; this module owns the
//! I/O around it:
//! - The [`SchedulerStore`] seam over durable state
//! - The [`TaskManager`] that advances workflows and runs one pass end to end
//! - The periodic [`SchedulerWorker`]

#[cfg(test)]
pub(crate) mod memory;
pub mod store;
mod task_manager;
mod worker;

pub use store::{dispatched_status, PersistOutcome, SchedulerStore, StoreError, StoreResult};
pub use task_manager::{TaskManager, TaskManagerError};
pub use worker::SchedulerWorker;
