//! Capacity-aware task scheduling core.
//!
//! A scheduling pass takes the fleet of worker nodes, the node groups that
//! partition it, the items already holding resources and the pending
//! backlog, and decides which pending items start now and where:
//!
//! - [`work_item`]: read-only projections of schedulable units and their
//!   capacity cost.
//! - [`dependency_graph`]: per-pass admission control over logical
//!   resources (projects, inventories, sources, templates).
//! - [`capacity`]: per-node capacity ledger with best-fit placement and an
//!   idle-node fallback.
//! - [`dependencies`]: implicit project and inventory syncs a template run
//!   must wait for.
//! - [`pass`]: the orchestration of one pass.
//! - [`workflow`]: which nodes of a running workflow launch next and when
//!   the workflow is done.
//!
//! # Invariants
//!
//! - A node's remaining capacity never underflows; it floors at zero.
//! - Once a resource is marked busy in a pass it stays busy for that pass.
//! - Every control or hybrid node belongs to the control-plane group.
//! - The same inputs always produce the same assignments.
//!
//! Nothing in this crate performs I/O. The host loads a [`PassSnapshot`],
//! runs a [`SchedulingPass`], and persists what the [`Dispatcher`] saw.

use std::time::Duration;

pub mod capacity;
pub mod dependencies;
pub mod dependency_graph;
pub mod error;
pub mod pass;
pub mod work_item;
pub mod workflow;

pub use capacity::{CapacityModel, Node, NodeGroup, NodePool, NodeRole, Placement};
pub use dependencies::{
    DependencyCatalog, DependencyHook, DependencyIndex, DependencyPlan, DependencyRequest,
    NoDependencies,
};
pub use dependency_graph::{DependencyGraph, ResourceKey};
pub use error::{SchedulerError, SchedulerResult};
pub use pass::{
    Assignment, DispatchFailure, Dispatcher, ItemOutcome, NodeSummary, PassReport, PassSettings,
    PassSnapshot, RecordingDispatcher, SchedulingPass,
};
pub use work_item::{CapacityType, Projection, Status, WorkItem, WorkItemKind};
pub use workflow::{
    EdgeKind, NodeTemplate, WorkflowDag, WorkflowEdge, WorkflowNode, WorkflowProgress,
    WorkflowState, WorkflowStep,
};

/// Name of the node group every control and hybrid node must belong to.
pub const DEFAULT_CONTROL_PLANE_GROUP: &str = "controlplane";

/// Default time between scheduling passes.
pub const DEFAULT_SCHEDULE_INTERVAL: Duration = Duration::from_secs(5);
