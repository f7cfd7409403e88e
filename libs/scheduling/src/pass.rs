//! One scheduling pass.
//!
//! A pass is a deterministic function from node state and backlog to
//! assignments. It seeds admission and capacity state from the items that
//! already hold resources, then walks node groups in order, capacity types
//! in order, and pending items oldest first. Every success is deducted and
//! marked before the next item is considered, so later items always see the
//! earlier ones.
//!
//! Unplaced items are left pending; the pass never loops to convergence.

use std::collections::{BTreeMap, HashSet};

use jobplane_id::{Hostname, WorkItemId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::capacity::{CapacityModel, Node, NodeGroup};
use crate::dependencies::DependencyHook;
use crate::dependency_graph::DependencyGraph;
use crate::error::{SchedulerError, SchedulerResult};
use crate::work_item::{CapacityType, Projection, Status, WorkItem, WorkItemKind};
use crate::DEFAULT_CONTROL_PLANE_GROUP;

/// Performs the executor handoff for an admitted item.
///
/// Called exactly once per admitted item per pass. Failures are reported,
/// not retried, and do not give back the capacity already deducted.
pub trait Dispatcher {
    fn start(&mut self, item: &WorkItem, assignment: &Assignment) -> SchedulerResult<()>;
}

/// Settings that shape a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSettings {
    /// Group every control and hybrid node must belong to.
    pub control_plane_group: String,
}

impl Default for PassSettings {
    fn default() -> Self {
        Self {
            control_plane_group: DEFAULT_CONTROL_PLANE_GROUP.to_string(),
        }
    }
}

/// Everything a pass reads, loaded up front.
#[derive(Debug, Clone, Default)]
pub struct PassSnapshot {
    pub nodes: Vec<Node>,
    /// Evaluated in this order.
    pub node_groups: Vec<NodeGroup>,
    /// Waiting and running items.
    pub active: Vec<WorkItem>,
    pub pending: Vec<WorkItem>,
}

/// A decision to run an item on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub item_id: WorkItemId,
    pub kind: WorkItemKind,
    pub node: Hostname,
    pub node_group: String,
    pub capacity_cost: u32,
    pub idle_fallback: bool,
}

/// What became of a pending item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Started { node: Hostname },
    /// A resource it needs is held by another item.
    Blocked,
    /// No node in scope had room and none was idle.
    NoCapacity,
    AwaitingDependencies { prerequisites: Vec<WorkItemId> },
    /// A prerequisite ended failed or canceled; the item must be failed too.
    PrerequisiteFailed {
        prerequisites: Vec<WorkItemId>,
        explanation: String,
    },
    InvariantViolation { message: String },
    /// No node group in the pass is in scope for it.
    NoEligibleGroup,
}

/// Remaining capacity of a node after the pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub hostname: Hostname,
    pub remaining_capacity: u32,
    pub running_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchFailure {
    pub item_id: WorkItemId,
    pub node: Hostname,
    pub reason: String,
}

/// Result of a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    /// In decision order.
    pub assignments: Vec<Assignment>,
    pub outcomes: BTreeMap<WorkItemId, ItemOutcome>,
    pub dispatch_failures: Vec<DispatchFailure>,
    pub nodes: Vec<NodeSummary>,
    /// Control or hybrid nodes left out of placement because they sit
    /// outside the control-plane group.
    pub misconfigured_nodes: Vec<Hostname>,
}

impl PassReport {
    pub fn outcome(&self, item_id: WorkItemId) -> Option<&ItemOutcome> {
        self.outcomes.get(&item_id)
    }

    pub fn assignment(&self, item_id: WorkItemId) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.item_id == item_id)
    }

    pub fn node(&self, hostname: &Hostname) -> Option<&NodeSummary> {
        self.nodes.iter().find(|n| &n.hostname == hostname)
    }

    pub fn started(&self) -> usize {
        self.assignments.len()
    }

    /// Items left pending because of a resource conflict.
    pub fn blocked(&self) -> Vec<WorkItemId> {
        self.ids_where(|outcome| matches!(outcome, ItemOutcome::Blocked))
    }

    /// Items left pending for lack of capacity.
    pub fn deferred(&self) -> Vec<WorkItemId> {
        self.ids_where(|outcome| matches!(outcome, ItemOutcome::NoCapacity))
    }

    pub fn awaiting_dependencies(&self) -> Vec<WorkItemId> {
        self.ids_where(|outcome| matches!(outcome, ItemOutcome::AwaitingDependencies { .. }))
    }

    pub fn violations(&self) -> Vec<WorkItemId> {
        self.ids_where(|outcome| matches!(outcome, ItemOutcome::InvariantViolation { .. }))
    }

    /// Items to fail because a prerequisite failed, with the explanation to
    /// record on each.
    pub fn prerequisite_failures(&self) -> Vec<(WorkItemId, String)> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                ItemOutcome::PrerequisiteFailed { explanation, .. } => {
                    Some((*id, explanation.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn ids_where(&self, predicate: impl Fn(&ItemOutcome) -> bool) -> Vec<WorkItemId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| predicate(outcome))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// State exclusively owned by one pass.
#[derive(Debug)]
pub struct SchedulingPass {
    graph: DependencyGraph,
    capacity: CapacityModel,
    groups: Vec<NodeGroup>,
    pending: Vec<WorkItem>,
    control_plane_group: String,
}

impl SchedulingPass {
    /// Seed admission and capacity state from the snapshot.
    pub fn new(snapshot: PassSnapshot, settings: &PassSettings) -> Self {
        let PassSnapshot {
            nodes,
            node_groups,
            active,
            pending,
        } = snapshot;

        let active: Vec<WorkItem> = active
            .into_iter()
            .filter(|item| item.status().is_active())
            .collect();

        let mut graph = DependencyGraph::new();
        graph.seed(&active);

        let capacity = CapacityModel::build(
            nodes,
            &node_groups,
            &active,
            settings.control_plane_group.clone(),
        );

        let mut pending: Vec<WorkItem> = pending
            .into_iter()
            .filter(|item| item.status() == Status::Pending)
            .collect();
        pending.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(&b.id()))
        });

        Self {
            graph,
            capacity,
            groups: node_groups,
            pending,
            control_plane_group: settings.control_plane_group.clone(),
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn capacity(&self) -> &CapacityModel {
        &self.capacity
    }

    /// Pending items in evaluation order.
    pub fn pending(&self) -> &[WorkItem] {
        &self.pending
    }

    /// Decide every pending item once and hand admitted items to `dispatcher`.
    #[instrument(skip_all, fields(pending = self.pending.len(), groups = self.groups.len()))]
    pub fn run<D, H>(self, dispatcher: &mut D, hook: &H) -> PassReport
    where
        D: Dispatcher + ?Sized,
        H: DependencyHook + ?Sized,
    {
        let SchedulingPass {
            mut graph,
            mut capacity,
            groups,
            pending,
            control_plane_group,
        } = self;

        let mut report = PassReport::default();
        let mut placed: HashSet<WorkItemId> = HashSet::new();

        for group in &groups {
            for capacity_type in CapacityType::ORDER {
                for item in &pending {
                    if placed.contains(&item.id())
                        || item.capacity_type() != capacity_type
                        || !item.in_scope_of(&group.name, &control_plane_group)
                    {
                        continue;
                    }

                    let outcome = match Self::decide(item, &group.name, &mut graph, &mut capacity, hook) {
                        Ok(assignment) => {
                            placed.insert(item.id());
                            if let Err(err) = dispatcher.start(item, &assignment) {
                                warn!(item_id = %item.id(), node = %assignment.node, error = %err, "Dispatch failed");
                                report.dispatch_failures.push(DispatchFailure {
                                    item_id: item.id(),
                                    node: assignment.node.clone(),
                                    reason: err.to_string(),
                                });
                            }
                            let node = assignment.node.clone();
                            report.assignments.push(assignment);
                            ItemOutcome::Started { node }
                        }
                        Err(outcome) => outcome,
                    };
                    report.outcomes.insert(item.id(), outcome);
                }
            }
        }

        for item in &pending {
            report
                .outcomes
                .entry(item.id())
                .or_insert(ItemOutcome::NoEligibleGroup);
        }

        report.nodes = capacity
            .nodes()
            .map(|node| NodeSummary {
                hostname: node.hostname.clone(),
                remaining_capacity: node.remaining_capacity,
                running_count: node.running_count,
            })
            .collect();
        report.misconfigured_nodes = capacity.misconfigured_nodes().cloned().collect();

        info!(
            started = report.started(),
            blocked = report.blocked().len(),
            deferred = report.deferred().len(),
            awaiting_dependencies = report.awaiting_dependencies().len(),
            prerequisite_failures = report.prerequisite_failures().len(),
            dispatch_failures = report.dispatch_failures.len(),
            "Scheduling pass complete"
        );

        report
    }

    /// Admission, then placement, then bookkeeping for one item in one group.
    fn decide<H>(
        item: &WorkItem,
        group: &str,
        graph: &mut DependencyGraph,
        capacity: &mut CapacityModel,
        hook: &H,
    ) -> Result<Assignment, ItemOutcome>
    where
        H: DependencyHook + ?Sized,
    {
        if let Some(request) = hook.needs_dependency(item) {
            if let Some(explanation) = request.failure_explanation() {
                warn!(item_id = %item.id(), failed = ?request.failed, "Prerequisite failed");
                return Err(ItemOutcome::PrerequisiteFailed {
                    prerequisites: request.failed.into_iter().map(|(id, _)| id).collect(),
                    explanation,
                });
            }
            debug!(item_id = %item.id(), prerequisites = ?request.prerequisites, "Waiting on prerequisites");
            return Err(ItemOutcome::AwaitingDependencies {
                prerequisites: request.prerequisites,
            });
        }

        if graph.is_blocked(item) {
            debug!(item_id = %item.id(), kind = %item.kind(), "Blocked from running");
            return Err(ItemOutcome::Blocked);
        }

        let Some(placement) = capacity.fit(item, group) else {
            debug!(
                item_id = %item.id(),
                group = %group,
                capacity_cost = item.capacity_cost(),
                "No capacity, waiting for next pass"
            );
            return Err(ItemOutcome::NoCapacity);
        };

        match capacity.assign(item, &placement.hostname) {
            Ok(_) => {}
            Err(SchedulerError::ConfigurationInvariantViolation(message)) => {
                warn!(item_id = %item.id(), node = %placement.hostname, %message, "Invariant violation");
                return Err(ItemOutcome::InvariantViolation { message });
            }
            Err(err) if err.is_transient() => {
                debug!(item_id = %item.id(), error = %err, "Placement target vanished");
                return Err(ItemOutcome::NoCapacity);
            }
            Err(err) => {
                let message = err.to_string();
                warn!(item_id = %item.id(), node = %placement.hostname, %message, "Placement failed");
                return Err(ItemOutcome::InvariantViolation { message });
            }
        }
        graph.mark(item);

        debug!(
            item_id = %item.id(),
            node = %placement.hostname,
            group = %group,
            idle_fallback = placement.idle_fallback,
            "Starting"
        );

        Ok(Assignment {
            item_id: item.id(),
            kind: item.kind(),
            node: placement.hostname,
            node_group: group.to_string(),
            capacity_cost: item.capacity_cost(),
            idle_fallback: placement.idle_fallback,
        })
    }
}

/// Dispatcher that records assignments for the host to persist afterwards.
#[derive(Debug, Clone, Default)]
pub struct RecordingDispatcher {
    started: Vec<(WorkItem, Assignment)>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> &[(WorkItem, Assignment)] {
        &self.started
    }

    pub fn into_started(self) -> Vec<(WorkItem, Assignment)> {
        self.started
    }
}

impl Dispatcher for RecordingDispatcher {
    fn start(&mut self, item: &WorkItem, assignment: &Assignment) -> SchedulerResult<()> {
        self.started.push((item.clone(), assignment.clone()));
        Ok(())
    }
}
