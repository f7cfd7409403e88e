//! One scheduling pass, end to end.
//!
//! The task manager first advances running workflows, then bulk-loads state,
//! plans implicit prerequisites, runs the pure [`SchedulingPass`], and writes
//! its decisions back in one transaction. Runs whose prerequisites failed are
//! failed last. The decisions in between are synchronous.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use jobplane_id::WorkItemId;
use jobplane_scheduling::dependencies::{self, PrerequisiteRef};
use jobplane_scheduling::{
    Assignment, DispatchFailure, PassReport, PassSettings, PassSnapshot, Projection,
    RecordingDispatcher, SchedulingPass, Status, WorkItem, WorkItemKind, WorkflowState,
    WorkflowStep,
};
use tracing::{debug, info, instrument, warn};

use super::store::{SchedulerStore, StoreError};

/// Errors that abort a pass before any decision is made.
#[derive(Debug, thiserror::Error)]
pub enum TaskManagerError {
    #[error("failed to load scheduler state: {0}")]
    Load(#[source] StoreError),
}

/// Runs scheduling passes against a store.
pub struct TaskManager<S> {
    store: Arc<S>,
    settings: PassSettings,
}

impl<S: SchedulerStore> TaskManager<S> {
    pub fn new(store: Arc<S>, settings: PassSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &PassSettings {
        &self.settings
    }

    /// Run one pass.
    ///
    /// Failures after the load never abort the pass: prerequisites that could
    /// not be created are dropped and a failed write is reported as a
    /// dispatch failure for every item of the pass.
    #[instrument(skip(self))]
    pub async fn schedule(&self) -> Result<PassReport, TaskManagerError> {
        let workflows = self
            .store
            .load_running_workflows()
            .await
            .map_err(TaskManagerError::Load)?;
        for workflow in &workflows {
            self.advance_workflow(workflow).await;
        }

        let mut snapshot = self.load_snapshot().await?;

        let index = self.plan_dependencies(&mut snapshot).await?;

        let mut dispatcher = RecordingDispatcher::new();
        let mut report =
            SchedulingPass::new(snapshot, &self.settings).run(&mut dispatcher, &index);

        let started = dispatcher.into_started();
        self.persist(&started, &mut report).await;
        self.fail_dependents(&report).await;

        if let Err(e) = self.store.record_pass(&report).await {
            warn!(error = %e, "Failed to record pass report");
        }

        Ok(report)
    }

    async fn load_snapshot(&self) -> Result<PassSnapshot, TaskManagerError> {
        let mut snapshot = PassSnapshot::default();
        for kind in WorkItemKind::ALL {
            snapshot.pending.extend(
                self.store
                    .list_pending(kind)
                    .await
                    .map_err(TaskManagerError::Load)?,
            );
            snapshot.active.extend(
                self.store
                    .list_running_and_waiting(kind)
                    .await
                    .map_err(TaskManagerError::Load)?,
            );
        }
        snapshot.nodes = self.store.list_nodes().await.map_err(TaskManagerError::Load)?;
        snapshot.node_groups = self
            .store
            .list_node_groups()
            .await
            .map_err(TaskManagerError::Load)?;

        debug!(
            pending = snapshot.pending.len(),
            active = snapshot.active.len(),
            nodes = snapshot.nodes.len(),
            node_groups = snapshot.node_groups.len(),
            "Loaded scheduler state"
        );

        Ok(snapshot)
    }

    /// Create missing prerequisites, add them to the backlog, and build the
    /// hook the pass consults.
    async fn plan_dependencies(
        &self,
        snapshot: &mut PassSnapshot,
    ) -> Result<dependencies::DependencyIndex, TaskManagerError> {
        let catalog = self
            .store
            .load_dependency_catalog(&snapshot.pending)
            .await
            .map_err(TaskManagerError::Load)?;
        let plan = dependencies::plan(&catalog, &snapshot.pending, Utc::now());

        let mut created: Vec<Option<WorkItemId>> = Vec::with_capacity(plan.creates.len());
        for prerequisite in &plan.creates {
            match self.store.create_prerequisite(prerequisite).await {
                Ok(item) => {
                    info!(item_id = %item.id(), kind = %item.kind(), "Created prerequisite");
                    created.push(Some(item.id()));
                    snapshot.pending.push(item);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to create prerequisite");
                    created.push(None);
                }
            }
        }

        let mut links: BTreeMap<WorkItemId, Vec<WorkItemId>> = BTreeMap::new();
        for (item, prerequisite) in &plan.links {
            let resolved = match prerequisite {
                PrerequisiteRef::Existing(id) => Some(*id),
                PrerequisiteRef::Planned(position) => created.get(*position).copied().flatten(),
            };
            if let Some(id) = resolved {
                links.entry(*item).or_default().push(id);
            }
        }
        for (item, prerequisites) in &links {
            if let Err(e) = self.store.record_prerequisites(*item, prerequisites).await {
                warn!(item_id = %item, error = %e, "Failed to record prerequisites");
            }
        }

        let items: Vec<&WorkItem> = snapshot
            .pending
            .iter()
            .chain(snapshot.active.iter())
            .collect();
        Ok(plan.into_index(&catalog, &created, items))
    }

    /// Spawn the nodes that became ready, or finish the run.
    ///
    /// Spawned items are pending and join this pass's backlog.
    async fn advance_workflow(&self, workflow: &WorkflowState) {
        let run = workflow.run_id;
        match workflow.next_step() {
            WorkflowStep::Spawn { nodes } => {
                for node_id in nodes {
                    let Some(template) = workflow
                        .dag
                        .node(node_id)
                        .and_then(|node| node.template.as_ref())
                    else {
                        continue;
                    };
                    match self.store.spawn_workflow_node(run, node_id, template).await {
                        Ok(item) => info!(
                            workflow_id = %run,
                            node_id = %node_id,
                            item_id = %item.id(),
                            kind = %item.kind(),
                            "Spawned workflow node"
                        ),
                        Err(e) => warn!(
                            workflow_id = %run,
                            node_id = %node_id,
                            error = %e,
                            "Failed to spawn workflow node"
                        ),
                    }
                }
            }
            WorkflowStep::Finish { status } => {
                match self.store.finish_workflow(run, status, &[]).await {
                    Ok(()) => info!(workflow_id = %run, %status, "Workflow finished"),
                    Err(e) => warn!(workflow_id = %run, error = %e, "Failed to finish workflow"),
                }
            }
            WorkflowStep::Cancel { jobs } => {
                match self.store.finish_workflow(run, Status::Canceled, &jobs).await {
                    Ok(()) => info!(workflow_id = %run, jobs = jobs.len(), "Workflow canceled"),
                    Err(e) => warn!(workflow_id = %run, error = %e, "Failed to cancel workflow"),
                }
            }
        }
    }

    async fn persist(&self, started: &[(WorkItem, Assignment)], report: &mut PassReport) {
        match self.store.persist_assignments(started).await {
            Ok(outcome) => {
                for id in outcome.vanished {
                    let Some((_, assignment)) = started.iter().find(|(item, _)| item.id() == id)
                    else {
                        continue;
                    };
                    debug!(item_id = %id, node = %assignment.node, "Item left pending before its decision was written");
                    report.dispatch_failures.push(DispatchFailure {
                        item_id: id,
                        node: assignment.node.clone(),
                        reason: "no longer pending".to_string(),
                    });
                }
                if outcome.persisted > 0 {
                    info!(persisted = outcome.persisted, "Persisted scheduling decisions");
                }
            }
            Err(e) => {
                warn!(error = %e, started = started.len(), "Failed to persist scheduling decisions");
                let reason = e.to_string();
                report
                    .dispatch_failures
                    .extend(started.iter().map(|(item, assignment)| DispatchFailure {
                        item_id: item.id(),
                        node: assignment.node.clone(),
                        reason: reason.clone(),
                    }));
            }
        }
    }

    /// Fail runs whose prerequisites failed.
    async fn fail_dependents(&self, report: &PassReport) {
        let failures = report.prerequisite_failures();
        if failures.is_empty() {
            return;
        }
        match self.store.fail_items(&failures).await {
            Ok(failed) => info!(failed, "Failed runs whose prerequisites failed"),
            Err(e) => warn!(error = %e, items = failures.len(), "Failed to fail dependent runs"),
        }
    }
}
