//! In-memory scheduler store for host tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use jobplane_id::{WorkItemId, WorkflowNodeId};
use jobplane_scheduling::dependencies::{DependencyCatalog, NewPrerequisite};
use jobplane_scheduling::{
    Assignment, Node, NodeGroup, NodeTemplate, PassReport, Projection, Status, WorkItem,
    WorkItemKind, WorkflowDag, WorkflowEdge, WorkflowNode, WorkflowState,
};

use super::store::{dispatched_status, PersistOutcome, SchedulerStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub(crate) struct MemoryWorkflow {
    pub run_id: WorkItemId,
    pub cancel_requested: bool,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

#[derive(Default)]
pub(crate) struct State {
    pub items: Vec<WorkItem>,
    pub nodes: Vec<Node>,
    pub groups: Vec<NodeGroup>,
    pub catalog: DependencyCatalog,
    pub prerequisites: Vec<(WorkItemId, WorkItemId)>,
    pub workflows: Vec<MemoryWorkflow>,
    pub explanations: HashMap<WorkItemId, String>,
    /// Waiting or running items flagged for cancellation.
    pub cancel_flags: Vec<WorkItemId>,
    /// Passes that started loading state.
    pub attempts: usize,
    /// Passes whose report was recorded.
    pub passes: usize,
    pub fail_load: bool,
    pub fail_persist: bool,
    pub next_id: i64,
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<State>,
}

fn store_error() -> StoreError {
    StoreError::Sqlx(sqlx::Error::PoolClosed)
}

impl MemoryStore {
    /// New items get ids from 101 up.
    pub fn with(nodes: Vec<Node>, groups: Vec<NodeGroup>, items: Vec<WorkItem>) -> Arc<Self> {
        let store = Self::default();
        {
            let mut state = store.state();
            state.next_id = 100;
            state.nodes = nodes;
            state.groups = groups;
            state.items = items;
        }
        Arc::new(store)
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn status_of(&self, id: i64) -> Status {
        self.item(id).status()
    }

    pub fn item(&self, id: i64) -> WorkItem {
        self.state()
            .items
            .iter()
            .find(|item| item.id() == WorkItemId::new(id))
            .cloned()
            .unwrap()
    }

    pub fn set_status(&self, id: i64, status: Status) {
        let mut state = self.state();
        if let Some(item) = state.items.iter_mut().find(|i| i.id() == WorkItemId::new(id)) {
            item.common_mut().status = status;
        }
    }

    fn list(&self, keep: impl Fn(&WorkItem) -> bool) -> Vec<WorkItem> {
        self.state().items.iter().filter(|i| keep(i)).cloned().collect()
    }
}

impl State {
    fn status(&self, id: WorkItemId) -> Option<Status> {
        self.items.iter().find(|i| i.id() == id).map(|i| i.status())
    }

    fn item_mut(&mut self, id: WorkItemId) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|i| i.id() == id)
    }
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn list_pending(&self, kind: WorkItemKind) -> StoreResult<Vec<WorkItem>> {
        Ok(self.list(|item| item.kind() == kind && item.status() == Status::Pending))
    }

    async fn list_running_and_waiting(&self, kind: WorkItemKind) -> StoreResult<Vec<WorkItem>> {
        Ok(self.list(|item| item.kind() == kind && item.status().is_active()))
    }

    async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        Ok(self.state().nodes.clone())
    }

    async fn list_node_groups(&self) -> StoreResult<Vec<NodeGroup>> {
        Ok(self.state().groups.clone())
    }

    async fn load_dependency_catalog(&self, _pending: &[WorkItem]) -> StoreResult<DependencyCatalog> {
        let state = self.state();
        let mut catalog = state.catalog.clone();
        for (item, prerequisite) in &state.prerequisites {
            catalog
                .recorded
                .entry(*item)
                .or_default()
                .push((*prerequisite, state.status(*prerequisite)));
        }
        Ok(catalog)
    }

    async fn create_prerequisite(&self, prerequisite: &NewPrerequisite) -> StoreResult<WorkItem> {
        let NewPrerequisite::ProjectSync { project_id, .. } = prerequisite else {
            return Err(store_error());
        };
        let mut state = self.state();
        state.next_id += 1;
        // Offsets are relative to the fixture epoch; creation time only needs
        // to sort before the dependent run here.
        let item = jobplane_testing::project_sync(state.next_id, project_id.value(), -1).build();
        state.items.push(item.clone());
        Ok(item)
    }

    async fn record_prerequisites(
        &self,
        item: WorkItemId,
        prerequisites: &[WorkItemId],
    ) -> StoreResult<()> {
        let mut state = self.state();
        for prerequisite in prerequisites {
            state.prerequisites.push((item, *prerequisite));
        }
        Ok(())
    }

    async fn fail_items(&self, failures: &[(WorkItemId, String)]) -> StoreResult<usize> {
        let mut state = self.state();
        let mut failed = 0;
        for (id, explanation) in failures {
            let Some(item) = state.item_mut(*id) else {
                continue;
            };
            if item.status() != Status::Pending {
                continue;
            }
            let common = item.common_mut();
            common.status = Status::Failed;
            common.finished_at = Some(Utc::now());
            state.explanations.insert(*id, explanation.clone());
            failed += 1;
        }
        Ok(failed)
    }

    async fn load_running_workflows(&self) -> StoreResult<Vec<WorkflowState>> {
        let mut state = self.state();
        state.attempts += 1;
        if state.fail_load {
            return Err(store_error());
        }

        let mut running = Vec::new();
        for workflow in &state.workflows {
            if state.status(workflow.run_id) != Some(Status::Running) {
                continue;
            }
            let nodes = workflow
                .nodes
                .iter()
                .cloned()
                .map(|mut node| {
                    node.job = node
                        .job
                        .and_then(|(id, _)| state.status(id).map(|status| (id, status)));
                    node
                })
                .collect();
            running.push(WorkflowState {
                run_id: workflow.run_id,
                cancel_requested: workflow.cancel_requested,
                dag: WorkflowDag::new(nodes, workflow.edges.clone()),
            });
        }
        Ok(running)
    }

    async fn spawn_workflow_node(
        &self,
        run: WorkItemId,
        node: WorkflowNodeId,
        template: &NodeTemplate,
    ) -> StoreResult<WorkItem> {
        let mut state = self.state();
        state.next_id += 1;
        let item = template.work_item(WorkItemId::new(state.next_id), Utc::now());

        let slot = state
            .workflows
            .iter_mut()
            .filter(|w| w.run_id == run)
            .flat_map(|w| w.nodes.iter_mut())
            .find(|n| n.id == node)
            .ok_or_else(store_error)?;
        slot.job = Some((item.id(), Status::Pending));

        state.items.push(item.clone());
        Ok(item)
    }

    async fn finish_workflow(
        &self,
        run: WorkItemId,
        status: Status,
        cancel: &[WorkItemId],
    ) -> StoreResult<()> {
        let mut state = self.state();
        for id in cancel {
            match state.status(*id) {
                Some(Status::Pending) => {
                    if let Some(item) = state.item_mut(*id) {
                        item.common_mut().status = Status::Canceled;
                    }
                }
                Some(current) if current.is_active() => state.cancel_flags.push(*id),
                _ => {}
            }
        }
        let item = state.item_mut(run).ok_or_else(store_error)?;
        let common = item.common_mut();
        common.status = status;
        common.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn persist_assignments(&self, started: &[(WorkItem, Assignment)]) -> StoreResult<PersistOutcome> {
        let mut state = self.state();
        if state.fail_persist {
            return Err(store_error());
        }
        let mut outcome = PersistOutcome::default();
        for (decided, assignment) in started {
            let Some(item) = state.item_mut(decided.id()) else {
                outcome.vanished.push(decided.id());
                continue;
            };
            let common = item.common_mut();
            common.status = dispatched_status(decided.kind());
            common.execution_node = Some(assignment.node.clone());
            outcome.persisted += 1;
        }
        Ok(outcome)
    }

    async fn record_pass(&self, _report: &PassReport) -> StoreResult<()> {
        self.state().passes += 1;
        Ok(())
    }
}
