//! Workflow graph progress.
//!
//! A running workflow run owns a graph of nodes. Each node names a template
//! to launch and, once spawned, the work item it launched. Edges say which
//! children follow a node: on success, on failure, or always. Every pass the
//! host asks each running workflow for its [`WorkflowStep`]: spawn the nodes
//! that became ready, finish the run, or cancel what is left of it.
//!
//! Traversal starts at the root nodes (nodes nobody points at) and only
//! follows edges out of finished jobs, so a child is never spawned before its
//! parent's outcome is known.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use jobplane_id::{
    InventoryId, InventorySourceId, ProjectId, TemplateId, WorkItemId, WorkflowNodeId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::work_item::{
    Common, InventorySync, LaunchKind, ProjectSync, Status, TemplateRun, WorkItem, WorkItemKind,
};

/// When a child follows its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Success,
    Failure,
    Always,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Always => "always",
        }
    }

    /// Whether the edge is taken once the parent's job ended in `status`.
    ///
    /// Canceled jobs take no edge.
    pub fn follows(&self, status: Status) -> bool {
        match (self, status) {
            (Self::Always, Status::Successful | Status::Failed) => true,
            (Self::Success, Status::Successful) => true,
            (Self::Failure, Status::Failed) => true,
            _ => false,
        }
    }
}

impl std::str::FromStr for EdgeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "always" => Ok(Self::Always),
            other => Err(format!("unknown edge kind '{other}'")),
        }
    }
}

/// What a workflow node launches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeTemplate {
    TemplateRun {
        template_id: TemplateId,
        project_id: ProjectId,
        inventory_id: InventoryId,
        forks: u32,
        exclusive: bool,
    },
    ProjectSync {
        project_id: ProjectId,
    },
    InventorySync {
        inventory_source_id: InventorySourceId,
        inventory_id: InventoryId,
    },
}

impl NodeTemplate {
    pub fn kind(&self) -> WorkItemKind {
        match self {
            Self::TemplateRun { .. } => WorkItemKind::TemplateRun,
            Self::ProjectSync { .. } => WorkItemKind::ProjectSync,
            Self::InventorySync { .. } => WorkItemKind::InventorySync,
        }
    }

    /// The pending item launched for this node.
    pub fn work_item(&self, id: WorkItemId, created_at: DateTime<Utc>) -> WorkItem {
        let mut common = Common::new(id, Status::Pending, created_at);
        common.launch_kind = LaunchKind::Workflow;

        match self {
            Self::TemplateRun {
                template_id,
                project_id,
                inventory_id,
                forks,
                exclusive,
            } => WorkItem::TemplateRun(TemplateRun {
                common,
                template_id: *template_id,
                project_id: *project_id,
                inventory_id: *inventory_id,
                forks: *forks,
                exclusive: *exclusive,
                inventory_sources_already_updated: Vec::new(),
            }),
            Self::ProjectSync { project_id } => WorkItem::ProjectSync(ProjectSync {
                common,
                project_id: *project_id,
            }),
            Self::InventorySync {
                inventory_source_id,
                inventory_id,
            } => WorkItem::InventorySync(InventorySync {
                common,
                inventory_source_id: *inventory_source_id,
                inventory_id: *inventory_id,
            }),
        }
    }
}

/// One node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: WorkflowNodeId,
    /// `None` when the template it pointed at no longer exists.
    pub template: Option<NodeTemplate>,
    /// The spawned item and its current status.
    pub job: Option<(WorkItemId, Status)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub parent: WorkflowNodeId,
    pub child: WorkflowNodeId,
    pub kind: EdgeKind,
}

/// Whether a workflow still has work ahead of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowProgress {
    Running,
    /// Successful or failed.
    Finished(Status),
}

/// The node graph of one workflow run.
#[derive(Debug, Clone, Default)]
pub struct WorkflowDag {
    nodes: BTreeMap<WorkflowNodeId, WorkflowNode>,
    edges: BTreeMap<WorkflowNodeId, Vec<(EdgeKind, WorkflowNodeId)>>,
}

impl WorkflowDag {
    /// Edges naming unknown nodes are dropped.
    pub fn new(nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) -> Self {
        let nodes: BTreeMap<WorkflowNodeId, WorkflowNode> =
            nodes.into_iter().map(|node| (node.id, node)).collect();

        let mut by_parent: BTreeMap<WorkflowNodeId, Vec<(EdgeKind, WorkflowNodeId)>> =
            BTreeMap::new();
        for edge in edges {
            if nodes.contains_key(&edge.parent) && nodes.contains_key(&edge.child) {
                by_parent
                    .entry(edge.parent)
                    .or_default()
                    .push((edge.kind, edge.child));
            }
        }
        for children in by_parent.values_mut() {
            children.sort();
            children.dedup();
        }

        Self {
            nodes,
            edges: by_parent,
        }
    }

    pub fn node(&self, id: WorkflowNodeId) -> Option<&WorkflowNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes no edge points at, by id.
    fn roots(&self) -> Vec<WorkflowNodeId> {
        let children: HashSet<WorkflowNodeId> = self
            .edges
            .values()
            .flatten()
            .map(|(_, child)| *child)
            .collect();
        self.nodes
            .keys()
            .copied()
            .filter(|id| !children.contains(id))
            .collect()
    }

    /// Children reached once `node`'s job ended in `status`.
    fn next(&self, node: WorkflowNodeId, status: Status) -> impl Iterator<Item = WorkflowNodeId> + '_ {
        self.edges
            .get(&node)
            .into_iter()
            .flatten()
            .filter(move |(kind, _)| kind.follows(status))
            .map(|(_, child)| *child)
    }

    /// Whether `node` has an edge that handles its job failing.
    fn handles_failure(&self, node: WorkflowNodeId) -> bool {
        self.next(node, Status::Failed).next().is_some()
    }

    /// Walk the reachable part of the graph breadth first, calling `visit`
    /// once per node. `visit` returns the status whose edges to follow, or
    /// `None` to stop at that node.
    fn walk(&self, mut visit: impl FnMut(&WorkflowNode) -> Option<Status>) {
        let mut queue: VecDeque<WorkflowNodeId> = self.roots().into();
        let mut seen: BTreeSet<WorkflowNodeId> = queue.iter().copied().collect();

        while let Some(id) = queue.pop_front() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let Some(status) = visit(node) else {
                continue;
            };
            for child in self.next(id, status) {
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }

    /// Reachable nodes with nothing spawned yet, in traversal order.
    ///
    /// Nodes whose template is gone are skipped; they count against the
    /// workflow in [`Self::progress`].
    pub fn nodes_to_run(&self) -> Vec<&WorkflowNode> {
        let mut ready = Vec::new();
        self.walk(|node| match node.job {
            None => {
                if node.template.is_some() {
                    ready.push(node.id);
                }
                None
            }
            Some((_, status)) if status.is_unfinished() => None,
            Some((_, status)) => Some(status),
        });
        ready.iter().filter_map(|id| self.nodes.get(id)).collect()
    }

    /// Whether the workflow is done and how it ended.
    ///
    /// It is done once no reachable node is unspawned or unfinished. It
    /// failed if a reachable node could not run, a job was canceled, or a
    /// job failed with no failure or always edge to handle it.
    pub fn progress(&self) -> WorkflowProgress {
        let mut running = false;
        let mut failed = false;

        self.walk(|node| {
            if node.template.is_none() && node.job.is_none() {
                failed = true;
                return None;
            }
            match node.job {
                None => {
                    running = true;
                    None
                }
                Some((_, status)) if status.is_unfinished() => {
                    running = true;
                    None
                }
                Some((_, Status::Canceled)) => {
                    failed = true;
                    None
                }
                Some((_, Status::Failed)) => {
                    if !self.handles_failure(node.id) {
                        failed = true;
                    }
                    Some(Status::Failed)
                }
                Some((_, status)) => Some(status),
            }
        });

        if running {
            WorkflowProgress::Running
        } else if failed {
            WorkflowProgress::Finished(Status::Failed)
        } else {
            WorkflowProgress::Finished(Status::Successful)
        }
    }

    /// Spawned jobs that have not finished.
    pub fn unfinished_jobs(&self) -> Vec<WorkItemId> {
        self.nodes
            .values()
            .filter_map(|node| node.job)
            .filter(|(_, status)| status.is_unfinished())
            .map(|(id, _)| id)
            .collect()
    }
}

/// A running workflow run as loaded for one pass.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub run_id: WorkItemId,
    pub cancel_requested: bool,
    pub dag: WorkflowDag,
}

/// What the host does with a running workflow this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStep {
    /// Mark the run canceled and cancel its unfinished jobs.
    Cancel { jobs: Vec<WorkItemId> },
    /// Mark the run successful or failed.
    Finish { status: Status },
    /// Launch these nodes; empty while jobs are still running.
    Spawn { nodes: Vec<WorkflowNodeId> },
}

impl WorkflowState {
    pub fn next_step(&self) -> WorkflowStep {
        if self.cancel_requested {
            return WorkflowStep::Cancel {
                jobs: self.dag.unfinished_jobs(),
            };
        }
        match self.dag.progress() {
            WorkflowProgress::Finished(status) => WorkflowStep::Finish { status },
            WorkflowProgress::Running => WorkflowStep::Spawn {
                nodes: self.dag.nodes_to_run().iter().map(|node| node.id).collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: i64) -> WorkflowNodeId {
        WorkflowNodeId::new(n)
    }

    fn sync_node(n: i64, job: Option<Status>) -> WorkflowNode {
        WorkflowNode {
            id: id(n),
            template: Some(NodeTemplate::ProjectSync {
                project_id: ProjectId::new(n),
            }),
            job: job.map(|status| (WorkItemId::new(100 + n), status)),
        }
    }

    fn edge(parent: i64, child: i64, kind: EdgeKind) -> WorkflowEdge {
        WorkflowEdge {
            parent: id(parent),
            child: id(child),
            kind,
        }
    }

    fn ready(dag: &WorkflowDag) -> Vec<WorkflowNodeId> {
        dag.nodes_to_run().iter().map(|node| node.id).collect()
    }

    /// 1 --success--> 2, 1 --failure--> 3, 2 --always--> 4
    fn diamond(first: Option<Status>, second: Option<Status>) -> WorkflowDag {
        WorkflowDag::new(
            vec![
                sync_node(1, first),
                sync_node(2, second),
                sync_node(3, None),
                sync_node(4, None),
            ],
            vec![
                edge(1, 2, EdgeKind::Success),
                edge(1, 3, EdgeKind::Failure),
                edge(2, 4, EdgeKind::Always),
            ],
        )
    }

    #[test]
    fn test_roots_run_first() {
        let dag = diamond(None, None);
        assert_eq!(ready(&dag), vec![id(1)]);
        assert_eq!(dag.progress(), WorkflowProgress::Running);
    }

    #[test]
    fn test_children_wait_for_parent_to_finish() {
        assert!(ready(&diamond(Some(Status::Running), None)).is_empty());
        assert!(ready(&diamond(Some(Status::Pending), None)).is_empty());
    }

    #[test]
    fn test_edges_follow_the_parent_outcome() {
        assert_eq!(ready(&diamond(Some(Status::Successful), None)), vec![id(2)]);
        assert_eq!(ready(&diamond(Some(Status::Failed), None)), vec![id(3)]);
        assert_eq!(
            ready(&diamond(Some(Status::Successful), Some(Status::Failed))),
            vec![id(4)]
        );
    }

    #[test]
    fn test_canceled_job_takes_no_edge_and_fails_the_workflow() {
        let dag = diamond(Some(Status::Canceled), None);
        assert!(ready(&dag).is_empty());
        assert_eq!(dag.progress(), WorkflowProgress::Finished(Status::Failed));
    }

    #[test]
    fn test_successful_path_finishes_successful() {
        let mut dag = diamond(Some(Status::Successful), Some(Status::Successful));
        assert_eq!(dag.progress(), WorkflowProgress::Running);

        dag.nodes.insert(id(4), sync_node(4, Some(Status::Successful)));
        assert_eq!(dag.progress(), WorkflowProgress::Finished(Status::Successful));
    }

    #[test]
    fn test_handled_failure_does_not_fail_the_workflow() {
        let mut dag = diamond(Some(Status::Failed), None);
        dag.nodes.insert(id(3), sync_node(3, Some(Status::Successful)));
        assert_eq!(dag.progress(), WorkflowProgress::Finished(Status::Successful));
    }

    #[test]
    fn test_unhandled_failure_fails_the_workflow() {
        let dag = WorkflowDag::new(vec![sync_node(1, Some(Status::Failed))], Vec::new());
        assert_eq!(dag.progress(), WorkflowProgress::Finished(Status::Failed));
    }

    #[test]
    fn test_missing_template_is_skipped_and_fails_the_workflow() {
        let mut orphan = sync_node(2, None);
        orphan.template = None;
        let dag = WorkflowDag::new(vec![sync_node(1, Some(Status::Successful)), orphan], Vec::new());

        assert!(ready(&dag).is_empty());
        assert_eq!(dag.progress(), WorkflowProgress::Finished(Status::Failed));
    }

    #[test]
    fn test_empty_workflow_succeeds() {
        let dag = WorkflowDag::new(Vec::new(), Vec::new());
        assert!(dag.is_empty());
        assert_eq!(dag.progress(), WorkflowProgress::Finished(Status::Successful));
    }

    #[test]
    fn test_shared_child_is_spawned_once() {
        let dag = WorkflowDag::new(
            vec![
                sync_node(1, Some(Status::Successful)),
                sync_node(2, Some(Status::Successful)),
                sync_node(3, None),
            ],
            vec![
                edge(1, 3, EdgeKind::Success),
                edge(2, 3, EdgeKind::Always),
                edge(9, 3, EdgeKind::Always),
            ],
        );
        assert_eq!(ready(&dag), vec![id(3)]);
    }

    #[test]
    fn test_node_launches_a_pending_workflow_item() {
        use crate::work_item::Projection;

        let template = NodeTemplate::TemplateRun {
            template_id: TemplateId::new(4),
            project_id: ProjectId::new(2),
            inventory_id: InventoryId::new(3),
            forks: 5,
            exclusive: true,
        };
        let item = template.work_item(WorkItemId::new(9), DateTime::<Utc>::UNIX_EPOCH);

        assert_eq!(item.kind(), template.kind());
        assert_eq!(item.status(), Status::Pending);
        assert_eq!(item.common().launch_kind, LaunchKind::Workflow);
        assert_eq!(item.capacity_cost(), 50);
    }

    #[test]
    fn test_next_step() {
        let running = WorkflowState {
            run_id: WorkItemId::new(1),
            cancel_requested: false,
            dag: diamond(Some(Status::Successful), Some(Status::Running)),
        };
        assert_eq!(running.next_step(), WorkflowStep::Spawn { nodes: Vec::new() });

        let canceled = WorkflowState {
            cancel_requested: true,
            ..running.clone()
        };
        assert_eq!(
            canceled.next_step(),
            WorkflowStep::Cancel {
                jobs: vec![WorkItemId::new(102)]
            }
        );

        let done = WorkflowState {
            run_id: WorkItemId::new(1),
            cancel_requested: false,
            dag: WorkflowDag::new(vec![sync_node(1, Some(Status::Successful))], Vec::new()),
        };
        assert_eq!(
            done.next_step(),
            WorkflowStep::Finish {
                status: Status::Successful
            }
        );
    }
}
