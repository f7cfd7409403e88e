//! Work item projections.
//!
//! A projection is the minimal, read-only view of a persisted work item that
//! a scheduling pass needs: identity, kind, resource references, timestamps
//! and capacity cost. Each kind has its own value type; [`WorkItem`] is the
//! closed union over them, so admission and placement match exhaustively.

use chrono::{DateTime, Utc};
use jobplane_id::{
    Hostname, InventoryId, InventorySourceId, ProjectId, TemplateId, WorkItemId,
    WorkflowTemplateId,
};
use serde::{Deserialize, Serialize};

/// Capacity consumed per fork of a template run.
pub const FORK_COST: u32 = 10;

/// Capacity consumed by a project sync.
pub const PROJECT_SYNC_COST: u32 = 10;

/// Capacity consumed by an inventory sync.
pub const INVENTORY_SYNC_COST: u32 = 20;

/// Capacity consumed by an ad-hoc command.
pub const AD_HOC_COMMAND_COST: u32 = 10;

/// Capacity consumed by a system task.
pub const SYSTEM_TASK_COST: u32 = 5;

/// Orchestration overhead of a workflow run on its control node.
pub const WORKFLOW_RUN_COST: u32 = 1;

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Waiting,
    Running,
    Successful,
    Failed,
    Canceled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Waiting or running: holds capacity and blocks resources.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running)
    }

    /// Not yet in a terminal state.
    pub fn is_unfinished(&self) -> bool {
        matches!(self, Self::Pending | Self::Waiting | Self::Running)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "successful" => Ok(Self::Successful),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// How a work item came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchKind {
    Manual,
    Relaunch,
    Callback,
    Scheduled,
    Dependency,
    Workflow,
    Webhook,
    Sync,
    Scm,
}

impl LaunchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Relaunch => "relaunch",
            Self::Callback => "callback",
            Self::Scheduled => "scheduled",
            Self::Dependency => "dependency",
            Self::Workflow => "workflow",
            Self::Webhook => "webhook",
            Self::Sync => "sync",
            Self::Scm => "scm",
        }
    }
}

impl std::str::FromStr for LaunchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "relaunch" => Ok(Self::Relaunch),
            "callback" => Ok(Self::Callback),
            "scheduled" => Ok(Self::Scheduled),
            "dependency" => Ok(Self::Dependency),
            "workflow" => Ok(Self::Workflow),
            "webhook" => Ok(Self::Webhook),
            "sync" => Ok(Self::Sync),
            "scm" => Ok(Self::Scm),
            other => Err(format!("unknown launch kind '{other}'")),
        }
    }
}

/// Discriminant of the [`WorkItem`] union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    ProjectSync,
    InventorySync,
    TemplateRun,
    WorkflowRun,
    SystemTask,
    AdHocCommand,
}

impl WorkItemKind {
    pub const ALL: [WorkItemKind; 6] = [
        Self::ProjectSync,
        Self::InventorySync,
        Self::TemplateRun,
        Self::WorkflowRun,
        Self::SystemTask,
        Self::AdHocCommand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectSync => "project_sync",
            Self::InventorySync => "inventory_sync",
            Self::TemplateRun => "template_run",
            Self::WorkflowRun => "workflow_run",
            Self::SystemTask => "system_task",
            Self::AdHocCommand => "ad_hoc_command",
        }
    }

    /// Which node bucket items of this kind are placed on.
    pub fn capacity_type(&self) -> CapacityType {
        match self {
            Self::ProjectSync | Self::SystemTask | Self::WorkflowRun => CapacityType::Control,
            Self::InventorySync | Self::TemplateRun | Self::AdHocCommand => {
                CapacityType::Execution
            }
        }
    }
}

impl std::fmt::Display for WorkItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown work item kind '{s}'"))
    }
}

/// Node bucket a work item consumes capacity from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityType {
    Control,
    Execution,
}

impl CapacityType {
    /// Evaluation order within a node group.
    pub const ORDER: [CapacityType; 2] = [Self::Control, Self::Execution];
}

impl std::fmt::Display for CapacityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control => f.write_str("control"),
            Self::Execution => f.write_str("execution"),
        }
    }
}

/// Fields shared by every kind of work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Common {
    pub id: WorkItemId,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub launch_kind: LaunchKind,
    /// Node the item is running on, once dispatched.
    pub execution_node: Option<Hostname>,
    /// Node groups the item may run in, most preferred first. Empty means any.
    pub node_groups: Vec<String>,
}

impl Common {
    pub fn new(id: WorkItemId, status: Status, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status,
            created_at,
            finished_at: None,
            launch_kind: LaunchKind::Manual,
            execution_node: None,
            node_groups: Vec::new(),
        }
    }
}

/// Interface shared by every projection.
pub trait Projection {
    fn common(&self) -> &Common;

    fn kind(&self) -> WorkItemKind;

    /// Abstract concurrency units this item consumes on a node. Always > 0.
    fn capacity_cost(&self) -> u32;

    fn id(&self) -> WorkItemId {
        self.common().id
    }

    fn status(&self) -> Status {
        self.common().status
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.common().created_at
    }

    fn capacity_type(&self) -> CapacityType {
        self.kind().capacity_type()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSync {
    pub common: Common,
    pub project_id: ProjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySync {
    pub common: Common,
    pub inventory_source_id: InventorySourceId,
    /// Inventory owning the source.
    pub inventory_id: InventoryId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRun {
    pub common: Common,
    pub template_id: TemplateId,
    pub project_id: ProjectId,
    pub inventory_id: InventoryId,
    pub forks: u32,
    /// Lock the inventory and forbid concurrent runs of the same template.
    pub exclusive: bool,
    /// Sources already synced at launch; no implicit sync is planned for them.
    pub inventory_sources_already_updated: Vec<InventorySourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub common: Common,
    pub workflow_template_id: WorkflowTemplateId,
    pub allow_simultaneous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemTask {
    pub common: Common,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdHocCommand {
    pub common: Common,
    pub inventory_id: InventoryId,
}

impl Projection for ProjectSync {
    fn common(&self) -> &Common {
        &self.common
    }

    fn kind(&self) -> WorkItemKind {
        WorkItemKind::ProjectSync
    }

    fn capacity_cost(&self) -> u32 {
        PROJECT_SYNC_COST
    }
}

impl Projection for InventorySync {
    fn common(&self) -> &Common {
        &self.common
    }

    fn kind(&self) -> WorkItemKind {
        WorkItemKind::InventorySync
    }

    fn capacity_cost(&self) -> u32 {
        INVENTORY_SYNC_COST
    }
}

impl Projection for TemplateRun {
    fn common(&self) -> &Common {
        &self.common
    }

    fn kind(&self) -> WorkItemKind {
        WorkItemKind::TemplateRun
    }

    fn capacity_cost(&self) -> u32 {
        FORK_COST.saturating_mul(self.forks.max(1))
    }
}

impl Projection for WorkflowRun {
    fn common(&self) -> &Common {
        &self.common
    }

    fn kind(&self) -> WorkItemKind {
        WorkItemKind::WorkflowRun
    }

    fn capacity_cost(&self) -> u32 {
        WORKFLOW_RUN_COST
    }
}

impl Projection for SystemTask {
    fn common(&self) -> &Common {
        &self.common
    }

    fn kind(&self) -> WorkItemKind {
        WorkItemKind::SystemTask
    }

    fn capacity_cost(&self) -> u32 {
        SYSTEM_TASK_COST
    }
}

impl Projection for AdHocCommand {
    fn common(&self) -> &Common {
        &self.common
    }

    fn kind(&self) -> WorkItemKind {
        WorkItemKind::AdHocCommand
    }

    fn capacity_cost(&self) -> u32 {
        AD_HOC_COMMAND_COST
    }
}

/// Any schedulable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    ProjectSync(ProjectSync),
    InventorySync(InventorySync),
    TemplateRun(TemplateRun),
    WorkflowRun(WorkflowRun),
    SystemTask(SystemTask),
    AdHocCommand(AdHocCommand),
}

impl WorkItem {
    fn as_projection(&self) -> &dyn Projection {
        match self {
            Self::ProjectSync(item) => item,
            Self::InventorySync(item) => item,
            Self::TemplateRun(item) => item,
            Self::WorkflowRun(item) => item,
            Self::SystemTask(item) => item,
            Self::AdHocCommand(item) => item,
        }
    }

    pub fn common_mut(&mut self) -> &mut Common {
        match self {
            Self::ProjectSync(item) => &mut item.common,
            Self::InventorySync(item) => &mut item.common,
            Self::TemplateRun(item) => &mut item.common,
            Self::WorkflowRun(item) => &mut item.common,
            Self::SystemTask(item) => &mut item.common,
            Self::AdHocCommand(item) => &mut item.common,
        }
    }

    /// Node the item runs on, if it has been dispatched.
    pub fn execution_node(&self) -> Option<&Hostname> {
        self.common().execution_node.as_ref()
    }

    /// Whether this item may be placed in `group`.
    ///
    /// Control-typed items only ever run in the control-plane group;
    /// execution-typed items follow their preferred groups, any group when
    /// none are set.
    pub fn in_scope_of(&self, group: &str, control_plane_group: &str) -> bool {
        match self.capacity_type() {
            CapacityType::Control => group == control_plane_group,
            CapacityType::Execution => {
                let preferred = &self.common().node_groups;
                preferred.is_empty() || preferred.iter().any(|name| name == group)
            }
        }
    }
}

impl Projection for WorkItem {
    fn common(&self) -> &Common {
        self.as_projection().common()
    }

    fn kind(&self) -> WorkItemKind {
        self.as_projection().kind()
    }

    fn capacity_cost(&self) -> u32 {
        self.as_projection().capacity_cost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn common(id: i64) -> Common {
        Common::new(
            WorkItemId::new(id),
            Status::Pending,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn template_run(forks: u32) -> WorkItem {
        WorkItem::TemplateRun(TemplateRun {
            common: common(1),
            template_id: TemplateId::new(1),
            project_id: ProjectId::new(1),
            inventory_id: InventoryId::new(1),
            forks,
            exclusive: false,
            inventory_sources_already_updated: Vec::new(),
        })
    }

    #[rstest]
    #[case(0, 10)]
    #[case(1, 10)]
    #[case(5, 50)]
    #[case(25, 250)]
    fn test_template_run_cost_scales_with_forks(#[case] forks: u32, #[case] expected: u32) {
        assert_eq!(template_run(forks).capacity_cost(), expected);
    }

    #[test]
    fn test_fixed_costs() {
        let project_sync = WorkItem::ProjectSync(ProjectSync {
            common: common(2),
            project_id: ProjectId::new(1),
        });
        let inventory_sync = WorkItem::InventorySync(InventorySync {
            common: common(3),
            inventory_source_id: InventorySourceId::new(1),
            inventory_id: InventoryId::new(1),
        });
        let system_task = WorkItem::SystemTask(SystemTask { common: common(4) });

        assert_eq!(project_sync.capacity_cost(), 10);
        assert_eq!(inventory_sync.capacity_cost(), 20);
        assert_eq!(system_task.capacity_cost(), SYSTEM_TASK_COST);
    }

    #[test]
    fn test_every_kind_has_positive_cost() {
        assert!(template_run(u32::MAX).capacity_cost() > 0);
        for cost in [
            PROJECT_SYNC_COST,
            INVENTORY_SYNC_COST,
            AD_HOC_COMMAND_COST,
            SYSTEM_TASK_COST,
            WORKFLOW_RUN_COST,
        ] {
            assert!(cost > 0);
        }
    }

    #[test]
    fn test_capacity_types() {
        assert_eq!(
            WorkItemKind::ProjectSync.capacity_type(),
            CapacityType::Control
        );
        assert_eq!(
            WorkItemKind::SystemTask.capacity_type(),
            CapacityType::Control
        );
        assert_eq!(
            WorkItemKind::InventorySync.capacity_type(),
            CapacityType::Execution
        );
        assert_eq!(template_run(1).capacity_type(), CapacityType::Execution);
    }

    #[test]
    fn test_scope_for_control_items_is_control_plane_only() {
        let mut item = ProjectSync {
            common: common(5),
            project_id: ProjectId::new(1),
        };
        item.common.node_groups = vec!["east".to_string()];
        let item = WorkItem::ProjectSync(item);

        assert!(item.in_scope_of("controlplane", "controlplane"));
        assert!(!item.in_scope_of("east", "controlplane"));
    }

    #[test]
    fn test_scope_for_execution_items_follows_preferences() {
        let unrestricted = template_run(1);
        assert!(unrestricted.in_scope_of("east", "controlplane"));

        let WorkItem::TemplateRun(mut run) = template_run(1) else {
            unreachable!()
        };
        run.common.node_groups = vec!["west".to_string()];
        let restricted = WorkItem::TemplateRun(run);
        assert!(restricted.in_scope_of("west", "controlplane"));
        assert!(!restricted.in_scope_of("east", "controlplane"));
    }

    #[test]
    fn test_kind_parse() {
        for kind in WorkItemKind::ALL {
            assert_eq!(kind.as_str().parse::<WorkItemKind>().unwrap(), kind);
        }
        assert!("job".parse::<WorkItemKind>().is_err());
    }

    #[test]
    fn test_status_classes() {
        assert!(Status::Running.is_active());
        assert!(Status::Waiting.is_active());
        assert!(!Status::Pending.is_active());
        assert!(Status::Pending.is_unfinished());
        assert!(!Status::Canceled.is_unfinished());
        assert_eq!("failed".parse::<Status>().unwrap(), Status::Failed);
    }

    #[test]
    fn test_serialized_form_is_tagged() {
        let json = serde_json::to_value(template_run(2)).unwrap();
        assert_eq!(json["kind"], "template_run");
        assert_eq!(json["common"]["id"], "item_1");
    }
}
