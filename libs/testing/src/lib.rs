//! Fixture builders for scheduling tests.
//!
//! Timestamps are offsets in seconds from a fixed epoch so that creation
//! order is explicit in every test.

use chrono::{DateTime, Duration, TimeZone, Utc};
use jobplane_id::{
    Hostname, InventoryId, InventorySourceId, ProjectId, TemplateId, WorkItemId,
    WorkflowTemplateId,
};
use jobplane_scheduling::work_item::{
    AdHocCommand, Common, InventorySync, ProjectSync, SystemTask, TemplateRun, WorkflowRun,
};
use jobplane_scheduling::{Node, NodeGroup, NodeRole, PassSnapshot, Status, WorkItem};

/// Fixed reference time for fixtures.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0)
        .single()
        .unwrap_or_default()
}

/// `epoch()` plus `secs`.
pub fn at(secs: i64) -> DateTime<Utc> {
    epoch() + Duration::seconds(secs)
}

/// Panics on invalid input; fixtures only.
pub fn host(name: &str) -> Hostname {
    match Hostname::parse(name) {
        Ok(hostname) => hostname,
        Err(err) => panic!("invalid fixture hostname {name:?}: {err}"),
    }
}

pub fn node(name: &str, role: NodeRole, capacity: u32) -> Node {
    Node::new(host(name), role, capacity)
}

pub fn group(name: &str, members: &[&str]) -> NodeGroup {
    NodeGroup::new(name, members.iter().map(|m| host(m)).collect())
}

fn common(id: i64, created: i64) -> Common {
    Common::new(WorkItemId::new(id), Status::Pending, at(created))
}

// =============================================================================
// Work item builders
// =============================================================================

/// Builder for a pending work item of any kind.
#[derive(Debug, Clone)]
pub struct ItemBuilder {
    item: WorkItem,
}

impl ItemBuilder {
    pub fn status(mut self, status: Status) -> Self {
        self.common_mut().status = status;
        self
    }

    /// Mark the item running on `node`.
    pub fn running_on(mut self, node: &str) -> Self {
        let common = self.common_mut();
        common.status = Status::Running;
        common.execution_node = Some(host(node));
        self
    }

    /// Mark the item waiting on `node`.
    pub fn waiting_on(mut self, node: &str) -> Self {
        let common = self.common_mut();
        common.status = Status::Waiting;
        common.execution_node = Some(host(node));
        self
    }

    pub fn node_groups(mut self, groups: &[&str]) -> Self {
        self.common_mut().node_groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    /// Template runs only.
    pub fn exclusive(mut self) -> Self {
        if let WorkItem::TemplateRun(run) = &mut self.item {
            run.exclusive = true;
        }
        self
    }

    /// Template runs only.
    pub fn already_updated(mut self, sources: &[i64]) -> Self {
        if let WorkItem::TemplateRun(run) = &mut self.item {
            run.inventory_sources_already_updated =
                sources.iter().copied().map(InventorySourceId::new).collect();
        }
        self
    }

    /// Workflow runs only.
    pub fn allow_simultaneous(mut self) -> Self {
        if let WorkItem::WorkflowRun(run) = &mut self.item {
            run.allow_simultaneous = true;
        }
        self
    }

    pub fn build(self) -> WorkItem {
        self.item
    }

    fn common_mut(&mut self) -> &mut Common {
        self.item.common_mut()
    }
}

impl From<ItemBuilder> for WorkItem {
    fn from(builder: ItemBuilder) -> Self {
        builder.build()
    }
}

pub fn template_run(id: i64, project: i64, inventory: i64, forks: u32, created: i64) -> ItemBuilder {
    ItemBuilder {
        item: WorkItem::TemplateRun(TemplateRun {
            common: common(id, created),
            template_id: TemplateId::new(1),
            project_id: ProjectId::new(project),
            inventory_id: InventoryId::new(inventory),
            forks,
            exclusive: false,
            inventory_sources_already_updated: Vec::new(),
        }),
    }
}

pub fn project_sync(id: i64, project: i64, created: i64) -> ItemBuilder {
    ItemBuilder {
        item: WorkItem::ProjectSync(ProjectSync {
            common: common(id, created),
            project_id: ProjectId::new(project),
        }),
    }
}

pub fn inventory_sync(id: i64, source: i64, inventory: i64, created: i64) -> ItemBuilder {
    ItemBuilder {
        item: WorkItem::InventorySync(InventorySync {
            common: common(id, created),
            inventory_source_id: InventorySourceId::new(source),
            inventory_id: InventoryId::new(inventory),
        }),
    }
}

pub fn workflow_run(id: i64, template: i64, created: i64) -> ItemBuilder {
    ItemBuilder {
        item: WorkItem::WorkflowRun(WorkflowRun {
            common: common(id, created),
            workflow_template_id: WorkflowTemplateId::new(template),
            allow_simultaneous: false,
        }),
    }
}

pub fn system_task(id: i64, created: i64) -> ItemBuilder {
    ItemBuilder {
        item: WorkItem::SystemTask(SystemTask {
            common: common(id, created),
        }),
    }
}

pub fn ad_hoc_command(id: i64, inventory: i64, created: i64) -> ItemBuilder {
    ItemBuilder {
        item: WorkItem::AdHocCommand(AdHocCommand {
            common: common(id, created),
            inventory_id: InventoryId::new(inventory),
        }),
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Builder for a [`PassSnapshot`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder {
    snapshot: PassSnapshot,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: Node) -> Self {
        self.snapshot.nodes.push(node);
        self
    }

    pub fn group(mut self, group: NodeGroup) -> Self {
        self.snapshot.node_groups.push(group);
        self
    }

    pub fn active(mut self, item: impl Into<WorkItem>) -> Self {
        self.snapshot.active.push(item.into());
        self
    }

    pub fn pending(mut self, item: impl Into<WorkItem>) -> Self {
        self.snapshot.pending.push(item.into());
        self
    }

    pub fn build(self) -> PassSnapshot {
        self.snapshot
    }
}
