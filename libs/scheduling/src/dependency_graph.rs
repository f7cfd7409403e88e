//! Per-pass admission control.
//!
//! The graph records which logical resources are busy. It is rebuilt from
//! scratch at the start of every pass and only ever moves a key from free to
//! blocked, so an answer of "blocked" stays true for the rest of the pass.

use std::collections::HashSet;

use jobplane_id::{InventoryId, InventorySourceId, ProjectId, TemplateId, WorkflowTemplateId};
use serde::Serialize;
use tracing::debug;

use crate::work_item::{Projection, WorkItem};

/// A logical resource that work items contend for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "resource", content = "id", rename_all = "snake_case")]
pub enum ResourceKey {
    Project(ProjectId),
    Inventory(InventoryId),
    InventorySource(InventorySourceId),
    Template(TemplateId),
    WorkflowTemplate(WorkflowTemplateId),
    /// Singleton key shared by all system tasks.
    System,
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Project(id) => write!(f, "{id}"),
            Self::Inventory(id) => write!(f, "{id}"),
            Self::InventorySource(id) => write!(f, "{id}"),
            Self::Template(id) => write!(f, "{id}"),
            Self::WorkflowTemplate(id) => write!(f, "{id}"),
            Self::System => f.write_str("system"),
        }
    }
}

/// Blocked-resource set owned by a single scheduling pass.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    blocked: HashSet<ResourceKey>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark every already waiting or running item before any pending item is
    /// evaluated.
    pub fn seed<'a, I>(&mut self, items: I)
    where
        I: IntoIterator<Item = &'a WorkItem>,
    {
        for item in items {
            if item.status().is_active() {
                self.mark(item);
            } else {
                debug!(item_id = %item.id(), status = %item.status(), "Not seeding inactive item");
            }
        }
    }

    /// Record that `item` now holds its resources.
    pub fn mark(&mut self, item: &WorkItem) {
        for key in Self::claimed_keys(item) {
            self.blocked.insert(key);
        }
    }

    /// Whether `item` contends with anything marked so far in this pass.
    pub fn is_blocked(&self, item: &WorkItem) -> bool {
        match item {
            WorkItem::TemplateRun(run) => {
                self.is_key_blocked(&ResourceKey::Project(run.project_id))
                    || self.is_key_blocked(&ResourceKey::Inventory(run.inventory_id))
                    || (run.exclusive
                        && self.is_key_blocked(&ResourceKey::Template(run.template_id)))
            }
            WorkItem::InventorySync(sync) => {
                self.is_key_blocked(&ResourceKey::InventorySource(sync.inventory_source_id))
            }
            WorkItem::ProjectSync(sync) => {
                self.is_key_blocked(&ResourceKey::Project(sync.project_id))
            }
            WorkItem::WorkflowRun(run) => {
                !run.allow_simultaneous
                    && self.is_key_blocked(&ResourceKey::WorkflowTemplate(run.workflow_template_id))
            }
            WorkItem::SystemTask(_) => self.is_key_blocked(&ResourceKey::System),
            WorkItem::AdHocCommand(command) => {
                self.is_key_blocked(&ResourceKey::Inventory(command.inventory_id))
            }
        }
    }

    pub fn is_key_blocked(&self, key: &ResourceKey) -> bool {
        self.blocked.contains(key)
    }

    /// Number of blocked keys.
    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }

    /// Keys an item blocks once admitted.
    fn claimed_keys(item: &WorkItem) -> Vec<ResourceKey> {
        match item {
            WorkItem::TemplateRun(run) => {
                let mut keys = vec![ResourceKey::Project(run.project_id)];
                if run.exclusive {
                    keys.push(ResourceKey::Inventory(run.inventory_id));
                    keys.push(ResourceKey::Template(run.template_id));
                }
                keys
            }
            WorkItem::InventorySync(sync) => vec![
                ResourceKey::Inventory(sync.inventory_id),
                ResourceKey::InventorySource(sync.inventory_source_id),
            ],
            WorkItem::ProjectSync(sync) => vec![ResourceKey::Project(sync.project_id)],
            WorkItem::WorkflowRun(run) if !run.allow_simultaneous => {
                vec![ResourceKey::WorkflowTemplate(run.workflow_template_id)]
            }
            WorkItem::WorkflowRun(_) => Vec::new(),
            WorkItem::SystemTask(_) => vec![ResourceKey::System],
            // Ad-hoc commands only read the inventory.
            WorkItem::AdHocCommand(_) => Vec::new(),
        }
    }
}
