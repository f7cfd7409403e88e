//! Implicit prerequisites for template runs.
//!
//! A template run whose project or inventory sources are configured to
//! update on launch first needs a fresh project sync and inventory syncs.
//! [`plan`] decides which syncs to create or reuse; the host persists the
//! new items and builds a [`DependencyIndex`], which the scheduling pass
//! consults through the [`DependencyHook`] seam to hold the run back until
//! its prerequisites have finished. A run whose prerequisite ended failed or
//! canceled can never start and is failed along with it.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use jobplane_id::{InventoryId, InventorySourceId, ProjectId, WorkItemId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::work_item::{LaunchKind, Projection, Status, TemplateRun, WorkItem};

/// Seconds an implicit project sync is backdated before its dependent run.
pub const PROJECT_SYNC_LEAD_SECS: i64 = 1;

/// Seconds an implicit inventory sync is backdated before its dependent run.
pub const INVENTORY_SYNC_LEAD_SECS: i64 = 2;

/// Prerequisites that keep an item from starting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyRequest {
    pub item_id: WorkItemId,
    /// Still pending, waiting or running.
    pub prerequisites: Vec<WorkItemId>,
    /// Ended failed or canceled, with their final status.
    pub failed: Vec<(WorkItemId, Status)>,
}

impl DependencyRequest {
    /// Operator-facing reason for failing the dependent item, if any
    /// prerequisite ended unsuccessfully.
    pub fn failure_explanation(&self) -> Option<String> {
        let (id, status) = self.failed.first()?;
        Some(format!("Previous task failed: {id} ended {status}"))
    }
}

/// Lets the orchestrating layer hold an item back until prerequisite items
/// it created have run.
pub trait DependencyHook {
    fn needs_dependency(&self, item: &WorkItem) -> Option<DependencyRequest>;
}

/// Hook for passes that never wait on prerequisites.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDependencies;

impl DependencyHook for NoDependencies {
    fn needs_dependency(&self, _item: &WorkItem) -> Option<DependencyRequest> {
        None
    }
}

/// Prerequisite edges with the last known status of each prerequisite.
#[derive(Debug, Clone, Default)]
pub struct DependencyIndex {
    edges: HashMap<WorkItemId, Vec<WorkItemId>>,
    statuses: HashMap<WorkItemId, Status>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `item` must wait for `prerequisite`.
    pub fn link(&mut self, item: WorkItemId, prerequisite: WorkItemId) {
        let prerequisites = self.edges.entry(item).or_default();
        if !prerequisites.contains(&prerequisite) {
            prerequisites.push(prerequisite);
        }
    }

    pub fn set_status(&mut self, item: WorkItemId, status: Status) {
        self.statuses.insert(item, status);
    }

    pub fn prerequisites(&self, item: WorkItemId) -> &[WorkItemId] {
        self.edges.get(&item).map(Vec::as_slice).unwrap_or_default()
    }
}

impl DependencyHook for DependencyIndex {
    fn needs_dependency(&self, item: &WorkItem) -> Option<DependencyRequest> {
        let mut unfinished = Vec::new();
        let mut failed = Vec::new();
        for id in self.prerequisites(item.id()) {
            // Prerequisites with no known status have vanished and no longer block.
            match self.statuses.get(id) {
                Some(status) if status.is_unfinished() => unfinished.push(*id),
                Some(status @ (Status::Failed | Status::Canceled)) => failed.push((*id, *status)),
                _ => {}
            }
        }

        if unfinished.is_empty() && failed.is_empty() {
            None
        } else {
            Some(DependencyRequest {
                item_id: item.id(),
                prerequisites: unfinished,
                failed,
            })
        }
    }
}

/// Update-on-launch settings of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSettings {
    pub project_id: ProjectId,
    pub update_on_launch: bool,
    pub cache_timeout: Duration,
}

/// Update-on-launch settings of an inventory source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventorySourceSettings {
    pub inventory_source_id: InventorySourceId,
    pub inventory_id: InventoryId,
    pub update_on_launch: bool,
    pub cache_timeout: Duration,
}

/// Most recent sync of a project or inventory source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestSync {
    pub item_id: WorkItemId,
    pub status: Status,
    pub launch_kind: LaunchKind,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What to do about one prerequisite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// A new sync must be created.
    Create,
    /// An in-flight sync covers it.
    Reuse(WorkItemId),
    /// The last sync is recent enough.
    Fresh,
}

/// Whether a template run created at `run_created_at` needs a project sync.
pub fn project_sync_decision(
    settings: &ProjectSettings,
    latest: Option<&LatestSync>,
    run_created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> SyncDecision {
    let Some(latest) = latest else {
        return SyncDecision::Create;
    };

    match latest.status {
        Status::Failed | Status::Canceled => return SyncDecision::Create,
        Status::Pending | Status::Waiting | Status::Running => {
            return SyncDecision::Reuse(latest.item_id)
        }
        Status::Successful => {}
    }

    // With a zero cache timeout, the sync created for this very run counts
    // as fresh; otherwise every pass would create another one.
    if settings.cache_timeout.is_zero()
        && latest.launch_kind == LaunchKind::Dependency
        && latest.created_at == run_created_at - Duration::seconds(PROJECT_SYNC_LEAD_SECS)
    {
        return SyncDecision::Fresh;
    }

    expiry_decision(latest, settings.cache_timeout, now)
}

/// Whether an inventory source needs a sync before a dependent run.
pub fn inventory_sync_decision(
    settings: &InventorySourceSettings,
    latest: Option<&LatestSync>,
    now: DateTime<Utc>,
) -> SyncDecision {
    let Some(latest) = latest else {
        return SyncDecision::Create;
    };

    match latest.status {
        Status::Pending | Status::Waiting | Status::Running => {
            SyncDecision::Reuse(latest.item_id)
        }
        Status::Failed | Status::Canceled => SyncDecision::Create,
        Status::Successful => expiry_decision(latest, settings.cache_timeout, now),
    }
}

fn expiry_decision(latest: &LatestSync, cache_timeout: Duration, now: DateTime<Utc>) -> SyncDecision {
    match latest.finished_at {
        Some(finished_at) if finished_at + cache_timeout >= now => SyncDecision::Fresh,
        _ => SyncDecision::Create,
    }
}

/// Everything the planner needs to know about the pending template runs.
#[derive(Debug, Clone, Default)]
pub struct DependencyCatalog {
    pub projects: HashMap<ProjectId, ProjectSettings>,
    pub inventory_sources: Vec<InventorySourceSettings>,
    pub latest_project_syncs: HashMap<ProjectId, LatestSync>,
    pub latest_inventory_syncs: HashMap<InventorySourceId, LatestSync>,
    /// Prerequisites recorded by earlier passes, with their current status.
    pub recorded: HashMap<WorkItemId, Vec<(WorkItemId, Option<Status>)>>,
}

/// A prerequisite item the host must create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NewPrerequisite {
    ProjectSync {
        project_id: ProjectId,
        created_at: DateTime<Utc>,
    },
    InventorySync {
        inventory_source_id: InventorySourceId,
        inventory_id: InventoryId,
        created_at: DateTime<Utc>,
    },
}

/// Reference to a prerequisite that either exists or is about to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrerequisiteRef {
    Existing(WorkItemId),
    /// Index into [`DependencyPlan::creates`].
    Planned(usize),
}

/// Output of [`plan`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyPlan {
    pub creates: Vec<NewPrerequisite>,
    pub links: Vec<(WorkItemId, PrerequisiteRef)>,
}

impl DependencyPlan {
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Build the hook for this pass once the planned items have ids.
    ///
    /// `created` holds the ids of [`Self::creates`] in order; `None` marks an
    /// item the host failed to create, whose links are dropped. `items` is
    /// every work item loaded for the pass and supplies current statuses.
    pub fn into_index<'a, I>(
        self,
        catalog: &DependencyCatalog,
        created: &[Option<WorkItemId>],
        items: I,
    ) -> DependencyIndex
    where
        I: IntoIterator<Item = &'a WorkItem>,
    {
        let mut index = DependencyIndex::new();

        for (item, prerequisites) in &catalog.recorded {
            for (prerequisite, status) in prerequisites {
                index.link(*item, *prerequisite);
                if let Some(status) = status {
                    index.set_status(*prerequisite, *status);
                }
            }
        }

        for (item, prerequisite) in self.links {
            let resolved = match prerequisite {
                PrerequisiteRef::Existing(id) => Some(id),
                PrerequisiteRef::Planned(position) => created.get(position).copied().flatten(),
            };
            if let Some(id) = resolved {
                index.link(item, id);
            }
        }

        for item in items {
            index.set_status(item.id(), item.status());
        }

        index
    }
}

/// Plan the prerequisites of every pending template run.
///
/// Runs that already have recorded prerequisites are left alone. A sync
/// planned for one run is shared by later runs on the same project or
/// source within the same plan.
pub fn plan<'a, I>(catalog: &DependencyCatalog, pending: I, now: DateTime<Utc>) -> DependencyPlan
where
    I: IntoIterator<Item = &'a WorkItem>,
{
    let mut result = DependencyPlan::default();
    let mut planned_projects: HashMap<ProjectId, usize> = HashMap::new();
    let mut planned_sources: HashMap<InventorySourceId, usize> = HashMap::new();

    for item in pending {
        let WorkItem::TemplateRun(run) = item else {
            continue;
        };
        if run.common.status != Status::Pending {
            continue;
        }
        if catalog.recorded.get(&run.common.id).is_some_and(|deps| !deps.is_empty()) {
            debug!(item_id = %run.common.id, "Prerequisites already recorded");
            continue;
        }

        if let Some(reference) = plan_project_sync(catalog, run, now, &mut result, &mut planned_projects) {
            result.links.push((run.common.id, reference));
        }
        for reference in plan_inventory_syncs(catalog, run, now, &mut result, &mut planned_sources) {
            result.links.push((run.common.id, reference));
        }
    }

    result
}

fn plan_project_sync(
    catalog: &DependencyCatalog,
    run: &TemplateRun,
    now: DateTime<Utc>,
    result: &mut DependencyPlan,
    planned: &mut HashMap<ProjectId, usize>,
) -> Option<PrerequisiteRef> {
    let settings = catalog.projects.get(&run.project_id)?;
    if !settings.update_on_launch {
        return None;
    }
    if let Some(position) = planned.get(&run.project_id) {
        return Some(PrerequisiteRef::Planned(*position));
    }

    let latest = catalog.latest_project_syncs.get(&run.project_id);
    match project_sync_decision(settings, latest, run.common.created_at, now) {
        SyncDecision::Fresh => None,
        SyncDecision::Reuse(id) => Some(PrerequisiteRef::Existing(id)),
        SyncDecision::Create => {
            debug!(item_id = %run.common.id, project_id = %run.project_id, "Planning project sync");
            let position = result.creates.len();
            result.creates.push(NewPrerequisite::ProjectSync {
                project_id: run.project_id,
                created_at: run.common.created_at - Duration::seconds(PROJECT_SYNC_LEAD_SECS),
            });
            planned.insert(run.project_id, position);
            Some(PrerequisiteRef::Planned(position))
        }
    }
}

fn plan_inventory_syncs(
    catalog: &DependencyCatalog,
    run: &TemplateRun,
    now: DateTime<Utc>,
    result: &mut DependencyPlan,
    planned: &mut HashMap<InventorySourceId, usize>,
) -> Vec<PrerequisiteRef> {
    let already_updated: HashSet<InventorySourceId> =
        run.inventory_sources_already_updated.iter().copied().collect();
    let mut references = Vec::new();

    for source in &catalog.inventory_sources {
        if source.inventory_id != run.inventory_id
            || !source.update_on_launch
            || already_updated.contains(&source.inventory_source_id)
        {
            continue;
        }
        if let Some(position) = planned.get(&source.inventory_source_id) {
            references.push(PrerequisiteRef::Planned(*position));
            continue;
        }

        let latest = catalog.latest_inventory_syncs.get(&source.inventory_source_id);
        match inventory_sync_decision(source, latest, now) {
            SyncDecision::Fresh => {}
            SyncDecision::Reuse(id) => references.push(PrerequisiteRef::Existing(id)),
            SyncDecision::Create => {
                debug!(
                    item_id = %run.common.id,
                    inventory_source_id = %source.inventory_source_id,
                    "Planning inventory sync"
                );
                let position = result.creates.len();
                result.creates.push(NewPrerequisite::InventorySync {
                    inventory_source_id: source.inventory_source_id,
                    inventory_id: source.inventory_id,
                    created_at: run.common.created_at - Duration::seconds(INVENTORY_SYNC_LEAD_SECS),
                });
                planned.insert(source.inventory_source_id, position);
                references.push(PrerequisiteRef::Planned(position));
            }
        }
    }

    references
}
