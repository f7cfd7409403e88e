//! Postgres-backed scheduler store.
//!
//! Work items of every kind live in one `work_items` table; kind-specific
//! columns are nullable and validated when a row is turned into a
//! [`WorkItem`]. Rows that fail validation are logged and skipped so one bad
//! row cannot stall scheduling.
//!
//! Workflow graphs live in `workflow_nodes` and `workflow_node_edges`. A node
//! whose template columns no longer decode is loaded without a template, which
//! fails its workflow instead of stalling it.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jobplane_id::{
    Hostname, InventoryId, InventorySourceId, ProjectId, TemplateId, WorkItemId, WorkflowNodeId,
    WorkflowTemplateId,
};
use jobplane_scheduling::dependencies::{
    DependencyCatalog, InventorySourceSettings, LatestSync, NewPrerequisite, ProjectSettings,
};
use jobplane_scheduling::work_item::{
    AdHocCommand, Common, InventorySync, LaunchKind, ProjectSync, SystemTask, TemplateRun,
    WorkflowRun,
};
use jobplane_scheduling::{
    Assignment, EdgeKind, Node, NodeGroup, NodeRole, NodeTemplate, PassReport, Projection, Status,
    WorkItem, WorkItemKind, WorkflowDag, WorkflowEdge, WorkflowNode, WorkflowState,
};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument, warn};

use super::DbError;
use crate::scheduler::store::{
    dispatched_status, PersistOutcome, SchedulerStore, StoreResult,
};

const WORK_ITEM_COLUMNS: &str = r#"
    id, kind, status, launch_kind, created_at, finished_at, execution_node,
    node_groups, project_id, inventory_id, inventory_source_id, template_id,
    workflow_template_id, forks, exclusive, allow_simultaneous,
    inventory_sources_already_updated
"#;

/// Scheduler store over a Postgres pool.
#[derive(Clone)]
pub struct PgSchedulerStore {
    pool: PgPool,
}

impl PgSchedulerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn list_by_status(
        &self,
        kind: WorkItemKind,
        statuses: &[Status],
    ) -> StoreResult<Vec<WorkItem>> {
        let statuses: Vec<&str> = statuses.iter().map(Status::as_str).collect();
        let sql = format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items \
             WHERE kind = $1 AND status = ANY($2) \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(kind.as_str())
            .bind(&statuses)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;

        Ok(decode_rows(rows, "work_items"))
    }

    async fn latest_syncs(
        &self,
        kind: WorkItemKind,
        column: &'static str,
        ids: &[i64],
    ) -> StoreResult<HashMap<i64, LatestSync>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT DISTINCT ON ({column}) {column} AS resource_id, \
                    id, status, launch_kind, created_at, finished_at \
             FROM work_items \
             WHERE kind = $1 AND {column} = ANY($2) \
             ORDER BY {column}, created_at DESC, id DESC"
        );
        let rows = sqlx::query_as::<_, LatestSyncRow>(&sql)
            .bind(kind.as_str())
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;

        let mut latest = HashMap::with_capacity(rows.len());
        for row in rows {
            let resource_id = row.resource_id;
            match LatestSync::try_from(row) {
                Ok(sync) => {
                    latest.insert(resource_id, sync);
                }
                Err(e) => warn!(error = %e, "Skipping invalid sync row"),
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl SchedulerStore for PgSchedulerStore {
    async fn list_pending(&self, kind: WorkItemKind) -> StoreResult<Vec<WorkItem>> {
        self.list_by_status(kind, &[Status::Pending]).await
    }

    async fn list_running_and_waiting(&self, kind: WorkItemKind) -> StoreResult<Vec<WorkItem>> {
        self.list_by_status(kind, &[Status::Waiting, Status::Running])
            .await
    }

    async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            r#"
            SELECT hostname, role, enabled, capacity
            FROM nodes
            ORDER BY hostname
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(decode_rows(rows, "nodes"))
    }

    async fn list_node_groups(&self) -> StoreResult<Vec<NodeGroup>> {
        let rows = sqlx::query(
            r#"
            SELECT g.name, m.hostname
            FROM node_groups g
            LEFT JOIN node_group_members m ON m.group_name = g.name
            ORDER BY g.position, g.name, m.hostname
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let mut groups: Vec<NodeGroup> = Vec::new();
        for row in rows {
            let name: String = row.try_get("name")?;
            let hostname: Option<String> = row.try_get("hostname")?;

            if groups.last().map(|g| g.name.as_str()) != Some(name.as_str()) {
                groups.push(NodeGroup::new(name, Vec::new()));
            }
            let Some(hostname) = hostname else {
                continue;
            };
            match Hostname::parse(&hostname) {
                Ok(hostname) => {
                    if let Some(group) = groups.last_mut() {
                        group.members.push(hostname);
                    }
                }
                Err(e) => warn!(hostname = %hostname, error = %e, "Skipping invalid group member"),
            }
        }

        Ok(groups)
    }

    #[instrument(skip_all, fields(pending = pending.len()))]
    async fn load_dependency_catalog(&self, pending: &[WorkItem]) -> StoreResult<DependencyCatalog> {
        let mut project_ids: HashSet<i64> = HashSet::new();
        let mut inventory_ids: HashSet<i64> = HashSet::new();
        let mut run_ids: Vec<i64> = Vec::new();
        for item in pending {
            if let WorkItem::TemplateRun(run) = item {
                project_ids.insert(run.project_id.value());
                inventory_ids.insert(run.inventory_id.value());
                run_ids.push(run.common.id.value());
            }
        }

        let mut catalog = DependencyCatalog::default();
        if run_ids.is_empty() {
            return Ok(catalog);
        }
        let project_ids: Vec<i64> = project_ids.into_iter().collect();
        let inventory_ids: Vec<i64> = inventory_ids.into_iter().collect();

        let projects = sqlx::query(
            r#"
            SELECT id, update_on_launch, cache_timeout_secs
            FROM projects
            WHERE id = ANY($1)
            "#,
        )
        .bind(&project_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;
        for row in projects {
            let project_id = ProjectId::new(row.try_get("id")?);
            catalog.projects.insert(
                project_id,
                ProjectSettings {
                    project_id,
                    update_on_launch: row.try_get("update_on_launch")?,
                    cache_timeout: Duration::seconds(row.try_get("cache_timeout_secs")?),
                },
            );
        }

        let sources = sqlx::query(
            r#"
            SELECT id, inventory_id, update_on_launch, cache_timeout_secs
            FROM inventory_sources
            WHERE inventory_id = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(&inventory_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;
        for row in sources {
            catalog.inventory_sources.push(InventorySourceSettings {
                inventory_source_id: InventorySourceId::new(row.try_get("id")?),
                inventory_id: InventoryId::new(row.try_get("inventory_id")?),
                update_on_launch: row.try_get("update_on_launch")?,
                cache_timeout: Duration::seconds(row.try_get("cache_timeout_secs")?),
            });
        }
        let source_ids: Vec<i64> = catalog
            .inventory_sources
            .iter()
            .map(|s| s.inventory_source_id.value())
            .collect();

        catalog.latest_project_syncs = self
            .latest_syncs(WorkItemKind::ProjectSync, "project_id", &project_ids)
            .await?
            .into_iter()
            .map(|(id, sync)| (ProjectId::new(id), sync))
            .collect();
        catalog.latest_inventory_syncs = self
            .latest_syncs(WorkItemKind::InventorySync, "inventory_source_id", &source_ids)
            .await?
            .into_iter()
            .map(|(id, sync)| (InventorySourceId::new(id), sync))
            .collect();

        let recorded = sqlx::query(
            r#"
            SELECT p.item_id, p.prerequisite_id, w.status
            FROM work_item_prerequisites p
            LEFT JOIN work_items w ON w.id = p.prerequisite_id
            WHERE p.item_id = ANY($1)
            ORDER BY p.item_id, p.prerequisite_id
            "#,
        )
        .bind(&run_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;
        for row in recorded {
            let item_id = WorkItemId::new(row.try_get("item_id")?);
            let prerequisite_id = WorkItemId::new(row.try_get("prerequisite_id")?);
            let status: Option<String> = row.try_get("status")?;
            let status = status.and_then(|s| s.parse::<Status>().ok());
            catalog
                .recorded
                .entry(item_id)
                .or_default()
                .push((prerequisite_id, status));
        }

        debug!(
            projects = catalog.projects.len(),
            inventory_sources = catalog.inventory_sources.len(),
            recorded = catalog.recorded.len(),
            "Loaded dependency catalog"
        );

        Ok(catalog)
    }

    async fn create_prerequisite(&self, prerequisite: &NewPrerequisite) -> StoreResult<WorkItem> {
        let sql = format!(
            "INSERT INTO work_items \
                 (kind, status, launch_kind, created_at, project_id, inventory_id, inventory_source_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {WORK_ITEM_COLUMNS}"
        );
        let (kind, created_at, project_id, inventory_id, inventory_source_id) = match prerequisite {
            NewPrerequisite::ProjectSync {
                project_id,
                created_at,
            } => (
                WorkItemKind::ProjectSync,
                *created_at,
                Some(project_id.value()),
                None,
                None,
            ),
            NewPrerequisite::InventorySync {
                inventory_source_id,
                inventory_id,
                created_at,
            } => (
                WorkItemKind::InventorySync,
                *created_at,
                None,
                Some(inventory_id.value()),
                Some(inventory_source_id.value()),
            ),
        };

        let row = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(kind.as_str())
            .bind(Status::Pending.as_str())
            .bind(LaunchKind::Dependency.as_str())
            .bind(created_at)
            .bind(project_id)
            .bind(inventory_id)
            .bind(inventory_source_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Query)?;

        Ok(WorkItem::try_from(row)?)
    }

    async fn record_prerequisites(
        &self,
        item: WorkItemId,
        prerequisites: &[WorkItemId],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        for prerequisite in prerequisites {
            sqlx::query(
                r#"
                INSERT INTO work_item_prerequisites (item_id, prerequisite_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(item.value())
            .bind(prerequisite.value())
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        }
        tx.commit().await.map_err(DbError::Query)?;
        Ok(())
    }

    #[instrument(skip_all, fields(items = failures.len()))]
    async fn fail_items(&self, failures: &[(WorkItemId, String)]) -> StoreResult<usize> {
        let mut failed = 0;
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        for (id, explanation) in failures {
            let result = sqlx::query(
                r#"
                UPDATE work_items
                SET status = 'failed', finished_at = now(), job_explanation = $2
                WHERE id = $1 AND status = 'pending'
                "#,
            )
            .bind(id.value())
            .bind(explanation)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
            failed += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(DbError::Query)?;
        Ok(failed)
    }

    async fn load_running_workflows(&self) -> StoreResult<Vec<WorkflowState>> {
        let runs = sqlx::query(
            r#"
            SELECT id, cancel_requested
            FROM work_items
            WHERE kind = 'workflow_run' AND status = 'running'
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;
        if runs.is_empty() {
            return Ok(Vec::new());
        }

        let mut order: Vec<(i64, bool)> = Vec::with_capacity(runs.len());
        for row in runs {
            order.push((row.try_get("id")?, row.try_get("cancel_requested")?));
        }
        let run_ids: Vec<i64> = order.iter().map(|(id, _)| *id).collect();

        let node_rows = sqlx::query_as::<_, WorkflowNodeRow>(
            r#"
            SELECT n.id, n.workflow_run_id, n.kind, n.project_id, n.inventory_id,
                   n.inventory_source_id, n.template_id, n.forks, n.exclusive,
                   n.job_id, w.status AS job_status
            FROM workflow_nodes n
            LEFT JOIN work_items w ON w.id = n.job_id
            WHERE n.workflow_run_id = ANY($1)
            ORDER BY n.id
            "#,
        )
        .bind(&run_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let edge_rows = sqlx::query(
            r#"
            SELECT n.workflow_run_id, e.parent_id, e.child_id, e.kind
            FROM workflow_node_edges e
            JOIN workflow_nodes n ON n.id = e.parent_id
            WHERE n.workflow_run_id = ANY($1)
            ORDER BY e.parent_id, e.child_id
            "#,
        )
        .bind(&run_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let mut nodes: BTreeMap<i64, Vec<WorkflowNode>> = BTreeMap::new();
        for row in node_rows {
            nodes.entry(row.workflow_run_id).or_default().push(WorkflowNode::from(row));
        }
        let mut edges: BTreeMap<i64, Vec<WorkflowEdge>> = BTreeMap::new();
        for row in edge_rows {
            let run_id: i64 = row.try_get("workflow_run_id")?;
            let kind: String = row.try_get("kind")?;
            let Ok(kind) = kind.parse::<EdgeKind>() else {
                warn!(workflow_id = run_id, kind = %kind, "Skipping workflow edge of unknown kind");
                continue;
            };
            edges.entry(run_id).or_default().push(WorkflowEdge {
                parent: WorkflowNodeId::new(row.try_get("parent_id")?),
                child: WorkflowNodeId::new(row.try_get("child_id")?),
                kind,
            });
        }

        Ok(order
            .into_iter()
            .map(|(id, cancel_requested)| WorkflowState {
                run_id: WorkItemId::new(id),
                cancel_requested,
                dag: WorkflowDag::new(
                    nodes.remove(&id).unwrap_or_default(),
                    edges.remove(&id).unwrap_or_default(),
                ),
            })
            .collect())
    }

    async fn spawn_workflow_node(
        &self,
        run: WorkItemId,
        node: WorkflowNodeId,
        template: &NodeTemplate,
    ) -> StoreResult<WorkItem> {
        let sql = format!(
            "INSERT INTO work_items \
                 (kind, status, launch_kind, created_at, project_id, inventory_id, \
                  inventory_source_id, template_id, forks, exclusive) \
             VALUES ($1, 'pending', $2, now(), $3, $4, $5, $6, $7, $8) \
             RETURNING {WORK_ITEM_COLUMNS}"
        );
        let (project_id, inventory_id, inventory_source_id, template_id, forks, exclusive) =
            match template {
                NodeTemplate::TemplateRun {
                    template_id,
                    project_id,
                    inventory_id,
                    forks,
                    exclusive,
                } => (
                    Some(project_id.value()),
                    Some(inventory_id.value()),
                    None,
                    Some(template_id.value()),
                    i32::try_from(*forks).unwrap_or(i32::MAX),
                    *exclusive,
                ),
                NodeTemplate::ProjectSync { project_id } => {
                    (Some(project_id.value()), None, None, None, 0, false)
                }
                NodeTemplate::InventorySync {
                    inventory_source_id,
                    inventory_id,
                } => (
                    None,
                    Some(inventory_id.value()),
                    Some(inventory_source_id.value()),
                    None,
                    0,
                    false,
                ),
            };

        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        let row = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(template.kind().as_str())
            .bind(LaunchKind::Workflow.as_str())
            .bind(project_id)
            .bind(inventory_id)
            .bind(inventory_source_id)
            .bind(template_id)
            .bind(forks)
            .bind(exclusive)
            .fetch_one(&mut *tx)
            .await
            .map_err(DbError::Query)?;

        let linked = sqlx::query(
            r#"
            UPDATE workflow_nodes
            SET job_id = $1
            WHERE id = $2 AND workflow_run_id = $3 AND job_id IS NULL
            "#,
        )
        .bind(row.id)
        .bind(node.value())
        .bind(run.value())
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;
        if linked.rows_affected() == 0 {
            // Already spawned by a concurrent pass; drop ours.
            tx.rollback().await.map_err(DbError::Query)?;
            return Err(DbError::invalid_row(
                "workflow_nodes",
                format!("node {node} of workflow {run} is already spawned"),
            )
            .into());
        }
        tx.commit().await.map_err(DbError::Query)?;

        Ok(WorkItem::try_from(row)?)
    }

    async fn finish_workflow(
        &self,
        run: WorkItemId,
        status: Status,
        cancel: &[WorkItemId],
    ) -> StoreResult<()> {
        let ids: Vec<i64> = cancel.iter().map(|id| id.value()).collect();
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        if !ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE work_items
                SET status = 'canceled', finished_at = now()
                WHERE id = ANY($1) AND status = 'pending'
                "#,
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
            sqlx::query(
                r#"
                UPDATE work_items
                SET cancel_requested = TRUE
                WHERE id = ANY($1) AND status IN ('waiting', 'running')
                "#,
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        }
        sqlx::query(
            r#"
            UPDATE work_items
            SET status = $1, finished_at = now()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(run.value())
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(())
    }

    #[instrument(skip_all, fields(started = started.len()))]
    async fn persist_assignments(&self, started: &[(WorkItem, Assignment)]) -> StoreResult<PersistOutcome> {
        let mut outcome = PersistOutcome::default();
        if started.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        for (item, assignment) in started {
            let result = sqlx::query(
                r#"
                UPDATE work_items
                SET status = $1, execution_node = $2, node_group = $3
                WHERE id = $4 AND status = 'pending'
                "#,
            )
            .bind(dispatched_status(item.kind()).as_str())
            .bind(assignment.node.as_str())
            .bind(&assignment.node_group)
            .bind(item.id().value())
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;

            if result.rows_affected() == 0 {
                outcome.vanished.push(item.id());
            } else {
                outcome.persisted += 1;
            }
        }
        tx.commit().await.map_err(DbError::Query)?;

        Ok(outcome)
    }

    async fn record_pass(&self, report: &PassReport) -> StoreResult<()> {
        let body = serde_json::to_value(report).map_err(DbError::from)?;
        sqlx::query(
            r#"
            INSERT INTO scheduler_passes (recorded_at, started, report)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(Utc::now())
        .bind(i32::try_from(report.started()).unwrap_or(i32::MAX))
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(())
    }
}

fn decode_rows<R, T>(rows: Vec<R>, table: &'static str) -> Vec<T>
where
    T: TryFrom<R, Error = DbError>,
{
    rows.into_iter()
        .filter_map(|row| match T::try_from(row) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(table, error = %e, "Skipping invalid row");
                None
            }
        })
        .collect()
}

// =============================================================================
// Rows
// =============================================================================

struct WorkItemRow {
    id: i64,
    kind: String,
    status: String,
    launch_kind: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    execution_node: Option<String>,
    node_groups: Vec<String>,
    project_id: Option<i64>,
    inventory_id: Option<i64>,
    inventory_source_id: Option<i64>,
    template_id: Option<i64>,
    workflow_template_id: Option<i64>,
    forks: i32,
    exclusive: bool,
    allow_simultaneous: bool,
    inventory_sources_already_updated: Vec<i64>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for WorkItemRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            status: row.try_get("status")?,
            launch_kind: row.try_get("launch_kind")?,
            created_at: row.try_get("created_at")?,
            finished_at: row.try_get("finished_at")?,
            execution_node: row.try_get("execution_node")?,
            node_groups: row.try_get("node_groups")?,
            project_id: row.try_get("project_id")?,
            inventory_id: row.try_get("inventory_id")?,
            inventory_source_id: row.try_get("inventory_source_id")?,
            template_id: row.try_get("template_id")?,
            workflow_template_id: row.try_get("workflow_template_id")?,
            forks: row.try_get("forks")?,
            exclusive: row.try_get("exclusive")?,
            allow_simultaneous: row.try_get("allow_simultaneous")?,
            inventory_sources_already_updated: row.try_get("inventory_sources_already_updated")?,
        })
    }
}

fn required<T: From<i64>>(value: Option<i64>, id: i64, column: &str) -> Result<T, DbError> {
    value
        .map(T::from)
        .ok_or_else(|| DbError::invalid_row("work_items", format!("item {id} has no {column}")))
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = DbError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        let invalid = |e: String| DbError::invalid_row("work_items", e);

        let kind: WorkItemKind = row.kind.parse().map_err(invalid)?;
        let status: Status = row.status.parse().map_err(invalid)?;
        let launch_kind: LaunchKind = row.launch_kind.parse().map_err(invalid)?;
        let execution_node = row
            .execution_node
            .as_deref()
            .map(Hostname::parse)
            .transpose()
            .map_err(|e| DbError::invalid_row("work_items", e))?;

        let mut common = Common::new(WorkItemId::new(row.id), status, row.created_at);
        common.finished_at = row.finished_at;
        common.launch_kind = launch_kind;
        common.execution_node = execution_node;
        common.node_groups = row.node_groups;

        let item = match kind {
            WorkItemKind::ProjectSync => WorkItem::ProjectSync(ProjectSync {
                common,
                project_id: required(row.project_id, row.id, "project_id")?,
            }),
            WorkItemKind::InventorySync => WorkItem::InventorySync(InventorySync {
                common,
                inventory_source_id: required(row.inventory_source_id, row.id, "inventory_source_id")?,
                inventory_id: required(row.inventory_id, row.id, "inventory_id")?,
            }),
            WorkItemKind::TemplateRun => WorkItem::TemplateRun(TemplateRun {
                common,
                template_id: required::<TemplateId>(row.template_id, row.id, "template_id")?,
                project_id: required(row.project_id, row.id, "project_id")?,
                inventory_id: required(row.inventory_id, row.id, "inventory_id")?,
                forks: u32::try_from(row.forks)
                    .map_err(|_| invalid(format!("item {} has negative forks", row.id)))?,
                exclusive: row.exclusive,
                inventory_sources_already_updated: row
                    .inventory_sources_already_updated
                    .into_iter()
                    .map(InventorySourceId::new)
                    .collect(),
            }),
            WorkItemKind::WorkflowRun => WorkItem::WorkflowRun(WorkflowRun {
                common,
                workflow_template_id: required::<WorkflowTemplateId>(
                    row.workflow_template_id,
                    row.id,
                    "workflow_template_id",
                )?,
                allow_simultaneous: row.allow_simultaneous,
            }),
            WorkItemKind::SystemTask => WorkItem::SystemTask(SystemTask { common }),
            WorkItemKind::AdHocCommand => WorkItem::AdHocCommand(AdHocCommand {
                common,
                inventory_id: required(row.inventory_id, row.id, "inventory_id")?,
            }),
        };

        Ok(item)
    }
}

struct NodeRow {
    hostname: String,
    role: String,
    enabled: bool,
    capacity: i32,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for NodeRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            hostname: row.try_get("hostname")?,
            role: row.try_get("role")?,
            enabled: row.try_get("enabled")?,
            capacity: row.try_get("capacity")?,
        })
    }
}

impl TryFrom<NodeRow> for Node {
    type Error = DbError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let hostname =
            Hostname::parse(&row.hostname).map_err(|e| DbError::invalid_row("nodes", e))?;
        let role: NodeRole = row
            .role
            .parse()
            .map_err(|e: String| DbError::invalid_row("nodes", e))?;
        let capacity = u32::try_from(row.capacity).map_err(|_| {
            DbError::invalid_row("nodes", format!("{hostname} has negative capacity"))
        })?;

        let mut node = Node::new(hostname, role, capacity);
        node.enabled = row.enabled;
        Ok(node)
    }
}

struct LatestSyncRow {
    resource_id: i64,
    id: i64,
    status: String,
    launch_kind: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for LatestSyncRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            resource_id: row.try_get("resource_id")?,
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            launch_kind: row.try_get("launch_kind")?,
            created_at: row.try_get("created_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<LatestSyncRow> for LatestSync {
    type Error = DbError;

    fn try_from(row: LatestSyncRow) -> Result<Self, Self::Error> {
        let invalid = |e: String| DbError::invalid_row("work_items", e);
        Ok(Self {
            item_id: WorkItemId::new(row.id),
            status: row.status.parse().map_err(invalid)?,
            launch_kind: row.launch_kind.parse().map_err(invalid)?,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

struct WorkflowNodeRow {
    id: i64,
    workflow_run_id: i64,
    kind: Option<String>,
    project_id: Option<i64>,
    inventory_id: Option<i64>,
    inventory_source_id: Option<i64>,
    template_id: Option<i64>,
    forks: i32,
    exclusive: bool,
    job_id: Option<i64>,
    job_status: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for WorkflowNodeRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_run_id: row.try_get("workflow_run_id")?,
            kind: row.try_get("kind")?,
            project_id: row.try_get("project_id")?,
            inventory_id: row.try_get("inventory_id")?,
            inventory_source_id: row.try_get("inventory_source_id")?,
            template_id: row.try_get("template_id")?,
            forks: row.try_get("forks")?,
            exclusive: row.try_get("exclusive")?,
            job_id: row.try_get("job_id")?,
            job_status: row.try_get("job_status")?,
        })
    }
}

impl WorkflowNodeRow {
    fn template(&self) -> Result<NodeTemplate, DbError> {
        let invalid = |e: String| DbError::invalid_row("workflow_nodes", e);
        let need = |value: Option<i64>, column: &str| {
            value.ok_or_else(|| invalid(format!("node {} has no {column}", self.id)))
        };

        let kind: WorkItemKind = self
            .kind
            .as_deref()
            .ok_or_else(|| invalid(format!("node {} has no template", self.id)))?
            .parse()
            .map_err(invalid)?;
        match kind {
            WorkItemKind::TemplateRun => Ok(NodeTemplate::TemplateRun {
                template_id: TemplateId::new(need(self.template_id, "template_id")?),
                project_id: ProjectId::new(need(self.project_id, "project_id")?),
                inventory_id: InventoryId::new(need(self.inventory_id, "inventory_id")?),
                forks: u32::try_from(self.forks)
                    .map_err(|_| invalid(format!("node {} has negative forks", self.id)))?,
                exclusive: self.exclusive,
            }),
            WorkItemKind::ProjectSync => Ok(NodeTemplate::ProjectSync {
                project_id: ProjectId::new(need(self.project_id, "project_id")?),
            }),
            WorkItemKind::InventorySync => Ok(NodeTemplate::InventorySync {
                inventory_source_id: InventorySourceId::new(need(
                    self.inventory_source_id,
                    "inventory_source_id",
                )?),
                inventory_id: InventoryId::new(need(self.inventory_id, "inventory_id")?),
            }),
            other => Err(invalid(format!("node {} cannot launch {other}", self.id))),
        }
    }
}

impl From<WorkflowNodeRow> for WorkflowNode {
    fn from(row: WorkflowNodeRow) -> Self {
        let template = match row.template() {
            Ok(template) => Some(template),
            Err(e) => {
                warn!(workflow_id = row.workflow_run_id, node_id = row.id, error = %e, "Workflow node has no usable template");
                None
            }
        };
        let job = row.job_id.map(|job_id| {
            let status = row
                .job_status
                .as_deref()
                .and_then(|s| s.parse::<Status>().ok())
                .unwrap_or(Status::Failed);
            (WorkItemId::new(job_id), status)
        });

        WorkflowNode {
            id: WorkflowNodeId::new(row.id),
            template,
            job,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn row(kind: &str) -> WorkItemRow {
        WorkItemRow {
            id: 7,
            kind: kind.to_string(),
            status: "running".to_string(),
            launch_kind: "manual".to_string(),
            created_at: Utc::now(),
            finished_at: None,
            execution_node: Some("exec-1".to_string()),
            node_groups: vec!["east".to_string()],
            project_id: Some(3),
            inventory_id: Some(4),
            inventory_source_id: None,
            template_id: Some(5),
            workflow_template_id: None,
            forks: 5,
            exclusive: true,
            allow_simultaneous: false,
            inventory_sources_already_updated: vec![9],
        }
    }

    #[test]
    fn test_template_run_row_decodes() {
        let item = WorkItem::try_from(row("template_run")).unwrap();
        let WorkItem::TemplateRun(run) = &item else {
            panic!("expected template run, got {item:?}");
        };
        assert_eq!(run.project_id, ProjectId::new(3));
        assert_eq!(run.inventory_sources_already_updated, vec![InventorySourceId::new(9)]);
        assert!(run.exclusive);
        assert_eq!(item.capacity_cost(), 50);
        assert_eq!(item.status(), Status::Running);
        assert_eq!(item.execution_node().map(Hostname::as_str), Some("exec-1"));
    }

    #[test]
    fn test_missing_kind_column_is_rejected() {
        let err = WorkItem::try_from(row("inventory_sync")).unwrap_err();
        assert!(err.to_string().contains("inventory_source_id"));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(matches!(
            WorkItem::try_from(row("job")),
            Err(DbError::InvalidRow { .. })
        ));
    }

    #[test]
    fn test_negative_forks_rejected() {
        let mut bad = row("template_run");
        bad.forks = -1;
        assert!(WorkItem::try_from(bad).is_err());
    }

    fn node_row(kind: Option<&str>) -> WorkflowNodeRow {
        WorkflowNodeRow {
            id: 11,
            workflow_run_id: 1,
            kind: kind.map(str::to_string),
            project_id: Some(3),
            inventory_id: Some(4),
            inventory_source_id: None,
            template_id: Some(5),
            forks: 2,
            exclusive: false,
            job_id: Some(40),
            job_status: Some("running".to_string()),
        }
    }

    #[test]
    fn test_workflow_node_row_decodes() {
        let node = WorkflowNode::from(node_row(Some("template_run")));
        assert_eq!(node.id, WorkflowNodeId::new(11));
        assert_eq!(
            node.template,
            Some(NodeTemplate::TemplateRun {
                template_id: TemplateId::new(5),
                project_id: ProjectId::new(3),
                inventory_id: InventoryId::new(4),
                forks: 2,
                exclusive: false,
            })
        );
        assert_eq!(node.job, Some((WorkItemId::new(40), Status::Running)));
    }

    #[rstest]
    #[case(None)]
    #[case(Some("inventory_sync"))]
    #[case(Some("workflow_run"))]
    fn test_workflow_node_without_usable_template(#[case] kind: Option<&str>) {
        let node = WorkflowNode::from(node_row(kind));
        assert_eq!(node.template, None);
        assert!(node.job.is_some());
    }

    #[test]
    fn test_node_row_decodes() {
        let node = Node::try_from(NodeRow {
            hostname: "hybrid-1".to_string(),
            role: "hybrid".to_string(),
            enabled: false,
            capacity: 120,
        })
        .unwrap();
        assert_eq!(node.role, NodeRole::Hybrid);
        assert_eq!(node.remaining_capacity, 120);
        assert!(!node.enabled);
    }

    #[test]
    fn test_decode_rows_skips_invalid() {
        let nodes: Vec<Node> = decode_rows(
            vec![
                NodeRow {
                    hostname: "a".to_string(),
                    role: "execution".to_string(),
                    enabled: true,
                    capacity: 10,
                },
                NodeRow {
                    hostname: "b".to_string(),
                    role: "gateway".to_string(),
                    enabled: true,
                    capacity: 10,
                },
            ],
            "nodes",
        );
        assert_eq!(nodes.len(), 1);
    }
}
