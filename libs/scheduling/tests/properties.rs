//! Property tests over randomly generated fleets and backlogs.

use std::collections::{HashMap, HashSet};

use jobplane_id::{Hostname, ProjectId};
use jobplane_scheduling::{
    DependencyGraph, NoDependencies, Node, NodeRole, PassSettings, PassSnapshot, Projection,
    RecordingDispatcher, SchedulingPass, WorkItem,
};
use jobplane_testing::{
    ad_hoc_command, group, inventory_sync, node, project_sync, system_task, template_run,
    workflow_run, SnapshotBuilder,
};
use proptest::prelude::*;

fn arb_role() -> impl Strategy<Value = NodeRole> {
    prop_oneof![
        Just(NodeRole::Control),
        Just(NodeRole::Execution),
        Just(NodeRole::Hybrid),
        Just(NodeRole::Hop),
    ]
}

fn arb_nodes() -> impl Strategy<Value = Vec<Node>> {
    prop::collection::vec((arb_role(), 0u32..200, any::<bool>()), 1..6).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (role, capacity, enabled))| {
                let mut n = node(&format!("node-{i}"), role, capacity);
                n.enabled = enabled;
                n
            })
            .collect()
    })
}

/// Item with id `id`, built from a kind selector and resource numbers.
fn make_item(id: i64, kind: u8, project: i64, inventory: i64, forks: u32, created: i64) -> WorkItem {
    match kind {
        0 => project_sync(id, project, created).build(),
        1 => inventory_sync(id, inventory, inventory, created).build(),
        2 => workflow_run(id, project, created).build(),
        3 => system_task(id, created).build(),
        4 => ad_hoc_command(id, inventory, created).build(),
        _ => template_run(id, project, inventory, forks, created).build(),
    }
}

fn arb_items() -> impl Strategy<Value = Vec<WorkItem>> {
    prop::collection::vec((0u8..7, 1i64..4, 1i64..4, 0u32..12, 0i64..100), 0..25).prop_map(
        |specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (kind, project, inventory, forks, created))| {
                    make_item(i as i64 + 1, kind, project, inventory, forks, created)
                })
                .collect()
        },
    )
}

/// Control and hybrid nodes go in the control-plane group, everything in
/// the default group.
fn snapshot(nodes: Vec<Node>, pending: Vec<WorkItem>) -> PassSnapshot {
    let control: Vec<String> = nodes
        .iter()
        .filter(|n| n.role.requires_control_plane())
        .map(|n| n.hostname.to_string())
        .collect();
    let all: Vec<String> = nodes.iter().map(|n| n.hostname.to_string()).collect();
    let control: Vec<&str> = control.iter().map(String::as_str).collect();
    let all: Vec<&str> = all.iter().map(String::as_str).collect();

    let mut builder = SnapshotBuilder::new()
        .group(group("controlplane", &control))
        .group(group("default", &all));
    for n in nodes {
        builder = builder.node(n);
    }
    for item in pending {
        builder = builder.pending(item);
    }
    builder.build()
}

proptest! {
    #[test]
    fn prop_remaining_capacity_is_total_minus_costs_floored(
        nodes in arb_nodes(),
        pending in arb_items(),
    ) {
        let totals: HashMap<Hostname, u32> = nodes
            .iter()
            .map(|n| (n.hostname.clone(), n.total_capacity))
            .collect();
        let costs: HashMap<_, u32> = pending.iter().map(|i| (i.id(), i.capacity_cost())).collect();

        let report = SchedulingPass::new(snapshot(nodes, pending), &PassSettings::default())
            .run(&mut RecordingDispatcher::new(), &NoDependencies);

        let mut consumed: HashMap<Hostname, u64> = HashMap::new();
        for assignment in &report.assignments {
            *consumed.entry(assignment.node.clone()).or_default() +=
                u64::from(costs[&assignment.item_id]);
        }
        for summary in &report.nodes {
            let total = u64::from(totals[&summary.hostname]);
            let used = consumed.get(&summary.hostname).copied().unwrap_or(0);
            prop_assert_eq!(u64::from(summary.remaining_capacity), total.saturating_sub(used));
            prop_assert!(summary.remaining_capacity <= totals[&summary.hostname]);
        }
    }

    #[test]
    fn prop_each_item_assigned_at_most_once(
        nodes in arb_nodes(),
        pending in arb_items(),
    ) {
        let count = pending.len();
        let report = SchedulingPass::new(snapshot(nodes, pending), &PassSettings::default())
            .run(&mut RecordingDispatcher::new(), &NoDependencies);

        let unique: HashSet<_> = report.assignments.iter().map(|a| a.item_id).collect();
        prop_assert_eq!(unique.len(), report.assignments.len());
        prop_assert_eq!(report.outcomes.len(), count);
    }

    #[test]
    fn prop_admitted_template_runs_never_share_a_project(
        nodes in arb_nodes(),
        pending in arb_items(),
    ) {
        let projects: HashMap<_, ProjectId> = pending
            .iter()
            .filter_map(|item| match item {
                WorkItem::TemplateRun(run) => Some((run.common.id, run.project_id)),
                WorkItem::ProjectSync(sync) => Some((sync.common.id, sync.project_id)),
                _ => None,
            })
            .collect();

        let report = SchedulingPass::new(snapshot(nodes, pending), &PassSettings::default())
            .run(&mut RecordingDispatcher::new(), &NoDependencies);

        let mut seen = HashSet::new();
        for assignment in &report.assignments {
            if let Some(project) = projects.get(&assignment.item_id) {
                prop_assert!(seen.insert(*project), "project {} admitted twice", project);
            }
        }
    }

    #[test]
    fn prop_blocked_stays_blocked(
        marks in arb_items(),
        candidates in arb_items(),
    ) {
        let mut graph = DependencyGraph::new();
        let mut blocked: Vec<&WorkItem> = Vec::new();

        for item in &marks {
            graph.mark(item);
            for candidate in &candidates {
                if graph.is_blocked(candidate) && !blocked.contains(&candidate) {
                    blocked.push(candidate);
                }
            }
            for earlier in &blocked {
                prop_assert!(graph.is_blocked(earlier));
            }
        }
    }
}
