//! Node capacity accounting and placement.
//!
//! Every node group keeps one ordered pool per capacity type. A hybrid node
//! sits in both pools of each group it belongs to. Pools are ordered by
//! remaining capacity (largest first, hostname as tie-break) and re-sorted
//! whenever an assignment changes a node, so `best_node` never reads a stale
//! value.
//!
//! Control and hybrid nodes outside the control-plane group break a fleet
//! invariant. They keep their ledger entry but are left out of every pool,
//! so one misplaced node cannot shadow valid candidates.
//!
//! The ledger is recomputed from the running set on every pass; nothing here
//! is persisted.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use jobplane_id::Hostname;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::work_item::{CapacityType, Projection, WorkItem};

/// Capability class of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Orchestration only.
    Control,
    /// Workload only.
    Execution,
    /// Both control and execution.
    Hybrid,
    /// Mesh relay; never runs work.
    Hop,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Execution => "execution",
            Self::Hybrid => "hybrid",
            Self::Hop => "hop",
        }
    }

    /// Capacity types this role can serve.
    pub fn serves(&self, capacity_type: CapacityType) -> bool {
        match self {
            Self::Hybrid => true,
            Self::Control => capacity_type == CapacityType::Control,
            Self::Execution => capacity_type == CapacityType::Execution,
            Self::Hop => false,
        }
    }

    /// Roles that must belong to the control-plane group.
    pub fn requires_control_plane(&self) -> bool {
        matches!(self, Self::Control | Self::Hybrid)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => Ok(Self::Control),
            "execution" => Ok(Self::Execution),
            "hybrid" => Ok(Self::Hybrid),
            "hop" => Ok(Self::Hop),
            other => Err(format!("unknown node role '{other}'")),
        }
    }
}

/// A worker node as seen by one scheduling pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: Hostname,
    pub role: NodeRole,
    pub enabled: bool,
    pub total_capacity: u32,
    /// Invariant: `remaining_capacity <= total_capacity`.
    pub remaining_capacity: u32,
    pub running_count: u32,
}

impl Node {
    /// An enabled, idle node with all of its capacity available.
    pub fn new(hostname: Hostname, role: NodeRole, total_capacity: u32) -> Self {
        Self {
            hostname,
            role,
            enabled: true,
            total_capacity,
            remaining_capacity: total_capacity,
            running_count: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.running_count == 0
    }

    /// Account for one more item, never dropping below zero.
    fn consume(&mut self, cost: u32) {
        self.remaining_capacity = self.remaining_capacity.saturating_sub(cost);
        self.running_count += 1;
    }
}

/// Named partition of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub name: String,
    pub members: Vec<Hostname>,
}

impl NodeGroup {
    pub fn new(name: impl Into<String>, members: Vec<Hostname>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }
}

/// Ordered set of candidate nodes, most remaining capacity first.
#[derive(Debug, Clone, Default)]
pub struct NodePool {
    order: BTreeSet<(Reverse<u32>, Hostname)>,
    /// Remaining capacity each member was last inserted with.
    positions: HashMap<Hostname, u32>,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or re-sort a node after its capacity changed.
    pub fn update(&mut self, node: &Node) {
        if let Some(previous) = self.positions.remove(&node.hostname) {
            self.order
                .remove(&(Reverse(previous), node.hostname.clone()));
        }
        self.order
            .insert((Reverse(node.remaining_capacity), node.hostname.clone()));
        self.positions
            .insert(node.hostname.clone(), node.remaining_capacity);
    }

    /// Candidate with the greatest remaining capacity.
    pub fn best(&self) -> Option<&Hostname> {
        self.order.iter().next().map(|(_, hostname)| hostname)
    }

    pub fn contains(&self, hostname: &Hostname) -> bool {
        self.positions.contains_key(hostname)
    }

    /// Members in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &Hostname> {
        self.order.iter().map(|(_, hostname)| hostname)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Control and execution pools of one node group.
#[derive(Debug, Clone, Default)]
struct GroupPools {
    control: NodePool,
    execution: NodePool,
}

impl GroupPools {
    fn pool(&self, capacity_type: CapacityType) -> &NodePool {
        match capacity_type {
            CapacityType::Control => &self.control,
            CapacityType::Execution => &self.execution,
        }
    }

    fn register(&mut self, node: &Node) {
        if node.role.serves(CapacityType::Control) {
            self.control.update(node);
        }
        if node.role.serves(CapacityType::Execution) {
            self.execution.update(node);
        }
    }
}

/// A chosen node for one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub hostname: Hostname,
    /// Chosen only because the node is idle, not because the item fits.
    pub idle_fallback: bool,
}

/// In-memory capacity ledger for one pass.
#[derive(Debug, Clone)]
pub struct CapacityModel {
    nodes: BTreeMap<Hostname, Node>,
    pools: HashMap<String, GroupPools>,
    memberships: HashMap<Hostname, Vec<String>>,
    misconfigured: BTreeSet<Hostname>,
    control_plane_group: String,
}

impl CapacityModel {
    /// Build the ledger from the node list and the items already holding
    /// capacity.
    ///
    /// Disabled and hop nodes are left out. Each remaining node starts from
    /// its total capacity minus the cost of every waiting or running item
    /// placed on it. Control and hybrid nodes outside the control-plane group
    /// are never offered as candidates.
    pub fn build<'a, I>(
        nodes: Vec<Node>,
        groups: &[NodeGroup],
        active: I,
        control_plane_group: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = &'a WorkItem>,
    {
        let mut ledger: BTreeMap<Hostname, Node> = nodes
            .into_iter()
            .filter(|node| node.enabled && node.role != NodeRole::Hop)
            .map(|mut node| {
                node.remaining_capacity = node.total_capacity;
                node.running_count = 0;
                (node.hostname.clone(), node)
            })
            .collect();

        for item in active {
            if !item.status().is_active() {
                continue;
            }
            let Some(hostname) = item.execution_node() else {
                continue;
            };
            match ledger.get_mut(hostname) {
                Some(node) => node.consume(item.capacity_cost()),
                None => debug!(
                    item_id = %item.id(),
                    node = %hostname,
                    "Active item on unschedulable node, not counted"
                ),
            }
        }

        let control_plane_group = control_plane_group.into();
        let control_plane: HashSet<&Hostname> = groups
            .iter()
            .filter(|group| group.name == control_plane_group)
            .flat_map(|group| group.members.iter())
            .collect();

        let mut pools: HashMap<String, GroupPools> = HashMap::new();
        let mut memberships: HashMap<Hostname, Vec<String>> = HashMap::new();
        let mut misconfigured: BTreeSet<Hostname> = BTreeSet::new();
        for group in groups {
            let group_pools = pools.entry(group.name.clone()).or_default();
            for hostname in &group.members {
                let Some(node) = ledger.get(hostname) else {
                    continue;
                };
                let member_of = memberships.entry(hostname.clone()).or_default();
                if !member_of.contains(&group.name) {
                    member_of.push(group.name.clone());
                }

                if node.role.requires_control_plane() && !control_plane.contains(hostname) {
                    if misconfigured.insert(hostname.clone()) {
                        warn!(
                            node = %hostname,
                            role = %node.role,
                            control_plane_group = %control_plane_group,
                            "Node outside the control-plane group, not schedulable"
                        );
                    }
                    continue;
                }
                group_pools.register(node);
            }
        }

        Self {
            nodes: ledger,
            pools,
            memberships,
            misconfigured,
            control_plane_group,
        }
    }

    pub fn node(&self, hostname: &Hostname) -> Option<&Node> {
        self.nodes.get(hostname)
    }

    /// All schedulable nodes, ordered by hostname.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Control and hybrid nodes excluded for sitting outside the
    /// control-plane group, ordered by hostname.
    pub fn misconfigured_nodes(&self) -> impl Iterator<Item = &Hostname> {
        self.misconfigured.iter()
    }

    /// Candidate with the most remaining capacity for `capacity_type` in `group`.
    pub fn best_node(&self, group: &str, capacity_type: CapacityType) -> Option<&Node> {
        self.pools
            .get(group)?
            .pool(capacity_type)
            .best()
            .and_then(|hostname| self.nodes.get(hostname))
    }

    /// Choose a node in `group` for `item`.
    ///
    /// Prefers the most idle node that still has room, spreading load rather
    /// than packing tightly. When nothing has room, any node with nothing
    /// running is accepted so large items cannot starve.
    pub fn fit(&self, item: &WorkItem, group: &str) -> Option<Placement> {
        let capacity_type = item.capacity_type();
        let cost = item.capacity_cost();

        if let Some(best) = self.best_node(group, capacity_type) {
            if best.remaining_capacity >= cost {
                return Some(Placement {
                    hostname: best.hostname.clone(),
                    idle_fallback: false,
                });
            }
        }

        self.find_largest_idle_instance(group, capacity_type)
            .map(|node| Placement {
                hostname: node.hostname.clone(),
                idle_fallback: true,
            })
    }

    /// Idle node with the largest total capacity, hostname as tie-break.
    pub fn find_largest_idle_instance(
        &self,
        group: &str,
        capacity_type: CapacityType,
    ) -> Option<&Node> {
        let pool = self.pools.get(group)?.pool(capacity_type);
        pool.iter()
            .filter_map(|hostname| self.nodes.get(hostname))
            .filter(|node| node.is_idle())
            .min_by(|a, b| {
                b.total_capacity
                    .cmp(&a.total_capacity)
                    .then_with(|| a.hostname.cmp(&b.hostname))
            })
    }

    /// Deduct `item`'s cost from `hostname` and re-sort it in every pool.
    ///
    /// Remaining capacity is floored at zero, so an idle-fallback placement
    /// may overcommit a node without the counter underflowing.
    pub fn assign(&mut self, item: &WorkItem, hostname: &Hostname) -> SchedulerResult<&Node> {
        let role = self
            .nodes
            .get(hostname)
            .map(|node| node.role)
            .ok_or_else(|| SchedulerError::NodeNotFound(hostname.clone()))?;

        let groups = self.memberships.get(hostname).cloned().unwrap_or_default();
        if role.requires_control_plane() && !groups.contains(&self.control_plane_group) {
            warn!(
                node = %hostname,
                role = %role,
                control_plane_group = %self.control_plane_group,
                "Node outside the control-plane group"
            );
            return Err(SchedulerError::ConfigurationInvariantViolation(format!(
                "{role} node {hostname} is not a member of the {} group",
                self.control_plane_group
            )));
        }

        let Some(node) = self.nodes.get_mut(hostname) else {
            return Err(SchedulerError::NodeNotFound(hostname.clone()));
        };
        node.consume(item.capacity_cost());
        debug!(
            item_id = %item.id(),
            node = %hostname,
            capacity_cost = item.capacity_cost(),
            remaining_capacity = node.remaining_capacity,
            running_count = node.running_count,
            "Consumed capacity"
        );

        for group in &groups {
            if let Some(group_pools) = self.pools.get_mut(group) {
                group_pools.register(node);
            }
        }

        Ok(node)
    }
}
