use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap},
    path::PathBuf,
};

use log::{debug, trace};
use petgraph::{
    algo::is_cyclic_directed,
    dot::{Config, Dot},
    graph::{DiGraph, NodeIndex},
    Direction,
};

use crate::{
    devicegraph::{Device, DeviceKind, Devicegraph, Sid, UsedFeatures},
    error::{BlkplanError, GraphConsistencyError},
};

use super::{
    action::{Action, ActionKind, OrderingHint, ReallotMode, Side},
    diff::{diff, Phase},
};

/// Index of an action inside its actiongraph.
pub type ActionIndex = NodeIndex<u32>;

/// The actions of one device in chain order.
#[derive(Debug)]
struct Chain {
    nodes: Vec<ActionIndex>,

    /// The action dependent devices wait for. `None` when the chain only
    /// holds trailing bookkeeping.
    anchor: Option<ActionIndex>,
}

impl Chain {
    fn first(&self) -> ActionIndex {
        self.nodes[0]
    }

    fn last(&self) -> ActionIndex {
        self.nodes[self.nodes.len() - 1]
    }
}

#[derive(Debug, Default)]
struct Chains {
    /// Create and modify chains, keyed by device.
    rhs: BTreeMap<Sid, Chain>,

    /// Delete chains, keyed by device.
    lhs: BTreeMap<Sid, Chain>,

    /// (target, member, action)
    extends: Vec<(Sid, Sid, ActionIndex)>,

    /// (member, target) → action
    reduces: BTreeMap<(Sid, Sid), ActionIndex>,
}

/// Dependency graph of the actions that transform `lhs` into `rhs`. Borrows
/// both devicegraphs for its whole lifetime.
#[derive(Debug)]
pub struct Actiongraph<'a> {
    lhs: &'a Devicegraph,
    rhs: &'a Devicegraph,
    inner: DiGraph<Action, ()>,
    mount_root_filesystem: Option<ActionIndex>,
}

impl<'a> Actiongraph<'a> {
    /// Diffs the two devicegraphs and orders the resulting actions. Fails
    /// when a change is not supported or the dependencies form a cycle.
    pub fn new(lhs: &'a Devicegraph, rhs: &'a Devicegraph) -> Result<Self, BlkplanError> {
        let batches = diff(lhs, rhs)?;

        let mut graph = Self {
            lhs,
            rhs,
            inner: DiGraph::new(),
            mount_root_filesystem: None,
        };

        let mut chains = Chains::default();
        for batch in batches {
            let chain = graph.add_chain(&batch.actions);
            match batch.phase {
                Phase::Create | Phase::Modify => {
                    chains.rhs.insert(batch.sid, chain);
                }
                Phase::Delete => {
                    chains.lhs.insert(batch.sid, chain);
                }
                Phase::Reallot {
                    mode: ReallotMode::Extend,
                    member,
                } => chains.extends.push((batch.sid, member, chain.last())),
                Phase::Reallot {
                    mode: ReallotMode::Reduce,
                    member,
                } => {
                    chains.reduces.insert((member, batch.sid), chain.last());
                }
                Phase::Holder => {}
            }
        }

        graph.mount_root_filesystem = graph.find_root_mount(&chains);
        graph.add_structural_dependencies(&chains)?;
        graph.add_reallot_dependencies(&chains);
        graph.add_space_reuse_dependencies(&chains)?;
        graph.add_name_reuse_dependencies(&chains)?;
        graph.add_mount_dependencies(&chains)?;
        graph.add_subvolume_dependencies(&chains)?;
        graph.add_etc_mdadm_dependencies();

        if is_cyclic_directed(&graph.inner) {
            return Err(BlkplanError::new(GraphConsistencyError::ActiongraphCycle));
        }

        debug!(
            "Actiongraph has {} actions and {} dependencies",
            graph.inner.node_count(),
            graph.inner.edge_count()
        );
        Ok(graph)
    }

    fn add_chain(&mut self, actions: &[Action]) -> Chain {
        let nodes: Vec<ActionIndex> = actions
            .iter()
            .map(|action| self.inner.add_node(*action))
            .collect();
        for pair in nodes.windows(2) {
            self.inner.add_edge(pair[0], pair[1], ());
        }

        let anchor = nodes
            .iter()
            .find(|idx| self.inner[**idx].hint() == OrderingHint::Anchor)
            .or_else(|| {
                nodes
                    .iter()
                    .rev()
                    .find(|idx| self.inner[**idx].hint() == OrderingHint::Regular)
            })
            .copied();
        Chain { nodes, anchor }
    }

    fn add_edge(&mut self, before: ActionIndex, after: ActionIndex) {
        if before != after {
            trace!(
                "Action '{}' before '{}'",
                self.inner[before],
                self.inner[after]
            );
            self.inner.update_edge(before, after, ());
        }
    }

    fn is_create_chain(&self, chain: &Chain) -> bool {
        self.inner[chain.first()].is_create()
    }

    fn find_root_mount(&self, chains: &Chains) -> Option<ActionIndex> {
        chains.rhs.iter().find_map(|(sid, chain)| {
            let is_root = self
                .rhs
                .find_device(*sid)
                .ok()
                .and_then(|device| device.as_mount_point())
                .is_some_and(|mp| mp.is_root());
            (is_root && self.is_create_chain(chain)).then(|| chain.first())
        })
    }

    /// Devices are built bottom up and torn down top down.
    fn add_structural_dependencies(&mut self, chains: &Chains) -> Result<(), BlkplanError> {
        let (lhs, rhs) = (self.lhs, self.rhs);

        for (sid, chain) in &chains.rhs {
            for parent in rhs.parent_sids(*sid)? {
                if let Some(anchor) = chains.rhs.get(&parent).and_then(|p| p.anchor) {
                    self.add_edge(anchor, chain.first());
                }
            }
        }

        for (sid, chain) in &chains.lhs {
            for child in lhs.child_sids(*sid)? {
                if let Some(child_chain) = chains.lhs.get(&child) {
                    self.add_edge(child_chain.last(), chain.first());
                }
            }
        }
        Ok(())
    }

    /// A new member exists before it is added and leaves before it is
    /// deleted.
    fn add_reallot_dependencies(&mut self, chains: &Chains) {
        for (_, member, node) in &chains.extends {
            if let Some(anchor) = chains.rhs.get(member).and_then(|m| m.anchor) {
                self.add_edge(anchor, *node);
            }
        }
        for ((member, _), node) in &chains.reduces {
            if let Some(member_chain) = chains.lhs.get(member) {
                self.add_edge(*node, member_chain.first());
            }
        }
    }

    /// A device that is reused by a new consumer first loses its old
    /// consumers, e.g. old partitions are deleted before new ones are
    /// created on the same disk.
    fn add_space_reuse_dependencies(&mut self, chains: &Chains) -> Result<(), BlkplanError> {
        let (lhs, rhs) = (self.lhs, self.rhs);

        let mut attachments = Vec::new();
        for (sid, chain) in &chains.rhs {
            if !self.is_create_chain(chain) {
                continue;
            }
            for parent in rhs.parent_sids(*sid)? {
                if lhs.device_exists(parent) {
                    attachments.push((parent, chain.first()));
                }
            }
        }
        for (_, member, node) in &chains.extends {
            if lhs.device_exists(*member) {
                attachments.push((*member, *node));
            }
        }

        for (reused, node) in attachments {
            for holder in lhs.out_holders(reused)? {
                let consumer = holder.target();
                if rhs.holder_exists(reused, consumer) {
                    continue;
                }
                if let Some(consumer_chain) = chains.lhs.get(&consumer) {
                    self.add_edge(consumer_chain.last(), node);
                }
                if let Some(reduce) = chains.reduces.get(&(reused, consumer)) {
                    self.add_edge(*reduce, node);
                }
            }
        }
        Ok(())
    }

    /// A deleted device frees its name for a new device.
    fn add_name_reuse_dependencies(&mut self, chains: &Chains) -> Result<(), BlkplanError> {
        let (lhs, rhs) = (self.lhs, self.rhs);

        let mut freed = BTreeMap::new();
        for (sid, chain) in &chains.lhs {
            if let Some(name) = reusable_name(lhs.find_device(*sid)?) {
                freed.insert(name, chain.last());
            }
        }

        for (sid, chain) in &chains.rhs {
            if !self.is_create_chain(chain) {
                continue;
            }
            if let Some(delete) = reusable_name(rhs.find_device(*sid)?).and_then(|n| freed.get(&n)) {
                self.add_edge(*delete, chain.first());
            }
        }
        Ok(())
    }

    /// Mount points are mounted below their ancestors and unmounted before
    /// them.
    fn add_mount_dependencies(&mut self, chains: &Chains) -> Result<(), BlkplanError> {
        let (lhs, rhs) = (self.lhs, self.rhs);

        let mounts = mount_chains(rhs, &chains.rhs)?;
        for (path, chain) in &mounts {
            for (ancestor, ancestor_chain) in &mounts {
                if path != ancestor && path.starts_with(ancestor) {
                    if let Some(anchor) = ancestor_chain.anchor {
                        self.add_edge(anchor, chain.first());
                    }
                }
            }
        }

        let unmounts = mount_chains(lhs, &chains.lhs)?;
        for (path, chain) in &unmounts {
            for (ancestor, ancestor_chain) in &unmounts {
                if path != ancestor && path.starts_with(ancestor) {
                    self.add_edge(chain.last(), ancestor_chain.first());
                }
            }
        }
        Ok(())
    }

    /// Subvolumes are created and deleted through the mounted filesystem.
    fn add_subvolume_dependencies(&mut self, chains: &Chains) -> Result<(), BlkplanError> {
        let (lhs, rhs) = (self.lhs, self.rhs);

        for (sid, chain) in &chains.rhs {
            if !self.is_create_chain(chain) || rhs.find_device(*sid)?.as_btrfs_subvolume().is_none()
            {
                continue;
            }
            let btrfs = rhs.btrfs_of_subvolume(*sid)?;
            if let Some(mount) = rhs.mount_point_of(btrfs)? {
                if let Some(anchor) = chains.rhs.get(&mount).and_then(|m| m.anchor) {
                    self.add_edge(anchor, chain.first());
                }
            }
        }

        for (sid, chain) in &chains.lhs {
            if lhs.find_device(*sid)?.as_btrfs_subvolume().is_none() {
                continue;
            }
            let btrfs = lhs.btrfs_of_subvolume(*sid)?;
            if let Some(mount) = lhs.mount_point_of(btrfs)? {
                if let Some(unmount) = chains.lhs.get(&mount) {
                    self.add_edge(chain.last(), unmount.first());
                }
            }
        }
        Ok(())
    }

    /// mdadm.conf lives on the root filesystem, so arrays are registered
    /// once it is mounted.
    fn add_etc_mdadm_dependencies(&mut self) {
        let Some(root) = self.mount_root_filesystem else {
            return;
        };
        let registrations: Vec<ActionIndex> = self
            .inner
            .node_indices()
            .filter(|idx| self.inner[*idx].kind() == ActionKind::AddToEtcMdadm)
            .collect();
        for registration in registrations {
            self.add_edge(root, registration);
        }
    }

    /// Returns the actions in the order they have to be committed. Among
    /// ready actions anchors go first and trailing actions last, remaining
    /// ties keep generation order.
    pub fn commit_order(&self) -> Result<Vec<ActionIndex>, BlkplanError> {
        let mut in_degree: Vec<usize> = self
            .inner
            .node_indices()
            .map(|idx| {
                self.inner
                    .neighbors_directed(idx, Direction::Incoming)
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(OrderingHint, ActionIndex)>> = self
            .inner
            .node_indices()
            .filter(|idx| in_degree[idx.index()] == 0)
            .map(|idx| Reverse((self.inner[idx].hint(), idx)))
            .collect();

        let mut order = Vec::with_capacity(self.inner.node_count());
        while let Some(Reverse((_, idx))) = ready.pop() {
            order.push(idx);
            for next in self.inner.neighbors_directed(idx, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse((self.inner[next].hint(), next)));
                }
            }
        }

        if order.len() != self.inner.node_count() {
            return Err(BlkplanError::new(GraphConsistencyError::ActiongraphCycle));
        }
        Ok(order)
    }

    pub fn lhs(&self) -> &'a Devicegraph {
        self.lhs
    }

    pub fn rhs(&self) -> &'a Devicegraph {
        self.rhs
    }

    pub fn len(&self) -> usize {
        self.inner.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.node_count() == 0
    }

    pub fn action(&self, idx: ActionIndex) -> &Action {
        &self.inner[idx]
    }

    /// All actions in generation order.
    pub fn actions(&self) -> impl Iterator<Item = (ActionIndex, &Action)> + '_ {
        self.inner
            .node_indices()
            .map(move |idx| (idx, &self.inner[idx]))
    }

    pub fn find_action(&self, sid: Sid, kind: ActionKind) -> Option<ActionIndex> {
        self.actions()
            .find(|(_, action)| action.sid() == sid && action.kind() == kind)
            .map(|(idx, _)| idx)
    }

    /// Actions that directly precede `idx`, in generation order.
    pub fn dependencies(&self, idx: ActionIndex) -> Vec<ActionIndex> {
        let mut dependencies: Vec<ActionIndex> = self
            .inner
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        dependencies.sort();
        dependencies
    }

    /// The action mounting the root filesystem, if the plan mounts it.
    pub fn mount_root_filesystem(&self) -> Option<ActionIndex> {
        self.mount_root_filesystem
    }

    /// The device an action works on, looked up in the snapshot of its side.
    pub fn device(&self, action: &Action) -> Result<&'a Device, BlkplanError> {
        match action.side() {
            Side::Lhs => self.lhs.find_device(action.sid()),
            Side::Rhs => self.rhs.find_device(action.sid()),
        }
    }

    /// Features needed to commit the plan.
    pub fn used_features(&self) -> Result<UsedFeatures, BlkplanError> {
        let mut features = UsedFeatures::empty();
        for (_, action) in self.actions() {
            features |= self.device(action)?.used_features();
            if let ActionKind::Reallot { device, .. } | ActionKind::MarkFaulty { device } =
                action.kind()
            {
                let graph = match action.side() {
                    Side::Lhs => self.lhs,
                    Side::Rhs => self.rhs,
                };
                features |= graph.find_device(device)?.used_features();
            }
        }
        Ok(features)
    }

    /// Renders the dependencies in graphviz format.
    pub fn to_dot(&self) -> String {
        let labeled = self.inner.map(
            |_, action| match self.device(action) {
                Ok(device) => format!("{action} ({})", device.name()),
                Err(_) => action.to_string(),
            },
            |_, _| "",
        );
        Dot::with_config(&labeled, &[Config::EdgeNoLabel]).to_string()
    }
}

/// Name a new device can only take once the old owner is gone.
fn reusable_name(device: &Device) -> Option<String> {
    match &device.kind {
        DeviceKind::LvmVg(_) | DeviceKind::MountPoint(_) => Some(device.name()),
        _ => device.blk().map(|blk| blk.name.clone()),
    }
}

fn mount_chains<'c>(
    graph: &Devicegraph,
    chains: &'c BTreeMap<Sid, Chain>,
) -> Result<Vec<(PathBuf, &'c Chain)>, BlkplanError> {
    let mut mounts = Vec::new();
    for (sid, chain) in chains {
        if let Some(mp) = graph.find_device(*sid)?.as_mount_point() {
            mounts.push((mp.path.clone(), chain));
        }
    }
    Ok(mounts)
}
