use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};
use petgraph::{
    algo::{has_path_connecting, toposort},
    stable_graph::{NodeIndex as PetgraphNodeIndex, StableGraph},
    visit::{EdgeRef, IntoEdgeReferences},
    Directed, Direction,
};

use crate::error::{BlkplanError, GraphConsistencyError, ReportError};

use super::{
    device::{Device, DeviceKind, DiffLog},
    holder::{Holder, HolderKind},
    kinds::{BlkFilesystem, FsType, Md, MountPoint},
    types::{DeviceType, UsedFeatures},
    Sid,
};

/// The type of the node index used in the Devicegraph.
pub(crate) type NodeIndex = PetgraphNodeIndex<u32>;

/// The type of the graph used to store devices and their holders.
pub(crate) type DevicePetgraph = StableGraph<Device, Holder, Directed, u32>;

/// One snapshot of the storage configuration: devices connected by holders,
/// indexed by sid. Cloning is a deep copy that keeps every sid.
#[derive(Debug, Clone, Default)]
pub struct Devicegraph {
    pub(super) inner: DevicePetgraph,
    pub(super) index: BTreeMap<Sid, NodeIndex>,
}

impl Devicegraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the device, allocates a sid for it and inserts it.
    pub fn create(&mut self, kind: DeviceKind) -> Result<Sid, BlkplanError> {
        kind.check()?;
        let device = Device::new(Sid::allocate(), kind);
        trace!("Creating {} with sid {}", device.describe(), device.sid);
        self.insert_device(device)
    }

    /// Like `create`, for devices that were found on the system.
    pub fn create_probed(&mut self, kind: DeviceKind) -> Result<Sid, BlkplanError> {
        kind.check()?;
        let mut device = Device::new(Sid::allocate(), kind);
        device.exists_in_probed = true;
        trace!("Adding probed {} with sid {}", device.describe(), device.sid);
        self.insert_device(device)
    }

    /// Inserts a device keeping its sid.
    pub(crate) fn insert_device(&mut self, device: Device) -> Result<Sid, BlkplanError> {
        let sid = device.sid;
        if self.index.contains_key(&sid) {
            return Err(BlkplanError::new(GraphConsistencyError::DuplicateSid { sid }));
        }
        let idx = self.inner.add_node(device);
        self.index.insert(sid, idx);
        Ok(sid)
    }

    pub(crate) fn node(&self, sid: Sid) -> Result<NodeIndex, BlkplanError> {
        self.index
            .get(&sid)
            .copied()
            .structured(GraphConsistencyError::DeviceNotFound { sid })
    }

    pub fn device_exists(&self, sid: Sid) -> bool {
        self.index.contains_key(&sid)
    }

    pub fn find_device(&self, sid: Sid) -> Result<&Device, BlkplanError> {
        Ok(&self.inner[self.node(sid)?])
    }

    pub fn find_device_mut(&mut self, sid: Sid) -> Result<&mut Device, BlkplanError> {
        let idx = self.node(sid)?;
        Ok(&mut self.inner[idx])
    }

    /// Returns the device with the given `/dev` name, volume group name
    /// (`/dev/<vg>`) or mount point path.
    pub fn find_by_name(&self, name: &str) -> Option<&Device> {
        self.devices().find(|device| match &device.kind {
            DeviceKind::LvmVg(_) | DeviceKind::MountPoint(_) => device.name() == name,
            _ => device.blk().is_some_and(|blk| blk.name == name),
        })
    }

    pub fn find_by_name_required(&self, name: &str) -> Result<&Device, BlkplanError> {
        self.find_by_name(name)
            .structured(GraphConsistencyError::DeviceNameNotFound { name: name.into() })
    }

    pub fn num_devices(&self) -> usize {
        self.index.len()
    }

    pub fn num_holders(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Iterates over all devices ordered by sid.
    pub fn devices(&self) -> impl Iterator<Item = &Device> + '_ {
        self.index.values().map(|idx| &self.inner[*idx])
    }

    pub fn devices_of_type(&self, device_type: DeviceType) -> Vec<&Device> {
        self.devices()
            .filter(|device| device.device_type() == device_type)
            .collect()
    }

    pub fn mds(&self) -> impl Iterator<Item = (Sid, &Md)> + '_ {
        self.devices()
            .filter_map(|device| device.as_md().map(|md| (device.sid, md)))
    }

    pub fn filesystems(&self) -> impl Iterator<Item = (Sid, &BlkFilesystem)> + '_ {
        self.devices()
            .filter_map(|device| device.as_blk_filesystem().map(|fs| (device.sid, fs)))
    }

    pub fn mount_points(&self) -> impl Iterator<Item = (Sid, &MountPoint)> + '_ {
        self.devices()
            .filter_map(|device| device.as_mount_point().map(|mp| (device.sid, mp)))
    }

    /// All holders ordered by their endpoints.
    pub fn holders(&self) -> Vec<&Holder> {
        let mut holders: Vec<&Holder> = self.holder_refs().collect();
        holders.sort_by_key(|holder| holder.endpoints());
        holders
    }

    fn holder_refs(&self) -> impl Iterator<Item = &Holder> + '_ {
        self.inner.edge_references().map(|edge| edge.weight())
    }

    pub fn add_holder(
        &mut self,
        source: Sid,
        target: Sid,
        kind: HolderKind,
    ) -> Result<Sid, BlkplanError> {
        let sid = self.insert_holder(Holder::new(source, target, kind))?;
        self.recalculate(target)?;
        Ok(sid)
    }

    /// Inserts a holder keeping its sid, after checking endpoint types,
    /// duplicates, the exclusive consumer rule and cycles. The target keeps
    /// its geometry, loaded and simulated graphs carry their sizes.
    pub(crate) fn insert_holder(&mut self, holder: Holder) -> Result<Sid, BlkplanError> {
        let (source, target) = holder.endpoints();
        let source_idx = self.node(source)?;
        let target_idx = self.node(target)?;
        let source_device = &self.inner[source_idx];
        let target_device = &self.inner[target_idx];

        let btrfs_only = holder.kind == HolderKind::Subdevice
            && source_device
                .as_blk_filesystem()
                .is_some_and(|fs| fs.fs_type != FsType::Btrfs);
        if btrfs_only
            || !holder
                .kind
                .allows(source_device.device_type(), target_device.device_type())
        {
            return Err(BlkplanError::new(
                GraphConsistencyError::InvalidHolderEndpoints {
                    holder_type: holder.kind.holder_type().to_string(),
                    source_type: source_device.device_type().to_string(),
                    target_type: target_device.device_type().to_string(),
                },
            ));
        }

        if self.inner.find_edge(source_idx, target_idx).is_some() {
            return Err(BlkplanError::new(GraphConsistencyError::DuplicateHolder {
                parent: source,
                child: target,
            }));
        }

        // A block device is either split into subdevices or claimed by a
        // single exclusive consumer.
        let mut existing = self
            .inner
            .edges_directed(source_idx, Direction::Outgoing)
            .map(|edge| edge.weight().kind);
        let conflict = match holder.kind.is_exclusive() {
            true => existing.next().is_some(),
            false => existing.any(|kind| kind.is_exclusive()),
        };
        if conflict {
            return Err(BlkplanError::new(GraphConsistencyError::ExclusiveConsumer {
                sid: source,
                name: source_device.name(),
            }));
        }

        if source_idx == target_idx
            || has_path_connecting(&self.inner, target_idx, source_idx, None)
        {
            return Err(BlkplanError::new(GraphConsistencyError::HolderCycle {
                parent: source,
                child: target,
            }));
        }

        let sid = holder.sid;
        self.inner.add_edge(source_idx, target_idx, holder);
        Ok(sid)
    }

    pub fn holder_exists(&self, source: Sid, target: Sid) -> bool {
        match (self.index.get(&source), self.index.get(&target)) {
            (Some(s), Some(t)) => self.inner.find_edge(*s, *t).is_some(),
            _ => false,
        }
    }

    pub fn find_holder(&self, source: Sid, target: Sid) -> Result<&Holder, BlkplanError> {
        let edge = self
            .inner
            .find_edge(self.node(source)?, self.node(target)?)
            .structured(GraphConsistencyError::HolderNotFound {
                parent: source,
                child: target,
            })?;
        Ok(&self.inner[edge])
    }

    pub(crate) fn find_holder_mut(
        &mut self,
        source: Sid,
        target: Sid,
    ) -> Result<&mut Holder, BlkplanError> {
        let edge = self
            .inner
            .find_edge(self.node(source)?, self.node(target)?)
            .structured(GraphConsistencyError::HolderNotFound {
                parent: source,
                child: target,
            })?;
        Ok(&mut self.inner[edge])
    }

    /// Removes the holder and recalculates the target's geometry.
    pub fn remove_holder(&mut self, source: Sid, target: Sid) -> Result<Holder, BlkplanError> {
        let edge = self
            .inner
            .find_edge(self.node(source)?, self.node(target)?)
            .structured(GraphConsistencyError::HolderNotFound {
                parent: source,
                child: target,
            })?;
        let holder = self
            .inner
            .remove_edge(edge)
            .structured(GraphConsistencyError::HolderNotFound {
                parent: source,
                child: target,
            })?;
        self.recalculate(target)?;
        Ok(holder)
    }

    /// Removes the device together with all its holders. Devices that were
    /// built on top of it get their geometry recalculated.
    pub fn remove_device(&mut self, sid: Sid) -> Result<Device, BlkplanError> {
        let idx = self.node(sid)?;
        let children = self.child_sids(sid)?;
        let device = self
            .inner
            .remove_node(idx)
            .structured(GraphConsistencyError::DeviceNotFound { sid })?;
        self.index.remove(&sid);
        trace!("Removed {} with sid {}", device.describe(), sid);

        for child in children {
            self.recalculate(child)?;
        }
        Ok(device)
    }

    fn neighbor_sids(&self, sid: Sid, direction: Direction) -> Result<Vec<Sid>, BlkplanError> {
        let mut sids: Vec<Sid> = self
            .inner
            .neighbors_directed(self.node(sid)?, direction)
            .map(|idx| self.inner[idx].sid)
            .collect();
        sids.sort();
        Ok(sids)
    }

    /// Sids of the devices `sid` is built on, ordered by sid.
    pub fn parent_sids(&self, sid: Sid) -> Result<Vec<Sid>, BlkplanError> {
        self.neighbor_sids(sid, Direction::Incoming)
    }

    /// Sids of the devices built on top of `sid`, ordered by sid.
    pub fn child_sids(&self, sid: Sid) -> Result<Vec<Sid>, BlkplanError> {
        self.neighbor_sids(sid, Direction::Outgoing)
    }

    pub fn parents(&self, sid: Sid) -> Result<Vec<&Device>, BlkplanError> {
        self.parent_sids(sid)?
            .into_iter()
            .map(|parent| self.find_device(parent))
            .collect()
    }

    pub fn children(&self, sid: Sid) -> Result<Vec<&Device>, BlkplanError> {
        self.child_sids(sid)?
            .into_iter()
            .map(|child| self.find_device(child))
            .collect()
    }

    /// Holders ending at `sid`, ordered by source.
    pub fn in_holders(&self, sid: Sid) -> Result<Vec<&Holder>, BlkplanError> {
        let mut holders: Vec<&Holder> = self
            .inner
            .edges_directed(self.node(sid)?, Direction::Incoming)
            .map(|edge| edge.weight())
            .collect();
        holders.sort_by_key(|holder| holder.source);
        Ok(holders)
    }

    /// Holders starting at `sid`, ordered by target.
    pub fn out_holders(&self, sid: Sid) -> Result<Vec<&Holder>, BlkplanError> {
        let mut holders: Vec<&Holder> = self
            .inner
            .edges_directed(self.node(sid)?, Direction::Outgoing)
            .map(|edge| edge.weight())
            .collect();
        holders.sort_by_key(|holder| holder.target);
        Ok(holders)
    }

    /// Marks every device as present on the system.
    pub fn mark_all_probed(&mut self) {
        let nodes: Vec<NodeIndex> = self.index.values().copied().collect();
        for idx in nodes {
            self.inner[idx].exists_in_probed = true;
        }
    }

    /// Compares devices by sid and holders by endpoints.
    pub fn equal(&self, other: &Devicegraph) -> bool {
        if self.index.len() != other.index.len() || self.num_holders() != other.num_holders() {
            return false;
        }

        let devices_equal = self.devices().all(|device| {
            other
                .find_device(device.sid)
                .is_ok_and(|rhs| device.equal(rhs))
        });

        devices_equal
            && self.holder_refs().all(|holder| {
                other
                    .find_holder(holder.source, holder.target)
                    .is_ok_and(|rhs| holder.equal(rhs))
            })
    }

    /// Lists and logs every difference to `other`.
    pub fn log_diff(&self, other: &Devicegraph) -> DiffLog {
        let mut log = DiffLog::default();

        let lhs_sids: BTreeSet<Sid> = self.index.keys().copied().collect();
        let rhs_sids: BTreeSet<Sid> = other.index.keys().copied().collect();
        for sid in lhs_sids.difference(&rhs_sids) {
            log.push(format!("device {sid} only in lhs"));
        }
        for sid in rhs_sids.difference(&lhs_sids) {
            log.push(format!("device {sid} only in rhs"));
        }
        for sid in lhs_sids.intersection(&rhs_sids) {
            let (Ok(lhs), Ok(rhs)) = (self.find_device(*sid), other.find_device(*sid)) else {
                continue;
            };
            let device_log = lhs.log_diff(rhs);
            if !device_log.is_empty() {
                log.push(format!("device {sid}: {device_log}"));
            }
        }

        for holder in self.holders() {
            match other.find_holder(holder.source, holder.target) {
                Ok(rhs) => {
                    let mut holder_log = DiffLog::default();
                    holder.log_diff(rhs, &mut holder_log);
                    if !holder_log.is_empty() {
                        log.push(format!(
                            "holder {} -> {}: {holder_log}",
                            holder.source, holder.target
                        ));
                    }
                }
                Err(_) => log.push(format!(
                    "holder {} -> {} only in lhs",
                    holder.source, holder.target
                )),
            }
        }
        for holder in other.holders() {
            if !self.holder_exists(holder.source, holder.target) {
                log.push(format!(
                    "holder {} -> {} only in rhs",
                    holder.source, holder.target
                ));
            }
        }

        if !log.is_empty() {
            debug!("Devicegraphs differ: {log}");
        }
        log
    }

    /// Checks every device and holder and that the holders form a DAG.
    pub fn check(&self) -> Result<(), BlkplanError> {
        for device in self.devices() {
            device.check()?;
        }

        for edge in self.inner.edge_references() {
            let holder = edge.weight();
            let source = &self.inner[edge.source()];
            let target = &self.inner[edge.target()];
            if source.sid != holder.source || target.sid != holder.target {
                return Err(BlkplanError::new(GraphConsistencyError::HolderNotFound {
                    parent: holder.source,
                    child: holder.target,
                }));
            }
            if !holder
                .kind
                .allows(source.device_type(), target.device_type())
            {
                return Err(BlkplanError::new(
                    GraphConsistencyError::InvalidHolderEndpoints {
                        holder_type: holder.kind.holder_type().to_string(),
                        source_type: source.device_type().to_string(),
                        target_type: target.device_type().to_string(),
                    },
                ));
            }
        }

        if let Err(cycle) = toposort(&self.inner, None) {
            let sid = self.inner[cycle.node_id()].sid;
            return Err(BlkplanError::new(GraphConsistencyError::HolderCycle {
                parent: sid,
                child: sid,
            }));
        }
        Ok(())
    }

    pub fn used_features(&self) -> UsedFeatures {
        self.devices()
            .fold(UsedFeatures::empty(), |features, device| {
                features | device.used_features()
            })
    }
}
