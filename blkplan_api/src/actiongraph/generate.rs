//! Per device type rules that turn one device difference into actions.

use log::trace;

use crate::{
    devicegraph::{
        dispatch, dispatch_pair,
        kinds::{
            BlkFilesystem, BtrfsSubvolume, Disk, LvmLv, LvmPv, LvmVg, Luks, Md, MdContainer,
            MdMember, MountPoint, Partition,
        },
        BlkDevice, DeviceImpl, DeviceKind, Devicegraph, HolderKind, Sid,
    },
    error::{BlkplanError, LogicError, UnsupportedChangeError},
};

use super::action::{Action, ActionKind, ReallotMode};

/// The two snapshots a difference is computed between.
#[derive(Clone, Copy)]
pub(crate) struct Snapshots<'a> {
    pub lhs: &'a Devicegraph,
    pub rhs: &'a Devicegraph,
}

fn refuse(kind: UnsupportedChangeError) -> BlkplanError {
    BlkplanError::new(kind)
}

/// Action generation hooks of a device variant. `self` is always the device
/// as found in the graph the action reads from: rhs for create, modify and
/// extend, lhs for delete and reduce.
pub(crate) trait GenerateActions: DeviceImpl {
    fn add_create_actions(
        &self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        actions.push(Action::anchor(sid, ActionKind::Create));
        Ok(())
    }

    fn add_delete_actions(
        &self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        actions.push(Action::new(sid, ActionKind::Delete));
        Ok(())
    }

    /// `self` is the rhs device, `lhs` the same device in lhs.
    fn add_modify_actions(
        &self,
        lhs: &Self,
        sid: Sid,
        snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError>;

    fn add_reallot_actions(
        &self,
        _sid: Sid,
        _mode: ReallotMode,
        _member: Sid,
        _snapshots: Snapshots,
        _actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        Err(refuse(UnsupportedChangeError::CannotReallot {
            device: self.display_name(),
        }))
    }
}

/// Refuses any change to name or region of an existing block device.
fn check_blk_modify(lhs: &BlkDevice, rhs: &BlkDevice) -> Result<(), BlkplanError> {
    if lhs.name != rhs.name {
        return Err(refuse(UnsupportedChangeError::CannotRename {
            device: lhs.name.clone(),
        }));
    }
    if lhs.region.length != rhs.region.length {
        return Err(refuse(UnsupportedChangeError::CannotResize {
            device: lhs.name.clone(),
        }));
    }
    if lhs.region.start != rhs.region.start {
        return Err(refuse(UnsupportedChangeError::CannotMove {
            device: lhs.name.clone(),
        }));
    }
    Ok(())
}

/// Uuids are assigned by the tools and never changed.
fn check_uuid(device: &str, lhs: &str, rhs: &str) -> Result<(), BlkplanError> {
    if lhs != rhs {
        return Err(refuse(UnsupportedChangeError::CannotChangeUuid {
            device: device.into(),
        }));
    }
    Ok(())
}

impl GenerateActions for Disk {
    fn add_create_actions(
        &self,
        _sid: Sid,
        _snapshots: Snapshots,
        _actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        Err(refuse(UnsupportedChangeError::CannotCreate {
            device_type: Self::DEVICE_TYPE.to_string(),
            device: self.blk.name.clone(),
        }))
    }

    fn add_delete_actions(
        &self,
        _sid: Sid,
        _snapshots: Snapshots,
        _actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        Err(refuse(UnsupportedChangeError::CannotDelete {
            device_type: Self::DEVICE_TYPE.to_string(),
            device: self.blk.name.clone(),
        }))
    }

    fn add_modify_actions(
        &self,
        lhs: &Self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        check_blk_modify(&lhs.blk, &self.blk)?;
        match (lhs.partition_table, self.partition_table) {
            (None, Some(_)) => actions.push(Action::anchor(sid, ActionKind::CreatePartitionTable)),
            (lhs_table, rhs_table) if lhs_table != rhs_table => {
                return Err(refuse(UnsupportedChangeError::CannotChangePartitionTable {
                    device: self.blk.name.clone(),
                }))
            }
            _ => {}
        }
        Ok(())
    }
}

impl GenerateActions for Partition {
    fn add_modify_actions(
        &self,
        lhs: &Self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        check_blk_modify(&lhs.blk, &self.blk)?;
        if lhs.number != self.number {
            return Err(refuse(UnsupportedChangeError::CannotRename {
                device: lhs.blk.name.clone(),
            }));
        }
        if lhs.id != self.id {
            actions.push(Action::new(sid, ActionKind::SetPartitionId));
        }
        Ok(())
    }
}

impl GenerateActions for Md {
    fn add_create_actions(
        &self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        actions.push(Action::anchor(sid, ActionKind::Create));
        if self.in_etc_mdadm {
            actions.push(Action::trailing(sid, ActionKind::AddToEtcMdadm));
        }
        Ok(())
    }

    fn add_delete_actions(
        &self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        if self.in_etc_mdadm {
            actions.push(Action::new(sid, ActionKind::RemoveFromEtcMdadm));
        }
        actions.push(Action::new(sid, ActionKind::Deactivate));
        actions.push(Action::new(sid, ActionKind::Delete));
        Ok(())
    }

    fn add_modify_actions(
        &self,
        lhs: &Self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        let device = lhs.blk.name.clone();
        check_blk_modify(&lhs.blk, &self.blk)?;
        if lhs.level != self.level {
            return Err(refuse(UnsupportedChangeError::CannotChangeLevel { device }));
        }
        if lhs.parity != self.parity {
            return Err(refuse(UnsupportedChangeError::CannotChangeParity { device }));
        }
        if lhs.chunk_size != self.chunk_size {
            return Err(refuse(UnsupportedChangeError::CannotChangeChunkSize { device }));
        }
        if lhs.metadata != self.metadata {
            return Err(refuse(UnsupportedChangeError::CannotChangeMetadata { device }));
        }
        check_uuid(&device, &lhs.uuid, &self.uuid)?;
        if lhs.optimal_io_size != self.optimal_io_size {
            return Err(refuse(UnsupportedChangeError::CannotModify { device }));
        }

        match (lhs.in_etc_mdadm, self.in_etc_mdadm) {
            (false, true) => actions.push(Action::trailing(sid, ActionKind::AddToEtcMdadm)),
            (true, false) => actions.push(Action::new(sid, ActionKind::RemoveFromEtcMdadm)),
            _ => {}
        }
        Ok(())
    }

    fn add_reallot_actions(
        &self,
        sid: Sid,
        mode: ReallotMode,
        member: Sid,
        snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        // Without redundancy every active member carries data, so any change
        // of the active set changes the size of the array.
        if !self.level.has_redundancy() {
            let spare = mode == ReallotMode::Extend
                && snapshots
                    .rhs
                    .md_members(sid)?
                    .iter()
                    .any(|(blk, role)| *blk == member && role.spare);
            if !spare {
                return Err(refuse(UnsupportedChangeError::CannotReallot {
                    device: self.blk.name.clone(),
                }));
            }
        }

        if mode == ReallotMode::Reduce {
            let remaining = snapshots
                .rhs
                .md_members(sid)?
                .iter()
                .filter(|(_, role)| !role.spare)
                .count();
            let required = self.level.minimal_number_of_devices();
            if remaining < required {
                return Err(refuse(UnsupportedChangeError::TooFewMembers {
                    device: self.blk.name.clone(),
                    required,
                    remaining,
                }));
            }
        }
        actions.push(Action::new(sid, ActionKind::Reallot { mode, device: member }));
        Ok(())
    }
}

/// Containers and their members are assembled by firmware tools, they can
/// only be stopped.
fn add_container_delete_actions(sid: Sid, actions: &mut Vec<Action>) {
    actions.push(Action::new(sid, ActionKind::Deactivate));
    actions.push(Action::new(sid, ActionKind::Delete));
}

impl GenerateActions for MdContainer {
    fn add_create_actions(
        &self,
        _sid: Sid,
        _snapshots: Snapshots,
        _actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        Err(refuse(UnsupportedChangeError::CannotCreate {
            device_type: Self::DEVICE_TYPE.to_string(),
            device: self.blk.name.clone(),
        }))
    }

    fn add_delete_actions(
        &self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        add_container_delete_actions(sid, actions);
        Ok(())
    }

    fn add_modify_actions(
        &self,
        lhs: &Self,
        _sid: Sid,
        _snapshots: Snapshots,
        _actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        check_blk_modify(&lhs.blk, &self.blk)?;
        Err(refuse(UnsupportedChangeError::CannotModify {
            device: lhs.blk.name.clone(),
        }))
    }
}

impl GenerateActions for MdMember {
    fn add_create_actions(
        &self,
        _sid: Sid,
        _snapshots: Snapshots,
        _actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        Err(refuse(UnsupportedChangeError::CannotCreate {
            device_type: Self::DEVICE_TYPE.to_string(),
            device: self.blk.name.clone(),
        }))
    }

    fn add_delete_actions(
        &self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        add_container_delete_actions(sid, actions);
        Ok(())
    }

    fn add_modify_actions(
        &self,
        lhs: &Self,
        _sid: Sid,
        _snapshots: Snapshots,
        _actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        check_blk_modify(&lhs.blk, &self.blk)?;
        Err(refuse(UnsupportedChangeError::CannotModify {
            device: lhs.blk.name.clone(),
        }))
    }
}

impl GenerateActions for LvmPv {
    fn add_modify_actions(
        &self,
        lhs: &Self,
        _sid: Sid,
        _snapshots: Snapshots,
        _actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        check_uuid(&self.display_name(), &lhs.uuid, &self.uuid)
    }
}

impl GenerateActions for LvmVg {
    fn add_modify_actions(
        &self,
        lhs: &Self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        check_uuid(&lhs.display_name(), &lhs.uuid, &self.uuid)?;
        if lhs.extent_size != self.extent_size {
            return Err(refuse(UnsupportedChangeError::CannotModify {
                device: lhs.display_name(),
            }));
        }
        if lhs.vg_name != self.vg_name {
            actions.push(Action::anchor(sid, ActionKind::Rename));
        }
        Ok(())
    }

    fn add_reallot_actions(
        &self,
        sid: Sid,
        mode: ReallotMode,
        member: Sid,
        snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        if mode == ReallotMode::Reduce {
            let remaining = snapshots.rhs.parent_sids(sid)?.len();
            if remaining == 0 {
                return Err(refuse(UnsupportedChangeError::TooFewMembers {
                    device: self.display_name(),
                    required: 1,
                    remaining,
                }));
            }
        }
        actions.push(Action::new(sid, ActionKind::Reallot { mode, device: member }));
        Ok(())
    }
}

impl GenerateActions for LvmLv {
    fn add_modify_actions(
        &self,
        lhs: &Self,
        sid: Sid,
        snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        let device = lhs.blk.name.clone();
        check_uuid(&device, &lhs.uuid, &self.uuid)?;
        if lhs.stripes != self.stripes {
            return Err(refuse(UnsupportedChangeError::CannotModify { device }));
        }
        if lhs.blk.region != self.blk.region {
            return Err(refuse(UnsupportedChangeError::CannotResize { device }));
        }

        // The block device name follows the volume group and LV names, only
        // a changed LV name needs an action of its own.
        let vg_name = snapshots
            .rhs
            .parents(sid)?
            .into_iter()
            .find_map(|parent| parent.as_lvm_vg().map(|vg| vg.vg_name.clone()))
            .unwrap_or_default();
        if self.blk.name != LvmLv::name_in(&vg_name, &self.lv_name) {
            return Err(refuse(UnsupportedChangeError::CannotRename { device }));
        }
        if lhs.lv_name != self.lv_name {
            actions.push(Action::anchor(sid, ActionKind::Rename));
        }
        Ok(())
    }
}

impl GenerateActions for Luks {
    fn add_delete_actions(
        &self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        actions.push(Action::new(sid, ActionKind::Deactivate));
        actions.push(Action::new(sid, ActionKind::Delete));
        Ok(())
    }

    fn add_modify_actions(
        &self,
        lhs: &Self,
        _sid: Sid,
        _snapshots: Snapshots,
        _actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        if lhs.dm_table_name != self.dm_table_name {
            return Err(refuse(UnsupportedChangeError::CannotRename {
                device: lhs.blk.name.clone(),
            }));
        }
        check_blk_modify(&lhs.blk, &self.blk)?;
        check_uuid(&lhs.blk.name, &lhs.uuid, &self.uuid)
    }
}

impl GenerateActions for BlkFilesystem {
    fn add_create_actions(
        &self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        if !self.fs_type.supports_create() {
            return Err(refuse(UnsupportedChangeError::CannotCreate {
                device_type: Self::DEVICE_TYPE.to_string(),
                device: self.fs_type.to_string(),
            }));
        }
        actions.push(Action::anchor(sid, ActionKind::Create));
        Ok(())
    }

    fn add_modify_actions(
        &self,
        lhs: &Self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        if lhs.fs_type != self.fs_type {
            return Err(refuse(UnsupportedChangeError::CannotChangeFilesystemType {
                device: lhs.fs_type.to_string(),
            }));
        }
        check_uuid(&lhs.fs_type.to_string(), &lhs.uuid, &self.uuid)?;
        if lhs.label != self.label {
            if !self.fs_type.supports_label_change() {
                return Err(refuse(UnsupportedChangeError::CannotChangeLabel {
                    device: lhs.label.clone(),
                    fs_type: self.fs_type.to_string(),
                }));
            }
            actions.push(Action::new(sid, ActionKind::SetLabel));
        }
        Ok(())
    }
}

impl GenerateActions for BtrfsSubvolume {
    fn add_create_actions(
        &self,
        sid: Sid,
        snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        // Subvolumes are created through a mounted filesystem.
        let btrfs = snapshots.rhs.btrfs_of_subvolume(sid)?;
        if snapshots.rhs.mount_point_of(btrfs)?.is_none() {
            return Err(refuse(UnsupportedChangeError::SubvolumeWithoutMountPoint {
                path: self.path.clone(),
            }));
        }
        actions.push(Action::anchor(sid, ActionKind::Create));
        if self.default_subvolume {
            actions.push(Action::new(sid, ActionKind::SetDefaultSubvolume));
        }
        Ok(())
    }

    fn add_modify_actions(
        &self,
        lhs: &Self,
        sid: Sid,
        snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        if lhs.path != self.path {
            return Err(refuse(UnsupportedChangeError::CannotRename {
                device: lhs.path.clone(),
            }));
        }
        match (lhs.default_subvolume, self.default_subvolume) {
            (false, true) => actions.push(Action::new(sid, ActionKind::SetDefaultSubvolume)),
            (true, false) if !another_default_is_set(sid, snapshots)? => {
                return Err(refuse(UnsupportedChangeError::CannotUnsetDefaultSubvolume {
                    path: lhs.path.clone(),
                }))
            }
            _ => {}
        }
        Ok(())
    }
}

/// Whether another subvolume of the same filesystem becomes the default,
/// which implicitly clears the flag of the current one.
fn another_default_is_set(sid: Sid, snapshots: Snapshots) -> Result<bool, BlkplanError> {
    let btrfs = snapshots.rhs.btrfs_of_subvolume(sid)?;
    for device in snapshots.rhs.devices() {
        let Some(subvolume) = device.as_btrfs_subvolume() else {
            continue;
        };
        if device.sid() == sid || !subvolume.default_subvolume {
            continue;
        }
        let was_default = snapshots
            .lhs
            .find_device(device.sid())
            .ok()
            .and_then(|lhs| lhs.as_btrfs_subvolume())
            .is_some_and(|lhs| lhs.default_subvolume);
        if !was_default && snapshots.rhs.btrfs_of_subvolume(device.sid())? == btrfs {
            return Ok(true);
        }
    }
    Ok(false)
}

impl GenerateActions for MountPoint {
    fn add_modify_actions(
        &self,
        lhs: &Self,
        sid: Sid,
        _snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        if lhs.path != self.path || lhs.mount_options != self.mount_options {
            actions.push(Action::anchor(sid, ActionKind::Remount));
        }
        Ok(())
    }
}

impl DeviceKind {
    pub(crate) fn add_create_actions(
        &self,
        sid: Sid,
        snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        dispatch!(self, d => d.add_create_actions(sid, snapshots, actions))
    }

    pub(crate) fn add_delete_actions(
        &self,
        sid: Sid,
        snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        dispatch!(self, d => d.add_delete_actions(sid, snapshots, actions))
    }

    /// `self` is the rhs variant. Fails with a logic error when the variant
    /// changed between the snapshots.
    pub(crate) fn add_modify_actions(
        &self,
        lhs: &DeviceKind,
        sid: Sid,
        snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        trace!("Generating modify actions for {sid}");
        dispatch_pair!(
            self,
            lhs,
            (r, l) => r.add_modify_actions(l, sid, snapshots, actions),
            _ => Err(BlkplanError::new(LogicError::DeviceTypeChanged { sid }))
        )
    }

    pub(crate) fn add_reallot_actions(
        &self,
        sid: Sid,
        mode: ReallotMode,
        member: Sid,
        snapshots: Snapshots,
        actions: &mut Vec<Action>,
    ) -> Result<(), BlkplanError> {
        dispatch!(self, d => d.add_reallot_actions(sid, mode, member, snapshots, actions))
    }
}

/// Holders present in both snapshots may only change by a member becoming
/// faulty.
pub(crate) fn holder_modify_actions(
    lhs: &HolderKind,
    rhs: &HolderKind,
    source: Sid,
    target: Sid,
) -> Result<Vec<Action>, BlkplanError> {
    if lhs == rhs {
        return Ok(Vec::new());
    }
    match (lhs, rhs) {
        (HolderKind::MdUser(l), HolderKind::MdUser(r))
            if l.spare == r.spare && l.sort_key == r.sort_key && !l.faulty && r.faulty =>
        {
            Ok(vec![Action::new(target, ActionKind::MarkFaulty { device: source })])
        }
        _ => Err(refuse(UnsupportedChangeError::CannotChangeHolder {
            parent: source,
            child: target,
        })),
    }
}
