use log::{debug, trace};

use crate::{
    devicegraph::{Devicegraph, Sid},
    error::{BlkplanError, BlkplanResultExt, LogicError},
};

use super::{
    action::{Action, ActionKind, ReallotMode},
    graph::Actiongraph,
};

fn precondition_failed(action: &Action) -> BlkplanError {
    BlkplanError::new(LogicError::SimulationFailed {
        action: action.to_string(),
    })
}

impl Actiongraph<'_> {
    /// Applies the actions in commit order to a copy of lhs, checking the
    /// structural precondition of every action, and verifies that the result
    /// equals rhs.
    pub fn simulate(&self) -> Result<Devicegraph, BlkplanError> {
        let mut graph = self.lhs().clone();

        // Userdata is not backed by any action.
        for device in self.rhs().devices() {
            if let Ok(simulated) = graph.find_device_mut(device.sid()) {
                simulated.userdata = device.userdata.clone();
            }
        }

        for idx in self.commit_order()? {
            let action = self.action(idx);
            trace!("Simulating '{action}'");
            self.apply(&mut graph, action)
                .message(format!("Failed to simulate '{action}'"))?;
        }

        if !graph.equal(self.rhs()) {
            let differences = graph.log_diff(self.rhs());
            return Err(BlkplanError::new(LogicError::SimulationMismatch))
                .message(differences.to_string());
        }
        debug!("Simulated {} actions", self.len());
        Ok(graph)
    }

    fn apply(&self, graph: &mut Devicegraph, action: &Action) -> Result<(), BlkplanError> {
        let sid = action.sid();
        match action.kind() {
            ActionKind::Create => {
                if graph.device_exists(sid) {
                    return Err(precondition_failed(action));
                }
                let mut device = self.rhs().find_device(sid)?.clone();
                device.exists_in_probed = true;
                graph.insert_device(device)?;
                for holder in self.rhs().in_holders(sid)? {
                    if !graph.device_exists(holder.source()) {
                        return Err(precondition_failed(action));
                    }
                    graph.insert_holder(holder.clone())?;
                }
            }
            ActionKind::Delete => {
                if !graph.child_sids(sid)?.is_empty() {
                    return Err(precondition_failed(action));
                }
                graph.remove_device(sid)?;
            }
            ActionKind::Deactivate | ActionKind::RemoveFromEtcMdadm
                if !self.rhs().device_exists(sid) =>
            {
                graph.find_device(sid)?;
            }
            ActionKind::Reallot {
                mode: ReallotMode::Extend,
                device,
            } => {
                let holder = self.rhs().find_holder(device, sid)?.clone();
                graph.insert_holder(holder)?;
            }
            ActionKind::Reallot {
                mode: ReallotMode::Reduce,
                device,
            } => {
                graph.remove_holder(device, sid)?;
            }
            ActionKind::MarkFaulty { device } => {
                let kind = self.rhs().find_holder(device, sid)?.kind;
                graph.find_holder_mut(device, sid)?.kind = kind;
            }
            kind => self.apply_modification(graph, sid, kind)?,
        }
        Ok(())
    }

    /// Takes over the rhs state of a device that exists in both snapshots.
    fn apply_modification(
        &self,
        graph: &mut Devicegraph,
        sid: Sid,
        kind: ActionKind,
    ) -> Result<(), BlkplanError> {
        let target = self.rhs().find_device(sid)?;
        graph.find_device_mut(sid)?.kind = target.kind.clone();

        match kind {
            // Logical volume names follow their volume group.
            ActionKind::Rename if target.as_lvm_vg().is_some() => {
                for lv in graph.child_sids(sid)? {
                    if let Ok(renamed) = self.rhs().find_device(lv) {
                        graph.find_device_mut(lv)?.kind = renamed.kind.clone();
                    }
                }
            }
            // Only one subvolume of a filesystem is the default.
            ActionKind::SetDefaultSubvolume => {
                let btrfs = graph.btrfs_of_subvolume(sid)?;
                let mut previous = Vec::new();
                for (other, device) in graph
                    .devices()
                    .filter_map(|d| d.as_btrfs_subvolume().map(|s| (d.sid(), s)))
                {
                    if other != sid && device.default_subvolume {
                        previous.push(other);
                    }
                }
                for other in previous {
                    if graph.btrfs_of_subvolume(other)? != btrfs {
                        continue;
                    }
                    if let Some(subvolume) = graph.find_device_mut(other)?.as_btrfs_subvolume_mut() {
                        subvolume.default_subvolume = false;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
