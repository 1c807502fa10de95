use log::debug;

use crate::{
    devicegraph::{Devicegraph, Sid},
    error::BlkplanError,
};

use super::{
    action::{Action, ReallotMode},
    generate::{holder_modify_actions, Snapshots},
};

/// Why a batch of actions exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Create,
    Modify,
    Delete,
    Reallot { mode: ReallotMode, member: Sid },
    /// A holder present in both snapshots changed.
    Holder,
}

/// The chain of actions generated for one device.
#[derive(Debug)]
pub(crate) struct Batch {
    pub sid: Sid,
    pub phase: Phase,
    pub actions: Vec<Action>,
}

/// Compares the two snapshots and returns the action batches in a
/// deterministic order: creates and modifications by rhs sid, deletes by lhs
/// sid, then holder changes by endpoints.
pub(crate) fn diff(lhs: &Devicegraph, rhs: &Devicegraph) -> Result<Vec<Batch>, BlkplanError> {
    let snapshots = Snapshots { lhs, rhs };
    let mut batches = Vec::new();

    for device in rhs.devices() {
        let sid = device.sid();
        let mut actions = Vec::new();
        let phase = match lhs.find_device(sid) {
            Ok(old) => {
                if old.equal(device) {
                    continue;
                }
                old.log_diff(device);
                device
                    .kind
                    .add_modify_actions(&old.kind, sid, snapshots, &mut actions)?;
                Phase::Modify
            }
            Err(_) => {
                device.kind.add_create_actions(sid, snapshots, &mut actions)?;
                Phase::Create
            }
        };
        if !actions.is_empty() {
            batches.push(Batch { sid, phase, actions });
        }
    }

    for device in lhs.devices().filter(|d| !rhs.device_exists(d.sid())) {
        let mut actions = Vec::new();
        device
            .kind
            .add_delete_actions(device.sid(), snapshots, &mut actions)?;
        batches.push(Batch {
            sid: device.sid(),
            phase: Phase::Delete,
            actions,
        });
    }

    for holder in rhs.holders() {
        let (source, target) = holder.endpoints();
        match lhs.find_holder(source, target) {
            Ok(old) => {
                let actions = holder_modify_actions(&old.kind, &holder.kind, source, target)?;
                if !actions.is_empty() {
                    batches.push(Batch {
                        sid: target,
                        phase: Phase::Holder,
                        actions,
                    });
                }
            }
            Err(_) if lhs.device_exists(target) => {
                batches.push(reallot(rhs, snapshots, target, ReallotMode::Extend, source)?);
            }
            Err(_) => {}
        }
    }

    for holder in lhs.holders() {
        let (source, target) = holder.endpoints();
        if !rhs.holder_exists(source, target) && rhs.device_exists(target) {
            batches.push(reallot(lhs, snapshots, target, ReallotMode::Reduce, source)?);
        }
    }

    debug!(
        "Diff produced {} batches with {} actions",
        batches.len(),
        batches.iter().map(|b| b.actions.len()).sum::<usize>()
    );
    Ok(batches)
}

fn reallot(
    graph: &Devicegraph,
    snapshots: Snapshots,
    target: Sid,
    mode: ReallotMode,
    member: Sid,
) -> Result<Batch, BlkplanError> {
    let mut actions = Vec::new();
    graph
        .find_device(target)?
        .kind
        .add_reallot_actions(target, mode, member, snapshots, &mut actions)?;
    Ok(Batch {
        sid: target,
        phase: Phase::Reallot { mode, member },
        actions,
    })
}
