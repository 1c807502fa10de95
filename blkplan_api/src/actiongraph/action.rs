use std::fmt::{self, Display};

use serde::Serialize;
use strum_macros::Display;

use crate::devicegraph::Sid;

/// Which devicegraph an action reads its device from.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Side {
    /// The probed graph, for actions on devices that go away.
    Lhs,

    /// The staging graph, for actions on devices that are created or kept.
    Rhs,
}

/// Scheduling hint fixed when the action is generated. Among actions that
/// are ready at the same time anchors run first and trailing actions last.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum OrderingHint {
    /// The action of a device's batch that dependent devices wait for.
    Anchor,
    Regular,
    /// Bookkeeping that may run late, e.g. registering an array in
    /// mdadm.conf.
    Trailing,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ReallotMode {
    /// Add a member.
    Extend,
    /// Remove a member.
    Reduce,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ActionKind {
    /// Create the device. For mount points this mounts.
    Create,
    /// Delete the device. For mount points this unmounts.
    Delete,
    /// Stop an array or close an encryption layer.
    Deactivate,
    AddToEtcMdadm,
    RemoveFromEtcMdadm,
    CreatePartitionTable,
    SetPartitionId,
    /// Rename a volume group or logical volume.
    Rename,
    SetLabel,
    Remount,
    SetDefaultSubvolume,
    /// Add `device` to or remove it from the composite device.
    Reallot { mode: ReallotMode, device: Sid },
    /// Mark member `device` of an array as faulty.
    MarkFaulty { device: Sid },
}

impl ActionKind {
    pub fn side(&self) -> Side {
        match self {
            Self::Delete | Self::Deactivate | Self::RemoveFromEtcMdadm => Side::Lhs,
            Self::Reallot {
                mode: ReallotMode::Reduce,
                ..
            } => Side::Lhs,
            _ => Side::Rhs,
        }
    }
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Delete => f.write_str("delete"),
            Self::Deactivate => f.write_str("deactivate"),
            Self::AddToEtcMdadm => f.write_str("add-to-etc-mdadm"),
            Self::RemoveFromEtcMdadm => f.write_str("remove-from-etc-mdadm"),
            Self::CreatePartitionTable => f.write_str("create-partition-table"),
            Self::SetPartitionId => f.write_str("set-partition-id"),
            Self::Rename => f.write_str("rename"),
            Self::SetLabel => f.write_str("set-label"),
            Self::Remount => f.write_str("remount"),
            Self::SetDefaultSubvolume => f.write_str("set-default-subvolume"),
            Self::Reallot { mode, device } => write!(f, "reallot-{mode} {device}"),
            Self::MarkFaulty { device } => write!(f, "mark-faulty {device}"),
        }
    }
}

/// One step of a plan. Actions are created by the diff and never change.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Action {
    sid: Sid,
    kind: ActionKind,
    hint: OrderingHint,
}

impl Action {
    pub(crate) fn new(sid: Sid, kind: ActionKind) -> Self {
        Self {
            sid,
            kind,
            hint: OrderingHint::Regular,
        }
    }

    pub(crate) fn anchor(sid: Sid, kind: ActionKind) -> Self {
        Self {
            sid,
            kind,
            hint: OrderingHint::Anchor,
        }
    }

    pub(crate) fn trailing(sid: Sid, kind: ActionKind) -> Self {
        Self {
            sid,
            kind,
            hint: OrderingHint::Trailing,
        }
    }

    /// The device the action works on.
    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn hint(&self) -> OrderingHint {
        self.hint
    }

    pub fn side(&self) -> Side {
        self.kind.side()
    }

    pub fn is_create(&self) -> bool {
        self.kind == ActionKind::Create
    }

    pub fn is_delete(&self) -> bool {
        self.kind == ActionKind::Delete
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.sid)
    }
}
