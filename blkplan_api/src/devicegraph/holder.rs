use serde::{Deserialize, Serialize};

use super::{
    device::DiffLog,
    types::{DeviceType, DeviceTypeFlag, HolderType},
    Sid,
};

/// Role of a block device inside an MD array.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct MdUser {
    #[serde(default)]
    pub spare: bool,

    #[serde(default)]
    pub faulty: bool,

    /// Position of the member in the array, devices are passed to mdadm in
    /// this order.
    #[serde(default)]
    pub sort_key: u32,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct FilesystemUser {
    /// The block device holds an external journal.
    #[serde(default)]
    pub journal: bool,
}

/// Kind of relation between two devices.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HolderKind {
    /// disk → partition, vg → lv, btrfs → subvolume, container → member
    Subdevice,

    /// blk → pv, blk → luks, pv → vg
    User,

    /// blk → md or container
    MdUser(MdUser),

    /// blk → filesystem
    FilesystemUser(FilesystemUser),

    /// filesystem or subvolume → mount point
    Using,
}

impl HolderKind {
    pub fn holder_type(&self) -> HolderType {
        match self {
            Self::Subdevice => HolderType::Subdevice,
            Self::User => HolderType::User,
            Self::MdUser(_) => HolderType::MdUser,
            Self::FilesystemUser(_) => HolderType::FilesystemUser,
            Self::Using => HolderType::Using,
        }
    }

    /// Device types allowed at the source end.
    pub fn valid_sources(&self) -> DeviceTypeFlag {
        match self {
            Self::Subdevice => {
                DeviceTypeFlag::Disk
                    | DeviceTypeFlag::LvmVg
                    | DeviceTypeFlag::BlkFilesystem
                    | DeviceTypeFlag::BtrfsSubvolume
                    | DeviceTypeFlag::MdContainer
            }
            Self::User => DeviceTypeFlag::AnyBlkDevice | DeviceTypeFlag::LvmPv,
            Self::MdUser(_) | Self::FilesystemUser(_) => DeviceTypeFlag::AnyBlkDevice,
            Self::Using => DeviceTypeFlag::BlkFilesystem | DeviceTypeFlag::BtrfsSubvolume,
        }
    }

    /// Device types allowed at the target end.
    pub fn valid_targets(&self) -> DeviceTypeFlag {
        match self {
            Self::Subdevice => {
                DeviceTypeFlag::Partition
                    | DeviceTypeFlag::LvmLv
                    | DeviceTypeFlag::BtrfsSubvolume
                    | DeviceTypeFlag::MdMember
            }
            Self::User => DeviceTypeFlag::LvmPv | DeviceTypeFlag::Luks | DeviceTypeFlag::LvmVg,
            Self::MdUser(_) => DeviceTypeFlag::Md | DeviceTypeFlag::MdContainer,
            Self::FilesystemUser(_) => DeviceTypeFlag::BlkFilesystem,
            Self::Using => DeviceTypeFlag::MountPoint,
        }
    }

    /// Whether the holder can connect a `source` to a `target`.
    pub fn allows(&self, source: DeviceType, target: DeviceType) -> bool {
        if !self.valid_sources().contains(source.as_flag())
            || !self.valid_targets().contains(target.as_flag())
        {
            return false;
        }

        match self {
            Self::Subdevice => matches!(
                (source, target),
                (DeviceType::Disk, DeviceType::Partition)
                    | (DeviceType::LvmVg, DeviceType::LvmLv)
                    | (DeviceType::BlkFilesystem, DeviceType::BtrfsSubvolume)
                    | (DeviceType::BtrfsSubvolume, DeviceType::BtrfsSubvolume)
                    | (DeviceType::MdContainer, DeviceType::MdMember)
            ),
            Self::User => match target {
                DeviceType::LvmVg => source == DeviceType::LvmPv,
                _ => source.is_blk_device(),
            },
            _ => true,
        }
    }

    /// Exclusive holders claim their source: a block device used by an md,
    /// pv, luks or filesystem has no other consumer.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::User | Self::MdUser(_) | Self::FilesystemUser(_))
    }

    pub fn as_md_user(&self) -> Option<&MdUser> {
        match self {
            Self::MdUser(md_user) => Some(md_user),
            _ => None,
        }
    }
}

/// An edge of the devicegraph. Holders point from the lower level device
/// (source) to the device built on top of it (target).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Holder {
    pub(crate) sid: Sid,
    pub(crate) source: Sid,
    pub(crate) target: Sid,
    pub kind: HolderKind,
}

impl Holder {
    pub(crate) fn new(source: Sid, target: Sid, kind: HolderKind) -> Self {
        Self {
            sid: Sid::allocate(),
            source,
            target,
            kind,
        }
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn source(&self) -> Sid {
        self.source
    }

    pub fn target(&self) -> Sid {
        self.target
    }

    pub fn endpoints(&self) -> (Sid, Sid) {
        (self.source, self.target)
    }

    /// Holders are identified by their endpoints, the sid is not compared.
    pub fn equal(&self, rhs: &Self) -> bool {
        self.endpoints() == rhs.endpoints() && self.kind == rhs.kind
    }

    pub fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        log.field("source", &self.source, &rhs.source);
        log.field("target", &self.target, &rhs.target);
        log.field("kind", &self.kind, &rhs.kind);
    }
}
