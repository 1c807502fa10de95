//! Basic types for the devicegraph

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

/// Enum for the supported device types
#[derive(
    Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DeviceType {
    /// A whole disk
    Disk,

    /// A partition on a disk
    Partition,

    /// A software RAID array
    Md,

    /// An MD container (IMSM/DDF)
    MdContainer,

    /// A member array inside an MD container
    MdMember,

    /// An LVM physical volume
    LvmPv,

    /// An LVM volume group
    LvmVg,

    /// An LVM logical volume
    LvmLv,

    /// A LUKS encryption layer
    Luks,

    /// A filesystem on a block device
    BlkFilesystem,

    /// A btrfs subvolume
    BtrfsSubvolume,

    /// A mount point of a filesystem or subvolume
    MountPoint,
}

impl DeviceType {
    pub fn as_flag(&self) -> DeviceTypeFlag {
        match self {
            Self::Disk => DeviceTypeFlag::Disk,
            Self::Partition => DeviceTypeFlag::Partition,
            Self::Md => DeviceTypeFlag::Md,
            Self::MdContainer => DeviceTypeFlag::MdContainer,
            Self::MdMember => DeviceTypeFlag::MdMember,
            Self::LvmPv => DeviceTypeFlag::LvmPv,
            Self::LvmVg => DeviceTypeFlag::LvmVg,
            Self::LvmLv => DeviceTypeFlag::LvmLv,
            Self::Luks => DeviceTypeFlag::Luks,
            Self::BlkFilesystem => DeviceTypeFlag::BlkFilesystem,
            Self::BtrfsSubvolume => DeviceTypeFlag::BtrfsSubvolume,
            Self::MountPoint => DeviceTypeFlag::MountPoint,
        }
    }

    /// Whether devices of this type have a `/dev` node and a region.
    pub fn is_blk_device(&self) -> bool {
        DeviceTypeFlag::AnyBlkDevice.contains(self.as_flag())
    }
}

bitflags::bitflags! {
    /// Bitflags for the device types
    ///
    /// MUST MATCH THE CONTENTS OF DeviceType
    #[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub struct DeviceTypeFlag: u32 {
        const Disk = 1;
        const Partition = 1 << 1;
        const Md = 1 << 2;
        const MdContainer = 1 << 3;
        const MdMember = 1 << 4;
        const LvmPv = 1 << 5;
        const LvmVg = 1 << 6;
        const LvmLv = 1 << 7;
        const Luks = 1 << 8;
        const BlkFilesystem = 1 << 9;
        const BtrfsSubvolume = 1 << 10;
        const MountPoint = 1 << 11;

        const AnyBlkDevice = Self::Disk.bits()
            | Self::Partition.bits()
            | Self::Md.bits()
            | Self::MdContainer.bits()
            | Self::MdMember.bits()
            | Self::LvmLv.bits()
            | Self::Luks.bits();
    }
}

impl DeviceTypeFlag {
    /// Returns the device types contained in the flag set.
    pub fn device_types(&self) -> Vec<DeviceType> {
        DeviceType::iter()
            .filter(|t| self.contains(t.as_flag()))
            .collect()
    }
}

/// Enum for the supported holder types
#[derive(
    Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HolderType {
    Subdevice,
    User,
    MdUser,
    FilesystemUser,
    Using,
}

bitflags::bitflags! {
    /// Storage technologies a devicegraph or plan relies on. Used to find the
    /// tools that have to be present before committing.
    #[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct UsedFeatures: u64 {
        const MDRAID = 1;
        const LVM = 1 << 1;
        const LUKS = 1 << 2;
        const EXT2 = 1 << 3;
        const EXT3 = 1 << 4;
        const EXT4 = 1 << 5;
        const XFS = 1 << 6;
        const BTRFS = 1 << 7;
        const VFAT = 1 << 8;
        const SWAP = 1 << 9;
        const ISO9660 = 1 << 10;
        const NTFS = 1 << 11;
        const PARTITIONS = 1 << 12;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_match_types() {
        let all: Vec<DeviceType> = DeviceType::iter().collect();
        assert_eq!(DeviceTypeFlag::all().device_types(), all);

        for device_type in DeviceType::iter() {
            assert_eq!(
                DeviceTypeFlag::from_bits(device_type.as_flag().bits()),
                Some(device_type.as_flag())
            );
        }
    }

    #[test]
    fn test_is_blk_device() {
        assert!(DeviceType::Disk.is_blk_device());
        assert!(DeviceType::Luks.is_blk_device());
        assert!(DeviceType::LvmLv.is_blk_device());
        assert!(!DeviceType::LvmVg.is_blk_device());
        assert!(!DeviceType::BlkFilesystem.is_blk_device());
        assert!(!DeviceType::MountPoint.is_blk_device());
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceType::BlkFilesystem.to_string(), "blk-filesystem");
        assert_eq!(HolderType::MdUser.to_string(), "md-user");
    }
}
