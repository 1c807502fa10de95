use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    devicegraph::{
        device::{DeviceImpl, DiffLog},
        types::{DeviceType, UsedFeatures},
    },
    error::{BlkplanError, ValidationError},
};

/// Filesystem types
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Vfat,
    Swap,
    Iso9660,
    Ntfs,
}

impl FsType {
    pub fn used_feature(&self) -> UsedFeatures {
        match self {
            Self::Ext2 => UsedFeatures::EXT2,
            Self::Ext3 => UsedFeatures::EXT3,
            Self::Ext4 => UsedFeatures::EXT4,
            Self::Xfs => UsedFeatures::XFS,
            Self::Btrfs => UsedFeatures::BTRFS,
            Self::Vfat => UsedFeatures::VFAT,
            Self::Swap => UsedFeatures::SWAP,
            Self::Iso9660 => UsedFeatures::ISO9660,
            Self::Ntfs => UsedFeatures::NTFS,
        }
    }

    /// Longest label the filesystem stores.
    pub fn max_label_length(&self) -> usize {
        match self {
            Self::Ext2 | Self::Ext3 | Self::Ext4 => 16,
            Self::Xfs => 12,
            Self::Vfat => 11,
            Self::Swap => 15,
            Self::Iso9660 => 32,
            Self::Ntfs => 128,
            Self::Btrfs => 255,
        }
    }

    /// Whether the label of an existing filesystem can be changed in place.
    pub fn supports_label_change(&self) -> bool {
        matches!(
            self,
            Self::Ext2 | Self::Ext3 | Self::Ext4 | Self::Xfs | Self::Btrfs | Self::Vfat
        )
    }

    /// Whether blkplan can create a filesystem of this type.
    pub fn supports_create(&self) -> bool {
        !matches!(self, Self::Iso9660)
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, Self::Ext2 | Self::Ext3 | Self::Ext4)
    }
}

/// A filesystem on one (or, for btrfs, several) block devices.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BlkFilesystem {
    pub fs_type: FsType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,

    /// Extra options for mkfs. Only used when creating, so not compared.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mkfs_options: String,
}

impl BlkFilesystem {
    pub fn new(fs_type: FsType) -> Self {
        Self {
            fs_type,
            uuid: String::new(),
            label: String::new(),
            mkfs_options: String::new(),
        }
    }
}

impl DeviceImpl for BlkFilesystem {
    const DEVICE_TYPE: DeviceType = DeviceType::BlkFilesystem;

    fn equal(&self, rhs: &Self) -> bool {
        self.fs_type == rhs.fs_type && self.uuid == rhs.uuid && self.label == rhs.label
    }

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        log.field("fs-type", &self.fs_type, &rhs.fs_type);
        log.field("uuid", &self.uuid, &rhs.uuid);
        log.field("label", &self.label, &rhs.label);
    }

    fn check(&self) -> Result<(), BlkplanError> {
        let max = self.fs_type.max_label_length();
        if self.label.chars().count() > max {
            return Err(BlkplanError::new(ValidationError::InvalidLabel {
                label: self.label.clone(),
                fs_type: self.fs_type.to_string(),
                max,
            }));
        }
        Ok(())
    }

    fn used_features(&self) -> UsedFeatures {
        self.fs_type.used_feature()
    }

    fn display_name(&self) -> String {
        self.fs_type.to_string()
    }
}

/// A btrfs subvolume, `path` is relative to the top level subvolume.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BtrfsSubvolume {
    pub path: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default_subvolume: bool,
}

impl BtrfsSubvolume {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            default_subvolume: false,
        }
    }
}

impl DeviceImpl for BtrfsSubvolume {
    const DEVICE_TYPE: DeviceType = DeviceType::BtrfsSubvolume;

    fn equal(&self, rhs: &Self) -> bool {
        self.path == rhs.path && self.default_subvolume == rhs.default_subvolume
    }

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        log.field("path", &self.path, &rhs.path);
        log.field("default-subvolume", &self.default_subvolume, &rhs.default_subvolume);
    }

    fn check(&self) -> Result<(), BlkplanError> {
        if self.path.is_empty() || self.path.starts_with('/') {
            return Err(BlkplanError::new(ValidationError::InvalidSubvolumePath {
                path: self.path.clone(),
            }));
        }
        Ok(())
    }

    fn used_features(&self) -> UsedFeatures {
        UsedFeatures::BTRFS
    }

    fn display_name(&self) -> String {
        self.path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_length() {
        let mut fs = BlkFilesystem::new(FsType::Vfat);
        fs.label = "EFI".into();
        fs.check().unwrap();

        fs.label = "ABCDEFGHIJKL".into();
        fs.check().unwrap_err();

        fs.fs_type = FsType::Ext4;
        fs.check().unwrap();

        fs.fs_type = FsType::Xfs;
        fs.label = "abcdefghijklm".into();
        fs.check().unwrap_err();
    }

    #[test]
    fn test_mkfs_options_not_compared() {
        let lhs = BlkFilesystem::new(FsType::Ext4);
        let mut rhs = lhs.clone();
        rhs.mkfs_options = "-O ^has_journal".into();
        assert!(lhs.equal(&rhs));
        rhs.label = "data".into();
        assert!(!lhs.equal(&rhs));
    }

    #[test]
    fn test_subvolume_path() {
        BtrfsSubvolume::new("@/home").check().unwrap();
        BtrfsSubvolume::new("/@/home").check().unwrap_err();
        BtrfsSubvolume::new("").check().unwrap_err();
    }

    #[test]
    fn test_fs_type_capabilities() {
        assert!(FsType::Ext3.supports_label_change());
        assert!(!FsType::Swap.supports_label_change());
        assert!(!FsType::Iso9660.supports_create());
        assert_eq!(FsType::Iso9660.to_string(), "iso9660");
        assert_eq!(FsType::Btrfs.used_feature(), UsedFeatures::BTRFS);
    }
}
