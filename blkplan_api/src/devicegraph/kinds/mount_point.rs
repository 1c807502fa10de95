use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    constants::ROOT_MOUNT_POINT_PATH,
    devicegraph::{
        device::{DeviceImpl, DiffLog},
        types::DeviceType,
    },
    error::{BlkplanError, ValidationError},
};

/// Where a filesystem or btrfs subvolume is mounted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct MountPoint {
    pub path: PathBuf,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_options: Vec<String>,
}

impl MountPoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mount_options: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.path == Path::new(ROOT_MOUNT_POINT_PATH)
    }

    /// Options joined for `mount -o`, `None` when there are none.
    pub fn options_arg(&self) -> Option<String> {
        match self.mount_options.is_empty() {
            true => None,
            false => Some(self.mount_options.join(",")),
        }
    }
}

impl DeviceImpl for MountPoint {
    const DEVICE_TYPE: DeviceType = DeviceType::MountPoint;

    fn equal(&self, rhs: &Self) -> bool {
        self.path == rhs.path && self.mount_options == rhs.mount_options
    }

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        log.field("path", &self.path, &rhs.path);
        log.field("mount-options", &self.mount_options, &rhs.mount_options);
    }

    fn check(&self) -> Result<(), BlkplanError> {
        if !self.path.is_absolute() {
            return Err(BlkplanError::new(ValidationError::InvalidMountPath {
                path: self.path.display().to_string(),
            }));
        }
        Ok(())
    }

    fn display_name(&self) -> String {
        self.path.display().to_string()
    }
}
