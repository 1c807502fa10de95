use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    constants::DEV_MAPPER_PATH,
    devicegraph::{
        device::{BlkDevice, DeviceImpl, DiffLog},
        types::{DeviceType, UsedFeatures},
    },
    error::{BlkplanError, ValidationError},
};

/// A LUKS encryption layer. The block device is `/dev/mapper/<dm table name>`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Luks {
    #[serde(flatten)]
    pub blk: BlkDevice,

    pub dm_table_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,

    /// Key file used to format and open the device. Not part of equality,
    /// probing cannot recover it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

impl Luks {
    pub fn new(dm_table_name: impl Into<String>) -> Self {
        let dm_table_name = dm_table_name.into();
        Self {
            blk: BlkDevice::new(format!("{DEV_MAPPER_PATH}/{dm_table_name}"), 0),
            dm_table_name,
            uuid: String::new(),
            key_file: None,
        }
    }
}

impl DeviceImpl for Luks {
    const DEVICE_TYPE: DeviceType = DeviceType::Luks;

    fn equal(&self, rhs: &Self) -> bool {
        self.blk.equal(&rhs.blk) && self.dm_table_name == rhs.dm_table_name && self.uuid == rhs.uuid
    }

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        self.blk.log_diff(&rhs.blk, log);
        log.field("dm-table-name", &self.dm_table_name, &rhs.dm_table_name);
        log.field("uuid", &self.uuid, &rhs.uuid);
    }

    fn check(&self) -> Result<(), BlkplanError> {
        let valid = !self.dm_table_name.is_empty()
            && !self
                .dm_table_name
                .contains(|c: char| c == '/' || c.is_whitespace())
            && self.blk.name == format!("{DEV_MAPPER_PATH}/{}", self.dm_table_name);
        if !valid {
            return Err(BlkplanError::new(ValidationError::InvalidName {
                device_type: Self::DEVICE_TYPE.to_string(),
                name: self.dm_table_name.clone(),
            }));
        }
        Ok(())
    }

    fn used_features(&self) -> UsedFeatures {
        UsedFeatures::LUKS
    }

    fn blk(&self) -> Option<&BlkDevice> {
        Some(&self.blk)
    }

    fn blk_mut(&mut self) -> Option<&mut BlkDevice> {
        Some(&mut self.blk)
    }

    fn display_name(&self) -> String {
        self.blk.name.clone()
    }
}
