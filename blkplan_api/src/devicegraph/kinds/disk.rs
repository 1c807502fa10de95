use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::{
    constants::PARTITION_ID_LINUX,
    devicegraph::{
        device::{BlkDevice, DeviceImpl, DiffLog},
        types::{DeviceType, UsedFeatures},
    },
    error::{BlkplanError, ValidationError},
};

lazy_static! {
    static ref PARTITION_NAME: Regex = Regex::new(r"^/dev/\S*[0-9]$").unwrap();
}

/// Partition table type.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PtType {
    Gpt,
    Msdos,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Disk {
    #[serde(flatten)]
    pub blk: BlkDevice,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_table: Option<PtType>,
}

impl Disk {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            blk: BlkDevice::new(name, size),
            partition_table: None,
        }
    }
}

impl DeviceImpl for Disk {
    const DEVICE_TYPE: DeviceType = DeviceType::Disk;

    fn equal(&self, rhs: &Self) -> bool {
        self.blk.equal(&rhs.blk) && self.partition_table == rhs.partition_table
    }

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        self.blk.log_diff(&rhs.blk, log);
        log.field("partition-table", &self.partition_table, &rhs.partition_table);
    }

    fn check(&self) -> Result<(), BlkplanError> {
        self.blk.check(Self::DEVICE_TYPE)
    }

    fn used_features(&self) -> UsedFeatures {
        match self.partition_table {
            Some(_) => UsedFeatures::PARTITIONS,
            None => UsedFeatures::empty(),
        }
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

fn default_partition_id() -> u32 {
    PARTITION_ID_LINUX
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Partition {
    #[serde(flatten)]
    pub blk: BlkDevice,

    pub number: u32,

    /// Partition id, e.g. 0x83 for linux or 0xfd for RAID members.
    #[serde(default = "default_partition_id")]
    pub id: u32,
}

impl Partition {
    /// Builds the partition name the kernel uses: `/dev/sda1`, `/dev/nvme0n1p1`.
    pub fn name_on(disk: &str, number: u32) -> String {
        if disk.ends_with(|c: char| c.is_ascii_digit()) {
            format!("{disk}p{number}")
        } else {
            format!("{disk}{number}")
        }
    }
}

impl DeviceImpl for Partition {
    const DEVICE_TYPE: DeviceType = DeviceType::Partition;

    fn equal(&self, rhs: &Self) -> bool {
        self.blk.equal(&rhs.blk) && self.number == rhs.number && self.id == rhs.id
    }

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        self.blk.log_diff(&rhs.blk, log);
        log.field("number", &self.number, &rhs.number);
        log.field("id", &self.id, &rhs.id);
    }

    fn check(&self) -> Result<(), BlkplanError> {
        self.blk.check(Self::DEVICE_TYPE)?;
        if !PARTITION_NAME.is_match(&self.blk.name) {
            return Err(BlkplanError::new(ValidationError::InvalidName {
                device_type: Self::DEVICE_TYPE.to_string(),
                name: self.blk.name.clone(),
            }));
        }
        if self.number == 0 {
            return Err(BlkplanError::new(ValidationError::InvalidPartitionNumber {
                name: self.blk.name.clone(),
                number: self.number,
            }));
        }
        Ok(())
    }

    fn used_features(&self) -> UsedFeatures {
        UsedFeatures::PARTITIONS
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
