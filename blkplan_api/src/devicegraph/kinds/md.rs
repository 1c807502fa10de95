use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    constants::{DEV_MD_PATH, MD_DEFAULT_CHUNK_SIZE, MD_DEFAULT_METADATA, MD_RAID1_CHUNK_SIZE},
    devicegraph::{
        device::{BlkDevice, DeviceImpl, DiffLog},
        types::{DeviceType, UsedFeatures},
    },
    error::{BlkplanError, ValidationError},
};

lazy_static! {
    /// `/dev/md0` or `/dev/md/0`.
    static ref NUMERIC_NAME: Regex = Regex::new(r"^/dev/md/?([0-9]+)$").unwrap();

    /// `/dev/md/<name>`, the name must not contain `/` or spaces.
    static ref FORMAT1_NAME: Regex = Regex::new(r"^/dev/md/([^/ ]+)$").unwrap();
}

/// RAID level of an MD array.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MdLevel {
    Raid0,
    Raid1,
    Raid4,
    Raid5,
    Raid6,
    Raid10,
}

impl MdLevel {
    /// Smallest number of active members the level can run with.
    pub fn minimal_number_of_devices(&self) -> usize {
        match self {
            Self::Raid0 | Self::Raid1 | Self::Raid10 => 2,
            Self::Raid4 | Self::Raid5 => 3,
            Self::Raid6 => 4,
        }
    }

    /// Whether the level keeps redundant data and therefore gets a write
    /// intent bitmap.
    pub fn has_redundancy(&self) -> bool {
        !matches!(self, Self::Raid0)
    }
}

/// Parity algorithm of RAID4/5/6 and layout of RAID10 arrays.
#[derive(
    Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString,
)]
pub enum MdParity {
    #[default]
    #[serde(rename = "default")]
    #[strum(serialize = "default")]
    Default,
    #[serde(rename = "left-asymmetric")]
    #[strum(serialize = "left-asymmetric")]
    LeftAsymmetric,
    #[serde(rename = "left-symmetric")]
    #[strum(serialize = "left-symmetric")]
    LeftSymmetric,
    #[serde(rename = "right-asymmetric")]
    #[strum(serialize = "right-asymmetric")]
    RightAsymmetric,
    #[serde(rename = "right-symmetric")]
    #[strum(serialize = "right-symmetric")]
    RightSymmetric,
    #[serde(rename = "parity-first")]
    #[strum(serialize = "parity-first")]
    First,
    #[serde(rename = "parity-last")]
    #[strum(serialize = "parity-last")]
    Last,
    #[serde(rename = "left-asymmetric-6")]
    #[strum(serialize = "left-asymmetric-6")]
    LeftAsymmetric6,
    #[serde(rename = "left-symmetric-6")]
    #[strum(serialize = "left-symmetric-6")]
    LeftSymmetric6,
    #[serde(rename = "right-asymmetric-6")]
    #[strum(serialize = "right-asymmetric-6")]
    RightAsymmetric6,
    #[serde(rename = "right-symmetric-6")]
    #[strum(serialize = "right-symmetric-6")]
    RightSymmetric6,
    #[serde(rename = "parity-first-6")]
    #[strum(serialize = "parity-first-6")]
    First6,
    #[serde(rename = "n2")]
    #[strum(serialize = "n2")]
    Near2,
    #[serde(rename = "o2")]
    #[strum(serialize = "o2")]
    Offset2,
    #[serde(rename = "f2")]
    #[strum(serialize = "f2")]
    Far2,
    #[serde(rename = "n3")]
    #[strum(serialize = "n3")]
    Near3,
    #[serde(rename = "o3")]
    #[strum(serialize = "o3")]
    Offset3,
    #[serde(rename = "f3")]
    #[strum(serialize = "f3")]
    Far3,
}

impl MdParity {
    pub fn is_default(&self) -> bool {
        *self == Self::Default
    }
}

fn default_metadata() -> String {
    MD_DEFAULT_METADATA.into()
}

fn default_true() -> bool {
    true
}

fn check_md_name(device_type: DeviceType, name: &str) -> Result<(), BlkplanError> {
    if NUMERIC_NAME.is_match(name) || FORMAT1_NAME.is_match(name) {
        Ok(())
    } else {
        Err(BlkplanError::new(ValidationError::InvalidName {
            device_type: device_type.to_string(),
            name: name.into(),
        }))
    }
}

/// A software RAID array.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Md {
    #[serde(flatten)]
    pub blk: BlkDevice,

    pub level: MdLevel,

    #[serde(default, skip_serializing_if = "MdParity::is_default")]
    pub parity: MdParity,

    /// Configured chunk size in bytes, 0 selects the default.
    #[serde(default)]
    pub chunk_size: u64,

    /// Array uuid in mdadm notation. Empty until known.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,

    #[serde(default = "default_metadata")]
    pub metadata: String,

    /// Whether the array has an ARRAY line in mdadm.conf.
    #[serde(default = "default_true")]
    pub in_etc_mdadm: bool,

    /// Optimal I/O size derived from level, chunk size and member count.
    #[serde(default)]
    pub optimal_io_size: u64,
}

impl Md {
    pub fn new(name: impl Into<String>, level: MdLevel) -> Self {
        Self {
            blk: BlkDevice::new(name, 0),
            level,
            parity: MdParity::Default,
            chunk_size: 0,
            uuid: String::new(),
            metadata: default_metadata(),
            in_etc_mdadm: true,
            optimal_io_size: 0,
        }
    }

    /// Returns the number of a `/dev/md<N>` or `/dev/md/<N>` array.
    pub fn number(&self) -> Option<u32> {
        NUMERIC_NAME
            .captures(&self.blk.name)
            .and_then(|c| c[1].parse().ok())
    }

    pub fn is_numeric(&self) -> bool {
        self.number().is_some()
    }

    /// Name below `/dev/md/`, e.g. `foo` for `/dev/md/foo` and `0` for
    /// `/dev/md0`.
    pub fn short_name(&self) -> &str {
        self.blk
            .name
            .strip_prefix(DEV_MD_PATH)
            .map(|name| name.trim_start_matches('/'))
            .unwrap_or(&self.blk.name)
    }

    /// Chunk size the kernel will use for the array.
    pub fn effective_chunk_size(&self) -> u64 {
        match (self.level, self.chunk_size) {
            (MdLevel::Raid1, _) => MD_RAID1_CHUNK_SIZE,
            (_, 0) => MD_DEFAULT_CHUNK_SIZE,
            (_, chunk_size) => chunk_size,
        }
    }
}

impl DeviceImpl for Md {
    const DEVICE_TYPE: DeviceType = DeviceType::Md;

    fn equal(&self, rhs: &Self) -> bool {
        self.blk.equal(&rhs.blk)
            && self.level == rhs.level
            && self.parity == rhs.parity
            && self.chunk_size == rhs.chunk_size
            && self.uuid == rhs.uuid
            && self.metadata == rhs.metadata
            && self.in_etc_mdadm == rhs.in_etc_mdadm
            && self.optimal_io_size == rhs.optimal_io_size
    }

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        self.blk.log_diff(&rhs.blk, log);
        log.field("level", &self.level, &rhs.level);
        log.field("parity", &self.parity, &rhs.parity);
        log.field("chunk-size", &self.chunk_size, &rhs.chunk_size);
        log.field("uuid", &self.uuid, &rhs.uuid);
        log.field("metadata", &self.metadata, &rhs.metadata);
        log.field("in-etc-mdadm", &self.in_etc_mdadm, &rhs.in_etc_mdadm);
        log.field("optimal-io-size", &self.optimal_io_size, &rhs.optimal_io_size);
    }

    fn check(&self) -> Result<(), BlkplanError> {
        check_md_name(Self::DEVICE_TYPE, &self.blk.name)
    }

    fn used_features(&self) -> UsedFeatures {
        UsedFeatures::MDRAID
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

/// An IMSM or DDF container. Only ever probed, never created.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct MdContainer {
    #[serde(flatten)]
    pub blk: BlkDevice,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,

    #[serde(default)]
    pub metadata: String,
}

impl DeviceImpl for MdContainer {
    const DEVICE_TYPE: DeviceType = DeviceType::MdContainer;

    fn equal(&self, rhs: &Self) -> bool {
        self.blk.equal(&rhs.blk) && self.uuid == rhs.uuid && self.metadata == rhs.metadata
    }

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        self.blk.log_diff(&rhs.blk, log);
        log.field("uuid", &self.uuid, &rhs.uuid);
        log.field("metadata", &self.metadata, &rhs.metadata);
    }

    fn check(&self) -> Result<(), BlkplanError> {
        check_md_name(Self::DEVICE_TYPE, &self.blk.name)
    }

    fn used_features(&self) -> UsedFeatures {
        UsedFeatures::MDRAID
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

/// An array inside an MD container.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct MdMember {
    #[serde(flatten)]
    pub blk: BlkDevice,

    pub level: MdLevel,

    #[serde(default)]
    pub chunk_size: u64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
}

impl DeviceImpl for MdMember {
    const DEVICE_TYPE: DeviceType = DeviceType::MdMember;

    fn equal(&self, rhs: &Self) -> bool {
        self.blk.equal(&rhs.blk)
            && self.level == rhs.level
            && self.chunk_size == rhs.chunk_size
            && self.uuid == rhs.uuid
    }

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        self.blk.log_diff(&rhs.blk, log);
        log.field("level", &self.level, &rhs.level);
        log.field("chunk-size", &self.chunk_size, &rhs.chunk_size);
        log.field("uuid", &self.uuid, &rhs.uuid);
    }

    fn check(&self) -> Result<(), BlkplanError> {
        check_md_name(Self::DEVICE_TYPE, &self.blk.name)
    }

    fn used_features(&self) -> UsedFeatures {
        UsedFeatures::MDRAID
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

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use crate::constants::KIB;

    use super::*;

    #[test]
    fn test_name_grammar() {
        for name in ["/dev/md0", "/dev/md/0", "/dev/md127", "/dev/md/home", "/dev/md/a.b-c"] {
            Md::new(name, MdLevel::Raid1).check().unwrap();
        }
        for name in ["/dev/md", "/dev/md/", "/dev/md/a b", "/dev/md/a/b", "/dev/sda", "md0"] {
            Md::new(name, MdLevel::Raid1).check().unwrap_err();
        }
    }

    #[test]
    fn test_number() {
        assert_eq!(Md::new("/dev/md0", MdLevel::Raid1).number(), Some(0));
        assert_eq!(Md::new("/dev/md/12", MdLevel::Raid1).number(), Some(12));
        assert_eq!(Md::new("/dev/md/home", MdLevel::Raid1).number(), None);
        assert!(!Md::new("/dev/md/home", MdLevel::Raid1).is_numeric());
    }

    #[test]
    fn test_short_name() {
        assert_eq!(Md::new("/dev/md0", MdLevel::Raid1).short_name(), "0");
        assert_eq!(Md::new("/dev/md/0", MdLevel::Raid1).short_name(), "0");
        assert_eq!(Md::new("/dev/md/home", MdLevel::Raid1).short_name(), "home");
    }

    #[test]
    fn test_effective_chunk_size() {
        let mut md = Md::new("/dev/md0", MdLevel::Raid5);
        assert_eq!(md.effective_chunk_size(), 512 * KIB);
        md.chunk_size = 128 * KIB;
        assert_eq!(md.effective_chunk_size(), 128 * KIB);
        md.level = MdLevel::Raid1;
        assert_eq!(md.effective_chunk_size(), 64 * KIB);
    }

    #[test]
    fn test_minimal_number_of_devices() {
        assert_eq!(MdLevel::Raid0.minimal_number_of_devices(), 2);
        assert_eq!(MdLevel::Raid1.minimal_number_of_devices(), 2);
        assert_eq!(MdLevel::Raid5.minimal_number_of_devices(), 3);
        assert_eq!(MdLevel::Raid6.minimal_number_of_devices(), 4);
        assert_eq!(MdLevel::Raid10.minimal_number_of_devices(), 2);
    }

    #[test]
    fn test_parity_strings() {
        assert_eq!(MdParity::LeftSymmetric6.to_string(), "left-symmetric-6");
        assert_eq!(MdParity::from_str("f2").unwrap(), MdParity::Far2);
        assert_eq!(MdLevel::from_str("raid10").unwrap(), MdLevel::Raid10);
        assert_eq!(
            serde_yaml::to_string(&MdParity::First).unwrap().trim(),
            "parity-first"
        );
    }

    #[test]
    fn test_md_deserialize_defaults() {
        let md: Md = serde_yaml::from_str(indoc::indoc! {"
            name: /dev/md0
            level: raid1
        "})
        .unwrap();
        assert_eq!(md, Md::new("/dev/md0", MdLevel::Raid1));
    }
}
