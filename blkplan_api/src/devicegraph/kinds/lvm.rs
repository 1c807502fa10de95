use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    constants::{DEV_PATH, LVM_DEFAULT_EXTENT_SIZE, LVM_MAX_NAME_LENGTH},
    devicegraph::{
        device::{BlkDevice, DeviceImpl, DiffLog},
        types::{DeviceType, UsedFeatures},
    },
    error::{BlkplanError, ValidationError},
};

lazy_static! {
    static ref LVM_NAME: Regex = Regex::new(r"^[A-Za-z0-9+_.][A-Za-z0-9+_.-]*$").unwrap();
}

/// Substrings LVM reserves for its internal volumes.
const RESERVED_LV_SUBSTRINGS: &[&str] = &[
    "_cdata", "_cmeta", "_corig", "_mlog", "_mimage", "_pmspare", "_rimage", "_rmeta",
    "_tdata", "_tmeta", "_vorigin", "pvmove", "snapshot",
];

fn check_lvm_name(device_type: DeviceType, name: &str) -> Result<(), BlkplanError> {
    let valid = name.len() <= LVM_MAX_NAME_LENGTH
        && name != "."
        && name != ".."
        && LVM_NAME.is_match(name)
        && (device_type != DeviceType::LvmLv
            || !RESERVED_LV_SUBSTRINGS.iter().any(|s| name.contains(s)));

    if valid {
        Ok(())
    } else {
        Err(BlkplanError::new(ValidationError::InvalidName {
            device_type: device_type.to_string(),
            name: name.into(),
        }))
    }
}

/// An LVM physical volume on a block device.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct LvmPv {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
}

impl DeviceImpl for LvmPv {
    const DEVICE_TYPE: DeviceType = DeviceType::LvmPv;

    fn equal(&self, rhs: &Self) -> bool {
        self.uuid == rhs.uuid
    }

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        log.field("uuid", &self.uuid, &rhs.uuid);
    }

    fn used_features(&self) -> UsedFeatures {
        UsedFeatures::LVM
    }

    fn display_name(&self) -> String {
        match self.uuid.is_empty() {
            true => "pv".into(),
            false => format!("pv {}", self.uuid),
        }
    }
}

fn default_extent_size() -> u64 {
    LVM_DEFAULT_EXTENT_SIZE
}

/// An LVM volume group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct LvmVg {
    pub vg_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,

    #[serde(default = "default_extent_size")]
    pub extent_size: u64,
}

impl LvmVg {
    pub fn new(vg_name: impl Into<String>) -> Self {
        Self {
            vg_name: vg_name.into(),
            uuid: String::new(),
            extent_size: LVM_DEFAULT_EXTENT_SIZE,
        }
    }
}

impl DeviceImpl for LvmVg {
    const DEVICE_TYPE: DeviceType = DeviceType::LvmVg;

    fn equal(&self, rhs: &Self) -> bool {
        self.vg_name == rhs.vg_name && self.uuid == rhs.uuid && self.extent_size == rhs.extent_size
    }

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        log.field("vg-name", &self.vg_name, &rhs.vg_name);
        log.field("uuid", &self.uuid, &rhs.uuid);
        log.field("extent-size", &self.extent_size, &rhs.extent_size);
    }

    fn check(&self) -> Result<(), BlkplanError> {
        check_lvm_name(Self::DEVICE_TYPE, &self.vg_name)
    }

    fn used_features(&self) -> UsedFeatures {
        UsedFeatures::LVM
    }

    fn display_name(&self) -> String {
        format!("{DEV_PATH}/{}", self.vg_name)
    }
}

fn default_stripes() -> u32 {
    1
}

/// An LVM logical volume. The block device name is `/dev/<vg>/<lv>`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct LvmLv {
    #[serde(flatten)]
    pub blk: BlkDevice,

    pub lv_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,

    #[serde(default = "default_stripes")]
    pub stripes: u32,
}

impl LvmLv {
    pub fn new(vg_name: &str, lv_name: impl Into<String>, size: u64) -> Self {
        let lv_name = lv_name.into();
        Self {
            blk: BlkDevice::new(Self::name_in(vg_name, &lv_name), size),
            lv_name,
            uuid: String::new(),
            stripes: 1,
        }
    }

    pub fn name_in(vg_name: &str, lv_name: &str) -> String {
        format!("{DEV_PATH}/{vg_name}/{lv_name}")
    }
}

impl DeviceImpl for LvmLv {
    const DEVICE_TYPE: DeviceType = DeviceType::LvmLv;

    fn equal(&self, rhs: &Self) -> bool {
        self.blk.equal(&rhs.blk)
            && self.lv_name == rhs.lv_name
            && self.uuid == rhs.uuid
            && self.stripes == rhs.stripes
    }

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        self.blk.log_diff(&rhs.blk, log);
        log.field("lv-name", &self.lv_name, &rhs.lv_name);
        log.field("uuid", &self.uuid, &rhs.uuid);
        log.field("stripes", &self.stripes, &rhs.stripes);
    }

    fn check(&self) -> Result<(), BlkplanError> {
        self.blk.check(Self::DEVICE_TYPE)?;
        check_lvm_name(Self::DEVICE_TYPE, &self.lv_name)?;
        if !self.blk.name.ends_with(&format!("/{}", self.lv_name)) {
            return Err(BlkplanError::new(ValidationError::InvalidName {
                device_type: Self::DEVICE_TYPE.to_string(),
                name: self.blk.name.clone(),
            }));
        }
        Ok(())
    }

    fn used_features(&self) -> UsedFeatures {
        UsedFeatures::LVM
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
    use super::*;

    #[test]
    fn test_vg_name_grammar() {
        for name in ["system", "vg0", "a+b_c.d-e", "_x"] {
            LvmVg::new(name).check().unwrap();
        }
        let too_long = "v".repeat(128);
        for name in ["", ".", "..", "-vg", "v g", "vg/0", too_long.as_str()] {
            LvmVg::new(name).check().unwrap_err();
        }
    }

    #[test]
    fn test_lv_name_grammar() {
        LvmLv::new("system", "root", 1 << 30).check().unwrap();
        LvmLv::new("system", "root_tmeta", 1 << 30).check().unwrap_err();
        LvmLv::new("system", "mysnapshot", 1 << 30).check().unwrap_err();
        LvmLv::new("system", "pvmove0", 1 << 30).check().unwrap_err();

        // Names with reserved substrings are fine for volume groups.
        LvmVg::new("snapshot").check().unwrap();
    }

    #[test]
    fn test_lv_block_name() {
        let lv = LvmLv::new("system", "home", 1 << 30);
        assert_eq!(lv.blk.name, "/dev/system/home");

        let mut renamed = lv.clone();
        renamed.lv_name = "data".into();
        renamed.check().unwrap_err();
    }
}
