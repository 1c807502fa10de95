use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display},
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{BlkplanError, ReportError, ValidationError};

use super::{
    kinds::{
        BlkFilesystem, BtrfsSubvolume, Disk, LvmLv, LvmPv, LvmVg, Luks, Md, MdContainer,
        MdMember, MountPoint, Partition,
    },
    types::{DeviceType, UsedFeatures},
    Sid,
};

/// Start and length of a block device, in bytes.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Region {
    pub start: u64,
    pub length: u64,
}

impl Region {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// First byte after the region, `None` if it lies beyond `u64::MAX`.
    pub fn end(&self) -> Option<u64> {
        self.start.checked_add(self.length)
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.length)
    }
}

/// Fields shared by every device with a `/dev` node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BlkDevice {
    pub name: String,
    #[serde(default)]
    pub region: Region,
}

impl BlkDevice {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            region: Region::new(0, size),
        }
    }

    pub fn size(&self) -> u64 {
        self.region.length
    }

    pub(crate) fn equal(&self, rhs: &Self) -> bool {
        self.name == rhs.name && self.region == rhs.region
    }

    pub(crate) fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        log.field("name", &self.name, &rhs.name);
        log.field("region", &self.region, &rhs.region);
    }

    /// Every block device lives below `/dev`.
    pub(crate) fn check(&self, device_type: DeviceType) -> Result<(), BlkplanError> {
        if !self.name.starts_with("/dev/") || self.name.contains(char::is_whitespace) {
            return Err(BlkplanError::new(ValidationError::InvalidName {
                device_type: device_type.to_string(),
                name: self.name.clone(),
            }));
        }
        Ok(())
    }
}

/// Collects the fields in which two devices differ.
#[derive(Debug, Default)]
pub struct DiffLog {
    entries: Vec<String>,
}

impl DiffLog {
    pub fn field<T: Debug + PartialEq>(&mut self, name: &str, lhs: &T, rhs: &T) {
        if lhs != rhs {
            self.entries.push(format!("{name}: {lhs:?} -> {rhs:?}"));
        }
    }

    pub fn push(&mut self, entry: impl Into<String>) {
        self.entries.push(entry.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

impl Display for DiffLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entries.join(", "))
    }
}

/// Behavior every device variant provides.
pub(crate) trait DeviceImpl {
    const DEVICE_TYPE: DeviceType;

    /// Compares the type-specific fields. Derived values (sizes computed from
    /// members, topology) are compared too.
    fn equal(&self, rhs: &Self) -> bool;

    fn log_diff(&self, rhs: &Self, log: &mut DiffLog);

    /// Checks the name grammar and the type-specific field constraints.
    fn check(&self) -> Result<(), BlkplanError> {
        Ok(())
    }

    fn used_features(&self) -> UsedFeatures {
        UsedFeatures::empty()
    }

    fn blk(&self) -> Option<&BlkDevice> {
        None
    }

    fn blk_mut(&mut self) -> Option<&mut BlkDevice> {
        None
    }

    /// Short human readable name, e.g. `/dev/sda1`, `ext4` or `/home`.
    fn display_name(&self) -> String;
}

/// Closed set of device variants.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Disk(Disk),
    Partition(Partition),
    Md(Md),
    MdContainer(MdContainer),
    MdMember(MdMember),
    LvmPv(LvmPv),
    LvmVg(LvmVg),
    LvmLv(LvmLv),
    Luks(Luks),
    BlkFilesystem(BlkFilesystem),
    BtrfsSubvolume(BtrfsSubvolume),
    MountPoint(MountPoint),
}

/// Forwards a call to the `DeviceImpl` of whatever variant `$kind` holds.
macro_rules! dispatch {
    ($kind:expr, $inner:ident => $body:expr) => {
        match $kind {
            DeviceKind::Disk($inner) => $body,
            DeviceKind::Partition($inner) => $body,
            DeviceKind::Md($inner) => $body,
            DeviceKind::MdContainer($inner) => $body,
            DeviceKind::MdMember($inner) => $body,
            DeviceKind::LvmPv($inner) => $body,
            DeviceKind::LvmVg($inner) => $body,
            DeviceKind::LvmLv($inner) => $body,
            DeviceKind::Luks($inner) => $body,
            DeviceKind::BlkFilesystem($inner) => $body,
            DeviceKind::BtrfsSubvolume($inner) => $body,
            DeviceKind::MountPoint($inner) => $body,
        }
    };
}

/// Forwards a call taking two devices of the same variant. Evaluates
/// `$mismatch` when the variants differ.
macro_rules! dispatch_pair {
    ($lhs:expr, $rhs:expr, ($l:ident, $r:ident) => $body:expr, _ => $mismatch:expr) => {
        match ($lhs, $rhs) {
            (DeviceKind::Disk($l), DeviceKind::Disk($r)) => $body,
            (DeviceKind::Partition($l), DeviceKind::Partition($r)) => $body,
            (DeviceKind::Md($l), DeviceKind::Md($r)) => $body,
            (DeviceKind::MdContainer($l), DeviceKind::MdContainer($r)) => $body,
            (DeviceKind::MdMember($l), DeviceKind::MdMember($r)) => $body,
            (DeviceKind::LvmPv($l), DeviceKind::LvmPv($r)) => $body,
            (DeviceKind::LvmVg($l), DeviceKind::LvmVg($r)) => $body,
            (DeviceKind::LvmLv($l), DeviceKind::LvmLv($r)) => $body,
            (DeviceKind::Luks($l), DeviceKind::Luks($r)) => $body,
            (DeviceKind::BlkFilesystem($l), DeviceKind::BlkFilesystem($r)) => $body,
            (DeviceKind::BtrfsSubvolume($l), DeviceKind::BtrfsSubvolume($r)) => $body,
            (DeviceKind::MountPoint($l), DeviceKind::MountPoint($r)) => $body,
            _ => $mismatch,
        }
    };
}

pub(crate) use {dispatch, dispatch_pair};

fn device_type_of<T: DeviceImpl>(_: &T) -> DeviceType {
    T::DEVICE_TYPE
}

impl DeviceKind {
    pub fn device_type(&self) -> DeviceType {
        dispatch!(self, d => device_type_of(d))
    }

    /// Compares two variants. Devices of different types are never equal.
    pub fn equal(&self, rhs: &Self) -> bool {
        dispatch_pair!(self, rhs, (l, r) => l.equal(r), _ => false)
    }

    pub fn log_diff(&self, rhs: &Self, log: &mut DiffLog) {
        dispatch_pair!(self, rhs, (l, r) => l.log_diff(r, log), _ => log.field(
            "type",
            &self.device_type(),
            &rhs.device_type(),
        ))
    }

    pub fn check(&self) -> Result<(), BlkplanError> {
        dispatch!(self, d => d.check())
    }

    pub fn used_features(&self) -> UsedFeatures {
        dispatch!(self, d => d.used_features())
    }

    pub fn blk(&self) -> Option<&BlkDevice> {
        dispatch!(self, d => d.blk())
    }

    pub fn blk_mut(&mut self) -> Option<&mut BlkDevice> {
        dispatch!(self, d => d.blk_mut())
    }

    pub fn display_name(&self) -> String {
        dispatch!(self, d => d.display_name())
    }
}

/// A node of the devicegraph.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Device {
    pub(crate) sid: Sid,

    /// Set on devices that came from probing, or that were committed since.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub(crate) exists_in_probed: bool,

    /// Free-form data attached by the caller, carried through diffs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub userdata: BTreeMap<String, String>,

    pub kind: DeviceKind,
}

impl Device {
    pub(crate) fn new(sid: Sid, kind: DeviceKind) -> Self {
        Self {
            sid,
            exists_in_probed: false,
            userdata: BTreeMap::new(),
            kind,
        }
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn exists_in_probed(&self) -> bool {
        self.exists_in_probed
    }

    pub fn device_type(&self) -> DeviceType {
        self.kind.device_type()
    }

    /// Compares userdata and all device fields. The sid and the probed
    /// marker are not part of equality.
    pub fn equal(&self, rhs: &Self) -> bool {
        self.userdata == rhs.userdata && self.kind.equal(&rhs.kind)
    }

    /// Logs the fields in which `rhs` differs and returns them.
    pub fn log_diff(&self, rhs: &Self) -> DiffLog {
        let mut log = DiffLog::default();
        log.field("userdata", &self.userdata, &rhs.userdata);
        self.kind.log_diff(&rhs.kind, &mut log);
        if !log.is_empty() {
            debug!("Device {} ({}) differs: {}", self.sid, self.name(), log);
        }
        log
    }

    pub fn check(&self) -> Result<(), BlkplanError> {
        self.kind.check()
    }

    pub fn used_features(&self) -> UsedFeatures {
        self.kind.used_features()
    }

    pub fn blk(&self) -> Option<&BlkDevice> {
        self.kind.blk()
    }

    pub(crate) fn blk_mut(&mut self) -> Option<&mut BlkDevice> {
        self.kind.blk_mut()
    }

    /// Returns the block device base or fails with a validation error.
    pub fn require_blk(&self) -> Result<&BlkDevice, BlkplanError> {
        self.blk()
            .structured(ValidationError::NotABlockDevice { sid: self.sid })
    }

    /// Short human readable name, e.g. `/dev/sda1`, `ext4` or `/home`.
    pub fn name(&self) -> String {
        self.kind.display_name()
    }

    /// Returns a description suitable for logging, e.g. `md '/dev/md0'`.
    pub fn describe(&self) -> String {
        format!("{} '{}'", self.device_type(), self.name())
    }

    pub(crate) fn wrong_type(&self, expected: DeviceType) -> BlkplanError {
        BlkplanError::new(ValidationError::WrongDeviceType {
            sid: self.sid,
            expected: expected.to_string(),
            found: self.device_type().to_string(),
        })
    }
}

/// Typed accessors, `as_md()` returns the md variant or `None`.
macro_rules! accessors {
    ($($variant:ident: $as_ref:ident, $as_mut:ident;)*) => {
        impl Device {
            $(
                pub fn $as_ref(&self) -> Option<&$variant> {
                    match &self.kind {
                        DeviceKind::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }

                pub fn $as_mut(&mut self) -> Option<&mut $variant> {
                    match &mut self.kind {
                        DeviceKind::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            )*
        }
    };
}

accessors! {
    Disk: as_disk, as_disk_mut;
    Partition: as_partition, as_partition_mut;
    Md: as_md, as_md_mut;
    MdContainer: as_md_container, as_md_container_mut;
    MdMember: as_md_member, as_md_member_mut;
    LvmPv: as_lvm_pv, as_lvm_pv_mut;
    LvmVg: as_lvm_vg, as_lvm_vg_mut;
    LvmLv: as_lvm_lv, as_lvm_lv_mut;
    Luks: as_luks, as_luks_mut;
    BlkFilesystem: as_blk_filesystem, as_blk_filesystem_mut;
    BtrfsSubvolume: as_btrfs_subvolume, as_btrfs_subvolume_mut;
    MountPoint: as_mount_point, as_mount_point_mut;
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use crate::devicegraph::kinds::{FsType, MdLevel};

    use super::*;

    fn device(kind: DeviceKind) -> Device {
        Device::new(Sid::allocate(), kind)
    }

    #[test]
    fn test_equal_ignores_sid_and_probed_marker() {
        let lhs = device(DeviceKind::Md(Md::new("/dev/md0", MdLevel::Raid1)));
        let mut rhs = lhs.clone();
        rhs.sid = Sid::allocate();
        rhs.exists_in_probed = true;
        assert!(lhs.equal(&rhs));
        assert!(lhs.log_diff(&rhs).is_empty());
    }

    #[test]
    fn test_equal_compares_userdata() {
        let lhs = device(DeviceKind::Disk(Disk::new("/dev/sda", 1 << 30)));
        let mut rhs = lhs.clone();
        rhs.userdata = btreemap! { "owner".into() => "db".into() };
        assert!(!lhs.equal(&rhs));
        assert_eq!(lhs.log_diff(&rhs).entries().len(), 1);
    }

    #[test]
    fn test_equal_mismatched_variants() {
        let disk = device(DeviceKind::Disk(Disk::new("/dev/sda", 1 << 30)));
        let fs = device(DeviceKind::BlkFilesystem(BlkFilesystem::new(FsType::Ext4)));
        assert!(!disk.equal(&fs));
        assert!(!fs.equal(&disk));
        assert_eq!(
            disk.log_diff(&fs).entries(),
            ["type: Disk -> BlkFilesystem".to_string()]
        );
    }

    #[test]
    fn test_log_diff_lists_fields() {
        let lhs = device(DeviceKind::Md(Md::new("/dev/md0", MdLevel::Raid1)));
        let mut rhs = lhs.clone();
        {
            let md = rhs.as_md_mut().unwrap();
            md.blk.name = "/dev/md1".into();
            md.level = MdLevel::Raid5;
        }
        let log = lhs.log_diff(&rhs);
        assert_eq!(log.entries().len(), 2);
        assert!(log.entries()[0].starts_with("name:"));
        assert!(log.entries()[1].starts_with("level:"));
    }

    #[test]
    fn test_accessors() {
        let md = device(DeviceKind::Md(Md::new("/dev/md0", MdLevel::Raid0)));
        assert!(md.as_md().is_some());
        assert!(md.as_disk().is_none());
        assert_eq!(md.require_blk().unwrap().name, "/dev/md0");
        assert_eq!(md.describe(), "md '/dev/md0'");

        let fs = device(DeviceKind::BlkFilesystem(BlkFilesystem::new(FsType::Xfs)));
        assert!(fs.require_blk().is_err());
    }

    #[test]
    fn test_blk_check() {
        assert!(BlkDevice::new("/dev/sda", 0).check(DeviceType::Disk).is_ok());
        assert!(BlkDevice::new("sda", 0).check(DeviceType::Disk).is_err());
        assert!(BlkDevice::new("/dev/sd a", 0)
            .check(DeviceType::Disk)
            .is_err());
    }
}
