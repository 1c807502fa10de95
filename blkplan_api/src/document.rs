//! Persisted form of a devicegraph.

use std::{fs, path::Path};

use anyhow::{Context, Error};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    constants::DOCUMENT_VERSION,
    devicegraph::{Device, Devicegraph, Holder, Sid},
    error::{BlkplanError, BlkplanResultExt, ReportError, ValidationError},
};

/// Devices and holders of a devicegraph in a serializable layout.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct DevicegraphDocument {
    pub version: u32,

    #[serde(default)]
    pub devices: Vec<Device>,

    #[serde(default)]
    pub holders: Vec<Holder>,
}

impl Devicegraph {
    pub fn to_document(&self) -> DevicegraphDocument {
        DevicegraphDocument {
            version: DOCUMENT_VERSION,
            devices: self.devices().cloned().collect(),
            holders: self.holders().into_iter().cloned().collect(),
        }
    }

    /// Rebuilds a devicegraph, validating every device and holder. Sids are
    /// kept and the sid allocator is advanced past all of them.
    pub fn from_document(document: DevicegraphDocument) -> Result<Self, BlkplanError> {
        if document.version > DOCUMENT_VERSION {
            return Err(BlkplanError::new(
                ValidationError::UnsupportedDocumentVersion {
                    found: document.version,
                    supported: DOCUMENT_VERSION,
                },
            ));
        }

        let mut graph = Devicegraph::new();
        for device in document.devices {
            device
                .check()
                .message(format!("Invalid device {}", device.sid()))?;
            Sid::reserve(device.sid());
            graph.insert_device(device)?;
        }
        for holder in document.holders {
            Sid::reserve(holder.sid());
            let (source, target) = holder.endpoints();
            graph
                .insert_holder(holder)
                .message(format!("Invalid holder {source} -> {target}"))?;
        }
        graph.check()?;

        debug!(
            "Loaded devicegraph with {} devices and {} holders",
            graph.num_devices(),
            graph.num_holders()
        );
        Ok(graph)
    }

    pub fn save_to_string(&self) -> Result<String, BlkplanError> {
        serde_yaml::to_string(&self.to_document()).structured(ValidationError::SerializeDocument)
    }

    pub fn load_from_str(document: &str) -> Result<Self, BlkplanError> {
        let document: DevicegraphDocument =
            serde_yaml::from_str(document).structured(ValidationError::ParseDocument)?;
        Self::from_document(document)
    }

    /// Writes the devicegraph as YAML to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let contents = self
            .save_to_string()
            .unstructured("Failed to serialize devicegraph")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write devicegraph to '{}'", path.display()))
    }

    /// Reads a devicegraph saved by `save`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read devicegraph from '{}'", path.display()))?;
        Self::load_from_str(&contents).unstructured(format!(
            "Failed to load devicegraph from '{}'",
            path.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use maplit::btreemap;

    use crate::{
        constants::{GIB, MIB},
        devicegraph::{
            kinds::{FsType, MdContainer, MdLevel, MdMember, PtType},
            BlkDevice, DeviceKind, HolderKind, Region,
        },
        error::ErrorKind,
    };

    use super::*;

    /// A graph with one device of every variant.
    fn every_variant() -> Devicegraph {
        let mut graph = Devicegraph::new();
        let disk = graph.create_disk("/dev/sda", 500 * GIB).unwrap();
        graph.find_device_mut(disk).unwrap().as_disk_mut().unwrap().partition_table =
            Some(PtType::Gpt);
        let parts: Vec<Sid> = (1..=4)
            .map(|n| {
                graph
                    .create_linux_partition(
                        disk,
                        n,
                        Region::new(MIB + u64::from(n - 1) * 50 * GIB, 50 * GIB),
                    )
                    .unwrap()
            })
            .collect();

        let md = graph.create_md("/dev/md/data", MdLevel::Raid1).unwrap();
        graph.md_add_device(md, parts[0], false).unwrap();
        graph.md_add_device(md, parts[1], true).unwrap();
        graph.find_device_mut(md).unwrap().userdata = btreemap! {
            "purpose".into() => "database".into(),
        };

        let luks = graph.create_luks(md, "cr_data").unwrap();
        let btrfs = graph.create_filesystem(luks, FsType::Btrfs).unwrap();
        let subvolume = graph.create_btrfs_subvolume(btrfs, "@").unwrap();
        graph
            .find_device_mut(subvolume)
            .unwrap()
            .as_btrfs_subvolume_mut()
            .unwrap()
            .default_subvolume = true;
        graph.create_mount_point(btrfs, "/srv").unwrap();

        let vg = graph.create_lvm_vg("system").unwrap();
        graph.vg_add_pv(vg, parts[2]).unwrap();
        let lv = graph.create_lvm_lv(vg, "root", 20 * GIB).unwrap();
        let xfs = graph.create_filesystem(lv, FsType::Xfs).unwrap();
        let mp = graph.create_mount_point(xfs, "/").unwrap();
        graph
            .find_device_mut(mp)
            .unwrap()
            .as_mount_point_mut()
            .unwrap()
            .mount_options = vec!["noatime".into()];

        let container = graph
            .create_probed(DeviceKind::MdContainer(
                MdContainer {
                    blk: BlkDevice::new("/dev/md/imsm0", 0),
                    uuid: "aa:bb:cc:dd".into(),
                    metadata: "imsm".into(),
                },
            ))
            .unwrap();
        let member = graph
            .create_probed(DeviceKind::MdMember(MdMember {
                blk: BlkDevice::new("/dev/md126", 10 * GIB),
                level: MdLevel::Raid0,
                chunk_size: 128 * 1024,
                uuid: "11:22:33:44".into(),
            }))
            .unwrap();
        graph
            .add_holder(container, member, HolderKind::Subdevice)
            .unwrap();
        graph
            .add_holder(
                parts[3],
                container,
                HolderKind::MdUser(Default::default()),
            )
            .unwrap();
        graph
    }

    #[test]
    fn test_save_load_round_trip() {
        let graph = every_variant();
        let document = graph.save_to_string().unwrap();
        let loaded = Devicegraph::load_from_str(&document).unwrap();
        assert!(graph.equal(&loaded), "{}", graph.log_diff(&loaded));
        for device in graph.devices() {
            let reloaded = loaded.find_device(device.sid()).unwrap();
            assert_eq!(reloaded.exists_in_probed(), device.exists_in_probed());
        }
    }

    #[test]
    fn test_round_trip_keeps_derived_regions() {
        let mut graph = Devicegraph::new();
        let disk = graph.create_disk("/dev/sda", 100 * GIB).unwrap();
        graph.find_device_mut(disk).unwrap().as_disk_mut().unwrap().partition_table =
            Some(PtType::Gpt);
        let partition = graph
            .create_linux_partition(disk, 1, Region::new(MIB, 20 * GIB))
            .unwrap();
        let luks = graph.create_luks(partition, "cr_home").unwrap();
        graph.set_region(luks, Region::new(0, 5 * GIB)).unwrap();

        let loaded = Devicegraph::load_from_str(&graph.save_to_string().unwrap()).unwrap();
        assert!(graph.equal(&loaded), "{}", graph.log_diff(&loaded));
        assert_eq!(
            loaded.find_device(luks).unwrap().blk().unwrap().region,
            Region::new(0, 5 * GIB)
        );
    }

    #[test]
    fn test_load_advances_sid_counter() {
        let document = indoc! {"
            version: 1
            devices:
            - sid: 4000000
              kind:
                disk:
                  name: /dev/vda
                  region:
                    start: 0
                    length: 1073741824
        "};
        let mut graph = Devicegraph::load_from_str(document).unwrap();
        let disk = graph.find_by_name("/dev/vda").unwrap().sid();
        assert_eq!(disk.value(), 4_000_000);
        let new = graph.create_disk("/dev/vdb", GIB).unwrap();
        assert!(new.value() > 4_000_000);
    }

    #[test]
    fn test_load_rejects_newer_version() {
        let err = Devicegraph::load_from_str("version: 99\n").unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Validation(ValidationError::UnsupportedDocumentVersion {
                found: 99,
                supported: DOCUMENT_VERSION,
            })
        );
    }

    #[test]
    fn test_load_revalidates() {
        let bad_name = indoc! {"
            version: 1
            devices:
            - sid: 5000000
              kind:
                md:
                  name: /dev/md/a b
                  level: raid1
        "};
        let err = Devicegraph::load_from_str(bad_name).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Validation(_)));

        let bad_holder = indoc! {"
            version: 1
            devices:
            - sid: 5000001
              kind:
                disk:
                  name: /dev/vda
            - sid: 5000002
              kind:
                mount-point:
                  path: /
            holders:
            - sid: 5000003
              source: 5000001
              target: 5000002
              kind:
                type: using
        "};
        let err = Devicegraph::load_from_str(bad_holder).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::GraphConsistency(_)));

        let err = Devicegraph::load_from_str("devices: [").unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Validation(ValidationError::ParseDocument)
        );
    }

    #[test]
    fn test_save_load_file() {
        let graph = every_variant();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staging.yaml");
        graph.save(&path).unwrap();
        let loaded = Devicegraph::load(&path).unwrap();
        assert!(graph.equal(&loaded));

        Devicegraph::load(dir.path().join("missing.yaml")).unwrap_err();
    }
}
