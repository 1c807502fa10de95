//! Turns the facts of a [`SystemInfo`] into a probed devicegraph.
//!
//! Devices are added bottom-up: disks and partitions, arrays, encryption
//! layers and LVM, then filesystems and their mount points. Every device is
//! created as existing in the probed graph. Btrfs subvolumes are not probed.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use log::{debug, trace, warn};

use blkplan_api::{
    constants::{DEV_MAPPER_PATH, DEV_MD_PATH, DEV_PATH},
    devicegraph::{
        kinds::{
            BlkFilesystem, Disk, FsType, Luks, LvmLv, LvmPv, LvmVg, Md, MdContainer, MdMember,
            MountPoint, Partition,
        },
        md_size_and_optimal_io, BlkDevice, DeviceKind, FilesystemUser, HolderKind, MdUser,
        Region,
    },
    error::{BlkplanError, BlkplanResultExt, CommandFailureError, ReportError},
    DeviceType, Devicegraph, Sid,
};
use osutils::{
    etc_mdadm,
    lsblk::BlockDevice,
    mdstat::MdstatEntry,
    partitions,
    system_info::{SystemInfo, SYS_BLOCK_PATH},
};

fn probe_error(what: impl Into<String>) -> CommandFailureError {
    CommandFailureError::Probe { what: what.into() }
}

/// Builds one probed graph. Devices are looked up by every name they are
/// known under: lsblk names, kernel names and device mapper paths.
struct Prober<'s> {
    info: &'s dyn SystemInfo,
    graph: Devicegraph,
    names: BTreeMap<String, Sid>,
}

impl<'s> Prober<'s> {
    fn new(info: &'s dyn SystemInfo) -> Self {
        Self {
            info,
            graph: Devicegraph::new(),
            names: BTreeMap::new(),
        }
    }

    fn add(&mut self, kind: DeviceKind, names: &[&str]) -> Result<Sid, BlkplanError> {
        let sid = self.graph.create_probed(kind)?;
        for name in names {
            self.names.insert(name.to_string(), sid);
        }
        Ok(sid)
    }

    fn lookup(&self, name: &str) -> Option<Sid> {
        self.names.get(name).copied()
    }

    fn block_devices_of_type(&self, device_type: &str) -> Result<Vec<&'s BlockDevice>, BlkplanError> {
        Ok(self
            .info
            .block_devices()?
            .iter()
            .filter(|device| device.device_type == device_type)
            .collect())
    }

    fn block_device(&self, kernel_name: &str) -> Result<Option<&'s BlockDevice>, BlkplanError> {
        Ok(self
            .info
            .block_devices()?
            .iter()
            .find(|device| device.kernel_name == kernel_name || device.name == kernel_name))
    }

    fn probe_disks(&mut self) -> Result<(), BlkplanError> {
        for device in self.block_devices_of_type("disk")? {
            let mut disk = Disk::new(&device.name, device.size);
            disk.partition_table = device
                .partition_table
                .as_deref()
                .and_then(partitions::table_type);
            trace!("Found disk '{}'", device.name);
            self.add(
                DeviceKind::Disk(disk),
                &[&device.name, &device.kernel_name],
            )?;
        }
        Ok(())
    }

    fn probe_partitions(&mut self) -> Result<(), BlkplanError> {
        for device in self.block_devices_of_type("part")? {
            let Some(disk) = device
                .parent_kernel_name
                .as_deref()
                .and_then(|parent| self.lookup(parent))
                .filter(|disk| {
                    self.graph
                        .find_device(*disk)
                        .is_ok_and(|d| d.device_type() == DeviceType::Disk)
                })
            else {
                debug!("Skipping partition '{}' not on a disk", device.name);
                continue;
            };

            let start = device
                .start_bytes()
                .structured(probe_error(format!("start of partition '{}'", device.name)))?;
            let number = device
                .partition_number
                .structured(probe_error(format!("number of partition '{}'", device.name)))?;
            let partition = Partition {
                blk: BlkDevice {
                    name: device.name.clone(),
                    region: Region::new(start, device.size),
                },
                number,
                id: device
                    .partition_type
                    .as_deref()
                    .map(partitions::partition_id)
                    .unwrap_or_default(),
            };
            trace!("Found partition '{}'", device.name);
            let sid = self.add(
                DeviceKind::Partition(partition),
                &[&device.name, &device.kernel_name],
            )?;
            self.graph.add_holder(disk, sid, HolderKind::Subdevice)?;
        }
        Ok(())
    }

    /// Adds the members listed in mdstat as users of an array or container.
    fn add_md_members(&mut self, entry: &MdstatEntry, md: Sid) -> Result<(), BlkplanError> {
        for member in &entry.devices {
            let sid = self
                .lookup(&member.name)
                .structured(probe_error(format!("md member '{}'", member.name)))?;
            self.graph.add_holder(
                sid,
                md,
                HolderKind::MdUser(MdUser {
                    spare: member.spare,
                    faulty: member.faulty,
                    sort_key: member.role,
                }),
            )?;
        }
        Ok(())
    }

    fn probe_mds(&mut self) -> Result<(), BlkplanError> {
        let mdstat = self.info.proc_mdstat()?;
        let mut arrays: Vec<(String, &MdstatEntry)> = self
            .info
            .dir_entries(Path::new(SYS_BLOCK_PATH))?
            .into_iter()
            .filter(|entry| entry.starts_with("md"))
            .filter_map(|kernel_name| {
                let entry = mdstat.entry(&kernel_name)?;
                Some((kernel_name, entry))
            })
            .collect();
        // Members of a container need the container.
        arrays.sort_by_key(|(_, entry)| !entry.is_container);

        let etc_mdadm = self.info.etc_mdadm()?;
        for (kernel_name, entry) in arrays {
            let kernel_path = format!("{DEV_PATH}/{kernel_name}");
            let detail = self.info.mdadm_detail(&kernel_path)?;
            let name = detail
                .devname
                .as_ref()
                .map(|devname| format!("{DEV_MD_PATH}/{devname}"))
                .unwrap_or_else(|| kernel_path.clone());
            let size = self
                .block_device(&kernel_path)?
                .map(|device| device.size)
                .unwrap_or_default();
            let blk = BlkDevice::new(&name, size);
            debug!("Found array '{name}' ({kernel_name})");

            if entry.is_container {
                let container = MdContainer {
                    blk,
                    uuid: detail.uuid.clone(),
                    metadata: entry.metadata.clone(),
                };
                let sid = self.add(
                    DeviceKind::MdContainer(container),
                    &[&name, &kernel_path],
                )?;
                self.add_md_members(entry, sid)?;
                continue;
            }

            let level = entry
                .level
                .or(detail.level)
                .structured(probe_error(format!("level of array '{name}'")))?;

            if entry.has_container {
                // external:/md127/0
                let container = entry
                    .metadata
                    .trim_start_matches("external:/")
                    .split('/')
                    .next()
                    .map(|container| format!("{DEV_PATH}/{container}"))
                    .and_then(|container| self.lookup(&container))
                    .structured(probe_error(format!("container of array '{name}'")))?;
                let member = MdMember {
                    blk,
                    level,
                    chunk_size: entry.chunk_size,
                    uuid: detail.uuid.clone(),
                };
                let sid = self.add(DeviceKind::MdMember(member), &[&name, &kernel_path])?;
                self.graph
                    .add_holder(container, sid, HolderKind::Subdevice)?;
                continue;
            }

            let mut md = Md::new(&name, level);
            md.blk = blk;
            md.parity = entry.parity;
            md.chunk_size = entry.chunk_size;
            md.uuid = detail.uuid.clone();
            md.metadata = Some(detail.metadata.clone())
                .filter(|metadata| !metadata.is_empty())
                .unwrap_or_else(|| entry.metadata.clone());
            md.in_etc_mdadm = etc_mdadm::has_entry(etc_mdadm, &detail.uuid);

            let mut member_sizes = Vec::new();
            for member in &entry.devices {
                if let Some(blk) = self
                    .lookup(&member.name)
                    .and_then(|sid| self.graph.find_device(sid).ok())
                    .and_then(|device| device.blk())
                {
                    member_sizes.push((blk.size(), member.spare));
                }
            }
            let (_, optimal_io_size) =
                md_size_and_optimal_io(level, md.effective_chunk_size(), &member_sizes);
            md.optimal_io_size = optimal_io_size;

            let sid = self.add(DeviceKind::Md(md), &[&name, &kernel_path])?;
            self.add_md_members(entry, sid)?;
        }
        Ok(())
    }

    /// Adds the open LUKS devices whose backing device is known. Called
    /// before and after LVM, encryption can sit on either side.
    fn probe_luks(&mut self) -> Result<(), BlkplanError> {
        let blkid = self.info.blkid()?;
        for device in self.block_devices_of_type("crypt")? {
            if self.lookup(&device.name).is_some() {
                continue;
            }
            let Some((backing_name, backing)) = device
                .parent_kernel_name
                .as_deref()
                .and_then(|parent| Some((parent, self.lookup(parent)?)))
            else {
                continue;
            };
            let Some(backing_device) = self.graph.find_device(backing)?.blk() else {
                continue;
            };
            let uuid = blkid
                .get(&backing_device.name)
                .or_else(|| blkid.get(backing_name))
                .filter(|entry| entry.is_luks())
                .and_then(|entry| entry.uuid.clone());
            let Some(uuid) = uuid else {
                debug!("Skipping '{}', its backing device is not LUKS", device.name);
                continue;
            };

            let dm_table_name = device
                .name
                .trim_start_matches(DEV_MAPPER_PATH)
                .trim_start_matches('/')
                .to_string();
            let mut luks = Luks::new(&dm_table_name);
            luks.blk.region = Region::new(0, device.size);
            luks.uuid = uuid;
            trace!("Found LUKS device '{}'", device.name);
            let sid = self.add(
                DeviceKind::Luks(luks),
                &[&device.name, &device.kernel_name],
            )?;
            self.graph.add_holder(backing, sid, HolderKind::User)?;
        }
        Ok(())
    }

    fn probe_lvm(&mut self) -> Result<(), BlkplanError> {
        let report = self.info.lvm_report()?;

        let mut vgs = BTreeMap::new();
        for vg in &report.vgs {
            let mut lvm_vg = LvmVg::new(&vg.vg_name);
            lvm_vg.uuid = vg.vg_uuid.clone();
            lvm_vg.extent_size = vg.vg_extent_size;
            trace!("Found volume group '{}'", vg.vg_name);
            vgs.insert(vg.vg_name.as_str(), self.graph.create_probed(DeviceKind::LvmVg(lvm_vg))?);
        }

        for pv in &report.pvs {
            let Some(blk) = self.lookup(&pv.pv_name) else {
                warn!("Skipping physical volume on unknown device '{}'", pv.pv_name);
                continue;
            };
            let sid = self.graph.create_probed(DeviceKind::LvmPv(LvmPv {
                uuid: pv.pv_uuid.clone(),
            }))?;
            self.graph.add_holder(blk, sid, HolderKind::User)?;
            if let Some(vg) = vgs.get(pv.vg_name.as_str()) {
                self.graph.add_holder(sid, *vg, HolderKind::User)?;
            }
        }

        for lv in &report.lvs {
            let vg = *vgs
                .get(lv.vg_name.as_str())
                .structured(probe_error(format!("volume group '{}'", lv.vg_name)))?;
            let mut lvm_lv = LvmLv::new(&lv.vg_name, &lv.lv_name, lv.lv_size);
            lvm_lv.uuid = lv.lv_uuid.clone();
            lvm_lv.stripes = lv.stripes.max(1);
            let name = lvm_lv.blk.name.clone();
            trace!("Found logical volume '{name}'");
            let sid = self.add(DeviceKind::LvmLv(lvm_lv), &[&name, &lv.lv_dm_path])?;
            self.graph.add_holder(vg, sid, HolderKind::Subdevice)?;
        }
        Ok(())
    }

    fn probe_filesystems(&mut self) -> Result<(), BlkplanError> {
        let mut btrfs_by_uuid: BTreeMap<String, Sid> = BTreeMap::new();
        for (devname, entry) in self.info.blkid()? {
            let Some(fs_type) = entry
                .fs_type
                .as_deref()
                .and_then(|fs_type| fs_type.parse::<FsType>().ok())
            else {
                continue;
            };
            let Some(blk) = self.lookup(devname) else {
                debug!("Skipping {fs_type} on unknown device '{devname}'");
                continue;
            };
            let uuid = entry.uuid.clone().unwrap_or_default();

            if fs_type == FsType::Btrfs {
                if let Some(fs) = btrfs_by_uuid.get(&uuid) {
                    self.graph.add_holder(
                        blk,
                        *fs,
                        HolderKind::FilesystemUser(FilesystemUser::default()),
                    )?;
                    continue;
                }
            }

            let mut filesystem = BlkFilesystem::new(fs_type);
            filesystem.uuid = uuid.clone();
            filesystem.label = entry.label.clone().unwrap_or_default();
            trace!("Found {fs_type} on '{devname}'");
            let sid = self
                .graph
                .create_probed(DeviceKind::BlkFilesystem(filesystem))?;
            self.graph.add_holder(
                blk,
                sid,
                HolderKind::FilesystemUser(FilesystemUser::default()),
            )?;
            if fs_type == FsType::Btrfs && !uuid.is_empty() {
                btrfs_by_uuid.insert(uuid, sid);
            }
        }
        Ok(())
    }

    /// The first mount point of a filesystem is kept, further mounts (bind
    /// mounts, subvolumes) are ignored.
    fn probe_mount_points(&mut self) -> Result<(), BlkplanError> {
        for device in self.info.block_devices()? {
            let Some(path) = device.mount_points().next() else {
                continue;
            };
            let Some(blk) = self.lookup(&device.name) else {
                continue;
            };
            let Some(fs) = self
                .graph
                .children(blk)?
                .into_iter()
                .find(|child| child.device_type() == DeviceType::BlkFilesystem)
                .map(|fs| fs.sid())
            else {
                continue;
            };
            if self.graph.mount_point_of(fs)?.is_some() {
                continue;
            }

            trace!("Found mount point '{path}' of '{}'", device.name);
            let sid = self
                .graph
                .create_probed(DeviceKind::MountPoint(MountPoint::new(PathBuf::from(path))))?;
            self.graph.add_holder(fs, sid, HolderKind::Using)?;
        }
        Ok(())
    }

    fn run(mut self) -> Result<Devicegraph, BlkplanError> {
        self.probe_disks().message("Failed to probe disks")?;
        self.probe_partitions().message("Failed to probe partitions")?;
        self.probe_mds().message("Failed to probe RAID arrays")?;
        self.probe_luks().message("Failed to probe encrypted devices")?;
        self.probe_lvm().message("Failed to probe LVM")?;
        self.probe_luks().message("Failed to probe encrypted devices")?;
        self.probe_filesystems().message("Failed to probe filesystems")?;
        self.probe_mount_points().message("Failed to probe mount points")?;

        self.graph.check().message("Probed devicegraph is inconsistent")?;
        Ok(self.graph)
    }
}

/// Builds the devicegraph of the system described by `info`.
#[tracing::instrument(skip_all)]
pub fn probe(info: &dyn SystemInfo) -> Result<Devicegraph, BlkplanError> {
    let graph = Prober::new(info).run()?;
    debug!(
        "Probed {} devices and {} holders",
        graph.num_devices(),
        graph.num_holders()
    );
    Ok(graph)
}
