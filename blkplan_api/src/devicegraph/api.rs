//! Convenience device API used to build and edit devicegraphs.

use std::{collections::BTreeSet, path::PathBuf};

use crate::{
    constants::PARTITION_ID_LINUX,
    error::{BlkplanError, GraphConsistencyError, ValidationError},
};

use super::{
    device::{BlkDevice, DeviceKind, Region},
    holder::{FilesystemUser, HolderKind, MdUser},
    kinds::{
        BlkFilesystem, BtrfsSubvolume, Disk, FsType, LvmLv, LvmPv, LvmVg, Luks, Md, MdLevel,
        MountPoint, Partition,
    },
    types::DeviceType,
    Devicegraph, Sid,
};

impl Devicegraph {
    fn require_type(&self, sid: Sid, device_type: DeviceType) -> Result<(), BlkplanError> {
        let device = self.find_device(sid)?;
        if device.device_type() != device_type {
            return Err(device.wrong_type(device_type));
        }
        Ok(())
    }

    /// Creates a device on top of `parent`. Nothing is left behind when the
    /// holder is rejected.
    fn create_on(
        &mut self,
        parent: Sid,
        kind: DeviceKind,
        holder_kind: HolderKind,
    ) -> Result<Sid, BlkplanError> {
        let sid = self.create(kind)?;
        if let Err(e) = self.add_holder(parent, sid, holder_kind) {
            self.remove_device(sid)?;
            return Err(e);
        }
        Ok(sid)
    }

    pub fn create_disk(&mut self, name: &str, size: u64) -> Result<Sid, BlkplanError> {
        self.create(DeviceKind::Disk(Disk::new(name, size)))
    }

    /// Creates partition `number` in `region` of a partitioned disk.
    pub fn create_partition(
        &mut self,
        disk: Sid,
        number: u32,
        region: Region,
        id: u32,
    ) -> Result<Sid, BlkplanError> {
        let disk_device = self.find_device(disk)?;
        let disk_data = disk_device
            .as_disk()
            .ok_or_else(|| disk_device.wrong_type(DeviceType::Disk))?;
        if disk_data.partition_table.is_none() {
            return Err(BlkplanError::new(ValidationError::MissingPartitionTable {
                disk: disk_data.blk.name.clone(),
            }));
        }
        if region
            .end()
            .map_or(true, |end| end > disk_data.blk.size())
        {
            return Err(BlkplanError::new(ValidationError::RegionOutOfBounds {
                name: disk_data.blk.name.clone(),
                start: region.start,
                length: region.length,
                size: disk_data.blk.size(),
            }));
        }

        let partition = Partition {
            blk: BlkDevice {
                name: Partition::name_on(&disk_data.blk.name, number),
                region,
            },
            number,
            id,
        };
        self.create_on(disk, DeviceKind::Partition(partition), HolderKind::Subdevice)
    }

    /// Creates a linux partition.
    pub fn create_linux_partition(
        &mut self,
        disk: Sid,
        number: u32,
        region: Region,
    ) -> Result<Sid, BlkplanError> {
        self.create_partition(disk, number, region, PARTITION_ID_LINUX)
    }

    pub fn create_md(&mut self, name: &str, level: MdLevel) -> Result<Sid, BlkplanError> {
        self.create(DeviceKind::Md(Md::new(name, level)))
    }

    /// Returns `/dev/md<N>` for the smallest `N` no numeric array uses.
    pub fn find_free_md_numeric_name(&self) -> Result<String, BlkplanError> {
        let used: BTreeSet<u32> = self.mds().filter_map(|(_, md)| md.number()).collect();
        (0..=u32::MAX)
            .find(|n| !used.contains(n))
            .map(|n| format!("/dev/md{n}"))
            .ok_or_else(|| BlkplanError::new(ValidationError::NoFreeMdName))
    }

    /// Adds `blk` as member of `md`. Members are ordered by insertion.
    pub fn md_add_device(&mut self, md: Sid, blk: Sid, spare: bool) -> Result<Sid, BlkplanError> {
        self.require_type(md, DeviceType::Md)?;
        let sort_key = self
            .in_holders(md)?
            .iter()
            .filter_map(|holder| holder.kind.as_md_user())
            .map(|md_user| md_user.sort_key + 1)
            .max()
            .unwrap_or_default();
        self.add_holder(
            blk,
            md,
            HolderKind::MdUser(MdUser {
                spare,
                faulty: false,
                sort_key,
            }),
        )
    }

    pub fn md_remove_device(&mut self, md: Sid, blk: Sid) -> Result<(), BlkplanError> {
        self.require_type(md, DeviceType::Md)?;
        self.remove_holder(blk, md)?;
        Ok(())
    }

    /// Members of an array ordered by sort key.
    pub fn md_members(&self, md: Sid) -> Result<Vec<(Sid, MdUser)>, BlkplanError> {
        self.require_type(md, DeviceType::Md)?;
        let mut members: Vec<(Sid, MdUser)> = self
            .in_holders(md)?
            .into_iter()
            .filter_map(|holder| holder.kind.as_md_user().map(|u| (holder.source, *u)))
            .collect();
        members.sort_by_key(|(sid, md_user)| (md_user.sort_key, *sid));
        Ok(members)
    }

    pub fn md_set_faulty(&mut self, md: Sid, blk: Sid, faulty: bool) -> Result<(), BlkplanError> {
        self.require_type(md, DeviceType::Md)?;
        let holder = self.find_holder_mut(blk, md)?;
        if let HolderKind::MdUser(md_user) = &mut holder.kind {
            md_user.faulty = faulty;
        }
        Ok(())
    }

    pub fn set_md_level(&mut self, md: Sid, level: MdLevel) -> Result<(), BlkplanError> {
        let device = self.find_device_mut(md)?;
        match device.as_md_mut() {
            Some(data) => data.level = level,
            None => return Err(device.wrong_type(DeviceType::Md)),
        }
        self.recalculate(md)
    }

    pub fn set_md_chunk_size(&mut self, md: Sid, chunk_size: u64) -> Result<(), BlkplanError> {
        let device = self.find_device_mut(md)?;
        match device.as_md_mut() {
            Some(data) => data.chunk_size = chunk_size,
            None => return Err(device.wrong_type(DeviceType::Md)),
        }
        self.recalculate(md)
    }

    /// Sets the region of a block device and updates the sizes of arrays and
    /// encryption layers built on it.
    pub fn set_region(&mut self, sid: Sid, region: Region) -> Result<(), BlkplanError> {
        let device = self.find_device_mut(sid)?;
        let blk = device
            .blk_mut()
            .ok_or_else(|| BlkplanError::new(ValidationError::NotABlockDevice { sid }))?;
        blk.region = region;
        for child in self.child_sids(sid)? {
            self.recalculate(child)?;
        }
        Ok(())
    }

    pub fn create_lvm_vg(&mut self, vg_name: &str) -> Result<Sid, BlkplanError> {
        self.create(DeviceKind::LvmVg(LvmVg::new(vg_name)))
    }

    /// Puts a physical volume on `blk` and adds it to `vg`. Returns the sid
    /// of the physical volume.
    pub fn vg_add_pv(&mut self, vg: Sid, blk: Sid) -> Result<Sid, BlkplanError> {
        self.require_type(vg, DeviceType::LvmVg)?;
        let existing = self
            .children(blk)?
            .into_iter()
            .find(|child| child.device_type() == DeviceType::LvmPv)
            .map(|pv| pv.sid());

        let pv = match existing {
            Some(pv) => pv,
            None => self.create_on(blk, DeviceKind::LvmPv(LvmPv::default()), HolderKind::User)?,
        };
        self.add_holder(pv, vg, HolderKind::User)?;
        Ok(pv)
    }

    /// Removes the physical volume on `blk` from `vg` and deletes it.
    pub fn vg_remove_pv(&mut self, vg: Sid, blk: Sid) -> Result<(), BlkplanError> {
        self.require_type(vg, DeviceType::LvmVg)?;
        let pv = self
            .children(blk)?
            .into_iter()
            .find(|child| child.device_type() == DeviceType::LvmPv)
            .map(|pv| pv.sid())
            .ok_or_else(|| {
                BlkplanError::new(GraphConsistencyError::HolderNotFound {
                    parent: blk,
                    child: vg,
                })
            })?;
        self.remove_holder(pv, vg)?;
        self.remove_device(pv)?;
        Ok(())
    }

    pub fn create_lvm_lv(
        &mut self,
        vg: Sid,
        lv_name: &str,
        size: u64,
    ) -> Result<Sid, BlkplanError> {
        let vg_device = self.find_device(vg)?;
        let vg_name = vg_device
            .as_lvm_vg()
            .ok_or_else(|| vg_device.wrong_type(DeviceType::LvmVg))?
            .vg_name
            .clone();
        self.create_on(
            vg,
            DeviceKind::LvmLv(LvmLv::new(&vg_name, lv_name, size)),
            HolderKind::Subdevice,
        )
    }

    /// Renames a volume group together with the block devices of its
    /// logical volumes.
    pub fn rename_lvm_vg(&mut self, vg: Sid, vg_name: &str) -> Result<(), BlkplanError> {
        let device = self.find_device_mut(vg)?;
        let Some(data) = device.as_lvm_vg_mut() else {
            return Err(device.wrong_type(DeviceType::LvmVg));
        };
        let mut renamed = data.clone();
        renamed.vg_name = vg_name.into();
        DeviceKind::LvmVg(renamed.clone()).check()?;
        *data = renamed;

        for lv in self.child_sids(vg)? {
            if let Some(data) = self.find_device_mut(lv)?.as_lvm_lv_mut() {
                data.blk.name = LvmLv::name_in(vg_name, &data.lv_name);
            }
        }
        Ok(())
    }

    /// Creates a LUKS layer on `blk`, its size follows the backing device.
    pub fn create_luks(&mut self, blk: Sid, dm_table_name: &str) -> Result<Sid, BlkplanError> {
        self.find_device(blk)?.require_blk()?;
        self.create_on(blk, DeviceKind::Luks(Luks::new(dm_table_name)), HolderKind::User)
    }

    pub fn create_filesystem(&mut self, blk: Sid, fs_type: FsType) -> Result<Sid, BlkplanError> {
        self.find_device(blk)?.require_blk()?;
        self.create_on(
            blk,
            DeviceKind::BlkFilesystem(BlkFilesystem::new(fs_type)),
            HolderKind::FilesystemUser(FilesystemUser::default()),
        )
    }

    /// Mounts a filesystem or subvolume at `path`.
    pub fn create_mount_point(
        &mut self,
        mountable: Sid,
        path: impl Into<PathBuf>,
    ) -> Result<Sid, BlkplanError> {
        self.create_on(
            mountable,
            DeviceKind::MountPoint(MountPoint::new(path)),
            HolderKind::Using,
        )
    }

    /// Creates a subvolume below a btrfs filesystem or another subvolume.
    pub fn create_btrfs_subvolume(&mut self, parent: Sid, path: &str) -> Result<Sid, BlkplanError> {
        self.create_on(
            parent,
            DeviceKind::BtrfsSubvolume(BtrfsSubvolume::new(path)),
            HolderKind::Subdevice,
        )
    }

    /// Returns the btrfs filesystem a subvolume belongs to.
    pub fn btrfs_of_subvolume(&self, subvolume: Sid) -> Result<Sid, BlkplanError> {
        let mut current = subvolume;
        loop {
            let parent = self
                .parents(current)?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    BlkplanError::new(ValidationError::WrongDeviceType {
                        sid: subvolume,
                        expected: DeviceType::BtrfsSubvolume.to_string(),
                        found: "detached subvolume".into(),
                    })
                })?;
            match parent.device_type() {
                DeviceType::BlkFilesystem => return Ok(parent.sid()),
                DeviceType::BtrfsSubvolume => current = parent.sid(),
                _ => return Err(parent.wrong_type(DeviceType::BlkFilesystem)),
            }
        }
    }

    /// Returns the mount point of a filesystem or subvolume.
    pub fn mount_point_of(&self, mountable: Sid) -> Result<Option<Sid>, BlkplanError> {
        Ok(self
            .children(mountable)?
            .into_iter()
            .find(|child| child.device_type() == DeviceType::MountPoint)
            .map(|mp| mp.sid()))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        constants::{GIB, KIB, MIB},
        devicegraph::{geometry::md_member_usable_size, kinds::PtType},
        error::ErrorKind,
    };

    use super::*;

    /// A disk with a GPT and `count` partitions of 16 GiB each.
    fn disk_with_partitions(graph: &mut Devicegraph, name: &str, count: u32) -> Vec<Sid> {
        let disk = graph.create_disk(name, 1024 * GIB).unwrap();
        graph.find_device_mut(disk).unwrap().as_disk_mut().unwrap().partition_table =
            Some(PtType::Gpt);
        (1..=count)
            .map(|n| {
                let start = MIB + u64::from(n - 1) * 16 * GIB;
                graph
                    .create_linux_partition(disk, n, Region::new(start, 16 * GIB))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_create_partition() {
        let mut graph = Devicegraph::new();
        let parts = disk_with_partitions(&mut graph, "/dev/nvme0n1", 2);
        let partition = graph.find_device(parts[1]).unwrap();
        assert_eq!(partition.name(), "/dev/nvme0n1p2");
        assert_eq!(graph.parents(parts[1]).unwrap()[0].name(), "/dev/nvme0n1");

        let disk = graph.find_by_name("/dev/nvme0n1").unwrap().sid();
        let err = graph
            .create_linux_partition(disk, 3, Region::new(1000 * GIB, 100 * GIB))
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Validation(ValidationError::RegionOutOfBounds { .. })
        ));

        // A region ending beyond the largest offset is out of bounds too.
        let err = graph
            .create_linux_partition(disk, 3, Region::new(u64::MAX - 10, 20 * GIB))
            .unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Validation(ValidationError::RegionOutOfBounds {
                name: "/dev/nvme0n1".into(),
                start: u64::MAX - 10,
                length: 20 * GIB,
                size: 1024 * GIB,
            })
        );
        assert_eq!(Region::new(u64::MAX, 1).end(), None);
        assert_eq!(Region::new(MIB, GIB).end(), Some(MIB + GIB));

        let bare = graph.create_disk("/dev/sdz", GIB).unwrap();
        graph
            .create_linux_partition(bare, 1, Region::new(MIB, MIB))
            .unwrap_err();
    }

    #[test]
    fn test_md_geometry_follows_members() {
        let mut graph = Devicegraph::new();
        let parts = disk_with_partitions(&mut graph, "/dev/sda", 4);
        let md = graph.create_md("/dev/md0", MdLevel::Raid0).unwrap();
        let s = md_member_usable_size(16 * GIB, 512 * KIB);

        for part in &parts {
            graph.md_add_device(md, *part, false).unwrap();
        }
        let data = graph.find_device(md).unwrap().as_md().unwrap().clone();
        assert_eq!(data.blk.size(), 4 * s);
        assert_eq!(data.optimal_io_size, 4 * 512 * KIB);

        graph.set_md_level(md, MdLevel::Raid5).unwrap();
        let data = graph.find_device(md).unwrap().as_md().unwrap().clone();
        assert_eq!(data.blk.size(), 3 * s);
        assert_eq!(data.optimal_io_size, 3 * 512 * KIB);

        graph.md_remove_device(md, parts[3]).unwrap();
        assert_eq!(graph.find_device(md).unwrap().require_blk().unwrap().size(), 2 * s);

        graph.md_remove_device(md, parts[2]).unwrap();
        assert_eq!(graph.find_device(md).unwrap().require_blk().unwrap().size(), 0);
    }

    #[test]
    fn test_md_members_sorted() {
        let mut graph = Devicegraph::new();
        let parts = disk_with_partitions(&mut graph, "/dev/sda", 3);
        let md = graph.create_md("/dev/md/data", MdLevel::Raid1).unwrap();
        graph.md_add_device(md, parts[2], false).unwrap();
        graph.md_add_device(md, parts[0], false).unwrap();
        graph.md_add_device(md, parts[1], true).unwrap();

        let members = graph.md_members(md).unwrap();
        assert_eq!(
            members.iter().map(|(sid, _)| *sid).collect::<Vec<_>>(),
            vec![parts[2], parts[0], parts[1]]
        );
        assert!(members[2].1.spare);
        assert_eq!(members[2].1.sort_key, 2);
    }

    #[test]
    fn test_probed_md_keeps_size() {
        let mut graph = Devicegraph::new();
        let parts = disk_with_partitions(&mut graph, "/dev/sda", 2);
        let mut md = Md::new("/dev/md0", MdLevel::Raid1);
        md.blk.region = Region::new(0, 12345 * MIB);
        let md = graph.create_probed(DeviceKind::Md(md)).unwrap();
        graph.md_add_device(md, parts[0], false).unwrap();
        graph.md_add_device(md, parts[1], false).unwrap();
        assert_eq!(
            graph.find_device(md).unwrap().require_blk().unwrap().size(),
            12345 * MIB
        );
    }

    #[test]
    fn test_luks_size_follows_backing_device() {
        let mut graph = Devicegraph::new();
        let parts = disk_with_partitions(&mut graph, "/dev/sda", 1);
        let luks = graph.create_luks(parts[0], "cr_data").unwrap();
        assert_eq!(
            graph.find_device(luks).unwrap().require_blk().unwrap().size(),
            16 * GIB - 16 * MIB
        );

        graph.set_region(parts[0], Region::new(MIB, 8 * GIB)).unwrap();
        assert_eq!(
            graph.find_device(luks).unwrap().require_blk().unwrap().size(),
            8 * GIB - 16 * MIB
        );
    }

    #[test]
    fn test_exclusive_consumer() {
        let mut graph = Devicegraph::new();
        let parts = disk_with_partitions(&mut graph, "/dev/sda", 1);
        graph.create_filesystem(parts[0], FsType::Ext4).unwrap();

        let err = graph.create_luks(parts[0], "cr").unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::GraphConsistency(GraphConsistencyError::ExclusiveConsumer { .. })
        ));

        // A partitioned disk cannot be formatted.
        let disk = graph.find_by_name("/dev/sda").unwrap().sid();
        graph.create_filesystem(disk, FsType::Xfs).unwrap_err();
    }

    #[test]
    fn test_lvm() {
        let mut graph = Devicegraph::new();
        let parts = disk_with_partitions(&mut graph, "/dev/sda", 2);
        let vg = graph.create_lvm_vg("system").unwrap();
        let pv = graph.vg_add_pv(vg, parts[0]).unwrap();
        graph.vg_add_pv(vg, parts[1]).unwrap();
        let lv = graph.create_lvm_lv(vg, "root", 10 * GIB).unwrap();

        assert_eq!(graph.find_device(lv).unwrap().name(), "/dev/system/root");
        assert_eq!(graph.find_by_name("/dev/system").unwrap().sid(), vg);
        assert_eq!(graph.parents(vg).unwrap().len(), 2);

        graph.vg_remove_pv(vg, parts[0]).unwrap();
        assert!(!graph.device_exists(pv));
        assert_eq!(graph.parents(vg).unwrap().len(), 1);

        graph.rename_lvm_vg(vg, "data").unwrap();
        assert_eq!(graph.find_device(lv).unwrap().name(), "/dev/data/root");
        graph.rename_lvm_vg(vg, "..").unwrap_err();
        assert_eq!(graph.find_device(vg).unwrap().name(), "/dev/data");
        graph.check().unwrap();
    }

    #[test]
    fn test_btrfs_subvolumes() {
        let mut graph = Devicegraph::new();
        let parts = disk_with_partitions(&mut graph, "/dev/sda", 2);
        let btrfs = graph.create_filesystem(parts[0], FsType::Btrfs).unwrap();
        let top = graph.create_btrfs_subvolume(btrfs, "@").unwrap();
        let home = graph.create_btrfs_subvolume(top, "@/home").unwrap();
        assert_eq!(graph.btrfs_of_subvolume(home).unwrap(), btrfs);

        let mp = graph.create_mount_point(btrfs, "/").unwrap();
        assert_eq!(graph.mount_point_of(btrfs).unwrap(), Some(mp));
        assert_eq!(graph.mount_point_of(home).unwrap(), None);

        // Only btrfs has subvolumes, the failed create leaves nothing behind.
        let ext4 = graph.create_filesystem(parts[1], FsType::Ext4).unwrap();
        let devices = graph.num_devices();
        graph.create_btrfs_subvolume(ext4, "@").unwrap_err();
        assert_eq!(graph.num_devices(), devices);
    }

    #[test]
    fn test_find_free_md_numeric_name() {
        let mut graph = Devicegraph::new();
        assert_eq!(graph.find_free_md_numeric_name().unwrap(), "/dev/md0");
        graph.create_md("/dev/md0", MdLevel::Raid1).unwrap();
        graph.create_md("/dev/md/1", MdLevel::Raid1).unwrap();
        graph.create_md("/dev/md/home", MdLevel::Raid1).unwrap();
        assert_eq!(graph.find_free_md_numeric_name().unwrap(), "/dev/md2");
    }

    #[test]
    fn test_wrong_device_type() {
        let mut graph = Devicegraph::new();
        let disk = graph.create_disk("/dev/sda", GIB).unwrap();
        let err = graph.md_add_device(disk, disk, false).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Validation(ValidationError::WrongDeviceType { .. })
        ));
    }
}
