//! Human readable text for actions, used for logging and by the CLI.

use blkplan_api::{
    constants::{GIB, KIB, MIB, TIB},
    devicegraph::{Device, DeviceKind},
    error::BlkplanError,
    Action, ActionKind, Actiongraph, Devicegraph, ReallotMode, Side, Sid,
};

/// Grammatical form of the description. Plans are listed in the simple form,
/// progress is logged in the continuous form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tense {
    /// "Create partition /dev/sda1"
    Simple,
    /// "Creating partition /dev/sda1"
    Continuous,
}

/// Formats a size with binary units, e.g. `20.00 GiB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [(u64, &str); 4] = [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")];

    UNITS
        .iter()
        .find(|(unit, _)| bytes >= *unit)
        .map(|(unit, name)| format!("{:.2} {name}", bytes as f64 / *unit as f64))
        .unwrap_or_else(|| format!("{bytes} B"))
}

fn conjugate(verb: &str, tense: Tense) -> String {
    match tense {
        Tense::Simple => verb.into(),
        Tense::Continuous => match verb {
            "Set" | "Stop" => format!("{verb}{}ing", &verb[verb.len() - 1..]),
            _ => match verb.strip_suffix('e') {
                Some(stem) => format!("{stem}ing"),
                None => format!("{verb}ing"),
            },
        },
    }
}

fn graph_of<'a>(actiongraph: &Actiongraph<'a>, action: &Action) -> &'a Devicegraph {
    match action.side() {
        Side::Lhs => actiongraph.lhs(),
        Side::Rhs => actiongraph.rhs(),
    }
}

/// Block device names of the parents, joined for display.
fn parent_names(graph: &Devicegraph, sid: Sid) -> Result<String, BlkplanError> {
    Ok(graph
        .parents(sid)?
        .iter()
        .map(|parent| parent.name())
        .collect::<Vec<_>>()
        .join(", "))
}

/// Name of the block device below a physical volume.
fn pv_blk_name(graph: &Devicegraph, pv: Sid) -> Result<String, BlkplanError> {
    parent_names(graph, pv)
}

/// What a mount point mounts, e.g. `/dev/sda1` or `subvolume @/home of
/// /dev/sda2`.
fn mountable_name(graph: &Devicegraph, mount_point: Sid) -> Result<String, BlkplanError> {
    let Some(mountable) = graph.parents(mount_point)?.into_iter().next() else {
        return Ok("nothing".into());
    };
    match &mountable.kind {
        DeviceKind::BtrfsSubvolume(subvolume) => {
            let btrfs = graph.btrfs_of_subvolume(mountable.sid())?;
            Ok(format!(
                "subvolume {} of {}",
                subvolume.path,
                parent_names(graph, btrfs)?
            ))
        }
        _ => parent_names(graph, mountable.sid()),
    }
}

fn describe_create(graph: &Devicegraph, device: &Device) -> Result<String, BlkplanError> {
    let sid = device.sid();
    Ok(match &device.kind {
        DeviceKind::Partition(partition) => format!(
            "partition {} ({})",
            partition.blk.name,
            human_size(partition.blk.size())
        ),
        DeviceKind::Md(md) => format!(
            "{} {} ({}) from {}",
            md.level.to_string().to_uppercase(),
            md.blk.name,
            human_size(md.blk.size()),
            parent_names(graph, sid)?
        ),
        DeviceKind::LvmPv(_) => format!("physical volume on {}", parent_names(graph, sid)?),
        DeviceKind::LvmVg(vg) => format!("volume group {}", vg.vg_name),
        DeviceKind::LvmLv(lv) => format!(
            "logical volume {} ({})",
            lv.blk.name,
            human_size(lv.blk.size())
        ),
        DeviceKind::Luks(luks) => format!(
            "encryption layer {} on {}",
            luks.blk.name,
            parent_names(graph, sid)?
        ),
        DeviceKind::BlkFilesystem(fs) => {
            let mut text = format!("{} on {}", fs.fs_type, parent_names(graph, sid)?);
            if !fs.label.is_empty() {
                text.push_str(&format!(" with label {}", fs.label));
            }
            text
        }
        DeviceKind::BtrfsSubvolume(subvolume) => format!(
            "subvolume {} on {}",
            subvolume.path,
            parent_names(graph, graph.btrfs_of_subvolume(sid)?)?
        ),
        _ => device.describe(),
    })
}

fn describe_delete(graph: &Devicegraph, device: &Device) -> Result<String, BlkplanError> {
    let sid = device.sid();
    Ok(match &device.kind {
        DeviceKind::Partition(partition) => format!("partition {}", partition.blk.name),
        DeviceKind::Md(md) => format!("{} {}", md.level.to_string().to_uppercase(), md.blk.name),
        DeviceKind::MdContainer(container) => format!("container {}", container.blk.name),
        DeviceKind::LvmPv(_) => format!("physical volume on {}", parent_names(graph, sid)?),
        DeviceKind::LvmVg(vg) => format!("volume group {}", vg.vg_name),
        DeviceKind::LvmLv(lv) => format!("logical volume {}", lv.blk.name),
        DeviceKind::Luks(luks) => format!("encryption layer {}", luks.blk.name),
        DeviceKind::BlkFilesystem(fs) => {
            format!("{} on {}", fs.fs_type, parent_names(graph, sid)?)
        }
        DeviceKind::BtrfsSubvolume(subvolume) => format!("subvolume {}", subvolume.path),
        _ => device.describe(),
    })
}

/// Describes one action of the plan, e.g. "Create partition /dev/sda1
/// (20.00 GiB)".
pub fn describe(
    actiongraph: &Actiongraph,
    action: &Action,
    tense: Tense,
) -> Result<String, BlkplanError> {
    let graph = graph_of(actiongraph, action);
    let device = actiongraph.device(action)?;
    let name = device.name();
    let verb = |verb: &str| conjugate(verb, tense);

    Ok(match (action.kind(), &device.kind) {
        (ActionKind::Create, DeviceKind::MountPoint(mp)) => format!(
            "{} {} at {}",
            verb("Mount"),
            mountable_name(graph, device.sid())?,
            mp.path.display()
        ),
        (ActionKind::Create, _) => {
            format!("{} {}", verb("Create"), describe_create(graph, device)?)
        }
        (ActionKind::Delete, DeviceKind::MountPoint(mp)) => {
            format!("{} {}", verb("Unmount"), mp.path.display())
        }
        (ActionKind::Delete, _) => {
            format!("{} {}", verb("Delete"), describe_delete(graph, device)?)
        }
        (ActionKind::Deactivate, DeviceKind::Luks(luks)) => {
            format!("{} encryption layer {}", verb("Close"), luks.blk.name)
        }
        (ActionKind::Deactivate, _) => format!("{} {name}", verb("Stop")),
        (ActionKind::AddToEtcMdadm, _) => {
            format!("{} {name} to /etc/mdadm.conf", verb("Add"))
        }
        (ActionKind::RemoveFromEtcMdadm, _) => {
            format!("{} {name} from /etc/mdadm.conf", verb("Remove"))
        }
        (ActionKind::CreatePartitionTable, DeviceKind::Disk(disk)) => {
            let table = disk
                .partition_table
                .map(|table| format!("{table} "))
                .unwrap_or_default();
            format!("{} {table}partition table on {name}", verb("Create"))
        }
        (ActionKind::SetPartitionId, DeviceKind::Partition(partition)) => format!(
            "{} id of partition {name} to {:#x}",
            verb("Set"),
            partition.id
        ),
        (ActionKind::Rename, DeviceKind::LvmVg(vg)) => {
            let old = actiongraph.lhs().find_device(device.sid())?;
            format!(
                "{} volume group {} to {}",
                verb("Rename"),
                old.name(),
                vg.vg_name
            )
        }
        (ActionKind::Rename, _) => {
            let old = actiongraph.lhs().find_device(device.sid())?;
            format!("{} {} to {name}", verb("Rename"), old.name())
        }
        (ActionKind::SetLabel, DeviceKind::BlkFilesystem(fs)) => format!(
            "{} label of {} on {} to {}",
            verb("Set"),
            fs.fs_type,
            parent_names(graph, device.sid())?,
            fs.label
        ),
        (ActionKind::Remount, DeviceKind::MountPoint(mp)) => {
            let old = actiongraph.lhs().find_device(device.sid())?;
            match old.as_mount_point() {
                Some(old) if old.path != mp.path => format!(
                    "{} mount point {} to {}",
                    verb("Move"),
                    old.path.display(),
                    mp.path.display()
                ),
                _ => format!("{} {}", verb("Remount"), mp.path.display()),
            }
        }
        (ActionKind::SetDefaultSubvolume, DeviceKind::BtrfsSubvolume(subvolume)) => format!(
            "{} subvolume {} as default",
            verb("Set"),
            subvolume.path
        ),
        (ActionKind::Reallot { mode, device: member }, DeviceKind::LvmVg(vg)) => {
            let blk = pv_blk_name(graph, member)?;
            match mode {
                ReallotMode::Extend => {
                    format!("{} volume group {} by {blk}", verb("Extend"), vg.vg_name)
                }
                ReallotMode::Reduce => {
                    format!("{} volume group {} by {blk}", verb("Reduce"), vg.vg_name)
                }
            }
        }
        (ActionKind::Reallot { mode, device: member }, _) => {
            let member = graph.find_device(member)?.name();
            match mode {
                ReallotMode::Extend => format!("{} {member} to {name}", verb("Add")),
                ReallotMode::Reduce => format!("{} {member} from {name}", verb("Remove")),
            }
        }
        (ActionKind::MarkFaulty { device: member }, _) => {
            let member = graph.find_device(member)?.name();
            format!("{} {member} as faulty in {name}", verb("Mark"))
        }
        (kind, _) => format!("{} {kind} on {name}", verb("Apply")),
    })
}

#[cfg(test)]
mod tests {
    use blkplan_api::{
        constants::{GIB, MIB, PARTITION_ID_RAID},
        devicegraph::{
            kinds::{FsType, MdLevel, PtType},
            Region,
        },
    };

    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(KIB), "1.00 KiB");
        assert_eq!(human_size(20 * GIB), "20.00 GiB");
        assert_eq!(human_size(1536 * MIB), "1.50 GiB");
        assert_eq!(human_size(2 * TIB), "2.00 TiB");
    }

    #[test]
    fn test_conjugate() {
        for (verb, continuous) in [
            ("Create", "Creating"),
            ("Mount", "Mounting"),
            ("Stop", "Stopping"),
            ("Set", "Setting"),
            ("Remove", "Removing"),
            ("Add", "Adding"),
        ] {
            assert_eq!(conjugate(verb, Tense::Simple), verb);
            assert_eq!(conjugate(verb, Tense::Continuous), continuous);
        }
    }

    #[test]
    fn test_describe_raid_setup() {
        let mut probed = Devicegraph::new();
        let mut disks = Vec::new();
        for name in ["/dev/sda", "/dev/sdb"] {
            let disk = probed.create_disk(name, 100 * GIB).unwrap();
            probed
                .find_device_mut(disk)
                .unwrap()
                .as_disk_mut()
                .unwrap()
                .partition_table = Some(PtType::Gpt);
            disks.push(disk);
        }
        probed.mark_all_probed();

        let mut staging = probed.clone();
        let region = Region::new(MIB, 20 * GIB);
        let p1 = staging
            .create_partition(disks[0], 1, region, PARTITION_ID_RAID)
            .unwrap();
        let p2 = staging
            .create_partition(disks[1], 1, region, PARTITION_ID_RAID)
            .unwrap();
        let md = staging.create_md("/dev/md0", MdLevel::Raid1).unwrap();
        staging.md_add_device(md, p1, false).unwrap();
        staging.md_add_device(md, p2, false).unwrap();
        let fs = staging.create_filesystem(md, FsType::Ext4).unwrap();
        let mount = staging.create_mount_point(fs, "/srv").unwrap();

        let graph = Actiongraph::new(&probed, &staging).unwrap();
        let text = |sid, kind, tense| {
            let idx = graph.find_action(sid, kind).unwrap();
            describe(&graph, graph.action(idx), tense).unwrap()
        };

        assert_eq!(
            text(p1, ActionKind::Create, Tense::Simple),
            "Create partition /dev/sda1 (20.00 GiB)"
        );
        assert_eq!(
            text(p2, ActionKind::Create, Tense::Continuous),
            "Creating partition /dev/sdb1 (20.00 GiB)"
        );
        assert!(text(md, ActionKind::Create, Tense::Simple)
            .starts_with("Create RAID1 /dev/md0 ("));
        assert_eq!(
            text(md, ActionKind::AddToEtcMdadm, Tense::Simple),
            "Add /dev/md0 to /etc/mdadm.conf"
        );
        assert_eq!(
            text(fs, ActionKind::Create, Tense::Continuous),
            "Creating ext4 on /dev/md0"
        );
        assert_eq!(
            text(mount, ActionKind::Create, Tense::Simple),
            "Mount /dev/md0 at /srv"
        );
    }

    #[test]
    fn test_describe_teardown() {
        let mut probed = Devicegraph::new();
        let disk = probed.create_disk("/dev/sda", 100 * GIB).unwrap();
        probed
            .find_device_mut(disk)
            .unwrap()
            .as_disk_mut()
            .unwrap()
            .partition_table = Some(PtType::Gpt);
        let partition = probed
            .create_linux_partition(disk, 1, Region::new(MIB, 10 * GIB))
            .unwrap();
        let fs = probed.create_filesystem(partition, FsType::Xfs).unwrap();
        let mount = probed.create_mount_point(fs, "/data").unwrap();
        probed.mark_all_probed();

        let mut staging = probed.clone();
        staging.remove_device(mount).unwrap();
        staging.remove_device(fs).unwrap();
        staging.remove_device(partition).unwrap();

        let graph = Actiongraph::new(&probed, &staging).unwrap();
        let text = |sid, kind| {
            let idx = graph.find_action(sid, kind).unwrap();
            describe(&graph, graph.action(idx), Tense::Simple).unwrap()
        };
        assert_eq!(text(mount, ActionKind::Delete), "Unmount /data");
        assert_eq!(text(fs, ActionKind::Delete), "Delete xfs on /dev/sda1");
        assert_eq!(
            text(partition, ActionKind::Delete),
            "Delete partition /dev/sda1"
        );
    }
}
