use blkplan_api::devicegraph::kinds::FsType;

use crate::dependencies::{Command, Dependency};

/// Binary creating filesystems of the type, `None` if blkplan cannot create
/// it.
pub fn mkfs_dependency(fs_type: FsType) -> Option<Dependency> {
    Some(match fs_type {
        FsType::Ext2 => Dependency::MkfsExt2,
        FsType::Ext3 => Dependency::MkfsExt3,
        FsType::Ext4 => Dependency::MkfsExt4,
        FsType::Xfs => Dependency::MkfsXfs,
        FsType::Btrfs => Dependency::MkfsBtrfs,
        FsType::Vfat => Dependency::MkfsVfat,
        FsType::Swap => Dependency::Mkswap,
        FsType::Ntfs => Dependency::MkfsNtfs,
        FsType::Iso9660 => return None,
    })
}

/// Binary changing the label of an existing filesystem.
pub fn label_dependency(fs_type: FsType) -> Option<Dependency> {
    Some(match fs_type {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => Dependency::E2label,
        FsType::Xfs => Dependency::XfsAdmin,
        FsType::Btrfs => Dependency::Btrfs,
        FsType::Vfat => Dependency::Fatlabel,
        FsType::Swap => Dependency::Swaplabel,
        FsType::Iso9660 | FsType::Ntfs => return None,
    })
}

fn label_flag(fs_type: FsType) -> &'static str {
    match fs_type {
        FsType::Vfat => "-n",
        _ => "-L",
    }
}

fn force_flag(fs_type: FsType) -> Option<&'static str> {
    match fs_type {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => Some("-F"),
        FsType::Xfs | FsType::Btrfs | FsType::Swap => Some("-f"),
        FsType::Ntfs => Some("--fast"),
        FsType::Vfat | FsType::Iso9660 => None,
    }
}

/// Creates a filesystem on `devices`. Only btrfs spans several devices.
/// `options` are extra mkfs arguments separated by whitespace.
pub fn mkfs(fs_type: FsType, devices: &[&str], label: &str, options: &str) -> Option<Command> {
    let mut cmd = mkfs_dependency(fs_type)?.cmd();
    if let Some(force) = force_flag(fs_type) {
        cmd.arg(force);
    }
    if !label.is_empty() {
        cmd.arg(label_flag(fs_type)).arg(label);
    }
    cmd.args(options.split_whitespace());
    cmd.args(devices);
    Some(cmd)
}

/// Changes the label of an existing filesystem. `device` is any of its
/// devices.
pub fn set_label(fs_type: FsType, device: &str, label: &str) -> Option<Command> {
    let dependency = label_dependency(fs_type)?;
    let cmd = match fs_type {
        FsType::Btrfs => dependency.cmd().with_args(["filesystem", "label", device, label]),
        FsType::Xfs => dependency.cmd().with_args(["-L", label, device]),
        FsType::Swap => dependency.cmd().with_args(["--label", label, device]),
        _ => dependency.cmd().with_args([device, label]),
    };
    Some(cmd)
}
