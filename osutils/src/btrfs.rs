//! Subvolume commands. Subvolumes are addressed through the mount path of
//! their filesystem.

use std::path::Path;

use crate::dependencies::{Command, Dependency};

pub fn subvolume_create(mount_path: &Path, subvolume: &str) -> Command {
    Dependency::Btrfs
        .cmd()
        .with_args(["subvolume", "create"])
        .with_arg(mount_path.join(subvolume))
}

pub fn subvolume_delete(mount_path: &Path, subvolume: &str) -> Command {
    Dependency::Btrfs
        .cmd()
        .with_args(["subvolume", "delete"])
        .with_arg(mount_path.join(subvolume))
}

pub fn subvolume_set_default(mount_path: &Path, subvolume: &str) -> Command {
    Dependency::Btrfs
        .cmd()
        .with_args(["subvolume", "set-default"])
        .with_arg(mount_path.join(subvolume))
}
