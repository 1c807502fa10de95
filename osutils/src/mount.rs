use std::path::Path;

use crate::dependencies::{Command, Dependency};

/// Mounts `device` at `mount_dir`. `subvolume` selects a btrfs subvolume.
pub fn mount(device: &str, mount_dir: &Path, options: &[String], subvolume: Option<&str>) -> Command {
    let mut options = options.to_owned();
    if let Some(subvolume) = subvolume {
        options.push(format!("subvol={subvolume}"));
    }

    let mut cmd = Dependency::Mount.cmd();
    if !options.is_empty() {
        cmd.arg("-o").arg(options.join(","));
    }
    cmd.arg(device).arg(mount_dir);
    cmd
}

/// Applies new options to a mounted filesystem.
pub fn remount(mount_dir: &Path, options: &[String]) -> Command {
    let mut options_arg = String::from("remount");
    for option in options {
        options_arg.push(',');
        options_arg.push_str(option);
    }
    Dependency::Mount
        .cmd()
        .with_arg("-o")
        .with_arg(options_arg)
        .with_arg(mount_dir)
}

pub fn umount(mount_dir: &Path) -> Command {
    Dependency::Umount.cmd().with_arg(mount_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount() {
        assert_eq!(
            mount("/dev/md0", Path::new("/srv"), &[], None).render(),
            "mount /dev/md0 /srv"
        );
        assert_eq!(
            mount(
                "/dev/sda2",
                Path::new("/home"),
                &["noatime".into()],
                Some("@/home")
            )
            .render(),
            "mount -o noatime,subvol=@/home /dev/sda2 /home"
        );
    }

    #[test]
    fn test_remount_and_umount() {
        assert_eq!(
            remount(Path::new("/srv"), &["ro".into(), "noatime".into()]).render(),
            "mount -o remount,ro,noatime /srv"
        );
        assert_eq!(remount(Path::new("/srv"), &[]).render(), "mount -o remount /srv");
        assert_eq!(umount(Path::new("/srv")).render(), "umount /srv");
    }
}
