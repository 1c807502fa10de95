pub mod blkid;
pub mod btrfs;
pub mod dependencies;
pub mod encryption;
pub mod etc_mdadm;
pub mod lsblk;
pub mod lvm;
pub mod mdadm;
pub mod mdstat;
pub mod mkfs;
pub mod mount;
pub mod partitions;
pub mod system_info;
pub mod wipefs;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testutils;
