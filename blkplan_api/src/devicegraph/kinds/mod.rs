//! Device variants. Each variant implements `DeviceImpl`.

mod disk;
mod filesystem;
mod luks;
mod lvm;
mod md;
mod mount_point;

pub use disk::{Disk, Partition, PtType};
pub use filesystem::{BlkFilesystem, BtrfsSubvolume, FsType};
pub use luks::Luks;
pub use lvm::{LvmLv, LvmPv, LvmVg};
pub use md::{Md, MdContainer, MdLevel, MdMember, MdParity};
pub use mount_point::MountPoint;
