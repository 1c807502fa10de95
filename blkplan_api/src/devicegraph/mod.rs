//! The devicegraph: devices connected by holders.
//!
//! Holders point from the lower level device to the device built on top of
//! it, e.g. disk → partition → md → filesystem → mount point. A devicegraph is
//! a snapshot; the probed and the staging graph share sids for the devices
//! they have in common.

mod api;
mod device;
mod geometry;
mod graph;
mod holder;
pub mod kinds;
mod sid;
mod types;

pub use device::{BlkDevice, Device, DeviceKind, DiffLog, Region};
pub use geometry::{md_member_usable_size, md_size_and_optimal_io};
pub use graph::Devicegraph;
pub use holder::{FilesystemUser, Holder, HolderKind, MdUser};
pub use sid::Sid;
pub use types::{DeviceType, DeviceTypeFlag, HolderType, UsedFeatures};

pub(crate) use device::{dispatch, dispatch_pair, DeviceImpl};
pub(crate) use graph::NodeIndex;
