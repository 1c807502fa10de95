pub mod actiongraph;
pub mod constants;
pub mod devicegraph;
pub mod document;
pub mod error;

pub use actiongraph::{Action, ActionKind, Actiongraph, OrderingHint, ReallotMode, Side};
pub use devicegraph::{Device, DeviceKind, DeviceType, Devicegraph, Holder, HolderKind, Sid};
