//! The actiongraph: the actions turning one devicegraph into another and the
//! order they have to run in.

mod action;
mod diff;
mod generate;
mod graph;
mod simulate;

pub use action::{Action, ActionKind, OrderingHint, ReallotMode, Side};
pub use graph::{ActionIndex, Actiongraph};
