use crate::dependencies::{Command, Dependency};

/// Erases all signatures on `device`.
pub fn all(device: &str) -> Command {
    Dependency::Wipefs.cmd().with_args(["--all", device])
}
