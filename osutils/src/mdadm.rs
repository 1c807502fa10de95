use std::collections::BTreeMap;

use blkplan_api::{
    constants::KIB,
    devicegraph::kinds::{MdLevel, MdParity},
};

use crate::dependencies::{Command, Dependency};

/// Members and spares of a new array, each in sort key order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MdCreateDevices<'a> {
    pub members: Vec<&'a str>,
    pub spares: Vec<&'a str>,
}

/// Parameters of `mdadm --create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdCreate<'a> {
    pub name: &'a str,
    pub level: MdLevel,
    pub parity: MdParity,
    pub chunk_size: u64,
    pub metadata: &'a str,
    /// Uuid to give the array, mdadm picks one when `None`.
    pub uuid: Option<&'a str>,
    pub devices: MdCreateDevices<'a>,
}

pub fn create(params: &MdCreate) -> Command {
    let mut cmd = Dependency::Mdadm.cmd();
    cmd.arg("--create")
        .arg(params.name)
        .arg("--run")
        .arg(format!("--level={}", params.level))
        .arg(format!("--metadata={}", params.metadata))
        .arg("--homehost=any");

    if params.level.has_redundancy() {
        cmd.arg("--bitmap=internal");
    }

    if params.chunk_size > 0 {
        cmd.arg(format!("--chunk={}", params.chunk_size / KIB));
    }

    if !params.parity.is_default() {
        cmd.arg(format!("--parity={}", params.parity));
    }

    if let Some(uuid) = params.uuid {
        cmd.arg(format!("--uuid={uuid}"));
    }

    cmd.arg(format!("--raid-devices={}", params.devices.members.len()));
    if !params.devices.spares.is_empty() {
        cmd.arg(format!("--spare-devices={}", params.devices.spares.len()));
    }
    cmd.args(&params.devices.members).args(&params.devices.spares);
    cmd
}

pub fn stop(name: &str) -> Command {
    Dependency::Mdadm.cmd().with_args(["--stop", name])
}

/// Adds a device to an array, either as active member or as spare.
pub fn add(name: &str, device: &str, spare: bool) -> Command {
    let mode = if spare { "--add-spare" } else { "--add" };
    Dependency::Mdadm.cmd().with_args([mode, name, device])
}

/// Marks a member of an array as failed.
pub fn fail(name: &str, device: &str) -> Command {
    Dependency::Mdadm.cmd().with_args(["--fail", name, device])
}

/// Hot-removes a failed or spare member from an array.
pub fn remove(name: &str, device: &str) -> Command {
    Dependency::Mdadm.cmd().with_args(["--remove", name, device])
}

pub fn detail_export(name: &str) -> Command {
    Dependency::Mdadm.cmd().with_args(["--detail", "--export", name])
}

/// Information about an array as reported by `mdadm --detail --export`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MdadmDetail {
    /// Name below `/dev/md/`, if the array has one.
    pub devname: Option<String>,
    pub uuid: String,
    /// `None` for containers.
    pub level: Option<MdLevel>,
    pub metadata: String,
}

pub fn parse_detail_export(output: &str) -> MdadmDetail {
    let values: BTreeMap<&str, &str> = output
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .collect();

    MdadmDetail {
        devname: values.get("MD_DEVNAME").map(|name| name.to_string()),
        uuid: values.get("MD_UUID").unwrap_or(&"").to_string(),
        level: values.get("MD_LEVEL").and_then(|level| level.parse().ok()),
        metadata: values.get("MD_METADATA").unwrap_or(&"").to_string(),
    }
}
