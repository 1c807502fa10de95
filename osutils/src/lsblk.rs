use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use crate::dependencies::{Command, Dependency};

/// Columns requested from lsblk.
const COLUMNS: &str = "NAME,KNAME,TYPE,SIZE,START,PKNAME,PTTYPE,PARTN,PARTTYPE,MOUNTPOINTS";

/// Size of the sectors lsblk counts partition starts in.
const LSBLK_SECTOR_SIZE: u64 = 512;

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct LsBlkOutput {
    pub blockdevices: Vec<BlockDevice>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct BlockDevice {
    pub name: String,

    #[serde(rename = "kname")]
    pub kernel_name: String,

    #[serde(rename = "type")]
    pub device_type: String,

    pub size: u64,

    /// Start in 512 byte sectors, partitions only.
    #[serde(default)]
    pub start: Option<u64>,

    #[serde(rename = "pkname", default)]
    pub parent_kernel_name: Option<String>,

    #[serde(rename = "pttype", default)]
    pub partition_table: Option<String>,

    #[serde(rename = "partn", default)]
    pub partition_number: Option<u32>,

    #[serde(rename = "parttype", default)]
    pub partition_type: Option<String>,

    #[serde(default)]
    pub mountpoints: Vec<Option<String>>,

    #[serde(default)]
    pub children: Option<Vec<BlockDevice>>,
}

impl BlockDevice {
    /// Start of a partition in bytes.
    pub fn start_bytes(&self) -> Option<u64> {
        self.start.map(|start| start * LSBLK_SECTOR_SIZE)
    }

    pub fn mount_points(&self) -> impl Iterator<Item = &str> + '_ {
        self.mountpoints.iter().flatten().map(|mp| mp.as_str())
    }
}

/// Lists all block devices as a flat list, parents before children. Devices
/// with several parents (e.g. arrays) are listed once.
pub fn list() -> Command {
    Dependency::Lsblk.cmd().with_args([
        "--json",
        "--bytes",
        "--paths",
        "--list",
        "--output",
        COLUMNS,
    ])
}

pub fn parse(output: &str) -> Result<Vec<BlockDevice>, Error> {
    let parsed: LsBlkOutput =
        serde_json::from_str(output).context("Failed to parse lsblk output")?;

    let mut devices = Vec::new();
    flatten(parsed.blockdevices, &mut devices);
    Ok(devices)
}

fn flatten(tree: Vec<BlockDevice>, devices: &mut Vec<BlockDevice>) {
    for mut device in tree {
        let children = device.children.take();
        if !devices.iter().any(|d: &BlockDevice| d.name == device.name) {
            devices.push(device);
        }
        if let Some(children) = children {
            flatten(children, devices);
        }
    }
}
