//! Partition table commands and the mapping between partition ids and the
//! type identifiers of the table formats.

use blkplan_api::{
    constants::{
        PARTITION_ID_ESP, PARTITION_ID_LINUX, PARTITION_ID_LVM, PARTITION_ID_RAID,
        PARTITION_ID_SWAP,
    },
    devicegraph::{kinds::PtType, Region},
};

use crate::dependencies::{Command, Dependency};

/// GPT type GUIDs of the partition ids blkplan knows.
const GPT_TYPES: &[(u32, &str)] = &[
    (PARTITION_ID_LINUX, "0fc63daf-8483-4772-8e79-3d69d8477de4"),
    (PARTITION_ID_SWAP, "0657fd6d-a4ab-43c4-84e5-0933c84b4f4f"),
    (PARTITION_ID_LVM, "e6d6d379-f507-44c2-a23c-238f2a3df928"),
    (PARTITION_ID_RAID, "a19d880f-05fc-4d3b-a006-743f0f84911e"),
    (PARTITION_ID_ESP, "c12a7328-f81f-11d2-ba4b-00a0c93ec93b"),
];

/// Type identifier of a partition id as sfdisk expects it: a GUID on GPT, a
/// hex byte on MS-DOS tables. `None` if the id has no GPT equivalent.
pub fn partition_type(pt_type: PtType, id: u32) -> Option<String> {
    match pt_type {
        PtType::Gpt => GPT_TYPES
            .iter()
            .find(|(known, _)| *known == id)
            .map(|(_, guid)| guid.to_string()),
        PtType::Msdos => Some(format!("{id:x}")),
    }
}

/// Partition id of a type identifier as reported by lsblk. Unknown GPT types
/// are reported as linux partitions.
pub fn partition_id(partition_type: &str) -> u32 {
    let partition_type = partition_type.to_lowercase();
    if let Some(hex) = partition_type.strip_prefix("0x") {
        return u32::from_str_radix(hex, 16).unwrap_or(PARTITION_ID_LINUX);
    }
    GPT_TYPES
        .iter()
        .find(|(_, guid)| *guid == partition_type)
        .map(|(id, _)| *id)
        .unwrap_or(PARTITION_ID_LINUX)
}

/// Parses the table type reported by lsblk.
pub fn table_type(pttype: &str) -> Option<PtType> {
    match pttype {
        "gpt" => Some(PtType::Gpt),
        "dos" | "msdos" => Some(PtType::Msdos),
        _ => None,
    }
}

pub fn mklabel(disk: &str, pt_type: PtType) -> Command {
    Dependency::Parted
        .cmd()
        .with_args(["--script", disk, "mklabel"])
        .with_arg(pt_type.to_string())
}

/// Creates a partition covering exactly `region`.
pub fn mkpart(disk: &str, region: &Region) -> Command {
    Dependency::Parted
        .cmd()
        .with_args(["--script", "--align", "none", disk, "unit", "B", "mkpart", "primary"])
        .with_arg(format!("{}B", region.start))
        .with_arg(format!("{}B", region.end().unwrap() - 1))
}

pub fn rm(disk: &str, number: u32) -> Command {
    Dependency::Parted
        .cmd()
        .with_args(["--script", disk, "rm"])
        .with_arg(number.to_string())
}

pub fn set_type(disk: &str, number: u32, partition_type: &str) -> Command {
    Dependency::Sfdisk
        .cmd()
        .with_args(["--part-type", disk])
        .with_arg(number.to_string())
        .with_arg(partition_type)
}
