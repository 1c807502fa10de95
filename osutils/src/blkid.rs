use std::collections::BTreeMap;

use crate::dependencies::{Command, Dependency};

/// Signature found by blkid on one device.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlkidEntry {
    /// Value of `TYPE`, e.g. `ext4`, `crypto_LUKS` or `linux_raid_member`.
    pub fs_type: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
}

impl BlkidEntry {
    pub fn is_luks(&self) -> bool {
        self.fs_type.as_deref() == Some("crypto_LUKS")
    }
}

/// Probes all devices, bypassing the blkid cache.
pub fn probe_all() -> Command {
    Dependency::Blkid
        .cmd()
        .with_args(["--cache-file", "/dev/null", "--output", "export"])
}

/// Parses `blkid --output export`: one `KEY=value` block per device,
/// separated by empty lines. Entries are keyed by `DEVNAME`.
pub fn parse_export(output: &str) -> BTreeMap<String, BlkidEntry> {
    let mut entries = BTreeMap::new();

    for block in output.split("\n\n") {
        let mut devname = None;
        let mut entry = BlkidEntry::default();
        for (key, value) in block.lines().filter_map(|line| line.split_once('=')) {
            match key {
                "DEVNAME" => devname = Some(value.to_string()),
                "TYPE" => entry.fs_type = Some(value.into()),
                "UUID" => entry.uuid = Some(value.into()),
                "LABEL" => entry.label = Some(value.into()),
                _ => {}
            }
        }
        if let Some(devname) = devname {
            entries.insert(devname, entry);
        }
    }

    entries
}
