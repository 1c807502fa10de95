//! Parser for `/proc/mdstat`.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use blkplan_api::{
    constants::{DEV_PATH, KIB},
    devicegraph::kinds::{MdLevel, MdParity},
};

pub const PROC_MDSTAT_PATH: &str = "/proc/mdstat";

/// `md0 : active raid1 sdb1[1] sda1[0]`
static ARRAY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(md\S+)\s*:\s*(active|inactive)\s*(?:\(\S+\)\s*)?(.*)$").unwrap());

/// `sdb1[1](F)`
static MEMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+)\[(\d+)\](?:\((\w)\))?$").unwrap());

static SUPER: Lazy<Regex> = Lazy::new(|| Regex::new(r"super (\S+)").unwrap());

static CHUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)k chunk").unwrap());

static ALGORITHM: Lazy<Regex> = Lazy::new(|| Regex::new(r"algorithm (\d+)").unwrap());

static LAYOUT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+) (near|offset|far)-copies").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdstatDevice {
    /// Device path, e.g. `/dev/sda1`.
    pub name: String,
    pub role: u32,
    pub spare: bool,
    pub faulty: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MdstatEntry {
    pub active: bool,
    /// `None` for containers and inactive arrays.
    pub level: Option<MdLevel>,
    pub parity: MdParity,
    pub chunk_size: u64,
    pub metadata: String,
    pub is_container: bool,
    pub has_container: bool,
    pub devices: Vec<MdstatDevice>,
}

/// Arrays of `/proc/mdstat` keyed by kernel name, e.g. `md0`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcMdstat {
    pub entries: BTreeMap<String, MdstatEntry>,
}

impl ProcMdstat {
    pub fn has_entry(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn entry(&self, name: &str) -> Option<&MdstatEntry> {
        self.entries.get(name)
    }
}

pub fn parse(content: &str) -> ProcMdstat {
    let mut entries = BTreeMap::new();
    let mut lines = content.lines().peekable();

    while let Some(line) = lines.next() {
        let Some(captures) = ARRAY_LINE.captures(line) else {
            continue;
        };
        let name = captures[1].to_string();
        let mut entry = MdstatEntry {
            active: &captures[2] == "active",
            ..Default::default()
        };

        let mut tokens = captures[3].split_whitespace().peekable();
        if let Some(level) = tokens.peek().and_then(|token| token.parse::<MdLevel>().ok()) {
            entry.level = Some(level);
            tokens.next();
        }
        for token in tokens {
            if let Some(member) = MEMBER.captures(token) {
                let flag = member.get(3).map(|f| f.as_str());
                entry.devices.push(MdstatDevice {
                    name: format!("{DEV_PATH}/{}", &member[1]),
                    role: member[2].parse().unwrap_or_default(),
                    spare: flag == Some("S"),
                    faulty: flag == Some("F"),
                });
            }
        }
        entry.devices.sort_by_key(|device| device.role);

        // Details follow on indented lines up to the next blank line.
        while let Some(detail) = lines.next_if(|l| l.starts_with(char::is_whitespace)) {
            parse_detail_line(detail, &mut entry);
        }
        entries.insert(name, entry);
    }

    ProcMdstat { entries }
}

fn parse_detail_line(line: &str, entry: &mut MdstatEntry) {
    if !line.contains(" blocks") {
        return;
    }

    if let Some(metadata) = SUPER.captures(line) {
        let metadata = &metadata[1];
        entry.is_container = metadata.starts_with("external:") && !metadata.contains('/');
        entry.has_container = metadata.starts_with("external:/");
        entry.metadata = metadata.into();
    }

    if let Some(chunk) = CHUNK.captures(line) {
        entry.chunk_size = chunk[1].parse::<u64>().unwrap_or_default() * KIB;
    }

    entry.parity = match (entry.level, ALGORITHM.captures(line), LAYOUT.captures(line)) {
        (Some(level @ (MdLevel::Raid5 | MdLevel::Raid6)), Some(algorithm), _) => {
            parity_from_algorithm(level, algorithm[1].parse().unwrap_or_default())
        }
        (Some(MdLevel::Raid10), _, Some(layout)) => {
            parity_from_layout(&layout[1], &layout[2])
        }
        _ => MdParity::Default,
    };
}

fn parity_from_algorithm(level: MdLevel, algorithm: u32) -> MdParity {
    match (level, algorithm) {
        (_, 0) => MdParity::LeftAsymmetric,
        (_, 1) => MdParity::RightAsymmetric,
        (_, 2) => MdParity::LeftSymmetric,
        (_, 3) => MdParity::RightSymmetric,
        (_, 4) => MdParity::First,
        (_, 5) => MdParity::Last,
        (MdLevel::Raid6, 16) => MdParity::LeftAsymmetric6,
        (MdLevel::Raid6, 17) => MdParity::RightAsymmetric6,
        (MdLevel::Raid6, 18) => MdParity::LeftSymmetric6,
        (MdLevel::Raid6, 19) => MdParity::RightSymmetric6,
        (MdLevel::Raid6, 20) => MdParity::First6,
        _ => MdParity::Default,
    }
}

fn parity_from_layout(copies: &str, layout: &str) -> MdParity {
    match (copies, layout) {
        ("2", "near") => MdParity::Near2,
        ("2", "offset") => MdParity::Offset2,
        ("2", "far") => MdParity::Far2,
        ("3", "near") => MdParity::Near3,
        ("3", "offset") => MdParity::Offset3,
        ("3", "far") => MdParity::Far3,
        _ => MdParity::Default,
    }
}
