//! Editing of the mdadm configuration file. Only ARRAY lines owned by blkplan
//! are touched, everything else in the file is kept as is.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;

use blkplan_api::error::{BlkplanError, CommandFailureError, ReportError};

/// Location of the configuration file relative to the root prefix.
pub const ETC_MDADM_CONF_PATH: &str = "etc/mdadm.conf";

/// Header line added by `init` when the file has no DEVICE line.
const DEVICE_LINE: &str = "DEVICE containers partitions";

static UUID_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bUUID=(\S+)").unwrap());

/// An ARRAY line of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcMdadmEntry {
    /// Device name, e.g. `/dev/md/data`.
    pub device: String,
    pub uuid: String,
}

impl EtcMdadmEntry {
    fn to_line(&self) -> String {
        format!("ARRAY {} UUID={}", self.device, self.uuid)
    }
}

/// Updates the persistent mdadm configuration while committing.
pub trait MdadmConfig {
    /// Makes sure the file exists and carries a DEVICE line.
    fn init(&mut self) -> Result<(), BlkplanError>;

    /// Adds the ARRAY line of the entry, replacing a line with the same uuid.
    fn update_entry(&mut self, entry: &EtcMdadmEntry) -> Result<(), BlkplanError>;

    /// Removes the ARRAY line with the uuid, if any.
    fn remove_entry(&mut self, uuid: &str) -> Result<(), BlkplanError>;
}

fn uuid_of_line(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with("ARRAY") {
        return None;
    }
    UUID_KEY
        .captures(trimmed)
        .and_then(|captures| captures.get(1))
        .map(|uuid| uuid.as_str())
}

fn same_uuid(lhs: &str, rhs: &str) -> bool {
    lhs.eq_ignore_ascii_case(rhs)
}

/// Parses the ARRAY lines of a configuration file.
pub fn parse(content: &str) -> Vec<EtcMdadmEntry> {
    content
        .lines()
        .filter_map(|line| {
            let uuid = uuid_of_line(line)?;
            let device = line.split_whitespace().nth(1)?;
            Some(EtcMdadmEntry {
                device: device.into(),
                uuid: uuid.into(),
            })
        })
        .collect()
}

/// Checks if the configuration content lists an array with the uuid.
pub fn has_entry(entries: &[EtcMdadmEntry], uuid: &str) -> bool {
    entries.iter().any(|entry| same_uuid(&entry.uuid, uuid))
}

/// The mdadm configuration file under a root prefix.
#[derive(Debug, Clone)]
pub struct EtcMdadm {
    path: PathBuf,
}

impl EtcMdadm {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Configuration file of the system mounted at `root`.
    pub fn under_root(root: &Path) -> Self {
        Self::new(root.join(ETC_MDADM_CONF_PATH))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file, a missing file reads as empty.
    fn read(&self) -> Result<Vec<String>, Error> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.lines().map(String::from).collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read '{}'", self.path.display()))
            }
        }
    }

    fn write(&self, lines: &[String]) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write '{}'", self.path.display()))
    }

    /// Entries currently in the file.
    pub fn entries(&self) -> Result<Vec<EtcMdadmEntry>, BlkplanError> {
        let lines = self.read().structured(CommandFailureError::UpdateEtcMdadm)?;
        Ok(parse(&lines.join("\n")))
    }

    fn edit(
        &self,
        f: impl FnOnce(&mut Vec<String>) -> bool,
    ) -> Result<(), BlkplanError> {
        let mut lines = self.read().structured(CommandFailureError::UpdateEtcMdadm)?;
        if f(&mut lines) {
            self.write(&lines)
                .structured(CommandFailureError::UpdateEtcMdadm)?;
        }
        Ok(())
    }
}

impl MdadmConfig for EtcMdadm {
    fn init(&mut self) -> Result<(), BlkplanError> {
        self.edit(|lines| {
            if lines
                .iter()
                .any(|line| line.trim_start().starts_with("DEVICE"))
            {
                return false;
            }
            debug!("Adding '{DEVICE_LINE}' to '{}'", self.path.display());
            lines.insert(0, DEVICE_LINE.into());
            true
        })
    }

    fn update_entry(&mut self, entry: &EtcMdadmEntry) -> Result<(), BlkplanError> {
        self.edit(|lines| {
            let line = entry.to_line();
            match lines
                .iter_mut()
                .find(|l| uuid_of_line(l).is_some_and(|uuid| same_uuid(uuid, &entry.uuid)))
            {
                Some(existing) if *existing == line => return false,
                Some(existing) => {
                    trace!("Replacing '{existing}' with '{line}'");
                    *existing = line;
                }
                None => {
                    trace!("Appending '{line}'");
                    lines.push(line);
                }
            }
            true
        })
    }

    fn remove_entry(&mut self, uuid: &str) -> Result<(), BlkplanError> {
        self.edit(|lines| {
            let before = lines.len();
            lines.retain(|line| !uuid_of_line(line).is_some_and(|u| same_uuid(u, uuid)));
            lines.len() != before
        })
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use tempfile::TempDir;

    use blkplan_api::error::ErrorKind as BlkplanErrorKind;

    use super::*;

    const UUID_DATA: &str = "ea381b70:20b2ab81:602edecb:cf6f2032";
    const UUID_HOME: &str = "6245349d:505a367b:6ceba75f:7f55c158";

    #[test]
    fn test_parse() {
        let entries = parse(indoc! {"
            # mdadm.conf written by the installer
            DEVICE containers partitions
            ARRAY /dev/md/data metadata=1.0 UUID=ea381b70:20b2ab81:602edecb:cf6f2032
              ARRAY /dev/md127 uuid=6245349d:505a367b:6ceba75f:7f55c158
            MAILADDR root
        "});
        assert_eq!(
            entries,
            vec![
                EtcMdadmEntry {
                    device: "/dev/md/data".into(),
                    uuid: UUID_DATA.into()
                },
                EtcMdadmEntry {
                    device: "/dev/md127".into(),
                    uuid: UUID_HOME.into()
                },
            ]
        );
        assert!(has_entry(&entries, &UUID_DATA.to_uppercase()));
        assert!(!has_entry(&entries, "00000000:00000000:00000000:00000000"));
    }

    #[test]
    fn test_edit_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut etc_mdadm = EtcMdadm::under_root(dir.path());
        assert!(etc_mdadm.entries().unwrap().is_empty());

        etc_mdadm.init().unwrap();
        etc_mdadm
            .update_entry(&EtcMdadmEntry {
                device: "/dev/md/data".into(),
                uuid: UUID_DATA.into(),
            })
            .unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/mdadm.conf")).unwrap(),
            indoc! {"
                DEVICE containers partitions
                ARRAY /dev/md/data UUID=ea381b70:20b2ab81:602edecb:cf6f2032
            "}
        );
    }

    #[test]
    fn test_edit_keeps_unrelated_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mdadm.conf");
        fs::write(
            &path,
            indoc! {"
                DEVICE /dev/sd*
                MAILADDR root
                ARRAY /dev/md/data metadata=1.0 UUID=ea381b70:20b2ab81:602edecb:cf6f2032
                ARRAY /dev/md/home UUID=6245349d:505a367b:6ceba75f:7f55c158
            "},
        )
        .unwrap();

        let mut etc_mdadm = EtcMdadm::new(&path);
        etc_mdadm.init().unwrap();
        etc_mdadm
            .update_entry(&EtcMdadmEntry {
                device: "/dev/md/srv".into(),
                uuid: UUID_DATA.into(),
            })
            .unwrap();
        etc_mdadm.remove_entry(&UUID_HOME.to_uppercase()).unwrap();
        etc_mdadm.remove_entry(UUID_HOME).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            indoc! {"
                DEVICE /dev/sd*
                MAILADDR root
                ARRAY /dev/md/srv UUID=ea381b70:20b2ab81:602edecb:cf6f2032
            "}
        );
    }

    #[test]
    fn test_unwritable_file() {
        let dir = TempDir::new().unwrap();
        // A directory in place of the file cannot be read.
        let mut etc_mdadm = EtcMdadm::new(dir.path());
        let error = etc_mdadm.init().unwrap_err();
        assert_eq!(
            error.kind(),
            &BlkplanErrorKind::CommandFailure(CommandFailureError::UpdateEtcMdadm)
        );
    }
}
