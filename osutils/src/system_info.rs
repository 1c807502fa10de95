//! Facts about the running system that the prober turns into a devicegraph.

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::{debug, trace};
use once_cell::unsync::OnceCell;

use blkplan_api::error::{BlkplanError, CommandFailureError, ReportError};

use crate::{
    blkid::{self, BlkidEntry},
    dependencies::{Command, CommandRunner, Dependency, DependencyResultExt},
    etc_mdadm::{self, EtcMdadmEntry},
    lsblk::{self, BlockDevice},
    lvm::{self, LvmReport},
    mdadm::{self, MdadmDetail},
    mdstat::{self, ProcMdstat, PROC_MDSTAT_PATH},
};

/// Directory listing the block devices known to the kernel.
pub const SYS_BLOCK_PATH: &str = "/sys/block";

/// Structured facts about the storage of a system. Implementations may cache
/// results, a fresh instance is used for every probe.
pub trait SystemInfo {
    /// Names of the entries of a directory, sorted. A missing directory has
    /// no entries.
    fn dir_entries(&self, path: &Path) -> Result<Vec<String>, BlkplanError>;

    fn proc_mdstat(&self) -> Result<&ProcMdstat, BlkplanError>;

    /// `name` is the device path of the array, e.g. `/dev/md0`.
    fn mdadm_detail(&self, name: &str) -> Result<MdadmDetail, BlkplanError>;

    /// ARRAY entries of the persistent mdadm configuration.
    fn etc_mdadm(&self) -> Result<&[EtcMdadmEntry], BlkplanError>;

    fn block_devices(&self) -> Result<&[BlockDevice], BlkplanError>;

    /// Signatures keyed by device path.
    fn blkid(&self) -> Result<&BTreeMap<String, BlkidEntry>, BlkplanError>;

    fn lvm_report(&self) -> Result<&LvmReport, BlkplanError>;
}

/// Gathers facts by running tools through a runner and reading kernel
/// interfaces.
pub struct LiveSystemInfo<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    etc_mdadm_path: PathBuf,
    proc_mdstat: OnceCell<ProcMdstat>,
    etc_mdadm: OnceCell<Vec<EtcMdadmEntry>>,
    block_devices: OnceCell<Vec<BlockDevice>>,
    blkid: OnceCell<BTreeMap<String, BlkidEntry>>,
    lvm_report: OnceCell<LvmReport>,
}

impl<'a, R: CommandRunner + ?Sized> LiveSystemInfo<'a, R> {
    pub fn new(runner: &'a R, etc_mdadm_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            etc_mdadm_path: etc_mdadm_path.into(),
            proc_mdstat: OnceCell::new(),
            etc_mdadm: OnceCell::new(),
            block_devices: OnceCell::new(),
            blkid: OnceCell::new(),
            lvm_report: OnceCell::new(),
        }
    }

    fn run(&self, command: &Command) -> Result<String, BlkplanError> {
        trace!("Probing with '{command}'");
        self.runner
            .output_and_check(command)
            .message(format!("Failed to run '{command}'"))
    }

    fn read_optional(path: &Path) -> Result<String, BlkplanError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("'{}' does not exist", path.display());
                Ok(String::new())
            }
            Err(e) => Err(e).structured(CommandFailureError::Probe {
                what: path.display().to_string(),
            }),
        }
    }

    fn lvm_section<T: serde::de::DeserializeOwned>(
        &self,
        command: Command,
        key: &str,
    ) -> Result<Vec<T>, BlkplanError> {
        let output = self.run(&command)?;
        lvm::parse_report(&output, key).structured(CommandFailureError::ParseOutput {
            command: command.render(),
        })
    }
}

impl<R: CommandRunner + ?Sized> SystemInfo for LiveSystemInfo<'_, R> {
    fn dir_entries(&self, path: &Path) -> Result<Vec<String>, BlkplanError> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).structured(CommandFailureError::Probe {
                    what: path.display().to_string(),
                })
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.structured(CommandFailureError::Probe {
                what: path.display().to_string(),
            })?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn proc_mdstat(&self) -> Result<&ProcMdstat, BlkplanError> {
        self.proc_mdstat.get_or_try_init(|| -> Result<_, BlkplanError> {
            let content = Self::read_optional(Path::new(PROC_MDSTAT_PATH))?;
            Ok(mdstat::parse(&content))
        })
    }

    fn mdadm_detail(&self, name: &str) -> Result<MdadmDetail, BlkplanError> {
        let command = mdadm::detail_export(name);
        let detail = mdadm::parse_detail_export(&self.run(&command)?);
        if detail.uuid.is_empty() {
            return Err(BlkplanError::new(CommandFailureError::ParseOutput {
                command: command.render(),
            }));
        }
        Ok(detail)
    }

    fn etc_mdadm(&self) -> Result<&[EtcMdadmEntry], BlkplanError> {
        self.etc_mdadm
            .get_or_try_init(|| -> Result<_, BlkplanError> {
                let content = Self::read_optional(&self.etc_mdadm_path)?;
                Ok(etc_mdadm::parse(&content))
            })
            .map(Vec::as_slice)
    }

    fn block_devices(&self) -> Result<&[BlockDevice], BlkplanError> {
        self.block_devices
            .get_or_try_init(|| -> Result<_, BlkplanError> {
                let command = lsblk::list();
                let output = self.run(&command)?;
                lsblk::parse(&output).structured(CommandFailureError::ParseOutput {
                    command: command.render(),
                })
            })
            .map(Vec::as_slice)
    }

    fn blkid(&self) -> Result<&BTreeMap<String, BlkidEntry>, BlkplanError> {
        self.blkid.get_or_try_init(|| -> Result<_, BlkplanError> {
            let command = blkid::probe_all();
            // blkid exits with 2 when no device carries a signature.
            let output = self
                .runner
                .output(&command)
                .message(format!("Failed to run '{command}'"))?;
            match output.code() {
                Some(2) => Ok(BTreeMap::new()),
                _ => {
                    let stdout = output
                        .check_output()
                        .message(format!("Failed to run '{command}'"))?;
                    Ok(blkid::parse_export(&stdout))
                }
            }
        })
    }

    fn lvm_report(&self) -> Result<&LvmReport, BlkplanError> {
        self.lvm_report.get_or_try_init(|| -> Result<_, BlkplanError> {
            if !self.runner.exists(Dependency::Lvs) {
                debug!("LVM tools are not installed, skipping LVM probing");
                return Ok(LvmReport::default());
            }
            Ok(LvmReport {
                pvs: self.lvm_section(lvm::pvs(), "pv")?,
                vgs: self.lvm_section(lvm::vgs(), "vg")?,
                lvs: self.lvm_section(lvm::lvs(), "lv")?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use tempfile::TempDir;

    use blkplan_api::error::ErrorKind as BlkplanErrorKind;

    use crate::testutils::MockRunner;

    use super::*;

    #[test]
    fn test_dir_entries() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("md0")).unwrap();
        fs::create_dir(dir.path().join("sda")).unwrap();
        fs::write(dir.path().join("loop0"), "").unwrap();

        let runner = MockRunner::new();
        let info = LiveSystemInfo::new(&runner, dir.path().join("mdadm.conf"));
        assert_eq!(
            info.dir_entries(dir.path()).unwrap(),
            vec!["loop0", "md0", "sda"]
        );
        assert!(info
            .dir_entries(&dir.path().join("missing"))
            .unwrap()
            .is_empty());
        assert!(info.etc_mdadm().unwrap().is_empty());
    }

    #[test]
    fn test_block_devices_cached() {
        let runner = MockRunner::new().respond(
            "lsblk",
            indoc! {r#"
                {
                   "blockdevices": [
                      {"name": "/dev/sda", "kname": "/dev/sda", "type": "disk", "size": 107374182400,
                       "start": null, "pkname": null, "pttype": "gpt", "partn": null,
                       "parttype": null, "mountpoints": [null]}
                   ]
                }
            "#},
        );
        let info = LiveSystemInfo::new(&runner, "/nonexistent/mdadm.conf");
        assert_eq!(info.block_devices().unwrap().len(), 1);
        assert_eq!(info.block_devices().unwrap()[0].name, "/dev/sda");
        assert_eq!(runner.commands().len(), 1);
    }

    #[test]
    fn test_parse_failure() {
        let runner = MockRunner::new().respond("lsblk", "not json");
        let info = LiveSystemInfo::new(&runner, "/nonexistent/mdadm.conf");
        let error = info.block_devices().unwrap_err();
        assert!(matches!(
            error.kind(),
            BlkplanErrorKind::CommandFailure(CommandFailureError::ParseOutput { .. })
        ));
    }

    #[test]
    fn test_mdadm_detail() {
        let runner = MockRunner::new()
            .respond(
                "mdadm --detail --export /dev/md0",
                indoc! {"
                    MD_LEVEL=raid1
                    MD_DEVICES=2
                    MD_METADATA=1.0
                    MD_UUID=ea381b70:20b2ab81:602edecb:cf6f2032
                    MD_DEVNAME=data
                "},
            )
            .fail("mdadm --detail --export /dev/md1");
        let info = LiveSystemInfo::new(&runner, "/nonexistent/mdadm.conf");

        let detail = info.mdadm_detail("/dev/md0").unwrap();
        assert_eq!(detail.devname.as_deref(), Some("data"));
        assert_eq!(detail.uuid, "ea381b70:20b2ab81:602edecb:cf6f2032");

        let error = info.mdadm_detail("/dev/md1").unwrap_err();
        assert!(matches!(
            error.kind(),
            BlkplanErrorKind::CommandFailure(CommandFailureError::CommandFailed { .. })
        ));
    }

    #[test]
    fn test_blkid_without_signatures() {
        let runner = MockRunner::new().respond_with_code("blkid", 2, "");
        let info = LiveSystemInfo::new(&runner, "/nonexistent/mdadm.conf");
        assert!(info.blkid().unwrap().is_empty());
    }

    #[test]
    fn test_lvm_report_without_lvm() {
        let runner = MockRunner::new().missing(Dependency::Lvs);
        let info = LiveSystemInfo::new(&runner, "/nonexistent/mdadm.conf");
        assert_eq!(info.lvm_report().unwrap(), &LvmReport::default());
        assert!(runner.commands().is_empty());
    }
}
