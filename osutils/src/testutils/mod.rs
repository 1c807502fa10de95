//! Stand-ins for the system collaborators, used by unit tests here and in
//! dependent crates.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use blkplan_api::error::{BlkplanError, CommandFailureError};

use crate::{
    blkid::BlkidEntry,
    dependencies::{Command, CommandOutput, CommandRunner, Dependency, DependencyError},
    etc_mdadm::{EtcMdadmEntry, MdadmConfig},
    lsblk::BlockDevice,
    lvm::LvmReport,
    mdadm::MdadmDetail,
    mdstat::ProcMdstat,
    system_info::SystemInfo,
};

#[derive(Debug, Clone)]
struct Response {
    prefix: String,
    code: i32,
    stdout: String,
}

/// Records every command instead of running it. Commands succeed with empty
/// output unless a response matches the start of their rendered form.
#[derive(Debug, Default)]
pub struct MockRunner {
    responses: Vec<Response>,
    missing: BTreeSet<Dependency>,
    commands: RefCell<Vec<String>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands starting with `prefix` with `stdout`.
    pub fn respond(self, prefix: &str, stdout: &str) -> Self {
        self.respond_with_code(prefix, 0, stdout)
    }

    pub fn respond_with_code(mut self, prefix: &str, code: i32, stdout: &str) -> Self {
        self.responses.push(Response {
            prefix: prefix.into(),
            code,
            stdout: stdout.into(),
        });
        self
    }

    /// Makes commands starting with `prefix` exit with status 1.
    pub fn fail(self, prefix: &str) -> Self {
        self.respond_with_code(prefix, 1, "")
    }

    /// Reports the binary of `dependency` as not installed.
    pub fn missing(mut self, dependency: Dependency) -> Self {
        self.missing.insert(dependency);
        self
    }

    /// Rendered commands in the order they were run.
    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl CommandRunner for MockRunner {
    fn output(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>> {
        let rendered = command.render();
        self.commands.borrow_mut().push(rendered.clone());

        let response = self
            .responses
            .iter()
            .find(|response| rendered.starts_with(&response.prefix));
        Ok(match response {
            Some(response) => CommandOutput::new(
                command,
                response.code,
                response.stdout.clone(),
                if response.code == 0 { "" } else { "mock failure" },
            ),
            None => CommandOutput::new(command, 0, "", ""),
        })
    }

    fn exists(&self, dependency: Dependency) -> bool {
        !self.missing.contains(&dependency)
    }
}

/// Fixed facts for driving the prober.
#[derive(Debug, Default, Clone)]
pub struct FixedSystemInfo {
    pub dir_entries: BTreeMap<PathBuf, Vec<String>>,
    pub proc_mdstat: ProcMdstat,
    pub mdadm_details: BTreeMap<String, MdadmDetail>,
    pub etc_mdadm: Vec<EtcMdadmEntry>,
    pub block_devices: Vec<BlockDevice>,
    pub blkid: BTreeMap<String, BlkidEntry>,
    pub lvm_report: LvmReport,
}

impl SystemInfo for FixedSystemInfo {
    fn dir_entries(&self, path: &Path) -> Result<Vec<String>, BlkplanError> {
        Ok(self.dir_entries.get(path).cloned().unwrap_or_default())
    }

    fn proc_mdstat(&self) -> Result<&ProcMdstat, BlkplanError> {
        Ok(&self.proc_mdstat)
    }

    fn mdadm_detail(&self, name: &str) -> Result<MdadmDetail, BlkplanError> {
        self.mdadm_details.get(name).cloned().ok_or_else(|| {
            BlkplanError::new(CommandFailureError::Probe {
                what: format!("mdadm detail of '{name}'"),
            })
        })
    }

    fn etc_mdadm(&self) -> Result<&[EtcMdadmEntry], BlkplanError> {
        Ok(&self.etc_mdadm)
    }

    fn block_devices(&self) -> Result<&[BlockDevice], BlkplanError> {
        Ok(&self.block_devices)
    }

    fn blkid(&self) -> Result<&BTreeMap<String, BlkidEntry>, BlkplanError> {
        Ok(&self.blkid)
    }

    fn lvm_report(&self) -> Result<&LvmReport, BlkplanError> {
        Ok(&self.lvm_report)
    }
}

/// Keeps the configuration entries in memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InMemoryMdadmConfig {
    pub initialized: bool,
    pub entries: Vec<EtcMdadmEntry>,
}

impl MdadmConfig for InMemoryMdadmConfig {
    fn init(&mut self) -> Result<(), BlkplanError> {
        self.initialized = true;
        Ok(())
    }

    fn update_entry(&mut self, entry: &EtcMdadmEntry) -> Result<(), BlkplanError> {
        match self.entries.iter_mut().find(|e| e.uuid == entry.uuid) {
            Some(existing) => *existing = entry.clone(),
            None => self.entries.push(entry.clone()),
        }
        Ok(())
    }

    fn remove_entry(&mut self, uuid: &str) -> Result<(), BlkplanError> {
        self.entries.retain(|entry| entry.uuid != uuid);
        Ok(())
    }
}
