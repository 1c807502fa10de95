//! Executes an actiongraph against the system.
//!
//! Every action is first translated into a list of [`Step`]s: external
//! commands built by `osutils` plus edits of the mdadm configuration. All
//! steps are built before anything runs, so a plan that cannot be expressed
//! as commands, or that needs a missing binary, fails without touching the
//! system. Steps then run strictly in commit order and the first failure
//! stops the commit. Nothing is rolled back.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info, trace};

use blkplan_api::{
    constants::PARTITION_ID_LINUX,
    devicegraph::{Device, DeviceKind, HolderKind, MdUser},
    error::{
        BlkplanError, BlkplanResultExt, CommandFailureError, LogicError, ReportError,
        UnsupportedChangeError, ValidationError,
    },
    Action, ActionKind, Actiongraph, Devicegraph, ReallotMode, Side, Sid,
};
use osutils::{
    btrfs,
    dependencies::{Command, CommandRunner, Dependency, DependencyResultExt},
    encryption,
    etc_mdadm::{EtcMdadmEntry, MdadmConfig},
    lvm,
    mdadm::{self, MdCreate, MdCreateDevices},
    mkfs, mount, partitions, wipefs,
};

use super::describe::{describe, Tense};

/// One unit of work of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Run(Command),

    /// Creates the directory a filesystem gets mounted on.
    CreateDir(PathBuf),

    /// Reads the uuid mdadm assigned to a new array.
    QueryMdUuid { sid: Sid, name: String },

    InitEtcMdadm,

    /// Adds the ARRAY line of an array. The uuid is the one of the staging
    /// graph or the one queried while committing.
    UpdateEtcMdadm { sid: Sid, device: String },

    RemoveEtcMdadm { uuid: String },
}

impl Step {
    fn dependency(&self) -> Option<Dependency> {
        match self {
            Self::Run(command) => Some(command.dependency()),
            Self::QueryMdUuid { .. } => Some(Dependency::Mdadm),
            _ => None,
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(command) => write!(f, "{command}"),
            Self::CreateDir(path) => write!(f, "mkdir -p {}", path.display()),
            Self::QueryMdUuid { name, .. } => write!(f, "{}", mdadm::detail_export(name)),
            Self::InitEtcMdadm => f.write_str("init mdadm.conf"),
            Self::UpdateEtcMdadm { device, .. } => write!(f, "add ARRAY {device} to mdadm.conf"),
            Self::RemoveEtcMdadm { uuid } => write!(f, "remove ARRAY UUID={uuid} from mdadm.conf"),
        }
    }
}

/// An action together with the steps committing it.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub action: Action,
    pub description: String,
    /// Description in progress form, logged while committing.
    pub progress: String,
    pub steps: Vec<Step>,
}

/// Outcome of a successful commit.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub applied: Vec<Action>,

    /// Uuids mdadm assigned to arrays created without one.
    pub md_uuids: BTreeMap<Sid, String>,
}

/// A commit that stopped early. `failed` is `None` when the commit was
/// refused before the first action ran.
#[derive(Debug)]
pub struct CommitFailure {
    pub failed: Option<Action>,
    pub applied: Vec<Action>,
    pub error: BlkplanError,
}

impl From<CommitFailure> for BlkplanError {
    fn from(failure: CommitFailure) -> Self {
        failure.error
    }
}

/// Builds the steps of every action in commit order.
pub struct StepBuilder<'g, 'a> {
    actiongraph: &'g Actiongraph<'a>,
    root: &'g Path,
}

impl<'g, 'a> StepBuilder<'g, 'a> {
    /// `root` prefixes every path the steps touch.
    pub fn new(actiongraph: &'g Actiongraph<'a>, root: &'g Path) -> Self {
        Self { actiongraph, root }
    }

    pub fn plan(&self) -> Result<Vec<PlannedAction>, BlkplanError> {
        self.actiongraph
            .commit_order()?
            .into_iter()
            .map(|idx| {
                let action = *self.actiongraph.action(idx);
                let steps = self
                    .steps(&action)
                    .message(format!("Failed to prepare '{action}'"))?;
                Ok(PlannedAction {
                    action,
                    description: describe(self.actiongraph, &action, Tense::Simple)?,
                    progress: describe(self.actiongraph, &action, Tense::Continuous)?,
                    steps,
                })
            })
            .collect()
    }

    fn graph(&self, side: Side) -> &'a Devicegraph {
        match side {
            Side::Lhs => self.actiongraph.lhs(),
            Side::Rhs => self.actiongraph.rhs(),
        }
    }

    fn under_root(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    fn steps(&self, action: &Action) -> Result<Vec<Step>, BlkplanError> {
        let graph = self.graph(action.side());
        let device = self.actiongraph.device(action)?;
        trace!("Building steps of '{action}' for {}", device.describe());

        match &device.kind {
            DeviceKind::Disk(_) => self.disk_steps(action, device),
            DeviceKind::Partition(_) => self.partition_steps(graph, action, device),
            DeviceKind::Md(_) => self.md_steps(graph, action, device),
            DeviceKind::MdContainer(_) | DeviceKind::MdMember(_) => {
                self.container_steps(graph, action, device)
            }
            DeviceKind::LvmPv(_) => self.pv_steps(graph, action, device),
            DeviceKind::LvmVg(_) => self.vg_steps(graph, action, device),
            DeviceKind::LvmLv(_) => self.lv_steps(graph, action, device),
            DeviceKind::Luks(_) => self.luks_steps(graph, action, device),
            DeviceKind::BlkFilesystem(_) => self.filesystem_steps(graph, action, device),
            DeviceKind::BtrfsSubvolume(_) => self.subvolume_steps(graph, action, device),
            DeviceKind::MountPoint(_) => self.mount_point_steps(graph, action, device),
        }
    }

    fn disk_steps(&self, action: &Action, device: &Device) -> Result<Vec<Step>, BlkplanError> {
        let disk = device.as_disk().structured(unexpected(action, device))?;
        match (action.kind(), disk.partition_table) {
            (ActionKind::CreatePartitionTable, Some(pt_type)) => Ok(vec![Step::Run(
                partitions::mklabel(&disk.blk.name, pt_type),
            )]),
            _ => Err(BlkplanError::new(unexpected(action, device))),
        }
    }

    fn partition_steps(
        &self,
        graph: &Devicegraph,
        action: &Action,
        device: &Device,
    ) -> Result<Vec<Step>, BlkplanError> {
        let partition = device
            .as_partition()
            .structured(unexpected(action, device))?;
        let disk_device = first_parent(graph, device)?;
        let disk = disk_device
            .as_disk()
            .structured(unexpected(action, device))?;

        let set_type = || -> Result<Step, BlkplanError> {
            let pt_type = disk.partition_table.structured(ValidationError::MissingPartitionTable {
                disk: disk.blk.name.clone(),
            })?;
            let partition_type = partitions::partition_type(pt_type, partition.id).structured(
                ValidationError::UnsupportedPartitionId {
                    device: partition.blk.name.clone(),
                    id: partition.id,
                },
            )?;
            Ok(Step::Run(partitions::set_type(
                &disk.blk.name,
                partition.number,
                &partition_type,
            )))
        };

        match action.kind() {
            ActionKind::Create => {
                let mut steps = vec![Step::Run(partitions::mkpart(
                    &disk.blk.name,
                    &partition.blk.region,
                ))];
                if partition.id != PARTITION_ID_LINUX {
                    steps.push(set_type()?);
                }
                Ok(steps)
            }
            ActionKind::Delete => Ok(vec![
                Step::Run(wipefs::all(&partition.blk.name)),
                Step::Run(partitions::rm(&disk.blk.name, partition.number)),
            ]),
            ActionKind::SetPartitionId => Ok(vec![set_type()?]),
            _ => Err(BlkplanError::new(unexpected(action, device))),
        }
    }

    fn md_steps(
        &self,
        graph: &Devicegraph,
        action: &Action,
        device: &Device,
    ) -> Result<Vec<Step>, BlkplanError> {
        let md = device.as_md().structured(unexpected(action, device))?;
        let name = md.blk.name.as_str();

        match action.kind() {
            ActionKind::Create => {
                let mut members: Vec<(MdUser, String)> = Vec::new();
                for (member, role) in graph.md_members(device.sid())? {
                    members.push((role, blk_name(graph, member)?));
                }
                members.sort_by_key(|(role, _)| role.sort_key);

                let params = MdCreate {
                    name,
                    level: md.level,
                    parity: md.parity,
                    chunk_size: md.chunk_size,
                    metadata: &md.metadata,
                    uuid: Some(md.uuid.as_str()).filter(|uuid| !uuid.is_empty()),
                    devices: MdCreateDevices {
                        members: members
                            .iter()
                            .filter(|(role, _)| !role.spare)
                            .map(|(_, name)| name.as_str())
                            .collect(),
                        spares: members
                            .iter()
                            .filter(|(role, _)| role.spare)
                            .map(|(_, name)| name.as_str())
                            .collect(),
                    },
                };
                let mut steps = vec![Step::Run(mdadm::create(&params))];
                if md.uuid.is_empty() {
                    steps.push(Step::QueryMdUuid {
                        sid: device.sid(),
                        name: name.into(),
                    });
                }
                Ok(steps)
            }
            ActionKind::Deactivate => Ok(vec![Step::Run(mdadm::stop(name))]),
            ActionKind::Delete => wipe_members(graph, device),
            ActionKind::AddToEtcMdadm => Ok(vec![
                Step::InitEtcMdadm,
                Step::UpdateEtcMdadm {
                    sid: device.sid(),
                    device: name.into(),
                },
            ]),
            ActionKind::RemoveFromEtcMdadm => {
                if md.uuid.is_empty() {
                    return Err(BlkplanError::new(CommandFailureError::QueryUuid {
                        device: name.into(),
                    }));
                }
                Ok(vec![Step::RemoveEtcMdadm {
                    uuid: md.uuid.clone(),
                }])
            }
            ActionKind::Reallot {
                mode: ReallotMode::Extend,
                device: member,
            } => {
                let role = md_role(graph, member, device.sid())?;
                Ok(vec![Step::Run(mdadm::add(
                    name,
                    &blk_name(graph, member)?,
                    role.spare,
                ))])
            }
            ActionKind::Reallot {
                mode: ReallotMode::Reduce,
                device: member,
            } => {
                let role = md_role(graph, member, device.sid())?;
                let member = blk_name(graph, member)?;
                let mut steps = Vec::new();
                if !role.spare && !role.faulty {
                    steps.push(Step::Run(mdadm::fail(name, &member)));
                }
                steps.push(Step::Run(mdadm::remove(name, &member)));
                steps.push(Step::Run(wipefs::all(&member)));
                Ok(steps)
            }
            ActionKind::MarkFaulty { device: member } => Ok(vec![Step::Run(mdadm::fail(
                name,
                &blk_name(graph, member)?,
            ))]),
            _ => Err(BlkplanError::new(unexpected(action, device))),
        }
    }

    fn container_steps(
        &self,
        graph: &Devicegraph,
        action: &Action,
        device: &Device,
    ) -> Result<Vec<Step>, BlkplanError> {
        let name = device.require_blk()?.name.as_str();
        match action.kind() {
            ActionKind::Deactivate => Ok(vec![Step::Run(mdadm::stop(name))]),
            // Members of a container array are wiped with the container.
            ActionKind::Delete if device.as_md_member().is_some() => Ok(Vec::new()),
            ActionKind::Delete => wipe_members(graph, device),
            _ => Err(BlkplanError::new(unexpected(action, device))),
        }
    }

    fn pv_steps(
        &self,
        graph: &Devicegraph,
        action: &Action,
        device: &Device,
    ) -> Result<Vec<Step>, BlkplanError> {
        let blk = first_parent(graph, device)?.require_blk()?.name.clone();
        match action.kind() {
            ActionKind::Create => Ok(vec![Step::Run(lvm::pvcreate(&blk))]),
            ActionKind::Delete => Ok(vec![Step::Run(lvm::pvremove(&blk))]),
            _ => Err(BlkplanError::new(unexpected(action, device))),
        }
    }

    fn vg_steps(
        &self,
        graph: &Devicegraph,
        action: &Action,
        device: &Device,
    ) -> Result<Vec<Step>, BlkplanError> {
        let vg = device.as_lvm_vg().structured(unexpected(action, device))?;
        match action.kind() {
            ActionKind::Create => {
                let mut pvs = Vec::new();
                for pv in graph.parent_sids(device.sid())? {
                    pvs.push(pv_blk_name(graph, pv)?);
                }
                let pvs: Vec<&str> = pvs.iter().map(String::as_str).collect();
                Ok(vec![Step::Run(lvm::vgcreate(
                    &vg.vg_name,
                    vg.extent_size,
                    &pvs,
                ))])
            }
            ActionKind::Delete => Ok(vec![Step::Run(lvm::vgremove(&vg.vg_name))]),
            ActionKind::Rename => {
                let old = self
                    .actiongraph
                    .lhs()
                    .find_device(device.sid())?
                    .as_lvm_vg()
                    .structured(unexpected(action, device))?;
                Ok(vec![Step::Run(lvm::vgrename(&old.vg_name, &vg.vg_name))])
            }
            ActionKind::Reallot { mode, device: pv } => {
                let blk = pv_blk_name(graph, pv)?;
                Ok(vec![Step::Run(match mode {
                    ReallotMode::Extend => lvm::vgextend(&vg.vg_name, &blk),
                    ReallotMode::Reduce => lvm::vgreduce(&vg.vg_name, &blk),
                })])
            }
            _ => Err(BlkplanError::new(unexpected(action, device))),
        }
    }

    fn lv_steps(
        &self,
        graph: &Devicegraph,
        action: &Action,
        device: &Device,
    ) -> Result<Vec<Step>, BlkplanError> {
        let lv = device.as_lvm_lv().structured(unexpected(action, device))?;
        let vg = first_parent(graph, device)?
            .as_lvm_vg()
            .structured(unexpected(action, device))?;
        match action.kind() {
            ActionKind::Create => Ok(vec![Step::Run(lvm::lvcreate(
                &vg.vg_name,
                &lv.lv_name,
                lv.blk.size(),
                lv.stripes,
            ))]),
            ActionKind::Delete => Ok(vec![Step::Run(lvm::lvremove(&vg.vg_name, &lv.lv_name))]),
            // The volume group, if renamed too, is renamed first.
            ActionKind::Rename => {
                let old = self
                    .actiongraph
                    .lhs()
                    .find_device(device.sid())?
                    .as_lvm_lv()
                    .structured(unexpected(action, device))?;
                Ok(vec![Step::Run(lvm::lvrename(
                    &vg.vg_name,
                    &old.lv_name,
                    &lv.lv_name,
                ))])
            }
            _ => Err(BlkplanError::new(unexpected(action, device))),
        }
    }

    fn luks_steps(
        &self,
        graph: &Devicegraph,
        action: &Action,
        device: &Device,
    ) -> Result<Vec<Step>, BlkplanError> {
        let luks = device.as_luks().structured(unexpected(action, device))?;
        let backing = first_parent(graph, device)?.require_blk()?.name.clone();
        match action.kind() {
            ActionKind::Create => {
                let key_file = luks
                    .key_file
                    .as_deref()
                    .structured(ValidationError::MissingKeyFile {
                        device: luks.blk.name.clone(),
                    })?;
                Ok(vec![
                    Step::Run(encryption::luks_format(
                        &backing,
                        key_file,
                        Some(luks.uuid.as_str()).filter(|uuid| !uuid.is_empty()),
                    )),
                    Step::Run(encryption::open(&backing, &luks.dm_table_name, key_file)),
                ])
            }
            ActionKind::Deactivate => Ok(vec![Step::Run(encryption::close(&luks.dm_table_name))]),
            ActionKind::Delete => Ok(vec![Step::Run(wipefs::all(&backing))]),
            _ => Err(BlkplanError::new(unexpected(action, device))),
        }
    }

    fn filesystem_steps(
        &self,
        graph: &Devicegraph,
        action: &Action,
        device: &Device,
    ) -> Result<Vec<Step>, BlkplanError> {
        let fs = device
            .as_blk_filesystem()
            .structured(unexpected(action, device))?;
        let mut devices = Vec::new();
        for parent in graph.parents(device.sid())? {
            devices.push(parent.require_blk()?.name.clone());
        }
        let devices: Vec<&str> = devices.iter().map(String::as_str).collect();

        match action.kind() {
            ActionKind::Create => {
                let command = mkfs::mkfs(fs.fs_type, &devices, &fs.label, &fs.mkfs_options)
                    .structured(UnsupportedChangeError::CannotCreate {
                        device_type: device.device_type().to_string(),
                        device: fs.fs_type.to_string(),
                    })?;
                Ok(vec![Step::Run(command)])
            }
            ActionKind::Delete => Ok(devices
                .iter()
                .map(|blk| Step::Run(wipefs::all(blk)))
                .collect()),
            ActionKind::SetLabel => {
                let blk = devices.first().structured(unexpected(action, device))?;
                let command = mkfs::set_label(fs.fs_type, blk, &fs.label).structured(
                    UnsupportedChangeError::CannotChangeLabel {
                        device: fs.label.clone(),
                        fs_type: fs.fs_type.to_string(),
                    },
                )?;
                Ok(vec![Step::Run(command)])
            }
            _ => Err(BlkplanError::new(unexpected(action, device))),
        }
    }

    /// Path the btrfs holding a subvolume is mounted at, below the root.
    fn btrfs_mount_path(&self, graph: &Devicegraph, subvolume: Sid) -> Result<PathBuf, BlkplanError> {
        let btrfs = graph.btrfs_of_subvolume(subvolume)?;
        let path = graph
            .mount_point_of(btrfs)?
            .map(|mp| graph.find_device(mp))
            .transpose()?
            .and_then(|mp| mp.as_mount_point())
            .map(|mp| mp.path.clone());
        match path {
            Some(path) => Ok(self.under_root(&path)),
            None => Err(BlkplanError::new(
                UnsupportedChangeError::SubvolumeWithoutMountPoint {
                    path: graph.find_device(subvolume)?.name(),
                },
            )),
        }
    }

    fn subvolume_steps(
        &self,
        graph: &Devicegraph,
        action: &Action,
        device: &Device,
    ) -> Result<Vec<Step>, BlkplanError> {
        let subvolume = device
            .as_btrfs_subvolume()
            .structured(unexpected(action, device))?;
        let mount_path = self.btrfs_mount_path(graph, device.sid())?;
        match action.kind() {
            ActionKind::Create => Ok(vec![Step::Run(btrfs::subvolume_create(
                &mount_path,
                &subvolume.path,
            ))]),
            ActionKind::Delete => Ok(vec![Step::Run(btrfs::subvolume_delete(
                &mount_path,
                &subvolume.path,
            ))]),
            ActionKind::SetDefaultSubvolume => Ok(vec![Step::Run(
                btrfs::subvolume_set_default(&mount_path, &subvolume.path),
            )]),
            _ => Err(BlkplanError::new(unexpected(action, device))),
        }
    }

    /// Device and subvolume to pass to mount for a mount point.
    fn mount_source(
        &self,
        graph: &Devicegraph,
        device: &Device,
    ) -> Result<(String, Option<String>), BlkplanError> {
        let mountable = first_parent(graph, device)?;
        let (fs, subvolume) = match mountable.as_btrfs_subvolume() {
            Some(subvolume) => (
                graph.btrfs_of_subvolume(mountable.sid())?,
                Some(subvolume.path.clone()),
            ),
            None => (mountable.sid(), None),
        };
        let fs_device = graph.find_device(fs)?;
        let blk = first_parent(graph, fs_device)?.require_blk()?.name.clone();
        Ok((blk, subvolume))
    }

    fn mount_steps(&self, graph: &Devicegraph, device: &Device) -> Result<Vec<Step>, BlkplanError> {
        let mp = device
            .as_mount_point()
            .structured(ValidationError::WrongDeviceType {
                sid: device.sid(),
                expected: "mount-point".into(),
                found: device.device_type().to_string(),
            })?;
        let (source, subvolume) = self.mount_source(graph, device)?;
        let target = self.under_root(&mp.path);
        Ok(vec![
            Step::CreateDir(target.clone()),
            Step::Run(mount::mount(
                &source,
                &target,
                &mp.mount_options,
                subvolume.as_deref(),
            )),
        ])
    }

    fn mount_point_steps(
        &self,
        graph: &Devicegraph,
        action: &Action,
        device: &Device,
    ) -> Result<Vec<Step>, BlkplanError> {
        let mp = device
            .as_mount_point()
            .structured(unexpected(action, device))?;
        match action.kind() {
            ActionKind::Create => self.mount_steps(graph, device),
            ActionKind::Delete => Ok(vec![Step::Run(mount::umount(&self.under_root(&mp.path)))]),
            ActionKind::Remount => {
                let old = self
                    .actiongraph
                    .lhs()
                    .find_device(device.sid())?
                    .as_mount_point()
                    .structured(unexpected(action, device))?;
                if old.path == mp.path {
                    return Ok(vec![Step::Run(mount::remount(
                        &self.under_root(&mp.path),
                        &mp.mount_options,
                    ))]);
                }
                let mut steps = vec![Step::Run(mount::umount(&self.under_root(&old.path)))];
                steps.extend(self.mount_steps(graph, device)?);
                Ok(steps)
            }
            _ => Err(BlkplanError::new(unexpected(action, device))),
        }
    }
}

fn unexpected(action: &Action, device: &Device) -> LogicError {
    LogicError::Internal(format!(
        "Action '{action}' is not supported for {}",
        device.describe()
    ))
}

fn first_parent<'a>(graph: &'a Devicegraph, device: &Device) -> Result<&'a Device, BlkplanError> {
    graph
        .parents(device.sid())?
        .into_iter()
        .next()
        .structured(LogicError::Internal(format!(
            "{} has no parent",
            device.describe()
        )))
}

fn blk_name(graph: &Devicegraph, sid: Sid) -> Result<String, BlkplanError> {
    Ok(graph.find_device(sid)?.require_blk()?.name.clone())
}

/// Name of the block device a physical volume lives on.
fn pv_blk_name(graph: &Devicegraph, pv: Sid) -> Result<String, BlkplanError> {
    let pv = graph.find_device(pv)?;
    Ok(first_parent(graph, pv)?.require_blk()?.name.clone())
}

fn md_role(graph: &Devicegraph, member: Sid, md: Sid) -> Result<MdUser, BlkplanError> {
    match graph.find_holder(member, md)?.kind {
        HolderKind::MdUser(role) => Ok(role),
        _ => Err(BlkplanError::new(LogicError::Internal(format!(
            "Holder {member} -> {md} is not an md user"
        )))),
    }
}

/// Wipes the array signatures off all members.
fn wipe_members(graph: &Devicegraph, device: &Device) -> Result<Vec<Step>, BlkplanError> {
    let mut steps = Vec::new();
    for holder in graph.in_holders(device.sid())? {
        if matches!(holder.kind, HolderKind::MdUser(_)) {
            steps.push(Step::Run(wipefs::all(&blk_name(graph, holder.source())?)));
        }
    }
    Ok(steps)
}

/// Runs the planned steps, in order.
pub struct Committer<'c> {
    runner: &'c dyn CommandRunner,
    mdadm_config: &'c mut dyn MdadmConfig,
    staging: &'c Devicegraph,
    md_uuids: BTreeMap<Sid, String>,
}

impl<'c> Committer<'c> {
    pub fn new(
        runner: &'c dyn CommandRunner,
        mdadm_config: &'c mut dyn MdadmConfig,
        staging: &'c Devicegraph,
    ) -> Self {
        Self {
            runner,
            mdadm_config,
            staging,
            md_uuids: BTreeMap::new(),
        }
    }

    /// Checks that every binary the steps use is installed.
    pub fn preflight(&self, planned: &[PlannedAction]) -> Result<(), BlkplanError> {
        let needed: BTreeSet<Dependency> = planned
            .iter()
            .flat_map(|p| p.steps.iter())
            .filter_map(Step::dependency)
            .collect();
        debug!("Commit needs {needed:?}");
        for dependency in needed {
            if !self.runner.exists(dependency) {
                return Err(BlkplanError::new(CommandFailureError::MissingBinary {
                    binary: dependency.name().into(),
                }));
            }
        }
        Ok(())
    }

    fn md_uuid(&self, sid: Sid, device: &str) -> Result<String, BlkplanError> {
        let uuid = match self.md_uuids.get(&sid) {
            Some(uuid) => uuid.clone(),
            None => self
                .staging
                .find_device(sid)?
                .as_md()
                .map(|md| md.uuid.clone())
                .unwrap_or_default(),
        };
        if uuid.is_empty() {
            return Err(BlkplanError::new(CommandFailureError::QueryUuid {
                device: device.into(),
            }));
        }
        Ok(uuid)
    }

    fn run_step(&mut self, step: &Step) -> Result<(), BlkplanError> {
        trace!("Running step '{step}'");
        match step {
            Step::Run(command) => self
                .runner
                .run_and_check(command)
                .message(format!("Failed to run '{command}'")),
            Step::CreateDir(path) => fs::create_dir_all(path).structured(
                CommandFailureError::CommandFailed {
                    command: step.to_string(),
                },
            ),
            Step::QueryMdUuid { sid, name } => {
                let command = mdadm::detail_export(name);
                let output = self
                    .runner
                    .output_and_check(&command)
                    .message(format!("Failed to run '{command}'"))?;
                let detail = mdadm::parse_detail_export(&output);
                if detail.uuid.is_empty() {
                    return Err(BlkplanError::new(CommandFailureError::QueryUuid {
                        device: name.clone(),
                    }));
                }
                debug!("Array '{name}' has uuid {}", detail.uuid);
                self.md_uuids.insert(*sid, detail.uuid);
                Ok(())
            }
            Step::InitEtcMdadm => self.mdadm_config.init(),
            Step::UpdateEtcMdadm { sid, device } => {
                let uuid = self.md_uuid(*sid, device)?;
                self.mdadm_config.update_entry(&EtcMdadmEntry {
                    device: device.clone(),
                    uuid,
                })
            }
            Step::RemoveEtcMdadm { uuid } => self.mdadm_config.remove_entry(uuid),
        }
    }

    /// Runs every planned action. Stops at the first failure.
    #[tracing::instrument(skip_all)]
    pub fn run(mut self, planned: &[PlannedAction]) -> Result<CommitOutcome, CommitFailure> {
        let mut applied = Vec::new();
        if let Err(error) = self.preflight(planned) {
            return Err(CommitFailure {
                failed: None,
                applied,
                error,
            });
        }

        for planned_action in planned {
            info!("{}", planned_action.progress);
            for step in &planned_action.steps {
                let result = self
                    .run_step(step)
                    .message(format!("Failed to commit '{}'", planned_action.description));
                if let Err(error) = result {
                    return Err(CommitFailure {
                        failed: Some(planned_action.action),
                        applied,
                        error,
                    });
                }
            }
            applied.push(planned_action.action);
        }

        info!("Committed {} actions", applied.len());
        Ok(CommitOutcome {
            applied,
            md_uuids: self.md_uuids,
        })
    }
}

/// Plans and commits an actiongraph. Paths are resolved below `root`.
#[tracing::instrument(skip_all)]
pub fn commit(
    actiongraph: &Actiongraph,
    runner: &dyn CommandRunner,
    mdadm_config: &mut dyn MdadmConfig,
    root: &Path,
) -> Result<CommitOutcome, CommitFailure> {
    let planned = StepBuilder::new(actiongraph, root)
        .plan()
        .map_err(|error| CommitFailure {
            failed: None,
            applied: Vec::new(),
            error,
        })?;
    Committer::new(runner, mdadm_config, actiongraph.rhs()).run(&planned)
}
