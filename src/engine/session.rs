use std::path::Path;

use log::{debug, info};

use blkplan_api::{error::BlkplanError, Actiongraph, Devicegraph};
use osutils::{dependencies::CommandRunner, etc_mdadm::MdadmConfig, system_info::SystemInfo};

use super::{
    commit::{self, CommitFailure, CommitOutcome},
    probe,
};

/// Owns the probed graph and the staging graph edited towards the desired
/// layout. Staging starts as a copy of probed.
#[derive(Debug)]
pub struct Session {
    probed: Devicegraph,
    staging: Devicegraph,
}

impl Session {
    pub fn new(probed: Devicegraph) -> Self {
        let staging = probed.clone();
        Self { probed, staging }
    }

    /// Session on a staging graph prepared elsewhere, e.g. loaded from a
    /// document. Its sids must refer to the devices of `probed`.
    pub fn with_staging(probed: Devicegraph, staging: Devicegraph) -> Self {
        Self { probed, staging }
    }

    #[tracing::instrument(skip_all)]
    pub fn probe(info: &dyn SystemInfo) -> Result<Self, BlkplanError> {
        Ok(Self::new(probe::probe(info)?))
    }

    pub fn probed(&self) -> &Devicegraph {
        &self.probed
    }

    pub fn staging(&self) -> &Devicegraph {
        &self.staging
    }

    pub fn staging_mut(&mut self) -> &mut Devicegraph {
        &mut self.staging
    }

    /// Drops all staged changes.
    pub fn reset_staging(&mut self) {
        self.staging = self.probed.clone();
    }

    /// Plans the transformation of probed into staging.
    pub fn actiongraph(&self) -> Result<Actiongraph<'_>, BlkplanError> {
        let actiongraph = Actiongraph::new(&self.probed, &self.staging)?;
        debug!("Planned {} actions", actiongraph.len());
        Ok(actiongraph)
    }

    /// Commits the staged changes. On success staging becomes the new probed
    /// graph, including the uuids mdadm assigned while committing. A failed
    /// commit leaves both graphs untouched, the system has to be probed again.
    pub fn commit(
        &mut self,
        runner: &dyn CommandRunner,
        mdadm_config: &mut dyn MdadmConfig,
        root: &Path,
    ) -> Result<CommitOutcome, CommitFailure> {
        let outcome = {
            let actiongraph = self.actiongraph().map_err(|error| CommitFailure {
                failed: None,
                applied: Vec::new(),
                error,
            })?;
            if actiongraph.is_empty() {
                info!("Nothing to commit");
                return Ok(CommitOutcome::default());
            }
            commit::commit(&actiongraph, runner, mdadm_config, root)?
        };

        for (sid, uuid) in &outcome.md_uuids {
            if let Some(md) = self
                .staging
                .find_device_mut(*sid)
                .ok()
                .and_then(|device| device.as_md_mut())
            {
                md.uuid = uuid.clone();
            }
        }
        self.staging.mark_all_probed();
        self.probed = self.staging.clone();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use blkplan_api::{
        constants::{GIB, MIB, PARTITION_ID_RAID},
        devicegraph::{
            kinds::{FsType, MdLevel, PtType},
            Region,
        },
        Sid,
    };
    use osutils::testutils::{InMemoryMdadmConfig, MockRunner};

    use super::*;

    const MD_UUID: &str = "ea381b70:20b2ab81:602edecb:cf6f2032";

    fn two_disks() -> Devicegraph {
        let mut graph = Devicegraph::new();
        for name in ["/dev/sda", "/dev/sdb"] {
            let disk = graph.create_disk(name, 100 * GIB).unwrap();
            graph
                .find_device_mut(disk)
                .unwrap()
                .as_disk_mut()
                .unwrap()
                .partition_table = Some(PtType::Gpt);
        }
        graph.mark_all_probed();
        graph
    }

    fn stage_raid(session: &mut Session) -> Sid {
        let disks: Vec<Sid> = session
            .staging()
            .devices()
            .map(|device| device.sid())
            .collect();
        let staging = session.staging_mut();
        let md = staging.create_md("/dev/md0", MdLevel::Raid1).unwrap();
        for disk in disks {
            let partition = staging
                .create_partition(disk, 1, Region::new(MIB, 10 * GIB), PARTITION_ID_RAID)
                .unwrap();
            staging.md_add_device(md, partition, false).unwrap();
        }
        staging.create_filesystem(md, FsType::Xfs).unwrap();
        md
    }

    #[test]
    fn test_unchanged_session() {
        let session = Session::new(two_disks());
        assert!(session.staging().equal(session.probed()));
        assert!(session.actiongraph().unwrap().is_empty());
    }

    #[test]
    fn test_reset_staging() {
        let mut session = Session::new(two_disks());
        stage_raid(&mut session);
        assert_eq!(session.actiongraph().unwrap().len(), 5);

        session.reset_staging();
        assert!(session.actiongraph().unwrap().is_empty());
    }

    #[test]
    fn test_commit_updates_probed() {
        let mut session = Session::new(two_disks());
        let md = stage_raid(&mut session);
        let root = TempDir::new().unwrap();
        let runner = MockRunner::new().respond(
            "mdadm --detail --export /dev/md0",
            &format!("MD_UUID={MD_UUID}\n"),
        );
        let mut mdadm_config = InMemoryMdadmConfig::default();

        let outcome = session
            .commit(&runner, &mut mdadm_config, root.path())
            .unwrap();
        assert_eq!(outcome.applied.len(), 5);

        let probed_md = session.probed().find_device(md).unwrap();
        assert!(probed_md.exists_in_probed());
        assert_eq!(probed_md.as_md().unwrap().uuid, MD_UUID);
        assert!(session.staging().equal(session.probed()));
        assert!(session.actiongraph().unwrap().is_empty());

        let outcome = session
            .commit(&runner, &mut mdadm_config, root.path())
            .unwrap();
        assert!(outcome.applied.is_empty());
    }

    #[test]
    fn test_failed_commit_keeps_graphs() {
        let mut session = Session::new(two_disks());
        stage_raid(&mut session);
        let root = TempDir::new().unwrap();
        let runner = MockRunner::new().fail("mkfs.xfs");
        let mut mdadm_config = InMemoryMdadmConfig::default();

        let failure = session
            .commit(&runner, &mut mdadm_config, root.path())
            .unwrap_err();
        assert!(failure.failed.is_some());
        assert!(failure.applied.len() >= 3);
        assert_eq!(session.probed().num_devices(), 2);
        assert_eq!(session.actiongraph().unwrap().len(), 5);
    }
}
