use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::debug;
use serde::{Deserialize, Serialize};

use blkplan_api::error::{BlkplanError, ReportError, ValidationError};
use osutils::etc_mdadm::ETC_MDADM_CONF_PATH;

/// Default location of the configuration file.
pub const CONFIG_PATH: &str = "/etc/blkplan/blkplan.yaml";

/// Default location of the background log.
pub const BACKGROUND_LOG_PATH: &str = "/var/log/blkplan.log";

/// Definition of blkplan's configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct BlkplanConfig {
    /// Root of the system being configured. Mount points and the mdadm
    /// configuration are resolved below it. Default is `/`.
    pub root: PathBuf,

    /// The mdadm configuration file to maintain. Default is
    /// `<root>/etc/mdadm.conf`.
    pub etc_mdadm: Option<PathBuf>,

    /// File receiving every log record as JSON lines.
    pub background_log: PathBuf,

    /// Only print what a commit would do.
    pub dry_run: bool,
}

impl Default for BlkplanConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            etc_mdadm: None,
            background_log: PathBuf::from(BACKGROUND_LOG_PATH),
            dry_run: false,
        }
    }
}

impl BlkplanConfig {
    /// Reads the configuration. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BlkplanError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No configuration at '{}', using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).structured(ValidationError::ReadConfig {
                    path: path.display().to_string(),
                })
            }
        };

        serde_yaml::from_str(&contents).structured(ValidationError::ParseConfig {
            path: path.display().to_string(),
        })
    }

    pub fn etc_mdadm_path(&self) -> PathBuf {
        self.etc_mdadm
            .clone()
            .unwrap_or_else(|| self.root.join(ETC_MDADM_CONF_PATH))
    }
}
