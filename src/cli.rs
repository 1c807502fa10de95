use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::{config::CONFIG_PATH, BLKPLAN_VERSION};

#[derive(Parser, Debug)]
#[clap(version = BLKPLAN_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    /// Path to the configuration file
    #[arg(global = true, short, long, default_value = CONFIG_PATH)]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Detect the current storage layout
    Probe {
        /// Path to save the probed devicegraph, printed when omitted
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the actions turning one devicegraph into another
    Plan {
        /// Devicegraph of the current layout
        #[clap(long)]
        probed: PathBuf,

        /// Devicegraph of the desired layout
        #[clap(long)]
        staging: PathBuf,

        /// Path to save the actiongraph in Graphviz format
        #[clap(long)]
        dot: Option<PathBuf>,
    },

    /// Apply a desired layout to the system
    Commit {
        /// Devicegraph of the desired layout
        #[clap(long)]
        staging: PathBuf,

        /// Devicegraph the desired layout was derived from. The system is
        /// probed when omitted.
        #[clap(long)]
        probed: Option<PathBuf>,

        /// Only print the commands that would run
        #[clap(long)]
        dry_run: bool,

        /// Path to save the devicegraph probed after committing
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Probe { .. } => "probe",
            Commands::Plan { .. } => "plan",
            Commands::Commit { .. } => "commit",
        }
    }
}

impl Display for Commands {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commit() {
        let cli = Cli::parse_from([
            "blkplan",
            "commit",
            "--staging",
            "staging.yaml",
            "--dry-run",
            "-v",
            "debug",
        ]);
        assert_eq!(cli.verbosity, LevelFilter::Debug);
        assert_eq!(cli.config, PathBuf::from(CONFIG_PATH));
        match cli.command {
            Commands::Commit {
                staging,
                probed,
                dry_run,
                output,
            } => {
                assert_eq!(staging, PathBuf::from("staging.yaml"));
                assert!(probed.is_none());
                assert!(dry_run);
                assert!(output.is_none());
            }
            command => panic!("unexpected command {command}"),
        }
    }

    #[test]
    fn test_parse_plan() {
        let cli = Cli::parse_from([
            "blkplan",
            "--config",
            "/tmp/blkplan.yaml",
            "plan",
            "--probed",
            "probed.yaml",
            "--staging",
            "staging.yaml",
        ]);
        assert_eq!(cli.config, PathBuf::from("/tmp/blkplan.yaml"));
        assert_eq!(cli.command.to_string(), "plan");
        assert!(Cli::try_parse_from(["blkplan", "plan", "--probed", "probed.yaml"]).is_err());
    }
}
