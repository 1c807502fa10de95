use std::{path::Path, process::ExitCode};

use anyhow::{Context, Error};
use clap::Parser;
use log::{error, info, LevelFilter};

use blkplan::{
    cli::{Cli, Commands},
    config::BlkplanConfig,
    engine::{self, PlannedAction, StepBuilder},
    BackgroundLog, MultiLogger, Session, BLKPLAN_VERSION,
};
use blkplan_api::{
    error::{BlkplanError, BlkplanResultExt, ReportError, ValidationError},
    Devicegraph,
};
use osutils::{dependencies::SystemRunner, etc_mdadm::EtcMdadm, system_info::LiveSystemInfo};

fn load_graph(path: &Path) -> Result<Devicegraph, BlkplanError> {
    Devicegraph::load(path)
        .structured(ValidationError::ParseDocument)
        .message(format!("Failed to load '{}'", path.display()))
}

fn save_or_print(graph: &Devicegraph, output: Option<&Path>) -> Result<(), BlkplanError> {
    match output {
        Some(path) => {
            graph
                .save(path)
                .structured(ValidationError::SerializeDocument)?;
            info!("Saved devicegraph to '{}'", path.display());
        }
        None => print!("{}", graph.save_to_string()?),
    }
    Ok(())
}

fn probe_system(config: &BlkplanConfig) -> Result<Devicegraph, BlkplanError> {
    let runner = SystemRunner;
    let info = LiveSystemInfo::new(&runner, config.etc_mdadm_path());
    engine::probe(&info).message("Failed to probe the system")
}

fn print_plan(planned: &[PlannedAction], with_steps: bool) {
    if planned.is_empty() {
        println!("Nothing to do");
    }
    for (i, planned_action) in planned.iter().enumerate() {
        println!("{:>3}. {}", i + 1, planned_action.description);
        if with_steps {
            for step in &planned_action.steps {
                println!("       {step}");
            }
        }
    }
}

fn run_blkplan(args: &Cli, config: &BlkplanConfig) -> Result<(), BlkplanError> {
    info!("blkplan version: {BLKPLAN_VERSION}");

    match &args.command {
        Commands::Probe { output } => {
            let graph = probe_system(config)?;
            save_or_print(&graph, output.as_deref())
        }

        Commands::Plan {
            probed,
            staging,
            dot,
        } => {
            let session = Session::with_staging(load_graph(probed)?, load_graph(staging)?);
            let actiongraph = session.actiongraph()?;
            if let Some(dot) = dot {
                std::fs::write(dot, actiongraph.to_dot())
                    .structured(ValidationError::SerializeDocument)
                    .message(format!("Failed to write '{}'", dot.display()))?;
            }
            print_plan(&StepBuilder::new(&actiongraph, &config.root).plan()?, false);
            Ok(())
        }

        Commands::Commit {
            staging,
            probed,
            dry_run,
            output,
        } => {
            let probed = match probed {
                Some(path) => load_graph(path)?,
                None => probe_system(config)?,
            };
            let mut session = Session::with_staging(probed, load_graph(staging)?);

            if *dry_run || config.dry_run {
                let actiongraph = session.actiongraph()?;
                print_plan(&StepBuilder::new(&actiongraph, &config.root).plan()?, true);
                return Ok(());
            }

            let runner = SystemRunner;
            let mut etc_mdadm = EtcMdadm::new(config.etc_mdadm_path());
            if let Err(failure) = session.commit(&runner, &mut etc_mdadm, &config.root) {
                match &failure.failed {
                    Some(action) => error!(
                        "Commit stopped at '{action}' after {} applied actions",
                        failure.applied.len()
                    ),
                    None => error!("Commit refused before applying any action"),
                }
                return Err(failure.into());
            }

            let reprobed = probe_system(config).message("Failed to probe the committed layout")?;
            info!(
                "System has {} devices after commit",
                reprobed.num_devices()
            );
            match output {
                Some(path) => save_or_print(&reprobed, Some(path)),
                None => Ok(()),
            }
        }
    }
}

fn setup_logging(args: &Cli, config: &BlkplanConfig) -> Result<(), Error> {
    // Set up the multilogger
    let mut multilogger = MultiLogger::new()
        // Add regular env_logger to output to stderr
        .with_logger(Box::new(
            env_logger::builder()
                .format_timestamp(None)
                .filter_level(args.verbosity)
                .build(),
        ));

    // Commits leave a full trace behind
    if matches!(args.command, Commands::Commit { dry_run: false, .. }) && !config.dry_run {
        multilogger.add_logger(BackgroundLog::new(&config.background_log).into_logger());
    }

    multilogger.init().context("Logger already registered")?;

    Ok(())
}

fn setup_tracing(args: &Cli) -> Result<(), Error> {
    use tracing_subscriber::{
        filter, fmt::format::FmtSpan, layer::SubscriberExt, Layer,
    };

    if args.verbosity < LevelFilter::Debug {
        return Ok(());
    }

    // Report how long probing and committing took
    let spans = tracing_subscriber::fmt::layer()
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(filter::LevelFilter::INFO);

    tracing::subscriber::set_global_default(tracing_subscriber::Registry::default().with(spans))
        .context("Failed to set global default subscriber")?;

    Ok(())
}

fn main() -> ExitCode {
    // Parse args
    let args = Cli::parse();

    let config = BlkplanConfig::load(&args.config);

    // Initialize the loggers
    let default_config = BlkplanConfig::default();
    if let Err(e) = setup_logging(&args, config.as_ref().unwrap_or(&default_config)) {
        eprintln!("Failed to initialize logging: {e:?}");
        return ExitCode::from(1);
    }

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e:?}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = setup_tracing(&args) {
        error!("Failed to initialize tracing: {e:?}");
        return ExitCode::from(1);
    }

    match run_blkplan(&args, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to execute '{}' command: {e:?}", args.command);
            ExitCode::from(2)
        }
    }
}
