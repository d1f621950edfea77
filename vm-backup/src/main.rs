// Standard library
use std::process;

// External crates
use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

// Internal imports
use backup_config::{BackupConfig, ConfigLoader};
use backup_engine::{CancellationFlag, RunController, EXIT_CONFIG_ERROR};
use backup_gateway::{Gateway, IncusGateway};
use backup_logging::{init_subscriber, LogSettings};

// Local modules
mod cli;

use cli::Args;

fn main() {
    let args = Args::parse();

    // Configuration decides the log level, so it is read before logging exists.
    let loaded = ConfigLoader::new(args.config.clone()).load();
    let debug = args.debug || matches!(&loaded, Ok(config) if config.debug);
    let log_guard = match init_subscriber(&LogSettings::from_env(debug)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("vm-backup: failed to initialize logging: {e}");
            None
        }
    };

    let code = match loaded.context("invalid configuration").and_then(run) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            EXIT_CONFIG_ERROR
        }
    };

    // process::exit skips destructors; flush the file writer first.
    drop(log_guard);
    process::exit(code);
}

fn run(config: BackupConfig) -> anyhow::Result<i32> {
    let cancel = CancellationFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after the current step");
        handler_flag.cancel();
    })
    .context("failed to install signal handler")?;

    let gateway = IncusGateway::from_config(&config);
    info!(
        gateway = gateway.name(),
        tool = %config.tool,
        compression = ?config.compression,
        stateful = config.stateful,
        "vm-backup starting"
    );

    let outcome = RunController::new(&config, &gateway, cancel)
        .run()
        .context("backup run aborted")?;
    Ok(outcome.exit_code())
}
