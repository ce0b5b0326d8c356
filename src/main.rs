// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

// Main entry point for the heating-control daemon

use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use tokio::signal;

use heatbridge::config::Config;
use heatbridge::daemon::Daemon;

/// Industrial heating-control daemon: MQTT telemetry in, Modbus TCP out
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file (YAML format)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override: enable or disable the Modbus slave
    #[arg(long)]
    modbus_enabled: Option<bool>,

    /// Override: Modbus bind address
    #[arg(long)]
    modbus_address: Option<String>,

    /// Override: Modbus TCP port
    #[arg(long)]
    modbus_port: Option<u16>,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Disable all logging output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        log::LevelFilter::Off
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let mut config = Config::from_file(&args.config)?;
    config.apply_args(args.modbus_enabled, args.modbus_address, args.modbus_port);

    info!("starting heatbridge daemon");
    let mut daemon = Daemon::new();
    daemon.launch(config).await?;

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("received shutdown signal, terminating daemon");
            daemon.shutdown();
            daemon.join().await?;
        }
        Err(err) => {
            eprintln!("error waiting for shutdown signal: {err}");
        }
    }

    Ok(())
}
