// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use dd_supervisor::{Supervisor, config, load_config};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "dd-supervisord")]
#[command(about = "Starts, guards and stops the agent's long-running processes")]
#[command(version)]
struct Args {
    /// Supervisor configuration file
    #[arg(short, long, env = "DD_SUPERVISOR_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let path = args.config.unwrap_or_else(config::config_path);
    let cfg = load_config(&path)?;

    simple_logger::init_with_level(cfg.log_level())?;
    info!(
        "dd-supervisord starting (version {}, config {})",
        env!("CARGO_PKG_VERSION"),
        path.display()
    );

    let supervisor = Arc::new(Supervisor::new(cfg).context("invalid configuration")?);
    supervisor
        .start()
        .await
        .context("failed to start supervisor")?;
    supervisor
        .listen_signal()
        .await
        .context("failed to stop supervisor")?;

    info!("dd-supervisord shutting down");
    Ok(())
}
