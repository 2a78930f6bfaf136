mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, warn};
use migra_core::prelude::*;
use migra_pg::PgMigrationStore;
use sqlx::postgres::PgPoolOptions;
use std::io;
use std::process::ExitCode;
use std::time::Duration;

use crate::cli::{Cli, Command};

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<bool> {
    let mut out = io::stdout().lock();

    if let Command::Create { name } = &cli.command {
        commands::create(&cli.dir, name.as_deref(), chrono::Utc::now(), &mut out)?;
        return Ok(true);
    }

    let url = cli
        .database_url
        .as_deref()
        .context("no database configured, set DATABASE_URL or pass --database-url")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(url)
        .await
        .context("could not connect to the database")?;
    let coordinator = Coordinator::with_config(PgMigrationStore::new(pool), cli.coordinator_config());
    let state = coordinator.prepare().await?;
    debug!("Ledger {:?}", state);

    let (handle, cancel) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the wait for the next turn");
            handle.cancel();
        }
    });

    match cli.command {
        Command::Create { .. } => Ok(true),
        Command::Up { policy } => {
            commands::up(&coordinator, &cli.dir, policy.into(), cancel, &mut out).await
        }
        Command::Down => commands::down(&coordinator, &mut out).await,
        Command::Redo => commands::redo(&coordinator, &cli.dir, cancel, &mut out).await,
        Command::Status { format } => commands::status(&coordinator, format, &mut out).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
