//! CLI entry point for seqdd.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use seqdd_core::register::DEFAULT_REGISTER_DIR;
use tracing::debug;

mod app_config;
mod cli;
mod commands;
mod exit;
mod progress;

use app_config::{VerbositySetting, load_default_file_config};
use cli::{Args, Command};
use exit::ProcessExit;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(exit) => exit.into(),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ProcessExit::Failure.into()
        }
    }
}

async fn run() -> Result<ProcessExit> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let loaded = load_default_file_config()?;
    let file_config = loaded.file();

    // Priority: RUST_LOG env var > -q/-v flags > config verbosity > info
    let config_verbosity = file_config.verbosity.unwrap_or(VerbositySetting::Default);
    let quiet = args.quiet || (args.verbose == 0 && config_verbosity == VerbositySetting::Quiet);
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => config_verbosity.default_level(),
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    debug!(?args, "CLI arguments parsed");
    if loaded.config.is_some() {
        debug!(path = ?loaded.path, verbosity = config_verbosity.as_str(), "configuration file loaded");
    }

    let register_dir = args
        .register_location
        .clone()
        .or_else(|| file_config.register_location.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTER_DIR));

    match &args.command {
        Command::Init { force } => commands::run_init(&register_dir, *force),
        Command::Add(add) => commands::run_add(&register_dir, add, &file_config).await,
        Command::Remove { source, accessions } => {
            commands::run_remove(&register_dir, *source, accessions)
        }
        Command::List { source, filters } => commands::run_list(&register_dir, *source, filters),
        Command::Export { file } => commands::run_export(&register_dir, file),
        Command::Import { file } => commands::run_import(&register_dir, file),
        Command::Download(download) => {
            commands::run_download(&register_dir, download, &file_config, quiet).await
        }
    }
}
