//! Subcommand handlers.
//!
//! Each handler returns the process exit outcome. Human-readable results go
//! to stdout; diagnostics go through `tracing` to stderr.

use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use seqdd_core::downloader::{
    DEFAULT_LOG_DIR, DEFAULT_OUTPUT_DIR, DEFAULT_TMP_DIR, DownloadManager, DownloadOptions,
};
use seqdd_core::register::Register;
use seqdd_core::scheduler::{DEFAULT_MAX_PROCESSES, RateLimiter, RunProgress, RunReport};
use seqdd_core::source::{BuildContext, DEFAULT_BIN_DIR, SourceKind, Toolbox, builder_for};
use tracing::{info, warn};

use crate::app_config::FileConfig;
use crate::cli::{AddArgs, DownloadArgs};
use crate::exit::{ProcessExit, determine_exit_outcome};
use crate::progress::{ProgressUi, should_use_spinner};

pub(crate) fn run_init(register_dir: &Path, force: bool) -> Result<ProcessExit> {
    Register::init(register_dir, force)?;
    println!("Initialised register at {}", register_dir.display());
    Ok(ProcessExit::Success)
}

pub(crate) async fn run_add(
    register_dir: &Path,
    args: &AddArgs,
    config: &FileConfig,
) -> Result<ProcessExit> {
    let mut register = Register::open(register_dir)?;
    let mut candidates = args.accessions.clone();
    if let Some(file) = &args.file {
        let content = fs::read_to_string(file)
            .with_context(|| format!("Failed to read accession file '{}'", file.display()))?;
        candidates.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }
    if candidates.is_empty() {
        bail!("No accessions given: use -a ACC... or -f FILE");
    }

    let builder = builder_for(args.source);
    let (valid, mut invalid) = builder.partition_valid(&candidates);
    let mut unknown = Vec::new();
    let accepted = if args.offline || valid.is_empty() {
        valid
    } else {
        let ctx = lookup_context(config)?;
        let check = builder.confirm_remote(&valid, &ctx).await;
        if !check.unchecked.is_empty() {
            warn!(
                source = %args.source,
                accessions = %check.unchecked.join(", "),
                "could not check accessions online, registering them anyway"
            );
        }
        unknown = check.unknown.clone();
        check.accepted()
    };

    let outcome = register.add(args.source, &accepted);
    register.save()?;
    invalid.extend(outcome.invalid.iter().cloned());

    println!(
        "{}: {} added, {} already registered",
        args.source,
        outcome.added.len(),
        outcome.duplicates.len()
    );
    if !invalid.is_empty() {
        println!("{}: {} rejected (invalid format): {}", args.source, invalid.len(), invalid.join(", "));
    }
    if !unknown.is_empty() {
        println!("{}: {} rejected (not found online): {}", args.source, unknown.len(), unknown.join(", "));
    }
    Ok(determine_exit_outcome(
        outcome.added.len() + outcome.duplicates.len(),
        invalid.len() + unknown.len(),
    ))
}

/// Context for online accession lookups; nothing is written to its directories.
fn lookup_context(config: &FileConfig) -> Result<BuildContext> {
    let bin_dir = config
        .bin_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BIN_DIR));
    let ctx = BuildContext::new(
        DEFAULT_TMP_DIR,
        DEFAULT_OUTPUT_DIR,
        Arc::new(RateLimiter::with_defaults()),
    )
    .context("Failed to prepare online accession lookup")?;
    Ok(ctx.with_tools(Toolbox::with_bin_dir(bin_dir)))
}

pub(crate) fn run_remove(
    register_dir: &Path,
    source: SourceKind,
    accessions: &[String],
) -> Result<ProcessExit> {
    let mut register = Register::open(register_dir)?;
    let outcome = register.remove(source, accessions);
    register.save()?;
    println!("{source}: {} removed", outcome.removed.len());
    if !outcome.missing.is_empty() {
        println!("{source}: not registered: {}", outcome.missing.join(", "));
    }
    Ok(ProcessExit::Success)
}

pub(crate) fn run_list(
    register_dir: &Path,
    source: Option<SourceKind>,
    filters: &[String],
) -> Result<ProcessExit> {
    let register = Register::open(register_dir)?;
    match source {
        Some(kind) if !filters.is_empty() => {
            for accession in register.filter(kind, filters)? {
                println!("{accession}");
            }
        }
        Some(kind) => {
            for accession in register.list(kind) {
                println!("{accession}");
            }
        }
        None => {
            for (kind, accessions) in register.iter() {
                for accession in accessions {
                    println!("{kind}\t{accession}");
                }
            }
        }
    }
    Ok(ProcessExit::Success)
}

pub(crate) fn run_export(register_dir: &Path, file: &Path) -> Result<ProcessExit> {
    let register = Register::open(register_dir)?;
    register.export(file)?;
    println!("Exported {} accessions to {}", register.len(), file.display());
    Ok(ProcessExit::Success)
}

pub(crate) fn run_import(register_dir: &Path, file: &Path) -> Result<ProcessExit> {
    let mut register = Register::open(register_dir)?;
    let added = register.import(file)?;
    register.save()?;
    println!("Imported {added} new accessions from {}", file.display());
    Ok(ProcessExit::Success)
}

/// Options of a download, after applying config file and built-in defaults.
#[derive(Debug)]
pub(crate) struct ResolvedDownload {
    pub options: DownloadOptions,
    pub json_report: Option<PathBuf>,
}

pub(crate) fn resolve_download(args: &DownloadArgs, file: &FileConfig) -> ResolvedDownload {
    let pick = |cli: &Option<PathBuf>, cfg: &Option<PathBuf>, default: &str| {
        cli.clone()
            .or_else(|| cfg.clone())
            .unwrap_or_else(|| PathBuf::from(default))
    };
    ResolvedDownload {
        options: DownloadOptions {
            output_dir: pick(&args.output, &file.output_dir, DEFAULT_OUTPUT_DIR),
            tmp_dir: pick(&args.tmp_dir, &file.tmp_dir, DEFAULT_TMP_DIR),
            log_dir: pick(&args.log_dir, &file.log_dir, DEFAULT_LOG_DIR),
            bin_dir: pick(&args.bin_dir, &file.bin_dir, DEFAULT_BIN_DIR),
            install_tools: !args.no_install,
            max_processes: args
                .max_processes
                .map(usize::from)
                .or(file.max_processes)
                .unwrap_or(DEFAULT_MAX_PROCESSES),
            ..DownloadOptions::default()
        },
        json_report: args.json_report.clone(),
    }
}

pub(crate) async fn run_download(
    register_dir: &Path,
    args: &DownloadArgs,
    file: &FileConfig,
    quiet: bool,
) -> Result<ProcessExit> {
    let register = Register::open(register_dir)?;
    if register.is_empty() {
        println!("Register is empty, nothing to download");
        return Ok(ProcessExit::Success);
    }
    let resolved = resolve_download(args, file);
    info!(
        accessions = register.len(),
        output = %resolved.options.output_dir.display(),
        max_processes = resolved.options.max_processes,
        "starting download"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let interrupt = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping running jobs");
            interrupt.store(true, Ordering::SeqCst);
        }
    });

    let progress = Arc::new(RunProgress::new());
    let ui = ProgressUi::spawn(
        should_use_spinner(std::io::stderr().is_terminal(), quiet),
        Arc::clone(&progress),
    );
    let result = DownloadManager::new()
        .with_progress(progress)
        .download(&register, &resolved.options, Arc::clone(&stop))
        .await;
    ui.finish().await;
    let report = result?;

    print_summary(&report, &resolved.options.log_dir);
    if let Some(path) = &resolved.json_report {
        write_json_report(&report, path)?;
    }

    if stop.load(Ordering::SeqCst) {
        warn!("download interrupted");
        return Ok(ProcessExit::Failure);
    }
    Ok(determine_exit_outcome(report.succeeded.len(), report.failed.len()))
}

fn print_summary(report: &RunReport, log_dir: &Path) {
    println!(
        "Download finished: {} succeeded, {} failed",
        report.succeeded.len(),
        report.failed.len()
    );
    for (source, kinds) in report.failures_by_source() {
        for (kind, accessions) in kinds {
            let list: Vec<&str> = accessions.iter().map(String::as_str).collect();
            println!("  {source} [{kind}]: {}", list.join(", "));
        }
    }
    if !report.is_success() {
        println!("Job logs are in {}", log_dir.display());
    }
}

fn write_json_report(report: &RunReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write report to '{}'", path.display()))?;
    info!(path = %path.display(), "run report written");
    Ok(())
}
