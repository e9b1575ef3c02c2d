//! Downloads everything a register lists.
//!
//! [`DownloadManager`] ties the other modules together: it locks the
//! temporary workspace, asks every source builder for job chains, hands them
//! to the [`Scheduler`] and returns its [`RunReport`].

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, instrument, warn};

use crate::job::FailureKind;
use crate::register::Register;
use crate::scheduler::{
    DEFAULT_MAX_PROCESSES, FailureRecord, RateLimiter, RunProgress, RunReport, Scheduler,
    SchedulerError,
};
use crate::source::{
    BuildContext, DEFAULT_BIN_DIR, Endpoints, SourceError, SourceKind, Toolbox, builder_for,
    install_tools,
};
use crate::workspace::{TmpWorkspace, WorkspaceError};

/// Default directory receiving downloads.
pub const DEFAULT_OUTPUT_DIR: &str = "data";

/// Default temporary workspace.
pub const DEFAULT_TMP_DIR: &str = "tmp";

/// Default directory for per-job logs.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Error type for download orchestration.
///
/// Per-accession problems never surface here; they end up in the
/// [`RunReport`].
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The temporary workspace could not be prepared.
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    /// The shared build context could not be created.
    #[error("source setup error: {0}")]
    Source(#[from] SourceError),

    /// The scheduler rejected its settings or a job.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// The output or log directory could not be prepared.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Directories and limits of one download run.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Where finished downloads are placed.
    pub output_dir: PathBuf,
    /// Temporary workspace, locked for the duration of the run.
    pub tmp_dir: PathBuf,
    /// Per-job logs; emptied at the start of each run.
    pub log_dir: PathBuf,
    /// Maximum number of simultaneously running jobs.
    pub max_processes: usize,
    /// Remote service base URLs.
    pub endpoints: Endpoints,
    /// Local bin directory searched after `PATH`.
    pub bin_dir: PathBuf,
    /// Installs missing NCBI and SRA tools into `bin_dir` before giving up
    /// on a source.
    pub install_tools: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            tmp_dir: PathBuf::from(DEFAULT_TMP_DIR),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            max_processes: DEFAULT_MAX_PROCESSES,
            endpoints: Endpoints::default(),
            bin_dir: PathBuf::from(DEFAULT_BIN_DIR),
            install_tools: true,
        }
    }
}

/// Runs the downloads of a register.
#[derive(Debug, Clone)]
pub struct DownloadManager {
    limiter: Arc<RateLimiter>,
    progress: Option<Arc<RunProgress>>,
}

impl Default for DownloadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadManager {
    /// Creates a manager pacing every source at its default delay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            limiter: Arc::new(RateLimiter::with_defaults()),
            progress: None,
        }
    }

    /// Uses `limiter` instead of the default pacing.
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Publishes live job counters to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<RunProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Downloads every accession of `register` into `options.output_dir`.
    ///
    /// Sources whose tools are missing (and cannot be installed), or whose
    /// builder fails, are skipped and their accessions reported as failed.
    /// Accessions already present in the output directory are reported as
    /// succeeded. A stop requested while sources are being prepared reports
    /// the unprepared accessions as cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] if the workspace is locked by another run,
    /// a directory cannot be created, or the scheduler settings are invalid.
    #[instrument(skip_all, fields(output = %options.output_dir.display(), accessions = register.len()))]
    pub async fn download(
        &self,
        register: &Register,
        options: &DownloadOptions,
        stop: Arc<AtomicBool>,
    ) -> Result<RunReport, DownloadError> {
        let workspace = TmpWorkspace::prepare(&options.tmp_dir)?;
        fs::create_dir_all(&options.output_dir).map_err(|e| io_error(&options.output_dir, e))?;
        reset_dir(&options.log_dir)?;

        let ctx = BuildContext::new(
            workspace.path(),
            &options.output_dir,
            Arc::clone(&self.limiter),
        )?
        .with_endpoints(options.endpoints.clone())
        .with_tools(Toolbox::with_bin_dir(&options.bin_dir));

        let mut scheduler = Scheduler::new(options.max_processes, Arc::clone(&self.limiter))?
            .with_log_dir(&options.log_dir)
            .with_stop_signal(Arc::clone(&stop));
        if let Some(progress) = &self.progress {
            scheduler = scheduler.with_progress(Arc::clone(progress));
        }

        let sources: Vec<(SourceKind, &[String])> = register.iter().collect();
        let mut unavailable = Vec::new();
        let mut present = Vec::new();
        for (index, &(kind, accessions)) in sources.iter().enumerate() {
            if stop.load(Ordering::SeqCst) {
                warn!(
                    sources = sources.len() - index,
                    "stop requested, not preparing remaining sources"
                );
                unavailable.extend(sources[index..].iter().map(|&(kind, accessions)| {
                    prepare_failure(
                        kind,
                        accessions,
                        FailureKind::Cancelled,
                        "stopped before the source was prepared".to_string(),
                    )
                }));
                break;
            }
            let builder = builder_for(kind);
            let mut missing = ctx.tools.missing(builder.as_ref());
            if !missing.is_empty() && options.install_tools {
                match install_tools(kind, &ctx).await {
                    Ok(()) => missing = ctx.tools.missing(builder.as_ref()),
                    Err(SourceError::Install { message, .. }) => {
                        info!(source = %kind, reason = %message, "tools not installed");
                    }
                    Err(e) => warn!(source = %kind, error = %e, "tool installation failed"),
                }
            }
            if !missing.is_empty() {
                warn!(
                    source = %kind,
                    tools = %missing.join(", "),
                    skipped = accessions.len(),
                    "required tools not found, skipping source"
                );
                unavailable.push(prepare_failure(
                    kind,
                    accessions,
                    FailureKind::SourceUnavailable,
                    format!("missing tools: {}", missing.join(", ")),
                ));
                continue;
            }

            match builder.jobs_for(accessions, &ctx).await {
                Ok(jobs) => {
                    let served: HashSet<&str> = jobs
                        .iter()
                        .flat_map(|job| job.accessions())
                        .map(String::as_str)
                        .collect();
                    let already: Vec<String> = accessions
                        .iter()
                        .filter(|acc| !served.contains(acc.as_str()))
                        .cloned()
                        .collect();
                    info!(
                        source = %kind,
                        jobs = jobs.len(),
                        already_present = already.len(),
                        "source prepared"
                    );
                    present.extend(already);
                    scheduler.submit_all(jobs)?;
                }
                Err(e) => {
                    error!(source = %kind, error = %e, "failed to prepare source");
                    unavailable.push(prepare_failure(
                        kind,
                        accessions,
                        FailureKind::SourceUnavailable,
                        e.to_string(),
                    ));
                }
            }
        }

        let mut report = scheduler.run().await;
        for record in unavailable {
            report.failed.extend(record.accessions.iter().cloned());
            report.failures.push(record);
        }
        report
            .succeeded
            .extend(present.into_iter().filter(|acc| !report.failed.contains(acc)));
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "download finished"
        );
        drop(workspace);
        Ok(report)
    }
}

fn prepare_failure(
    source: SourceKind,
    accessions: &[String],
    kind: FailureKind,
    message: String,
) -> FailureRecord {
    FailureRecord {
        source,
        accessions: accessions.to_vec(),
        job: format!("{source}_prepare"),
        kind,
        message,
        cleanup: false,
    }
}

fn reset_dir(dir: &Path) -> Result<(), DownloadError> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|e| io_error(dir, e))?;
    }
    fs::create_dir_all(dir).map_err(|e| io_error(dir, e))
}

fn io_error(path: &Path, source: std::io::Error) -> DownloadError {
    DownloadError::Io {
        path: path.to_path_buf(),
        source,
    }
}
