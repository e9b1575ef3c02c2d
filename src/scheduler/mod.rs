//! Bounded, rate-limited job scheduler.
//!
//! This module provides the [`Scheduler`] which runs a batch of [`Job`]s with
//! at most `max_processes` of them running at once, while pacing dispatches
//! per source through a shared [`RateLimiter`].
//!
//! # Overview
//!
//! The scheduler is a single cooperative loop. It never runs job logic on
//! other tasks: command jobs are OS processes probed without blocking, and
//! function jobs run inline when polled. Each iteration:
//!
//! 1. launches ready local follow-ups and failure cleanups,
//! 2. dispatches the head of every source queue whose rate window is open,
//! 3. polls running jobs and routes their follow-ups,
//! 4. sleeps briefly when nothing moved.
//!
//! Failures are recorded and never abort the batch. The loop ends when every
//! queue is empty and nothing is running.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use seqdd_core::job::{CommandJob, Job};
//! use seqdd_core::scheduler::{self, RateLimiter};
//! use seqdd_core::source::SourceKind;
//!
//! # async fn example() -> Result<(), seqdd_core::scheduler::SchedulerError> {
//! let jobs = vec![
//!     Job::command("url_a", CommandJob::new("curl").args(["-s", "-o", "a.fa", "https://example.com/a.fa"]))
//!         .for_source(SourceKind::Url)
//!         .with_accessions(["https://example.com/a.fa"]),
//! ];
//! let report = scheduler::run(jobs, 4, Arc::new(RateLimiter::with_defaults())).await?;
//! println!("succeeded: {:?}, failed: {:?}", report.succeeded, report.failed);
//! # Ok(())
//! # }
//! ```

mod error;
pub mod rate_limiter;
mod report;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

pub use error::{MIN_PROCESSES, SchedulerError};
pub use rate_limiter::RateLimiter;
pub use report::{FailureRecord, JobEvent, JobEventKind, RunProgress, RunReport};

use crate::job::{FailureKind, Job, JobError, JobState, Pacing};
use crate::source::SourceKind;
use report::AccessionTracker;

/// Default number of concurrently running jobs.
pub const DEFAULT_MAX_PROCESSES: usize = 8;

/// Sleep between polls when nothing progressed.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lower bound on idle sleeps, so a zero window never spins.
const MIN_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Runs `jobs` to completion and returns the aggregate report.
///
/// # Errors
///
/// Returns [`SchedulerError`] if `max_processes` is zero or a job is
/// malformed. Job failures are reported in the [`RunReport`], never here.
pub async fn run<I>(
    jobs: I,
    max_processes: usize,
    limiter: Arc<RateLimiter>,
) -> Result<RunReport, SchedulerError>
where
    I: IntoIterator<Item = Job>,
{
    let mut scheduler = Scheduler::new(max_processes, limiter)?;
    scheduler.submit_all(jobs)?;
    Ok(scheduler.run().await)
}

/// Pending jobs of one source, in submission order.
#[derive(Debug)]
struct SourceQueue {
    source: SourceKind,
    jobs: VecDeque<Job>,
}

/// A job ready to run outside the rate limiter.
#[derive(Debug)]
struct LocalJob {
    job: Job,
    source: SourceKind,
    cleanup: bool,
}

#[derive(Debug)]
struct RunningJob {
    job: Job,
    source: SourceKind,
    paced: bool,
    cleanup: bool,
}

/// Mutable state of one run.
#[derive(Debug)]
struct RunState {
    started_at: Instant,
    local_ready: VecDeque<LocalJob>,
    running: Vec<RunningJob>,
    report: RunReport,
    stopping: bool,
    rotation: usize,
}

/// Bounded, rate-limited job runner.
#[derive(Debug)]
pub struct Scheduler {
    max_processes: usize,
    limiter: Arc<RateLimiter>,
    log_dir: Option<PathBuf>,
    stop: Option<Arc<AtomicBool>>,
    progress: Option<Arc<RunProgress>>,
    queues: Vec<SourceQueue>,
    tracker: AccessionTracker,
}

impl Scheduler {
    /// Creates a scheduler running at most `max_processes` jobs at once.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidMaxProcesses`] if `max_processes` is zero.
    #[instrument(level = "debug", skip(limiter))]
    pub fn new(max_processes: usize, limiter: Arc<RateLimiter>) -> Result<Self, SchedulerError> {
        if max_processes < MIN_PROCESSES {
            return Err(SchedulerError::InvalidMaxProcesses {
                value: max_processes,
            });
        }
        Ok(Self {
            max_processes,
            limiter,
            log_dir: None,
            stop: None,
            progress: None,
            queues: Vec::new(),
            tracker: AccessionTracker::default(),
        })
    }

    /// Writes each command job's output to `<dir>/<job name>.log`.
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Stops the run once `flag` becomes true.
    #[must_use]
    pub fn with_stop_signal(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    /// Publishes live counters to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<RunProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Returns the process limit.
    #[must_use]
    pub fn max_processes(&self) -> usize {
        self.max_processes
    }

    /// Returns the number of queued top-level jobs.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queues.iter().map(|queue| queue.jobs.len()).sum()
    }

    /// Queues a job behind the other jobs of its source.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] if the job, or a step of its chain, is not
    /// pending, has no source or accession, or has an empty command.
    pub fn submit(&mut self, job: Job) -> Result<(), SchedulerError> {
        let source = validate(&job)?;
        self.tracker.register(job.accessions());
        debug!(job = %job.name(), source = %source, "job queued");
        self.queue_mut(source).jobs.push_back(job);
        Ok(())
    }

    /// Queues every job, stopping at the first malformed one.
    ///
    /// # Errors
    ///
    /// See [`Scheduler::submit`].
    pub fn submit_all<I>(&mut self, jobs: I) -> Result<(), SchedulerError>
    where
        I: IntoIterator<Item = Job>,
    {
        jobs.into_iter().try_for_each(|job| self.submit(job))
    }

    /// Runs the loop until every job reached a terminal state.
    #[instrument(skip(self), fields(max_processes = self.max_processes, queued = self.queued()))]
    pub async fn run(mut self) -> RunReport {
        let mut state = RunState {
            started_at: Instant::now(),
            local_ready: VecDeque::new(),
            running: Vec::new(),
            report: RunReport::default(),
            stopping: false,
            rotation: 0,
        };
        info!("scheduler started");

        loop {
            if !state.stopping && self.stop_requested() {
                self.begin_stop(&mut state);
            }

            let mut progressed = self.launch_local(&mut state);
            progressed |= self.dispatch_sources(&mut state);
            progressed |= self.poll_running(&mut state);

            if state.running.is_empty() && state.local_ready.is_empty() && self.queued() == 0 {
                break;
            }
            if !progressed {
                tokio::time::sleep(self.idle_wait(&state)).await;
            }
        }

        let (succeeded, failed) = std::mem::take(&mut self.tracker).into_sets();
        let mut report = state.report;
        report.succeeded = succeeded;
        report.failed = failed;
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            peak_running = report.peak_running,
            elapsed_ms = state.started_at.elapsed().as_millis(),
            "scheduler finished"
        );
        report
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn queue_mut(&mut self, source: SourceKind) -> &mut SourceQueue {
        let index = match self.queues.iter().position(|queue| queue.source == source) {
            Some(index) => index,
            None => {
                self.queues.push(SourceQueue {
                    source,
                    jobs: VecDeque::new(),
                });
                self.queues.len() - 1
            }
        };
        &mut self.queues[index]
    }

    fn has_capacity(&self, state: &RunState) -> bool {
        state.running.len() < self.max_processes
    }

    fn launch_local(&mut self, state: &mut RunState) -> bool {
        let mut launched = false;
        while self.has_capacity(state) {
            let Some(local) = state.local_ready.pop_front() else {
                break;
            };
            self.start_job(state, local.job, local.source, false, local.cleanup);
            launched = true;
        }
        launched
    }

    fn dispatch_sources(&mut self, state: &mut RunState) -> bool {
        let count = self.queues.len();
        if count == 0 || state.stopping {
            return false;
        }
        let mut dispatched = false;
        let offset = state.rotation % count;
        state.rotation = state.rotation.wrapping_add(1);

        for step in 0..count {
            if !self.has_capacity(state) {
                break;
            }
            let index = (offset + step) % count;
            let source = self.queues[index].source;
            if self.queues[index].jobs.is_empty() || !self.limiter.is_ready(source) {
                continue;
            }
            let Some(job) = self.queues[index].jobs.pop_front() else {
                continue;
            };
            if self.start_job(state, job, source, true, false) {
                self.limiter.mark_dispatched(source);
            }
            dispatched = true;
        }
        dispatched
    }

    /// Starts a job and adds it to the running set.
    ///
    /// Returns true if the job is actually running (its launch did not fail).
    fn start_job(
        &mut self,
        state: &mut RunState,
        mut job: Job,
        source: SourceKind,
        paced: bool,
        cleanup: bool,
    ) -> bool {
        if let Some(dir) = &self.log_dir {
            job.set_log_file(dir.join(format!("{}.log", log_file_stem(job.name()))));
        }
        if let Err(error) = job.start() {
            error!(job = %job.name(), error = %error, "job could not be started");
            self.record_failure(state, &job, source, &error, cleanup);
            if !cleanup {
                self.tracker_failed(&job);
            }
            return false;
        }

        let running = job.state() == JobState::Running;
        // A process that failed to launch never used the source's window.
        let paced = paced && running;
        debug!(
            job = %job.name(),
            id = %job.id(),
            source = %source,
            paced,
            accessions = ?job.accessions(),
            "job dispatched"
        );
        state.report.events.push(JobEvent {
            job: job.id(),
            name: job.name().to_string(),
            source,
            kind: JobEventKind::Started,
            paced,
            at: state.started_at.elapsed(),
        });
        if let Some(progress) = &self.progress {
            progress.record_started();
        }
        state.running.push(RunningJob {
            job,
            source,
            paced,
            cleanup,
        });
        state.report.peak_running = state.report.peak_running.max(state.running.len());
        running
    }

    fn poll_running(&mut self, state: &mut RunState) -> bool {
        let mut progressed = false;
        let mut index = 0;
        while index < state.running.len() {
            let finished = match state.running[index].job.is_finished() {
                Ok(finished) => finished,
                Err(error) => {
                    error!(job = %state.running[index].job.name(), error = %error, "job poll failed");
                    true
                }
            };
            if finished {
                let entry = state.running.remove(index);
                self.handle_finished(state, entry);
                progressed = true;
            } else {
                index += 1;
            }
        }
        progressed
    }

    fn handle_finished(&mut self, state: &mut RunState, entry: RunningJob) {
        let RunningJob {
            mut job,
            source,
            paced,
            cleanup,
        } = entry;
        let success = job.state() == JobState::Done;
        state.report.events.push(JobEvent {
            job: job.id(),
            name: job.name().to_string(),
            source,
            kind: JobEventKind::Finished,
            paced,
            at: state.started_at.elapsed(),
        });
        if let Some(progress) = &self.progress {
            progress.record_finished(success);
        }

        if !success {
            let error = job
                .outcome()
                .and_then(|outcome| outcome.error())
                .map_or_else(|| "job failed without outcome".to_string(), ToString::to_string);
            let kind = job
                .outcome()
                .and_then(|outcome| outcome.error())
                .map_or(FailureKind::Function, JobError::kind);
            warn!(
                job = %job.name(),
                source = %source,
                kind = %kind,
                accessions = ?job.accessions(),
                error = %error,
                "job failed"
            );
            state.report.failures.push(FailureRecord {
                source,
                accessions: job.accessions().to_vec(),
                job: job.name().to_string(),
                kind,
                message: error,
                cleanup,
            });
            if cleanup {
                return;
            }
            self.tracker_failed(&job);
            if let Some(cleanup_job) = job.take_cleanup() {
                debug!(job = %cleanup_job.name(), "queueing failure cleanup");
                state.local_ready.push_back(LocalJob {
                    job: cleanup_job,
                    source,
                    cleanup: true,
                });
            }
            return;
        }

        if cleanup {
            debug!(job = %job.name(), "failure cleanup done");
            return;
        }

        match job.take_follow_up() {
            Some(follow_up) if state.stopping => {
                let next = *follow_up.job;
                self.record_cancelled(state, &next, source);
            }
            Some(follow_up) => {
                let next = *follow_up.job;
                debug!(job = %next.name(), after = %job.name(), pacing = ?follow_up.pacing, "follow-up ready");
                match follow_up.pacing {
                    Pacing::Local => state.local_ready.push_back(LocalJob {
                        job: next,
                        source,
                        cleanup: false,
                    }),
                    Pacing::Source => self.queue_mut(source).jobs.push_front(next),
                }
            }
            None => {
                info!(job = %job.name(), source = %source, accessions = ?job.accessions(), "job chain complete");
                self.tracker.chain_succeeded(job.accessions());
            }
        }
    }

    fn begin_stop(&mut self, state: &mut RunState) {
        warn!(running = state.running.len(), queued = self.queued(), "stop requested, cancelling jobs");
        state.stopping = true;
        for entry in &mut state.running {
            entry.job.stop();
        }

        let mut queued = Vec::new();
        for queue in &mut self.queues {
            let source = queue.source;
            queued.extend(queue.jobs.drain(..).map(|job| (source, job)));
        }
        for (source, job) in queued {
            self.record_cancelled(state, &job, source);
        }

        let local: Vec<LocalJob> = state.local_ready.drain(..).collect();
        for entry in local {
            if entry.cleanup {
                state.local_ready.push_back(entry);
            } else {
                self.record_cancelled(state, &entry.job, entry.source);
            }
        }
    }

    fn record_cancelled(&mut self, state: &mut RunState, job: &Job, source: SourceKind) {
        self.record_failure(state, job, source, &JobError::Cancelled, false);
        self.tracker_failed(job);
    }

    fn record_failure(
        &self,
        state: &mut RunState,
        job: &Job,
        source: SourceKind,
        error: &JobError,
        cleanup: bool,
    ) {
        state.report.failures.push(FailureRecord {
            source,
            accessions: job.accessions().to_vec(),
            job: job.name().to_string(),
            kind: error.kind(),
            message: error.to_string(),
            cleanup,
        });
    }

    fn tracker_failed(&mut self, job: &Job) {
        self.tracker.chain_failed(job.accessions());
    }

    /// How long to sleep when nothing progressed.
    fn idle_wait(&self, state: &RunState) -> Duration {
        let window = if self.has_capacity(state) && !state.stopping {
            self.limiter.next_window(
                self.queues
                    .iter()
                    .filter(|queue| !queue.jobs.is_empty())
                    .map(|queue| queue.source),
            )
        } else {
            None
        };
        let wait = match window {
            Some(window) if state.running.is_empty() => window,
            Some(window) => window.min(IDLE_POLL_INTERVAL),
            None => IDLE_POLL_INTERVAL,
        };
        wait.max(MIN_IDLE_SLEEP)
    }
}

/// Checks a job chain before it is queued and returns its source.
fn validate(job: &Job) -> Result<SourceKind, SchedulerError> {
    let source = job.source().ok_or_else(|| SchedulerError::MissingSource {
        job: job.name().to_string(),
    })?;
    if job.accessions().is_empty() {
        return Err(SchedulerError::MissingAccessions {
            job: job.name().to_string(),
        });
    }
    for step in job.chain() {
        if step.state() != JobState::Pending {
            return Err(SchedulerError::NotPending {
                job: step.name().to_string(),
                state: step.state(),
            });
        }
        if step
            .command_spec()
            .is_some_and(|command| command.program().trim().is_empty())
        {
            return Err(SchedulerError::EmptyCommand {
                job: step.name().to_string(),
            });
        }
    }
    Ok(source)
}

/// Makes a job name safe to use as a file name.
fn log_file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() { "job".to_string() } else { stem }
}
