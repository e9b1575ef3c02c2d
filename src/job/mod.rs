//! Schedulable units of work.
//!
//! A [`Job`] is either an external process ([`CommandJob`]) or an in-process
//! callable ([`FunctionJob`]). Both variants share one lifecycle, enforced in
//! this module and nowhere else:
//!
//! ```text
//! Pending --start()--> Running --is_finished()/join()--> Done | Failed
//! ```
//!
//! Terminal states are final. Jobs can be chained: a follow-up runs only when
//! its predecessor is `Done`, and a cleanup job runs when a step of the chain
//! fails.
//!
//! # Example
//!
//! ```no_run
//! use seqdd_core::job::{CommandJob, Job};
//! use seqdd_core::source::SourceKind;
//!
//! # async fn example() -> Result<(), seqdd_core::job::JobError> {
//! let mut job = Job::command("logan_SRR000001_download", CommandJob::new("curl").arg("-s"))
//!     .for_source(SourceKind::Logan)
//!     .with_accessions(["SRR000001"]);
//! job.start()?;
//! while !job.is_finished()? {
//!     tokio::time::sleep(std::time::Duration::from_millis(20)).await;
//! }
//! # Ok(())
//! # }
//! ```

mod command;
mod error;
mod function;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::debug;

pub use command::{CommandJob, MAX_DIAGNOSTIC_BYTES, OutputTarget};
pub use error::{ExitDetail, FailureKind, JobError};
pub use function::FunctionJob;

use crate::source::SourceKind;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric id.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobState {
    /// Returns true for `Done` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns the stable label for display output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of a job.
#[derive(Debug)]
pub enum JobOutcome {
    /// The job completed. Command jobs carry their exit code.
    Succeeded {
        /// Process exit code, `None` for function jobs.
        exit_code: Option<i32>,
    },
    /// The job failed; the error carries the diagnostic payload.
    Failed(JobError),
}

impl JobOutcome {
    /// Returns true for [`JobOutcome::Succeeded`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Returns the failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<&JobError> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed(error) => Some(error),
        }
    }
}

/// How a follow-up is dispatched once its predecessor is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Runs as local post-processing, bypassing the rate limiter.
    Local,
    /// Re-enters the front of its source queue and waits for the rate window.
    Source,
}

/// A job waiting on its predecessor.
#[derive(Debug)]
pub struct FollowUp {
    /// Dispatch policy.
    pub pacing: Pacing,
    /// The follow-up itself.
    pub job: Box<Job>,
}

#[derive(Debug)]
enum JobTask {
    Command(CommandJob),
    Function(FunctionJob),
}

/// A schedulable unit of work.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    name: String,
    source: Option<SourceKind>,
    accessions: Vec<String>,
    state: JobState,
    task: JobTask,
    outcome: Option<JobOutcome>,
    follow_up: Option<FollowUp>,
    cleanup: Option<Box<Job>>,
}

impl Job {
    /// Creates a pending job backed by an external process.
    pub fn command(name: impl Into<String>, command: CommandJob) -> Self {
        Self::with_task(name.into(), JobTask::Command(command))
    }

    /// Creates a pending job backed by an in-process callable.
    pub fn function<F>(name: impl Into<String>, func: F) -> Self
    where
        F: FnOnce() -> Result<(), JobError> + Send + 'static,
    {
        Self::with_task(name.into(), JobTask::Function(FunctionJob::new(func)))
    }

    /// Creates a pending job from a prepared [`FunctionJob`].
    pub fn from_function(name: impl Into<String>, function: FunctionJob) -> Self {
        Self::with_task(name.into(), JobTask::Function(function))
    }

    fn with_task(name: String, task: JobTask) -> Self {
        Self {
            id: JobId::next(),
            name,
            source: None,
            accessions: Vec::new(),
            state: JobState::Pending,
            task,
            outcome: None,
            follow_up: None,
            cleanup: None,
        }
    }

    /// Tags the job with the source it is rate limited against.
    #[must_use]
    pub fn for_source(mut self, source: SourceKind) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets the accessions this job serves.
    #[must_use]
    pub fn with_accessions<I, S>(mut self, accessions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accessions = accessions.into_iter().map(Into::into).collect();
        self
    }

    /// Appends a local follow-up at the end of the chain.
    #[must_use]
    pub fn then(self, next: Job) -> Self {
        self.append(Pacing::Local, next)
    }

    /// Appends a follow-up that must wait for its source's rate window.
    #[must_use]
    pub fn then_paced(self, next: Job) -> Self {
        self.append(Pacing::Source, next)
    }

    fn append(mut self, pacing: Pacing, next: Job) -> Self {
        self.append_tail(FollowUp {
            pacing,
            job: Box::new(next),
        });
        self
    }

    fn append_tail(&mut self, follow_up: FollowUp) {
        match &mut self.follow_up {
            Some(existing) => existing.job.append_tail(follow_up),
            None => self.follow_up = Some(follow_up),
        }
    }

    /// Attaches a cleanup job that runs if this step or a later step fails.
    #[must_use]
    pub fn on_failure(mut self, cleanup: Job) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Unique identifier.
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Human readable name, also used for log file names.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning source, if tagged.
    #[must_use]
    pub fn source(&self) -> Option<SourceKind> {
        self.source
    }

    /// Accessions served by this job.
    #[must_use]
    pub fn accessions(&self) -> &[String] {
        &self.accessions
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Terminal outcome, once reached.
    #[must_use]
    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    /// Returns the command description for process jobs.
    #[must_use]
    pub fn command_spec(&self) -> Option<&CommandJob> {
        match &self.task {
            JobTask::Command(command) => Some(command),
            JobTask::Function(_) => None,
        }
    }

    /// Returns true for process jobs.
    #[must_use]
    pub fn is_command(&self) -> bool {
        matches!(self.task, JobTask::Command(_))
    }

    /// Returns true when a follow-up is attached.
    #[must_use]
    pub fn has_follow_up(&self) -> bool {
        self.follow_up.is_some()
    }

    /// Iterates over this job and every chained follow-up.
    pub fn chain(&self) -> impl Iterator<Item = &Job> {
        std::iter::successors(Some(self), |job| {
            job.follow_up.as_ref().map(|follow_up| follow_up.job.as_ref())
        })
    }

    /// Redirects a default-output command job to a log file before start.
    pub(crate) fn set_log_file(&mut self, path: std::path::PathBuf) {
        if self.state != JobState::Pending {
            return;
        }
        if let JobTask::Command(command) = &mut self.task
            && command.uses_default_output()
        {
            command.set_log_file(path);
        }
    }

    /// Starts the job.
    ///
    /// A process that cannot be launched leaves the job `Failed`; only calling
    /// this outside `Pending` is an error.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidState`] if the job is not pending.
    pub fn start(&mut self) -> Result<(), JobError> {
        self.require(JobState::Pending, "start")?;
        self.state = JobState::Running;
        debug!(job = %self.name, id = %self.id, "job started");

        if let JobTask::Command(command) = &mut self.task
            && let Err(error) = command.spawn()
        {
            self.complete(Err(error));
        }
        Ok(())
    }

    /// Non-blocking completion check.
    ///
    /// Command jobs probe the process; function jobs run their callable now.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidState`] if the job was never started.
    pub fn is_finished(&mut self) -> Result<bool, JobError> {
        match self.state {
            JobState::Pending => Err(self.invalid_state("poll")),
            JobState::Done | JobState::Failed => Ok(true),
            JobState::Running => {
                let result = match &mut self.task {
                    JobTask::Command(command) => match command.poll() {
                        Some(result) => result.map(Some),
                        None => return Ok(false),
                    },
                    JobTask::Function(function) => function.execute().map(|()| None),
                };
                self.complete(result);
                Ok(true)
            }
        }
    }

    /// Best-effort termination. Idempotent; no-op unless running.
    ///
    /// A killed process is reported `Failed` with [`JobError::Cancelled`]
    /// once reaped by [`Job::is_finished`] or [`Job::join`].
    pub fn stop(&mut self) {
        if self.state != JobState::Running {
            return;
        }
        match &mut self.task {
            JobTask::Command(command) => command.kill(),
            JobTask::Function(function) => {
                function.cancel();
                self.complete(Err(JobError::Cancelled));
            }
        }
        debug!(job = %self.name, id = %self.id, "job stop requested");
    }

    /// Waits until the job is terminal and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidState`] if the job was never started.
    pub async fn join(&mut self) -> Result<&JobOutcome, JobError> {
        if self.state == JobState::Running {
            let result = match &mut self.task {
                JobTask::Command(command) => command.wait().await.map(Some),
                JobTask::Function(function) => function.execute().map(|()| None),
            };
            self.complete(result);
        }
        match &self.outcome {
            Some(outcome) => Ok(outcome),
            None => Err(self.invalid_state("join")),
        }
    }

    /// Detaches the follow-up, filling in the source and accessions it inherits.
    pub(crate) fn take_follow_up(&mut self) -> Option<FollowUp> {
        let mut follow_up = self.follow_up.take()?;
        let next = follow_up.job.as_mut();
        if next.source.is_none() {
            next.source = self.source;
        }
        if next.accessions.is_empty() {
            next.accessions.clone_from(&self.accessions);
        }
        if next.cleanup.is_none() {
            next.cleanup = self.cleanup.take();
        }
        Some(follow_up)
    }

    /// Detaches the failure cleanup, filling in source and accessions.
    pub(crate) fn take_cleanup(&mut self) -> Option<Job> {
        let mut cleanup = *self.cleanup.take()?;
        if cleanup.source.is_none() {
            cleanup.source = self.source;
        }
        if cleanup.accessions.is_empty() {
            cleanup.accessions.clone_from(&self.accessions);
        }
        Some(cleanup)
    }

    fn complete(&mut self, result: Result<Option<i32>, JobError>) {
        debug_assert_eq!(self.state, JobState::Running);
        let (state, outcome) = match result {
            Ok(exit_code) => (JobState::Done, JobOutcome::Succeeded { exit_code }),
            Err(error) => (JobState::Failed, JobOutcome::Failed(error)),
        };
        self.state = state;
        self.outcome = Some(outcome);
        debug!(job = %self.name, id = %self.id, state = %state, "job finished");
    }

    fn require(&self, expected: JobState, operation: &'static str) -> Result<(), JobError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn invalid_state(&self, operation: &'static str) -> JobError {
        JobError::InvalidState {
            job: self.name.clone(),
            operation,
            state: self.state,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    async fn poll_until_finished(job: &mut Job) {
        while !job.is_finished().unwrap() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ==================== Lifecycle Tests ====================

    #[test]
    fn test_new_job_is_pending_with_unique_id() {
        let a = Job::function("a", || Ok(()));
        let b = Job::function("b", || Ok(()));
        assert_eq!(a.state(), JobState::Pending);
        assert_ne!(a.id(), b.id());
        assert!(a.outcome().is_none());
    }

    #[test]
    fn test_start_twice_is_invalid_state() {
        let mut job = Job::function("move", || Ok(()));
        job.start().unwrap();
        let err = job.start().unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidState {
                operation: "start",
                state: JobState::Running,
                ..
            }
        ));
    }

    #[test]
    fn test_poll_before_start_is_invalid_state() {
        let mut job = Job::function("move", || Ok(()));
        let err = job.is_finished().unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidState);
        assert_eq!(job.state(), JobState::Pending);
    }

    #[test]
    fn test_function_job_runs_on_poll() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let mut job = Job::function("verify", move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        job.start().unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(job.is_finished().unwrap());
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(job.state(), JobState::Done);
        assert!(job.outcome().unwrap().is_success());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut job = Job::function("fail", || Err(JobError::failed("bad digest")));
        job.start().unwrap();
        assert!(job.is_finished().unwrap());
        assert_eq!(job.state(), JobState::Failed);

        job.stop();
        assert!(job.is_finished().unwrap());
        assert!(job.start().is_err());
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(
            job.outcome().unwrap().error().unwrap().to_string(),
            "bad digest"
        );
    }

    #[test]
    fn test_stop_function_job_marks_cancelled() {
        let mut job = Job::function("move", || Ok(()));
        job.stop();
        assert_eq!(job.state(), JobState::Pending);

        job.start().unwrap();
        job.stop();
        job.stop();
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(
            job.outcome().unwrap().error().unwrap().kind(),
            FailureKind::Cancelled
        );
    }

    #[tokio::test]
    async fn test_command_job_success() {
        let mut job = Job::command("ok", CommandJob::new("sh").args(["-c", "exit 0"]));
        job.start().unwrap();
        poll_until_finished(&mut job).await;
        assert_eq!(job.state(), JobState::Done);
        assert!(matches!(
            job.outcome(),
            Some(JobOutcome::Succeeded { exit_code: Some(0) })
        ));
    }

    #[tokio::test]
    async fn test_command_launch_failure_fails_job_without_error() {
        let mut job = Job::command("missing", CommandJob::new("seqdd-no-such-tool"));
        job.start().unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.is_finished().unwrap());
        assert_eq!(
            job.outcome().unwrap().error().unwrap().kind(),
            FailureKind::ProcessLaunch
        );
    }

    #[tokio::test]
    async fn test_stop_running_command_then_join() {
        let mut job = Job::command("slow", CommandJob::new("sleep").arg("30"));
        job.start().unwrap();
        job.stop();
        let outcome = job.join().await.unwrap();
        assert_eq!(outcome.error().unwrap().kind(), FailureKind::Cancelled);
        assert_eq!(job.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn test_join_pending_is_invalid_state() {
        let mut job = Job::function("f", || Ok(()));
        assert!(job.join().await.is_err());
    }

    // ==================== Chaining Tests ====================

    #[test]
    fn test_then_appends_at_chain_tail() {
        let job = Job::function("a", || Ok(()))
            .then(Job::function("b", || Ok(())))
            .then_paced(Job::function("c", || Ok(())));
        let names: Vec<&str> = job.chain().map(Job::name).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn test_follow_up_inherits_source_and_accessions() {
        let mut job = Job::function("download", || Ok(()))
            .for_source(SourceKind::Sra)
            .with_accessions(["SRR000001"])
            .on_failure(Job::function("cleanup", || Ok(())))
            .then(Job::function("move", || Ok(())));

        let follow_up = job.take_follow_up().unwrap();
        assert_eq!(follow_up.pacing, Pacing::Local);
        let mut next = *follow_up.job;
        assert_eq!(next.source(), Some(SourceKind::Sra));
        assert_eq!(next.accessions(), ["SRR000001"]);

        let cleanup = next.take_cleanup().unwrap();
        assert_eq!(cleanup.name(), "cleanup");
        assert_eq!(cleanup.source(), Some(SourceKind::Sra));
        assert!(job.take_cleanup().is_none());
    }

    #[test]
    fn test_set_log_file_only_for_default_output() {
        let mut job = Job::command("dl", CommandJob::new("curl").arg("-s"));
        job.set_log_file("/tmp/dl.log".into());
        let command = job.command_spec().unwrap();
        assert_eq!(command.log_file().unwrap().to_str(), Some("/tmp/dl.log"));
        assert_eq!(command.arguments(), ["-s"]);

        let mut inherit = Job::command(
            "inherit",
            CommandJob::new("curl").stderr(OutputTarget::Inherit),
        );
        inherit.set_log_file("/tmp/other.log".into());
        assert!(inherit.command_spec().unwrap().log_file().is_none());
    }
}
