//! External process jobs.
//!
//! A [`CommandJob`] describes one invocation of a download tool: program,
//! argument vector, working directory and where its output goes. The
//! [`Job`](super::Job) wrapper drives it through the lifecycle; this module
//! only knows how to spawn, probe, kill and reap the process.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::{ExitDetail, JobError};

/// Maximum number of diagnostic bytes kept from a failed process.
pub const MAX_DIAGNOSTIC_BYTES: usize = 4096;

/// How long to wait for output pipes to close after the process exited.
///
/// A grandchild can inherit the pipe and keep it open; past this grace the
/// drain task is aborted and whatever was captured is used.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Where a process stream is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Share the parent's stream.
    Inherit,
    /// Discard the output.
    Null,
    /// Truncate and write to a file.
    File(PathBuf),
    /// Keep the last [`MAX_DIAGNOSTIC_BYTES`] in memory for diagnostics.
    Capture,
}

/// An external executable invocation.
#[derive(Debug)]
pub struct CommandJob {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    stdout: OutputTarget,
    stderr: OutputTarget,
    log_file: Option<PathBuf>,
    process: Option<RunningProcess>,
}

#[derive(Debug)]
struct RunningProcess {
    child: Child,
    /// Output drains, stderr first.
    drains: Vec<OutputDrain>,
    exit: Option<(ExitStatus, Instant)>,
    killed: bool,
}

#[derive(Debug)]
enum OutputDrain {
    Pending(JoinHandle<Vec<u8>>),
    Done(Vec<u8>),
}

impl CommandJob {
    /// Creates an invocation of `program` with no arguments.
    ///
    /// Stdout is discarded and stderr captured unless configured otherwise.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            stdout: OutputTarget::Null,
            stderr: OutputTarget::Capture,
            log_file: None,
            process: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory of the process.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Redirects stdout.
    #[must_use]
    pub fn stdout(mut self, target: OutputTarget) -> Self {
        self.stdout = target;
        self
    }

    /// Redirects stderr.
    #[must_use]
    pub fn stderr(mut self, target: OutputTarget) -> Self {
        self.stderr = target;
        self
    }

    /// Sends both streams to `path`; its tail becomes the failure diagnostic.
    #[must_use]
    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub(crate) fn set_log_file(&mut self, path: PathBuf) {
        self.log_file = Some(path);
    }

    /// Program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument vector, without the program.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Working directory, if set.
    #[must_use]
    pub fn working_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Log file receiving both streams, if set.
    #[must_use]
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// Returns true when no explicit redirection was configured.
    pub(crate) fn uses_default_output(&self) -> bool {
        self.log_file.is_none()
            && self.stdout == OutputTarget::Null
            && self.stderr == OutputTarget::Capture
    }

    /// Launches the process.
    pub(crate) fn spawn(&mut self) -> Result<(), JobError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        if let Some(log_file) = &self.log_file {
            let out = File::create(log_file).map_err(|e| JobError::io(log_file, e))?;
            let err = out.try_clone().map_err(|e| JobError::io(log_file, e))?;
            command.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        } else {
            command
                .stdout(open_target(&self.stdout)?)
                .stderr(open_target(&self.stderr)?);
        }

        let mut child = command
            .spawn()
            .map_err(|e| JobError::launch(&self.program, e))?;
        debug!(pid = child.id(), command = %self, "process spawned");

        let mut drains = Vec::new();
        if let Some(err) = child.stderr.take() {
            drains.push(OutputDrain::Pending(tokio::spawn(drain_tail(err))));
        }
        if let Some(out) = child.stdout.take() {
            drains.push(OutputDrain::Pending(tokio::spawn(drain_tail(out))));
        }
        self.process = Some(RunningProcess {
            child,
            drains,
            exit: None,
            killed: false,
        });
        Ok(())
    }

    /// Non-blocking completion probe. Returns `None` while still running.
    pub(crate) fn poll(&mut self) -> Option<Result<i32, JobError>> {
        let process = self.process.as_mut()?;
        if process.exit.is_none() {
            match process.child.try_wait() {
                Ok(Some(status)) => process.exit = Some((status, Instant::now())),
                Ok(None) => return None,
                Err(e) => {
                    return Some(Err(JobError::failed(format!(
                        "could not probe '{}': {e}",
                        self.program
                    ))));
                }
            }
        }

        let (status, exited_at) = process.exit?;
        if !process.drains_finished() && exited_at.elapsed() < DRAIN_GRACE {
            return None;
        }
        let captured = process.collect_tails();
        Some(self.classify(status, &captured))
    }

    /// Waits for the process to exit and classifies the result.
    pub(crate) async fn wait(&mut self) -> Result<i32, JobError> {
        let Some(process) = self.process.as_mut() else {
            return Err(JobError::Cancelled);
        };
        let status = match process.exit {
            Some((status, _)) => status,
            None => {
                let status = process
                    .child
                    .wait()
                    .await
                    .map_err(|e| JobError::failed(format!("could not wait on '{}': {e}", self.program)))?;
                process.exit = Some((status, Instant::now()));
                status
            }
        };
        process.await_tails().await;
        let captured = process.collect_tails();
        self.classify(status, &captured)
    }

    /// Sends a kill signal. Safe to call repeatedly or after exit.
    pub(crate) fn kill(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        if process.killed || process.exit.is_some() {
            return;
        }
        process.killed = true;
        if let Err(e) = process.child.start_kill() {
            debug!(program = %self.program, error = %e, "kill failed, process likely exited");
        }
    }

    fn classify(&self, status: ExitStatus, captured: &str) -> Result<i32, JobError> {
        let killed = self.process.as_ref().is_some_and(|p| p.killed);
        if status.success() {
            return Ok(status.code().unwrap_or(0));
        }
        if killed {
            return Err(JobError::Cancelled);
        }

        let diagnostics = match &self.log_file {
            Some(path) => read_tail(path, MAX_DIAGNOSTIC_BYTES).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "could not read log tail");
                String::new()
            }),
            None => captured.to_string(),
        };
        Err(JobError::ProcessExit {
            program: self.program.clone(),
            status: exit_detail(status),
            diagnostics,
        })
    }
}

impl fmt::Display for CommandJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl RunningProcess {
    fn drains_finished(&self) -> bool {
        self.drains.iter().all(|drain| match drain {
            OutputDrain::Pending(handle) => handle.is_finished(),
            OutputDrain::Done(_) => true,
        })
    }

    async fn await_tails(&mut self) {
        for drain in &mut self.drains {
            if let OutputDrain::Pending(handle) = drain {
                let bytes = match tokio::time::timeout(DRAIN_GRACE, &mut *handle).await {
                    Ok(Ok(bytes)) => bytes,
                    Ok(Err(_)) => Vec::new(),
                    Err(_) => {
                        handle.abort();
                        Vec::new()
                    }
                };
                *drain = OutputDrain::Done(bytes);
            }
        }
    }

    /// Collects captured output. Unfinished drains are aborted.
    ///
    /// Drains earlier in the list claim the byte budget first, so stderr
    /// survives a noisy stdout. The result lists stdout before stderr.
    fn collect_tails(&mut self) -> String {
        let mut budget = MAX_DIAGNOSTIC_BYTES;
        let mut parts = Vec::with_capacity(self.drains.len());
        for drain in &mut self.drains {
            let bytes = match std::mem::replace(drain, OutputDrain::Done(Vec::new())) {
                OutputDrain::Done(bytes) => bytes,
                OutputDrain::Pending(handle) => {
                    let abort = handle.abort_handle();
                    match handle.now_or_never() {
                        Some(Ok(bytes)) => bytes,
                        _ => {
                            abort.abort();
                            Vec::new()
                        }
                    }
                }
            };
            let keep = bytes.len().min(budget);
            budget -= keep;
            parts.push(bytes[bytes.len() - keep..].to_vec());
        }
        let collected: Vec<u8> = parts.into_iter().rev().flatten().collect();
        String::from_utf8_lossy(&collected).into_owned()
    }
}

fn open_target(target: &OutputTarget) -> Result<Stdio, JobError> {
    Ok(match target {
        OutputTarget::Inherit => Stdio::inherit(),
        OutputTarget::Null => Stdio::null(),
        OutputTarget::Capture => Stdio::piped(),
        OutputTarget::File(path) => {
            Stdio::from(File::create(path).map_err(|e| JobError::io(path, e))?)
        }
    })
}

async fn drain_tail<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > MAX_DIAGNOSTIC_BYTES {
                    tail.drain(..tail.len() - MAX_DIAGNOSTIC_BYTES);
                }
            }
        }
    }
    tail
}

fn read_tail(path: &Path, max: usize) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let max = u64::try_from(max).unwrap_or(u64::MAX);
    if len > max {
        file.seek(SeekFrom::Start(len - max))?;
    }
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(unix)]
fn exit_detail(status: ExitStatus) -> ExitDetail {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitDetail::Code(code),
        (None, Some(signal)) => ExitDetail::Signal(signal),
        (None, None) => ExitDetail::Unknown,
    }
}

#[cfg(not(unix))]
fn exit_detail(status: ExitStatus) -> ExitDetail {
    status.code().map_or(ExitDetail::Unknown, ExitDetail::Code)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn run_to_end(job: &mut CommandJob) -> Result<i32, JobError> {
        job.spawn()?;
        loop {
            if let Some(result) = job.poll() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ==================== Builder Tests ====================

    #[test]
    fn test_command_display_joins_arguments() {
        let job = CommandJob::new("prefetch")
            .args(["--max-size", "u"])
            .arg("SRR000001");
        assert_eq!(job.to_string(), "prefetch --max-size u SRR000001");
        assert_eq!(job.program(), "prefetch");
        assert_eq!(job.arguments().len(), 3);
    }

    #[test]
    fn test_default_output_detection() {
        assert!(CommandJob::new("true").uses_default_output());
        assert!(!CommandJob::new("true").log_to("/tmp/x.log").uses_default_output());
        assert!(
            !CommandJob::new("true")
                .stderr(OutputTarget::Inherit)
                .uses_default_output()
        );
    }

    // ==================== Process Tests ====================

    #[tokio::test]
    async fn test_successful_process_returns_zero() {
        let mut job = CommandJob::new("sh").args(["-c", "exit 0"]);
        assert_eq!(run_to_end(&mut job).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_process_captures_stderr() {
        let mut job = CommandJob::new("sh").args(["-c", "echo 'no such accession' >&2; exit 1"]);
        let err = run_to_end(&mut job).await.unwrap_err();
        match err {
            JobError::ProcessExit {
                status,
                diagnostics,
                ..
            } => {
                assert_eq!(status, ExitDetail::Code(1));
                assert!(diagnostics.contains("no such accession"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let mut job = CommandJob::new("seqdd-definitely-not-a-binary");
        let err = job.spawn().unwrap_err();
        assert!(matches!(err, JobError::ProcessLaunch { .. }));
    }

    #[tokio::test]
    async fn test_working_directory_is_applied() {
        let dir = TempDir::new().unwrap();
        let mut job = CommandJob::new("sh")
            .args(["-c", "touch marker"])
            .current_dir(dir.path());
        run_to_end(&mut job).await.unwrap();
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_log_file_tail_is_diagnostic() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("job.log");
        let mut job = CommandJob::new("sh")
            .args(["-c", "echo progress; echo 'fatal: disk full' >&2; exit 3"])
            .log_to(&log);
        let err = run_to_end(&mut job).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("code 3"));
        assert!(msg.contains("fatal: disk full"));
        assert!(std::fs::read_to_string(&log).unwrap().contains("progress"));
    }

    #[tokio::test]
    async fn test_captured_output_is_bounded() {
        let mut job = CommandJob::new("sh").args([
            "-c",
            "i=0; while [ $i -lt 2000 ]; do echo 'line of noise' >&2; i=$((i+1)); done; exit 1",
        ]);
        let err = run_to_end(&mut job).await.unwrap_err();
        let JobError::ProcessExit { diagnostics, .. } = err else {
            panic!("expected process exit");
        };
        assert!(diagnostics.len() <= MAX_DIAGNOSTIC_BYTES);
        assert!(diagnostics.contains("line of noise"));
    }

    #[tokio::test]
    async fn test_stderr_survives_noisy_stdout() {
        let mut job = CommandJob::new("sh").args([
            "-c",
            "i=0; while [ $i -lt 1000 ]; do echo 'stdout chatter'; i=$((i+1)); done; echo 'fatal: bad run' >&2; exit 1",
        ])
        .stdout(OutputTarget::Capture);
        let err = run_to_end(&mut job).await.unwrap_err();
        let JobError::ProcessExit { diagnostics, .. } = err else {
            panic!("expected process exit");
        };
        assert!(diagnostics.len() <= MAX_DIAGNOSTIC_BYTES);
        assert!(diagnostics.contains("fatal: bad run"));
        assert!(diagnostics.contains("stdout chatter"));
    }

    #[tokio::test]
    async fn test_kill_reports_cancelled() {
        let mut job = CommandJob::new("sleep").arg("30");
        job.spawn().unwrap();
        job.kill();
        job.kill();
        let err = job.wait().await.unwrap_err();
        assert!(matches!(err, JobError::Cancelled));
    }

    #[tokio::test]
    async fn test_wait_blocks_until_exit() {
        let mut job = CommandJob::new("sh").args(["-c", "sleep 0.1; exit 4"]);
        job.spawn().unwrap();
        let err = job.wait().await.unwrap_err();
        assert!(err.to_string().contains("code 4"));
    }

    #[test]
    fn test_read_tail_limits_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.log");
        std::fs::write(&path, "a".repeat(10_000) + "END").unwrap();
        let tail = read_tail(&path, 100).unwrap();
        assert_eq!(tail.len(), 100);
        assert!(tail.ends_with("END"));
    }
}
