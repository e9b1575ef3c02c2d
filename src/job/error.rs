//! Error types for job execution.
//!
//! Every way a job can end badly is captured here and classified with a
//! [`FailureKind`], so the scheduler can record failures without ever
//! propagating them out of its loop.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use super::JobState;

/// Errors produced while starting, polling or finishing a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// The executable could not be launched (not found, permission denied).
    #[error("failed to launch '{program}': {source}")]
    ProcessLaunch {
        /// Program that was being launched.
        program: String,
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The process ran but exited unsuccessfully.
    #[error("'{program}' exited with {status}{}", format_diagnostics(.diagnostics))]
    ProcessExit {
        /// Program that exited.
        program: String,
        /// Exit code or terminating signal.
        status: ExitDetail,
        /// Tail of the captured stderr or log output.
        diagnostics: String,
    },

    /// A downloaded artifact did not match its expected digest.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Artifact that failed verification.
        path: PathBuf,
        /// Digest announced by the source.
        expected: String,
        /// Digest computed locally.
        actual: String,
    },

    /// A lifecycle operation was called in the wrong state.
    #[error("job {job}: cannot {operation} while {state}")]
    InvalidState {
        /// Name of the offending job.
        job: String,
        /// The rejected operation.
        operation: &'static str,
        /// State the job was in.
        state: JobState,
    },

    /// The job was stopped before it completed.
    #[error("job cancelled")]
    Cancelled,

    /// Filesystem error inside a function job.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A function job reported a failure of its own.
    #[error("{message}")]
    Failed {
        /// Human readable failure description.
        message: String,
    },

    /// A function job panicked.
    #[error("function panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },
}

impl JobError {
    /// Creates a launch error.
    pub fn launch(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::ProcessLaunch {
            program: program.into(),
            source,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a checksum mismatch error.
    pub fn checksum_mismatch(
        path: impl Into<PathBuf>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ChecksumMismatch {
            path: path.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a generic failure from a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Returns the classification used in run reports.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ProcessLaunch { .. } => FailureKind::ProcessLaunch,
            Self::ProcessExit { .. } => FailureKind::ProcessExit,
            Self::ChecksumMismatch { .. } => FailureKind::ChecksumMismatch,
            Self::InvalidState { .. } => FailureKind::InvalidState,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Io { .. } => FailureKind::Io,
            Self::Failed { .. } => FailureKind::Function,
            Self::Panicked { .. } => FailureKind::Panicked,
        }
    }
}

fn format_diagnostics(diagnostics: &str) -> String {
    let trimmed = diagnostics.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDetail {
    /// Normal exit with a status code.
    Code(i32),
    /// Killed by a signal (Unix only).
    Signal(i32),
    /// Neither code nor signal could be determined.
    Unknown,
}

impl fmt::Display for ExitDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::Unknown => f.write_str("unknown status"),
        }
    }
}

/// Failure classification, used to group failures in the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ProcessLaunch,
    ProcessExit,
    ChecksumMismatch,
    InvalidState,
    Cancelled,
    Io,
    Function,
    Panicked,
    /// The source could not be prepared: missing tools or a failed metadata query.
    SourceUnavailable,
}

impl FailureKind {
    /// Returns the stable label for display output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessLaunch => "process_launch",
            Self::ProcessExit => "process_exit",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::InvalidState => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::Io => "io",
            Self::Function => "function",
            Self::Panicked => "panicked",
            Self::SourceUnavailable => "source_unavailable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
