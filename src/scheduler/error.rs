//! Errors raised before the scheduling loop starts.

use thiserror::Error;

use crate::job::JobState;

/// Minimum allowed process limit.
pub const MIN_PROCESSES: usize = 1;

/// Malformed job specifications and invalid scheduler settings.
///
/// Job-level failures never surface here; they are recorded in the
/// [`RunReport`](super::RunReport).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid process limit.
    #[error("invalid max processes value {value}: must be at least {MIN_PROCESSES}")]
    InvalidMaxProcesses {
        /// The rejected value.
        value: usize,
    },

    /// A submitted job (or a step of its chain) was not pending.
    #[error("job '{job}' cannot be submitted while {state}")]
    NotPending {
        /// Name of the offending job.
        job: String,
        /// Its state at submission.
        state: JobState,
    },

    /// A submitted job has no source to be rate limited against.
    #[error("job '{job}' has no source")]
    MissingSource {
        /// Name of the offending job.
        job: String,
    },

    /// A submitted job does not reference any accession.
    #[error("job '{job}' serves no accession")]
    MissingAccessions {
        /// Name of the offending job.
        job: String,
    },

    /// A command job has an empty program name.
    #[error("job '{job}' has an empty command")]
    EmptyCommand {
        /// Name of the offending job.
        job: String,
    },
}
