//! Error types for register storage.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or writing a register.
#[derive(Debug, Error)]
pub enum RegisterError {
    /// `init` found an existing register and was not forced.
    #[error("a register already exists at {path} (use --force to recreate it)")]
    AlreadyExists {
        /// Register directory.
        path: PathBuf,
    },

    /// No register at the given location.
    #[error("no register at {path} (run `seqdd init` first)")]
    NotFound {
        /// Register directory.
        path: PathBuf,
    },

    /// A filesystem operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The export file was written by an incompatible version.
    #[error("incompatible register version {found} (supported: {supported})")]
    IncompatibleVersion {
        /// Version read from the file.
        found: String,
        /// Version this build writes.
        supported: String,
    },

    /// The export file does not follow the expected layout.
    #[error("malformed register file {path} at line {line}: {message}")]
    Malformed {
        /// File being imported.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        message: String,
    },

    /// A user-supplied filter is not a valid regular expression.
    #[error("invalid filter pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// Regex compilation error.
        #[source]
        source: regex::Error,
    },
}

impl RegisterError {
    /// Creates an [`RegisterError::Io`].
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}
