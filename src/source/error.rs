//! Error types for job builders.

use std::path::PathBuf;

use thiserror::Error;

use super::SourceKind;

/// Errors raised while turning accessions into jobs.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source name is not one of the known sources.
    #[error("unknown source '{name}' (expected one of: ncbi, sra, ena, logan, url)")]
    UnknownSource {
        /// The rejected name.
        name: String,
    },

    /// The accession does not match the source's accession format.
    #[error("invalid {kind} accession '{accession}'")]
    InvalidAccession {
        /// Source that rejected the accession.
        kind: SourceKind,
        /// The rejected accession.
        accession: String,
    },

    /// A metadata request could not be sent or its body not read.
    #[error("{kind} request to {url} failed: {error}")]
    Http {
        /// Source issuing the request.
        kind: SourceKind,
        /// Requested URL.
        url: String,
        /// Underlying client error.
        #[source]
        error: reqwest::Error,
    },

    /// A metadata request returned a non-success status.
    #[error("{kind} request to {url} returned HTTP {status}")]
    HttpStatus {
        /// Source issuing the request.
        kind: SourceKind,
        /// Requested URL.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// A metadata response could not be interpreted.
    #[error("unexpected {kind} response for '{accession}': {message}")]
    InvalidResponse {
        /// Source issuing the request.
        kind: SourceKind,
        /// Accession being resolved.
        accession: String,
        /// What was wrong with the response.
        message: String,
    },

    /// The HTTP client could not be built.
    #[error("HTTP client construction failed: {message}")]
    Client {
        /// Failure description.
        message: String,
    },

    /// A source's tools could not be installed into the bin directory.
    #[error("could not install {kind} tools: {message}")]
    Install {
        /// Source whose tools were being installed.
        kind: SourceKind,
        /// Failure description.
        message: String,
    },

    /// Preparing a temporary or output directory failed.
    #[error("I/O error at {path}: {error}")]
    Io {
        /// Path being prepared.
        path: PathBuf,
        /// Underlying error.
        #[source]
        error: std::io::Error,
    },
}

impl SourceError {
    /// Creates an [`SourceError::InvalidAccession`].
    #[must_use]
    pub fn invalid_accession(kind: SourceKind, accession: impl Into<String>) -> Self {
        Self::InvalidAccession {
            kind,
            accession: accession.into(),
        }
    }

    /// Creates an [`SourceError::InvalidResponse`].
    #[must_use]
    pub fn invalid_response(
        kind: SourceKind,
        accession: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidResponse {
            kind,
            accession: accession.into(),
            message: message.into(),
        }
    }

    /// Creates an [`SourceError::Http`].
    #[must_use]
    pub fn http(kind: SourceKind, url: impl Into<String>, error: reqwest::Error) -> Self {
        Self::Http {
            kind,
            url: url.into(),
            error,
        }
    }

    /// Creates an [`SourceError::Install`].
    #[must_use]
    pub fn install(kind: SourceKind, message: impl Into<String>) -> Self {
        Self::Install {
            kind,
            message: message.into(),
        }
    }

    /// Creates an [`SourceError::Io`].
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_accession_display() {
        let err = SourceError::invalid_accession(SourceKind::Ncbi, "GCA_12");
        assert_eq!(err.to_string(), "invalid ncbi accession 'GCA_12'");
    }

    #[test]
    fn test_http_status_display() {
        let err = SourceError::HttpStatus {
            kind: SourceKind::Ena,
            url: "https://www.ebi.ac.uk/ena/portal/api/filereport".to_string(),
            status: 503,
        };
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn test_install_display() {
        let err = SourceError::install(SourceKind::Sra, "unsupported platform macos");
        assert_eq!(err.to_string(), "could not install sra tools: unsupported platform macos");
    }

    #[test]
    fn test_unknown_source_lists_choices() {
        let err = SourceError::UnknownSource {
            name: "genbank".to_string(),
        };
        assert!(err.to_string().contains("ncbi, sra, ena, logan, url"));
    }
}
