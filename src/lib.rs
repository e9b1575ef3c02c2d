//! seqdd core library
//!
//! Reproducible downloads of biological sequence datasets. Accessions are
//! kept in a [`register`], turned into job chains by per-source builders and
//! run by a bounded scheduler that paces every remote service.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`job`] - Units of work: external commands and in-process functions
//! - [`scheduler`] - Bounded, rate-limited execution of job chains
//! - [`source`] - Per-source job builders (NCBI, SRA, ENA, Logan, URL)
//! - [`artifact`] - Checksums and safe moves of downloaded files
//! - [`register`] - Persistent accession lists and their export format
//! - [`workspace`] - Locked temporary directory
//! - [`downloader`] - Orchestration of a full register download

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod artifact;
pub mod downloader;
pub mod job;
pub mod register;
pub mod scheduler;
pub mod source;
pub mod workspace;

// Re-export commonly used types
pub use downloader::{DownloadError, DownloadManager, DownloadOptions};
pub use job::{CommandJob, FailureKind, FunctionJob, Job, JobError, JobOutcome, JobState};
pub use register::{Register, RegisterError};
pub use scheduler::{RateLimiter, RunReport, Scheduler, SchedulerError};
pub use source::{JobBuilder, SourceKind};
