//! Data sources and the job builders that download from them.
//!
//! Each source turns a list of accessions into job chains for the
//! [`Scheduler`](crate::scheduler::Scheduler). Builders only describe work;
//! nothing is downloaded until the scheduler dispatches the jobs.
//!
//! # Architecture
//!
//! - [`SourceKind`] - The closed set of known sources, with their default pacing
//! - [`JobBuilder`] - Async trait implemented by every source
//! - [`BuildContext`] - Directories, limiter, HTTP client and tools shared by builders
//! - [`Toolbox`] - Lookup of external programs on `PATH` and in a local bin directory
//! - [`RemoteCheck`] - Outcome of asking a remote service which accessions exist
//! - [`builder_for`] - Static factory from [`SourceKind`] to builder
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use seqdd_core::scheduler::RateLimiter;
//! use seqdd_core::source::{builder_for, BuildContext, SourceKind};
//!
//! # async fn example() -> Result<(), seqdd_core::source::SourceError> {
//! let ctx = BuildContext::new("tmp", "data", Arc::new(RateLimiter::with_defaults()))?;
//! let builder = builder_for(SourceKind::Logan);
//! let jobs = builder.jobs_for(&["SRR0000001_unitigs".to_string()], &ctx).await?;
//! println!("{} job chains", jobs.len());
//! # Ok(())
//! # }
//! ```

mod ena;
mod error;
pub mod filename;
mod http;
mod logan;
mod ncbi;
mod sra;
mod tools;
mod url;

pub use ena::EnaBuilder;
pub use error::SourceError;
pub use http::{Endpoints, build_http_client, user_agent};
pub use logan::LoganBuilder;
pub use ncbi::{NCBI_BATCH_SIZE, NcbiBuilder, parse_summary_accessions};
pub use sra::SraBuilder;
pub use tools::{
    DEFAULT_BIN_DIR, SRA_TOOLKIT_VERSION, Toolbox, datasets_url, find_executable, install_tools,
    sra_toolkit_url,
};
pub use self::url::UrlBuilder;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::job::{Job, JobError};
use crate::scheduler::RateLimiter;

/// Known data sources.
///
/// The order of [`SourceKind::ALL`] is the order sources are listed and
/// processed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// NCBI assemblies through the `datasets` CLI.
    Ncbi,
    /// SRA reads through the SRA toolkit.
    Sra,
    /// ENA reads and assemblies over HTTPS.
    Ena,
    /// Logan unitigs and contigs from the public bucket.
    Logan,
    /// Arbitrary URLs.
    Url,
}

impl SourceKind {
    /// Every source, in processing order.
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Ncbi,
        SourceKind::Sra,
        SourceKind::Ena,
        SourceKind::Logan,
        SourceKind::Url,
    ];

    /// Returns the stable lowercase name used in the register and on the CLI.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ncbi => "ncbi",
            Self::Sra => "sra",
            Self::Ena => "ena",
            Self::Logan => "logan",
            Self::Url => "url",
        }
    }

    /// Returns the minimum delay between two dispatches to this source.
    #[must_use]
    pub fn default_delay(self) -> Duration {
        match self {
            Self::Ncbi => Duration::from_secs(1),
            Self::Sra | Self::Url => Duration::from_millis(500),
            Self::Ena | Self::Logan => Duration::from_millis(350),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = SourceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| SourceError::UnknownSource {
                name: value.to_string(),
            })
    }
}

/// Shared inputs for job construction.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Root of the temporary workspace; each source uses a subdirectory.
    pub tmp_dir: PathBuf,
    /// Directory receiving finished downloads.
    pub out_dir: PathBuf,
    /// Limiter shared with the scheduler, used for metadata requests.
    pub limiter: Arc<RateLimiter>,
    /// HTTP client for metadata requests.
    pub client: reqwest::Client,
    /// Remote service base URLs.
    pub endpoints: Endpoints,
    /// Where the external programs of command jobs are found.
    pub tools: Toolbox,
}

impl BuildContext {
    /// Creates a context with the default HTTP client and endpoints, looking
    /// tools up on `PATH` only.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Client`] if the HTTP client cannot be built.
    pub fn new(
        tmp_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            tmp_dir: tmp_dir.into(),
            out_dir: out_dir.into(),
            limiter,
            client: build_http_client()?,
            endpoints: Endpoints::default(),
            tools: Toolbox::path_only(),
        })
    }

    /// Overrides where tools are looked up.
    #[must_use]
    pub fn with_tools(mut self, tools: Toolbox) -> Self {
        self.tools = tools;
        self
    }

    /// Overrides the remote base URLs.
    #[must_use]
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Returns the temporary directory reserved for `source`.
    #[must_use]
    pub fn source_tmp(&self, source: SourceKind) -> PathBuf {
        self.tmp_dir.join(source.as_str())
    }

    /// Returns true when `name` already exists in the output directory.
    #[must_use]
    pub fn already_downloaded(&self, name: &str) -> bool {
        self.out_dir.join(name).exists()
    }
}

/// Accessions per remote existence lookup.
pub(crate) const REMOTE_QUERY_SIZE: usize = 32;

/// Outcome of asking a remote service which accessions exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCheck {
    /// Accessions the service knows.
    pub confirmed: Vec<String>,
    /// Accessions the service answered for without listing them.
    pub unknown: Vec<String>,
    /// Accessions whose lookup failed, so nothing is known about them.
    pub unchecked: Vec<String>,
}

impl RemoteCheck {
    /// A check that confirms every accession.
    #[must_use]
    pub fn all_confirmed(accessions: &[String]) -> Self {
        Self {
            confirmed: accessions.to_vec(),
            ..Self::default()
        }
    }

    /// Accessions that may be registered: confirmed ones, then unchecked ones.
    #[must_use]
    pub fn accepted(&self) -> Vec<String> {
        self.confirmed.iter().chain(&self.unchecked).cloned().collect()
    }

    /// Sorts an answered slice into confirmed and unknown.
    pub(crate) fn record(&mut self, slice: &[String], found: impl Fn(&str) -> bool) {
        for accession in slice {
            if found(accession) {
                self.confirmed.push(accession.clone());
            } else {
                self.unknown.push(accession.clone());
            }
        }
    }

    /// Marks a slice whose lookup failed.
    pub(crate) fn record_unchecked(&mut self, slice: &[String]) {
        self.unchecked.extend(slice.iter().cloned());
    }
}

/// Turns accessions of one source into job chains.
///
/// # Object Safety
///
/// This trait uses `async_trait` so builders can be stored as
/// `Box<dyn JobBuilder>`.
#[async_trait]
pub trait JobBuilder: Send + Sync {
    /// Returns the source this builder serves.
    fn source(&self) -> SourceKind;

    /// Returns the executables the jobs run, looked up through [`Toolbox`].
    fn required_tools(&self) -> &'static [&'static str];

    /// Returns true if `accession` has a format this source accepts.
    fn is_valid_accession(&self, accession: &str) -> bool;

    /// Splits `accessions` into `(valid, invalid)`, preserving order.
    fn partition_valid(&self, accessions: &[String]) -> (Vec<String>, Vec<String>) {
        accessions
            .iter()
            .cloned()
            .partition(|accession| self.is_valid_accession(accession))
    }

    /// Asks the remote service which of `accessions` exist.
    ///
    /// Lookup failures never reject an accession; they leave it unchecked.
    /// Sources without a lookup confirm every accession.
    async fn confirm_remote(&self, accessions: &[String], _ctx: &BuildContext) -> RemoteCheck {
        RemoteCheck::all_confirmed(accessions)
    }

    /// Builds one job chain per unit of work.
    ///
    /// Accessions already present in the output directory are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if temporary directories cannot be prepared or
    /// a metadata request fails.
    async fn jobs_for(
        &self,
        accessions: &[String],
        ctx: &BuildContext,
    ) -> Result<Vec<Job>, SourceError>;
}

/// Returns the builder for `kind`.
#[must_use]
pub fn builder_for(kind: SourceKind) -> Box<dyn JobBuilder> {
    match kind {
        SourceKind::Ncbi => Box::new(NcbiBuilder),
        SourceKind::Sra => Box::new(SraBuilder),
        SourceKind::Ena => Box::new(EnaBuilder),
        SourceKind::Logan => Box::new(LoganBuilder),
        SourceKind::Url => Box::new(UrlBuilder),
    }
}

/// Empties `dir`, creating it if needed. Removes leftovers of an earlier attempt.
pub(crate) fn fresh_dir(dir: &Path) -> Result<(), SourceError> {
    if dir.exists() {
        debug!(dir = %dir.display(), "removing stale temporary directory");
        fs::remove_dir_all(dir).map_err(|e| SourceError::io(dir, e))?;
    }
    fs::create_dir_all(dir).map_err(|e| SourceError::io(dir, e))
}

/// A job that fails at once, standing in for an accession that could not be prepared.
pub(crate) fn failing_job(name: String, source: SourceKind, accession: &str, message: String) -> Job {
    Job::function(name, move || Err(JobError::failed(message)))
        .for_source(source)
        .with_accessions([accession])
}

/// Renders a path as a command argument.
pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
