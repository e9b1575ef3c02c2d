//! HTTP client policy for metadata requests made while building jobs.
//!
//! Bulk transfers run as `curl` processes under the scheduler; only small
//! requests (ENA file reports, URL filename probes) go through this client.
//! Every request first waits for its source's rate window.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use reqwest::header::CONTENT_DISPOSITION;
use reqwest::{Client, ClientBuilder, Proxy};
use tracing::{debug, warn};

use super::{BuildContext, SourceError, SourceKind};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const READ_TIMEOUT_SECS: u64 = 30;

/// Project URL advertised in the User-Agent.
const PROJECT_URL: &str = "https://github.com/yoann-dufresne/seqdd";

/// Base URLs of the remote services, overridable for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// ENA portal API (file reports).
    pub ena_portal: String,
    /// ENA browser API (assembly FASTA).
    pub ena_browser: String,
    /// Logan public bucket.
    pub logan: String,
    /// NCBI `datasets` binaries, one directory per platform.
    pub ncbi_datasets: String,
    /// SRA toolkit releases, one directory per version.
    pub sra_toolkit: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            ena_portal: "https://www.ebi.ac.uk/ena/portal/api".to_string(),
            ena_browser: "https://www.ebi.ac.uk/ena/browser/api".to_string(),
            logan: "https://s3.amazonaws.com/logan-pub".to_string(),
            ncbi_datasets: "https://ftp.ncbi.nlm.nih.gov/pub/datasets/command-line/v2".to_string(),
            sra_toolkit: "https://ftp-trace.ncbi.nlm.nih.gov/sra/sdk".to_string(),
        }
    }
}

/// Returns the User-Agent sent with metadata requests.
#[must_use]
pub fn user_agent() -> String {
    format!("seqdd/{} (+{PROJECT_URL})", env!("CARGO_PKG_VERSION"))
}

/// Builds the shared metadata client.
///
/// Some sandboxed environments panic while reading system proxy settings;
/// in that case the client is rebuilt with proxies taken from the
/// environment only.
///
/// # Errors
///
/// Returns [`SourceError::Client`] when construction fails both ways.
pub fn build_http_client() -> Result<Client, SourceError> {
    match try_build(false) {
        Ok(client) => Ok(client),
        Err(BuildFailure::Panic) => {
            warn!("HTTP client hit system proxy panic; using env-proxy fallback builder");
            try_build(true).map_err(|failure| SourceError::Client {
                message: failure.describe(),
            })
        }
        Err(failure) => Err(SourceError::Client {
            message: failure.describe(),
        }),
    }
}

enum BuildFailure {
    Panic,
    Build(reqwest::Error),
}

impl BuildFailure {
    fn describe(&self) -> String {
        match self {
            Self::Panic => "client construction panicked".to_string(),
            Self::Build(error) => error.to_string(),
        }
    }
}

fn try_build(env_proxy_only: bool) -> Result<Client, BuildFailure> {
    catch_unwind(AssertUnwindSafe(move || {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .user_agent(user_agent())
            .gzip(true);
        if env_proxy_only {
            builder = with_env_proxies(builder.no_proxy());
        }
        builder.build().map_err(BuildFailure::Build)
    }))
    .map_err(|_| BuildFailure::Panic)?
}

fn with_env_proxies(mut builder: ClientBuilder) -> ClientBuilder {
    let lookup = |names: &[&str]| {
        names.iter().find_map(|name| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
    };
    if let Some(proxy) = lookup(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(proxy) = Proxy::https(&proxy)
    {
        builder = builder.proxy(proxy);
    }
    if let Some(proxy) = lookup(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(proxy) = Proxy::http(&proxy)
    {
        builder = builder.proxy(proxy);
    }
    builder
}

/// Sends a paced GET and returns the body of a successful response.
pub(crate) async fn paced_get_text(
    ctx: &BuildContext,
    kind: SourceKind,
    url: &str,
    query: &[(&str, &str)],
) -> Result<String, SourceError> {
    let target = ::url::Url::parse_with_params(url, query).map_err(|e| SourceError::Client {
        message: format!("invalid request URL {url}: {e}"),
    })?;
    ctx.limiter.acquire(kind).await;
    debug!(source = %kind, url = %target, "metadata request");
    let response = ctx
        .client
        .get(target)
        .send()
        .await
        .map_err(|e| SourceError::http(kind, url, e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::HttpStatus {
            kind,
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    response
        .text()
        .await
        .map_err(|e| SourceError::http(kind, url, e))
}

/// Sends a paced HEAD and returns the response status.
pub(crate) async fn paced_head_status(
    ctx: &BuildContext,
    kind: SourceKind,
    url: &str,
) -> Result<u16, SourceError> {
    ctx.limiter.acquire(kind).await;
    debug!(source = %kind, url, "existence request");
    ctx.client
        .head(url)
        .send()
        .await
        .map(|response| response.status().as_u16())
        .map_err(|e| SourceError::http(kind, url, e))
}

/// Sends a paced HEAD and returns the `Content-Disposition` header, if any.
///
/// Servers that reject HEAD are not an error; the caller falls back to the
/// URL path.
pub(crate) async fn paced_head_disposition(
    ctx: &BuildContext,
    kind: SourceKind,
    url: &str,
) -> Option<String> {
    ctx.limiter.acquire(kind).await;
    match ctx.client.head(url).send().await {
        Ok(response) if response.status().is_success() => response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string),
        Ok(response) => {
            debug!(url, status = response.status().as_u16(), "HEAD probe rejected");
            None
        }
        Err(error) => {
            debug!(url, error = %error, "HEAD probe failed");
            None
        }
    }
}
