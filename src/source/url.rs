//! Plain URL downloads.
//!
//! The register index of a URL names its output: the file lands at
//! `<out>/url<idx>_<filename>`. The file name is probed with a paced `HEAD`
//! request so servers that serve `/download?id=7` still produce a useful
//! name.

use std::fs;
use std::path::Path;

use ::url::Url;
use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::filename::choose_filename;
use super::http::paced_head_disposition;
use super::{BuildContext, JobBuilder, SourceError, SourceKind, fresh_dir, path_arg};
use crate::artifact::{move_path, remove_dir_if_exists};
use crate::job::{CommandJob, Job};

/// Schemes `curl` is asked to fetch.
pub const SUPPORTED_SCHEMES: [&str; 3] = ["http", "https", "ftp"];

/// Builder for arbitrary HTTP(S) and FTP URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlBuilder;

#[async_trait]
impl JobBuilder for UrlBuilder {
    fn source(&self) -> SourceKind {
        SourceKind::Url
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["curl"]
    }

    fn is_valid_accession(&self, accession: &str) -> bool {
        Url::parse(accession).is_ok_and(|url| {
            SUPPORTED_SCHEMES.contains(&url.scheme()) && url.host_str().is_some()
        })
    }

    #[instrument(skip(self, accessions, ctx), fields(count = accessions.len()))]
    async fn jobs_for(
        &self,
        accessions: &[String],
        ctx: &BuildContext,
    ) -> Result<Vec<Job>, SourceError> {
        let root = ctx.source_tmp(SourceKind::Url);
        let curl = ctx.tools.program("curl");
        let mut jobs = Vec::new();
        for (idx, accession) in accessions.iter().enumerate() {
            let prefix = format!("url{idx}_");
            if has_entry_with_prefix(&ctx.out_dir, &prefix) {
                debug!(url = %accession, "already downloaded");
                continue;
            }
            let url = Url::parse(accession)
                .map_err(|_| SourceError::invalid_accession(SourceKind::Url, accession))?;
            let disposition = if url.scheme() == "ftp" {
                None
            } else {
                paced_head_disposition(ctx, SourceKind::Url, accession).await
            };
            let filename = choose_filename(disposition.as_deref(), &url);

            let work_dir = root.join(format!("url{idx}"));
            fresh_dir(&work_dir)?;
            let dest = ctx.out_dir.join(format!("{prefix}{filename}"));
            jobs.push(url_chain(idx, accession, &curl, &work_dir, &filename, &dest));
        }
        info!(jobs = jobs.len(), "created URL jobs");
        Ok(jobs)
    }
}

fn has_entry_with_prefix(dir: &Path, prefix: &str) -> bool {
    fs::read_dir(dir).is_ok_and(|entries| {
        entries
            .filter_map(Result::ok)
            .any(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
    })
}

fn url_chain(
    idx: usize,
    url: &str,
    curl: &str,
    work_dir: &Path,
    filename: &str,
    dest: &Path,
) -> Job {
    let name = format!("url{idx}");
    let tmp_file = work_dir.join(filename);
    let download = CommandJob::new(curl)
        .args(["-s", "-f", "-L", "-o"])
        .arg(path_arg(&tmp_file))
        .arg(url);

    let move_dir = work_dir.to_path_buf();
    let cleanup_dir = work_dir.to_path_buf();
    let dest = dest.to_path_buf();
    let relocate = Job::function(format!("{name}_move"), move || {
        move_path(&tmp_file, &dest)?;
        remove_dir_if_exists(&move_dir)?;
        Ok(())
    });
    let cleanup = Job::function(format!("{name}_cleanup"), move || {
        remove_dir_if_exists(&cleanup_dir)?;
        Ok(())
    });

    Job::command(format!("{name}_download"), download)
        .for_source(SourceKind::Url)
        .with_accessions([url])
        .on_failure(cleanup)
        .then(relocate)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::scheduler::RateLimiter;

    #[test]
    fn test_supported_schemes() {
        let builder = UrlBuilder;
        assert!(builder.is_valid_accession("https://example.org/genome.fa.gz"));
        assert!(builder.is_valid_accession("http://example.org/a"));
        assert!(builder.is_valid_accession("ftp://ftp.example.org/pub/a.fa"));
        assert!(!builder.is_valid_accession("file:///etc/passwd"));
        assert!(!builder.is_valid_accession("s3://bucket/key"));
        assert!(!builder.is_valid_accession("not a url"));
    }

    #[tokio::test]
    async fn test_ftp_url_uses_path_name_without_probe() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = BuildContext::new(
            dir.path().join("tmp"),
            dir.path().join("out"),
            Arc::new(RateLimiter::disabled()),
        )
        .unwrap();
        let urls = vec!["ftp://ftp.example.org/pub/reads.fq.gz".to_string()];
        let jobs = UrlBuilder.jobs_for(&urls, &ctx).await.unwrap();
        assert_eq!(jobs.len(), 1);
        let args = jobs[0].command_spec().unwrap().arguments();
        assert_eq!(&args[..4], ["-s", "-f", "-L", "-o"]);
        assert!(args[4].ends_with("url0/reads.fq.gz"));
        assert_eq!(args[5], urls[0]);
    }

    #[tokio::test]
    async fn test_skips_index_already_in_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = BuildContext::new(
            dir.path().join("tmp"),
            dir.path().join("out"),
            Arc::new(RateLimiter::disabled()),
        )
        .unwrap();
        fs::create_dir_all(&ctx.out_dir).unwrap();
        fs::write(ctx.out_dir.join("url0_reads.fq.gz"), b"x").unwrap();
        let urls = vec![
            "ftp://ftp.example.org/pub/reads.fq.gz".to_string(),
            "ftp://ftp.example.org/pub/other.fq.gz".to_string(),
        ];
        let jobs = UrlBuilder.jobs_for(&urls, &ctx).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name(), "url1_download");
    }
}
