//! Logan assemblies from the public `logan-pub` bucket.
//!
//! Register entries look like `SRR000001_contigs` or `SRR000001_unitigs`; a
//! bare run accession means contigs.

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, instrument, warn};

use super::http::paced_head_status;
use super::{BuildContext, JobBuilder, RemoteCheck, SourceError, SourceKind, fresh_dir, path_arg};
use crate::artifact::{move_path, remove_dir_if_exists};
use crate::job::{CommandJob, Job};

#[allow(clippy::expect_used)]
static LOGAN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(SRR\d{6,})(?:_(contigs|unitigs))?$").expect("logan regex is valid") // Static pattern, safe to panic
});

/// Assembly flavour published by Logan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoganKind {
    Contigs,
    Unitigs,
}

impl LoganKind {
    fn bucket_prefix(self) -> &'static str {
        match self {
            Self::Contigs => "c",
            Self::Unitigs => "u",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Contigs => "contigs",
            Self::Unitigs => "unitigs",
        }
    }
}

/// Splits a register entry into run accession and flavour.
#[must_use]
pub fn parse_logan_accession(accession: &str) -> Option<(&str, LoganKind)> {
    let captures = LOGAN_PATTERN.captures(accession)?;
    let run = captures.get(1)?.as_str();
    let kind = match captures.get(2).map(|m| m.as_str()) {
        Some("unitigs") => LoganKind::Unitigs,
        _ => LoganKind::Contigs,
    };
    Some((run, kind))
}

/// Returns the bucket URL and file name for a register entry.
#[must_use]
pub fn logan_url(base: &str, accession: &str) -> Option<(String, String)> {
    let (run, kind) = parse_logan_accession(accession)?;
    let filename = format!("{run}.{}.fa.zst", kind.suffix());
    Some((
        format!("{base}/{}/{run}/{filename}", kind.bucket_prefix()),
        filename,
    ))
}

/// Builder for Logan contigs and unitigs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoganBuilder;

#[async_trait]
impl JobBuilder for LoganBuilder {
    fn source(&self) -> SourceKind {
        SourceKind::Logan
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["curl"]
    }

    fn is_valid_accession(&self, accession: &str) -> bool {
        LOGAN_PATTERN.is_match(accession)
    }

    /// Checks that each entry's file is published in the bucket.
    #[instrument(skip(self, accessions, ctx), fields(count = accessions.len()))]
    async fn confirm_remote(&self, accessions: &[String], ctx: &BuildContext) -> RemoteCheck {
        let mut check = RemoteCheck::default();
        for accession in accessions {
            let entry = std::slice::from_ref(accession);
            let Some((url, _)) = logan_url(&ctx.endpoints.logan, accession) else {
                check.record(entry, |_| false);
                continue;
            };
            match paced_head_status(ctx, SourceKind::Logan, &url).await {
                Ok(200) => check.record(entry, |_| true),
                Ok(403 | 404) => check.record(entry, |_| false),
                Ok(status) => {
                    warn!(url = %url, status, "unexpected Logan bucket status");
                    check.record_unchecked(entry);
                }
                Err(error) => {
                    warn!(url = %url, error = %error, "Logan bucket lookup failed");
                    check.record_unchecked(entry);
                }
            }
        }
        if !check.unknown.is_empty() {
            warn!(accessions = %check.unknown.join(", "), "entries not published by Logan");
        }
        check
    }

    #[instrument(skip(self, accessions, ctx), fields(count = accessions.len()))]
    async fn jobs_for(
        &self,
        accessions: &[String],
        ctx: &BuildContext,
    ) -> Result<Vec<Job>, SourceError> {
        let root = ctx.source_tmp(SourceKind::Logan);
        let mut jobs = Vec::new();
        for accession in accessions {
            let dirname = format!("logan_{accession}");
            if ctx.already_downloaded(&dirname) {
                continue;
            }
            let (url, filename) = logan_url(&ctx.endpoints.logan, accession)
                .ok_or_else(|| SourceError::invalid_accession(SourceKind::Logan, accession))?;
            let work_dir = root.join(&dirname);
            fresh_dir(&work_dir)?;
            jobs.push(accession_chain(accession, &dirname, &url, &work_dir.join(filename), ctx));
        }
        info!(jobs = jobs.len(), "created Logan jobs");
        Ok(jobs)
    }
}

fn accession_chain(
    accession: &str,
    dirname: &str,
    url: &str,
    file: &Path,
    ctx: &BuildContext,
) -> Job {
    let download = CommandJob::new(ctx.tools.program("curl"))
        .args(["-s", "-f", "-o"])
        .arg(path_arg(file))
        .arg(url);

    let work_dir = file.parent().map(Path::to_path_buf).unwrap_or_default();
    let cleanup_dir = work_dir.clone();
    let dest = ctx.out_dir.join(dirname);
    let relocate = Job::function(format!("{dirname}_move"), move || {
        move_path(&work_dir, &dest)?;
        Ok(())
    });
    let cleanup = Job::function(format!("{dirname}_cleanup"), move || {
        remove_dir_if_exists(&cleanup_dir)?;
        Ok(())
    });

    Job::command(format!("{dirname}_download"), download)
        .for_source(SourceKind::Logan)
        .with_accessions([accession])
        .on_failure(cleanup)
        .then(relocate)
}
