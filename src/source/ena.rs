//! ENA reads and assemblies, downloaded over HTTPS with `curl`.
//!
//! Read accessions are expanded through the ENA file report, which lists the
//! FASTQ files of every run together with their MD5. Every file is a paced
//! `curl` step of the accession's chain; the last step verifies all digests
//! before anything is moved to the output directory.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use super::http::paced_get_text;
use super::sra::is_read_accession;
use super::{
    BuildContext, JobBuilder, REMOTE_QUERY_SIZE, RemoteCheck, SourceError, SourceKind, failing_job,
    fresh_dir, path_arg,
};
use crate::artifact::{
    ExpectedDigest, StagedDir, move_matching, move_path, remove_dir_if_exists, verify_digest,
};
use crate::job::{CommandJob, Job, JobError};

#[allow(clippy::expect_used)]
static ENA_ASSEMBLY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^GC[AF]_\d{9}\.\d+$").expect("assembly regex is valid") // Static pattern, safe to panic
});

/// Query flags of the browser XML lookup.
const XML_QUERY: [(&str, &str); 3] = [
    ("download", "false"),
    ("gzip", "false"),
    ("includeLinks", "false"),
];

/// Fields requested from the file report.
pub const FILE_REPORT_FIELDS: &str = "run_accession,fastq_ftp,fastq_md5";

/// One file listed by the ENA file report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Download URL.
    pub url: String,
    /// File name inside the accession directory.
    pub filename: String,
    /// Published MD5.
    pub md5: String,
}

/// Builder for ENA read runs, studies, samples and assemblies.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnaBuilder;

#[async_trait]
impl JobBuilder for EnaBuilder {
    fn source(&self) -> SourceKind {
        SourceKind::Ena
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["curl", "gzip"]
    }

    fn is_valid_accession(&self, accession: &str) -> bool {
        is_read_accession(accession) || ENA_ASSEMBLY_PATTERN.is_match(accession)
    }

    /// Looks accessions up in the ENA browser, 32 per request.
    ///
    /// A slice answered with an error document is retried one accession at a
    /// time, so one unknown accession does not reject its neighbours.
    #[instrument(skip(self, accessions, ctx), fields(count = accessions.len()))]
    async fn confirm_remote(&self, accessions: &[String], ctx: &BuildContext) -> RemoteCheck {
        let mut check = RemoteCheck::default();
        for slice in accessions.chunks(REMOTE_QUERY_SIZE) {
            match xml_lookup(ctx, slice).await {
                Ok(Some(body)) => check.record(slice, |accession| body.contains(accession)),
                Ok(None) if slice.len() > 1 => {
                    for accession in slice {
                        let single = std::slice::from_ref(accession);
                        match xml_lookup(ctx, single).await {
                            Ok(found) => check.record(single, |_| found.is_some()),
                            Err(error) => {
                                warn!(accession = %accession, error = %error, "ENA lookup failed");
                                check.record_unchecked(single);
                            }
                        }
                    }
                }
                Ok(None) => check.record(slice, |_| false),
                Err(error) => {
                    warn!(count = slice.len(), error = %error, "ENA lookup failed");
                    check.record_unchecked(slice);
                }
            }
        }
        if !check.unknown.is_empty() {
            warn!(accessions = %check.unknown.join(", "), "accessions not found on ENA");
        }
        check
    }

    #[instrument(skip(self, accessions, ctx), fields(count = accessions.len()))]
    async fn jobs_for(
        &self,
        accessions: &[String],
        ctx: &BuildContext,
    ) -> Result<Vec<Job>, SourceError> {
        let root = ctx.source_tmp(SourceKind::Ena);
        let curl = ctx.tools.program("curl");
        let mut jobs = Vec::new();
        for accession in accessions {
            if ctx.already_downloaded(accession) {
                debug!(accession = %accession, "already downloaded");
                continue;
            }
            let work_dir = root.join(accession);
            fresh_dir(&work_dir)?;
            let dest = ctx.out_dir.join(accession);

            if ENA_ASSEMBLY_PATTERN.is_match(accession) {
                jobs.push(assembly_chain(accession, ctx, work_dir, dest));
                continue;
            }

            match file_report(ctx, accession).await {
                Ok(files) if files.is_empty() => jobs.push(failing_job(
                    format!("ena_{accession}_report"),
                    SourceKind::Ena,
                    accession,
                    format!("ENA lists no FASTQ file for {accession}"),
                )),
                Ok(files) => jobs.push(reads_chain(accession, &files, &curl, work_dir, dest)),
                Err(error) => {
                    warn!(accession = %accession, error = %error, "ENA file report failed");
                    jobs.push(failing_job(
                        format!("ena_{accession}_report"),
                        SourceKind::Ena,
                        accession,
                        error.to_string(),
                    ));
                }
            }
        }
        info!(jobs = jobs.len(), "created ENA jobs");
        Ok(jobs)
    }
}

/// Fetches the browser XML of `slice`. `None` means ENA answered with an
/// error document or a 404.
async fn xml_lookup(ctx: &BuildContext, slice: &[String]) -> Result<Option<String>, SourceError> {
    let url = format!("{}/xml/{}", ctx.endpoints.ena_browser, slice.join(","));
    match paced_get_text(ctx, SourceKind::Ena, &url, &XML_QUERY).await {
        Ok(body) if body.contains("ErrorDetails") => {
            debug!(url = %url, "ENA returned an error document");
            Ok(None)
        }
        Ok(body) => Ok(Some(body)),
        Err(SourceError::HttpStatus { status: 404, .. }) => Ok(None),
        Err(error) => Err(error),
    }
}

/// Queries the file report of `accession`.
async fn file_report(ctx: &BuildContext, accession: &str) -> Result<Vec<RemoteFile>, SourceError> {
    let url = format!("{}/filereport", ctx.endpoints.ena_portal);
    let body = paced_get_text(
        ctx,
        SourceKind::Ena,
        &url,
        &[
            ("accession", accession),
            ("result", "read_run"),
            ("fields", FILE_REPORT_FIELDS),
            ("format", "tsv"),
        ],
    )
    .await?;
    parse_file_report(accession, &body)
}

/// Parses a tab-separated file report.
///
/// Runs without FASTQ links are skipped with a warning. Empty entries in the
/// `;`-separated lists are ignored. URLs without a scheme are fetched over
/// HTTPS.
///
/// # Errors
///
/// Returns [`SourceError::InvalidResponse`] if the header lacks the
/// requested columns, a row lists a different number of files and digests,
/// or a link does not end in a file name.
pub fn parse_file_report(accession: &str, body: &str) -> Result<Vec<RemoteFile>, SourceError> {
    let mut lines = body.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
    let column = |name: &str| {
        columns
            .iter()
            .position(|column| *column == name)
            .ok_or_else(|| {
                SourceError::invalid_response(SourceKind::Ena, accession, format!("missing column '{name}'"))
            })
    };
    let run_idx = column("run_accession")?;
    let ftp_idx = column("fastq_ftp")?;
    let md5_idx = column("fastq_md5")?;

    let mut files = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        let field = |idx: usize| fields.get(idx).copied().map_or("", str::trim);
        let links = field(ftp_idx);
        if links.is_empty() {
            warn!(accession, run = field(run_idx), "run has no FASTQ link");
            continue;
        }
        let urls = split_list(links);
        let digests = split_list(field(md5_idx));
        if urls.len() != digests.len() {
            return Err(SourceError::invalid_response(
                SourceKind::Ena,
                accession,
                format!("{} links but {} digests for run {}", urls.len(), digests.len(), field(run_idx)),
            ));
        }
        for (link, md5) in urls.into_iter().zip(digests) {
            let url = if link.contains("://") {
                link.to_string()
            } else {
                format!("https://{link}")
            };
            let filename = link.rsplit('/').next().unwrap_or(link).to_string();
            if filename.is_empty() {
                return Err(SourceError::invalid_response(
                    SourceKind::Ena,
                    accession,
                    format!("link '{link}' has no file name"),
                ));
            }
            files.push(RemoteFile {
                url,
                filename,
                md5: md5.to_string(),
            });
        }
    }
    Ok(files)
}

fn split_list(value: &str) -> Vec<&str> {
    value
        .split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect()
}

fn reads_chain(
    accession: &str,
    files: &[RemoteFile],
    curl: &str,
    work_dir: PathBuf,
    dest: PathBuf,
) -> Job {
    let name = format!("ena_{accession}");
    let downloads: Vec<Job> = files
        .iter()
        .map(|file| {
            let command = CommandJob::new(curl)
                .args(["-s", "-f", "-o"])
                .arg(path_arg(&work_dir.join(&file.filename)))
                .arg(file.url.as_str());
            Job::command(format!("{name}_{}", file.filename), command)
        })
        .collect();

    let expected: Vec<(String, ExpectedDigest)> = files
        .iter()
        .map(|file| (file.filename.clone(), ExpectedDigest::Md5(file.md5.clone())))
        .collect();
    let verify_dir = work_dir.clone();
    let relocate = Job::function(format!("{name}_move"), move || {
        verify_and_relocate(&verify_dir, &dest, &expected)
    });
    let cleanup = Job::function(format!("{name}_cleanup"), move || {
        remove_dir_if_exists(&work_dir)?;
        Ok(())
    });

    let mut steps = downloads.into_iter();
    // files is never empty here
    let head = steps
        .next()
        .unwrap_or_else(|| Job::function(format!("{name}_noop"), || Ok(())));
    let chain = head
        .for_source(SourceKind::Ena)
        .with_accessions([accession])
        .on_failure(cleanup);
    steps
        .fold(chain, Job::then_paced)
        .then(relocate)
}

/// Checks every digest, then publishes the files as `dest`.
///
/// Nothing is moved unless every file matches; on a mismatch the work
/// directory is removed. The files are gathered in a stage first, so `dest`
/// appears complete or not at all.
fn verify_and_relocate(
    work_dir: &Path,
    dest: &Path,
    expected: &[(String, ExpectedDigest)],
) -> Result<(), JobError> {
    for (filename, digest) in expected {
        if let Err(error) = verify_digest(&work_dir.join(filename), digest) {
            warn!(dir = %work_dir.display(), error = %error, "ENA download rejected");
            remove_dir_if_exists(work_dir)?;
            return Err(error.into());
        }
    }
    let staged = StagedDir::new(dest)?;
    for (filename, _) in expected {
        move_path(&work_dir.join(filename), &staged.path().join(filename))?;
    }
    staged.publish()?;
    remove_dir_if_exists(work_dir)?;
    Ok(())
}

fn assembly_chain(accession: &str, ctx: &BuildContext, work_dir: PathBuf, dest: PathBuf) -> Job {
    let name = format!("ena_{accession}");
    let fasta = work_dir.join(format!("{accession}.fa"));
    let download = CommandJob::new(ctx.tools.program("curl"))
        .args(["-s", "-f", "-o"])
        .arg(path_arg(&fasta))
        .arg(format!("{}/fasta/{accession}", ctx.endpoints.ena_browser));
    let compress = CommandJob::new(ctx.tools.program("gzip")).arg(path_arg(&fasta));

    let move_dir = work_dir.clone();
    let relocate = Job::function(format!("{name}_move"), move || {
        let staged = StagedDir::new(&dest)?;
        if move_matching(&move_dir, staged.path(), ".fa.gz")?.is_empty() {
            return Err(JobError::failed(format!("no FASTA produced in {}", move_dir.display())));
        }
        staged.publish()?;
        remove_dir_if_exists(&move_dir)?;
        Ok(())
    });
    let cleanup = Job::function(format!("{name}_cleanup"), move || {
        remove_dir_if_exists(&work_dir)?;
        Ok(())
    });

    Job::command(format!("{name}_download"), download)
        .for_source(SourceKind::Ena)
        .with_accessions([accession])
        .on_failure(cleanup)
        .then(Job::command(format!("{name}_gzip"), compress))
        .then(relocate)
}
