//! NCBI assemblies, downloaded with the `datasets` CLI.
//!
//! Accessions are grouped in batches. Each batch downloads a dehydrated
//! package, unzips it locally, rehydrates it (a second request to NCBI, so it
//! waits for the rate window again) and finally moves every assembly
//! directory to the output directory.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{
    BuildContext, JobBuilder, REMOTE_QUERY_SIZE, RemoteCheck, SourceError, SourceKind, fresh_dir,
    path_arg,
};
use crate::artifact::{move_path, remove_dir_if_exists};
use crate::job::{CommandJob, Job, JobError};

/// Accessions per `datasets download` call.
pub const NCBI_BATCH_SIZE: usize = 5;

#[allow(clippy::expect_used)]
static ASSEMBLY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^GC[AF]_\d{9}\.\d+$").expect("assembly regex is valid") // Static pattern, safe to panic
});

/// Builder for NCBI GenBank (`GCA_`) and RefSeq (`GCF_`) assemblies.
#[derive(Debug, Clone, Copy, Default)]
pub struct NcbiBuilder;

#[async_trait]
impl JobBuilder for NcbiBuilder {
    fn source(&self) -> SourceKind {
        SourceKind::Ncbi
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["datasets", "unzip"]
    }

    fn is_valid_accession(&self, accession: &str) -> bool {
        ASSEMBLY_PATTERN.is_match(accession)
    }

    /// Asks `datasets summary` which assemblies exist, 32 per call.
    #[instrument(skip(self, accessions, ctx), fields(count = accessions.len()))]
    async fn confirm_remote(&self, accessions: &[String], ctx: &BuildContext) -> RemoteCheck {
        let mut check = RemoteCheck::default();
        if ctx.tools.resolve("datasets").is_none() {
            warn!("datasets CLI not found, NCBI accessions not checked");
            check.record_unchecked(accessions);
            return check;
        }
        let program = ctx.tools.program("datasets");
        for slice in accessions.chunks(REMOTE_QUERY_SIZE) {
            match summary_accessions(ctx, &program, slice).await {
                Ok(known) => check.record(slice, |accession| known.contains(accession)),
                Err(message) => {
                    warn!(count = slice.len(), error = %message, "NCBI summary failed");
                    check.record_unchecked(slice);
                }
            }
        }
        if !check.unknown.is_empty() {
            warn!(accessions = %check.unknown.join(", "), "accessions not found on NCBI");
        }
        check
    }

    #[instrument(skip(self, accessions, ctx), fields(count = accessions.len()))]
    async fn jobs_for(
        &self,
        accessions: &[String],
        ctx: &BuildContext,
    ) -> Result<Vec<Job>, SourceError> {
        let pending: Vec<String> = accessions
            .iter()
            .filter(|accession| !ctx.already_downloaded(accession))
            .cloned()
            .collect();
        info!(
            pending = pending.len(),
            skipped = accessions.len() - pending.len(),
            "creating NCBI jobs"
        );

        let root = ctx.source_tmp(SourceKind::Ncbi);
        pending
            .chunks(NCBI_BATCH_SIZE)
            .enumerate()
            .map(|(index, batch)| batch_chain(index, batch, &root, ctx))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct SummaryReport {
    #[serde(default)]
    reports: Vec<SummaryEntry>,
}

#[derive(Debug, Deserialize)]
struct SummaryEntry {
    accession: String,
}

/// Extracts the accessions listed by `datasets summary genome`.
///
/// # Errors
///
/// Returns the JSON error if the output is not a summary document.
pub fn parse_summary_accessions(output: &str) -> Result<HashSet<String>, serde_json::Error> {
    let summary: SummaryReport = serde_json::from_str(output)?;
    Ok(summary
        .reports
        .into_iter()
        .map(|entry| entry.accession)
        .collect())
}

async fn summary_accessions(
    ctx: &BuildContext,
    program: &str,
    slice: &[String],
) -> Result<HashSet<String>, String> {
    ctx.limiter.acquire(SourceKind::Ncbi).await;
    debug!(count = slice.len(), "NCBI summary request");
    let output = Command::new(program)
        .args(["summary", "genome", "accession"])
        .args(slice)
        .output()
        .await
        .map_err(|e| format!("could not run {program}: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    parse_summary_accessions(&String::from_utf8_lossy(&output.stdout))
        .map_err(|e| format!("unreadable summary: {e}"))
}

fn batch_chain(
    index: usize,
    batch: &[String],
    root: &Path,
    ctx: &BuildContext,
) -> Result<Job, SourceError> {
    let name = format!("ncbi_batch{index}");
    let batch_dir = root.join(&name);
    fresh_dir(&batch_dir)?;

    let archive = batch_dir.join(format!("{name}.zip"));
    let dataset_dir = batch_dir.join("dataset");

    let datasets = ctx.tools.program("datasets");
    let download = CommandJob::new(&datasets)
        .args([
            "download",
            "genome",
            "accession",
            "--dehydrated",
            "--no-progressbar",
            "--filename",
        ])
        .arg(path_arg(&archive))
        .args(batch);
    let unzip = CommandJob::new(ctx.tools.program("unzip"))
        .arg("-n")
        .arg(path_arg(&archive))
        .arg("-d")
        .arg(path_arg(&dataset_dir));
    let rehydrate = CommandJob::new(datasets)
        .args(["rehydrate", "--gzip", "--no-progressbar", "--directory"])
        .arg(path_arg(&dataset_dir));

    let data_dir = dataset_dir.join("ncbi_dataset").join("data");
    let out_dir = ctx.out_dir.clone();
    let move_batch_dir = batch_dir.clone();
    let moved = batch.to_vec();
    let relocate = Job::function(format!("{name}_move"), move || {
        relocate_batch(&data_dir, &out_dir, &moved)?;
        remove_dir_if_exists(&move_batch_dir)?;
        Ok(())
    });
    let cleanup = Job::function(format!("{name}_cleanup"), move || {
        remove_dir_if_exists(&batch_dir)?;
        Ok(())
    });

    Ok(Job::command(format!("{name}_download"), download)
        .for_source(SourceKind::Ncbi)
        .with_accessions(batch.iter().cloned())
        .on_failure(cleanup)
        .then(Job::command(format!("{name}_unzip"), unzip))
        .then_paced(Job::command(format!("{name}_rehydrate"), rehydrate))
        .then(relocate))
}

/// Moves `<data_dir>/<acc>/` to `<out_dir>/<acc>/` for every accession.
///
/// The batch is published whole or not at all: a package missing any
/// accession moves nothing, and a failed move takes back the directories
/// already published.
fn relocate_batch(data_dir: &Path, out_dir: &Path, accessions: &[String]) -> Result<(), JobError> {
    let missing: Vec<&str> = accessions
        .iter()
        .filter(|accession| !data_dir.join(accession).is_dir())
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(JobError::failed(format!(
            "assemblies missing from NCBI package: {}",
            missing.join(", ")
        )));
    }

    let mut published: Vec<std::path::PathBuf> = Vec::with_capacity(accessions.len());
    for accession in accessions {
        let dest = out_dir.join(accession);
        if let Err(error) = move_path(&data_dir.join(accession), &dest) {
            for path in &published {
                if let Err(error) = remove_dir_if_exists(path) {
                    warn!(path = %path.display(), error = %error, "could not withdraw partial batch");
                }
            }
            return Err(error.into());
        }
        published.push(dest);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;

    use crate::scheduler::RateLimiter;

    fn context(dir: &Path) -> BuildContext {
        BuildContext::new(
            dir.join("tmp"),
            dir.join("out"),
            Arc::new(RateLimiter::disabled()),
        )
        .unwrap()
    }

    fn accessions(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("GCA_{:09}.1", i + 1)).collect()
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_assembly_formats() {
        let builder = NcbiBuilder;
        assert!(builder.is_valid_accession("GCA_000001405.29"));
        assert!(builder.is_valid_accession("GCF_000001405.40"));
        assert!(!builder.is_valid_accession("GCA_00000140.29"));
        assert!(!builder.is_valid_accession("GCA_000001405"));
        assert!(!builder.is_valid_accession("GCX_000001405.1"));
        assert!(!builder.is_valid_accession("xGCA_000001405.1"));
    }

    #[test]
    fn test_parse_summary_accessions() {
        let output = r#"{"reports":[{"accession":"GCA_000001405.29","current_accession":"GCA_000001405.29"},{"accession":"GCF_000001635.27"}],"total_count":2}"#;
        let known = parse_summary_accessions(output).unwrap();
        assert_eq!(known.len(), 2);
        assert!(known.contains("GCF_000001635.27"));

        assert!(parse_summary_accessions(r#"{"total_count":0}"#).unwrap().is_empty());
        assert!(parse_summary_accessions("Error: invalid accession").is_err());
    }

    // ==================== Job Construction Tests ====================

    #[tokio::test]
    async fn test_batches_of_five() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        let jobs = NcbiBuilder.jobs_for(&accessions(12), &ctx).await.unwrap();

        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].accessions().len(), 5);
        assert_eq!(jobs[2].accessions().len(), 2);
        let names: Vec<&str> = jobs[0].chain().map(Job::name).collect();
        assert_eq!(
            names,
            [
                "ncbi_batch0_download",
                "ncbi_batch0_unzip",
                "ncbi_batch0_rehydrate",
                "ncbi_batch0_move"
            ]
        );
        assert!(dir.path().join("tmp/ncbi/ncbi_batch0").is_dir());
    }

    #[tokio::test]
    async fn test_download_command_line() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        let jobs = NcbiBuilder.jobs_for(&accessions(2), &ctx).await.unwrap();
        let command = jobs[0].command_spec().unwrap();
        assert_eq!(command.program(), "datasets");
        let args = command.arguments();
        assert_eq!(&args[..5], ["download", "genome", "accession", "--dehydrated", "--no-progressbar"]);
        assert!(args[6].ends_with("ncbi_batch0.zip"));
        assert_eq!(&args[7..], ["GCA_000000001.1", "GCA_000000002.1"]);
    }

    #[tokio::test]
    async fn test_skips_downloaded_accessions() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        fs::create_dir_all(ctx.out_dir.join("GCA_000000001.1")).unwrap();
        let jobs = NcbiBuilder.jobs_for(&accessions(2), &ctx).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].accessions(), ["GCA_000000002.1"]);

        fs::create_dir_all(ctx.out_dir.join("GCA_000000002.1")).unwrap();
        assert!(NcbiBuilder.jobs_for(&accessions(2), &ctx).await.unwrap().is_empty());
    }

    #[test]
    fn test_relocate_batch_reports_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(data.join("GCA_000000001.1")).unwrap();
        fs::write(data.join("GCA_000000001.1/genome.fna.gz"), b"x").unwrap();
        let out = dir.path().join("out");

        let err = relocate_batch(&data, &out, &accessions(2)).unwrap_err();
        assert!(err.to_string().contains("GCA_000000002.1"));
        assert!(!out.join("GCA_000000001.1").exists());
        assert!(data.join("GCA_000000001.1/genome.fna.gz").exists());
    }

    #[test]
    fn test_relocate_batch_withdraws_on_failed_move() {
        let dir = tempfile::TempDir::new().unwrap();
        let data = dir.path().join("data");
        for accession in accessions(2) {
            fs::create_dir_all(data.join(&accession)).unwrap();
            fs::write(data.join(&accession).join("genome.fna.gz"), b"x").unwrap();
        }
        let out = dir.path().join("out");
        fs::create_dir_all(out.join("GCA_000000002.1")).unwrap();
        fs::write(out.join("GCA_000000002.1/occupied"), b"y").unwrap();

        let err = relocate_batch(&data, &out, &accessions(2)).unwrap_err();
        assert_eq!(err.kind(), crate::job::FailureKind::Io);
        assert!(!out.join("GCA_000000001.1").exists());
        assert!(out.join("GCA_000000002.1/occupied").exists());
    }

    #[test]
    fn test_relocate_batch_moves_every_assembly() {
        let dir = tempfile::TempDir::new().unwrap();
        let data = dir.path().join("data");
        for accession in accessions(2) {
            fs::create_dir_all(data.join(&accession)).unwrap();
        }
        let out = dir.path().join("out");
        relocate_batch(&data, &out, &accessions(2)).unwrap();
        assert!(out.join("GCA_000000001.1").is_dir());
        assert!(out.join("GCA_000000002.1").is_dir());
    }
}
