//! SRA reads, downloaded with the SRA toolkit.
//!
//! `prefetch` places one directory per run under the accession's work
//! directory. A run accession yields a single run directory; experiments and
//! studies yield one per run, and every run directory is dumped in turn.

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, instrument};

use super::{BuildContext, JobBuilder, SourceError, SourceKind, fresh_dir, path_arg};
use crate::artifact::{StagedDir, move_matching, remove_dir_if_exists};
use crate::job::{CommandJob, Job, JobError};

/// Run, experiment, study and sample accessions from the INSDC read archives.
#[allow(clippy::expect_used)]
static READ_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[SED]R[RPSXA]\d{6,}|PRJ[EDN][A-Z]\d+|SAM[EDN][A-Z]?\d+)$")
        .expect("read archive regex is valid") // Static pattern, safe to panic
});

/// Runs, experiments and studies, the accessions `prefetch` resolves to runs.
#[allow(clippy::expect_used)]
static SRA_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[SED]R([RXP])\d{6,}$").expect("sra regex is valid") // Static pattern, safe to panic
});

/// Dumps every run directory under `$2` with the `fasterq-dump` at `$1`.
const DUMP_RUNS_SCRIPT: &str = r#"fqd="$1"; work="$2"; found=0
for run in "$work"/*/; do
  [ -d "$run" ] || continue
  run="${run%/}"
  "$fqd" --split-3 --skip-technical --outdir "$run" "$run" || exit 1
  found=1
done
[ "$found" = 1 ] || { echo "no run directory under $work" >&2; exit 1; }"#;

/// Returns true for read archive accessions shared by SRA and ENA.
pub(crate) fn is_read_accession(accession: &str) -> bool {
    READ_PATTERN.is_match(accession)
}

fn is_run_accession(accession: &str) -> bool {
    SRA_PATTERN
        .captures(accession)
        .and_then(|captures| captures.get(1))
        .is_some_and(|level| level.as_str() == "R")
}

/// Builder for SRA reads: `prefetch`, `fasterq-dump`, compression, move.
#[derive(Debug, Clone, Copy, Default)]
pub struct SraBuilder;

#[async_trait]
impl JobBuilder for SraBuilder {
    fn source(&self) -> SourceKind {
        SourceKind::Sra
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["prefetch", "fasterq-dump", "gzip", "find", "sh"]
    }

    fn is_valid_accession(&self, accession: &str) -> bool {
        SRA_PATTERN.is_match(accession)
    }

    #[instrument(skip(self, accessions, ctx), fields(count = accessions.len()))]
    async fn jobs_for(
        &self,
        accessions: &[String],
        ctx: &BuildContext,
    ) -> Result<Vec<Job>, SourceError> {
        let root = ctx.source_tmp(SourceKind::Sra);
        let mut jobs = Vec::new();
        for accession in accessions {
            if ctx.already_downloaded(accession) {
                continue;
            }
            jobs.push(accession_chain(accession, &root, ctx)?);
        }
        info!(jobs = jobs.len(), skipped = accessions.len() - jobs.len(), "created SRA jobs");
        Ok(jobs)
    }
}

fn accession_chain(accession: &str, root: &Path, ctx: &BuildContext) -> Result<Job, SourceError> {
    let name = format!("sra_{accession}");
    let work_dir = root.join(accession);
    fresh_dir(&work_dir)?;

    let prefetch = CommandJob::new(ctx.tools.program("prefetch"))
        .args(["--max-size", "u", "--output-directory"])
        .arg(path_arg(&work_dir))
        .arg(accession);
    let fasterq_dump = ctx.tools.program("fasterq-dump");
    let dump = if is_run_accession(accession) {
        let run_dir = work_dir.join(accession);
        CommandJob::new(fasterq_dump)
            .args(["--split-3", "--skip-technical", "--outdir"])
            .arg(path_arg(&run_dir))
            .arg(path_arg(&run_dir))
    } else {
        CommandJob::new(ctx.tools.program("sh"))
            .args(["-c", DUMP_RUNS_SCRIPT, "sh"])
            .arg(fasterq_dump)
            .arg(path_arg(&work_dir))
    };
    let compress = CommandJob::new(ctx.tools.program("find"))
        .arg(path_arg(&work_dir))
        .args(["-name", "*.fastq", "-exec"])
        .arg(ctx.tools.program("gzip"))
        .args(["{}", "+"]);

    let dest = ctx.out_dir.join(accession);
    let move_work_dir = work_dir.clone();
    let relocate = Job::function(format!("{name}_move"), move || {
        relocate_reads(&move_work_dir, &dest)
    });
    let cleanup = Job::function(format!("{name}_cleanup"), move || {
        remove_dir_if_exists(&work_dir)?;
        Ok(())
    });

    Ok(Job::command(format!("{name}_prefetch"), prefetch)
        .for_source(SourceKind::Sra)
        .with_accessions([accession])
        .on_failure(cleanup)
        .then_paced(Job::command(format!("{name}_fasterqdump"), dump))
        .then(Job::command(format!("{name}_compress"), compress))
        .then(relocate))
}

/// Publishes the compressed reads of every run directory as `dest`.
fn relocate_reads(work_dir: &Path, dest: &Path) -> Result<(), JobError> {
    let staged = StagedDir::new(dest)?;
    if move_matching(work_dir, staged.path(), ".gz")?.is_empty() {
        return Err(JobError::failed(format!(
            "no compressed reads produced in {}",
            work_dir.display()
        )));
    }
    staged.publish()?;
    remove_dir_if_exists(work_dir)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;

    use crate::job::Pacing;
    use crate::scheduler::RateLimiter;
    use crate::source::{Toolbox, find_executable};

    fn context(dir: &Path) -> BuildContext {
        BuildContext::new(dir.join("tmp"), dir.join("out"), Arc::new(RateLimiter::disabled())).unwrap()
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_read_accession_formats() {
        for valid in ["SRR000001", "ERR1234567", "DRR123456", "SRX000001", "PRJNA123456", "SAMN00000001", "SAMEA1234"] {
            assert!(is_read_accession(valid), "{valid}");
        }
        for invalid in ["SRR12345", "GCA_000001405.1", "SRR000001_contigs", "srr000001", ""] {
            assert!(!is_read_accession(invalid), "{invalid}");
        }
    }

    #[test]
    fn test_sra_accepts_what_prefetch_resolves() {
        let builder = SraBuilder;
        for valid in ["SRR000001", "ERR1234567", "DRR123456", "SRX000001", "SRP000001", "ERX000001"] {
            assert!(builder.is_valid_accession(valid), "{valid}");
        }
        for invalid in ["PRJNA123456", "SAMN00000001", "SRS000001", "SRA000001", "SRR12345"] {
            assert!(!builder.is_valid_accession(invalid), "{invalid}");
        }
        assert!(is_run_accession("DRR123456"));
        assert!(!is_run_accession("SRX000001"));
        assert!(!is_run_accession("SRP000001"));
    }

    // ==================== Job Construction Tests ====================

    #[tokio::test]
    async fn test_one_chain_per_accession() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        fs::create_dir_all(ctx.out_dir.join("SRR000002")).unwrap();

        let accessions = vec!["SRR000001".to_string(), "SRR000002".to_string()];
        let mut jobs = SraBuilder.jobs_for(&accessions, &ctx).await.unwrap();
        assert_eq!(jobs.len(), 1);

        let mut job = jobs.remove(0);
        assert_eq!(job.source(), Some(SourceKind::Sra));
        let steps: Vec<&str> = job.chain().map(Job::name).collect();
        assert_eq!(
            steps,
            ["sra_SRR000001_prefetch", "sra_SRR000001_fasterqdump", "sra_SRR000001_compress", "sra_SRR000001_move"]
        );
        let prefetch = job.command_spec().unwrap();
        assert!(prefetch.program().ends_with("prefetch"));
        assert_eq!(prefetch.arguments().last().unwrap(), "SRR000001");
        assert!(dir.path().join("tmp/sra/SRR000001").is_dir());

        let dump = job.take_follow_up().unwrap();
        assert_eq!(dump.pacing, Pacing::Source);
        assert_eq!(dump.job.name(), "sra_SRR000001_fasterqdump");
    }

    #[tokio::test]
    async fn test_experiment_dumps_every_run_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        let jobs = SraBuilder
            .jobs_for(&["SRX000001".to_string()], &ctx)
            .await
            .unwrap();
        let dump = jobs[0].chain().nth(1).unwrap().command_spec().unwrap();
        assert!(dump.program().ends_with("sh"));
        assert_eq!(dump.arguments()[1], DUMP_RUNS_SCRIPT);
        assert!(dump.arguments()[3].ends_with("fasterq-dump"));
        assert!(dump.arguments()[4].ends_with("tmp/sra/SRX000001"));
    }

    #[test]
    fn test_relocate_reads_fails_without_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let work = dir.path().join("SRX1");
        fs::create_dir_all(work.join("SRR11")).unwrap();
        let dest = dir.path().join("out").join("SRX1");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();

        let err = relocate_reads(&work, &dest).unwrap_err();
        assert!(err.to_string().contains("no compressed reads"));
        assert!(!dest.exists());
    }

    // ==================== Pipeline Tests ====================

    #[cfg(unix)]
    fn stub_tool(dir: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipeline_with_stub_toolkit() {
        if find_executable("prefetch").is_some() || find_executable("fasterq-dump").is_some() {
            return;
        }
        if ["sh", "gzip", "find"].iter().any(|tool| find_executable(tool).is_none()) {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        stub_tool(
            &bin,
            "prefetch",
            r#"dir="$4"; acc="$5"
case "$acc" in
  SRX*) runs="SRR0000011 SRR0000012" ;;
  *) runs="$acc" ;;
esac
for run in $runs; do mkdir -p "$dir/$run" && echo sra > "$dir/$run/$run.sra"; done"#,
        );
        stub_tool(
            &bin,
            "fasterq-dump",
            r#"name=$(basename "$5")
printf '@r1\nACGT\n+\nIIII\n' > "$4/${name}_1.fastq""#,
        );

        let ctx = context(dir.path()).with_tools(Toolbox::with_bin_dir(&bin));
        assert!(ctx.tools.missing(&SraBuilder).is_empty());
        let accessions = vec!["SRX000001".to_string(), "SRR000001".to_string()];
        let jobs = SraBuilder.jobs_for(&accessions, &ctx).await.unwrap();
        let report = crate::scheduler::run(jobs, 2, Arc::new(RateLimiter::disabled()))
            .await
            .unwrap();

        assert!(report.is_success(), "{:?}", report.failures);
        let out = dir.path().join("out");
        assert!(out.join("SRX000001/SRR0000011_1.fastq.gz").is_file());
        assert!(out.join("SRX000001/SRR0000012_1.fastq.gz").is_file());
        assert!(out.join("SRR000001/SRR000001_1.fastq.gz").is_file());
        assert!(!dir.path().join("tmp/sra/SRX000001").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_experiment_without_runs_fails() {
        if find_executable("prefetch").is_some() || find_executable("sh").is_none() {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        stub_tool(&bin, "prefetch", "exit 0");
        stub_tool(&bin, "fasterq-dump", "exit 0");

        let ctx = context(dir.path()).with_tools(Toolbox::with_bin_dir(&bin));
        let jobs = SraBuilder
            .jobs_for(&["SRP000001".to_string()], &ctx)
            .await
            .unwrap();
        let report = crate::scheduler::run(jobs, 1, Arc::new(RateLimiter::disabled()))
            .await
            .unwrap();

        assert!(report.failed.contains("SRP000001"));
        assert!(report.failures[0].message.contains("no run directory"), "{}", report.failures[0].message);
        assert!(!dir.path().join("out/SRP000001").exists());
        assert!(!dir.path().join("tmp/sra/SRP000001").exists());
    }
}
