//! Scheduler behaviour with real `sh` subprocesses.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use seqdd_core::artifact::{ExpectedDigest, verify_and_move};
use seqdd_core::job::{CommandJob, FailureKind, Job};
use seqdd_core::scheduler::{RateLimiter, Scheduler};
use seqdd_core::source::SourceKind;
use tempfile::TempDir;

fn sh(name: &str, script: &str, source: SourceKind, accession: &str) -> Job {
    Job::command(name, CommandJob::new("sh").args(["-c", script]))
        .for_source(source)
        .with_accessions([accession])
}

fn unpaced() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::disabled())
}

// ==================== Failure Tests ====================

#[tokio::test]
async fn test_failed_command_reports_stderr_and_skips_follow_up() {
    let follow_up_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&follow_up_ran);
    let job = sh("sra_SRR000001_prefetch", "echo 'no such run' >&2; exit 1", SourceKind::Sra, "SRR000001")
        .then(Job::function("sra_SRR000001_move", move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }));
    let ok = sh("sra_SRR000002_prefetch", "exit 0", SourceKind::Sra, "SRR000002");

    let mut scheduler = Scheduler::new(2, unpaced()).unwrap();
    scheduler.submit_all([job, ok]).unwrap();
    let report = scheduler.run().await;

    assert!(!follow_up_ran.load(Ordering::SeqCst));
    assert!(report.failed.contains("SRR000001"));
    assert!(report.succeeded.contains("SRR000002"));
    let record = &report.failures[0];
    assert_eq!(record.kind, FailureKind::ProcessExit);
    assert_eq!(record.job, "sra_SRR000001_prefetch");
    assert!(record.message.contains("no such run"), "{}", record.message);
}

#[tokio::test]
async fn test_missing_program_fails_without_aborting_batch() {
    let missing = Job::command("url0_download", CommandJob::new("seqdd-no-such-program"))
        .for_source(SourceKind::Url)
        .with_accessions(["https://example.org/a"]);
    let ok = sh("url1_download", "true", SourceKind::Url, "https://example.org/b");

    let report = seqdd_core::scheduler::run([missing, ok], 2, unpaced()).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, FailureKind::ProcessLaunch);
    assert!(report.succeeded.contains("https://example.org/b"));
}

#[tokio::test]
async fn test_cleanup_runs_after_failed_step() {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    fs::create_dir_all(&work).unwrap();
    let cleanup_dir = work.clone();

    let job = sh("logan_a_download", "exit 3", SourceKind::Logan, "SRR000001_contigs").on_failure(
        Job::function("logan_a_cleanup", move || {
            fs::remove_dir_all(&cleanup_dir).map_err(|e| seqdd_core::JobError::io(&cleanup_dir, e))
        }),
    );
    let report = seqdd_core::scheduler::run([job], 1, unpaced()).await.unwrap();
    assert!(report.failed.contains("SRR000001_contigs"));
    assert!(!work.exists());
}

// ==================== Checksum Tests ====================

#[tokio::test]
async fn test_checksum_mismatch_fails_chain_and_removes_temp_file() {
    let dir = TempDir::new().unwrap();
    let good_tmp = dir.path().join("good.part");
    let bad_tmp = dir.path().join("bad.part");
    let good_dest = dir.path().join("out/good.fq.gz");
    let bad_dest = dir.path().join("out/bad.fq.gz");

    let chain = |name: &str, accession: &str, tmp: &std::path::Path, dest: &std::path::Path, digest: &str| {
        let script = format!("printf 'hello\\n' > '{}'", tmp.display());
        let (tmp, dest) = (tmp.to_path_buf(), dest.to_path_buf());
        let expected = ExpectedDigest::Md5(digest.to_string());
        sh(&format!("{name}_download"), &script, SourceKind::Ena, accession).then(Job::function(
            format!("{name}_verify"),
            move || Ok(verify_and_move(&tmp, &dest, Some(&expected))?),
        ))
    };
    let jobs = [
        chain("ena_good", "ERR000001", &good_tmp, &good_dest, "b1946ac92492d2347c6235b4d2611184"),
        chain("ena_bad", "ERR000002", &bad_tmp, &bad_dest, "00000000000000000000000000000000"),
    ];

    let report = seqdd_core::scheduler::run(jobs, 2, unpaced()).await.unwrap();

    assert!(report.succeeded.contains("ERR000001"));
    assert_eq!(fs::read_to_string(&good_dest).unwrap(), "hello\n");
    assert!(report.failed.contains("ERR000002"));
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, FailureKind::ChecksumMismatch);
    assert!(!bad_tmp.exists());
    assert!(!bad_dest.exists());
}

// ==================== Capacity Tests ====================

#[tokio::test]
async fn test_single_process_never_overlaps() {
    let mut jobs = Vec::new();
    for i in 0..3 {
        jobs.push(sh(&format!("sra_{i}"), "sleep 0.05", SourceKind::Sra, &format!("SRR00000{i}")));
    }
    for i in 0..2 {
        jobs.push(sh(&format!("url{i}"), "sleep 0.05", SourceKind::Url, &format!("https://example.org/{i}")));
    }

    let report = seqdd_core::scheduler::run(jobs, 1, unpaced()).await.unwrap();
    assert_eq!(report.succeeded.len(), 5);
    assert_eq!(report.peak_running, 1);
    assert_eq!(report.max_concurrency(), 1);
}

#[tokio::test]
async fn test_sources_run_in_parallel_up_to_limit() {
    let jobs: Vec<Job> = SourceKind::ALL
        .into_iter()
        .map(|kind| sh(&format!("{kind}_job"), "sleep 0.2", kind, kind.as_str()))
        .collect();
    let report = seqdd_core::scheduler::run(jobs, 3, unpaced()).await.unwrap();
    assert!(report.is_success());
    assert!(report.max_concurrency() <= 3);
    assert!(report.max_concurrency() >= 2);
}

// ==================== Pacing Tests ====================

#[tokio::test]
async fn test_same_source_dispatches_respect_delay() {
    let delay = Duration::from_millis(150);
    let limiter = Arc::new(RateLimiter::new());
    limiter.set_delay(SourceKind::Ncbi, delay);

    let jobs: Vec<Job> = (0..3)
        .map(|i| sh(&format!("ncbi_batch{i}"), "true", SourceKind::Ncbi, &format!("GCF_00000000{i}.1")))
        .collect();
    let report = seqdd_core::scheduler::run(jobs, 4, limiter).await.unwrap();

    let times = report.dispatch_times(SourceKind::Ncbi);
    assert_eq!(times.len(), 3);
    let slack = Duration::from_millis(5);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] + slack >= delay, "dispatches too close: {pair:?}");
    }
}
