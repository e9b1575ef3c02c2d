//! Aggregate results of a scheduler run.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::job::{FailureKind, JobId};
use crate::source::SourceKind;

/// One failed job, with what it was serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    /// Source the job was dispatched for.
    pub source: SourceKind,
    /// Accessions affected by the failure.
    pub accessions: Vec<String>,
    /// Name of the job that failed.
    pub job: String,
    /// Failure classification.
    pub kind: FailureKind,
    /// Full error message including diagnostics.
    pub message: String,
    /// True when the failed job was a failure cleanup step.
    pub cleanup: bool,
}

/// Whether a job started or finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEventKind {
    Started,
    Finished,
}

/// A timestamped lifecycle event, relative to the start of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job: JobId,
    pub name: String,
    pub source: SourceKind,
    pub kind: JobEventKind,
    /// Whether the dispatch went through the rate limiter.
    pub paced: bool,
    pub at: Duration,
}

/// Result of a scheduler run.
///
/// An accession succeeds when every job chain serving it completed; it fails
/// as soon as one step of one of its chains failed or was cancelled.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunReport {
    /// Accessions whose every chain completed.
    pub succeeded: BTreeSet<String>,
    /// Accessions with at least one failed chain.
    pub failed: BTreeSet<String>,
    /// One record per failed job.
    pub failures: Vec<FailureRecord>,
    /// Highest number of simultaneously running jobs observed.
    pub peak_running: usize,
    /// Lifecycle events in the order they happened.
    pub events: Vec<JobEvent>,
}

impl RunReport {
    /// Returns true when no accession failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Groups failed accessions by source and failure kind.
    #[must_use]
    pub fn failures_by_source(&self) -> BTreeMap<SourceKind, BTreeMap<FailureKind, BTreeSet<String>>> {
        let mut grouped: BTreeMap<SourceKind, BTreeMap<FailureKind, BTreeSet<String>>> =
            BTreeMap::new();
        for record in self.failures.iter().filter(|record| !record.cleanup) {
            grouped
                .entry(record.source)
                .or_default()
                .entry(record.kind)
                .or_default()
                .extend(record.accessions.iter().cloned());
        }
        grouped
    }

    /// Returns the start offsets of the paced dispatches for `source`.
    #[must_use]
    pub fn dispatch_times(&self, source: SourceKind) -> Vec<Duration> {
        self.events
            .iter()
            .filter(|event| {
                event.source == source && event.paced && event.kind == JobEventKind::Started
            })
            .map(|event| event.at)
            .collect()
    }

    /// Replays the event log and returns the maximum number of jobs running at once.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        let mut running = 0usize;
        let mut peak = 0usize;
        for event in &self.events {
            match event.kind {
                JobEventKind::Started => {
                    running += 1;
                    peak = peak.max(running);
                }
                JobEventKind::Finished => running = running.saturating_sub(1),
            }
        }
        peak
    }
}

/// Live counters, shared with progress displays while a run is in flight.
#[derive(Debug, Default)]
pub struct RunProgress {
    started: AtomicUsize,
    finished: AtomicUsize,
    failed: AtomicUsize,
    running: AtomicUsize,
}

impl RunProgress {
    /// Creates a tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of jobs started so far.
    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Returns the number of jobs that reached a terminal state.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Returns the number of failed jobs.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Returns the number of jobs currently running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_finished(&self, success: bool) {
        self.finished.fetch_add(1, Ordering::SeqCst);
        self.running.fetch_sub(1, Ordering::SeqCst);
        if !success {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Per-accession bookkeeping of outstanding job chains.
#[derive(Debug, Default)]
pub(crate) struct AccessionTracker {
    outstanding: HashMap<String, usize>,
    failed: BTreeSet<String>,
    succeeded: BTreeSet<String>,
}

impl AccessionTracker {
    /// Registers one more chain serving `accessions`.
    pub(crate) fn register(&mut self, accessions: &[String]) {
        for accession in accessions {
            *self.outstanding.entry(accession.clone()).or_insert(0) += 1;
        }
    }

    /// Marks one chain serving `accessions` as completed.
    pub(crate) fn chain_succeeded(&mut self, accessions: &[String]) {
        for accession in accessions {
            if self.release(accession) == 0 && !self.failed.contains(accession) {
                self.succeeded.insert(accession.clone());
            }
        }
    }

    /// Marks one chain serving `accessions` as failed.
    pub(crate) fn chain_failed(&mut self, accessions: &[String]) {
        for accession in accessions {
            self.release(accession);
            self.succeeded.remove(accession);
            self.failed.insert(accession.clone());
        }
    }

    fn release(&mut self, accession: &str) -> usize {
        match self.outstanding.get_mut(accession) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        }
    }

    pub(crate) fn into_sets(self) -> (BTreeSet<String>, BTreeSet<String>) {
        (self.succeeded, self.failed)
    }
}
