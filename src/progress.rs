//! Progress UI (spinner) for download runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use seqdd_core::scheduler::RunProgress;

/// Spinner shown on stderr while jobs run.
pub(crate) struct ProgressUi {
    handle: Option<tokio::task::JoinHandle<()>>,
    done: Arc<AtomicBool>,
}

impl ProgressUi {
    /// Spawns the spinner when `enabled`; otherwise returns an inert handle.
    pub(crate) fn spawn(enabled: bool, progress: Arc<RunProgress>) -> Self {
        let done = Arc::new(AtomicBool::new(!enabled));
        let handle = enabled.then(|| spawn_spinner(progress, Arc::clone(&done)));
        Self { handle, done }
    }

    /// Clears the spinner and waits for its task.
    pub(crate) async fn finish(self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle {
            let _ = handle.await;
        }
    }
}

/// Only draw a spinner on an interactive, non-quiet stderr.
pub(crate) fn should_use_spinner(stderr_is_terminal: bool, quiet: bool) -> bool {
    let dumb_terminal = std::env::var("TERM").is_ok_and(|value| value.eq_ignore_ascii_case("dumb"));
    stderr_is_terminal && !quiet && !dumb_terminal
}

fn spawn_spinner(progress: Arc<RunProgress>, done: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !done.load(Ordering::SeqCst) {
            spinner.set_message(format!(
                "{} running, {} finished ({} failed)",
                progress.running(),
                progress.finished(),
                progress.failed()
            ));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
        spinner.finish_and_clear();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_progress_has_no_task() {
        let ui = ProgressUi::spawn(false, Arc::new(RunProgress::new()));
        assert!(ui.handle.is_none());
        assert!(ui.done.load(Ordering::SeqCst));
        ui.finish().await;
    }

    #[tokio::test]
    async fn test_enabled_progress_stops_on_finish() {
        let ui = ProgressUi::spawn(true, Arc::new(RunProgress::new()));
        assert!(ui.handle.is_some());
        ui.finish().await;
    }

    #[test]
    fn test_spinner_requires_terminal_and_not_quiet() {
        assert!(!should_use_spinner(false, false));
        assert!(!should_use_spinner(true, true));
    }
}
