//! In-process post-processing jobs.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use super::error::JobError;

type Callable = Box<dyn FnOnce() -> Result<(), JobError> + Send>;

/// A deferred callable, executed inline the first time it is polled.
///
/// Intended for cheap local work such as digest verification and moving
/// artifacts out of the temporary directory.
pub struct FunctionJob {
    callable: Option<Callable>,
}

impl FunctionJob {
    /// Wraps a closure.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() -> Result<(), JobError> + Send + 'static,
    {
        Self {
            callable: Some(Box::new(func)),
        }
    }

    /// Wraps a function together with the arguments it will be called with.
    pub fn call<A, F>(func: F, args: A) -> Self
    where
        A: Send + 'static,
        F: FnOnce(A) -> Result<(), JobError> + Send + 'static,
    {
        Self::new(move || func(args))
    }

    /// Runs the callable. A second call reports the job as cancelled.
    pub(crate) fn execute(&mut self) -> Result<(), JobError> {
        let Some(callable) = self.callable.take() else {
            return Err(JobError::Cancelled);
        };
        match catch_unwind(AssertUnwindSafe(callable)) {
            Ok(result) => result,
            Err(payload) => Err(JobError::Panicked {
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Drops the callable without running it.
    pub(crate) fn cancel(&mut self) {
        self.callable = None;
    }
}

impl fmt::Debug for FunctionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionJob")
            .field("pending", &self.callable.is_some())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_execute_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut job = FunctionJob::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        job.execute().unwrap();
        assert!(matches!(job.execute(), Err(JobError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_passes_arguments() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut job = FunctionJob::call(
            |(sink, value): (Arc<AtomicUsize>, usize)| {
                sink.store(value, Ordering::SeqCst);
                Ok(())
            },
            (Arc::clone(&seen), 42),
        );
        job.execute().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_error_is_returned() {
        let mut job = FunctionJob::new(|| Err(JobError::failed("no files to move")));
        let err = job.execute().unwrap_err();
        assert_eq!(err.to_string(), "no files to move");
    }

    #[test]
    fn test_panic_is_captured() {
        let mut job = FunctionJob::new(|| panic!("corrupt archive"));
        let err = job.execute().unwrap_err();
        assert!(matches!(err, JobError::Panicked { ref message } if message == "corrupt archive"));
    }

    #[test]
    fn test_cancel_prevents_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut job = FunctionJob::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        job.cancel();
        assert!(matches!(job.execute(), Err(JobError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
