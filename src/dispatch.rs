//! Out-of-process style task dispatch for migration units.
//!
//! The orchestrator submits a batch of units, then waits by cooperative
//! polling rather than a blocking join: `wait_all` sleeps between polls so
//! shutdown checks can interleave, and there is no hard deadline because
//! migrations are long-running and eventual completion wins over deadline
//! enforcement.

use crate::error::Error;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sink for failures of fire-and-forget tasks.
///
/// Decouples "did it run" from "did the orchestrator notice": the task
/// runtime logs and forwards the error, the submitting code keeps going.
pub type ErrorSink = Arc<dyn Fn(&Error) + Send + Sync>;

/// Completion handle for a dispatched unit.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    label: String,
    done: Arc<AtomicBool>,
    error: Arc<Mutex<Option<Error>>>,
}

impl TaskHandle {
    fn new(label: String) -> Self {
        Self {
            label,
            done: Arc::new(AtomicBool::new(false)),
            error: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether the unit has finished, successfully or not.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Take the unit's failure, if it failed. Consumes the error.
    pub fn take_error(&self) -> Option<Error> {
        self.error.lock().take()
    }

    /// The label the unit was submitted under.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Submits migration units for parallel execution on the runtime.
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    poll_interval: Duration,
}

impl TaskDispatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Submit a unit and return its completion handle.
    ///
    /// A failure is recorded on the handle and logged; it does not abort
    /// anything by itself.
    pub fn submit<F>(&self, label: impl Into<String>, fut: F) -> TaskHandle
    where
        F: Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        let handle = TaskHandle::new(label.into());
        let done = Arc::clone(&handle.done);
        let error = Arc::clone(&handle.error);
        let label = handle.label.clone();

        tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::error!(task = %label, error = %e, "migration unit failed");
                *error.lock() = Some(e);
            }
            done.store(true, Ordering::Release);
        });

        handle
    }

    /// Fire-and-forget submission: failures go to the sink and the log,
    /// nothing is returned to poll.
    pub fn submit_supervised<F>(&self, label: impl Into<String>, fut: F, sink: ErrorSink)
    where
        F: Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        let label = label.into();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::error!(task = %label, error = %e, "supervised background task failed");
                sink(&e);
            }
        });
    }

    /// Wait until every handle is done, polling with sleep-backoff.
    pub async fn wait_all(&self, handles: &[TaskHandle]) {
        loop {
            if handles.iter().all(TaskHandle::is_done) {
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Wait for a batch and collect the failures for logging.
    pub async fn wait_all_collect(&self, handles: &[TaskHandle]) -> Vec<(String, Error)> {
        self.wait_all(handles).await;
        handles
            .iter()
            .filter_map(|h| h.take_error().map(|e| (h.label().to_string(), e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn dispatcher() -> TaskDispatcher {
        TaskDispatcher::new(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let d = dispatcher();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        let handle = d.submit("unit", async move {
            ran_clone.store(true, Ordering::Release);
            Ok(())
        });

        d.wait_all(std::slice::from_ref(&handle)).await;
        assert!(handle.is_done());
        assert!(ran.load(Ordering::Acquire));
        assert!(handle.take_error().is_none());
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_raised() {
        let d = dispatcher();
        let handle = d.submit("failing", async {
            Err(Error::Internal("boom".into()))
        });

        d.wait_all(std::slice::from_ref(&handle)).await;
        assert!(handle.is_done());
        assert!(matches!(handle.take_error(), Some(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_wait_all_blocks_for_every_handle() {
        let d = dispatcher();
        let mut handles = Vec::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(d.submit(format!("unit-{i}"), async move {
                tokio::time::sleep(Duration::from_millis(10 + i * 3)).await;
                counter.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }));
        }

        d.wait_all(&handles).await;
        assert_eq!(counter.load(Ordering::Acquire), 8);
    }

    #[tokio::test]
    async fn test_supervised_errors_reach_sink() {
        let d = dispatcher();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let sink: ErrorSink = Arc::new(move |_| {
            seen_clone.fetch_add(1, Ordering::AcqRel);
        });

        d.submit_supervised(
            "bg",
            async { Err(Error::NotFound("gone".into())) },
            sink,
        );

        // Give the spawned task a moment to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::Acquire), 1);
    }
}
