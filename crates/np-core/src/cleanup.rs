//! Scoped per-session cleanup.
//!
//! Each session registers the resources it creates (temp key files,
//! authorised-key entries, listeners, subprocesses, subscriptions) as named
//! teardown steps. Running the registry drains the steps, so invoking it
//! again is a no-op; a step that hangs is abandoned after a fixed bound and
//! the remaining steps still run.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::timeouts;

type StepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Step = Box<dyn FnOnce() -> StepFuture + Send>;

/// Registry of teardown steps for one session.
///
/// Steps run in reverse registration order, mirroring construction order.
#[derive(Default)]
pub struct CleanupRegistry {
    steps: Mutex<Vec<(String, Step)>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named teardown step.
    pub async fn register<F, Fut>(&self, name: impl Into<String>, step: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.steps
            .lock()
            .await
            .push((name.into(), Box::new(move || Box::pin(step()))));
    }

    /// Number of steps still registered.
    pub async fn pending(&self) -> usize {
        self.steps.lock().await.len()
    }

    /// Run all registered steps, newest first.
    ///
    /// Idempotent: steps are drained before running, so a second call
    /// (from a signal handler racing normal completion, say) does nothing.
    /// Each step is bounded at [`timeouts::CLEANUP_STEP`]; a timed-out step
    /// is abandoned and the rest continue best-effort.
    pub async fn run(&self) {
        let mut steps: Vec<_> = self.steps.lock().await.drain(..).collect();
        steps.reverse();
        for (name, step) in steps {
            match tokio::time::timeout(timeouts::CLEANUP_STEP, step()).await {
                Ok(()) => debug!(step = %name, "cleanup step done"),
                Err(_) => warn!(step = %name, "cleanup step timed out, continuing"),
            }
        }
    }
}
