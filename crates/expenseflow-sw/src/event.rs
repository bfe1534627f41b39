//! Extendable events: work an event handler asks the host to wait for.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::{JoinError, JoinSet};
use tracing::{error, trace};

use crate::{Result, ServiceWorkerError};

/// An event whose lifetime can be extended with `wait_until`.
///
/// The host must not consider the event finished (or terminate the
/// worker) until [`ExtendableEvent::settled`] has returned.
#[derive(Debug)]
pub struct ExtendableEvent {
    kind: &'static str,
    tasks: Mutex<JoinSet<Result<()>>>,
    /// First failure among joined extensions.
    failure: Mutex<Option<ServiceWorkerError>>,
}

impl ExtendableEvent {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            tasks: Mutex::new(JoinSet::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Start `work` now and keep the event alive until it finishes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.spawn(work);
        trace!(event = self.kind, pending = tasks.len(), "Lifetime extended");
    }

    /// Number of extensions not yet awaited.
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Await every extension; returns the first failure after all settle.
    pub async fn settled(&self) -> Result<()> {
        loop {
            let mut tasks = {
                let mut guard = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
                std::mem::take(&mut *guard)
            };
            if tasks.is_empty() {
                break;
            }
            while let Some(joined) = tasks.join_next().await {
                self.record(joined);
            }
        }
        self.take_outcome()
    }

    /// Join the extensions that already finished, without waiting.
    ///
    /// `None` while any are still running; otherwise the outcome
    /// [`settled`](Self::settled) would return.
    pub fn try_settled(&self) -> Option<Result<()>> {
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            while let Some(joined) = tasks.try_join_next() {
                self.record(joined);
            }
            if !tasks.is_empty() {
                return None;
            }
        }
        Some(self.take_outcome())
    }

    fn record(&self, joined: std::result::Result<Result<()>, JoinError>) {
        let outcome = joined.unwrap_or_else(|e| {
            Err(ServiceWorkerError::StateError(format!(
                "{} task aborted: {e}",
                self.kind
            )))
        });
        if let Err(e) = outcome {
            error!(event = self.kind, error = %e, "Extended work failed");
            self.failure
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .get_or_insert(e);
        }
    }

    fn take_outcome(&self) -> Result<()> {
        match self.failure.lock().unwrap_or_else(|p| p.into_inner()).take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
