//! Deferred cleanup with LIFO ordering.
//!
//! Every resource acquisition registers its release here in the same
//! breath, so a scenario that dies half way still unwinds in reverse
//! acquisition order. Failures are collected and reported; one broken step
//! never stops the rest of the stack from running.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, warn};

use crate::error::TeardownFailure;

type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), TeardownFailure>> + Send>>;

#[derive(Default)]
pub struct CleanupStack {
    entries: Vec<(String, CleanupFuture)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup step to run after all steps registered later.
    pub fn defer<F>(&mut self, label: impl Into<String>, future: F)
    where
        F: Future<Output = Result<(), TeardownFailure>> + Send + 'static,
    {
        self.entries.push((label.into(), Box::pin(future)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every registered step in reverse registration order and
    /// returns the failures, newest step's first.
    pub async fn run(mut self) -> Vec<TeardownFailure> {
        let mut failures = Vec::new();
        while let Some((label, future)) = self.entries.pop() {
            debug!(step = %label, "Running cleanup step");
            if let Err(failure) = future.await {
                warn!(step = %label, error = %failure, "Cleanup step failed");
                failures.push(failure);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test]
    async fn runs_in_reverse_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for step in ["first", "second", "third"] {
            let order = order.clone();
            stack.defer(step, async move {
                order.lock().unwrap().push(step);
                Ok(())
            });
        }

        assert_eq!(stack.len(), 3);
        let failures = stack.run().await;
        assert!(failures.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn failures_do_not_stop_later_steps() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();

        {
            let order = order.clone();
            stack.defer("delete-volume", async move {
                order.lock().unwrap().push("delete-volume");
                Ok(())
            });
        }
        stack.defer("unstage", async {
            Err(TeardownFailure::new("unstage", "pd-e2e-x", "mount busy"))
        });
        {
            let order = order.clone();
            stack.defer("unpublish", async move {
                order.lock().unwrap().push("unpublish");
                Ok(())
            });
        }

        let failures = stack.run().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].step, "unstage");
        // The failing middle step did not block the first registration.
        assert_eq!(*order.lock().unwrap(), vec!["unpublish", "delete-volume"]);
    }

    #[tokio::test]
    async fn empty_stack_is_a_no_op() {
        let stack = CleanupStack::new();
        assert!(stack.is_empty());
        assert!(stack.run().await.is_empty());
    }
}
