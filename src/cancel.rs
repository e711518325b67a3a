//! Cancellation token for in-flight requests.
//!
//! A `CancelToken` aborts the *wait* for a response, not the work: the
//! request is dropped from the outstanding map and the caller gets the
//! cancellation reason; the daemon may still process the request and its
//! late response is silently discarded.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    reason: Mutex<Option<String>>,
    notify: Notify,
}

/// A cloneable cancellation token carrying a reason.
///
/// Firing any clone cancels all of them; only the first reason wins.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation with a reason. Idempotent; later calls are
    /// ignored.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut slot = self.inner.reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason.into());
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.lock().unwrap().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().unwrap().clone()
    }

    /// Wait until the token fires, returning the reason.
    pub async fn cancelled(&self) -> String {
        loop {
            // Register interest before checking so a concurrent cancel()
            // cannot slip between the check and the await.
            let notified = self.inner.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}
