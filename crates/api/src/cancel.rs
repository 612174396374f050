//! Cancellation token threaded through every long-running call.
//!
//! A token is cancelled explicitly (consumer went away, operator action) or
//! implicitly when its deadline passes. Blocking code polls `is_cancelled`;
//! async code awaits `cancelled`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    cause: Mutex<Option<String>>,
    deadline: Mutex<Option<Instant>>,
    notify: Notify,
}

impl CancelToken {
    /// A token that never fires on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that fires when `timeout` elapses.
    pub fn with_timeout(timeout: std::time::Duration) -> Self {
        let token = Self::new();
        *token.inner.deadline.lock().unwrap() = Some(Instant::now() + timeout);
        token
    }

    /// Cancel the token with a cause. The first cause wins.
    pub fn cancel(&self, cause: impl Into<String>) {
        {
            let mut slot = self.inner.cause.lock().unwrap();
            if slot.is_none() {
                *slot = Some(cause.into());
            }
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the token has fired, either explicitly or by deadline.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }

        let deadline = *self.inner.deadline.lock().unwrap();
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                self.cancel("deadline exceeded");
                return true;
            }
        }

        false
    }

    /// The cancellation cause, if the token has fired.
    pub fn cause(&self) -> Option<String> {
        self.inner.cause.lock().unwrap().clone()
    }

    /// Wait until the token fires.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }

            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }

            let deadline = *self.inner.deadline.lock().unwrap();
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            self.cancel("deadline exceeded");
                            return;
                        }
                    }
                }
                None => notified.await,
            }
        }
    }
}
