//! Cooperative run flag shared by the periodic workers.
//!
//! A worker checks [`WorkerControl::is_running`] once at the top of each
//! iteration and sleeps through [`WorkerControl::sleep`], which returns early
//! when the worker is paused. An in-flight transaction always completes before
//! the loop observes the flag.
//!
//! ```rust
//! use mercury_itc::worker::WorkerControl;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let control = WorkerControl::new();
//! let worker = control.clone();
//! control.pause();
//! assert!(!worker.sleep(Duration::from_secs(60)).await);
//! # });
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug)]
struct Inner {
    running: AtomicBool,
    changed: Notify,
}

/// Clonable pause/resume handle.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    inner: Arc<Inner>,
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerControl {
    /// A control in the running state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                running: AtomicBool::new(true),
                changed: Notify::new(),
            }),
        }
    }

    /// Whether the worker should keep going.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Ask the worker to stop at its next check.
    pub fn pause(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    /// Clear the stop request.
    pub fn resume(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    /// Resolves once the worker has been paused.
    pub async fn paused(&self) {
        loop {
            let notified = self.inner.changed.notified();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `period`, waking early on pause. Returns whether the worker
    /// is still running afterwards.
    pub async fn sleep(&self, period: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = self.paused() => {}
        }
        self.is_running()
    }
}
