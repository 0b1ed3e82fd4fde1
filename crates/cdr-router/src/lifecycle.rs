//! In-flight work tracking for graceful shutdown
//!
//! Every unit of work holds an [`InFlightGuard`] for its whole lifetime.
//! The owner of the dispatch loop waits on [`InFlightTracker::wait_idle`]
//! after intake stops, bounded by a grace period so a stuck worker never
//! blocks shutdown forever.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Inner {
    count: AtomicUsize,
    idle: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    inner: Arc<Inner>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one unit of work; released when the guard drops.
    pub fn track(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until no work is in flight or `grace` elapses.
    ///
    /// Returns `true` when everything drained in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let drained = tokio::time::timeout(grace, async {
            loop {
                let idle = self.inner.idle.notified();
                if self.count() == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok();

        if drained {
            info!("All in-flight messages finished");
        } else {
            warn!(
                remaining = self.count(),
                grace_secs = grace.as_secs(),
                "Grace period elapsed with messages still in flight"
            );
        }
        drained
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Inner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
