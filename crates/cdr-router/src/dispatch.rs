//! Dispatch Loop
//!
//! Pulls deliveries and runs each on its own task, bounded by a semaphore
//! sized to the worker limit:
//! - a slot is acquired *before* the next delivery is pulled, so a saturated
//!   pool stalls intake instead of buffering
//! - a panic inside the handler is caught at the task boundary and turned
//!   into a requeue
//! - cancellation stops intake only; in-flight tasks run to completion and
//!   are awaited through the [`InFlightTracker`]

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use cdr_common::AckAction;
use cdr_queue::{InboundMessage, QueueError};
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::lifecycle::InFlightTracker;
use crate::metrics::{EventCounters, REASON_PANIC, UNKNOWN_EVENT_TYPE};
use crate::processor::MessageHandler;

/// Why the dispatch loop returned
#[derive(Debug)]
pub enum DispatchExit {
    /// Cancellation requested
    Shutdown,
    /// The broker ended the delivery stream
    StreamClosed,
    /// The delivery stream failed, usually a dead channel
    StreamError(QueueError),
}

pub struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    counters: Arc<EventCounters>,
    semaphore: Arc<Semaphore>,
    tracker: InFlightTracker,
    worker_limit: usize,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        counters: Arc<EventCounters>,
        worker_limit: usize,
    ) -> Self {
        let worker_limit = worker_limit.max(1);
        Self {
            handler,
            counters,
            semaphore: Arc::new(Semaphore::new(worker_limit)),
            tracker: InFlightTracker::new(),
            worker_limit,
        }
    }

    pub fn worker_limit(&self) -> usize {
        self.worker_limit
    }

    /// Shared with the process owner so it can wait for in-flight work.
    pub fn tracker(&self) -> &InFlightTracker {
        &self.tracker
    }

    pub fn in_flight(&self) -> usize {
        self.worker_limit - self.semaphore.available_permits()
    }

    /// Consume `deliveries` until cancelled or the stream ends.
    pub async fn run<S>(&self, queue: &str, deliveries: S, cancel: &CancellationToken) -> DispatchExit
    where
        S: Stream<Item = Result<InboundMessage, QueueError>> + Send + Unpin,
    {
        self.run_inner(deliveries, cancel)
            .instrument(info_span!("dispatch", queue = %queue))
            .await
    }

    async fn run_inner<S>(&self, mut deliveries: S, cancel: &CancellationToken) -> DispatchExit
    where
        S: Stream<Item = Result<InboundMessage, QueueError>> + Send + Unpin,
    {
        info!(worker_limit = self.worker_limit, "Dispatch loop started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break DispatchExit::Shutdown,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // The semaphore is never closed while the dispatcher lives
                    Err(_) => break DispatchExit::Shutdown,
                },
            };

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break DispatchExit::Shutdown,
                next = deliveries.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!(error = %e, "Delivery stream failed");
                    break DispatchExit::StreamError(e);
                }
                None => {
                    info!("Delivery stream closed by broker");
                    break DispatchExit::StreamClosed;
                }
            };

            let span = info_span!(
                "delivery",
                delivery_tag = message.delivery_tag,
                redelivered = message.redelivered
            );
            let guard = self.tracker.track();
            let handler = self.handler.clone();
            let counters = self.counters.clone();
            let semaphore = self.semaphore.clone();
            let worker_limit = self.worker_limit;

            self.counters.dispatch_load(self.in_flight(), worker_limit);

            tokio::spawn(
                async move {
                    let action = process_guarded(handler.as_ref(), &counters, &message).await;
                    if let Err(e) = message.settle(action).await {
                        warn!(error = %e, "Failed to settle delivery");
                    }

                    drop(permit);
                    drop(guard);
                    counters.dispatch_load(
                        worker_limit - semaphore.available_permits(),
                        worker_limit,
                    );
                }
                .instrument(span),
            );
        }
    }
}

async fn process_guarded(
    handler: &dyn MessageHandler,
    counters: &EventCounters,
    message: &InboundMessage,
) -> AckAction {
    match AssertUnwindSafe(handler.handle(&message.body))
        .catch_unwind()
        .await
    {
        Ok(action) => {
            debug!(action = action.as_str(), "Delivery handled");
            action
        }
        Err(panic) => {
            error!(
                panic = %panic_message(panic.as_ref()),
                "Handler panicked, requeuing delivery"
            );
            counters.failed(UNKNOWN_EVENT_TYPE, REASON_PANIC);
            AckAction::NackRequeue
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_zero_worker_limit_is_raised_to_one() {
        struct Noop;
        #[async_trait::async_trait]
        impl MessageHandler for Noop {
            async fn handle(&self, _body: &[u8]) -> AckAction {
                AckAction::Ack
            }
        }

        let dispatcher = Dispatcher::new(Arc::new(Noop), Arc::new(EventCounters::new()), 0);
        assert_eq!(dispatcher.worker_limit(), 1);
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
