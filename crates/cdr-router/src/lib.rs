//! CDR event routing and reconciliation
//!
//! This crate turns broker deliveries into call record updates:
//! - schema: wire shapes of the platform's call events
//! - classify: ordered schema sniffing (the Event Router)
//! - reconcile: order-tolerant call record state machine over a `CallStore`
//! - processor: one delivery body in, one acknowledgment decision out
//! - dispatch: bounded-concurrency dispatch loop with panic isolation
//! - lifecycle: in-flight tracking for graceful shutdown
//! - metrics: injected event counters and the Prometheus recorder

pub mod classify;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod processor;
pub mod reconcile;
pub mod schema;

pub use classify::{route, Unrecognized};
pub use dispatch::{DispatchExit, Dispatcher};
pub use error::RouterError;
pub use lifecycle::{InFlightGuard, InFlightTracker};
pub use metrics::{install_recorder, EventCounters};
pub use processor::{EventProcessor, MessageHandler};
pub use reconcile::{Reconciled, Reconciler, ReconcilePolicy, TerminationReason};
pub use schema::DecodedEvent;

pub type Result<T> = std::result::Result<T, RouterError>;
