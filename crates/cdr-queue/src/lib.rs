//! Broker plumbing for the CDR service
//!
//! - `connection`: connect with exponential backoff and surface unexpected disconnects
//! - `topology`: idempotent exchange/queue/dead-letter declarations
//! - `consumer`: manual-ack delivery stream with per-delivery acknowledgers
//! - `backoff`: the retry delay schedule shared by the connection layer

pub mod backoff;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod topology;

pub use backoff::Backoff;
pub use connection::{connect, retry_until_ready, BrokerSession, DisconnectNotice};
pub use consumer::{start_consuming, Acknowledger, DeliveryStream, InboundMessage};
pub use error::QueueError;
pub use topology::{Declaration, Topology, CATCH_ALL_ROUTING_KEY};

pub type Result<T> = std::result::Result<T, QueueError>;
