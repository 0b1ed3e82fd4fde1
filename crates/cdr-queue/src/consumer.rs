//! Manual-ack delivery stream
//!
//! Each delivery is turned into an [`InboundMessage`] that owns its own
//! acknowledger, so a worker task can settle it independently of the
//! stream that produced it.

use async_trait::async_trait;
use cdr_common::AckAction;
use futures::stream::{BoxStream, StreamExt};
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use tracing::info;

use crate::connection::BrokerSession;
use crate::error::QueueError;
use crate::Result;

pub type DeliveryStream = BoxStream<'static, Result<InboundMessage>>;

/// Settles one delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> std::result::Result<(), String>;

    /// `requeue = false` routes the message to the dead-letter exchange.
    async fn nack(&self, requeue: bool) -> std::result::Result<(), String>;
}

/// A delivery pulled off the service queue
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub routing_key: String,
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl InboundMessage {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            routing_key: routing_key.into(),
            body,
            acker,
        }
    }

    /// Apply the processing outcome to the broker.
    pub async fn settle(&self, action: AckAction) -> Result<()> {
        let outcome = match action {
            AckAction::Ack => self.acker.ack().await,
            AckAction::NackRequeue => self.acker.nack(true).await,
            AckAction::NackDiscard => self.acker.nack(false).await,
        };

        outcome.map_err(|reason| QueueError::Ack {
            action: action.as_str(),
            delivery_tag: self.delivery_tag,
            reason,
        })
    }
}

struct LapinAcker {
    inner: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> std::result::Result<(), String> {
        self.inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| e.to_string())
    }

    async fn nack(&self, requeue: bool) -> std::result::Result<(), String> {
        self.inner
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| e.to_string())
    }
}

fn into_inbound(delivery: Delivery) -> InboundMessage {
    InboundMessage::new(
        delivery.delivery_tag,
        delivery.redelivered,
        delivery.routing_key.as_str(),
        delivery.data,
        Box::new(LapinAcker {
            inner: delivery.acker,
        }),
    )
}

/// Start a manual-ack consumer on `queue` with the given prefetch window.
pub async fn start_consuming(
    session: &BrokerSession,
    queue: &str,
    prefetch: u16,
) -> Result<DeliveryStream> {
    let channel = session.channel();

    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(|source| QueueError::Qos { prefetch, source })?;

    let consumer_tag = format!("cdr-service-{}", uuid::Uuid::new_v4());
    let consumer = channel
        .basic_consume(
            queue,
            &consumer_tag,
            BasicConsumeOptions {
                no_ack: false,
                exclusive: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|source| QueueError::Consume {
            queue: queue.to_string(),
            source,
        })?;

    info!(queue, consumer_tag = %consumer_tag, prefetch, "Consuming");

    Ok(consumer
        .map(|delivery| delivery.map(into_inbound).map_err(QueueError::Delivery))
        .boxed())
}
