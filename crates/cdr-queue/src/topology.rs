//! Exchange and queue declarations
//!
//! Declarations are idempotent; they run on every (re)connect before the
//! consumer starts. Order matters: the dead-letter pair must exist before
//! the service queue that points at it.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use tracing::{debug, info};

use crate::error::QueueError;
use crate::Result;

pub const CATCH_ALL_ROUTING_KEY: &str = "#";

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Names of everything the service declares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Primary event bus (topic)
    pub exchange: String,
    /// Durable, shared service queue
    pub queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

/// One step of the declaration plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    TopicExchange {
        name: String,
    },
    Queue {
        name: String,
        dead_letter_exchange: Option<String>,
    },
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

impl Declaration {
    fn entity(&self) -> &'static str {
        match self {
            Declaration::TopicExchange { .. } => "exchange",
            Declaration::Queue { .. } => "queue",
            Declaration::Binding { .. } => "binding",
        }
    }

    fn name(&self) -> String {
        match self {
            Declaration::TopicExchange { name } | Declaration::Queue { name, .. } => name.clone(),
            Declaration::Binding {
                queue, exchange, ..
            } => format!("{queue} -> {exchange}"),
        }
    }
}

impl Topology {
    /// Ordered list of declarations needed before consuming.
    pub fn plan(&self) -> Vec<Declaration> {
        vec![
            Declaration::TopicExchange {
                name: self.exchange.clone(),
            },
            Declaration::TopicExchange {
                name: self.dead_letter_exchange.clone(),
            },
            Declaration::Queue {
                name: self.dead_letter_queue.clone(),
                dead_letter_exchange: None,
            },
            Declaration::Binding {
                queue: self.dead_letter_queue.clone(),
                exchange: self.dead_letter_exchange.clone(),
                routing_key: CATCH_ALL_ROUTING_KEY.to_string(),
            },
            Declaration::Queue {
                name: self.queue.clone(),
                dead_letter_exchange: Some(self.dead_letter_exchange.clone()),
            },
            Declaration::Binding {
                queue: self.queue.clone(),
                exchange: self.exchange.clone(),
                routing_key: CATCH_ALL_ROUTING_KEY.to_string(),
            },
        ]
    }

    /// Execute the declaration plan on `channel`.
    pub async fn declare(&self, channel: &Channel) -> Result<()> {
        for declaration in self.plan() {
            debug!(
                entity = declaration.entity(),
                name = %declaration.name(),
                "Declaring"
            );
            apply(channel, &declaration)
                .await
                .map_err(|source| QueueError::Topology {
                    entity: declaration.entity(),
                    name: declaration.name(),
                    source,
                })?;
        }

        info!(
            exchange = %self.exchange,
            queue = %self.queue,
            dead_letter_queue = %self.dead_letter_queue,
            "Broker topology declared"
        );
        Ok(())
    }
}

async fn apply(channel: &Channel, declaration: &Declaration) -> lapin::Result<()> {
    match declaration {
        Declaration::TopicExchange { name } => {
            channel
                .exchange_declare(
                    name,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
        }
        Declaration::Queue {
            name,
            dead_letter_exchange,
        } => {
            let mut arguments = FieldTable::default();
            if let Some(dlx) = dead_letter_exchange {
                arguments.insert(
                    DEAD_LETTER_EXCHANGE_ARG.into(),
                    AMQPValue::LongString(dlx.as_str().into()),
                );
            }
            channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        durable: true,
                        exclusive: false,
                        auto_delete: false,
                        ..Default::default()
                    },
                    arguments,
                )
                .await
                .map(|_| ())
        }
        Declaration::Binding {
            queue,
            exchange,
            routing_key,
        } => {
            channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
        }
    }
}
