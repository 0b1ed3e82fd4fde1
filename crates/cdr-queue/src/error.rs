use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("broker connection cancelled by shutdown")]
    Cancelled,

    #[error("failed to connect to broker: {0}")]
    Connect(#[source] lapin::Error),

    #[error("failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to declare {entity} `{name}`: {source}")]
    Topology {
        entity: &'static str,
        name: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to configure prefetch (prefetch={prefetch}): {source}")]
    Qos {
        prefetch: u16,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to start consumer on queue `{queue}`: {source}")]
    Consume {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("delivery stream error: {0}")]
    Delivery(#[source] lapin::Error),

    #[error("{action} failed for delivery {delivery_tag}: {reason}")]
    Ack {
        action: &'static str,
        delivery_tag: u64,
        reason: String,
    },
}

impl QueueError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueueError::Cancelled)
    }
}
