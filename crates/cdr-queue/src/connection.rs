//! Broker session management
//!
//! A session is one AMQP connection plus the single channel the consumer
//! runs on. Connecting retries with exponential backoff until it succeeds
//! or shutdown is requested. Once connected, unexpected connection loss is
//! reported through a [`DisconnectNotice`] so the supervisor can tear down
//! the consumer and start over.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use lapin::{Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::QueueError;
use crate::Result;

const CLOSE_REPLY_SUCCESS: u16 = 200;

/// Run `attempt` until it succeeds, sleeping per `backoff` between failures.
///
/// Returns [`QueueError::Cancelled`] as soon as `cancel` fires, whether
/// mid-attempt or mid-sleep.
pub async fn retry_until_ready<T, E, F, Fut>(
    backoff: &mut Backoff,
    cancel: &CancellationToken,
    what: &str,
    mut attempt: F,
) -> Result<T>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            outcome = attempt(attempts) => outcome,
        };

        match outcome {
            Ok(value) => {
                if attempts > 1 {
                    info!(target_name = what, attempts, "Recovered after retries");
                }
                backoff.reset();
                return Ok(value);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    target_name = what,
                    attempt = attempts,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Attempt failed, backing off"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Resolves when the broker connection drops unexpectedly
pub struct DisconnectNotice {
    rx: oneshot::Receiver<String>,
}

impl DisconnectNotice {
    /// Wait for the connection to drop and return the reason.
    pub async fn wait(self) -> String {
        self.rx
            .await
            .unwrap_or_else(|_| "connection handle dropped".to_string())
    }
}

/// One live AMQP connection and its consumer channel
pub struct BrokerSession {
    connection: Connection,
    channel: Channel,
}

impl BrokerSession {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    /// Close the connection; in-flight acks on it are lost after this.
    pub async fn close(&self) {
        if !self.connection.status().connected() {
            return;
        }
        if let Err(e) = self
            .connection
            .close(CLOSE_REPLY_SUCCESS, "cdr-service shutting down")
            .await
        {
            debug!(error = %e, "Error closing broker connection");
        }
    }
}

async fn open_session(url: &str) -> Result<(BrokerSession, DisconnectNotice)> {
    let properties =
        ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());

    let connection = Connection::connect(url, properties)
        .await
        .map_err(QueueError::Connect)?;

    let (tx, rx) = oneshot::channel();
    let notify = Arc::new(Mutex::new(Some(tx)));
    connection.on_error(move |err| {
        if let Some(tx) = notify.lock().take() {
            let _ = tx.send(err.to_string());
        }
    });

    let channel = connection
        .create_channel()
        .await
        .map_err(QueueError::Channel)?;

    Ok((BrokerSession { connection, channel }, DisconnectNotice { rx }))
}

/// Connect to the broker, retrying with backoff until shutdown.
///
/// `url` is logged only in redacted form by callers; this function never
/// logs it.
pub async fn connect(
    url: &str,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Result<(BrokerSession, DisconnectNotice)> {
    let session = retry_until_ready(backoff, cancel, "rabbitmq", |_| open_session(url)).await?;
    info!("Connected to RabbitMQ");
    Ok(session)
}
