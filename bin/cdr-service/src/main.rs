//! CDR Service
//!
//! Consumes call lifecycle events from RabbitMQ and reconciles them into one
//! call detail record per call in PostgreSQL.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RABBITMQ_URL` | - | Broker URL (required) |
//! | `POSTGRES_URL` | - | Database URL (required) |
//! | `METRICS_PORT` | `9092` | Metrics/health port |
//! | `LOG_LEVEL` | `info` | Log level (overridden by `RUST_LOG`) |
//! | `LOG_FORMAT` | `json` | `json`, `pretty` or `compact` |
//! | `CDR_WORKER_LIMIT` | `10` | Concurrent messages and broker prefetch |
//! | `CDR_SHUTDOWN_GRACE_SECS` | `10` | Wait for in-flight messages on shutdown |
//! | `CDR_INFER_ANSWERED` | `true` | Infer ANSWERED from duration and normal clearing |
//! | `CDR_ALLOW_LATE_IDENTITY` | `true` | Apply identification after completion |
//! | `CDR_CONFIG_FILE` | - | Optional TOML file with the same keys |

mod http;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cdr_common::logging;
use cdr_config::{redact_url, Config};
use cdr_queue::{Backoff, BrokerSession, DisconnectNotice, QueueError, Topology};
use cdr_router::{
    DispatchExit, Dispatcher, EventCounters, EventProcessor, ReconcilePolicy,
};
use cdr_store::PostgresCallStore;

const METRICS_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("invalid configuration")?;
    logging::init(&config.log_level, config.log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        rabbitmq = %redact_url(&config.rabbitmq_url),
        postgres = %redact_url(&config.postgres_url),
        worker_limit = config.broker.worker_limit,
        infer_answered = config.policy.infer_answered,
        allow_late_identity = config.policy.allow_late_identity,
        "Starting CDR service"
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    let prometheus = cdr_router::install_recorder()?;
    let counters = Arc::new(EventCounters::new());
    let broker_ready = Arc::new(AtomicBool::new(false));

    // Metrics server
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let metrics_app = http::router(http::AppState {
        prometheus: Some(prometheus),
        broker_ready: broker_ready.clone(),
    });
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics port {}", config.metrics_port))?;
    info!("Metrics server listening on http://{}/metrics", metrics_addr);

    let metrics_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .ok();
        })
    };

    // Storage
    let store = Arc::new(PostgresCallStore::connect_lazy(
        &config.postgres_url,
        config.database.max_connections,
        config.database.acquire_timeout,
    )?);

    let mut backoff = Backoff::new(config.broker.backoff_initial, config.broker.backoff_max);
    match cdr_queue::retry_until_ready(&mut backoff, &shutdown, "postgres", |_| {
        store.init_schema()
    })
    .await
    {
        Ok(()) => {}
        Err(QueueError::Cancelled) => {
            info!("Shutdown requested before the database became available");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let processor = Arc::new(EventProcessor::new(
        store.clone(),
        ReconcilePolicy {
            infer_answered: config.policy.infer_answered,
            allow_late_identity: config.policy.allow_late_identity,
        },
        counters.clone(),
    ));
    let dispatcher = Dispatcher::new(
        processor,
        counters.clone(),
        usize::from(config.broker.worker_limit),
    );

    supervise(&config, &dispatcher, &counters, &broker_ready, &shutdown).await;

    store.close().await;
    let _ = tokio::time::timeout(METRICS_SHUTDOWN_TIMEOUT, metrics_handle).await;

    info!("CDR service shutdown complete");
    Ok(())
}

/// How one broker session ended
enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Connect, declare, consume; reconnect on loss until shutdown.
async fn supervise(
    config: &Config,
    dispatcher: &Dispatcher,
    counters: &EventCounters,
    broker_ready: &AtomicBool,
    shutdown: &CancellationToken,
) {
    let topology = Topology {
        exchange: config.broker.exchange.clone(),
        queue: config.broker.queue.clone(),
        dead_letter_exchange: config.broker.dead_letter_exchange.clone(),
        dead_letter_queue: config.broker.dead_letter_queue.clone(),
    };
    let mut backoff = Backoff::new(config.broker.backoff_initial, config.broker.backoff_max);
    let mut connected_before = false;

    loop {
        let (session, disconnect) =
            match cdr_queue::connect(&config.rabbitmq_url, &mut backoff, shutdown).await {
                Ok(connected) => connected,
                Err(QueueError::Cancelled) => break,
                Err(e) => {
                    error!(error = %e, "Broker connection failed");
                    if !pause(&mut backoff, shutdown).await {
                        break;
                    }
                    continue;
                }
            };

        if connected_before {
            counters.broker_reconnect();
        }
        connected_before = true;

        let end = run_session(
            &session,
            disconnect,
            &topology,
            config.broker.worker_limit,
            dispatcher,
            broker_ready,
            shutdown,
        )
        .await;
        broker_ready.store(false, Ordering::SeqCst);

        // Let in-flight work settle on the old channel before dropping it
        dispatcher
            .tracker()
            .wait_idle(config.broker.shutdown_grace)
            .await;
        session.close().await;

        match end {
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::Lost(reason)) => {
                warn!(reason = %reason, "Broker session lost, reconnecting");
            }
            Err(e) => {
                error!(error = %e, "Broker session setup failed, retrying");
                if !pause(&mut backoff, shutdown).await {
                    break;
                }
            }
        }
    }
}

async fn run_session(
    session: &BrokerSession,
    disconnect: DisconnectNotice,
    topology: &Topology,
    prefetch: u16,
    dispatcher: &Dispatcher,
    broker_ready: &AtomicBool,
    shutdown: &CancellationToken,
) -> Result<SessionEnd, QueueError> {
    topology.declare(session.channel()).await?;
    let deliveries = cdr_queue::start_consuming(session, &topology.queue, prefetch).await?;
    broker_ready.store(true, Ordering::SeqCst);

    tokio::select! {
        exit = dispatcher.run(&topology.queue, deliveries, shutdown) => match exit {
            DispatchExit::Shutdown => Ok(SessionEnd::Shutdown),
            DispatchExit::StreamClosed => Ok(SessionEnd::Lost("delivery stream closed".to_string())),
            DispatchExit::StreamError(e) => Ok(SessionEnd::Lost(e.to_string())),
        },
        reason = disconnect.wait() => Ok(SessionEnd::Lost(reason)),
    }
}

/// Sleep for the next backoff delay. Returns false if shutdown interrupted it.
async fn pause(backoff: &mut Backoff, shutdown: &CancellationToken) -> bool {
    let delay = backoff.next_delay();
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
