//! hiverelay-server: RPC server and event fan-out node
//!
//! Consumes the shared request topic, dispatches requests to the built-in
//! handlers, and fans device events out to subscribers.
//!
//! ## Architecture
//! ```text
//! [RPC clients] -> request_topic -> [consumers] -> ring -> [workers] -> handlers
//!                                                                        |
//!                                                                        v
//!                                            [event bus] -> reply topics / delivery sink
//! ```
//!
//! ## Configuration
//! - `hiverelay.yaml`, `--config <path>`, or HIVERELAY_CONFIG
//! - HIVERELAY__SECTION__KEY environment overrides
//! - HIVERELAY_LOG / HIVERELAY_LOG_FORMAT for logging

use std::sync::Arc;

use tracing::{error, info};

use hiverelay::bus::EventBus;
use hiverelay::config::Config;
use hiverelay::delivery::{DeliverySink, LocalSessions};
use hiverelay::handlers::default_table;
use hiverelay::ring::Executor;
use hiverelay::rpc::{ResponseDispatcher, RpcServer};
use hiverelay::transport::init_log;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    hiverelay::utils::bootstrap::init_tracing();

    let config_path = hiverelay::utils::bootstrap::parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    config.validate()?;

    info!(messaging = ?config.messaging.messaging_type, "Starting hiverelay-server");

    let log = init_log(&config.messaging)?;
    info!("Log transport initialized");

    let executor = Arc::new(Executor::start(
        "event-bus",
        config.event_bus.worker_threads,
        &config.event_bus.ring,
    )?);
    let sessions = Arc::new(LocalSessions::new());
    let delivery = Arc::new(DeliverySink::start(sessions.clone(), &config.delivery.ring)?);
    let replies = Arc::new(ResponseDispatcher::new(log.producer()?));

    let bus = Arc::new(
        EventBus::builder(Arc::clone(&executor))
            .with_reply_sink(replies)
            .with_session_sink(delivery.clone())
            .build(),
    );

    let server = RpcServer::start(
        &config.server,
        &config.messaging.request_topic,
        Arc::clone(&log),
        default_table(Arc::clone(&bus)),
    )?;

    info!("hiverelay-server running, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    server.shutdown();
    executor.shutdown();
    delivery.shutdown();
    let stats = delivery.stats();
    info!(
        delivered = stats.delivered,
        dropped = stats.dropped,
        "hiverelay-server stopped"
    );

    Ok(())
}
