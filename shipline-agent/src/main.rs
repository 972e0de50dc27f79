//! # Shipline Agent
//!
//! Ships newline-delimited JSON events from stdin to Redis.
//!
//! ## Usage
//!
//! ```bash
//! SHIPLINE__OUTPUT__REDIS__HOSTS=localhost:6379 \
//! SHIPLINE__OUTPUT__REDIS__KEY=events \
//!     tail -F app.log | cargo run -p shipline-agent
//! ```

use anyhow::Context;
use shipline_agent::config::AgentConfig;
use shipline_agent::forwarder::Forwarder;
use shipline_agent::telemetry;
use shipline_output::codec::AgentInfo;
use shipline_output::output::RedisOutputClient;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::load().context("Failed to load configuration")?;

    telemetry::init(&config.logging);

    tracing::info!(
        "Shipline Agent v{} starting...",
        env!("CARGO_PKG_VERSION")
    );

    let agent = AgentInfo::new(config.agent.name.clone(), env!("CARGO_PKG_VERSION"));
    let client = RedisOutputClient::new(config.output.redis.clone(), agent)
        .context("Failed to create Redis output")?;

    tracing::info!(
        hosts = config.output.redis.hosts.len(),
        key = %config.output.redis.key,
        datatype = %config.output.redis.datatype,
        batch_size = config.agent.batch_size,
        "Redis output configured"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received, exiting...");
        shutdown.cancel();
    });

    let summary = Forwarder::new(client, &config, cancel)
        .run(BufReader::new(tokio::io::stdin()))
        .await?;

    tracing::info!(
        events_acked = summary.events_acked,
        events_dropped = summary.events_dropped,
        "Shipline Agent stopped"
    );

    Ok(())
}
