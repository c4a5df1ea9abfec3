//! chanq Server - runs dispatchers for every bound channel.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chanq_server::{Args, JsonLinesSink, LogSink, NotificationService, SinkKind};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chanq_server=info,chanq_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting chanq server");

    let args = Args::parse();
    let config = args.into_config();

    tracing::info!(
        data_path = %config.data_path.display(),
        bindings = %config.bindings_path.display(),
        consumer_id = %config.consumer_id,
        sink = ?config.sink,
        "configuration loaded"
    );

    let service = NotificationService::open(&config)?;

    // Every bound channel gets the configured sink.
    let mut consumers = service.consumers();
    let entity_types: Vec<String> = service
        .registry()
        .iter()
        .map(|binding| binding.entity_type.clone())
        .collect();
    for entity_type in &entity_types {
        match config.sink {
            SinkKind::Log => consumers.on_notification(entity_type, LogSink)?,
            SinkKind::Json => consumers.on_notification(entity_type, JsonLinesSink::stdout())?,
        };
    }

    let handle = service.start(&consumers);
    tracing::info!("server ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl+c");
    } else {
        tracing::info!("received shutdown signal");
    }

    handle.shutdown().await?;

    let stats = handle.stats();

    let totals = stats.totals();
    tracing::info!(
        processed = totals.processed,
        failed = totals.failed,
        skipped = totals.skipped,
        reclaimed = stats.leases_reclaimed,
        "server shutdown complete"
    );

    Ok(())
}
