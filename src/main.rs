use std::sync::Arc;

use sms_relay::Relay;
use sms_relay::config::{ChannelBackend, RelayConfig};
use sms_relay::store::LibSqlBackend;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = RelayConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging(&config);

    eprintln!("📨 SMS Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    match &config.channel {
        ChannelBackend::Loopback => eprintln!("   Channel: loopback"),
        ChannelBackend::Gateway { urls, .. } => {
            eprintln!("   Channel: gateway ({} slots)", urls.len())
        }
    }
    eprintln!("   API: http://0.0.0.0:{}/api/status", config.http_port);
    eprintln!("   Progress WS: ws://0.0.0.0:{}/ws\n", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    // ── Relay ────────────────────────────────────────────────────────────
    let relay = Relay::start(&config, db).await?;
    tracing::info!(device_id = %relay.state.device, "Relay ready");
    if !relay.state.webhook.is_enabled() {
        tracing::warn!("RELAY_WEBHOOK_TOKEN not set, delivery webhook disabled");
    }

    if let Some(slot) = config.autostart_slot {
        match relay.state.supervisor.start(slot, config.dispatch.mode).await {
            Ok(()) => tracing::info!(slot, "Dispatch autostarted"),
            Err(e) => tracing::warn!(error = %e, "Dispatch autostart skipped"),
        }
    }

    // ── HTTP / WS server ─────────────────────────────────────────────────
    let app = relay.router();
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "Control server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Shutting down");
    relay.shutdown().await;
    Ok(())
}

/// Console logging filtered by `RUST_LOG`, plus a daily rolling file when
/// `RELAY_LOG_DIR` is set.
fn init_logging(config: &RelayConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console = fmt::layer().with_target(false).with_filter(filter());

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sms-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter());
            tracing_subscriber::registry().with(console).with(file).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(console).init();
            None
        }
    }
}
