use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use reservation_worker::broker::amqp::{AmqpClient, AmqpOptions};
use reservation_worker::broker::{QueueClient, close_logged};
use reservation_worker::config::{BrokerConfig, WorkerConfig};
use reservation_worker::logging::{self, LogConfig};
use reservation_worker::pipeline::{Dispatcher, ReservationPolicy, TierPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Held until exit so the file writer flushes.
    let _log_guard = logging::init(&LogConfig::from_env()).context("initializing logging")?;

    let broker_config = BrokerConfig::from_env().context("reading broker configuration")?;
    let worker_config = WorkerConfig::from_env().context("reading worker configuration")?;

    eprintln!("🍽  Reservation worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Broker: {}", broker_config.endpoint());
    eprintln!("   Inputs: {}", worker_config.input_queues.join(", "));
    eprintln!("   Results: {}", worker_config.results_queue);
    eprintln!(
        "   Acceptance: regular {:.2}, loyalty {:.2}\n",
        worker_config.odds.regular, worker_config.odds.loyalty
    );

    // ── Broker ──────────────────────────────────────────────────────────
    let uri = broker_config.uri().context("building broker URI")?;
    let client = Arc::new(AmqpClient::new(
        uri,
        AmqpOptions {
            prefetch: worker_config.prefetch,
            success_notice_queue: worker_config.success_notice_queue.clone(),
        },
    ));

    if let Err(e) = client.connect().await {
        error!(error = %e, endpoint = %broker_config.endpoint(), "Failed to connect to broker");
        return Err(anyhow::Error::new(e).context("initial broker connection"));
    }

    // ── Policy ──────────────────────────────────────────────────────────
    let policy: Arc<dyn ReservationPolicy> = Arc::new(match worker_config.policy_seed {
        Some(seed) => {
            warn!(seed, "Using a fixed policy seed");
            TierPolicy::seeded(worker_config.odds, seed)?
        }
        None => TierPolicy::new(worker_config.odds)?,
    });

    // ── Dispatcher ──────────────────────────────────────────────────────
    let dispatcher = Arc::new(Dispatcher::new(
        client.clone(),
        policy,
        worker_config.results_queue.clone(),
    ));

    let subscribed = dispatcher.start(&worker_config.input_queues).await;
    if subscribed == 0 {
        close_logged(client.as_ref()).await;
        anyhow::bail!("no input queue could be subscribed");
    }

    shutdown_signal().await;
    info!("Shutdown signal received");

    close_logged(client.as_ref()).await;
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
