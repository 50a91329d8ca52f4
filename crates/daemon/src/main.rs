//! Loanq Daemon - Main Entry Point
//! Runs the submission API (producer side), the approval consumer, or both.

mod broker;
mod logging;
mod settings;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

// Import workspace crates
use loanq_api_rpc::{RpcServer, RpcServerConfig};
use loanq_core::application::consumer::constants::GRACEFUL_SHUTDOWN_TIMEOUT;
use loanq_core::application::{
    shutdown_channel, ConsumerStats, DecisionConsumer, LoanSubmissionService, RequestProducer,
    ThresholdPolicy,
};
use loanq_core::port::id_provider::EpochIdProvider;
use loanq_core::port::time_provider::SystemTimeProvider;
use loanq_core::port::{LogDecisionSink, TimeProvider};
use loanq_infra_sqlite::{create_pool, run_migrations, SqliteRecovery};

use crate::broker::{broker_kind, connector_for, ensure_sqlite_parent, BrokerKind};
use crate::settings::Settings;

const VERSION: &str = env!("CARGO_PKG_VERSION");

type ConsumerHandle = JoinHandle<loanq_core::Result<ConsumerStats>>;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize logging
    let _log_guard = logging::init_logging()?;

    info!("Loanq daemon v{} starting...", VERSION);

    // 2. Load configuration
    let settings = Settings::load()?;
    let kind = broker_kind(&settings.broker.url)?;
    info!(
        mode = ?settings.mode,
        broker = ?kind,
        queue = %settings.queue.name,
        "Configuration loaded"
    );

    // 3. Setup dependencies (DI wiring)
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    if kind == BrokerKind::Sqlite {
        ensure_sqlite_parent(&settings.broker.url)?;
    }
    let connector = connector_for(
        &settings.broker.url,
        time_provider.clone(),
        settings.delivery_lease(),
    )?;
    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    // 4. Start consumer
    let mut consumer_handle: Option<ConsumerHandle> = None;
    if settings.mode.runs_consumer() {
        if kind == BrokerKind::Sqlite {
            recover_sqlite_deliveries(
                &settings.broker.url,
                time_provider.clone(),
                settings.delivery_lease(),
            )
            .await;
        }

        info!("Starting consumer...");
        let mut consumer = DecisionConsumer::new(
            settings.broker.url.clone(),
            settings.queue_settings(),
            connector.clone(),
            Arc::new(ThresholdPolicy::default()),
            Arc::new(LogDecisionSink),
            time_provider.clone(),
        );
        let connect_retry = settings.connect_retry();
        consumer_handle = Some(tokio::spawn(async move {
            consumer.run(&connect_retry, shutdown_rx).await
        }));
    }

    // 5. Start submission API
    let mut producer = None;
    let mut rpc_handle = None;
    if settings.mode.runs_api() {
        info!("Starting submission API...");
        producer = LoanSubmissionService::connect_producer(
            RequestProducer::new(
                settings.broker.url.clone(),
                settings.queue_settings(),
                connector.clone(),
            )
            .with_retry_policy(settings.publish_retry()),
        )
        .await;

        let service = LoanSubmissionService::new(
            producer.clone(),
            Arc::new(EpochIdProvider::new()),
            time_provider.clone(),
        );
        let rpc_config = RpcServerConfig {
            host: settings.rpc.host.clone(),
            port: settings.rpc.port,
        };
        let handle = RpcServer::new(rpc_config, Arc::new(service), settings.queue.name.clone())
            .start()
            .await
            .map_err(|e| anyhow!("RPC server start failed: {}", e))?;
        rpc_handle = Some(handle);
    }

    info!("System ready. Press Ctrl+C to shutdown");

    // 6. Wait for shutdown signal (or a consumer that cannot continue)
    let consumer_exit = async {
        match consumer_handle.as_mut() {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    let mut fatal = None;
    let consumer_done = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received. Exiting gracefully...");
            false
        }
        exit = consumer_exit => {
            match exit {
                Ok(Ok(stats)) => {
                    warn!(acked = stats.acked, rejected = stats.rejected, "Consumer stopped")
                }
                Ok(Err(e)) => fatal = Some(anyhow!("Consumer failed: {}", e)),
                Err(e) => fatal = Some(anyhow!("Consumer task panicked: {}", e)),
            }
            true
        }
    };

    // 7. Graceful shutdown
    shutdown_tx.shutdown();

    if let Some(handle) = rpc_handle {
        if let Err(e) = handle.stop() {
            warn!(error = %e, "RPC server already stopped");
        }
    }

    if let Some(mut handle) = consumer_handle.filter(|_| !consumer_done) {
        match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, &mut handle).await {
            Ok(Ok(Ok(stats))) => {
                info!(acked = stats.acked, rejected = stats.rejected, "Consumer drained")
            }
            Ok(Ok(Err(e))) => error!(error = %e, "Consumer failed during shutdown"),
            Ok(Err(e)) => error!(error = %e, "Consumer task panicked"),
            Err(_) => {
                // Dropping the consumer stops its lease renewal; AMQP requeues on disconnect
                handle.abort();
                warn!(
                    lease_ms = settings.broker.delivery_lease_ms,
                    "Consumer did not stop in time, aborted"
                );
            }
        }
    }

    if let Some(producer) = producer {
        producer.close().await;
    }

    match fatal {
        Some(e) => {
            error!(error = %e, "Daemon stopping after fatal consumer error");
            Err(e)
        }
        None => {
            info!("Shutdown complete.");
            Ok(())
        }
    }
}

/// Requeue deliveries a crashed consumer left unacknowledged
///
/// Only leases older than `delivery_lease` are touched, so deliveries held by
/// another running consumer stay where they are.
async fn recover_sqlite_deliveries(
    url: &str,
    time_provider: Arc<dyn TimeProvider>,
    delivery_lease: Duration,
) {
    info!("Running crash recovery...");
    let pool = match create_pool(url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "Crash recovery skipped: cannot open queue database");
            return;
        }
    };

    if let Err(e) = run_migrations(&pool).await {
        error!(error = %e, "Crash recovery skipped: migration failed");
    } else {
        match SqliteRecovery::new(pool.clone(), time_provider, Some(delivery_lease))
            .recover_orphaned_deliveries()
            .await
        {
            Ok(count) => info!(recovered_deliveries = count, "Crash recovery completed"),
            Err(e) => error!(error = %e, "Crash recovery failed"),
        }
    }
    pool.close().await;
}
