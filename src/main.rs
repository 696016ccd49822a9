use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use kinedesk::config::Config;
use kinedesk::engine::Engine;
use kinedesk::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use kinedesk::store::Store;
use kinedesk::wire::{self, KinedeskFactory};
use kinedesk::{audit, observability, tls};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port);

    let tls_acceptor =
        tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(Store::open(&config.wal_path())?);
    let engine = Arc::new(Engine::new(store.clone()));

    let auditor_ledger = Arc::new(kinedesk::engine::Ledger::new(store.clone()));
    tokio::spawn(audit::run_auditor(auditor_ledger, config.audit_interval));
    tokio::spawn(audit::run_compactor(store.clone(), config.compact_threshold));

    let factory = Arc::new(KinedeskFactory::new(engine, config.password.clone()));
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("kinedesk listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_addr()
            .map_or("disabled".to_string(), |a| format!("http://{a}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("cannot listen for SIGTERM ({e}), ctrl-c only");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, factory, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("kinedesk stopped");
    Ok(())
}
