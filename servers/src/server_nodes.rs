use anyhow::Result;
use clap::Parser;
use lib_common::core::{MetricsFetcher, NodeHub};
use lib_common::ingestors::PveResourceFetcher;
use std::sync::Arc;
use tokio::signal;

mod nodes_logic;
use nodes_logic::{config, downstream, state};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let settings = config::load_config(config::Config::parse())?;
    let log_file = lib_common::loggers::setup_logging(&settings.log_dir, "server_nodes", &settings.log_level)?;
    log::info!("Logging to {}", log_file.display());

    let fetcher: Arc<dyn MetricsFetcher> = Arc::new(PveResourceFetcher::new(settings.scheduler.fetch_timeout));
    let hub = NodeHub::new(settings.scheduler.clone(), fetcher)?;
    let registered = hub.register_hosts(settings.hosts.clone())?;
    log::info!(
        "Registered {} host(s) from {}",
        registered,
        settings.config_path.display()
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let app_state = state::AppState::new(hub.clone());

    let mut downstream_handle = tokio::spawn(downstream::run(
        settings.clone(),
        app_state,
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(err) => {
                        log::warn!("Cannot listen for SIGTERM: {}", err);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
        finished = &mut downstream_handle => {
            // The server stopped on its own, usually a bind or TLS failure.
            hub.shutdown();
            return match finished {
                Ok(result) => result,
                Err(err) => Err(err.into()),
            };
        }
    }

    hub.shutdown();
    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    downstream_handle.await??;
    log::info!("Shutdown complete.");
    Ok(())
}
