use std::sync::Arc;

use line_chat::{JsonCredentialStore, Server, ServerConfig};
use log::{error, info};

const SHUTDOWN_REASON: &str = "Server is shutting down. Goodbye!";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let credentials = match JsonCredentialStore::open(&config.user_db).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to load {}: {e}", config.user_db.display());
            std::process::exit(1);
        }
    };

    let server = match Server::bind(&config, credentials).await {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let report = server
        .run(async {
            stop_requested().await;
            SHUTDOWN_REASON.to_string()
        })
        .await;

    info!(
        "Shut down after notifying {} session(s), {} force-closed",
        report.notified,
        report.forced.len()
    );
}

/// Resolves on ctrl-c, or on SIGTERM where there is one.
async fn stop_requested() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received ctrl-c"),
        () = terminate => info!("Received SIGTERM"),
    }
}
