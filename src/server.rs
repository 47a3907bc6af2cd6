use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::commands::Dispatcher;
use crate::config::ServerConfig;
use crate::credentials::{CredentialError, CredentialStore};
use crate::delivery::DeliveryEngine;
use crate::registry::Registry;
use crate::session::{self, SessionContext};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to load credentials: {0}")]
    Credentials(#[from] CredentialError),
}

/// The listener plus the shared state every accepted session works against.
pub struct Server {
    listener: TcpListener,
    registry: Registry,
    ctx: SessionContext,
    coordinator: ShutdownCoordinator,
}

impl Server {
    pub async fn bind(
        config: &ServerConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, ServerError> {
        let addr = config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!("Chat server listening on {addr}");

        let registry = Registry::new();
        let coordinator = ShutdownCoordinator::new(registry.clone(), config.shutdown_grace);
        let ctx = SessionContext {
            delivery: DeliveryEngine::new(registry.clone()),
            dispatcher: Dispatcher::new(registry.clone(), credentials.clone()),
            credentials,
            shutdown: coordinator.signal(),
        };

        Ok(Server {
            listener,
            registry,
            ctx,
            coordinator,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Accepts connections until `shutdown` resolves with a reason, then stops
    /// accepting, closes the listening socket and drains every session.
    pub async fn run<F>(self, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = String>,
    {
        let Server {
            listener,
            ctx,
            coordinator,
            ..
        } = self;
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        let reason = loop {
            tokio::select! {
                reason = &mut shutdown => break reason,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("New connection from {peer}");
                        sessions.spawn(session::serve(stream, peer, ctx.clone()));
                    }
                    Err(e) => error!("Failed to accept connection: {e}"),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Session task failed: {e}");
                    }
                }
            }
        };

        drop(listener);
        info!("Stopped accepting connections");
        coordinator.shutdown(&reason, &mut sessions).await
    }
}
