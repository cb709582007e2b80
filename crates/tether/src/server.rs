//! `TetherServer` builder and server loop.
//!
//! This is the entry point for running a Tether broker. It ties together
//! all the layers: transport → protocol → session → relay.

use std::future::Future;
use std::sync::Arc;

use tether_relay::Broker;
use tether_session::{CredentialCapability, SessionConfig};
use tether_transport::{Transport, WebSocketTransport};

use crate::TetherError;
use crate::config::BrokerConfig;
use crate::handler::handle_connection;

/// Builder for configuring and starting a Tether server.
///
/// # Example
///
/// ```rust,ignore
/// use tether::prelude::*;
///
/// let server = TetherServerBuilder::new()
///     .bind("0.0.0.0:9000")
///     .public_url("wss://broker.example.com")
///     .build(my_credentials)
///     .await?;
/// server.run().await
/// ```
pub struct TetherServerBuilder {
    bind_addr: String,
    public_url: Option<String>,
    session_config: SessionConfig,
}

impl TetherServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            public_url: None,
            session_config: SessionConfig::default(),
        }
    }

    /// Takes bind address, public URL, and session settings from `config`.
    pub fn config(self, config: &BrokerConfig) -> Self {
        self.bind(&config.bind)
            .public_url(&config.public_url)
            .session_config(config.session_config())
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the base URL join addresses are built on. Defaults to
    /// `ws://{bound address}`.
    pub fn public_url(mut self, url: &str) -> Self {
        self.public_url = Some(url.to_string());
        self
    }

    /// Sets the session configuration.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Binds the listener and builds the broker around `credentials`.
    pub async fn build<C: CredentialCapability>(
        self,
        credentials: C,
    ) -> Result<TetherServer<C>, TetherError> {
        let transport = WebSocketTransport::bind(&self.bind_addr).await?;

        let public_url = match self.public_url {
            Some(url) => url,
            None => {
                let addr = transport.local_addr().map_err(
                    tether_transport::TransportError::AcceptFailed,
                )?;
                format!("ws://{addr}")
            }
        };

        let broker =
            Arc::new(Broker::new(credentials, self.session_config, public_url));

        Ok(TetherServer { transport, broker })
    }
}

impl Default for TetherServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound Tether broker.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct TetherServer<C: CredentialCapability> {
    transport: WebSocketTransport,
    broker: Arc<Broker<C>>,
}

impl<C: CredentialCapability> TetherServer<C> {
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// The broker shared by every connection task.
    pub fn broker(&self) -> &Arc<Broker<C>> {
        &self.broker
    }

    /// Runs the server accept loop until the process is terminated.
    pub async fn run(self) -> Result<(), TetherError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop and the session sweeper until `shutdown`
    /// completes, then drains every session.
    ///
    /// Draining closes each session's outbound queues, so the connection
    /// tasks wind down on their own.
    pub async fn run_until(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), TetherError> {
        tracing::info!(
            addr = ?self.transport.local_addr().ok(),
            public_url = self.broker.public_url(),
            "Tether broker running"
        );
        let sweeper = self.broker.spawn_sweeper();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let broker = Arc::clone(&self.broker);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, broker).await {
                                tracing::debug!(
                                    error = %e,
                                    "connection ended with error"
                                );
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
            }
        }

        sweeper.abort();
        self.broker.shutdown();
        Ok(())
    }
}
