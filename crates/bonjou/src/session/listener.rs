//! Inbound session listener.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use super::connection::handshake;
use super::SessionHub;

pub struct SessionListener {
    listener: TcpListener,
    hub: Arc<SessionHub>,
    shutdown: broadcast::Receiver<()>,
}

impl SessionListener {
    pub fn new(listener: TcpListener, hub: Arc<SessionHub>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            listener,
            hub,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("session listener shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(%remote, "inbound connection");

                    let hub = self.hub.clone();
                    tokio::spawn(async move {
                        let pending = match handshake(stream, hub.context(), false).await {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::warn!(%remote, error = %e, "inbound handshake failed");
                                return;
                            }
                        };
                        if let Err(e) = hub.register(pending).await {
                            tracing::warn!(%remote, error = %e, "failed to register session");
                        }
                    });
                }
            }
        }
    }
}
