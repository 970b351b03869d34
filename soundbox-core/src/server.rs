//! TCP acceptor and the registry supervisor.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::handler::{ConnectionHandler, EngineContext};

/// Accept loop for the device port. Each accepted socket gets its own
/// [`ConnectionHandler`] task group; the server itself holds no
/// per-connection state beyond the shared registry in the context.
pub struct DeviceServer {
    ctx: EngineContext,
    shutdown: CancellationToken,
}

impl DeviceServer {
    pub fn new(ctx: EngineContext, shutdown: CancellationToken) -> Self {
        Self { ctx, shutdown }
    }

    /// Bind the device port and accept until shutdown. On shutdown every
    /// registered connection is closed before returning.
    pub async fn run(self) -> Result<(), EngineError> {
        let addr = self.ctx.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "device listener started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            debug!(%peer, %err, "could not disable Nagle");
                        }
                        ConnectionHandler::spawn(stream, self.ctx.clone());
                    }
                    Err(err) => {
                        // Transient accept errors (EMFILE and friends);
                        // keep the listener alive.
                        error!(%err, "accept failed");
                    }
                },
            }
        }

        info!("device listener stopping");
        self.ctx.registry.close_all();
        Ok(())
    }
}

/// Periodic sweep over the registry: connections whose heartbeat
/// watchdog has lapsed are closed and dropped, and the occupancy is
/// logged. The sweep is a backstop for handlers whose own watchdog
/// task died; in the common case the watchdog closes first and the
/// sweep only observes.
pub fn spawn_supervisor(ctx: EngineContext, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(ctx.config.supervisor_period());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticks.tick() => {}
            }
            for handler in ctx.registry.snapshot() {
                if handler.heartbeat_lapsed() && !handler.is_closed() {
                    warn!(serial = %handler.serial(), "supervisor closing silent connection");
                    handler.close();
                }
            }
            debug!(online = ctx.registry.count(), "supervisor sweep");
        }
    });
}
