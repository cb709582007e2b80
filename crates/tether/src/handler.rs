//! Per-connection handler: routing, joining, and the frame pump.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Parse the upgrade path → rendezvous or join
//!   2. Rendezvous: create a session, send the ticket, close
//!   3. Join: attach to the session → get an outbound queue
//!   4. Loop: socket frames go to the broker; queued frames go to the socket
//!
//! Replies to correlated requests are awaited on their own task and come
//! back through the outbound queue, so a slow answer never stalls the
//! connection's later frames.

use std::sync::Arc;

use tether_protocol::{Codec, CorrelationId, Envelope, JsonCodec, Role};
use tether_relay::{Attachment, Broker, ConnectionHandle, Dispatch, PendingResponse};
use tether_session::{CredentialCapability, Nonce};
use tether_transport::{Connection, WebSocketConnection};

use crate::TetherError;
use crate::route::Route;

/// Drop guard that detaches the peer when the handler exits.
///
/// This ensures cleanup happens even if the handler panics.
struct DisconnectGuard<C: CredentialCapability> {
    handle: ConnectionHandle,
    broker: Arc<Broker<C>>,
}

impl<C: CredentialCapability> Drop for DisconnectGuard<C> {
    fn drop(&mut self) {
        if let Some(reason) = self.broker.on_disconnect(&self.handle) {
            tracing::info!(
                nonce = %self.handle.nonce(), %reason,
                "session closed by disconnect"
            );
        }
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<C: CredentialCapability>(
    conn: WebSocketConnection,
    broker: Arc<Broker<C>>,
) -> Result<(), TetherError> {
    let conn_id = conn.id();
    tracing::debug!(%conn_id, path = conn.path(), "handling new connection");

    let result = match Route::parse(conn.path()) {
        Some(Route::Rendezvous) => rendezvous(&conn, &broker).await,
        Some(Route::Join { role, nonce }) => {
            join(&conn, broker, role, nonce).await
        }
        None => send_error(&conn, 404, "unknown route", None).await,
    };

    // The peer may already be gone; nothing left to report either way.
    let _ = conn.close().await;
    result
}

/// Creates a session and sends its ticket as the only frame.
async fn rendezvous<C: CredentialCapability>(
    conn: &WebSocketConnection,
    broker: &Broker<C>,
) -> Result<(), TetherError> {
    match broker.create_session().await {
        Ok(ticket) => {
            let bytes = JsonCodec.encode(&ticket)?;
            conn.send(&bytes).await?;
            Ok(())
        }
        Err(e) => {
            tracing::warn!(error = %e, "session creation failed");
            send_error(conn, e.code(), &e.to_string(), None).await
        }
    }
}

/// Attaches to the session and pumps frames until either side ends.
async fn join<C: CredentialCapability>(
    conn: &WebSocketConnection,
    broker: Arc<Broker<C>>,
    role: Role,
    nonce: Nonce,
) -> Result<(), TetherError> {
    let conn_id = conn.id();
    let Attachment {
        handle,
        mut outbound,
    } = match broker.on_connect(nonce.clone(), role, conn_id) {
        Ok(attachment) => attachment,
        Err(e) => {
            tracing::info!(%nonce, %role, %conn_id, error = %e, "join rejected");
            return send_error(conn, e.code(), &e.to_string(), None).await;
        }
    };
    let _guard = DisconnectGuard {
        handle: handle.clone(),
        broker: Arc::clone(&broker),
    };

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(bytes) => conn.send(&bytes).await?,
                None => {
                    // The broker released this peer (session closed).
                    tracing::debug!(%nonce, %role, %conn_id, "outbound queue closed");
                    break;
                }
            },
            incoming = conn.recv() => match incoming {
                Ok(Some(bytes)) => {
                    handle_frame(conn, &broker, &handle, &bytes).await?;
                }
                Ok(None) => {
                    tracing::debug!(%nonce, %role, %conn_id, "connection closed cleanly");
                    break;
                }
                Err(e) => {
                    tracing::debug!(%nonce, %role, %conn_id, error = %e, "recv error");
                    break;
                }
            },
        }
    }

    // _guard drops here → peer detached.
    Ok(())
}

/// Hands one frame to the broker and reports failures back to the sender.
async fn handle_frame<C: CredentialCapability>(
    conn: &WebSocketConnection,
    broker: &Arc<Broker<C>>,
    handle: &ConnectionHandle,
    bytes: &[u8],
) -> Result<(), TetherError> {
    match broker.on_message(handle, bytes).await {
        Ok(Dispatch::Awaiting(pending)) => {
            spawn_reply(Arc::clone(broker), handle.clone(), pending);
            Ok(())
        }
        Ok(dispatch) => {
            tracing::trace!(nonce = %handle.nonce(), ?dispatch, "frame dispatched");
            Ok(())
        }
        Err(e) => {
            tracing::debug!(
                nonce = %handle.nonce(), role = %handle.role(), error = %e,
                "frame rejected"
            );
            send_error(conn, e.code(), &e.to_string(), correlation_id(bytes))
                .await
        }
    }
}

/// Waits for a correlated request's outcome and queues it for the caller.
fn spawn_reply<C: CredentialCapability>(
    broker: Arc<Broker<C>>,
    handle: ConnectionHandle,
    pending: PendingResponse,
) {
    tokio::spawn(async move {
        let id = pending.id().clone();
        let reply = match pending.wait().await {
            Ok(payload) => Envelope::response(id, payload),
            Err(e) => Envelope::error(e.code(), e.to_string(), Some(id)),
        };
        match JsonCodec.encode(&reply) {
            Ok(bytes) => {
                if !broker.send(&handle, bytes) {
                    tracing::debug!(
                        nonce = %handle.nonce(),
                        "caller gone before reply could be delivered"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode reply"),
        }
    });
}

/// Sends an `error` envelope straight to the socket.
async fn send_error(
    conn: &WebSocketConnection,
    code: u16,
    message: &str,
    id: Option<CorrelationId>,
) -> Result<(), TetherError> {
    let bytes = JsonCodec.encode(&Envelope::error(code, message, id))?;
    conn.send(&bytes).await?;
    Ok(())
}

/// The correlation id of a frame, if it is an envelope carrying one.
fn correlation_id(bytes: &[u8]) -> Option<CorrelationId> {
    JsonCodec
        .decode::<Envelope>(bytes)
        .ok()
        .and_then(|envelope| envelope.correlation_id)
}
