//! A single viewer connection, from upgrade through disconnect.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use tsb_core::broadcast::{Broadcaster, Viewer, ViewerRequest};

/// Interval between server-initiated Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Attach to the broadcaster, forward its queue as JSON text frames and
/// serve `manual_recheck` requests. Detaches on close.
pub async fn run_viewer_session(ws: WebSocket, broadcaster: Arc<Broadcaster>) {
    let Viewer { id, mut rx } = broadcaster.attach();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut outbound = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        // Skip the immediate first tick.
        ping.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        // Dropped by the broadcaster (closed or too slow).
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    };
                    let json = match serde_json::to_string(&msg) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!(viewer = id, error = %e, "failed to serialize viewer message");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(t))) => t.to_string(),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(s) => s.to_string(),
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                };
                match ViewerRequest::parse(&text) {
                    Some(ViewerRequest::ManualRecheck) => broadcaster.on_manual_recheck(id),
                    None => debug!(viewer = id, "ignoring unrecognized viewer frame"),
                }
            }
            _ = &mut outbound => break,
        }
    }

    outbound.abort();
    broadcaster.detach(id);
    info!(viewer = id, "viewer session ended");
}
