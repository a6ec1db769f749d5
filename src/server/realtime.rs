//! WebSocket event stream.
//!
//! Each socket receives the change events of its tenant as JSON text frames.
//! Delivery is best-effort; a socket that falls behind the channel buffer is
//! sent a single `resync` envelope and should pull the change feed.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    Extension,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

use super::auth::TenantContext;
use super::routes::AppState;
use crate::fanout::EventBus;
use crate::models::ChangeEvent;

pub async fn realtime(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> Response {
    // Subscribe before the upgrade so nothing published during the
    // handshake is missed.
    let events = state.events.subscribe(&ctx.tenant_id);
    ws.on_upgrade(move |socket| serve_socket(socket, events, state.events, ctx))
}

async fn serve_socket(
    socket: WebSocket,
    mut events: broadcast::Receiver<ChangeEvent>,
    bus: Arc<dyn EventBus>,
    ctx: TenantContext,
) {
    tracing::info!(
        "Realtime client connected: tenant={}, user={} ({} subscriber(s))",
        ctx.tenant_id,
        ctx.user_id,
        bus.subscriber_count(&ctx.tenant_id)
    );

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = next_envelope(&mut events, &ctx.tenant_id) => {
                let Some(event) = event else {
                    break;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Failed to encode event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!("WebSocket error: {}", e);
                    break;
                }
                // Clients have nothing to say on this channel.
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::info!(
        "Realtime client disconnected: tenant={}, user={}",
        ctx.tenant_id,
        ctx.user_id
    );
}

/// Waits for the next envelope to deliver. A lagged receiver yields a
/// `resync` envelope; a closed channel yields `None`.
pub(crate) async fn next_envelope(
    events: &mut broadcast::Receiver<ChangeEvent>,
    tenant_id: &str,
) -> Option<ChangeEvent> {
    match events.recv().await {
        Ok(event) => Some(event),
        Err(RecvError::Lagged(skipped)) => {
            tracing::warn!(
                "Realtime subscriber for tenant {} lagged by {} event(s), requesting resync",
                tenant_id,
                skipped
            );
            Some(ChangeEvent::resync(tenant_id))
        }
        Err(RecvError::Closed) => None,
    }
}
