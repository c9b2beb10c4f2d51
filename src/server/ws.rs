//! WebSocket handler for live activity delivery.
//!
//! One upgraded connection maps to one [`ConnectionSession`]. The delivery
//! loop spawned here is the only writer to the transport, so concurrent
//! publishes can never interleave frames. The read loop owns subscription
//! control, heartbeat bookkeeping, and the missed-heartbeat watchdog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use tracing::{debug, info, warn};

use crate::protocol::{ClientFrame, ControlAction, Heartbeat, ServerFrame};

use super::queue::OutboundFrame;
use super::session::ConnectionSession;
use super::AppState;

/// WebSocket upgrade handler.
///
/// The bearer credential rides in the `Authorization` header or, because
/// browsers cannot set headers on WebSocket requests, a `token` query
/// parameter. A rejected handshake closes immediately with no session
/// created.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let token = bearer_token(&headers).or_else(|| params.get("token").cloned());
    let user_id = match token.and_then(|t| state.authenticator.authenticate(&t)) {
        Some(user_id) => user_id,
        None => {
            info!("handshake rejected: missing or invalid credential");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
        .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Drive one authenticated connection to completion.
async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let session = Arc::new(ConnectionSession::new(user_id, state.config.queue_capacity));
    session.activate();
    info!(session = %session.id, user = %session.user_id, "session active");

    let (mut sender, mut receiver) = socket.split();

    // Delivery loop: drains the outbound queue; sole writer to the sink.
    let queue = session.queue().clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = queue.pop().await {
            if sender.send(Message::Text(frame.payload.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let deadline = state.config.heartbeat_deadline();
    // Check at a fraction of the deadline so expiry is noticed promptly.
    let mut watchdog = tokio::time::interval(Duration::from_secs(
        state.config.heartbeat_interval_secs.max(1),
    ));
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    watchdog.tick().await;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &session, &text);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // Axum answers pings itself; either direction proves liveness.
                        session.record_heartbeat();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session = %session.id, "transport closed");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(session = %session.id, error = %e, "transport error");
                        break;
                    }
                    _ => {}
                }
            }
            _ = watchdog.tick() => {
                if session.heartbeat_expired(deadline) {
                    info!(session = %session.id, "missed heartbeat deadline");
                    break;
                }
            }
        }
    }

    // Teardown: stop routing to this session, then let the queue drain for
    // the grace period before hard-closing.
    session.begin_close();
    state.registry.drop_session(session.id);

    if tokio::time::timeout(state.config.close_grace(), &mut send_task)
        .await
        .is_err()
    {
        session.queue().close_now();
        send_task.abort();
    }
    session.finish_close();
    info!(session = %session.id, dropped = session.queue().dropped_count(), "session closed");
}

/// Handle one inbound text frame. Malformed frames are discarded and logged;
/// the connection itself stays up.
fn handle_frame(state: &AppState, session: &Arc<ConnectionSession>, text: &str) {
    match ClientFrame::decode(text) {
        Ok(ClientFrame::Control(ctrl)) => {
            session.record_heartbeat();
            match ctrl.action {
                ControlAction::Subscribe => state.registry.subscribe(session, ctrl.topic),
                ControlAction::Unsubscribe => state.registry.unsubscribe(session.id, &ctrl.topic),
            }
        }
        Ok(ClientFrame::Heartbeat(_)) => {
            session.record_heartbeat();
            // Answer with a server heartbeat; critical so overflow never drops it.
            if let Ok(json) = ServerFrame::Heartbeat(Heartbeat::now()).encode() {
                session.queue().push(OutboundFrame::critical(Arc::from(json)));
            }
        }
        Err(e) => {
            warn!(session = %session.id, error = %e, "discarding malformed frame");
        }
    }
}
