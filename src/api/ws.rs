//! Live feed of approval notifications over WebSocket.
//!
//! On connect the client receives its pending requests (when it named an
//! approver), then every new notification as it is raised.

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::AppState;
use crate::channels::ApprovalNotification;
use crate::workflow::model::ApprovalRequest;

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    approver: Option<String>,
}

/// Messages pushed to feed clients.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedMessage<'a> {
    PendingSync { requests: Vec<ApprovalRequest> },
    ApprovalRequested { notification: &'a ApprovalNotification },
}

pub async fn approvals_feed(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> impl IntoResponse {
    info!(approver = ?query.approver, "Approval feed client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.approver))
}

async fn send_json(socket: &mut WebSocket, msg: &FeedMessage<'_>) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize feed message");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, approver: Option<String>) {
    // Subscribe before the sync so nothing raised in between is missed.
    let mut rx = state.approvals_feed.subscribe();

    if let Some(approver) = approver.as_deref() {
        let requests = match state.gate.pending_for(approver).await {
            Ok(requests) => requests,
            Err(e) => {
                warn!(error = %e, "Pending sync failed");
                Vec::new()
            }
        };
        if !send_json(&mut socket, &FeedMessage::PendingSync { requests }).await {
            debug!("Client gone before sync");
            return;
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => match result {
                Ok(notification) => {
                    if approver.as_deref().is_some_and(|a| a != notification.approver_id) {
                        continue;
                    }
                    let msg = FeedMessage::ApprovalRequested { notification: &notification };
                    if !send_json(&mut socket, &msg).await {
                        debug!("Client disconnected during send");
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "Approval feed client lagged");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "Approval feed socket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    info!("Approval feed client disconnected");
}
