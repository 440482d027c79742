//! `WS /dashboard/ws` — pushes `DashboardEvent` frames to subscribers and
//! accepts `DashboardCommand`s back over the same connection.

use crate::events::{DashboardCommand, DashboardEvent};
use crate::handler::ProxyState;
use crate::store::ConversationSummary;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;

/// How often buffered `StateUpdate`s are flushed to a connected dashboard.
/// Several `total_input_tokens` bumps for the same conversation inside one
/// window collapse to the one that was true when the window closed, so a
/// bursty conversation doesn't spam the socket with every intermediate
/// value.
const COALESCE_INTERVAL: Duration = Duration::from_millis(50);

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<ProxyState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ProxyState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.engine.subscribe();
    let mut pending_updates: HashMap<String, ConversationSummary> = HashMap::new();
    let mut flush_interval = tokio::time::interval(COALESCE_INTERVAL);
    flush_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let initial = DashboardEvent::InitialState {
        conversations: state.store.snapshot().await,
    };
    if send_event(&mut sender, &initial).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Ok(DashboardEvent::StateUpdate { conversation }) => {
                        pending_updates.insert(conversation.key.clone(), conversation);
                    }
                    Ok(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "dashboard subscriber lagged, resyncing");
                        pending_updates.clear();
                        let resync = DashboardEvent::InitialState {
                            conversations: state.store.snapshot().await,
                        };
                        if send_event(&mut sender, &resync).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = flush_interval.tick() => {
                for (_, conversation) in pending_updates.drain() {
                    let event = DashboardEvent::StateUpdate { conversation };
                    if send_event(&mut sender, &event).await.is_err() {
                        return;
                    }
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(command) = serde_json::from_str::<DashboardCommand>(&text) {
                            handle_command(&state, command).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "dashboard websocket read error");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_command(state: &ProxyState, command: DashboardCommand) {
    match command {
        DashboardCommand::ResetConversation { conv_id } => {
            let reset_keys = state.store.reset(conv_id.as_deref()).await;
            if let Some(pool) = &state.db_pool {
                for key in &reset_keys {
                    crate::persistence::delete_conversation(pool, key);
                }
            }
            tracing::info!(count = reset_keys.len(), conv_id = ?conv_id, "dashboard-triggered reset");
        }
    }
}

async fn send_event(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    event: &DashboardEvent,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).unwrap_or_default();
    sender.send(Message::Text(payload)).await
}
