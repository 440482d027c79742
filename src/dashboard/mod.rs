//! HTTP surface for observing and controlling the buffer engine: health
//! check, per-conversation detail, and manual reset — plus the websocket
//! push channel in `ws`.

pub mod ws;

use crate::handler::ProxyState;
use crate::store::ConversationDetail;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

/// Errors surfaced by dashboard endpoints.
#[derive(Debug)]
pub enum DashboardError {
    NotFound(String),
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            DashboardError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };
        tracing::warn!(%status, %message, "dashboard request failed");
        (status, message).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub conversations: usize,
    pub passthrough: bool,
}

/// `GET /health`
pub async fn health(State(state): State<ProxyState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        conversations: state.store.len(),
        passthrough: state.engine.passthrough(),
    })
}

/// `GET /dashboard/api/conversations` — listing page.
pub async fn list_conversations(State(state): State<ProxyState>) -> Json<Vec<crate::store::ConversationSummary>> {
    Json(state.store.snapshot().await)
}

/// `GET /dashboard/api/conversation/:key`
pub async fn get_conversation(
    State(state): State<ProxyState>,
    Path(key): Path<String>,
) -> Result<Json<ConversationDetail>, DashboardError> {
    let handle = state
        .store
        .get(&key)
        .ok_or_else(|| DashboardError::NotFound(format!("no tracked conversation for key {key}")))?;
    let detail = handle.lock().await.detail_view();
    Ok(Json(detail))
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub conv_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub reset_count: usize,
}

/// `POST /v1/_reset` with an optional `{"conv_id": "..."}` body — resets one
/// conversation, or every tracked conversation when the field is absent.
pub async fn reset(State(state): State<ProxyState>, body: Option<Json<ResetRequest>>) -> Json<ResetResponse> {
    let conv_id = body.and_then(|Json(req)| req.conv_id);
    let reset_keys = state.store.reset(conv_id.as_deref()).await;
    if let Some(pool) = &state.db_pool {
        for key in &reset_keys {
            crate::persistence::delete_conversation(pool, key);
        }
    }
    Json(ResetResponse {
        reset_count: reset_keys.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MockUpstream;
    use crate::detector::CompactionDetector;
    use crate::engine::{BufferEngine, EngineConfig};
    use crate::store::ConversationStore;
    use crate::tokens::ModelWindows;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_state() -> ProxyState {
        let store = Arc::new(ConversationStore::new(Duration::from_secs(3600)));
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let upstream = MockUpstream::new(Ok("SUMMARY".to_string()));
        let engine = Arc::new(BufferEngine::new(
            EngineConfig {
                checkpoint_threshold: 0.70,
                swap_threshold: 0.80,
                compact_trigger_tokens: 0,
                checkpoint_timeout: Duration::from_secs(5),
            },
            upstream,
            store.clone(),
            false,
            tx,
        ));
        ProxyState {
            client: reqwest::Client::new(),
            api_url: "https://api.anthropic.com".to_string(),
            store,
            engine,
            detector: Arc::new(CompactionDetector::default()),
            model_windows: Arc::new(ModelWindows::default()),
            db_pool: None,
        }
    }

    #[tokio::test]
    async fn health_reports_tracked_count() {
        let state = test_state();
        state.store.get_or_create("k1", "tiny", 100);
        let Json(resp) = health(State(state)).await;
        assert_eq!(resp.conversations, 1);
        assert_eq!(resp.status, "ok");
        assert!(!resp.passthrough);
    }

    #[tokio::test]
    async fn get_conversation_404s_for_unknown_key() {
        let state = test_state();
        let result = get_conversation(State(state), Path("missing".to_string())).await;
        assert!(matches!(result, Err(DashboardError::NotFound(_))));
    }

    #[tokio::test]
    async fn reset_with_no_body_resets_everything() {
        let state = test_state();
        state.store.get_or_create("k1", "tiny", 100);
        state.store.get_or_create("k2", "tiny", 100);
        let Json(resp) = reset(State(state), None).await;
        assert_eq!(resp.reset_count, 2);
    }
}
