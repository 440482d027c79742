//! The proxy request handler: the single entry point every inbound request
//! passes through, whether it ends up forwarded to upstream or served from
//! a precomputed checkpoint.

use crate::detector::CompactionDetector;
use crate::engine::{BufferEngine, ConsultOutcome};
use crate::error::ProxyError;
use crate::persistence::{self, ConversationRow, DbPool};
use crate::sse;
use crate::store::{ConversationState, ConversationStore};
use crate::tokens::{message_ref, MessageRef, ModelWindows};
use axum::{
    body::Body,
    extract::State,
    http::{Request, Response, StatusCode},
};
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Mutex;

/// Shared state for the proxy server. Cloned per-connection; the expensive
/// parts (`reqwest::Client`, the store, the engine) are reference-counted.
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub api_url: String,
    pub store: Arc<ConversationStore>,
    pub engine: Arc<BufferEngine>,
    pub detector: Arc<CompactionDetector>,
    pub model_windows: Arc<ModelWindows>,
    pub db_pool: Option<DbPool>,
}

/// Main proxy handler: intercepts, classifies, and either substitutes a
/// precomputed response or forwards to upstream.
pub async fn proxy_handler(State(state): State<ProxyState>, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    tracing::debug!(%method, path = %uri.path(), "proxying request");

    let body_bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| ProxyError::ClientRequestMalformed(e.to_string()))?;

    let is_completion_endpoint = uri.path().ends_with("/v1/messages") || uri.path().ends_with("/v1/chat/completions");

    if !is_completion_endpoint || method != axum::http::Method::POST {
        return forward_raw(&state, method, &uri, &headers, body_bytes).await;
    }

    let parsed: Value = serde_json::from_slice(&body_bytes)
        .map_err(|e| ProxyError::ClientRequestMalformed(format!("invalid JSON body: {e}")))?;

    let model = parsed.get("model").and_then(Value::as_str).unwrap_or("unknown").to_string();
    let system_prompt = extract_system_text(&parsed);
    let messages = extract_messages(&parsed);
    let first_user_message = messages
        .iter()
        .find(|(role, _)| role == "user")
        .map(|(_, text)| text.clone())
        .unwrap_or_default();
    let last_user_text = messages
        .iter()
        .rev()
        .find(|(role, _)| role == "user")
        .map(|(_, text)| text.clone())
        .unwrap_or_default();
    let session_id = extract_session_id(&parsed);

    let key = ConversationStore::fingerprint(session_id.as_deref(), &system_prompt, &first_user_message);
    let context_window = state.model_windows.context_window_for(&model);
    let (handle, _created) = state.store.get_or_create(&key, &model, context_window);

    let history_len_before = handle.lock().await.messages.len();
    let classification = state.detector.classify(uri.path(), history_len_before, &last_user_text);

    // The client resends the full history on every turn; only the suffix
    // beyond what's already tracked is newly observed (spec §4.6 step 3).
    let skip = history_len_before.min(messages.len());
    let new_message_refs = messages
        .into_iter()
        .skip(skip)
        .map(|(role, text)| message_ref(&role, &text));
    state.engine.observe(&handle, new_message_refs, None).await;

    if let Some(pool) = &state.db_pool {
        persist_snapshot(pool, &handle).await;
    }

    match state.engine.consult(&handle, classification).await {
        ConsultOutcome::Substitute {
            model,
            checkpoint_content,
            input_tokens,
        } => {
            tracing::info!(%key, "serving compact request from precomputed checkpoint");
            let output_tokens = crate::tokens::estimate_tokens(&checkpoint_content);
            let wants_stream = parsed.get("stream").and_then(Value::as_bool).unwrap_or(false);

            let response = if wants_stream {
                let body = sse::synthesize_substitute_sse(&model, &checkpoint_content, input_tokens, output_tokens);
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/event-stream")
                    .body(Body::from(body))
            } else {
                let body = sse::synthesize_substitute_json(&model, &checkpoint_content, input_tokens, output_tokens);
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
            };

            response.map_err(|e| ProxyError::ResponseBuild(e.to_string()))
        }
        ConsultOutcome::Forward => forward_and_observe(&state, &handle, method, &uri, &headers, body_bytes).await,
    }
}

async fn persist_snapshot(pool: &DbPool, handle: &Arc<tokio::sync::Mutex<crate::store::ConversationState>>) {
    let pool = pool.clone();
    let state = handle.lock().await;
    let row = ConversationRow {
        key: state.key.clone(),
        conv_id: state.conv_id.clone(),
        model: state.model.clone(),
        phase: state.phase.as_str().to_string(),
        total_input_tokens: state.total_input_tokens,
        context_window: state.context_window,
        wal_start_index: state.wal_start_index.map(|i| i as i64),
        checkpoint_content: state.checkpoint_content.clone(),
        updated_at: chrono::Utc::now(),
    };
    drop(state);
    tokio::task::spawn_blocking(move || persistence::save_conversation(&pool, &row));
}

/// Send a request upstream, preserving the client's authorization header
/// verbatim and converting header/method types between axum's and
/// reqwest's independent `http` crate versions via their string/byte
/// representations. Returns the response with its body unread, so the
/// caller can choose to buffer it or stream it straight to the client.
async fn send_upstream(
    state: &ProxyState,
    method: axum::http::Method,
    uri: &axum::http::Uri,
    headers: &axum::http::HeaderMap,
    body_bytes: bytes::Bytes,
) -> Result<reqwest::Response, ProxyError> {
    let forward_url = format!("{}{}", state.api_url, uri.path());
    let forward_url = match uri.query() {
        Some(q) if !q.is_empty() => format!("{forward_url}?{q}"),
        _ => forward_url,
    };

    let forward_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| ProxyError::ClientRequestMalformed(format!("invalid method: {e}")))?;

    let mut forward_req = state.client.request(forward_method, &forward_url).body(body_bytes.to_vec());

    for (key, value) in headers.iter() {
        if key == "host" || key == "connection" || key == "transfer-encoding" {
            continue;
        }
        forward_req = forward_req.header(key.as_str(), value.as_bytes().to_vec());
    }

    forward_req.send().await.map_err(|e| ProxyError::NetworkError(e.to_string()))
}

/// Start an axum response builder from an upstream response's status and
/// headers, dropping the hop-by-hop ones that don't carry across the proxy
/// boundary.
fn response_builder_from(response: &reqwest::Response) -> axum::http::response::Builder {
    let mut builder = Response::builder().status(response.status().as_u16());
    for (key, value) in response.headers().iter() {
        if key == "transfer-encoding" || key == "connection" {
            continue;
        }
        builder = builder.header(key.as_str(), value.as_bytes().to_vec());
    }
    builder
}

/// Forward traffic the engine never observes — anything but a POST to a
/// completion endpoint — as a plain buffered passthrough.
async fn forward_raw(
    state: &ProxyState,
    method: axum::http::Method,
    uri: &axum::http::Uri,
    headers: &axum::http::HeaderMap,
    body_bytes: bytes::Bytes,
) -> Result<Response<Body>, ProxyError> {
    let response = send_upstream(state, method, uri, headers, body_bytes).await?;
    let builder = response_builder_from(&response);
    let body = response.bytes().await.map_err(|e| ProxyError::NetworkError(e.to_string()))?;
    builder.body(Body::from(body)).map_err(|e| ProxyError::ResponseBuild(e.to_string()))
}

async fn conv_id_of(handle: &Arc<Mutex<ConversationState>>) -> String {
    handle.lock().await.conv_id.clone()
}

/// Forward a completion-endpoint request and, once it's done, observe the
/// authoritative usage it reports (Open Question (b)): the non-streaming
/// body's `usage` object, or a streamed response's final `message_delta`
/// event. A streaming response is teed to the client as it arrives rather
/// than buffered first, so forwarding never waits on the full body.
async fn forward_and_observe(
    state: &ProxyState,
    handle: &Arc<Mutex<ConversationState>>,
    method: axum::http::Method,
    uri: &axum::http::Uri,
    headers: &axum::http::HeaderMap,
    body_bytes: bytes::Bytes,
) -> Result<Response<Body>, ProxyError> {
    let response = match send_upstream(state, method, uri, headers, body_bytes).await {
        Ok(response) => response,
        Err(e) => {
            state.engine.notify_api_error(&conv_id_of(handle).await, None, e.to_string());
            return Err(e);
        }
    };

    let status = response.status();
    if !status.is_success() {
        let conv_id = conv_id_of(handle).await;
        let builder = response_builder_from(&response);
        let body = response.bytes().await.map_err(|e| ProxyError::NetworkError(e.to_string()))?;
        state
            .engine
            .notify_api_error(&conv_id, Some(status.as_u16()), String::from_utf8_lossy(&body).into_owned());
        return builder.body(Body::from(body)).map_err(|e| ProxyError::ResponseBuild(e.to_string()));
    }

    if sse::is_sse_response(response.headers()) {
        let builder = response_builder_from(&response);
        let (usage_tx, usage_rx) = tokio::sync::oneshot::channel();
        let stream = ObservingSseStream::new(response.bytes_stream(), usage_tx);

        let engine = state.engine.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Ok(input_tokens) = usage_rx.await {
                observe_usage(&engine, &handle, input_tokens).await;
            }
        });

        builder
            .body(Body::from_stream(stream))
            .map_err(|e| ProxyError::ResponseBuild(e.to_string()))
    } else {
        let builder = response_builder_from(&response);
        let body = response.bytes().await.map_err(|e| ProxyError::NetworkError(e.to_string()))?;
        let input_tokens = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get("usage").and_then(sse::input_tokens_from_usage));
        observe_usage(&state.engine, handle, input_tokens).await;
        builder.body(Body::from(body)).map_err(|e| ProxyError::ResponseBuild(e.to_string()))
    }
}

/// If authoritative usage came back, record it (request-side observation
/// already appended the new messages; this only corrects the token total).
/// Otherwise the estimate from the request body stands, per Open Question
/// (b)'s documented fallback. Either way, re-evaluate whether a checkpoint
/// should now start.
async fn observe_usage(engine: &BufferEngine, handle: &Arc<Mutex<ConversationState>>, input_tokens: Option<u32>) {
    if let Some(tokens) = input_tokens {
        engine.observe(handle, std::iter::empty::<MessageRef>(), Some(tokens)).await;
    }
    engine.maybe_start_checkpoint(handle.clone());
}

/// Tees an upstream SSE byte stream to the client while scanning it
/// line-by-line for the final `message_delta` event's `usage` object,
/// without buffering the whole body before forwarding starts. Reports the
/// extracted input-token count (if any) over `done_tx` once the stream ends.
struct ObservingSseStream<S> {
    inner: Pin<Box<S>>,
    pending_line: String,
    usage: Option<Value>,
    done_tx: Option<tokio::sync::oneshot::Sender<Option<u32>>>,
}

impl<S> ObservingSseStream<S>
where
    S: Stream<Item = reqwest::Result<bytes::Bytes>>,
{
    fn new(inner: S, done_tx: tokio::sync::oneshot::Sender<Option<u32>>) -> Self {
        Self {
            inner: Box::pin(inner),
            pending_line: String::new(),
            usage: None,
            done_tx: Some(done_tx),
        }
    }

    fn scan_chunk(&mut self, chunk: &bytes::Bytes) {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return;
        };
        self.pending_line.push_str(text);
        while let Some(idx) = self.pending_line.find('\n') {
            let line = self.pending_line[..idx].trim_end_matches('\r').to_string();
            self.pending_line.drain(..=idx);
            if let Some(usage) = sse::extract_usage_delta(&line) {
                self.usage = Some(usage);
            }
        }
    }
}

impl<S> Stream for ObservingSseStream<S>
where
    S: Stream<Item = reqwest::Result<bytes::Bytes>>,
{
    type Item = reqwest::Result<bytes::Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.scan_chunk(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                if let Some(tx) = this.done_tx.take() {
                    let input_tokens = this.usage.as_ref().and_then(sse::input_tokens_from_usage);
                    let _ = tx.send(input_tokens);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Flatten an Anthropic-shaped `content` field (string, or array of content
/// blocks) down to its text.
fn extract_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn extract_system_text(body: &Value) -> String {
    body.get("system").map(extract_text).unwrap_or_default()
}

fn extract_messages(body: &Value) -> Vec<(String, String)> {
    body.get("messages")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|m| {
                    let role = m.get("role").and_then(Value::as_str).unwrap_or("user").to_string();
                    let text = m.get("content").map(extract_text).unwrap_or_default();
                    (role, text)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// A client-supplied session identifier, when present in request metadata
/// (DESIGN.md Open Question (c)): Anthropic's `metadata.user_id`, or a
/// bare top-level `session_id`.
fn extract_session_id(body: &Value) -> Option<String> {
    body.get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(Value::as_str)
        .or_else(|| body.get("session_id").and_then(Value::as_str))
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_handles_plain_string() {
        let v = Value::String("hello".to_string());
        assert_eq!(extract_text(&v), "hello");
    }

    #[test]
    fn extract_text_handles_content_blocks() {
        let v = serde_json::json!([{"type": "text", "text": "part one"}, {"type": "text", "text": "part two"}]);
        assert_eq!(extract_text(&v), "part one\npart two");
    }

    #[test]
    fn extract_messages_pulls_role_and_text() {
        let body = serde_json::json!({
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [{"type": "text", "text": "hello there"}]},
            ]
        });
        let messages = extract_messages(&body);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], ("user".to_string(), "hi".to_string()));
        assert_eq!(messages[1], ("assistant".to_string(), "hello there".to_string()));
    }

    #[test]
    fn extract_session_id_prefers_metadata_user_id() {
        let body = serde_json::json!({"metadata": {"user_id": "abc123"}, "session_id": "other"});
        assert_eq!(extract_session_id(&body).as_deref(), Some("abc123"));
    }

    #[test]
    fn extract_session_id_falls_back_to_top_level() {
        let body = serde_json::json!({"session_id": "xyz"});
        assert_eq!(extract_session_id(&body).as_deref(), Some("xyz"));
    }

    #[test]
    fn extract_session_id_absent_returns_none() {
        let body = serde_json::json!({"model": "tiny"});
        assert_eq!(extract_session_id(&body), None);
    }
}

/// Handler-level integration tests: drive `proxy_handler` end to end against
/// a real mock HTTP server rather than a swapped-in `Upstream` mock, so the
/// byte-faithful forwarding and SSE-teeing behavior is exercised for real.
#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::checkpoint::MockUpstream;
    use crate::detector::CompactionDetector;
    use crate::engine::{BufferEngine, EngineConfig};
    use crate::events::DashboardEvent;
    use crate::store::ConversationStore;
    use crate::tokens::ModelWindows;
    use axum::http::Method;
    use std::time::Duration;
    use wiremock::matchers::{method as method_matcher, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_state(api_url: String) -> ProxyState {
        let store = Arc::new(ConversationStore::new(Duration::from_secs(3600)));
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let upstream = MockUpstream::new(Ok("SUMMARY".to_string()));
        let engine = Arc::new(BufferEngine::new(
            EngineConfig {
                checkpoint_threshold: 0.70,
                swap_threshold: 0.80,
                compact_trigger_tokens: 1_000_000,
                checkpoint_timeout: Duration::from_secs(5),
            },
            upstream,
            store.clone(),
            false,
            tx,
        ));
        ProxyState {
            client: reqwest::Client::new(),
            api_url,
            store,
            engine,
            detector: Arc::new(CompactionDetector::default()),
            model_windows: Arc::new(ModelWindows::default()),
            db_pool: None,
        }
    }

    fn json_request(path: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .header("authorization", "Bearer test-key")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn forwards_non_completion_traffic_verbatim() {
        let mock_server = MockServer::start().await;
        Mock::given(method_matcher("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"models":["tiny"]}"#))
            .mount(&mock_server)
            .await;

        let state = test_state(mock_server.uri()).await;
        let req = Request::builder().method(Method::GET).uri("/v1/models").body(Body::empty()).unwrap();
        let response = proxy_handler(State(state), req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"models":["tiny"]}"#);
    }

    #[tokio::test]
    async fn forwards_completion_request_and_records_authoritative_usage() {
        let mock_server = MockServer::start().await;
        Mock::given(method_matcher("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "tiny",
                "content": [{"type": "text", "text": "hi there"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 77, "output_tokens": 3},
            })))
            .mount(&mock_server)
            .await;

        let state = test_state(mock_server.uri()).await;
        let body = serde_json::json!({
            "model": "tiny",
            "messages": [{"role": "user", "content": "hello"}],
        });
        let response = proxy_handler(State(state.clone()), json_request("/v1/messages", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response_body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&response_body).unwrap();
        assert_eq!(parsed["content"][0]["text"], "hi there");

        let key = state.store.snapshot().await[0].key.clone();
        let handle = state.store.get(&key).unwrap();
        assert_eq!(handle.lock().await.total_input_tokens, 77);
    }

    #[tokio::test]
    async fn sse_response_is_teed_and_final_usage_recorded() {
        let mock_server = MockServer::start().await;
        let sse_body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"model\":\"tiny\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"input_tokens\":33,\"output_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method_matcher("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&mock_server)
            .await;

        let state = test_state(mock_server.uri()).await;
        let body = serde_json::json!({
            "model": "tiny",
            "messages": [{"role": "user", "content": "hello"}],
            "stream": true,
        });
        let response = proxy_handler(State(state.clone()), json_request("/v1/messages", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response_body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&response_body[..], sse_body.as_bytes());

        let key = state.store.snapshot().await[0].key.clone();
        let handle = state.store.get(&key).unwrap();
        for _ in 0..50 {
            if handle.lock().await.total_input_tokens == 33 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("usage from the streamed response was never recorded");
    }

    #[tokio::test]
    async fn upstream_error_is_forwarded_verbatim_and_raises_api_error_event() {
        let mock_server = MockServer::start().await;
        Mock::given(method_matcher("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429).set_body_string(r#"{"error":{"message":"rate limited"}}"#))
            .mount(&mock_server)
            .await;

        let state = test_state(mock_server.uri()).await;
        let mut events_rx = state.engine.subscribe();
        let body = serde_json::json!({
            "model": "tiny",
            "messages": [{"role": "user", "content": "hello"}],
        });
        let response = proxy_handler(State(state.clone()), json_request("/v1/messages", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let response_body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&response_body[..], br#"{"error":{"message":"rate limited"}}"#);

        loop {
            match events_rx.recv().await.unwrap() {
                DashboardEvent::ApiError { status, message, .. } => {
                    assert_eq!(status, Some(429));
                    assert!(message.contains("rate limited"));
                    break;
                }
                DashboardEvent::StateUpdate { .. } => continue,
                other => panic!("expected ApiError, got {other:?}"),
            }
        }
    }
}
