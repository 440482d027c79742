//! The upstream abstraction, and the background checkpoint (summarization)
//! call that runs against it.

use crate::error::CheckpointError;
use crate::tokens::MessageRef;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A boxed, `Send` future, used so `Upstream` can be an object-safe trait
/// (async fns in traits aren't dyn-compatible on their own).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything `CheckpointExecutor` needs to summarize a conversation
/// snapshot, and the non-streaming call `ProxyHandler` uses when it can't
/// serve a request from a precomputed checkpoint.
///
/// Abstracted behind a trait so the state machine and the handler can be
/// exercised against `MockUpstream` without a real network call.
pub trait Upstream: Send + Sync + 'static {
    /// Issue a one-shot, non-streaming summarization call.
    fn summarize(&self, model: &str, messages: &[MessageRef]) -> BoxFuture<'_, Result<String, CheckpointError>>;
}

/// The default, real upstream: a pooled `reqwest::Client` talking to the
/// configured Anthropic-compatible host.
pub struct ReqwestUpstream {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl ReqwestUpstream {
    pub fn new(api_url: String, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .pool_max_idle_per_host(10)
            .http1_only()
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build upstream client: {e}"))?;
        Ok(Self { client, api_url, api_key })
    }
}

/// The prompt the checkpoint executor sends upstream: the conversation so
/// far, followed by an instruction to produce a detailed summary.
fn build_checkpoint_request(model: &str, messages: &[MessageRef]) -> serde_json::Value {
    let mut body_messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content_preview }))
        .collect();
    body_messages.push(json!({
        "role": "user",
        "content": "Please provide a detailed summary of the conversation so far, \
                    preserving the key technical concepts, decisions, and pending work."
    }));

    json!({
        "model": model,
        "max_tokens": 4096,
        "stream": false,
        "messages": body_messages,
    })
}

impl Upstream for ReqwestUpstream {
    fn summarize(&self, model: &str, messages: &[MessageRef]) -> BoxFuture<'_, Result<String, CheckpointError>> {
        let body = build_checkpoint_request(model, messages);
        let url = format!("{}/v1/messages", self.api_url);
        let api_key = self.api_key.clone();
        let client = self.client.clone();

        Box::pin(async move {
            let response = client
                .post(&url)
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send()
                .await
                .map_err(|e| CheckpointError::NetworkError(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(CheckpointError::UpstreamError(
                    axum::http::StatusCode::from_u16(status.as_u16())
                        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY),
                ));
            }

            let parsed: serde_json::Value = response
                .json()
                .await
                .map_err(|e| CheckpointError::NetworkError(e.to_string()))?;

            let text = parsed["content"]
                .as_array()
                .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
                .and_then(|b| b["text"].as_str())
                .unwrap_or("")
                .to_string();

            Ok(text)
        })
    }
}

/// A snapshot of the inputs a checkpoint run needs, captured under the
/// per-conversation mutex and then released before the await (spec §4.5,
/// §9: the mutex is never held across upstream I/O).
pub struct CheckpointSnapshot {
    pub model: String,
    pub messages: Vec<MessageRef>,
    pub total_input_tokens: u32,
    /// The epoch captured at spawn time; the caller must verify this still
    /// matches `ConversationState::in_flight_checkpoint_epoch` before
    /// committing the result.
    pub epoch: u64,
    /// Subscribed to `epoch` at spawn time; resolves the instant a
    /// superseding bump happens, so `run` can cancel the upstream call
    /// directly instead of only noticing the mismatch after it returns.
    pub epoch_rx: tokio::sync::watch::Receiver<u64>,
}

/// Runs one background summarization attempt. Stateless: all the
/// cancellation/commit logic lives in `BufferEngine`, which is the only
/// caller that touches `ConversationState` directly.
pub struct CheckpointExecutor;

impl CheckpointExecutor {
    /// `timeout` is the 120s ceiling from spec §5. Returns `TooSmall`
    /// without calling upstream when below `compact_trigger_tokens`.
    pub async fn run(
        snapshot: &CheckpointSnapshot,
        upstream: Arc<dyn Upstream>,
        compact_trigger_tokens: u64,
        timeout: Duration,
    ) -> Result<String, CheckpointError> {
        if (snapshot.total_input_tokens as u64) < compact_trigger_tokens {
            return Err(CheckpointError::TooSmall);
        }

        let mut epoch_rx = snapshot.epoch_rx.clone();
        let call = tokio::time::timeout(timeout, upstream.summarize(&snapshot.model, &snapshot.messages));

        tokio::select! {
            result = call => match result {
                Ok(inner) => inner,
                Err(_) => Err(CheckpointError::NetworkError("checkpoint call timed out".to_string())),
            },
            _ = epoch_rx.changed() => Err(CheckpointError::Cancelled),
        }
    }
}

/// Test-only upstream with scripted responses, used to drive spec.md §8's
/// scenarios without a network dependency.
#[cfg(test)]
pub struct MockUpstream {
    pub response: std::sync::Mutex<Option<Result<String, CheckpointError>>>,
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockUpstream {
    pub fn new(response: Result<String, CheckpointError>) -> Arc<Self> {
        Arc::new(Self {
            response: std::sync::Mutex::new(Some(response)),
            calls: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Upstream for MockUpstream {
    fn summarize(&self, _model: &str, _messages: &[MessageRef]) -> BoxFuture<'_, Result<String, CheckpointError>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let response = self
            .response
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(CheckpointError::NetworkError("mock exhausted".to_string())));
        Box::pin(async move { response })
    }
}
