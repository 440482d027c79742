//! `BufferEngine` — the per-conversation double-buffer state machine.
//!
//! Orchestrates `ConversationStore`, `CompactionDetector`, and
//! `CheckpointExecutor`: decides when to start a background checkpoint,
//! when a checkpoint becomes swap-eligible, and what to return in response
//! to a compact request.

use crate::checkpoint::{CheckpointExecutor, CheckpointSnapshot, Upstream};
use crate::detector::Classification;
use crate::error::CheckpointError;
use crate::events::DashboardEvent;
use crate::store::{Backoff, ConversationState, ConversationStore, Phase};
use crate::tokens::MessageRef;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Thresholds and timing knobs the engine consults on every request.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub checkpoint_threshold: f64,
    pub swap_threshold: f64,
    pub compact_trigger_tokens: u64,
    pub checkpoint_timeout: Duration,
}

/// What `ProxyHandler` should do with a request, per spec §4.6 step 5.
pub enum ConsultOutcome {
    /// Serve this response instead of contacting upstream.
    Substitute {
        model: String,
        checkpoint_content: String,
        input_tokens: u32,
    },
    /// Forward to upstream as usual.
    Forward,
}

/// The state machine itself. Stateless beyond its config/collaborators —
/// all mutable state lives on `ConversationState`, which is always accessed
/// through the per-conversation mutex `ConversationStore` hands out.
pub struct BufferEngine {
    config: EngineConfig,
    upstream: Arc<dyn Upstream>,
    store: Arc<ConversationStore>,
    passthrough: bool,
    events: broadcast::Sender<DashboardEvent>,
}

impl BufferEngine {
    pub fn new(
        config: EngineConfig,
        upstream: Arc<dyn Upstream>,
        store: Arc<ConversationStore>,
        passthrough: bool,
        events: broadcast::Sender<DashboardEvent>,
    ) -> Self {
        Self {
            config,
            upstream,
            store,
            passthrough,
            events,
        }
    }

    pub fn passthrough(&self) -> bool {
        self.passthrough
    }

    /// Subscribe to the state-change event stream (for the dashboard
    /// websocket; each subscriber gets its own lagging-tolerant receiver).
    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }

    /// Append newly observed messages (those beyond what's already
    /// tracked) and update the token total under the per-conversation
    /// mutex, preserving order (spec §4.6 step 3).
    pub async fn observe(
        &self,
        handle: &Arc<Mutex<ConversationState>>,
        new_messages: impl IntoIterator<Item = MessageRef>,
        observed_tokens: Option<u32>,
    ) {
        let mut state = handle.lock().await;
        state.messages.extend(new_messages);
        if let Some(tokens) = observed_tokens {
            state.total_input_tokens = tokens;
        } else {
            state.total_input_tokens = crate::tokens::estimate_message_tokens(&state.messages);
        }
        state.last_activity_at = std::time::Instant::now();
        self.notify(&state);
    }

    /// Decide whether to substitute a precomputed response or forward
    /// upstream, and (for `IDLE → IDLE` with no checkpoint ready, or after
    /// serving a substitute) perform the associated transition.
    ///
    /// If `self.passthrough` is set, always returns `Forward` without
    /// consulting the state machine, per spec §4.6's passthrough mode.
    pub async fn consult(&self, handle: &Arc<Mutex<ConversationState>>, classification: Classification) -> ConsultOutcome {
        if self.passthrough {
            return ConsultOutcome::Forward;
        }

        let mut state = handle.lock().await;

        if classification == Classification::Compact
            && matches!(state.phase, Phase::WalActive | Phase::SwapReady)
            && state.checkpoint_content.is_some()
        {
            state.phase = Phase::SwapExecuting;
            let content = state.checkpoint_content.clone().unwrap();
            let model = state.model.clone();
            let input_tokens = state.total_input_tokens;

            // Transition SWAP_EXECUTING -> IDLE immediately: the substitute
            // response is synthesized synchronously, there's no async leg
            // to wait on before the swap is considered complete. The prior
            // message history is superseded by the checkpoint summary the
            // client now holds in its place.
            state.phase = Phase::Idle;
            state.checkpoint_content = None;
            state.wal_start_index = None;
            state.messages.clear();
            state.total_input_tokens = 0;
            self.notify(&state);

            return ConsultOutcome::Substitute {
                model,
                checkpoint_content: content,
                input_tokens,
            };
        }

        ConsultOutcome::Forward
    }

    /// Re-evaluate whether a checkpoint should start, and spawn one if so.
    /// Call after every observation (spec §4.6 step 6, and step 3 for the
    /// initial threshold crossing).
    pub fn maybe_start_checkpoint(&self, handle: Arc<Mutex<ConversationState>>) {
        let config = self.config.clone();
        let upstream = self.upstream.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let snapshot = {
                let mut state = handle.lock().await;

                if state.phase == Phase::WalActive && state.utilization() >= config.swap_threshold {
                    state.phase = Phase::SwapReady;
                }

                if state.phase != Phase::Idle {
                    return;
                }
                if state.utilization() < config.checkpoint_threshold {
                    return;
                }
                if let Some(backoff) = &state.backoff {
                    if backoff.is_active() {
                        return;
                    }
                }

                state.phase = Phase::CheckpointPending;
                let epoch = state.next_epoch();
                let epoch_rx = state.epoch_receiver();
                state.phase = Phase::Checkpointing;
                state.in_flight_checkpoint_epoch = Some(epoch);
                state.checkpoint_started_at = Some(chrono::Utc::now());
                let wal_start_index_candidate = state.messages.len();

                Some((
                    CheckpointSnapshot {
                        model: state.model.clone(),
                        messages: state.messages.clone(),
                        total_input_tokens: state.total_input_tokens,
                        epoch,
                        epoch_rx,
                    },
                    wal_start_index_candidate,
                ))
            };

            let Some((snapshot, wal_start_index_candidate)) = snapshot else {
                return;
            };

            let result = CheckpointExecutor::run(
                &snapshot,
                upstream,
                config.compact_trigger_tokens,
                config.checkpoint_timeout,
            )
            .await;

            let mut state = handle.lock().await;

            // The task must verify the epoch still matches before
            // committing: a reset or a superseding checkpoint bumps the
            // epoch, and this result is stale (spec §4.5, §9).
            if state.in_flight_checkpoint_epoch != Some(snapshot.epoch) {
                return;
            }

            match result {
                Ok(summary) => {
                    state.checkpoint_content = Some(summary);
                    state.wal_start_index = Some(wal_start_index_candidate);
                    state.checkpoint_completed_at = Some(chrono::Utc::now());
                    state.phase = Phase::WalActive;
                    state.in_flight_checkpoint_epoch = None;
                    state.backoff = None;
                }
                Err(CheckpointError::TooSmall) => {
                    state.phase = Phase::Idle;
                    state.in_flight_checkpoint_epoch = None;
                }
                Err(CheckpointError::Cancelled) => {
                    // Discard silently; a reset already cleared the rest
                    // of the state.
                }
                Err(CheckpointError::NetworkError(_)) | Err(CheckpointError::UpstreamError(_)) => {
                    state.phase = Phase::Idle;
                    state.in_flight_checkpoint_epoch = None;
                    state.backoff = Some(Backoff::armed_from(state.backoff.as_ref()));
                }
            }

            let events_tx = events;
            let _ = events_tx.send(DashboardEvent::StateUpdate {
                conversation: state.summary_view(),
            });
        });
    }

    fn notify(&self, state: &ConversationState) {
        let _ = self.events.send(DashboardEvent::StateUpdate {
            conversation: state.summary_view(),
        });
    }

    /// Push an `ApiError` event to dashboard subscribers after a forwarding
    /// attempt fails, either at the network level (`status: None`) or with a
    /// non-2xx upstream response.
    pub fn notify_api_error(&self, conv_id: &str, status: Option<u16>, message: String) {
        let _ = self.events.send(DashboardEvent::ApiError {
            conv_id: conv_id.to_string(),
            status,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MockUpstream;
    use crate::tokens::message_ref;
    use std::time::Duration;

    fn engine_with(upstream: Arc<dyn Upstream>, passthrough: bool) -> (BufferEngine, Arc<ConversationStore>) {
        let store = Arc::new(ConversationStore::new(Duration::from_secs(3600)));
        let (tx, _rx) = broadcast::channel(16);
        let engine = BufferEngine::new(
            EngineConfig {
                checkpoint_threshold: 0.70,
                swap_threshold: 0.80,
                compact_trigger_tokens: 0,
                checkpoint_timeout: Duration::from_secs(5),
            },
            upstream,
            store.clone(),
            passthrough,
            tx,
        );
        (engine, store)
    }

    async fn wait_until<F: Fn() -> bool>(f: F) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn idle_stays_idle_below_threshold() {
        let upstream = MockUpstream::new(Ok("SUMMARY".to_string()));
        let (engine, store) = engine_with(upstream, false);
        let (handle, _) = store.get_or_create("k1", "tiny", 100);
        engine.observe(&handle, vec![message_ref("user", "hi")], Some(50)).await;
        engine.maybe_start_checkpoint(handle.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.lock().await.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn crossing_checkpoint_threshold_reaches_wal_active() {
        let upstream = MockUpstream::new(Ok("SUMMARY-X".to_string()));
        let (engine, store) = engine_with(upstream, false);
        let (handle, _) = store.get_or_create("k1", "tiny", 100);
        engine.observe(&handle, vec![message_ref("user", "hi")], Some(72)).await;
        engine.maybe_start_checkpoint(handle.clone());

        wait_until(|| {
            let state = handle.try_lock();
            matches!(state, Ok(s) if s.phase == Phase::WalActive)
        })
        .await;

        let state = handle.lock().await;
        assert_eq!(state.checkpoint_content.as_deref(), Some("SUMMARY-X"));
        assert_eq!(state.wal_start_index, Some(1));
    }

    #[tokio::test]
    async fn compact_request_served_from_wal_active_never_calls_upstream_again() {
        let upstream = MockUpstream::new(Ok("SUMMARY-X".to_string()));
        let (engine, store) = engine_with(upstream.clone(), false);
        let (handle, _) = store.get_or_create("k1", "tiny", 100);
        engine.observe(&handle, vec![message_ref("user", "hi")], Some(72)).await;
        engine.maybe_start_checkpoint(handle.clone());
        wait_until(|| matches!(handle.try_lock(), Ok(s) if s.phase == Phase::WalActive)).await;

        let calls_before = upstream.call_count();
        let outcome = engine.consult(&handle, Classification::Compact).await;
        match outcome {
            ConsultOutcome::Substitute { checkpoint_content, .. } => {
                assert_eq!(checkpoint_content, "SUMMARY-X");
            }
            ConsultOutcome::Forward => panic!("expected substitute"),
        }
        assert_eq!(upstream.call_count(), calls_before);
        assert_eq!(handle.lock().await.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn compact_request_with_no_checkpoint_forwards() {
        let upstream = MockUpstream::new(Ok("unused".to_string()));
        let (engine, store) = engine_with(upstream, false);
        let (handle, _) = store.get_or_create("k1", "tiny", 100);
        let outcome = engine.consult(&handle, Classification::Compact).await;
        assert!(matches!(outcome, ConsultOutcome::Forward));
        assert_eq!(handle.lock().await.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn checkpoint_failure_returns_to_idle_and_arms_backoff() {
        let upstream = MockUpstream::new(Err(CheckpointError::UpstreamError(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        )));
        let (engine, store) = engine_with(upstream, false);
        let (handle, _) = store.get_or_create("k1", "tiny", 100);
        engine.observe(&handle, vec![message_ref("user", "hi")], Some(72)).await;
        engine.maybe_start_checkpoint(handle.clone());

        wait_until(|| matches!(handle.try_lock(), Ok(s) if s.phase == Phase::Idle && s.backoff.is_some())).await;

        let state = handle.lock().await;
        assert!(state.checkpoint_content.is_none());
        assert!(state.backoff.as_ref().unwrap().is_active());
    }

    #[tokio::test]
    async fn notify_api_error_reaches_subscribers() {
        let upstream = MockUpstream::new(Ok("unused".to_string()));
        let (engine, _store) = engine_with(upstream, false);
        let mut rx = engine.subscribe();
        engine.notify_api_error("conv-1", Some(502), "bad gateway".to_string());
        let event = rx.try_recv().unwrap();
        match event {
            DashboardEvent::ApiError { conv_id, status, message } => {
                assert_eq!(conv_id, "conv-1");
                assert_eq!(status, Some(502));
                assert_eq!(message, "bad gateway");
            }
            _ => panic!("expected ApiError"),
        }
    }

    #[tokio::test]
    async fn passthrough_mode_never_substitutes() {
        let upstream = MockUpstream::new(Ok("SUMMARY".to_string()));
        let (engine, store) = engine_with(upstream, true);
        let (handle, _) = store.get_or_create("k1", "tiny", 100);
        {
            let mut state = handle.lock().await;
            state.phase = Phase::WalActive;
            state.checkpoint_content = Some("SUMMARY".to_string());
        }
        let outcome = engine.consult(&handle, Classification::Compact).await;
        assert!(matches!(outcome, ConsultOutcome::Forward));
    }
}
