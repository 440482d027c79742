//! Conversation state and the store that owns it.
//!
//! One `ConversationState` per tracked conversation; `ConversationStore`
//! owns the `key -> state` map and serializes access to each entry behind
//! its own mutex, never holding that mutex across upstream I/O.

use crate::tokens::MessageRef;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::Mutex;

/// Phase of the double-buffer state machine (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    CheckpointPending,
    Checkpointing,
    WalActive,
    SwapReady,
    SwapExecuting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::CheckpointPending => "CHECKPOINT_PENDING",
            Phase::Checkpointing => "CHECKPOINTING",
            Phase::WalActive => "WAL_ACTIVE",
            Phase::SwapReady => "SWAP_READY",
            Phase::SwapExecuting => "SWAP_EXECUTING",
        }
    }
}

/// Backoff bookkeeping for a conversation that just failed a checkpoint
/// attempt (spec §4.5: base 30s, cap 10 min, exponential).
#[derive(Debug, Clone)]
pub struct Backoff {
    pub until: Instant,
    pub next_delay_secs: u64,
}

const BACKOFF_BASE_SECS: u64 = 30;
const BACKOFF_CAP_SECS: u64 = 600;

impl Backoff {
    /// Arm a new backoff window, doubling the previous delay (starting at
    /// the base) and capping it.
    pub fn armed_from(previous: Option<&Backoff>) -> Self {
        let next_delay_secs = previous
            .map(|b| (b.next_delay_secs * 2).min(BACKOFF_CAP_SECS))
            .unwrap_or(BACKOFF_BASE_SECS);
        Self {
            until: Instant::now() + std::time::Duration::from_secs(next_delay_secs),
            next_delay_secs,
        }
    }

    pub fn is_active(&self) -> bool {
        Instant::now() < self.until
    }
}

/// One tracked conversation. See spec.md §3 for the field-level contract
/// and invariants; `ConversationStore` and `BufferEngine` are the only
/// code that mutates this directly, always under `state`'s own mutex.
#[derive(Debug)]
pub struct ConversationState {
    pub key: String,
    pub conv_id: String,
    pub model: String,
    pub context_window: u32,
    pub phase: Phase,
    pub messages: Vec<MessageRef>,
    pub total_input_tokens: u32,
    pub wal_start_index: Option<usize>,
    pub checkpoint_content: Option<String>,
    pub checkpoint_started_at: Option<DateTime<Utc>>,
    pub checkpoint_completed_at: Option<DateTime<Utc>>,
    pub last_activity_at: Instant,
    /// Monotonically increasing; each spawned checkpoint task captures the
    /// value current at spawn time. `in_flight_checkpoint_epoch` is the
    /// handle: non-null exactly when `phase == Checkpointing`. `epoch_tx`
    /// carries every bump to whichever task is racing it, so a superseding
    /// bump cancels that task directly instead of only being noticed
    /// after the fact when it tries to commit.
    pub epoch: u64,
    epoch_tx: tokio::sync::watch::Sender<u64>,
    pub in_flight_checkpoint_epoch: Option<u64>,
    pub backoff: Option<Backoff>,
}

impl ConversationState {
    fn new(key: String, model: String, context_window: u32) -> Self {
        let conv_id = key.chars().take(8).collect();
        let (epoch_tx, _epoch_rx) = tokio::sync::watch::channel(0);
        Self {
            key,
            conv_id,
            model,
            context_window,
            phase: Phase::Idle,
            messages: Vec::new(),
            total_input_tokens: 0,
            wal_start_index: None,
            checkpoint_content: None,
            checkpoint_started_at: None,
            checkpoint_completed_at: None,
            last_activity_at: Instant::now(),
            epoch: 0,
            epoch_tx,
            in_flight_checkpoint_epoch: None,
            backoff: None,
        }
    }

    /// Build a dashboard-only placeholder from a persisted row (spec's
    /// display-only rehydration): the listing fields are restored, but
    /// phase/checkpoint state always starts fresh — a persisted checkpoint
    /// doesn't survive a restart as something live traffic can swap in.
    pub fn from_persisted(row: &crate::persistence::ConversationRow) -> Self {
        let mut state = Self::new(row.key.clone(), row.model.clone(), row.context_window);
        state.conv_id = row.conv_id.clone();
        state.total_input_tokens = row.total_input_tokens;
        state
    }

    /// `total_input_tokens / context_window`, clamped to non-negative.
    pub fn utilization(&self) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        (self.total_input_tokens as f64 / self.context_window as f64).max(0.0)
    }

    /// Bump the epoch and return the new value, to be captured by a freshly
    /// spawned checkpoint task as its cancellation handle. Also notifies any
    /// `epoch_receiver()` racing an in-flight checkpoint call.
    pub fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        let _ = self.epoch_tx.send(self.epoch);
        self.epoch
    }

    /// Subscribe to epoch changes, for `CheckpointExecutor::run` to race
    /// against its upstream call. Must be called after the epoch this
    /// receiver should treat as its baseline has already been sent, so the
    /// first `changed()` only resolves on a genuinely later bump.
    pub fn epoch_receiver(&self) -> tokio::sync::watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    /// Request cancellation of an in-flight checkpoint without resetting the
    /// rest of the conversation: clears the commit handle and bumps the
    /// epoch so the racing task's `epoch_receiver()` resolves to `Cancelled`.
    pub fn cancel_checkpoint(&mut self) {
        if self.in_flight_checkpoint_epoch.is_some() {
            self.in_flight_checkpoint_epoch = None;
            self.phase = Phase::Idle;
            self.next_epoch();
        }
    }

    /// Reset to a fresh `IDLE` conversation, preserving identity fields.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.messages.clear();
        self.total_input_tokens = 0;
        self.wal_start_index = None;
        self.checkpoint_content = None;
        self.checkpoint_started_at = None;
        self.checkpoint_completed_at = None;
        self.in_flight_checkpoint_epoch = None;
        self.backoff = None;
        self.next_epoch();
        self.last_activity_at = Instant::now();
    }

    /// A cheap, clonable view for the dashboard snapshot list.
    pub fn summary_view(&self) -> ConversationSummary {
        ConversationSummary {
            key: self.key.clone(),
            conv_id: self.conv_id.clone(),
            model: self.model.clone(),
            phase: self.phase,
            utilization: self.utilization(),
            total_input_tokens: self.total_input_tokens,
            context_window: self.context_window,
        }
    }

    /// The full per-conversation detail view (spec §4.7).
    pub fn detail_view(&self) -> ConversationDetail {
        ConversationDetail {
            summary: self.summary_view(),
            messages: self.messages.clone(),
            wal_start_index: self.wal_start_index,
            checkpoint_content: self.checkpoint_content.clone(),
        }
    }
}

/// Listing-page view: one row per tracked conversation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationSummary {
    pub key: String,
    pub conv_id: String,
    pub model: String,
    pub phase: Phase,
    pub utilization: f64,
    pub total_input_tokens: u32,
    pub context_window: u32,
}

/// Full detail view for `GET /dashboard/api/conversation/{key}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub summary: ConversationSummary,
    pub messages: Vec<MessageRefView>,
    pub wal_start_index: Option<usize>,
    pub checkpoint_content: Option<String>,
}

/// `MessageRef` doesn't derive `Serialize` on its own (it lives in
/// `tokens.rs`, shared with non-serialized call sites); this thin wrapper
/// lets the dashboard view serialize it without pulling serde into tokens.rs
/// for every caller.
pub type MessageRefView = crate::tokens::MessageRef;

impl serde::Serialize for crate::tokens::MessageRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("MessageRef", 3)?;
        s.serialize_field("role", &self.role)?;
        s.serialize_field("content_preview", &self.content_preview)?;
        s.serialize_field("tokens", &self.tokens)?;
        s.end()
    }
}

/// Owns every tracked conversation and serializes access to each one.
pub struct ConversationStore {
    entries: StdMutex<HashMap<String, Arc<Mutex<ConversationState>>>>,
    ttl: std::time::Duration,
}

impl ConversationStore {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Derive the conversation fingerprint (Open Question (c)): an
    /// explicit session id when the request carries one, otherwise
    /// SHA-256 of the system prompt plus the first user message.
    pub fn fingerprint(session_id: Option<&str>, system_prompt: &str, first_user_message: &str) -> String {
        if let Some(id) = session_id {
            if !id.is_empty() {
                return format!("sess-{id}");
            }
        }
        let mut hasher = Sha256::new();
        hasher.update(system_prompt.as_bytes());
        hasher.update(b"\0");
        hasher.update(first_user_message.as_bytes());
        format!("hash-{:x}", hasher.finalize())
    }

    /// Atomically fetch or create the state for `key`. Returns the shared
    /// handle and whether it was just created.
    pub fn get_or_create(&self, key: &str, model: &str, context_window: u32) -> (Arc<Mutex<ConversationState>>, bool) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(key) {
            return (existing.clone(), false);
        }
        let state = Arc::new(Mutex::new(ConversationState::new(
            key.to_string(),
            model.to_string(),
            context_window,
        )));
        entries.insert(key.to_string(), state.clone());
        (state, true)
    }

    /// Look up an existing entry without creating one.
    pub fn get(&self, key: &str) -> Option<Arc<Mutex<ConversationState>>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Point-in-time copy of every tracked conversation's summary view.
    /// No per-conversation lock is held after this returns.
    pub async fn snapshot(&self) -> Vec<ConversationSummary> {
        let handles: Vec<_> = self.entries.lock().unwrap().values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let state = handle.lock().await;
            out.push(state.summary_view());
        }
        out
    }

    /// Remove entries idle past the TTL. An idle entry with a checkpoint
    /// still running has that checkpoint actively cancelled first (not
    /// merely deferred), so eviction isn't forced to wait out the full
    /// checkpoint timeout for a conversation nobody cares about anymore.
    /// Returns the keys removed, for the caller to also drop any durable
    /// persisted row.
    pub async fn evict_idle(&self) -> Vec<String> {
        let handles: Vec<_> = self.entries.lock().unwrap().clone().into_iter().collect();
        let mut to_remove = Vec::new();
        for (key, handle) in &handles {
            let mut state = handle.lock().await;
            if state.last_activity_at.elapsed() > self.ttl {
                state.cancel_checkpoint();
                to_remove.push(key.clone());
            }
        }
        let mut entries = self.entries.lock().unwrap();
        for key in &to_remove {
            entries.remove(key);
        }
        to_remove
    }

    /// Cancel every in-flight checkpoint without removing any entry, for a
    /// bounded graceful shutdown to race against rather than waiting out
    /// whichever checkpoint timeout is longest.
    pub async fn cancel_all_checkpoints(&self) {
        let handles: Vec<_> = self.entries.lock().unwrap().values().cloned().collect();
        futures::future::join_all(handles.into_iter().map(|handle| async move {
            handle.lock().await.cancel_checkpoint();
        }))
        .await;
    }

    /// Reset one conversation (`Some(conv_id)`) or every tracked
    /// conversation (`None`). Cancellation of any in-flight checkpoint is
    /// implied: `reset` bumps the epoch, so a racing task's captured epoch
    /// no longer matches and its result is discarded on completion. Returns
    /// the store keys reset, for the caller to also drop any durable row.
    pub async fn reset(&self, conv_id: Option<&str>) -> Vec<String> {
        let handles: Vec<_> = self.entries.lock().unwrap().clone().into_iter().collect();
        let mut reset_keys = Vec::new();
        for (key, handle) in handles {
            let mut state = handle.lock().await;
            if conv_id.is_none() || conv_id == Some(state.conv_id.as_str()) {
                state.reset();
                reset_keys.push(key);
            }
        }
        reset_keys
    }

    /// Seed dashboard-only placeholders from rows persisted before a
    /// restart (spec's startup rehydration, display fields only). Never
    /// overwrites an entry that's already live.
    pub fn seed_from_persisted(&self, rows: Vec<crate::persistence::ConversationRow>) {
        let mut entries = self.entries.lock().unwrap();
        for row in rows {
            entries
                .entry(row.key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ConversationState::from_persisted(&row))));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_prefers_explicit_session_id() {
        let a = ConversationStore::fingerprint(Some("abc"), "sys", "hi");
        let b = ConversationStore::fingerprint(Some("abc"), "different-sys", "bye");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_falls_back_to_content_hash() {
        let a = ConversationStore::fingerprint(None, "sys", "hi");
        let b = ConversationStore::fingerprint(None, "sys", "hi");
        let c = ConversationStore::fingerprint(None, "sys", "bye");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_key() {
        let store = ConversationStore::new(std::time::Duration::from_secs(3600));
        let (first, created1) = store.get_or_create("k1", "tiny", 100);
        let (second, created2) = store.get_or_create("k1", "tiny", 100);
        assert!(created1);
        assert!(!created2);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn reset_clears_state_and_is_idempotent() {
        let store = ConversationStore::new(std::time::Duration::from_secs(3600));
        let (handle, _) = store.get_or_create("k1", "tiny", 100);
        {
            let mut state = handle.lock().await;
            state.messages.push(crate::tokens::message_ref("user", "hi"));
            state.total_input_tokens = 42;
            state.phase = Phase::WalActive;
        }
        store.reset(None).await;
        store.reset(None).await;
        let state = handle.lock().await;
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.messages.is_empty());
        assert_eq!(state.total_input_tokens, 0);
    }

    #[tokio::test]
    async fn snapshot_holds_no_locks_after_returning() {
        let store = ConversationStore::new(std::time::Duration::from_secs(3600));
        store.get_or_create("k1", "tiny", 100);
        store.get_or_create("k2", "tiny", 100);
        let snap = store.snapshot().await;
        assert_eq!(snap.len(), 2);
        // Should be able to immediately re-acquire every handle.
        for key in ["k1", "k2"] {
            let handle = store.get(key).unwrap();
            let _state = handle.lock().await;
        }
    }
}
