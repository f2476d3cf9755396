//! Chatline Test Utilities
//!
//! Shared test infrastructure for the chatline workspace:
//! - Proptest generators for keys, parameters, and stream frames
//! - Scripted remote sources and counting fetchers
//! - Status recorders for connection managers
//! - JSON and TOML fixtures shaped like the chat backend

pub use chatline_cache::{CacheKey, CacheRead, Freshness};
pub use chatline_core::FetchError;
pub use chatline_stream::{ConnectionManager, ConnectionState, ConnectionStatus, EventCategory};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value as JsonValue};
use tokio::sync::{watch, Notify};

/// Boxed fetch future, for fetchers that suspend.
pub type HeldFetch<T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + Send>>;

// ============================================================================
// SCRIPTED SOURCES
// ============================================================================

/// Canonical form of a request: `path` alone, or `path?k=v&k=v` in the
/// order given.
pub fn request_line(path: &str, query: &[(&str, String)]) -> String {
    if query.is_empty() {
        return path.to_string();
    }
    let pairs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{path}?{}", pairs.join("&"))
}

#[derive(Default)]
struct Script {
    once: HashMap<String, VecDeque<Result<JsonValue, FetchError>>>,
    always: HashMap<String, Result<JsonValue, FetchError>>,
    calls: Vec<String>,
}

/// Remote source answering from a script keyed by [`request_line`].
///
/// One-shot responses are consumed first, then the standing response.
/// Unscripted requests fail with HTTP 404. While held, calls are recorded
/// immediately but block until [`ScriptedResponses::release`].
#[derive(Clone)]
pub struct ScriptedResponses {
    script: Arc<Mutex<Script>>,
    gate: Arc<watch::Sender<bool>>,
}

impl Default for ScriptedResponses {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedResponses {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            gate: Arc::new(gate),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn respond(&self, request: impl Into<String>, value: JsonValue) -> &Self {
        self.script().always.insert(request.into(), Ok(value));
        self
    }

    pub fn respond_once(&self, request: impl Into<String>, result: Result<JsonValue, FetchError>) -> &Self {
        self.script().once.entry(request.into()).or_default().push_back(result);
        self
    }

    pub fn fail(&self, request: impl Into<String>, err: FetchError) -> &Self {
        self.script().always.insert(request.into(), Err(err));
        self
    }

    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Every request seen, in arrival order.
    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }

    pub fn call_count(&self, request: &str) -> usize {
        self.script().calls.iter().filter(|c| c.as_str() == request).count()
    }

    pub async fn call(&self, path: &str, query: &[(&str, String)]) -> Result<JsonValue, FetchError> {
        let request = request_line(path, query);
        self.script().calls.push(request.clone());

        let mut open = self.gate.subscribe();
        // The sender lives in `self`, so this only ends when released.
        let _ = open.wait_for(|open| *open).await;

        let mut script = self.script();
        if let Some(result) = script.once.get_mut(&request).and_then(VecDeque::pop_front) {
            return result;
        }
        match script.always.get(&request) {
            Some(result) => result.clone(),
            None => Err(FetchError::Status {
                status: 404,
                body: format!("no script for {request}"),
            }),
        }
    }
}

/// Hands out fetchers that count how often they were invoked.
#[derive(Clone, Default)]
pub struct CountingFetcher {
    calls: Arc<AtomicUsize>,
}

impl CountingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn returning<T: Send + 'static>(
        &self,
        value: T,
    ) -> impl FnOnce() -> std::future::Ready<Result<T, FetchError>> + Send + 'static {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value))
        }
    }

    pub fn failing<T: Send + 'static>(
        &self,
        reason: &str,
    ) -> impl FnOnce() -> std::future::Ready<Result<T, FetchError>> + Send + 'static {
        let calls = Arc::clone(&self.calls);
        let err = FetchError::failed(reason);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(err))
        }
    }

    /// A fetcher that counts on entry, then waits for one `release`
    /// notification before yielding `value`.
    pub fn held_until<T: Send + 'static>(
        &self,
        release: Arc<Notify>,
        value: T,
    ) -> impl FnOnce() -> HeldFetch<T> + Send + 'static {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                release.notified().await;
                Ok(value)
            })
        }
    }
}

// ============================================================================
// STATUS RECORDING
// ============================================================================

/// Records every status a manager publishes.
#[derive(Clone, Default)]
pub struct StatusRecorder {
    seen: Arc<Mutex<Vec<ConnectionStatus>>>,
}

impl StatusRecorder {
    pub fn attach(manager: &ConnectionManager) -> Self {
        let recorder = Self::default();
        let seen = Arc::clone(&recorder.seen);
        manager.on_status_change(move |status| {
            seen.lock().unwrap_or_else(PoisonError::into_inner).push(status.clone());
        });
        recorder
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.statuses().iter().map(|s| s.state).collect()
    }

    pub fn last(&self) -> Option<ConnectionStatus> {
        self.statuses().last().cloned()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for chatline types.

    use super::*;
    use proptest::prelude::*;

    /// Request identifiers like `conversation:detail`.
    pub fn arb_request_id() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(:[a-z]{1,8}){0,2}"
    }

    pub fn arb_param_value() -> impl Strategy<Value = JsonValue> {
        prop_oneof![
            any::<i64>().prop_map(JsonValue::from),
            any::<bool>().prop_map(JsonValue::from),
            "[a-z0-9 ]{0,8}".prop_map(JsonValue::from),
            Just(JsonValue::Null),
        ]
    }

    /// A flat parameter object, possibly empty.
    pub fn arb_params() -> impl Strategy<Value = JsonValue> {
        prop::collection::btree_map("[a-z_]{1,6}", arb_param_value(), 0..5)
            .prop_map(|fields| JsonValue::Object(fields.into_iter().collect()))
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (arb_request_id(), arb_params()).prop_map(|(id, params)| CacheKey::from_value(&id, &params))
    }

    /// Categories as they arrive off the wire, including untyped frames and
    /// names the client does not know.
    pub fn arb_event_category() -> impl Strategy<Value = EventCategory> {
        prop_oneof![
            Just(None),
            prop::sample::select(vec![
                "conversation_started",
                "message",
                "turn_started",
                "turn_completed",
                "agent_thinking",
                "agent_response",
                "agent_error",
                "consensus_started",
                "consensus_reached",
                "conversation_completed",
                "error",
                "typing",
            ])
            .prop_map(Some),
        ]
        .prop_map(EventCategory::from_wire)
    }

    /// Conversation ids, some containing `:`.
    pub fn arb_conversation_id() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,6}(:[a-z0-9]{1,4})?"
    }

    /// An inbound frame as the chat backend sends it, as JSON text.
    pub fn arb_wire_frame() -> impl Strategy<Value = String> {
        (arb_conversation_id(), 1u32..20, "[ -~]{0,24}")
            .prop_flat_map(|(conversation_id, n, content)| {
                prop_oneof![
                    Just(fixtures::conversation_started_frame(&conversation_id)),
                    Just(fixtures::message_frame(&conversation_id, n)),
                    Just(fixtures::agent_response_frame(&conversation_id, n)),
                    Just(fixtures::turn_started_frame(n)),
                    Just(fixtures::consensus_reached_frame(&content)),
                    Just(fixtures::conversation_completed_frame(&conversation_id, n)),
                    Just(json!({ "type": "error", "message": content })),
                ]
            })
            .prop_map(|frame| frame.to_string())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! JSON documents shaped like the chat backend's responses.

    use super::*;

    pub fn summary_json(conversation_id: &str) -> JsonValue {
        json!({
            "conversation_id": conversation_id,
            "prompt": format!("prompt for {conversation_id}"),
            "final_answer": "42",
            "total_turns": 3,
            "total_messages": 9,
            "created_at": "2026-03-01T12:00:00Z",
            "duration_seconds": 12.5,
        })
    }

    pub fn recent_json(conversation_ids: &[&str]) -> JsonValue {
        let conversations: Vec<JsonValue> = conversation_ids.iter().map(|id| summary_json(id)).collect();
        json!({ "conversations": conversations })
    }

    pub fn detail_json(conversation_id: &str, message_count: u32) -> JsonValue {
        let mut detail = summary_json(conversation_id);
        if let Some(fields) = detail.as_object_mut() {
            fields.insert(
                "messages".to_string(),
                JsonValue::Array((1..=message_count).map(|n| message_json(conversation_id, n)).collect()),
            );
        }
        detail
    }

    /// Message number `n` of a conversation; odd numbers come from the user.
    pub fn message_json(conversation_id: &str, n: u32) -> JsonValue {
        json!({
            "id": format!("{conversation_id}-m{n}"),
            "conversation_id": conversation_id,
            "sender": if n % 2 == 1 { "user".to_string() } else { format!("agent_{}", n % 3) },
            "content": format!("message {n}"),
            "turn": n.div_ceil(2),
            "timestamp": "2026-03-01T12:00:00Z",
        })
    }

    /// Messages `first..=last` as one page.
    pub fn message_page_json(conversation_id: &str, first: u32, last: u32) -> JsonValue {
        let messages: Vec<JsonValue> = (first..=last).map(|n| message_json(conversation_id, n)).collect();
        json!({ "messages": messages })
    }

    // Stream frames. Only `conversation_started` and
    // `conversation_completed` name their conversation; everything else
    // relies on the session the socket was opened for.

    pub fn conversation_started_frame(conversation_id: &str) -> JsonValue {
        json!({
            "type": "conversation_started",
            "conversation_id": conversation_id,
            "prompt": format!("prompt for {conversation_id}"),
            "total_turns": 3,
        })
    }

    fn message_body(conversation_id: &str, n: u32) -> JsonValue {
        let mut message = message_json(conversation_id, n);
        if let Some(fields) = message.as_object_mut() {
            fields.remove("conversation_id");
        }
        message
    }

    /// Message number `n`, as broadcast when it is logged.
    pub fn message_frame(conversation_id: &str, n: u32) -> JsonValue {
        json!({ "type": "message", "message": message_body(conversation_id, n) })
    }

    pub fn agent_response_frame(conversation_id: &str, n: u32) -> JsonValue {
        json!({ "type": "agent_response", "message": message_body(conversation_id, n) })
    }

    pub fn turn_started_frame(turn: u32) -> JsonValue {
        json!({ "type": "turn_started", "turn": turn, "agent_count": 3 })
    }

    pub fn consensus_reached_frame(final_answer: &str) -> JsonValue {
        json!({
            "type": "consensus_reached",
            "consensus": {
                "final_answer": final_answer,
                "winning_votes": 2,
                "total_votes": 3,
                "method": "majority_vote",
            },
        })
    }

    pub fn conversation_completed_frame(conversation_id: &str, total_messages: u32) -> JsonValue {
        json!({
            "type": "conversation_completed",
            "conversation_id": conversation_id,
            "total_messages": total_messages,
            "final_answer": "42",
        })
    }

    pub fn config_toml(api_base_url: &str, stream_base_url: &str) -> String {
        format!(
            "api_base_url = \"{api_base_url}\"\n\
             stream_base_url = \"{stream_base_url}\"\n\
             \n\
             [cache]\n\
             max_age_ms = 1000\n\
             stale_while_revalidate_ms = 5000\n\
             max_entries = 10\n\
             \n\
             [reconnect]\n\
             base_delay_ms = 100\n\
             max_attempts = 2\n"
        )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache reads and connection histories.

    use super::*;

    #[track_caller]
    pub fn assert_freshness<T: std::fmt::Debug>(read: &CacheRead<T>, expected: Freshness) {
        assert_eq!(read.freshness(), expected, "unexpected freshness for {:?}", read.value());
    }

    #[track_caller]
    pub fn assert_fetched<T: std::fmt::Debug>(read: &CacheRead<T>) {
        assert!(read.was_cache_miss(), "expected a fetched read, got {:?}", read);
    }

    #[track_caller]
    pub fn assert_states(recorder: &StatusRecorder, expected: &[ConnectionState]) {
        assert_eq!(recorder.states(), expected);
    }

    #[track_caller]
    pub fn assert_status_code<T: std::fmt::Debug>(result: &Result<T, FetchError>, expected: u16) {
        match result {
            Err(err) => assert_eq!(err.status(), Some(expected), "unexpected error {err}"),
            Ok(value) => panic!("expected HTTP {expected}, got Ok({value:?})"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
