use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use chatline_cache::{CacheConfig, CacheKey, FetchCache, Freshness, MemoryStore};
use chatline_client::{
    ChatClient, ClientConfig, ConversationCache, JsonSource, PersistenceBackend, PersistenceConfig,
};
use chatline_core::{FetchError, ManualClock, SessionId};
use chatline_stream::{ConnectionState, MemoryTransport};
use chatline_test_utils::{assertions, fixtures, generators, ScriptedResponses};
use proptest::prelude::*;

#[derive(Clone)]
struct Scripted(ScriptedResponses);

#[async_trait]
impl JsonSource for Scripted {
    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<JsonValue, FetchError> {
        self.0.call(path, query).await
    }
}

fn conversations(script: &ScriptedResponses, clock: &ManualClock) -> ConversationCache {
    let config = CacheConfig::new()
        .with_max_age(Duration::from_millis(1_000))
        .with_stale_while_revalidate(Duration::from_millis(5_000));
    let cache = FetchCache::with_clock(config, Arc::new(clock.clone()));
    ConversationCache::new(cache, Arc::new(Scripted(script.clone())))
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

const RECENT_10: &str = "/conversations/recent?limit=10";

// ============================================================================
// Conversation cache
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_recent_reads_share_one_request() {
    let script = ScriptedResponses::new();
    script.respond(RECENT_10, fixtures::recent_json(&["c1", "c2"]));
    script.hold();
    let cache = conversations(&script, &ManualClock::at_millis(0));

    let readers: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.recent(10).await })
        })
        .collect();
    eventually(|| script.call_count(RECENT_10) == 1).await;
    script.release();

    for reader in readers {
        let recent = reader.await.unwrap().unwrap().into_value();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].conversation_id, "c1");
    }
    assert_eq!(script.call_count(RECENT_10), 1);
}

#[tokio::test]
async fn stale_detail_is_served_then_refreshed() {
    let script = ScriptedResponses::new();
    script
        .respond_once("/conversations/c1", Ok(fixtures::detail_json("c1", 2)))
        .respond("/conversations/c1", fixtures::detail_json("c1", 4));
    let clock = ManualClock::at_millis(0);
    let cache = conversations(&script, &clock);

    let first = cache.detail("c1").await.unwrap();
    assertions::assert_fetched(&first);
    assert_eq!(first.value().messages.len(), 2);

    clock.set_millis(2_000);
    let stale = cache.detail("c1").await.unwrap();
    assertions::assert_freshness(&stale, Freshness::Stale);
    assert_eq!(stale.value().messages.len(), 2);

    let key = ConversationCache::detail_key("c1");
    eventually(|| !cache.cache().is_in_flight(&key)).await;
    let refreshed = cache.detail("c1").await.unwrap();
    assertions::assert_freshness(&refreshed, Freshness::Fresh);
    assert_eq!(refreshed.value().messages.len(), 4);
    assert_eq!(script.call_count("/conversations/c1"), 2);
}

#[tokio::test]
async fn undecodable_response_is_not_cached() {
    let script = ScriptedResponses::new();
    script.respond(RECENT_10, json!({ "conversations": "not a list" }));
    let cache = conversations(&script, &ManualClock::at_millis(0));

    let err = cache.recent(10).await.unwrap_err();
    assert!(matches!(err, FetchError::Decode { .. }));
    assert!(cache.cache().is_empty());
}

#[tokio::test]
async fn http_errors_reach_the_caller() {
    let script = ScriptedResponses::new();
    script.fail("/conversations/gone", FetchError::Status { status: 500, body: "boom".into() });
    let cache = conversations(&script, &ManualClock::at_millis(0));

    let result = cache.detail("gone").await;
    assertions::assert_status_code(&result, 500);
    assert!(cache.cache().is_empty());
}

#[tokio::test]
async fn pager_stops_after_short_page() {
    let script = ScriptedResponses::new();
    script
        .respond("/conversations/c1/messages?page=1&page_size=2", fixtures::message_page_json("c1", 1, 2))
        .respond("/conversations/c1/messages?page=2&page_size=2", fixtures::message_page_json("c1", 3, 3));
    let cache = conversations(&script, &ManualClock::at_millis(0));
    let mut pager = cache.pager("c1", 2);

    assert_eq!(pager.load_next().await.unwrap().map(<[_]>::len), Some(2));
    assert!(!pager.is_exhausted());
    let second = pager.load_next().await.unwrap().unwrap();
    assert_eq!(second[0].id, "c1-m3");
    assert!(pager.is_exhausted());
    assert!(pager.load_next().await.unwrap().is_none());

    assert_eq!(pager.pages_loaded(), 2);
    assert_eq!(pager.messages().len(), 3);
    assert_eq!(script.calls().len(), 2);
}

#[tokio::test]
async fn pager_retries_failed_page() {
    let script = ScriptedResponses::new();
    let page_one = "/conversations/c1/messages?page=1&page_size=5";
    script
        .respond_once(page_one, Err(FetchError::failed("timeout")))
        .respond(page_one, fixtures::message_page_json("c1", 1, 1));
    let cache = conversations(&script, &ManualClock::at_millis(0));
    let mut pager = cache.pager("c1", 5);

    assert!(pager.load_next().await.is_err());
    assert_eq!(pager.pages_loaded(), 0);
    assert_eq!(pager.load_next().await.unwrap().map(<[_]>::len), Some(1));
    assert!(pager.is_exhausted());
}

#[tokio::test]
async fn invalidating_a_conversation_keeps_others() {
    let script = ScriptedResponses::new();
    script
        .respond("/conversations/c1", fixtures::detail_json("c1", 1))
        .respond("/conversations/c10", fixtures::detail_json("c10", 1))
        .respond("/conversations/c1/messages?page=1&page_size=20", fixtures::message_page_json("c1", 1, 1));
    let cache = conversations(&script, &ManualClock::at_millis(0));

    cache.detail("c1").await.unwrap();
    cache.detail("c10").await.unwrap();
    cache.messages("c1", 1, 20).await.unwrap();

    assert_eq!(cache.invalidate_conversation("c1"), 2);
    assert!(cache.cache().contains(&ConversationCache::detail_key("c10")));
}

#[tokio::test]
async fn colon_in_id_is_not_a_child_conversation() {
    let script = ScriptedResponses::new();
    script
        .respond("/conversations/a", fixtures::detail_json("a", 1))
        .respond("/conversations/a:b", fixtures::detail_json("a:b", 1));
    let cache = conversations(&script, &ManualClock::at_millis(0));

    cache.detail("a").await.unwrap();
    cache.detail("a:b").await.unwrap();

    assert_eq!(cache.invalidate_conversation("a"), 1);
    assert!(cache.cache().contains(&ConversationCache::detail_key("a:b")));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn distinct_ids_never_share_keys(a in generators::arb_conversation_id(), b in generators::arb_conversation_id()) {
        prop_assume!(a != b);
        let prefix = chatline_client::conversation_prefix(&a);
        prop_assert!(!ConversationCache::detail_key(&b).starts_with(&prefix));
        prop_assert!(!ConversationCache::messages_key(&b, 1, 20).starts_with(&prefix));
    }
}

// ============================================================================
// Client lifecycle
// ============================================================================

async fn client_with(script: &ScriptedResponses, transport: &MemoryTransport) -> ChatClient {
    let config = ClientConfig::new("http://localhost:8000", "ws://localhost:8000/ws");
    ChatClient::with_parts(
        config,
        Arc::new(Scripted(script.clone())),
        Arc::new(transport.clone()),
        Arc::new(MemoryStore::new()),
    )
    .await
}

#[tokio::test]
async fn message_frame_invalidates_session_conversation() {
    let script = ScriptedResponses::new();
    script
        .respond(RECENT_10, fixtures::recent_json(&["c1"]))
        .respond("/conversations/c1", fixtures::detail_json("c1", 1))
        .respond("/conversations/c2", fixtures::detail_json("c2", 1));
    let transport = MemoryTransport::new();
    let client = client_with(&script, &transport).await;

    client.conversations().recent(10).await.unwrap();
    client.conversations().detail("c1").await.unwrap();
    client.conversations().detail("c2").await.unwrap();
    let detail_key = ConversationCache::detail_key("c1");
    let recent_key = ConversationCache::recent_key(10);

    let manager = client.open_session(SessionId::new("c1"));
    eventually(|| manager.status().state == ConnectionState::Connected).await;

    assert!(transport.push_json(&fixtures::message_frame("c1", 2)));
    eventually(|| !client.cache().contains(&detail_key)).await;
    assert!(client.cache().contains(&recent_key));
    assert!(client.cache().contains(&ConversationCache::detail_key("c2")));

    client.shutdown();
    assert_eq!(manager.status().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn conversation_lifecycle_frames_invalidate_cache() {
    let script = ScriptedResponses::new();
    script
        .respond(RECENT_10, fixtures::recent_json(&["c1"]))
        .respond("/conversations/c1", fixtures::detail_json("c1", 1));
    let transport = MemoryTransport::new();
    let client = client_with(&script, &transport).await;
    let detail_key = ConversationCache::detail_key("c1");
    let recent_key = ConversationCache::recent_key(10);

    let manager = client.open_session(SessionId::new("c1"));
    eventually(|| manager.status().state == ConnectionState::Connected).await;

    client.conversations().recent(10).await.unwrap();
    assert!(transport.push_json(&fixtures::conversation_started_frame("c1")));
    eventually(|| !client.cache().contains(&recent_key)).await;

    client.conversations().detail("c1").await.unwrap();
    assert!(transport.push_json(&fixtures::turn_started_frame(1)));
    assert!(transport.push_json(&fixtures::agent_response_frame("c1", 2)));
    eventually(|| !client.cache().contains(&detail_key)).await;

    client.conversations().detail("c1").await.unwrap();
    assert!(transport.push_json(&fixtures::consensus_reached_frame("42")));
    eventually(|| !client.cache().contains(&detail_key)).await;

    client.conversations().recent(10).await.unwrap();
    client.conversations().detail("c1").await.unwrap();
    assert!(transport.push_json(&fixtures::conversation_completed_frame("c1", 9)));
    eventually(|| !client.cache().contains(&recent_key) && !client.cache().contains(&detail_key)).await;

    client.shutdown();
}

#[tokio::test]
async fn closed_session_stops_invalidating() {
    let script = ScriptedResponses::new();
    script.respond("/conversations/c1", fixtures::detail_json("c1", 1));
    let transport = MemoryTransport::new();
    let client = client_with(&script, &transport).await;
    let session = SessionId::new("c1");

    let manager = client.open_session(session.clone());
    eventually(|| manager.status().state == ConnectionState::Connected).await;
    assert!(client.close_session(&session));

    eventually(|| !transport.is_connected()).await;

    client.conversations().detail("c1").await.unwrap();
    assert!(!transport.push_json(&fixtures::message_frame("c1", 2)));
    assert!(client.cache().contains(&ConversationCache::detail_key("c1")));
}

#[tokio::test]
async fn send_goes_through_open_session() {
    let transport = MemoryTransport::new();
    let client = client_with(&ScriptedResponses::new(), &transport).await;
    let session = ChatClient::new_session_id();

    let manager = client.open_session(session.clone());
    eventually(|| manager.status().is_connected()).await;
    assert!(client.send(&session, "message", json!({ "text": "hi" })));

    let sent: JsonValue = serde_json::from_str(&transport.sent()[0]).unwrap();
    assert_eq!(sent["type"], "message");
    assert_eq!(sent["data"]["text"], "hi");
}

#[tokio::test]
async fn file_persistence_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chatline.toml");
    std::fs::write(&path, fixtures::config_toml("http://localhost:8000", "ws://localhost:8000/ws")).unwrap();

    let mut config = ClientConfig::from_path(&path).unwrap();
    config.persistence = PersistenceConfig {
        backend: PersistenceBackend::File,
        path: Some(dir.path().join("cache")),
        ..PersistenceConfig::default()
    };
    assert_eq!(config.cache.max_entries, 10);
    assert_eq!(config.reconnect.max_attempts, 2);

    let key = CacheKey::new("conversation:c1:detail");
    {
        let client = ChatClient::restore(config.clone()).await.unwrap();
        client.cache().set(&key, fixtures::detail_json("c1", 1)).await;
    }

    let restored = ChatClient::restore(config).await.unwrap();
    let read = restored.cache().peek(&key).unwrap();
    assert_eq!(read.value()["conversation_id"], "c1");
}

#[tokio::test]
async fn restore_rejects_invalid_config() {
    let config = ClientConfig::new("http://localhost:8000", "http://not-a-websocket");
    assert!(ChatClient::restore(config).await.is_err());
}
