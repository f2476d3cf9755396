//! Conversation cache.
//!
//! A typed facade over the shared [`FetchCache`] for the conversation
//! endpoints:
//!
//! | Endpoint | Key |
//! |----------|-----|
//! | `GET /conversations/recent?limit=N` | `conversations:recent?{"limit":N}` |
//! | `GET /conversations/{id}` | `conversation:{id}:detail` |
//! | `GET /conversations/{id}/messages?page=P&page_size=S` | `conversation:{id}:messages?{"page":P,"page_size":S}` |
//!
//! Every key for one conversation starts with `conversation:{id}:`, so a
//! single prefix invalidation drops the detail and all message pages.
//! Within keys `{id}` has `%`, `:` and `?` percent-encoded, so no id's
//! prefix is a prefix of another id's keys.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use chatline_cache::{CacheKey, CacheRead, FetchCache};
use chatline_core::{FetchError, Timestamp};

use crate::rest::JsonSource;

/// Prefix shared by every recent-list key.
pub const RECENT_PREFIX: &str = "conversations:recent";

/// Prefix shared by every key of one conversation.
pub fn conversation_prefix(conversation_id: &str) -> String {
    format!("conversation:{}:", encode_key_segment(conversation_id))
}

fn encode_key_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for c in segment.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            ':' => encoded.push_str("%3A"),
            '?' => encoded.push_str("%3F"),
            other => encoded.push(other),
        }
    }
    encoded
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub prompt: String,
    pub final_answer: String,
    pub total_turns: u32,
    pub total_messages: u32,
    pub created_at: Timestamp,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentConversations {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub summary: ConversationSummary,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// Message as stored by the backend. `sender` is `user`, `agent_N`, or
/// `consensus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender: String,
    pub content: String,
    pub turn: u32,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
}

fn decode<U: DeserializeOwned>(value: JsonValue) -> Result<U, FetchError> {
    serde_json::from_value(value).map_err(|err| FetchError::Decode {
        reason: err.to_string(),
    })
}

fn decode_read<U: DeserializeOwned>(read: CacheRead<JsonValue>) -> Result<CacheRead<U>, FetchError> {
    let decoded: U = decode(read.value().clone())?;
    Ok(read.map(|_| decoded))
}

#[derive(Clone)]
pub struct ConversationCache {
    cache: FetchCache<JsonValue>,
    source: Arc<dyn JsonSource>,
}

impl std::fmt::Debug for ConversationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationCache").field("cache", &self.cache).finish_non_exhaustive()
    }
}

impl ConversationCache {
    pub fn new(cache: FetchCache<JsonValue>, source: Arc<dyn JsonSource>) -> Self {
        Self { cache, source }
    }

    pub fn cache(&self) -> &FetchCache<JsonValue> {
        &self.cache
    }

    pub fn recent_key(limit: u32) -> CacheKey {
        CacheKey::from_value(RECENT_PREFIX, &json!({ "limit": limit }))
    }

    pub fn detail_key(conversation_id: &str) -> CacheKey {
        CacheKey::new(format!("{}detail", conversation_prefix(conversation_id)))
    }

    pub fn messages_key(conversation_id: &str, page: u32, page_size: u32) -> CacheKey {
        CacheKey::from_value(
            &format!("{}messages", conversation_prefix(conversation_id)),
            &json!({ "page": page, "page_size": page_size }),
        )
    }

    /// Read through the cache. The response must decode as `U` to be
    /// stored; the cached document is decoded again for the caller.
    async fn read<U>(
        &self,
        key: CacheKey,
        path: String,
        query: Vec<(&'static str, String)>,
    ) -> Result<CacheRead<U>, FetchError>
    where
        U: DeserializeOwned + Send + 'static,
    {
        let source = Arc::clone(&self.source);
        let fetcher = move || async move {
            let value = source.get_json(&path, &query).await?;
            decode::<U>(value.clone())?;
            Ok::<_, FetchError>(value)
        };
        let read = self.cache.get(&key, fetcher).await?;
        debug!(key = %key, freshness = ?read.freshness(), "Conversation read");
        decode_read(read)
    }

    pub async fn recent(&self, limit: u32) -> Result<CacheRead<Vec<ConversationSummary>>, FetchError> {
        let read: CacheRead<RecentConversations> = self
            .read(
                Self::recent_key(limit),
                "/conversations/recent".to_string(),
                vec![("limit", limit.to_string())],
            )
            .await?;
        Ok(read.map(|recent| recent.conversations))
    }

    pub async fn detail(&self, conversation_id: &str) -> Result<CacheRead<ConversationDetail>, FetchError> {
        self.read(
            Self::detail_key(conversation_id),
            format!("/conversations/{conversation_id}"),
            Vec::new(),
        )
        .await
    }

    /// One page of messages, 1-based.
    pub async fn messages(
        &self,
        conversation_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<CacheRead<MessagePage>, FetchError> {
        self.read(
            Self::messages_key(conversation_id, page, page_size),
            format!("/conversations/{conversation_id}/messages"),
            vec![("page", page.to_string()), ("page_size", page_size.to_string())],
        )
        .await
    }

    /// Drop the detail and every message page of a conversation.
    pub fn invalidate_conversation(&self, conversation_id: &str) -> usize {
        self.cache.invalidate_by_prefix(&conversation_prefix(conversation_id))
    }

    /// Drop every cached recent list, whatever its limit.
    pub fn invalidate_recent(&self) -> usize {
        self.cache.invalidate_by_prefix(RECENT_PREFIX)
    }

    pub fn pager(&self, conversation_id: impl Into<String>, page_size: u32) -> MessagePager {
        MessagePager::new(self.clone(), conversation_id, page_size)
    }
}

/// Loads a conversation's message history one page at a time.
///
/// History is exhausted once a page comes back shorter than `page_size`.
#[derive(Debug)]
pub struct MessagePager {
    conversations: ConversationCache,
    conversation_id: String,
    page_size: u32,
    next_page: u32,
    exhausted: bool,
    loaded: Vec<ChatMessage>,
}

impl MessagePager {
    pub fn new(conversations: ConversationCache, conversation_id: impl Into<String>, page_size: u32) -> Self {
        Self {
            conversations,
            conversation_id: conversation_id.into(),
            page_size: page_size.max(1),
            next_page: 1,
            exhausted: false,
            loaded: Vec::new(),
        }
    }

    /// Load the next page. Returns the newly loaded messages, or `None`
    /// once the history is exhausted. A failed load can be retried.
    pub async fn load_next(&mut self) -> Result<Option<&[ChatMessage]>, FetchError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .conversations
            .messages(&self.conversation_id, self.next_page, self.page_size)
            .await?
            .into_value();

        let count = page.messages.len();
        if count < self.page_size as usize {
            self.exhausted = true;
        }
        debug!(
            conversation_id = %self.conversation_id,
            page = self.next_page,
            count,
            exhausted = self.exhausted,
            "Loaded message page"
        );
        self.next_page += 1;
        let start = self.loaded.len();
        self.loaded.extend(page.messages);
        Ok(Some(&self.loaded[start..]))
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.loaded
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn pages_loaded(&self) -> u32 {
        self.next_page - 1
    }

    /// Forget loaded pages and start again from page 1.
    pub fn reset(&mut self) {
        self.next_page = 1;
        self.exhausted = false;
        self.loaded.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_share_conversation_prefix() {
        let prefix = conversation_prefix("c1");
        assert!(ConversationCache::detail_key("c1").starts_with(&prefix));
        assert!(ConversationCache::messages_key("c1", 2, 20).starts_with(&prefix));
        assert!(!ConversationCache::detail_key("c10").starts_with(&prefix));
    }

    #[test]
    fn test_colon_in_id_does_not_share_prefix() {
        let prefix = conversation_prefix("a");
        assert_eq!(conversation_prefix("a:b"), "conversation:a%3Ab:");
        assert!(!ConversationCache::detail_key("a:b").starts_with(&prefix));
        assert!(!ConversationCache::messages_key("a:b", 1, 20).starts_with(&prefix));
        assert_ne!(conversation_prefix("a%3Ab"), conversation_prefix("a:b"));
        assert_eq!(ConversationCache::detail_key("x?y").request_id(), "conversation:x%3Fy:detail");
    }

    #[test]
    fn test_key_shapes() {
        assert_eq!(ConversationCache::recent_key(10).as_str(), "conversations:recent?{\"limit\":10}");
        assert_eq!(ConversationCache::detail_key("c1").as_str(), "conversation:c1:detail");
        assert_eq!(
            ConversationCache::messages_key("c1", 3, 25).as_str(),
            "conversation:c1:messages?{\"page\":3,\"page_size\":25}"
        );
    }

    #[test]
    fn test_detail_decodes_flattened_summary() {
        let value = json!({
            "conversation_id": "c1",
            "prompt": "why?",
            "final_answer": "because",
            "total_turns": 2,
            "total_messages": 6,
            "created_at": "2026-01-01T00:00:00Z",
            "messages": []
        });
        let detail: ConversationDetail = decode(value).unwrap();
        assert_eq!(detail.summary.conversation_id, "c1");
        assert_eq!(detail.summary.duration_seconds, None);
        assert!(detail.messages.is_empty());
    }

    #[test]
    fn test_decode_failure_is_decode_error() {
        let err = decode::<MessagePage>(json!({"messages": "nope"})).unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }
}
