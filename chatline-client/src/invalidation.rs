//! Cache invalidation driven by stream events.
//!
//! An [`InvalidationRules`] table maps event categories to what should be
//! dropped from the cache when such an event arrives. Bound to a
//! [`ConnectionManager`] it runs as an `All` listener.

use std::collections::HashMap;

use tracing::debug;

use chatline_core::SessionId;
use chatline_stream::{ConnectionManager, EventCategory, ListenerId, StreamEvent};

use crate::conversations::{conversation_prefix, ConversationCache, RECENT_PREFIX};

/// Something an event makes stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvalidationTarget {
    /// Detail and message pages of the event's conversation.
    Conversation,
    /// Every cached recent-conversations list.
    RecentList,
    /// Every key starting with a fixed prefix.
    Prefix(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationRules {
    rules: HashMap<EventCategory, Vec<InvalidationTarget>>,
}

impl InvalidationRules {
    /// No rules at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Anything the backend records as a message stales the conversation.
    /// Starting and completing a conversation change the recent list.
    pub fn chat_defaults() -> Self {
        Self::empty()
            .with_rule(EventCategory::ConversationStarted, InvalidationTarget::RecentList)
            .with_rule(EventCategory::Message, InvalidationTarget::Conversation)
            .with_rule(EventCategory::AgentResponse, InvalidationTarget::Conversation)
            .with_rule(EventCategory::ConsensusReached, InvalidationTarget::Conversation)
            .with_rule(EventCategory::ConversationCompleted, InvalidationTarget::Conversation)
            .with_rule(EventCategory::ConversationCompleted, InvalidationTarget::RecentList)
    }

    pub fn with_rule(mut self, category: EventCategory, target: InvalidationTarget) -> Self {
        let targets = self.rules.entry(category).or_default();
        if !targets.contains(&target) {
            targets.push(target);
        }
        self
    }

    pub fn targets(&self, category: &EventCategory) -> &[InvalidationTarget] {
        self.rules.get(category).map_or(&[], Vec::as_slice)
    }

    /// Key prefixes `event` invalidates.
    ///
    /// The conversation is the payload's `conversation_id` when present,
    /// otherwise `session`, since a stream session is addressed by its
    /// conversation id. Conversation targets are skipped when neither is
    /// known.
    pub fn prefixes_for(&self, event: &StreamEvent, session: Option<&SessionId>) -> Vec<String> {
        let conversation = event
            .conversation_id()
            .or_else(|| session.map(SessionId::as_str));
        self.targets(&event.category)
            .iter()
            .filter_map(|target| match target {
                InvalidationTarget::Conversation => conversation.map(conversation_prefix),
                InvalidationTarget::RecentList => Some(RECENT_PREFIX.to_string()),
                InvalidationTarget::Prefix(prefix) => Some(prefix.clone()),
            })
            .collect()
    }

    /// Apply to `event` received on `session`. Returns the number of
    /// entries removed.
    pub fn apply(
        &self,
        event: &StreamEvent,
        session: Option<&SessionId>,
        conversations: &ConversationCache,
    ) -> usize {
        let removed: usize = self
            .prefixes_for(event, session)
            .iter()
            .map(|prefix| conversations.cache().invalidate_by_prefix(prefix))
            .sum();
        if removed > 0 {
            debug!(category = %event.category, removed, "Stream event invalidated cache entries");
        }
        removed
    }

    /// Register as an `All` listener on the manager serving `session`.
    pub fn bind(
        self,
        manager: &ConnectionManager,
        session: SessionId,
        conversations: ConversationCache,
    ) -> ListenerId {
        manager.on(EventCategory::All, move |event| {
            self.apply(event, Some(&session), &conversations);
        })
    }
}
