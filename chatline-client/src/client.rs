//! The application-facing client.
//!
//! `ChatClient` owns the single shared cache and one [`ConnectionManager`]
//! per open conversation. Construct it once at start-up with
//! [`ChatClient::restore`] and call [`ChatClient::shutdown`] on exit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument};

use chatline_cache::{FetchCache, FileStore, KeyValueStore, LmdbStore, MemoryStore, PersistenceAdapter};
use chatline_core::{ChatlineResult, SessionId};
use chatline_stream::{ConnectionManager, EventCategory, ListenerId, Transport, WsTransport};

use crate::config::{ClientConfig, PersistenceBackend, PersistenceConfig};
use crate::conversations::ConversationCache;
use crate::invalidation::InvalidationRules;
use crate::rest::{JsonSource, RestClient};

struct Session {
    manager: ConnectionManager,
    invalidation: ListenerId,
}

pub struct ChatClient {
    config: ClientConfig,
    conversations: ConversationCache,
    transport: Arc<dyn Transport>,
    rules: InvalidationRules,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("api_base_url", &self.config.api_base_url)
            .field("conversations", &self.conversations)
            .field("sessions", &self.session_ids())
            .finish_non_exhaustive()
    }
}

/// Open the store the persistence section asks for.
pub fn open_store(config: &PersistenceConfig) -> ChatlineResult<Arc<dyn KeyValueStore>> {
    config.validate()?;
    let store: Arc<dyn KeyValueStore> = match (config.backend, config.path.as_ref()) {
        (PersistenceBackend::File, Some(path)) => Arc::new(FileStore::new(path.clone())),
        (PersistenceBackend::Lmdb, Some(path)) => Arc::new(LmdbStore::open(path, config.lmdb_max_size_mb)?),
        _ => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

impl ChatClient {
    /// Validate `config`, open the configured store and restore the cache
    /// from it. Talks to the network through REST and WebSocket.
    pub async fn restore(config: ClientConfig) -> ChatlineResult<Self> {
        config.validate()?;
        let source: Arc<dyn JsonSource> = Arc::new(RestClient::new(&config)?);
        let mut ws = WsTransport::new(config.stream_base_url.clone());
        if let Some(token) = &config.auth.bearer_token {
            ws = ws.with_bearer_token(token.clone());
        }
        let store = open_store(&config.persistence)?;
        Ok(Self::with_parts(config, source, Arc::new(ws), store).await)
    }

    /// Assemble a client from explicit parts. `config` is not validated.
    pub async fn with_parts(
        config: ClientConfig,
        source: Arc<dyn JsonSource>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let adapter = PersistenceAdapter::new(store, config.persistence.storage_key.clone());
        let cache = FetchCache::<JsonValue>::builder(config.cache.clone())
            .persistence(adapter)
            .restore()
            .await;
        info!(
            backend = ?config.persistence.backend,
            restored = cache.len(),
            "Chat client ready"
        );
        Self {
            conversations: ConversationCache::new(cache, source),
            transport,
            rules: InvalidationRules::chat_defaults(),
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Replace the rules applied to sessions opened from now on.
    pub fn with_invalidation_rules(mut self, rules: InvalidationRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn conversations(&self) -> &ConversationCache {
        &self.conversations
    }

    pub fn cache(&self) -> &FetchCache<JsonValue> {
        self.conversations.cache()
    }

    pub fn new_session_id() -> SessionId {
        SessionId::generate()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Manager for `session`, connecting it first. Opening an already open
    /// session returns its existing manager and reconnects it if idle.
    #[instrument(skip(self), fields(session = %session))]
    pub fn open_session(&self, session: SessionId) -> ConnectionManager {
        let manager = {
            let mut sessions = self.sessions();
            if let Some(existing) = sessions.get(&session) {
                debug!("Session already open");
                existing.manager.clone()
            } else {
                let manager = ConnectionManager::new(Arc::clone(&self.transport), self.config.reconnect.clone());
                let invalidation = self.rules
                    .clone()
                    .bind(&manager, session.clone(), self.conversations.clone());
                sessions.insert(
                    session.clone(),
                    Session {
                        manager: manager.clone(),
                        invalidation,
                    },
                );
                manager
            }
        };
        manager.connect(session);
        manager
    }

    pub fn session(&self, session: &SessionId) -> Option<ConnectionManager> {
        self.sessions().get(session).map(|s| s.manager.clone())
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Disconnect and forget `session`. Returns `false` if it was not open.
    pub fn close_session(&self, session: &SessionId) -> bool {
        let Some(closed) = self.sessions().remove(session) else {
            return false;
        };
        closed.manager.off(EventCategory::All, closed.invalidation);
        closed.manager.disconnect();
        info!(session = %session, "Session closed");
        true
    }

    /// Send on an open session. `false` when the session is not open or
    /// not connected.
    pub fn send(&self, session: &SessionId, category: impl Into<EventCategory>, data: JsonValue) -> bool {
        match self.session(session) {
            Some(manager) => manager.send(category, data),
            None => false,
        }
    }

    /// Disconnect every session. The cache stays usable.
    pub fn shutdown(&self) {
        let drained: Vec<(SessionId, Session)> = self.sessions().drain().collect();
        let count = drained.len();
        for (_, closed) in drained {
            closed.manager.off(EventCategory::All, closed.invalidation);
            closed.manager.disconnect();
        }
        info!(sessions = count, "Chat client shut down");
    }
}
