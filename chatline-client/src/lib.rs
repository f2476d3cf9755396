//! Chatline Client - Application Shell Glue
//!
//! Wires the fetch cache and the stream connection manager into one
//! client: TOML configuration, logging, the REST fetcher, the typed
//! conversation cache, and cache invalidation driven by stream events.
//!
//! ```ignore
//! let config = ClientConfig::load()?;
//! init_logging(&config.logging)?;
//! let client = ChatClient::restore(config).await?;
//!
//! let session = ChatClient::new_session_id();
//! let manager = client.open_session(session.clone());
//! manager.on("conversation_completed", |event| println!("{}", event.payload["final_answer"]));
//!
//! let recent = client.conversations().recent(20).await?;
//! client.shutdown();
//! ```

pub mod client;
pub mod config;
pub mod conversations;
pub mod invalidation;
pub mod rest;
pub mod telemetry;

pub use client::{open_store, ChatClient};
pub use config::{AuthConfig, ClientConfig, LoggingConfig, PersistenceBackend, PersistenceConfig, CONFIG_ENV_VAR};
pub use conversations::{
    conversation_prefix, ChatMessage, ConversationCache, ConversationDetail, ConversationSummary, MessagePage,
    MessagePager, RecentConversations, RECENT_PREFIX,
};
pub use invalidation::{InvalidationRules, InvalidationTarget};
pub use rest::{JsonSource, RestClient};
pub use telemetry::{build_filter, init_logging};
