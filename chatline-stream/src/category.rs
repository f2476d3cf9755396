//! Event categories.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Category of a stream event.
///
/// `All` exists only for subscriptions: listeners registered under it see
/// every event. `ParseError` is produced locally for frames that could not
/// be decoded and is delivered to `All` listeners only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventCategory {
    All,
    ConversationStarted,
    Message,
    TurnStarted,
    TurnCompleted,
    AgentThinking,
    AgentResponse,
    AgentError,
    ConsensusStarted,
    ConsensusReached,
    ConversationCompleted,
    Error,
    ParseError,
    Custom(String),
}

impl EventCategory {
    /// Category for an incoming frame's `type` field.
    ///
    /// A missing type means `Message`. Names reserved for local use
    /// (`all`, `parse_error`) arrive as `Custom` so that a remote peer cannot
    /// impersonate them.
    pub fn from_wire(kind: Option<&str>) -> Self {
        match kind {
            None => Self::Message,
            Some(reserved @ ("all" | "parse_error")) => Self::Custom(reserved.to_string()),
            Some(other) => Self::known(other).unwrap_or_else(|| Self::Custom(other.to_string())),
        }
    }

    fn known(name: &str) -> Option<Self> {
        let category = match name {
            "conversation_started" => Self::ConversationStarted,
            "message" => Self::Message,
            "turn_started" => Self::TurnStarted,
            "turn_completed" => Self::TurnCompleted,
            "agent_thinking" => Self::AgentThinking,
            "agent_response" => Self::AgentResponse,
            "agent_error" => Self::AgentError,
            "consensus_started" => Self::ConsensusStarted,
            "consensus_reached" => Self::ConsensusReached,
            "conversation_completed" => Self::ConversationCompleted,
            "error" => Self::Error,
            _ => return None,
        };
        Some(category)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::All => "all",
            Self::ConversationStarted => "conversation_started",
            Self::Message => "message",
            Self::TurnStarted => "turn_started",
            Self::TurnCompleted => "turn_completed",
            Self::AgentThinking => "agent_thinking",
            Self::AgentResponse => "agent_response",
            Self::AgentError => "agent_error",
            Self::ConsensusStarted => "consensus_started",
            Self::ConsensusReached => "consensus_reached",
            Self::ConversationCompleted => "conversation_completed",
            Self::Error => "error",
            Self::ParseError => "parse_error",
            Self::Custom(name) => name,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

/// Parses subscription names, including `all` and `parse_error`.
impl FromStr for EventCategory {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all" => Self::All,
            "parse_error" => Self::ParseError,
            other => Self::known(other).unwrap_or_else(|| Self::Custom(other.to_string())),
        })
    }
}

impl From<&str> for EventCategory {
    fn from(name: &str) -> Self {
        match name.parse() {
            Ok(category) => category,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventCategory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from(name.as_str()))
    }
}
