//! Connection status and status observers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use chatline_core::{Timestamp, TransportError};

use crate::registry::{next_listener_id, ListenerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// Connected or on the way there.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the connection last left the `Connected`/`Connecting` states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFault {
    Transport(TransportError),
    /// Automatic reconnection gave up; only an explicit `connect` retries.
    ReconnectExhausted { attempts: u32 },
}

impl std::fmt::Display for ConnectionFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "{err}"),
            Self::ReconnectExhausted { attempts } => {
                write!(f, "Reconnection abandoned after {attempts} attempts")
            }
        }
    }
}

/// Snapshot of the manager's connection status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_connected_at: Option<Timestamp>,
    /// Reconnection attempts made since the last successful connection.
    pub retry_count: u32,
    pub last_fault: Option<ConnectionFault>,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// True once automatic reconnection has given up.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.last_fault, Some(ConnectionFault::ReconnectExhausted { .. }))
    }
}

/// Callback for status transitions.
pub type StatusHandler = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

/// Registered status-change callbacks, called in registration order.
#[derive(Default)]
pub struct StatusObservers {
    handlers: Mutex<Vec<(ListenerId, StatusHandler)>>,
}

impl std::fmt::Debug for StatusObservers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusObservers").field("count", &self.len()).finish()
    }
}

impl StatusObservers {
    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, StatusHandler)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        let id = next_listener_id();
        self.lock().push((id, Arc::new(handler)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every observer with `status`, outside the lock.
    pub fn notify(&self, status: &ConnectionStatus) {
        let handlers: Vec<StatusHandler> = self.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in handlers {
            handler(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_status_is_disconnected() {
        let status = ConnectionStatus::default();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.retry_count, 0);
        assert!(!status.is_connected());
        assert!(!status.is_exhausted());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&ConnectionState::Connecting).unwrap(), "\"connecting\"");
        assert_eq!(ConnectionState::Error.to_string(), "error");
    }

    #[test]
    fn test_observers_add_remove_notify() {
        let observers = StatusObservers::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = observers.add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        observers.notify(&ConnectionStatus::default());
        assert!(observers.remove(id));
        assert!(!observers.remove(id));
        observers.notify(&ConnectionStatus::default());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_exhausted_fault_display() {
        let fault = ConnectionFault::ReconnectExhausted { attempts: 5 };
        assert_eq!(fault.to_string(), "Reconnection abandoned after 5 attempts");
    }
}
