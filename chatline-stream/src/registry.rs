//! Listener registry.
//!
//! Maps event categories to ordered sets of handlers. Handlers are called
//! outside the registry lock, so a handler may register or remove
//! listeners (including itself) while an event is being dispatched; the
//! change takes effect from the next event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::category::EventCategory;
use crate::event::StreamEvent;

/// Callback for stream events.
pub type EventHandler = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Handle identifying one registration. Ids increase monotonically, so
/// ordering by id is registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique listener id.
pub(crate) fn next_listener_id() -> ListenerId {
    ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<EventCategory, Vec<(ListenerId, EventHandler)>>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<String, usize> = self
            .lock()
            .iter()
            .map(|(category, handlers)| (category.to_string(), handlers.len()))
            .collect();
        f.debug_struct("ListenerRegistry").field("listeners", &counts).finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventCategory, Vec<(ListenerId, EventHandler)>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for `category`. Use [`EventCategory::All`] to
    /// receive every event.
    pub fn on<F>(&self, category: EventCategory, handler: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let id = next_listener_id();
        self.lock()
            .entry(category)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a registration. Returns whether it existed.
    pub fn off(&self, category: &EventCategory, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(handlers) = listeners.get_mut(category) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            listeners.remove(category);
        }
        removed
    }

    pub fn listener_count(&self, category: &EventCategory) -> usize {
        self.lock().get(category).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Handlers that should see `event`: its own category first, then `All`.
    /// `ParseError` events go to `All` listeners only.
    fn handlers_for(&self, event: &StreamEvent) -> Vec<EventHandler> {
        let listeners = self.lock();
        let specific = match &event.category {
            EventCategory::All | EventCategory::ParseError => None,
            category => listeners.get(category),
        };
        specific
            .into_iter()
            .chain(listeners.get(&EventCategory::All))
            .flat_map(|handlers| handlers.iter().map(|(_, handler)| Arc::clone(handler)))
            .collect()
    }

    /// Deliver `event`. Returns the number of handlers called.
    pub fn dispatch(&self, event: &StreamEvent) -> usize {
        let handlers = self.handlers_for(event);
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}
