//! In-memory transport driven by hand.
//!
//! Each `open` creates a connection whose incoming side is fed through
//! [`MemoryTransport::push_text`], [`MemoryTransport::close`],
//! [`MemoryTransport::fail`] and [`MemoryTransport::drop_connection`].
//! Frames the manager sends are collected and read back with
//! [`MemoryTransport::sent`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use chatline_core::{SessionId, TransportError};

use crate::transport::{Transport, TransportFrame, TransportLink};

type FrameSender = mpsc::UnboundedSender<Result<TransportFrame, TransportError>>;

struct MemoryConnection {
    frames: FrameSender,
    outgoing: mpsc::UnboundedReceiver<String>,
}

#[derive(Default)]
struct MemoryState {
    opened: Vec<(SessionId, Instant)>,
    scripted_failures: VecDeque<TransportError>,
    refuse_all: bool,
    current: Option<MemoryConnection>,
    sent: Vec<String>,
}

impl MemoryState {
    fn collect_sent(&mut self) {
        if let Some(connection) = self.current.as_mut() {
            while let Ok(text) = connection.outgoing.try_recv() {
                self.sent.push(text);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryTransport")
            .field("opened", &state.opened.len())
            .field("connected", &state.current.is_some())
            .finish()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `open` fail with `err`. Failures queue up.
    pub fn fail_next_open(&self, err: TransportError) {
        self.lock().scripted_failures.push_back(err);
    }

    /// Make every `open` fail until switched off.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_all = refuse;
    }

    /// Sessions passed to `open`, in call order.
    pub fn opened_sessions(&self) -> Vec<SessionId> {
        self.lock().opened.iter().map(|(session, _)| session.clone()).collect()
    }

    /// Tokio instants at which `open` was called.
    pub fn open_times(&self) -> Vec<Instant> {
        self.lock().opened.iter().map(|(_, at)| *at).collect()
    }

    pub fn open_count(&self) -> usize {
        self.lock().opened.len()
    }

    /// Whether a connection is open and its reader is still attached.
    pub fn is_connected(&self) -> bool {
        self.lock()
            .current
            .as_ref()
            .is_some_and(|connection| !connection.frames.is_closed())
    }

    fn deliver(&self, item: Result<TransportFrame, TransportError>) -> bool {
        self.lock()
            .current
            .as_ref()
            .is_some_and(|connection| connection.frames.send(item).is_ok())
    }

    /// Deliver a text frame on the current connection.
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.deliver(Ok(TransportFrame::Text(text.into())))
    }

    pub fn push_json(&self, value: &serde_json::Value) -> bool {
        self.push_text(value.to_string())
    }

    /// Deliver a transport error on the current connection.
    pub fn fail(&self, err: TransportError) -> bool {
        self.deliver(Err(err))
    }

    /// Close the current connection from the peer side with a close frame.
    pub fn close(&self, code: Option<u16>, reason: impl Into<String>) -> bool {
        let delivered = self.deliver(Ok(TransportFrame::Closed {
            code,
            reason: reason.into(),
        }));
        self.drop_connection();
        delivered
    }

    /// End the current connection without a close frame.
    pub fn drop_connection(&self) -> bool {
        let mut state = self.lock();
        state.collect_sent();
        state.current.take().is_some()
    }

    /// Text frames sent by the manager so far, across connections.
    pub fn sent(&self) -> Vec<String> {
        let mut state = self.lock();
        state.collect_sent();
        state.sent.clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, session: &SessionId) -> Result<TransportLink, TransportError> {
        let mut state = self.lock();
        state.opened.push((session.clone(), Instant::now()));

        if let Some(err) = state.scripted_failures.pop_front() {
            return Err(err);
        }
        if state.refuse_all {
            return Err(TransportError::Connect {
                url: format!("memory://{session}"),
                reason: "connection refused".to_string(),
            });
        }

        state.collect_sent();
        let (frames, frame_rx) = mpsc::unbounded_channel();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        state.current = Some(MemoryConnection {
            frames,
            outgoing: outgoing_rx,
        });

        let incoming = stream::unfold(frame_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(TransportLink { outgoing, incoming })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_through_link() {
        let transport = MemoryTransport::new();
        let mut link = transport.open(&SessionId::new("s")).await.unwrap();

        assert!(transport.push_text("hello"));
        assert_eq!(
            link.incoming.next().await,
            Some(Ok(TransportFrame::Text("hello".to_string())))
        );

        link.outgoing.send("out".to_string()).unwrap();
        assert_eq!(transport.sent(), vec!["out".to_string()]);

        assert!(transport.drop_connection());
        assert_eq!(link.incoming.next().await, None);
    }

    #[tokio::test]
    async fn test_scripted_failure_then_success() {
        let transport = MemoryTransport::new();
        transport.fail_next_open(TransportError::Protocol {
            reason: "nope".to_string(),
        });

        assert!(transport.open(&SessionId::new("s")).await.is_err());
        assert!(transport.open(&SessionId::new("s")).await.is_ok());
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test]
    async fn test_push_without_connection_is_dropped() {
        let transport = MemoryTransport::new();
        assert!(!transport.push_text("lost"));
        assert!(!transport.is_connected());
    }
}
