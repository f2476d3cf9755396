//! Transport seam between the connection manager and the network.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;

use chatline_core::{SessionId, TransportError};

/// One item read from an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Text(String),
    /// The peer closed the connection. The stream ends after this.
    Closed { code: Option<u16>, reason: String },
}

/// An open connection.
///
/// Dropping `outgoing` asks the transport to close its side. The end of
/// `incoming` without a `Closed` frame is an abrupt close.
pub struct TransportLink {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: BoxStream<'static, Result<TransportFrame, TransportError>>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("outgoing_closed", &self.outgoing.is_closed())
            .finish_non_exhaustive()
    }
}

/// Opens connections scoped to a session.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, session: &SessionId) -> Result<TransportLink, TransportError>;
}
