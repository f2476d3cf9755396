//! Stream connection manager for the chatline client data layer.
//!
//! One [`ConnectionManager`] owns one persistent bidirectional connection
//! for one logical session. It reconnects with exponential backoff after
//! unexpected closes or transport errors, decodes incoming frames into
//! typed [`StreamEvent`]s, and dispatches them to listeners in arrival
//! order. Status transitions are observable through callbacks and a
//! `watch` channel.
//!
//! The network is behind the [`Transport`] trait: [`WsTransport`] speaks
//! WebSocket, [`MemoryTransport`] is driven by hand in tests.

pub mod category;
pub mod event;
pub mod manager;
pub mod memory;
pub mod reconnect;
pub mod registry;
pub mod status;
pub mod transport;
pub mod ws;

pub use category::EventCategory;
pub use event::{decode_frame, encode_frame, OutgoingFrame, ParseError, StreamEvent};
pub use manager::ConnectionManager;
pub use memory::MemoryTransport;
pub use reconnect::ReconnectConfig;
pub use registry::{EventHandler, ListenerId, ListenerRegistry};
pub use status::{ConnectionFault, ConnectionState, ConnectionStatus, StatusHandler, StatusObservers};
pub use transport::{Transport, TransportFrame, TransportLink};
pub use ws::WsTransport;
