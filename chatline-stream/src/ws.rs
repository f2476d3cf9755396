//! WebSocket transport.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use chatline_core::{SessionId, TransportError};

use crate::transport::{Transport, TransportFrame, TransportLink};

/// Connects to `<base_url>/<session_id>` over WebSocket.
#[derive(Clone)]
pub struct WsTransport {
    base_url: String,
    bearer_token: Option<String>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.bearer_token.is_some())
            .finish()
    }
}

impl WsTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` on the upgrade request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn endpoint(&self, session: &SessionId) -> String {
        format!("{}/{}", self.base_url, session)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, session: &SessionId) -> Result<TransportLink, TransportError> {
        let url = self.endpoint(session);
        let connect_error = |reason: String| TransportError::Connect {
            url: url.clone(),
            reason,
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| connect_error(err.to_string()))?;
        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| connect_error(err.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|err| connect_error(err.to_string()))?;
        debug!(url = %url, "WebSocket connected");

        let (mut sink, source) = stream.split();
        let (outgoing, mut pending) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = pending.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    warn!(error = %err, "WebSocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let incoming = source
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(TransportFrame::Text(text))),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => Some(Ok(TransportFrame::Text(text))),
                        Err(_) => {
                            debug!("Ignoring non-UTF-8 binary frame");
                            None
                        }
                    },
                    Ok(Message::Close(frame)) => Some(Ok(TransportFrame::Closed {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
                    })),
                    Ok(_) => None,
                    Err(err) => Some(Err(TransportError::Protocol {
                        reason: err.to_string(),
                    })),
                }
            })
            .boxed();

        Ok(TransportLink { outgoing, incoming })
    }
}
