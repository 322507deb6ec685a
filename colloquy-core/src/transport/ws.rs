//! WebSocket connector for the live agent endpoint.
//!
//! One spawned task owns the socket for the connection's lifetime: it writes
//! queued client messages, answers pings, parses inbound frames through the
//! protocol boundary, and reports classified failures. The session never
//! touches the socket directly.

use std::sync::{atomic::AtomicBool, Arc};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, protocol::frame::coding::CloseCode, Message};
use tracing::{debug, error, info, warn};

use crate::error::{ColloquyError, Result};
use crate::protocol::{parse_server_frame, ServerEvent};
use crate::session::SessionConfig;
use crate::transport::{
    classify_failure, Connection, Connector, TransportEvent, TransportHandle,
    EVENT_QUEUE_CAPACITY,
};

/// Default live endpoint. The API key is appended as a query parameter.
pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Connects to the agent over a WebSocket.
pub struct WsConnector {
    endpoint: String,
    api_key: String,
}

impl WsConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            api_key: api_key.into(),
        }
    }

    /// Point at a non-default endpoint (proxies, test servers).
    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Connection> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);

        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(classify_ws_error)?;
        info!("connected to live endpoint");

        let (mut sink, mut stream) = ws.split();

        // Setup goes out before the handle exists, so nothing can race it.
        let setup = serde_json::to_string(&config.setup_message())
            .map_err(|e| ColloquyError::TransportNetwork(format!("setup serialization: {e}")))?;
        sink.send(Message::Text(setup.into()))
            .await
            .map_err(classify_ws_error)?;

        let (outbound_tx, mut outbound_rx) = mpsc::channel(config.send_queue_chunks);
        let (close_tx, mut close_rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let open = Arc::new(AtomicBool::new(false));
        let handle = TransportHandle::new(outbound_tx, close_tx, Arc::clone(&open));
        let task_open = Arc::clone(&open);

        tokio::spawn(async move {
            use std::sync::atomic::Ordering;

            loop {
                tokio::select! {
                    _ = close_rx.recv() => {
                        debug!("transport close requested");
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = event_tx.send(TransportEvent::Closed).await;
                        break;
                    }

                    outbound = outbound_rx.recv() => {
                        let Some(message) = outbound else {
                            let _ = sink.send(Message::Close(None)).await;
                            let _ = event_tx.send(TransportEvent::Closed).await;
                            break;
                        };
                        let json = match serde_json::to_string(&message) {
                            Ok(json) => json,
                            Err(e) => {
                                error!("failed to serialize client message: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(json.into())).await {
                            let _ = event_tx
                                .send(TransportEvent::Failed(classify_ws_error(e)))
                                .await;
                            break;
                        }
                    }

                    inbound = stream.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => {
                                if !forward_frame(&text, &task_open, &event_tx).await {
                                    break;
                                }
                            }
                            // The endpoint also delivers JSON frames as binary.
                            Some(Ok(Message::Binary(bytes))) => {
                                match std::str::from_utf8(&bytes) {
                                    Ok(text) => {
                                        if !forward_frame(text, &task_open, &event_tx).await {
                                            break;
                                        }
                                    }
                                    Err(_) => warn!("dropping non-UTF-8 binary frame"),
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = sink.send(Message::Pong(data)).await {
                                    warn!("failed to answer ping: {e}");
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let event = match frame {
                                    Some(frame) if frame.code != CloseCode::Normal => {
                                        TransportEvent::Failed(classify_failure(&frame.reason))
                                    }
                                    _ => TransportEvent::Closed,
                                };
                                let _ = event_tx.send(event).await;
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = event_tx
                                    .send(TransportEvent::Failed(classify_ws_error(e)))
                                    .await;
                                break;
                            }
                            None => {
                                let _ = event_tx
                                    .send(TransportEvent::Failed(ColloquyError::TransportNetwork(
                                        "connection closed unexpectedly".into(),
                                    )))
                                    .await;
                                break;
                            }
                        }
                    }
                }
            }

            task_open.store(false, Ordering::Release);
            debug!("transport task finished");
        });

        Ok(Connection {
            events: event_rx,
            handle,
        })
    }
}

/// Parse one wire frame and forward its events. Returns `false` when the
/// connection should end (terminal protocol error).
async fn forward_frame(
    text: &str,
    open: &Arc<AtomicBool>,
    event_tx: &mpsc::Sender<TransportEvent>,
) -> bool {
    use std::sync::atomic::Ordering;

    for event in parse_server_frame(text) {
        match event {
            ServerEvent::SetupComplete => {
                open.store(true, Ordering::Release);
                if event_tx.send(TransportEvent::Open).await.is_err() {
                    return false;
                }
            }
            ServerEvent::ServerError { code, message } => {
                warn!(?code, "agent reported error: {message}");
                let _ = event_tx
                    .send(TransportEvent::Failed(classify_failure(&message)))
                    .await;
                return false;
            }
            other => {
                if event_tx.send(TransportEvent::Event(other)).await.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

/// Map a tungstenite error onto the session error taxonomy. Handshake
/// rejections with credential-shaped statuses become auth failures.
fn classify_ws_error(error: tungstenite::Error) -> ColloquyError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if matches!(status.as_u16(), 401 | 403 | 404) {
                ColloquyError::TransportAuth(format!("endpoint rejected connection ({status})"))
            } else {
                ColloquyError::TransportNetwork(format!("handshake failed ({status})"))
            }
        }
        other => classify_failure(&other.to_string()),
    }
}
