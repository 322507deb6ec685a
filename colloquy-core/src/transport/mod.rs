//! Transport boundary to the remote agent.
//!
//! The session owns exactly one transport connection for its lifetime. The
//! uplink pump talks to it through a cloneable [`TransportHandle`] whose send
//! path is strictly non-blocking: audio produced before the agent has
//! acknowledged setup, or while the send queue is full, is dropped — never
//! buffered. Inbound traffic arrives as [`TransportEvent`]s on an mpsc
//! channel consumed by the session's dispatch loop.
//!
//! [`Connector`] is the seam for tests: the real WebSocket connector lives in
//! [`ws`], a mock fabricates the same channel pair.

#[cfg(feature = "transport-ws")]
pub mod ws;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec::EncodedChunk;
use crate::error::{ColloquyError, Result};
use crate::protocol::{ClientMessage, ServerEvent};
use crate::session::SessionConfig;

/// Inbound event queue depth. Protocol messages are small; 256 rides out a
/// slow dispatch iteration without dropping events.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Outcome of a non-blocking uplink send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Setup not acknowledged yet — pre-open audio is discarded.
    NotOpen,
    /// Send queue full or connection gone.
    Dropped,
}

/// Notifications from the transport task to the session.
#[derive(Debug)]
pub enum TransportEvent {
    /// Setup acknowledged; duplex streaming is live.
    Open,
    /// A validated protocol event.
    Event(ServerEvent),
    /// The connection ended cleanly.
    Closed,
    /// The connection failed; already classified auth vs network.
    Failed(ColloquyError),
}

/// Cloneable uplink handle to an open connection.
#[derive(Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<ClientMessage>,
    close: mpsc::Sender<()>,
    open: Arc<AtomicBool>,
}

impl TransportHandle {
    pub fn new(
        outbound: mpsc::Sender<ClientMessage>,
        close: mpsc::Sender<()>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self {
            outbound,
            close,
            open,
        }
    }

    /// Hand one microphone chunk to the transport without blocking.
    pub fn try_send_audio(&self, chunk: EncodedChunk) -> SendOutcome {
        if !self.open.load(Ordering::Acquire) {
            return SendOutcome::NotOpen;
        }
        match self.outbound.try_send(ClientMessage::audio(chunk)) {
            Ok(()) => SendOutcome::Sent,
            Err(_) => SendOutcome::Dropped,
        }
    }

    /// True once the agent has acknowledged setup.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn mark_open(&self) {
        self.open.store(true, Ordering::Release);
    }

    /// Request connection shutdown. Synchronous and idempotent; the transport
    /// task sends the close frame and reports `Closed`.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        let _ = self.close.try_send(());
    }
}

/// One live connection: the inbound event stream plus the uplink handle.
pub struct Connection {
    pub events: mpsc::Receiver<TransportEvent>,
    pub handle: TransportHandle,
}

/// Opens connections to the agent. The seam between the session and any
/// concrete transport.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &SessionConfig) -> Result<Connection>;
}

/// Failure text that indicates a credential problem rather than a transient
/// network fault.
const AUTH_MARKERS: &[&str] = &[
    "NOT_FOUND",
    "Requested entity was not found",
    "API key",
    "API_KEY",
    "PERMISSION_DENIED",
    "UNAUTHENTICATED",
];

/// Classify a transport failure from its detail text.
///
/// Anything that smells like a rejected or missing credential becomes
/// [`ColloquyError::TransportAuth`] (which triggers the host's credential
/// remediation); everything else is a generic network failure.
pub fn classify_failure(detail: &str) -> ColloquyError {
    if AUTH_MARKERS.iter().any(|marker| detail.contains(marker)) {
        ColloquyError::TransportAuth(detail.to_string())
    } else {
        ColloquyError::TransportNetwork(detail.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;

    fn handle_with_queue(capacity: usize) -> (TransportHandle, mpsc::Receiver<ClientMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (close_tx, _close_rx) = mpsc::channel(1);
        let handle = TransportHandle::new(outbound_tx, close_tx, Arc::new(AtomicBool::new(false)));
        (handle, outbound_rx)
    }

    #[test]
    fn audio_before_open_is_discarded() {
        let (handle, mut rx) = handle_with_queue(4);

        for _ in 0..3 {
            let outcome = handle.try_send_audio(encode_frame(&[0.0; 64]));
            assert_eq!(outcome, SendOutcome::NotOpen);
        }
        assert!(rx.try_recv().is_err(), "pre-open audio must not be buffered");
    }

    #[test]
    fn audio_after_open_is_sent_once() {
        let (handle, mut rx) = handle_with_queue(4);
        handle.mark_open();

        assert_eq!(
            handle.try_send_audio(encode_frame(&[0.0; 64])),
            SendOutcome::Sent
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            ClientMessage::RealtimeInput(_)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (handle, _rx) = handle_with_queue(1);
        handle.mark_open();

        assert_eq!(
            handle.try_send_audio(encode_frame(&[0.0; 64])),
            SendOutcome::Sent
        );
        assert_eq!(
            handle.try_send_audio(encode_frame(&[0.0; 64])),
            SendOutcome::Dropped
        );
    }

    #[test]
    fn close_marks_handle_not_open() {
        let (handle, _rx) = handle_with_queue(1);
        handle.mark_open();
        handle.close();
        assert!(!handle.is_open());
        // Safe to call again mid-teardown.
        handle.close();
    }

    #[test]
    fn classifies_credential_failures() {
        assert!(matches!(
            classify_failure("Requested entity was not found."),
            ColloquyError::TransportAuth(_)
        ));
        assert!(matches!(
            classify_failure("status 403: PERMISSION_DENIED"),
            ColloquyError::TransportAuth(_)
        ));
        assert!(matches!(
            classify_failure("connection reset by peer"),
            ColloquyError::TransportNetwork(_)
        ));
    }
}
