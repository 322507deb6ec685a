//! Protocol event dispatch loop.
//!
//! Runs as one Tokio task per session and is the *single writer* for the
//! playback scheduler and the transcript state — every protocol-driven
//! mutation happens here, in arrival order. The loop ends when the transport
//! reports closure or failure, or when a capture fault arrives; it flushes
//! scheduled playback on every exit path.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::credentials::CredentialSelector;
use crate::error::ColloquyError;
use crate::events::TranscriptEvent;
use crate::playback::PlaybackScheduler;
use crate::protocol::ServerEvent;
use crate::session::{SessionState, StateCell};
use crate::transcript::TranscriptState;
use crate::transport::{classify_failure, TransportEvent, TransportHandle};

/// Everything the dispatch loop needs, passed as one struct so the spawn
/// site stays tidy.
pub struct DispatchContext {
    pub events: mpsc::Receiver<TransportEvent>,
    pub handle: TransportHandle,
    pub scheduler: PlaybackScheduler,
    pub transcript: TranscriptState,
    pub credentials: Arc<dyn CredentialSelector>,
    pub running: Arc<AtomicBool>,
    pub state: StateCell,
    pub transcript_tx: broadcast::Sender<TranscriptEvent>,
    pub seq: Arc<AtomicU64>,
    /// Capture-device fault reports from the audio error callback.
    pub faults: mpsc::UnboundedReceiver<String>,
}

/// Run the dispatch loop until the session ends.
pub async fn run(mut ctx: DispatchContext) {
    let mut faults_open = true;

    loop {
        tokio::select! {
            event = ctx.events.recv() => {
                match event {
                    Some(TransportEvent::Open) => {
                        info!("setup acknowledged — session active");
                        ctx.state.set(SessionState::Active);
                    }
                    Some(TransportEvent::Event(event)) => {
                        if handle_event(&mut ctx, event).await {
                            break;
                        }
                    }
                    Some(TransportEvent::Failed(err)) => {
                        fail(&mut ctx, err).await;
                        break;
                    }
                    Some(TransportEvent::Closed) | None => {
                        info!("transport closed");
                        ctx.scheduler.flush();
                        ctx.running.store(false, Ordering::SeqCst);
                        ctx.state.set(SessionState::Closed);
                        break;
                    }
                }
            }

            fault = ctx.faults.recv(), if faults_open => {
                match fault {
                    Some(detail) => {
                        fail(&mut ctx, ColloquyError::CaptureLost(detail)).await;
                        break;
                    }
                    // Capture thread gone; nothing more will arrive.
                    None => faults_open = false,
                }
            }
        }
    }
}

/// Apply one protocol event. Returns `true` when the loop should end.
async fn handle_event(ctx: &mut DispatchContext, event: ServerEvent) -> bool {
    match &event {
        ServerEvent::Audio(chunk) => ctx.scheduler.enqueue_chunk(chunk),
        ServerEvent::Interrupted => ctx.scheduler.interrupt(),
        ServerEvent::ServerError { message, .. } => {
            // Normally classified by the transport; kept for completeness.
            let err = classify_failure(message);
            fail(ctx, err).await;
            return true;
        }
        _ => {}
    }

    if ctx.transcript.apply(&event) {
        let _ = ctx.transcript_tx.send(TranscriptEvent {
            seq: ctx.seq.fetch_add(1, Ordering::Relaxed),
            user_utterance: ctx.transcript.user_utterance().to_string(),
            agent_utterance: ctx.transcript.agent_utterance().to_string(),
            citations: ctx.transcript.citations().to_vec(),
            searching: ctx.transcript.is_searching(),
        });
    }
    false
}

/// Terminal failure path: stop playback, end the session in `Error`, and for
/// credential failures invoke the host's selector exactly once.
async fn fail(ctx: &mut DispatchContext, err: ColloquyError) {
    warn!("session failed: {err}");

    let connecting = matches!(ctx.state.snapshot(), SessionState::Connecting);
    let credential_failure = err.is_credential_failure();

    ctx.scheduler.flush();
    ctx.handle.close();
    ctx.running.store(false, Ordering::SeqCst);
    ctx.state
        .set(SessionState::Error(user_facing_message(&err, connecting)));

    if credential_failure {
        if let Err(e) = ctx.credentials.select_credential().await {
            warn!("credential selection failed: {e}");
        }
    }
}

/// Short, actionable copy for the person — raw protocol text never surfaces.
pub fn user_facing_message(err: &ColloquyError, connecting: bool) -> String {
    match err {
        ColloquyError::TransportAuth(_) if connecting => {
            "Select a valid API key to start talking.".into()
        }
        ColloquyError::TransportAuth(_) => "API key selection required for live session.".into(),
        ColloquyError::CaptureLost(_) => {
            "Microphone unavailable. Check your input device and try again.".into()
        }
        _ => "Connection lost. Please try again.".into(),
    }
}
