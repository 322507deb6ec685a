//! `LiveSession` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! LiveSession::new()
//!     └─► start()      → transport connected, devices open, state = Connecting
//!         │                 setup ack        → state = Active
//!         │                 auth failure     → state = Error + credential remediation
//!         │                 network failure  → state = Error
//!         └─► stop()    → transport closed, devices released, playback
//!                         cleared, state = Closed
//! ```
//!
//! `Error` and `Closed` are terminal: construct a new session to retry.
//! `stop()` is idempotent and safe at any point, including mid-teardown; its
//! four steps (close transport, release capture, release output, clear
//! playback) all run best-effort even when an earlier one fails.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS, so each device is created
//! *inside* its own `spawn_blocking` closure and never crosses a thread
//! boundary. The capture thread doubles as the uplink pump; the output thread
//! parks until teardown. A oneshot per device propagates open errors back to
//! `start()`.

pub mod dispatch;
pub mod uplink;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::capture::AudioCapture;
use crate::audio::create_capture_ring;
use crate::audio::output::AudioOutput;
use crate::codec::OUTPUT_SAMPLE_RATE;
use crate::credentials::CredentialSelector;
use crate::error::{ColloquyError, Result};
use crate::events::{AudioActivityEvent, SessionPhase, SessionStateEvent, TranscriptEvent};
use crate::playback::renderer::Renderer;
use crate::playback::{DownlinkDiagnostics, DownlinkSnapshot, PlaybackScheduler};
use crate::protocol::{
    ClientMessage, Content, EmptyConfig, GenerationConfig, PrebuiltVoiceConfig, SetupPayload,
    SpeechConfig, Tool, VoiceConfig,
};
use crate::transcript::TranscriptState;
use crate::transport::{Connection, Connector};
use uplink::{UplinkContext, UplinkDiagnostics, UplinkSnapshot};

/// Broadcast channel capacity: 256 events buffered for slow subscribers.
const BROADCAST_CAP: usize = 256;

/// Poll interval of the output thread's park loop during a session.
const OUTPUT_PARK_MS: u64 = 25;

/// Configuration for one live session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Agent model identifier sent in the setup message.
    pub model: String,
    /// Prebuilt voice name for synthesized speech.
    pub voice: String,
    /// Optional persona / system instruction.
    pub system_instruction: Option<String>,
    /// Whether to offer the agent its web retrieval tool.
    pub enable_search: bool,
    /// Ask the agent to transcribe the person's speech.
    pub transcribe_input: bool,
    /// Ask the agent to transcribe its own speech.
    pub transcribe_output: bool,
    /// Input device name override. `None` uses the system default.
    pub preferred_input_device: Option<String>,
    /// Output device name override. `None` uses the system default.
    pub preferred_output_device: Option<String>,
    /// Samples per outbound frame at the 16 kHz wire rate.
    /// Default: 4096 (≈ 256 ms).
    pub capture_frame_samples: usize,
    /// Outbound send queue depth in chunks. When full, frames drop.
    pub send_queue_chunks: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.0-flash-live-001".into(),
            voice: "Kore".into(),
            system_instruction: None,
            enable_search: true,
            transcribe_input: true,
            transcribe_output: true,
            preferred_input_device: None,
            preferred_output_device: None,
            capture_frame_samples: 4096,
            send_queue_chunks: 8,
        }
    }
}

impl SessionConfig {
    /// Build the setup message announcing this configuration to the agent.
    pub fn setup_message(&self) -> ClientMessage {
        ClientMessage::Setup(SetupPayload {
            model: self.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".into()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice.clone(),
                        },
                    },
                }),
            },
            system_instruction: self
                .system_instruction
                .as_deref()
                .map(Content::from_text),
            tools: self.enable_search.then(|| vec![Tool::web_search()]),
            input_audio_transcription: self.transcribe_input.then(EmptyConfig::default),
            output_audio_transcription: self.transcribe_output.then(EmptyConfig::default),
        })
    }
}

/// Lifecycle state of one session instance. Exactly one is current at any
/// time; `Error` and `Closed` never transition further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, `start()` not yet called.
    Idle,
    /// Transport and devices are being acquired; setup unacknowledged.
    Connecting,
    /// Duplex streaming is live.
    Active,
    /// Terminal failure, with a user-actionable message.
    Error(String),
    /// Terminal clean shutdown.
    Closed,
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Connecting => SessionPhase::Connecting,
            SessionState::Active => SessionPhase::Active,
            SessionState::Error(_) => SessionPhase::Error,
            SessionState::Closed => SessionPhase::Closed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Error(_) | SessionState::Closed)
    }
}

/// Single mutation point for session state: every transition goes through
/// `set`, which also broadcasts the change. Terminal states stick.
#[derive(Clone)]
pub struct StateCell {
    inner: Arc<Mutex<SessionState>>,
    tx: broadcast::Sender<SessionStateEvent>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            inner: Arc::new(Mutex::new(SessionState::Idle)),
            tx,
        }
    }

    /// Apply a transition. Ignored once the session is terminal — `Error`
    /// and `Closed` are final for this instance.
    pub fn set(&self, next: SessionState) {
        let mut current = self.inner.lock();
        if current.is_terminal() {
            debug!("ignoring state transition after terminal state");
            return;
        }
        *current = next.clone();
        drop(current);

        let detail = match &next {
            SessionState::Error(message) => Some(message.clone()),
            _ => None,
        };
        let _ = self.tx.send(SessionStateEvent {
            phase: next.phase(),
            detail,
        });
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionStateEvent> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct SessionTasks {
    transport: Option<crate::transport::TransportHandle>,
    capture: Option<JoinHandle<()>>,
    output: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
}

/// The top-level session handle.
///
/// `LiveSession` is `Send + Sync` — all fields use interior mutability. Wrap
/// in `Arc<LiveSession>` to share between host commands and event-forwarding
/// tasks.
pub struct LiveSession {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSelector>,
    /// `true` between a successful `start()` and the beginning of teardown.
    running: Arc<AtomicBool>,
    state: StateCell,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    /// Monotonically increasing event sequence counter.
    seq: Arc<AtomicU64>,
    uplink_diagnostics: Arc<UplinkDiagnostics>,
    downlink_diagnostics: Arc<DownlinkDiagnostics>,
    tasks: Mutex<SessionTasks>,
}

impl LiveSession {
    /// Create a session. Nothing is acquired until `start()`.
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSelector>,
    ) -> Self {
        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            connector,
            credentials,
            running: Arc::new(AtomicBool::new(false)),
            state: StateCell::new(),
            transcript_tx,
            activity_tx,
            seq: Arc::new(AtomicU64::new(0)),
            uplink_diagnostics: Arc::new(UplinkDiagnostics::default()),
            downlink_diagnostics: Arc::new(DownlinkDiagnostics::default()),
            tasks: Mutex::new(SessionTasks::default()),
        }
    }

    /// Connect the transport and open both audio devices, in that order.
    ///
    /// Returns once everything is acquired; the session is then `Connecting`
    /// and flips to `Active` when the agent acknowledges setup. On failure
    /// the session ends in `Error` with already-acquired resources released,
    /// and auth failures additionally invoke the credential selector once.
    ///
    /// # Errors
    /// - `ColloquyError::AlreadyRunning` when called twice.
    /// - `ColloquyError::SessionEnded` on a terminal (used-up) instance.
    /// - The classified transport or device error otherwise.
    pub async fn start(&self) -> Result<()> {
        if self.state.snapshot().is_terminal() {
            return Err(ColloquyError::SessionEnded);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ColloquyError::AlreadyRunning);
        }

        self.state.set(SessionState::Connecting);
        info!(model = %self.config.model, "starting live session");

        // ── 1. Transport ─────────────────────────────────────────────────
        let Connection { events, handle } = match self.connector.connect(&self.config).await {
            Ok(connection) => connection,
            Err(err) => return Err(self.fail_on_start(err).await),
        };

        // ── 2. Capture device + uplink pump (one blocking thread) ────────
        let (producer, consumer) = create_capture_ring();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let (capture_ack_tx, capture_ack_rx) = oneshot::channel::<Result<u32>>();

        let capture_running = Arc::clone(&self.running);
        let preferred_input = self.config.preferred_input_device.clone();
        let uplink_transport = handle.clone();
        let uplink_running = Arc::clone(&self.running);
        let uplink_activity = self.activity_tx.clone();
        let uplink_seq = Arc::clone(&self.seq);
        let uplink_diagnostics = Arc::clone(&self.uplink_diagnostics);
        let frame_samples = self.config.capture_frame_samples;

        let capture_task = tokio::task::spawn_blocking(move || {
            // Device must open on THIS thread — cpal::Stream is !Send.
            let capture = match AudioCapture::open_with_preference(
                producer,
                Arc::clone(&capture_running),
                fault_tx,
                preferred_input.as_deref(),
            ) {
                Ok(capture) => {
                    let _ = capture_ack_tx.send(Ok(capture.sample_rate));
                    capture
                }
                Err(e) => {
                    let _ = capture_ack_tx.send(Err(e));
                    return;
                }
            };

            uplink::run(UplinkContext {
                consumer,
                transport: uplink_transport,
                running: uplink_running,
                capture_sample_rate: capture.sample_rate,
                frame_samples,
                activity_tx: uplink_activity,
                seq: uplink_seq,
                diagnostics: uplink_diagnostics,
            });

            // Stream drops here, releasing the device on its own thread.
            drop(capture);
        });

        match capture_ack_rx.await {
            Ok(Ok(rate)) => debug!(capture_rate = rate, "capture device open"),
            Ok(Err(err)) => {
                handle.close();
                return Err(self.fail_on_start(err).await);
            }
            Err(_) => {
                handle.close();
                return Err(self
                    .fail_on_start(ColloquyError::AudioStream(
                        "capture thread died before opening the device".into(),
                    ))
                    .await);
            }
        }

        // ── 3. Output device + renderer (second blocking thread) ─────────
        let (scheduler, endpoints) =
            PlaybackScheduler::new(OUTPUT_SAMPLE_RATE, Arc::clone(&self.downlink_diagnostics));
        let renderer = Renderer::new(endpoints);
        let (output_ack_tx, output_ack_rx) = oneshot::channel::<Result<()>>();

        let output_running = Arc::clone(&self.running);
        let preferred_output = self.config.preferred_output_device.clone();

        let output_task = tokio::task::spawn_blocking(move || {
            let output = match AudioOutput::open_with_preference(
                renderer,
                Arc::clone(&output_running),
                preferred_output.as_deref(),
            ) {
                Ok(output) => {
                    let _ = output_ack_tx.send(Ok(()));
                    output
                }
                Err(e) => {
                    let _ = output_ack_tx.send(Err(e));
                    return;
                }
            };

            // Park until teardown, then drop the stream on this thread.
            while output_running.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(OUTPUT_PARK_MS));
            }
            drop(output);
        });

        match output_ack_rx.await {
            Ok(Ok(())) => debug!("playback device open"),
            Ok(Err(err)) => {
                handle.close();
                return Err(self.fail_on_start(err).await);
            }
            Err(_) => {
                handle.close();
                return Err(self
                    .fail_on_start(ColloquyError::AudioStream(
                        "output thread died before opening the device".into(),
                    ))
                    .await);
            }
        }

        // ── 4. Dispatch loop ─────────────────────────────────────────────
        let dispatch_task = tokio::spawn(dispatch::run(dispatch::DispatchContext {
            events,
            handle: handle.clone(),
            scheduler,
            transcript: TranscriptState::new(),
            credentials: Arc::clone(&self.credentials),
            running: Arc::clone(&self.running),
            state: self.state.clone(),
            transcript_tx: self.transcript_tx.clone(),
            seq: Arc::clone(&self.seq),
            faults: fault_rx,
        }));

        let mut tasks = self.tasks.lock();
        tasks.transport = Some(handle);
        tasks.capture = Some(capture_task);
        tasks.output = Some(output_task);
        tasks.dispatch = Some(dispatch_task);

        Ok(())
    }

    /// Tear the session down: close the transport, release the capture
    /// device, release the output device, stop and clear scheduled playback
    /// — in that order, each step best-effort. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("stop: session not running (no-op)");
            return Ok(());
        }
        info!("stopping live session");

        let SessionTasks {
            transport,
            capture,
            output,
            dispatch,
        } = std::mem::take(&mut *self.tasks.lock());

        // 1. Close the transport.
        if let Some(handle) = transport {
            handle.close();
        }

        // 2. Release the capture device (pump exits on the running flag).
        if let Some(task) = capture {
            if let Err(e) = task.await {
                warn!("capture thread ended abnormally: {e}");
            }
        }

        // 3. Release the output device.
        if let Some(task) = output {
            if let Err(e) = task.await {
                warn!("output thread ended abnormally: {e}");
            }
        }

        // 4. Scheduled playback is flushed by the dispatch loop on exit.
        if let Some(task) = dispatch {
            if let Err(e) = task.await {
                warn!("dispatch task ended abnormally: {e}");
            }
        }

        self.state.set(SessionState::Closed);
        Ok(())
    }

    /// Failure during `start()`: end in `Error`, remediate credentials when
    /// applicable, and hand the original error back to the caller.
    async fn fail_on_start(&self, err: ColloquyError) -> ColloquyError {
        warn!("session start failed: {err}");

        let credential_failure = err.is_credential_failure();
        self.running.store(false, Ordering::SeqCst);
        self.state.set(SessionState::Error(dispatch::user_facing_message(
            &err, true,
        )));

        if credential_failure {
            if let Err(e) = self.credentials.select_credential().await {
                warn!("credential selection failed: {e}");
            }
        }
        err
    }

    /// Current lifecycle state (snapshot).
    pub fn state(&self) -> SessionState {
        self.state.snapshot()
    }

    /// Subscribe to lifecycle transitions.
    pub fn subscribe_state(&self) -> broadcast::Receiver<SessionStateEvent> {
        self.state.subscribe()
    }

    /// Subscribe to transcript / grounding updates.
    pub fn subscribe_transcript(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.transcript_tx.subscribe()
    }

    /// Subscribe to microphone level events.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.activity_tx.subscribe()
    }

    /// Snapshot of uplink counters for observability.
    pub fn uplink_snapshot(&self) -> UplinkSnapshot {
        self.uplink_diagnostics.snapshot()
    }

    /// Snapshot of downlink counters for observability.
    pub fn downlink_snapshot(&self) -> DownlinkSnapshot {
        self.downlink_diagnostics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_wire_contract() {
        let config = SessionConfig::default();
        assert_eq!(config.capture_frame_samples, 4096);
        assert_eq!(config.voice, "Kore");
        assert!(config.enable_search);
    }

    #[test]
    fn setup_message_reflects_toggles() {
        let config = SessionConfig {
            enable_search: false,
            transcribe_input: false,
            system_instruction: Some("be helpful".into()),
            ..SessionConfig::default()
        };

        let json = serde_json::to_value(config.setup_message()).unwrap();
        assert!(json["setup"]["tools"].is_null());
        assert!(json["setup"]["inputAudioTranscription"].is_null());
        assert!(json["setup"]["outputAudioTranscription"].is_object());
        assert_eq!(
            json["setup"]["systemInstruction"]["parts"][0]["text"],
            "be helpful"
        );
    }

    #[test]
    fn state_cell_sticks_at_terminal_states() {
        let cell = StateCell::new();
        cell.set(SessionState::Connecting);
        cell.set(SessionState::Error("bad key".into()));
        cell.set(SessionState::Closed);
        assert_eq!(cell.snapshot(), SessionState::Error("bad key".into()));

        let cell = StateCell::new();
        cell.set(SessionState::Closed);
        cell.set(SessionState::Connecting);
        assert_eq!(cell.snapshot(), SessionState::Closed);
    }

    #[test]
    fn state_cell_broadcasts_error_detail() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        cell.set(SessionState::Error("Connection lost. Please try again.".into()));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.phase, SessionPhase::Error);
        assert_eq!(
            event.detail.as_deref(),
            Some("Connection lost. Please try again.")
        );
    }
}
