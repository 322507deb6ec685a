//! Capture/encode pump: microphone ring → fixed frames → wire chunks.
//!
//! ## Cadence and drop policy
//!
//! The device callback deposits mono samples at the capture rate; this loop
//! drains them, resamples to the 16 kHz wire rate, and cuts fixed 4096-sample
//! frames (≈ 256 ms each). Every frame is encoded and handed to the transport
//! with a non-blocking send. A frame that cannot go out right now — setup not
//! acknowledged, queue full — is dropped and counted. Nothing is ever queued
//! beyond the send channel: in a live conversation stale audio is worse than
//! missing audio.
//!
//! The whole loop runs on the same blocking thread that owns the capture
//! stream, keeping the Tokio executor free for protocol I/O.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::audio::resample::RateConverter;
use crate::audio::{CaptureConsumer, Consumer};
use crate::codec;
use crate::events::AudioActivityEvent;
use crate::transport::{SendOutcome, TransportHandle};

/// Samples drained from the ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty, to avoid burning a core.
const EMPTY_SLEEP_MS: u64 = 5;

/// Uplink counters for observability.
#[derive(Default)]
pub struct UplinkDiagnostics {
    pub samples_in: AtomicUsize,
    pub frames_encoded: AtomicUsize,
    pub chunks_sent: AtomicUsize,
    pub chunks_dropped: AtomicUsize,
}

impl UplinkDiagnostics {
    pub fn snapshot(&self) -> UplinkSnapshot {
        UplinkSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UplinkSnapshot {
    pub samples_in: usize,
    pub frames_encoded: usize,
    pub chunks_sent: usize,
    pub chunks_dropped: usize,
}

/// Everything the pump needs, passed as one struct so the spawn site stays
/// tidy.
pub struct UplinkContext {
    pub consumer: CaptureConsumer,
    pub transport: TransportHandle,
    pub running: Arc<AtomicBool>,
    /// Rate the capture device actually opened with (Hz).
    pub capture_sample_rate: u32,
    /// Samples per outbound frame at the wire rate.
    pub frame_samples: usize,
    pub activity_tx: broadcast::Sender<AudioActivityEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<UplinkDiagnostics>,
}

/// Run the pump until `ctx.running` goes false.
pub fn run(mut ctx: UplinkContext) {
    info!(
        capture_rate = ctx.capture_sample_rate,
        wire_rate = codec::INPUT_SAMPLE_RATE,
        frame_samples = ctx.frame_samples,
        "uplink pump started"
    );

    let mut converter = match RateConverter::new(
        ctx.capture_sample_rate,
        codec::INPUT_SAMPLE_RATE,
        DRAIN_CHUNK,
    ) {
        Ok(converter) => converter,
        Err(e) => {
            error!("failed to create uplink resampler: {e}");
            return;
        }
    };

    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut frame_buf: Vec<f32> = Vec::with_capacity(ctx.frame_samples * 2);

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        let drained = ctx.consumer.pop_slice(&mut raw);
        if drained == 0 {
            std::thread::sleep(Duration::from_millis(EMPTY_SLEEP_MS));
            continue;
        }
        ctx.diagnostics
            .samples_in
            .fetch_add(drained, Ordering::Relaxed);

        converter.push(&raw[..drained], &mut frame_buf);

        while frame_buf.len() >= ctx.frame_samples {
            let frame: Vec<f32> = frame_buf.drain(..ctx.frame_samples).collect();
            emit_activity(&ctx, &frame);

            let chunk = codec::encode_frame(&frame);
            ctx.diagnostics
                .frames_encoded
                .fetch_add(1, Ordering::Relaxed);

            match ctx.transport.try_send_audio(chunk) {
                SendOutcome::Sent => {
                    ctx.diagnostics.chunks_sent.fetch_add(1, Ordering::Relaxed);
                }
                SendOutcome::NotOpen => {
                    ctx.diagnostics
                        .chunks_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    debug!("transport not open; discarded capture frame");
                }
                SendOutcome::Dropped => {
                    ctx.diagnostics
                        .chunks_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    debug!("send queue full; discarded capture frame");
                }
            }
        }
    }

    info!("uplink pump stopped");
}

fn emit_activity(ctx: &UplinkContext, frame: &[f32]) {
    let event = AudioActivityEvent {
        seq: ctx.seq.fetch_add(1, Ordering::Relaxed),
        rms: compute_rms(frame),
    };
    let _ = ctx.activity_tx.send(event);
}

fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{create_capture_ring, Producer};
    use crate::protocol::ClientMessage;
    use crate::transport::TransportHandle;
    use std::thread;
    use std::time::Instant;
    use tokio::sync::mpsc;

    const FRAME: usize = 4096;

    struct Pump {
        producer: crate::audio::CaptureProducer,
        handle: TransportHandle,
        outbound: mpsc::Receiver<ClientMessage>,
        running: Arc<AtomicBool>,
        diagnostics: Arc<UplinkDiagnostics>,
        thread: Option<thread::JoinHandle<()>>,
    }

    fn start_pump() -> Pump {
        let (producer, consumer) = create_capture_ring();
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let (close_tx, _close_rx) = mpsc::channel(1);
        let handle = TransportHandle::new(
            outbound_tx,
            close_tx,
            Arc::new(AtomicBool::new(false)),
        );
        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(UplinkDiagnostics::default());
        let (activity_tx, _) = broadcast::channel(64);

        let ctx = UplinkContext {
            consumer,
            transport: handle.clone(),
            running: Arc::clone(&running),
            capture_sample_rate: codec::INPUT_SAMPLE_RATE,
            frame_samples: FRAME,
            activity_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::clone(&diagnostics),
        };

        let thread = thread::spawn(move || run(ctx));

        Pump {
            producer,
            handle,
            outbound: outbound_rx,
            running,
            diagnostics,
            thread: Some(thread),
        }
    }

    fn wait_until(deadline_ms: u64, mut probe: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if probe() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    impl Drop for Pump {
        fn drop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(t) = self.thread.take() {
                let _ = t.join();
            }
        }
    }

    #[test]
    fn frames_before_transport_open_are_dropped_not_buffered() {
        let mut pump = start_pump();

        // Three full frames while setup is unacknowledged.
        for _ in 0..3 {
            pump.producer.push_slice(&vec![0.1f32; FRAME]);
        }
        assert!(
            wait_until(2_000, || pump.diagnostics.snapshot().chunks_dropped >= 3),
            "pre-open frames were not dropped"
        );
        assert_eq!(pump.diagnostics.snapshot().chunks_sent, 0);
        assert!(pump.outbound.try_recv().is_err());

        // Once open, the next frame goes out exactly once.
        pump.handle.mark_open();
        pump.producer.push_slice(&vec![0.1f32; FRAME]);
        assert!(
            wait_until(2_000, || pump.diagnostics.snapshot().chunks_sent == 1),
            "post-open frame was not sent"
        );
        assert!(matches!(
            pump.outbound.try_recv().unwrap(),
            ClientMessage::RealtimeInput(_)
        ));
        assert!(pump.outbound.try_recv().is_err(), "frame sent more than once");
    }

    #[test]
    fn partial_frames_wait_for_a_full_quantum() {
        let mut pump = start_pump();
        pump.handle.mark_open();

        pump.producer.push_slice(&vec![0.1f32; FRAME / 2]);
        assert!(
            wait_until(500, || pump.diagnostics.snapshot().samples_in >= FRAME / 2),
            "samples not drained"
        );
        assert_eq!(pump.diagnostics.snapshot().frames_encoded, 0);

        pump.producer.push_slice(&vec![0.1f32; FRAME / 2]);
        assert!(
            wait_until(2_000, || pump.diagnostics.snapshot().chunks_sent == 1),
            "completed frame was not sent"
        );
        assert!(pump.outbound.try_recv().is_ok());
    }

    #[test]
    fn rms_of_constant_signal() {
        assert!((compute_rms(&[0.5; 256]) - 0.5).abs() < 1e-6);
        assert_eq!(compute_rms(&[]), 0.0);
    }
}
