//! Playback scheduling for inbound agent speech.
//!
//! ## Split of responsibilities
//!
//! ```text
//! protocol events ─► PlaybackScheduler ──ScheduledUnit──► Renderer ─► device
//!                    (session task)       crossbeam         (output callback)
//! ```
//!
//! The scheduler is the single writer of the schedule cursor and the active
//! source set; it only ever runs on the context that receives protocol
//! messages. The renderer owns the frames it plays and publishes the output
//! clock. The two sides share nothing but a lock-free channel pair and two
//! atomics.
//!
//! ## Invariants
//!
//! - `next_start` never moves backwards except across a barge-in reset, and
//!   `next_start ≥ clock` holds at every scheduling step
//! - units are scheduled in exact chunk-arrival order and never merged
//! - barge-in stops every scheduled-or-playing unit within one output buffer
//!   and resets the cursor to the *current clock reading*, not to zero —
//!   a zero reset would leave the cursor pointing at a stale origin and is
//!   treated as a bug here
//! - a chunk that fails to decode is dropped and counted, never fatal

pub mod renderer;

use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::codec::{self, EncodedChunk, PlaybackUnit};
use renderer::{RendererEndpoints, ScheduledUnit};

/// Downlink counters for observability. Cheap relaxed atomics, snapshot on
/// demand.
#[derive(Default)]
pub struct DownlinkDiagnostics {
    pub chunks_in: AtomicUsize,
    pub chunks_dropped: AtomicUsize,
    pub units_scheduled: AtomicUsize,
    pub interruptions: AtomicUsize,
}

impl DownlinkDiagnostics {
    pub fn snapshot(&self) -> DownlinkSnapshot {
        DownlinkSnapshot {
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            units_scheduled: self.units_scheduled.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DownlinkSnapshot {
    pub chunks_in: usize,
    pub chunks_dropped: usize,
    pub units_scheduled: usize,
    pub interruptions: usize,
}

/// Orders inbound speech onto the output timeline, gaplessly and cancellably.
pub struct PlaybackScheduler {
    units: Sender<ScheduledUnit>,
    finished: Receiver<u64>,
    clock_frames: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
    sample_rate: u32,
    /// Position on the output clock (seconds) where the next unit begins.
    next_start: f64,
    next_unit_id: u64,
    /// Ids of units scheduled or playing right now.
    active: HashSet<u64>,
    diagnostics: Arc<DownlinkDiagnostics>,
}

impl PlaybackScheduler {
    /// Create a scheduler and the endpoints its renderer consumes.
    pub fn new(
        sample_rate: u32,
        diagnostics: Arc<DownlinkDiagnostics>,
    ) -> (Self, RendererEndpoints) {
        let (unit_tx, unit_rx) = unbounded();
        let (finished_tx, finished_rx) = unbounded();
        let clock_frames = Arc::new(AtomicU64::new(0));
        let generation = Arc::new(AtomicU64::new(0));

        let endpoints = RendererEndpoints {
            commands: unit_rx,
            finished: finished_tx,
            clock_frames: Arc::clone(&clock_frames),
            generation: Arc::clone(&generation),
        };

        let scheduler = Self {
            units: unit_tx,
            finished: finished_rx,
            clock_frames,
            generation,
            sample_rate,
            next_start: 0.0,
            next_unit_id: 0,
            active: HashSet::new(),
            diagnostics,
        };

        (scheduler, endpoints)
    }

    /// Decode one inbound chunk and schedule it after everything already
    /// queued. Decode failures drop the chunk and continue.
    pub fn enqueue_chunk(&mut self, chunk: &EncodedChunk) {
        self.diagnostics.chunks_in.fetch_add(1, Ordering::Relaxed);

        let bytes = match codec::decode_chunk(chunk) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("dropping undecodable audio chunk: {e}");
                self.diagnostics.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let unit = match codec::bytes_to_playback_unit(&bytes, codec::OUTPUT_SAMPLE_RATE, 1) {
            Ok(unit) => unit,
            Err(e) => {
                warn!("dropping unreadable audio chunk: {e}");
                self.diagnostics.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        self.schedule(unit);
    }

    /// Place a decoded unit on the timeline at
    /// `max(next_start, current clock)` and advance the cursor by its
    /// duration.
    pub fn schedule(&mut self, unit: PlaybackUnit) {
        self.reap_finished();

        let now = self.clock_secs();
        let start = if self.next_start > now {
            self.next_start
        } else {
            now
        };
        let duration = unit.duration_secs();

        let id = self.next_unit_id;
        self.next_unit_id += 1;

        let scheduled = ScheduledUnit {
            id,
            generation: self.generation.load(Ordering::Acquire),
            start_frame: (start * self.sample_rate as f64).round() as u64,
            samples: unit.samples,
        };

        if self.units.send(scheduled).is_err() {
            debug!("renderer endpoints dropped; discarding scheduled unit");
            return;
        }

        self.active.insert(id);
        self.next_start = start + duration;
        self.diagnostics
            .units_scheduled
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Barge-in: stop every scheduled-or-playing unit and restart the
    /// timeline at the current clock reading.
    pub fn interrupt(&mut self) {
        self.flush();
        self.diagnostics.interruptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop and clear everything without counting a barge-in (teardown path).
    pub fn flush(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.active.clear();
        self.next_start = self.clock_secs();
    }

    /// Drop finished-unit notifications out of the active set. Removal of an
    /// id that was already reaped (or flushed) is a no-op.
    fn reap_finished(&mut self) {
        while let Ok(id) = self.finished.try_recv() {
            self.active.remove(&id);
        }
    }

    /// Number of units currently scheduled or playing.
    pub fn active_units(&mut self) -> usize {
        self.reap_finished();
        self.active.len()
    }

    /// Current output-clock position in seconds.
    pub fn clock_secs(&self) -> f64 {
        self.clock_frames.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    /// Timeline position where the next unit will begin (seconds).
    pub fn next_start_secs(&self) -> f64 {
        self.next_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, OUTPUT_SAMPLE_RATE};

    fn scheduler() -> (PlaybackScheduler, RendererEndpoints) {
        PlaybackScheduler::new(OUTPUT_SAMPLE_RATE, Arc::new(DownlinkDiagnostics::default()))
    }

    fn unit_of(samples: usize) -> PlaybackUnit {
        PlaybackUnit {
            samples: vec![0.1; samples],
            sample_rate: OUTPUT_SAMPLE_RATE,
        }
    }

    #[test]
    fn cursor_advances_by_exact_durations() {
        let (mut s, _ep) = scheduler();

        // 2400 samples at 24 kHz = 100 ms each
        for _ in 0..3 {
            s.schedule(unit_of(2400));
        }

        assert!((s.next_start_secs() - 0.3).abs() < 1e-9);
        assert_eq!(s.active_units(), 3);
    }

    #[test]
    fn start_times_never_overlap_or_decrease() {
        let (mut s, ep) = scheduler();

        let mut starts = Vec::new();
        for i in 0..5 {
            s.schedule(unit_of(1200 + i * 240));
            starts.push(s.next_start_secs());
        }
        // next_start after unit i is unit i's start + duration, so strictly
        // increasing values prove no overlap.
        for pair in starts.windows(2) {
            assert!(pair[1] > pair[0]);
        }

        // Scheduled frames arrive in id order on the renderer channel.
        let frames: Vec<u64> = ep.commands.try_iter().map(|u| u.start_frame).collect();
        for pair in frames.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn cursor_clamps_to_clock_when_behind() {
        let (mut s, ep) = scheduler();

        // Simulate 2 s of rendered output with nothing scheduled.
        ep.clock_frames
            .store(2 * OUTPUT_SAMPLE_RATE as u64, Ordering::Release);

        s.schedule(unit_of(2400));
        let scheduled = ep.commands.try_recv().unwrap();
        assert_eq!(scheduled.start_frame, 2 * OUTPUT_SAMPLE_RATE as u64);
        assert!((s.next_start_secs() - 2.1).abs() < 1e-9);
    }

    #[test]
    fn interrupt_clears_active_set_and_resets_cursor_to_clock() {
        let (mut s, ep) = scheduler();

        for _ in 0..4 {
            s.schedule(unit_of(4800));
        }
        assert_eq!(s.active_units(), 4);
        assert!(s.next_start_secs() > 0.5);

        ep.clock_frames
            .store(OUTPUT_SAMPLE_RATE as u64 / 4, Ordering::Release);
        s.interrupt();

        assert_eq!(s.active_units(), 0);
        // Reset to the clock reading (0.25 s), not to zero.
        assert!((s.next_start_secs() - 0.25).abs() < 1e-9);
        assert_eq!(ep.generation.load(Ordering::Acquire), 1);
    }

    #[test]
    fn units_scheduled_after_interrupt_play_immediately() {
        let (mut s, ep) = scheduler();
        s.schedule(unit_of(24_000));
        ep.clock_frames.store(1200, Ordering::Release);
        s.interrupt();

        s.schedule(unit_of(2400));
        let scheduled: Vec<_> = ep.commands.try_iter().collect();
        let last = scheduled.last().unwrap();
        assert_eq!(last.start_frame, 1200);
        assert_eq!(last.generation, 1);
    }

    #[test]
    fn natural_completion_is_removed_idempotently() {
        let (mut s, ep) = scheduler();
        s.schedule(unit_of(240));
        let id = ep.commands.try_recv().unwrap().id;

        ep.finished.send(id).unwrap();
        ep.finished.send(id).unwrap();
        assert_eq!(s.active_units(), 0);
    }

    #[test]
    fn undecodable_chunk_is_dropped_not_fatal() {
        let diagnostics = Arc::new(DownlinkDiagnostics::default());
        let (mut s, _ep) =
            PlaybackScheduler::new(OUTPUT_SAMPLE_RATE, Arc::clone(&diagnostics));

        let bad = EncodedChunk {
            data: "@@@not-base64@@@".into(),
            mime_type: "audio/pcm;rate=24000".into(),
        };
        s.enqueue_chunk(&bad);

        // Odd byte count after decode: "AAAA" is 3 bytes.
        let odd = EncodedChunk {
            data: "AAAA".into(),
            mime_type: "audio/pcm;rate=24000".into(),
        };
        s.enqueue_chunk(&odd);

        let good = encode_frame(&[0.0; 480]);
        s.enqueue_chunk(&good);

        let snap = diagnostics.snapshot();
        assert_eq!(snap.chunks_in, 3);
        assert_eq!(snap.chunks_dropped, 2);
        assert_eq!(snap.units_scheduled, 1);
        assert_eq!(s.active_units(), 1);
    }
}
