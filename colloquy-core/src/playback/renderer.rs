//! Callback-side playback timeline.
//!
//! The renderer runs inside the audio output callback. Its contract with that
//! context:
//! - no blocking: scheduled units arrive over a crossbeam channel drained with
//!   `try_recv`; barge-in is a single atomic generation read per buffer
//! - strict order: units play exactly in the order they were scheduled, with
//!   silence inserted up to each unit's start frame, never overlapping
//! - the output clock is the count of frames this renderer has produced,
//!   published through an `AtomicU64` for the scheduler to read

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::{Receiver, Sender};

/// One block of agent speech pinned to a start position on the output clock.
#[derive(Debug)]
pub struct ScheduledUnit {
    pub id: u64,
    /// Barge-in generation this unit belongs to. Units from a flushed
    /// generation that are still in flight are discarded on arrival.
    pub generation: u64,
    /// Output-clock frame at which playback should begin. Past-due starts
    /// are clamped to "now".
    pub start_frame: u64,
    /// Mono samples at the output stream rate.
    pub samples: Vec<f32>,
}

/// Everything the renderer shares with the scheduler.
pub struct RendererEndpoints {
    pub commands: Receiver<ScheduledUnit>,
    pub finished: Sender<u64>,
    pub clock_frames: Arc<AtomicU64>,
    pub generation: Arc<AtomicU64>,
}

pub struct Renderer {
    commands: Receiver<ScheduledUnit>,
    finished: Sender<u64>,
    clock_frames: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
    local_generation: u64,
    queue: VecDeque<ScheduledUnit>,
    /// Unit currently playing, with its read offset.
    current: Option<(ScheduledUnit, usize)>,
    /// Frames produced so far; mirrored into `clock_frames` after each buffer.
    clock: u64,
}

impl Renderer {
    pub fn new(endpoints: RendererEndpoints) -> Self {
        let local_generation = endpoints.generation.load(Ordering::Acquire);
        Self {
            commands: endpoints.commands,
            finished: endpoints.finished,
            clock_frames: endpoints.clock_frames,
            generation: endpoints.generation,
            local_generation,
            queue: VecDeque::new(),
            current: None,
            clock: 0,
        }
    }

    /// Fill one buffer of mono output frames and advance the clock.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);

        // Barge-in check: everything scheduled stops within this buffer.
        let generation = self.generation.load(Ordering::Acquire);
        if generation != self.local_generation {
            self.local_generation = generation;
            self.queue.clear();
            self.current = None;
        }

        while let Ok(unit) = self.commands.try_recv() {
            if unit.generation == self.local_generation {
                self.queue.push_back(unit);
            }
        }

        let mut pos = 0usize;
        while pos < out.len() {
            let Some((unit, offset)) = self.current.as_mut() else {
                match self.queue.pop_front() {
                    Some(unit) => {
                        self.current = Some((unit, 0));
                        continue;
                    }
                    None => break,
                }
            };

            let now = self.clock + pos as u64;
            if unit.start_frame > now {
                // Not due yet — leave silence up to the start (or buffer end).
                let gap = (unit.start_frame - now).min((out.len() - pos) as u64);
                pos += gap as usize;
                continue;
            }

            let copy = (unit.samples.len() - *offset).min(out.len() - pos);
            out[pos..pos + copy].copy_from_slice(&unit.samples[*offset..*offset + copy]);
            *offset += copy;
            pos += copy;

            if *offset >= unit.samples.len() {
                let _ = self.finished.send(unit.id);
                self.current = None;
            }
        }

        self.clock += out.len() as u64;
        self.clock_frames.store(self.clock, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    struct Harness {
        renderer: Renderer,
        commands: Sender<ScheduledUnit>,
        finished: Receiver<u64>,
        generation: Arc<AtomicU64>,
        clock_frames: Arc<AtomicU64>,
    }

    fn harness() -> Harness {
        let (command_tx, command_rx) = unbounded();
        let (finished_tx, finished_rx) = unbounded();
        let clock_frames = Arc::new(AtomicU64::new(0));
        let generation = Arc::new(AtomicU64::new(0));

        let renderer = Renderer::new(RendererEndpoints {
            commands: command_rx,
            finished: finished_tx,
            clock_frames: Arc::clone(&clock_frames),
            generation: Arc::clone(&generation),
        });

        Harness {
            renderer,
            commands: command_tx,
            finished: finished_rx,
            generation,
            clock_frames,
        }
    }

    fn unit(id: u64, start_frame: u64, samples: Vec<f32>) -> ScheduledUnit {
        ScheduledUnit {
            id,
            generation: 0,
            start_frame,
            samples,
        }
    }

    #[test]
    fn renders_silence_when_nothing_scheduled() {
        let mut h = harness();
        let mut out = [1.0f32; 64];
        h.renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(h.clock_frames.load(Ordering::Acquire), 64);
    }

    #[test]
    fn plays_units_back_to_back_in_order() {
        let mut h = harness();
        h.commands.send(unit(0, 0, vec![0.1; 32])).unwrap();
        h.commands.send(unit(1, 32, vec![0.2; 32])).unwrap();

        let mut out = [0.0f32; 64];
        h.renderer.render(&mut out);

        assert!(out[..32].iter().all(|&s| s == 0.1));
        assert!(out[32..].iter().all(|&s| s == 0.2));

        let done: Vec<u64> = h.finished.try_iter().collect();
        assert_eq!(done, vec![0, 1]);
    }

    #[test]
    fn inserts_silence_up_to_start_frame() {
        let mut h = harness();
        h.commands.send(unit(0, 16, vec![0.5; 16])).unwrap();

        let mut out = [0.0f32; 48];
        h.renderer.render(&mut out);

        assert!(out[..16].iter().all(|&s| s == 0.0));
        assert!(out[16..32].iter().all(|&s| s == 0.5));
        assert!(out[32..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn past_due_start_clamps_to_now() {
        let mut h = harness();

        // Advance the clock by one empty buffer, then schedule in the past.
        let mut out = [0.0f32; 32];
        h.renderer.render(&mut out);
        h.commands.send(unit(0, 4, vec![0.7; 8])).unwrap();

        h.renderer.render(&mut out);
        assert!(out[..8].iter().all(|&s| s == 0.7));
        assert!(out[8..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn unit_spans_multiple_buffers() {
        let mut h = harness();
        h.commands.send(unit(0, 0, vec![0.3; 48])).unwrap();

        let mut out = [0.0f32; 32];
        h.renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.3));
        assert!(h.finished.try_iter().next().is_none());

        h.renderer.render(&mut out);
        assert!(out[..16].iter().all(|&s| s == 0.3));
        assert!(out[16..].iter().all(|&s| s == 0.0));
        assert_eq!(h.finished.try_iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn generation_bump_stops_everything_within_one_buffer() {
        let mut h = harness();
        h.commands.send(unit(0, 0, vec![0.9; 256])).unwrap();
        h.commands.send(unit(1, 256, vec![0.9; 256])).unwrap();

        let mut out = [0.0f32; 64];
        h.renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.9));

        h.generation.fetch_add(1, Ordering::AcqRel);
        h.renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0), "audio after barge-in");
    }

    #[test]
    fn stale_generation_units_are_discarded_on_arrival() {
        let mut h = harness();
        h.generation.fetch_add(1, Ordering::AcqRel);

        // Scheduled before the flush, delivered after it.
        h.commands.send(unit(0, 0, vec![0.9; 32])).unwrap();

        let mut out = [0.0f32; 32];
        h.renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));

        // Units tagged with the new generation still play.
        h.commands
            .send(ScheduledUnit {
                id: 1,
                generation: 1,
                start_frame: 32,
                samples: vec![0.4; 32],
            })
            .unwrap();
        h.renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.4));
    }
}
