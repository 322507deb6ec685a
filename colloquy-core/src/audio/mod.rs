//! Device audio I/O via the cpal backend.
//!
//! # Real-time callback constraints
//!
//! Both the capture and the output callback run on OS audio threads at
//! elevated priority. They **must not**:
//! - Allocate heap memory on the steady-state path
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! The capture callback writes into an SPSC ring producer whose `push_slice`
//! is lock-free; the output callback drains a crossbeam channel with
//! `try_recv` and reads two atomics. Everything heavier happens on the uplink
//! pump thread or the session task.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` and `AudioOutput` must each be created and dropped
//! on the same thread; the session does this inside `spawn_blocking`.

pub mod capture;
pub mod device;
pub mod output;
pub mod resample;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half of the capture ring — held by the audio callback.
pub type CaptureProducer = ringbuf::HeapProd<f32>;

/// Consumer half of the capture ring — held by the uplink pump.
pub type CaptureConsumer = ringbuf::HeapCons<f32>;

/// Capture ring capacity: 2^16 = 65 536 f32 samples ≈ 1.4 s at 48 kHz.
/// Generous enough to ride out pump hiccups; anything the pump cannot drain
/// in that window is dropped at the callback, which is the latency-preserving
/// choice for a live conversation.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 16;

/// Create a matched producer/consumer pair for microphone samples.
pub fn create_capture_ring() -> (CaptureProducer, CaptureConsumer) {
    HeapRb::<f32>::new(CAPTURE_RING_CAPACITY).split()
}
