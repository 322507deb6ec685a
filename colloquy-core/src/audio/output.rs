//! Speaker output stream, driven by the playback renderer.
//!
//! The stream is opened at the protocol's 24 kHz output rate so renderer
//! frames map 1:1 onto device frames and the schedule cursor needs no rate
//! conversion. Mono is preferred; if the device only opens multi-channel at
//! that rate, the mono render is duplicated across its channels.

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

#[cfg(feature = "audio-cpal")]
use crate::codec::OUTPUT_SAMPLE_RATE;
#[cfg(feature = "audio-cpal")]
use crate::error::ColloquyError;
use crate::error::Result;
use crate::playback::renderer::Renderer;

/// Handle to an active speaker stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct AudioOutput {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    running: Arc<AtomicBool>,
    /// Channel count the device actually opened with.
    pub channels: u16,
}

impl AudioOutput {
    /// Open an output device by preferred name, falling back to the system
    /// default and then the first available device.
    ///
    /// The renderer moves into the stream callback and is dropped with it.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        renderer: Renderer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let mut selected = None;
        if let Some(preferred) = preferred_device_name {
            match host.output_devices() {
                Ok(mut devices) => {
                    selected =
                        devices.find(|d| d.name().map(|n| n == preferred).unwrap_or(false));
                    if selected.is_none() {
                        warn!("preferred output device '{preferred}' not found, falling back");
                    }
                }
                Err(e) => warn!("failed to list output devices while resolving preference: {e}"),
            }
        }

        let device = match selected.or_else(|| host.default_output_device()) {
            Some(device) => device,
            None => {
                let mut devices = host
                    .output_devices()
                    .map_err(|e| ColloquyError::AudioDevice(e.to_string()))?;
                let fallback = devices.next().ok_or(ColloquyError::NoDefaultOutputDevice)?;
                warn!("no default output device, using first available output");
                fallback
            }
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening playback device"
        );

        let (sample_format, channels) = pick_output_layout(&device)?;
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(OUTPUT_SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        info!(channels, rate = OUTPUT_SAMPLE_RATE, "playback config selected");

        let stream = match sample_format {
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&device, &config, renderer, Arc::clone(&running))
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &config, renderer, Arc::clone(&running))
            }
            format => {
                return Err(ColloquyError::AudioStream(format!(
                    "unsupported playback sample format: {format:?}"
                )))
            }
        }
        .map_err(|e| ColloquyError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ColloquyError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            channels,
        })
    }

    /// Open the system default output device.
    ///
    /// Must be called from the thread that will also drop this value; in
    /// practice that means inside `tokio::task::spawn_blocking`.
    #[cfg(feature = "audio-cpal")]
    pub fn open_default(renderer: Renderer, running: Arc<AtomicBool>) -> Result<Self> {
        Self::open_with_preference(renderer, running, None)
    }

    /// Stop: the callback renders silence from its next invocation on.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Find a supported (format, channel count) pair that opens at 24 kHz.
/// Mono f32 first, then mono i16, then the narrowest multi-channel layout.
#[cfg(feature = "audio-cpal")]
fn pick_output_layout(device: &cpal::Device) -> Result<(cpal::SampleFormat, u16)> {
    let ranges = device
        .supported_output_configs()
        .map_err(|e| ColloquyError::AudioDevice(e.to_string()))?;

    let mut best: Option<(cpal::SampleFormat, u16)> = None;
    for range in ranges {
        let format = range.sample_format();
        if !matches!(format, cpal::SampleFormat::F32 | cpal::SampleFormat::I16) {
            continue;
        }
        if range.min_sample_rate().0 > OUTPUT_SAMPLE_RATE
            || range.max_sample_rate().0 < OUTPUT_SAMPLE_RATE
        {
            continue;
        }

        let candidate = (format, range.channels());
        best = match best {
            None => Some(candidate),
            Some(current) => Some(prefer_layout(current, candidate)),
        };
    }

    best.ok_or_else(|| {
        ColloquyError::AudioStream(format!(
            "output device does not support {OUTPUT_SAMPLE_RATE} Hz playback"
        ))
    })
}

#[cfg(feature = "audio-cpal")]
fn prefer_layout(
    current: (cpal::SampleFormat, u16),
    candidate: (cpal::SampleFormat, u16),
) -> (cpal::SampleFormat, u16) {
    // Fewer channels wins; f32 breaks ties.
    if candidate.1 < current.1 {
        return candidate;
    }
    if candidate.1 == current.1 && candidate.0 == cpal::SampleFormat::F32 {
        return candidate;
    }
    current
}

/// Build one output stream for a concrete device sample type, duplicating the
/// mono render across the device's channels.
#[cfg(feature = "audio-cpal")]
fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut renderer: Renderer,
    running: Arc<AtomicBool>,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    use cpal::FromSample;

    let channel_count = config.channels as usize;
    let mut mono: Vec<f32> = Vec::new();

    device.build_output_stream(
        config,
        move |data: &mut [T], _info| {
            let frames = data.len() / channel_count;
            mono.resize(frames, 0.0);

            if running.load(Ordering::Relaxed) {
                renderer.render(&mut mono[..frames]);
            } else {
                mono[..frames].fill(0.0);
            }

            for frame in 0..frames {
                let value = T::from_sample(mono[frame]);
                let base = frame * channel_count;
                for ch in 0..channel_count {
                    data[base + ch] = value;
                }
            }
        },
        |err| error!("output stream error: {err}"),
        None,
    )
}

/// Stubs when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioOutput {
    pub fn open_with_preference(
        _renderer: Renderer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(crate::error::ColloquyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn open_default(renderer: Renderer, running: Arc<AtomicBool>) -> Result<Self> {
        Self::open_with_preference(renderer, running, None)
    }
}
