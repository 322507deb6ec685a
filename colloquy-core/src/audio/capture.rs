//! Microphone capture stream.

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::mpsc::UnboundedSender;
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

use crate::audio::CaptureProducer;
#[cfg(feature = "audio-cpal")]
use crate::audio::Producer;
#[cfg(feature = "audio-cpal")]
use crate::error::ColloquyError;
use crate::error::Result;

/// Handle to an active microphone stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

impl AudioCapture {
    /// Open an input device by preferred name, falling back to the system
    /// default and then the first available device.
    ///
    /// The callback mixes whatever the device delivers down to mono f32 and
    /// pushes it into `producer`. A stream fault after open (device unplug,
    /// permission revoked) is reported once through `fault_tx`; the session
    /// treats that as a lost capture device.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        producer: CaptureProducer,
        running: Arc<AtomicBool>,
        fault_tx: UnboundedSender<String>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let mut selected = None;
        if let Some(preferred) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected =
                        devices.find(|d| d.name().map(|n| n == preferred).unwrap_or(false));
                    if selected.is_none() {
                        warn!("preferred input device '{preferred}' not found, falling back");
                    }
                }
                Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
            }
        }

        let device = match selected.or_else(|| host.default_input_device()) {
            Some(device) => device,
            None => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| ColloquyError::AudioDevice(e.to_string()))?;
                let fallback = devices.next().ok_or(ColloquyError::NoDefaultInputDevice)?;
                warn!("no default input device, using first available input");
                fallback
            }
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening capture device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| ColloquyError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();

        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&device, &config, producer, Arc::clone(&running), fault_tx)
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &config, producer, Arc::clone(&running), fault_tx)
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&device, &config, producer, Arc::clone(&running), fault_tx)
            }
            format => {
                return Err(ColloquyError::AudioStream(format!(
                    "unsupported capture sample format: {format:?}"
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
            sample_rate,
        })
    }

    /// Open the system default microphone.
    ///
    /// Must be called from the thread that will also drop this value; in
    /// practice that means inside `tokio::task::spawn_blocking`.
    #[cfg(feature = "audio-cpal")]
    pub fn open_default(
        producer: CaptureProducer,
        running: Arc<AtomicBool>,
        fault_tx: UnboundedSender<String>,
    ) -> Result<Self> {
        Self::open_with_preference(producer, running, fault_tx, None)
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Build one input stream for a concrete device sample type, mixing down to
/// mono f32 in the callback.
#[cfg(feature = "audio-cpal")]
fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: CaptureProducer,
    running: Arc<AtomicBool>,
    fault_tx: UnboundedSender<String>,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    use cpal::FromSample;

    let channel_count = config.channels as usize;
    let mut mix_buf: Vec<f32> = Vec::new();

    device.build_input_stream(
        config,
        move |data: &[T], _info| {
            if !running.load(Ordering::Relaxed) {
                return;
            }

            let frames = data.len() / channel_count;
            mix_buf.resize(frames, 0.0);
            for frame in 0..frames {
                let base = frame * channel_count;
                let mut sum = 0f32;
                for ch in 0..channel_count {
                    sum += f32::from_sample(data[base + ch]);
                }
                mix_buf[frame] = sum / channel_count as f32;
            }

            let written = producer.push_slice(&mix_buf[..frames]);
            if written < frames {
                warn!("capture ring full: dropped {} frames", frames - written);
            }
        },
        move |err| {
            error!("capture stream error: {err}");
            let _ = fault_tx.send(err.to_string());
        },
        None,
    )
}

/// Stubs when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _producer: CaptureProducer,
        _running: Arc<AtomicBool>,
        _fault_tx: UnboundedSender<String>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(crate::error::ColloquyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn open_default(
        producer: CaptureProducer,
        running: Arc<AtomicBool>,
        fault_tx: UnboundedSender<String>,
    ) -> Result<Self> {
        Self::open_with_preference(producer, running, fault_tx, None)
    }
}
