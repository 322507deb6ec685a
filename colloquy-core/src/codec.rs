//! PCM conversions between capture floats, signed-16 wire bytes, and the
//! base64 text encoding carried on the duplex channel.
//!
//! ## Wire format
//!
//! Audio payloads are raw PCM, signed 16-bit little-endian, mono. Microphone
//! audio goes out at 16 kHz; agent speech comes back at 24 kHz. The transport
//! is text-based, so raw bytes are base64-encoded (standard alphabet) and
//! tagged with a mime string.
//!
//! Everything in this module is pure. Per-chunk decode failures are for the
//! caller to drop and report — they must never tear down a session.

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ColloquyError, Result};

/// Nominal microphone sample rate fixed by the protocol (Hz).
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Nominal agent-speech sample rate fixed by the protocol (Hz).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Mime tag attached to every outbound microphone chunk.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// A text-safe audio chunk as carried on the wire, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedChunk {
    /// Base64 of raw PCM16 little-endian samples.
    pub data: String,
    /// Declared payload type, e.g. `audio/pcm;rate=16000`.
    pub mime_type: String,
}

/// A decoded block of agent speech, ready for the playback timeline.
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (24 000 on this protocol).
    pub sample_rate: u32,
}

impl PlaybackUnit {
    /// Playback duration of this unit in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Quantize one captured frame of f32 samples to PCM16 and wrap it for the
/// wire.
///
/// Samples are clamped to [-1, 1] before scaling by 32767; the cast truncates
/// toward zero. Non-finite input saturates (+∞ → 1.0, −∞ → −1.0, NaN → 0) and
/// is never propagated.
pub fn encode_frame(samples: &[f32]) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
        let quantized = (clamped * 32767.0) as i16;
        bytes.extend_from_slice(&quantized.to_le_bytes());
    }

    EncodedChunk {
        data: BASE64_STANDARD.encode(&bytes),
        mime_type: INPUT_MIME_TYPE.to_string(),
    }
}

/// Recover the raw PCM bytes from a wire chunk.
///
/// # Errors
/// `ColloquyError::MalformedEncoding` when the payload is not valid base64
/// (wrong alphabet or padding).
pub fn decode_chunk(chunk: &EncodedChunk) -> Result<Vec<u8>> {
    BASE64_STANDARD
        .decode(chunk.data.as_bytes())
        .map_err(|e| ColloquyError::MalformedEncoding(e.to_string()))
}

/// Reconstruct normalized float samples from raw PCM16 little-endian bytes.
///
/// Multi-channel input is averaged down to mono, the same mixdown the capture
/// path applies.
///
/// # Errors
/// `ColloquyError::InvalidSampleLength` unless the byte length is a multiple
/// of `2 * channels`.
pub fn bytes_to_playback_unit(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<PlaybackUnit> {
    let channels = channels.max(1) as usize;
    let stride = 2 * channels;
    if bytes.len() % stride != 0 {
        return Err(ColloquyError::InvalidSampleLength {
            len: bytes.len(),
            stride,
        });
    }

    let frames = bytes.len() / stride;
    let mut samples = Vec::with_capacity(frames);
    for frame in bytes.chunks_exact(stride) {
        let mut sum = 0f32;
        for pair in frame.chunks_exact(2) {
            sum += i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
        }
        samples.push(sum / channels as f32);
    }

    Ok(PlaybackUnit {
        samples,
        sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Per-sample round-trip error bound: one LSB of truncation plus the
    /// 32767-encode / 32768-decode scale mismatch.
    const QUANT_EPS: f32 = 2.0 / 32768.0;

    fn round_trip(samples: &[f32]) -> Vec<f32> {
        let chunk = encode_frame(samples);
        let bytes = decode_chunk(&chunk).expect("decode");
        bytes_to_playback_unit(&bytes, INPUT_SAMPLE_RATE, 1)
            .expect("reconstruct")
            .samples
    }

    #[test]
    fn round_trip_within_quantization_error() {
        let samples: Vec<f32> = (0..1024)
            .map(|i| ((i as f32) * 0.013).sin() * 0.8)
            .collect();

        let recovered = round_trip(&samples);
        assert_eq!(recovered.len(), samples.len());
        for (orig, rec) in samples.iter().zip(&recovered) {
            assert_abs_diff_eq!(orig, rec, epsilon = QUANT_EPS);
        }
    }

    #[test]
    fn out_of_range_samples_clamp_to_full_scale() {
        let recovered = round_trip(&[2.0, -3.5]);
        assert_abs_diff_eq!(recovered[0], 1.0, epsilon = QUANT_EPS);
        assert_abs_diff_eq!(recovered[1], -1.0, epsilon = QUANT_EPS);
    }

    #[test]
    fn non_finite_samples_never_propagate() {
        let recovered = round_trip(&[f32::NAN, f32::INFINITY, f32::NEG_INFINITY]);
        assert!(recovered.iter().all(|s| s.is_finite()));
        assert_abs_diff_eq!(recovered[0], 0.0, epsilon = QUANT_EPS);
        assert_abs_diff_eq!(recovered[1], 1.0, epsilon = QUANT_EPS);
        assert_abs_diff_eq!(recovered[2], -1.0, epsilon = QUANT_EPS);
    }

    #[test]
    fn quantization_truncates_toward_zero() {
        // 0.5 * 32767 = 16383.5 → 16383, not 16384
        let chunk = encode_frame(&[0.5]);
        let bytes = decode_chunk(&chunk).unwrap();
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 16383);
    }

    #[test]
    fn outbound_chunk_carries_wire_mime_type() {
        let chunk = encode_frame(&[0.0; 16]);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn invalid_base64_is_malformed_encoding() {
        let chunk = EncodedChunk {
            data: "not!!valid@@base64".into(),
            mime_type: INPUT_MIME_TYPE.into(),
        };
        assert!(matches!(
            decode_chunk(&chunk),
            Err(ColloquyError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn odd_byte_length_is_rejected() {
        let err = bytes_to_playback_unit(&[0u8; 7], OUTPUT_SAMPLE_RATE, 1).unwrap_err();
        assert!(matches!(
            err,
            ColloquyError::InvalidSampleLength { len: 7, stride: 2 }
        ));
    }

    #[test]
    fn stereo_length_must_be_multiple_of_frame_stride() {
        // 6 bytes is 3 mono samples but only 1.5 stereo frames
        assert!(bytes_to_playback_unit(&[0u8; 6], OUTPUT_SAMPLE_RATE, 2).is_err());
        assert!(bytes_to_playback_unit(&[0u8; 8], OUTPUT_SAMPLE_RATE, 2).is_ok());
    }

    #[test]
    fn stereo_input_mixes_down_to_mono() {
        // L = 16384/32768 = 0.5, R = -16384/32768 = -0.5 → mono 0.0
        let left = 16384i16.to_le_bytes();
        let right = (-16384i16).to_le_bytes();
        let bytes = [left[0], left[1], right[0], right[1]];

        let unit = bytes_to_playback_unit(&bytes, OUTPUT_SAMPLE_RATE, 2).unwrap();
        assert_eq!(unit.samples.len(), 1);
        assert_abs_diff_eq!(unit.samples[0], 0.0, epsilon = QUANT_EPS);
    }

    #[test]
    fn duration_follows_sample_count_and_rate() {
        let bytes = vec![0u8; 24_000 * 2];
        let unit = bytes_to_playback_unit(&bytes, OUTPUT_SAMPLE_RATE, 1).unwrap();
        assert_eq!(unit.samples.len(), 24_000);
        assert!((unit.duration_secs() - 1.0).abs() < 1e-9);
    }
}
