//! Streaming sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Capture devices run at their native rate (commonly 44.1 or 48 kHz); the
//! wire wants 16 kHz mono. `RateConverter` bridges that gap on the uplink
//! pump thread, where allocation is allowed.
//!
//! When the rates already match the converter is a pure passthrough and no
//! rubato session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{ColloquyError, Result};

/// Converts mono f32 audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Input samples waiting for a full block.
    pending: Vec<f32>,
    /// Input frame count rubato expects per process call.
    block_frames: usize,
    /// Pre-allocated rubato output buffer: `[1][output_frames_max]`.
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a converter from `source_rate` to `target_rate` Hz, fed in
    /// blocks of `block_frames` input samples.
    ///
    /// # Errors
    /// `ColloquyError::AudioStream` if rubato rejects the configuration.
    pub fn new(source_rate: u32, target_rate: u32, block_frames: usize) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                block_frames,
                scratch: Vec::new(),
            });
        }

        let ratio = target_rate as f64 / source_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio, no dynamic adjustment
            PolynomialDegree::Cubic,
            block_frames,
            1, // mono
        )
        .map_err(|e| ColloquyError::AudioStream(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        tracing::info!(source_rate, target_rate, block_frames, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            block_frames,
            scratch: vec![vec![0f32; max_out]],
        })
    }

    /// Feed input samples, appending any converted output to `out`.
    ///
    /// Input is held internally until a full block is available; a partial
    /// block produces nothing and is carried into the next call. In
    /// passthrough mode the input is appended unchanged.
    pub fn push(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let Some(ref mut resampler) = self.resampler else {
            out.extend_from_slice(input);
            return;
        };

        self.pending.extend_from_slice(input);

        while self.pending.len() >= self.block_frames {
            let block = &self.pending[..self.block_frames];
            match resampler.process_into_buffer(&[block], &mut self.scratch, None) {
                Ok((_consumed, produced)) => {
                    out.extend_from_slice(&self.scratch[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.pending.drain(..self.block_frames);
        }
    }

    /// Returns `true` when no rate conversion happens.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).unwrap();
        assert!(rc.is_passthrough());

        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        let mut out = Vec::new();
        rc.push(&samples, &mut out);
        assert_eq!(out, samples);
    }

    #[test]
    fn downsamples_48k_to_16k_by_a_third() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(!rc.is_passthrough());

        let mut out = Vec::new();
        rc.push(&vec![0.0f32; 960], &mut out);
        assert!(!out.is_empty());
        // 960 input frames at 48 kHz ≈ 320 at 16 kHz
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn partial_block_is_held_back() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        let mut out = Vec::new();
        rc.push(&vec![0.0f32; 500], &mut out);
        assert!(out.is_empty(), "partial block produced {} samples", out.len());
    }

    #[test]
    fn partial_blocks_accumulate_across_pushes() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        let mut out = Vec::new();
        rc.push(&vec![0.0f32; 500], &mut out);
        assert!(out.is_empty());
        rc.push(&vec![0.0f32; 500], &mut out);
        assert!(!out.is_empty(), "second push should complete the block");
    }
}
