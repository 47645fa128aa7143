//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Microphones typically run at 44.1 or 48 kHz while the agent wants
//! 16 kHz; the loopback agent in the host app goes the other way, 16 kHz to
//! 24 kHz. `RateConverter` covers both on a non-RT thread, where allocation
//! is allowed.
//!
//! When the two rates match no rubato session is created and input is
//! returned as-is.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{ParleyError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Input carried over until a full `chunk_size` block is available.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// `[1][output_frames_max]`, reused across calls.
    output_buf: Vec<Vec<f32>>,
    from_rate: u32,
    to_rate: u32,
}

impl RateConverter {
    /// Create a converter taking `chunk_size` input frames per rubato call.
    ///
    /// # Errors
    /// `ParleyError::AudioDevice` if rubato rejects the parameters.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                from_rate,
                to_rate,
            });
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| ParleyError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        info!(from_rate, to_rate, chunk_size, max_out, "resampler ready");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; 1],
            from_rate,
            to_rate,
        })
    }

    /// Feed samples, returning whatever converted output is ready (may be empty).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let block = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[block], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }
        result
    }

    /// Drop any carried-over input, e.g. after a stream restart.
    pub fn reset(&mut self) {
        self.input_buf.clear();
        if let Some(ref mut resampler) = self.resampler {
            resampler.reset();
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn rates(&self) -> (u32, u32) {
        (self.from_rate, self.to_rate)
    }
}
