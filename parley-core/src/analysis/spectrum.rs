//! Byte-range magnitude spectrum of the playback signal.
//!
//! Mirrors the classic browser analyser node: the last `fft_size` rendered
//! samples are Blackman-windowed, transformed, smoothed over time and mapped
//! from decibels onto 0..=255.
//!
//! ```text
//! tap ring ─drain─► history[fft_size] ─window─► FFT ─|X|/N─► smooth(τ)
//!                                                        └─► dB ─► [u8; fft_size/2]
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::buffering::{Consumer, TapConsumer};

/// Samples pulled from the tap per `pop_slice` call.
const DRAIN_BLOCK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyserConfig {
    /// Transform length. Must be a power of two; yields `fft_size / 2` bins.
    pub fft_size: usize,
    /// Weight of the previous magnitude in the temporal average, in [0, 1).
    pub smoothing: f32,
    /// Level mapped to byte 0.
    pub min_db: f32,
    /// Level mapped to byte 255.
    pub max_db: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            fft_size: 512,
            smoothing: 0.8,
            min_db: -100.0,
            max_db: -30.0,
        }
    }
}

impl AnalyserConfig {
    /// Clamp every field into a usable range.
    pub fn normalized(mut self) -> Self {
        self.fft_size = self.fft_size.clamp(32, 32_768).next_power_of_two();
        self.smoothing = self.smoothing.clamp(0.0, 0.99);
        if !(self.max_db > self.min_db) {
            let defaults = Self::default();
            self.min_db = defaults.min_db;
            self.max_db = defaults.max_db;
        }
        self
    }
}

pub struct SpectrumAnalyser {
    config: AnalyserConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    history: VecDeque<f32>,
    fft_buf: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    bytes: Vec<u8>,
    scratch: Vec<f32>,
}

impl SpectrumAnalyser {
    pub fn new(config: AnalyserConfig) -> Self {
        let config = config.normalized();
        let n = config.fft_size;
        let bins = n / 2;
        Self {
            config,
            fft: FftPlanner::<f32>::new().plan_fft_forward(n),
            window: build_blackman_window(n),
            history: VecDeque::from(vec![0.0; n]),
            fft_buf: vec![Complex::new(0.0, 0.0); n],
            smoothed: vec![0.0; bins],
            bytes: vec![0; bins],
            scratch: vec![0.0; DRAIN_BLOCK],
        }
    }

    pub fn config(&self) -> AnalyserConfig {
        self.config
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.config.fft_size / 2
    }

    /// Append rendered samples, keeping only the newest `fft_size`.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let n = self.config.fft_size;
        let tail = &samples[samples.len().saturating_sub(n)..];
        let overflow = (self.history.len() + tail.len()).saturating_sub(n);
        self.history.drain(..overflow);
        self.history.extend(tail.iter().copied());
    }

    /// Move everything the renderer has tapped so far into the history.
    pub fn drain(&mut self, tap: &mut TapConsumer) -> usize {
        let mut total = 0;
        loop {
            let mut scratch = std::mem::take(&mut self.scratch);
            let n = tap.pop_slice(&mut scratch);
            self.push_samples(&scratch[..n]);
            self.scratch = scratch;
            total += n;
            if n < DRAIN_BLOCK {
                return total;
            }
        }
    }

    /// Throw away tapped audio without analysing it.
    pub fn discard_pending(&mut self, tap: &mut TapConsumer) -> usize {
        let mut total = 0;
        loop {
            let n = tap.pop_slice(&mut self.scratch);
            total += n;
            if n < DRAIN_BLOCK {
                return total;
            }
        }
    }

    /// Zero the history and the smoothing state.
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.smoothed.iter_mut().for_each(|m| *m = 0.0);
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }

    /// Recompute the byte spectrum from the current history.
    pub fn compute(&mut self) -> &[u8] {
        let n = self.config.fft_size;
        for ((slot, sample), w) in self.fft_buf.iter_mut().zip(&self.history).zip(&self.window) {
            *slot = Complex::new(sample * w, 0.0);
        }
        self.fft.process(&mut self.fft_buf);

        let tau = self.config.smoothing;
        let (min_db, max_db) = (self.config.min_db, self.config.max_db);
        let scale = 255.0 / (max_db - min_db);

        for (k, (smoothed, byte)) in self.smoothed.iter_mut().zip(&mut self.bytes).enumerate() {
            let magnitude = self.fft_buf[k].norm() / n as f32;
            *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;
            let db = 20.0 * smoothed.log10();
            *byte = (scale * (db - min_db)).floor().clamp(0.0, 255.0) as u8;
        }
        &self.bytes
    }

    /// The spectrum produced by the last `compute`.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Periodic Blackman window (a0 = 0.42, a1 = 0.5, a2 = 0.08).
fn build_blackman_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_tap_ring, Observer, Producer};

    fn sine_at_bin(bin: usize, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * bin as f32 * i as f32 / n as f32).sin())
            .collect()
    }

    #[test]
    fn silence_maps_to_zero_bytes() {
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig::default());
        assert_eq!(analyser.frequency_bin_count(), 256);
        assert!(analyser.compute().iter().all(|b| *b == 0));
    }

    #[test]
    fn pure_tone_lights_up_its_bin_only() {
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig::default());
        analyser.push_samples(&sine_at_bin(20, 512));
        let bytes = analyser.compute().to_vec();
        assert!(bytes[20] > 200, "bin 20 = {}", bytes[20]);
        assert!(bytes[100] < 64, "bin 100 = {}", bytes[100]);
    }

    #[test]
    fn smoothing_decays_after_signal_stops() {
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig::default());
        let quiet: Vec<f32> = sine_at_bin(20, 512).iter().map(|s| s * 0.01).collect();
        analyser.push_samples(&quiet);
        let loud = analyser.compute()[20];
        analyser.push_samples(&vec![0.0; 512]);
        let fading = analyser.compute()[20];
        assert!(fading > 0 && fading < loud);
    }

    #[test]
    fn history_keeps_newest_samples() {
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig {
            fft_size: 32,
            ..AnalyserConfig::default()
        });
        let ramp: Vec<f32> = (0..100).map(|i| i as f32).collect();
        analyser.push_samples(&ramp);
        assert_eq!(analyser.history.len(), 32);
        assert_eq!(analyser.history.front().copied(), Some(68.0));
        assert_eq!(analyser.history.back().copied(), Some(99.0));
    }

    #[test]
    fn drain_and_discard_empty_the_tap() {
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig::default());
        let (mut tap, mut rx) = create_tap_ring();
        tap.push_slice(&vec![0.1; 3000]);
        assert_eq!(analyser.drain(&mut rx), 3000);
        assert_eq!(rx.occupied_len(), 0);

        tap.push_slice(&vec![0.1; 2048]);
        assert_eq!(analyser.discard_pending(&mut rx), 2048);
        assert_eq!(rx.occupied_len(), 0);
    }

    #[test]
    fn invalid_config_is_normalized() {
        let config = AnalyserConfig {
            fft_size: 300,
            smoothing: 4.0,
            min_db: -10.0,
            max_db: -20.0,
        }
        .normalized();
        assert_eq!(config.fft_size, 512);
        assert!(config.smoothing < 1.0);
        assert!(config.max_db > config.min_db);
    }
}
