//! Fixed-rate audio frames and the assembler that cuts them.

/// A contiguous block of mono f32 samples at a known sample rate.
///
/// Samples are nominally in [-1.0, 1.0]; nothing here enforces that, the
/// codec clamps on the way out.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    /// Sample rate in Hz (16 000 for capture, 24 000 for playback).
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Cuts an arbitrary-length sample stream into frames of exactly
/// `frame_len` samples.
///
/// Holds at most `frame_len - 1` samples between calls: one partially
/// filled frame, never a backlog.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_len: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_len: usize, sample_rate: u32) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            frame_len,
            sample_rate,
            pending: Vec::with_capacity(frame_len),
        }
    }

    /// Append samples, calling `emit` once for every completed frame.
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        while !samples.is_empty() {
            let take = (self.frame_len - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_len {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_len));
                emit(AudioFrame::new(full, self.sample_rate));
            }
        }
    }

    /// Samples waiting for the next frame boundary.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Discard the partial frame.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
