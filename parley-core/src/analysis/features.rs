//! Per-tick avatar features derived from the byte spectrum.

use serde::{Deserialize, Serialize};

/// Weight of the previous smoothed energy.
pub const ENERGY_DECAY: f32 = 0.9;

/// Upper bound on the high/low ratio.
pub const MAX_BRIGHTNESS: f32 = 1.5;

const LOW_BAND: (usize, usize) = (0, 10);
const MID_BAND: (usize, usize) = (10, 40);
const HIGH_BAND: (usize, usize) = (40, 120);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSnapshot {
    pub volume: f32,
    pub low: f32,
    pub mid: f32,
    pub high: f32,
    /// Exponentially smoothed `volume`.
    pub energy: f32,
    pub brightness: f32,
}

impl FeatureSnapshot {
    /// What the avatar sees while the agent is silent.
    pub const NEUTRAL: FeatureSnapshot = FeatureSnapshot {
        volume: 0.0,
        low: 0.0,
        mid: 0.0,
        high: 0.0,
        energy: 0.0,
        brightness: 0.5,
    };
}

impl Default for FeatureSnapshot {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// Mean of `spectrum[from..to]` scaled to [0, 1]. Bins past the end of a
/// short spectrum count as silence.
fn band_level(spectrum: &[u8], (from, to): (usize, usize)) -> f32 {
    let sum: u32 = spectrum
        .iter()
        .skip(from)
        .take(to - from)
        .map(|b| u32::from(*b))
        .sum();
    sum as f32 / ((to - from) as f32 * 255.0)
}

/// Features for one tick, given the smoothed energy of the previous tick.
pub fn extract(prev_energy: f32, spectrum: &[u8]) -> FeatureSnapshot {
    let low = band_level(spectrum, LOW_BAND);
    let mid = band_level(spectrum, MID_BAND);
    let high = band_level(spectrum, HIGH_BAND);
    let volume = (low + mid + high) / 3.0;

    FeatureSnapshot {
        volume,
        low,
        mid,
        high,
        energy: ENERGY_DECAY * prev_energy + (1.0 - ENERGY_DECAY) * volume,
        brightness: (high / (low + 0.01)).min(MAX_BRIGHTNESS),
    }
}

/// Carries the smoothed energy from one tick to the next.
#[derive(Debug, Default)]
pub struct FeatureExtractor {
    energy: f32,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// One animation tick. While the agent is silent the result is always
    /// `FeatureSnapshot::NEUTRAL` and the smoothing restarts from zero.
    pub fn tick(&mut self, speaking: bool, spectrum: &[u8]) -> FeatureSnapshot {
        if !speaking {
            self.energy = 0.0;
            return FeatureSnapshot::NEUTRAL;
        }
        let snapshot = extract(self.energy, spectrum);
        self.energy = snapshot.energy;
        snapshot
    }

    pub fn energy(&self) -> f32 {
        self.energy
    }
}
