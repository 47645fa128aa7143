//! Playback analysis for avatar animation.
//!
//! `SpectrumAnalyser` turns the tapped output signal into a byte spectrum;
//! `FeatureExtractor` reduces that spectrum to a handful of normalised
//! levels once per render tick.

pub mod features;
pub mod spectrum;

pub use features::{extract, FeatureExtractor, FeatureSnapshot};
pub use spectrum::{AnalyserConfig, SpectrumAnalyser};
