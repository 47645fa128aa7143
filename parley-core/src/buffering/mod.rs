//! Lock-free SPSC ring buffers.
//!
//! Two sample rings cross a real-time boundary:
//!
//! | Ring | Producer (RT side) | Consumer |
//! |------|--------------------|----------|
//! | capture | cpal input callback | capture worker thread |
//! | tap | output renderer | spectrum analyser (render tick) |
//!
//! `ringbuf::HeapRb` gives a wait-free `push_slice`, safe to call from an
//! audio callback.

pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half of the capture ring, held by the input callback.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half of the capture ring, held by the capture worker.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Producer half of the playback tap, held by the output renderer.
pub type TapProducer = ringbuf::HeapProd<f32>;

/// Consumer half of the playback tap, drained by the spectrum analyser.
pub type TapConsumer = ringbuf::HeapCons<f32>;

/// Capture ring capacity: 2^19 samples ≈ 10.9 s at 48 kHz.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 19;

/// Tap capacity: 2^14 samples ≈ 0.68 s at 24 kHz, far more than one
/// render frame's worth of audio.
pub const TAP_RING_CAPACITY: usize = 1 << 14;

/// Create the matched producer/consumer pair for microphone samples.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(CAPTURE_RING_CAPACITY).split()
}

/// Create the matched producer/consumer pair for the playback tap.
pub fn create_tap_ring() -> (TapProducer, TapConsumer) {
    HeapRb::<f32>::new(TAP_RING_CAPACITY).split()
}
