//! Audio devices: microphone capture, speaker output, and the pieces between.
//!
//! # Design constraints
//!
//! cpal input and output callbacks run on OS audio threads at elevated
//! priority. They **must not**:
//! - Block on a mutex or condvar
//! - Perform I/O
//! - Allocate in steady state
//!
//! Capture satisfies that by down-mixing into a pre-sized scratch buffer and
//! writing to an SPSC ring producer. Output satisfies it by receiving
//! schedule/stop commands through an SPSC ring and reporting finished units
//! with a non-blocking `try_send`.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` and `CpalOutput` therefore must be created and
//! dropped on the same thread. The engine opens each on its own worker thread.

pub mod device;
pub mod output;
pub mod render;
pub mod resample;
pub mod speaker;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};

use crate::{
    buffering::AudioProducer,
    error::{ParleyError, Result},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Sample rate the agent expects for microphone audio (Hz).
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio returned by the agent (Hz).
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per outbound capture frame (256 ms at 16 kHz).
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

/// Scratch capacity for the down-mix buffer, sized for the largest callback
/// block we expect from any backend.
#[cfg(feature = "audio-cpal")]
const MIX_SCRATCH_CAPACITY: usize = 16_384;

/// Handle to an active microphone stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Set to `false` to make the callback no-op.
    running: Arc<AtomicBool>,
    /// Native rate reported by the device (Hz). The capture worker converts
    /// from this to `CAPTURE_SAMPLE_RATE`.
    pub sample_rate: u32,
}

impl AudioCapture {
    /// Open an input device by preferred name, otherwise the default input
    /// device, otherwise the first input device the host lists.
    ///
    /// # Errors
    /// `ParleyError::NoDefaultInputDevice` when the host has no input at
    /// all, `ParleyError::AudioStream` if cpal cannot build or start it.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        let device = device::resolve_input_device(preferred_device_name)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let config: StreamConfig = supported.config();

        info!(sample_rate, channels = config.channels, "capture config selected");

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_capture_stream::<f32>(&device, &config, producer, Arc::clone(&running))
            }
            SampleFormat::I16 => {
                build_capture_stream::<i16>(&device, &config, producer, Arc::clone(&running))
            }
            SampleFormat::U16 => {
                build_capture_stream::<u16>(&device, &config, producer, Arc::clone(&running))
            }
            SampleFormat::U8 => {
                build_capture_stream::<u8>(&device, &config, producer, Arc::clone(&running))
            }
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported capture sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Open the system default microphone.
    #[cfg(feature = "audio-cpal")]
    pub fn open_default(producer: AudioProducer, running: Arc<AtomicBool>) -> Result<Self> {
        Self::open_with_preference(producer, running, None)
    }

    /// Signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Down-mix every callback block to mono and push it into the capture ring.
#[cfg(feature = "audio-cpal")]
fn build_capture_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    use crate::buffering::Producer;

    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::with_capacity(MIX_SCRATCH_CAPACITY);

    device.build_input_stream(
        config,
        move |data: &[T], _info: &cpal::InputCallbackInfo| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            mono.clear();
            mono.extend(data.chunks(channels).map(|frame| {
                let sum: f32 = frame.iter().map(|s| f32::from_sample(*s)).sum();
                sum / frame.len() as f32
            }));
            let written = producer.push_slice(&mono);
            if written < mono.len() {
                warn!(dropped = mono.len() - written, "capture ring full");
            }
        },
        |err| error!("capture stream error: {err}"),
        None,
    )
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(ParleyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn open_default(producer: AudioProducer, running: Arc<AtomicBool>) -> Result<Self> {
        Self::open_with_preference(producer, running, None)
    }
}
