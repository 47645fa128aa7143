//! Speaker output via cpal.
//!
//! The stream callback owns a `Renderer`; this handle owns the producer end
//! of its command ring and a view of its clock. Device-native formats other
//! than f32 are converted per sample after mixing.

use std::sync::Arc;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::info;

use super::output::{submit_unit, OutputDevice, OutputWiring};
use super::render::{CommandProducer, RenderClock};
#[cfg(feature = "audio-cpal")]
use super::{
    render::{create_command_ring, Renderer},
    PLAYBACK_SAMPLE_RATE,
};
use crate::error::{ParleyError, Result};
use crate::playback::ScheduledUnit;

/// Handle to an open speaker stream at `PLAYBACK_SAMPLE_RATE`.
///
/// **Not `Send`**; see the threading note in [`crate::audio`].
pub struct CpalOutput {
    #[cfg(feature = "audio-cpal")]
    stream: Option<Stream>,
    commands: CommandProducer,
    clock: Arc<RenderClock>,
    sample_rate: u32,
}

impl CpalOutput {
    /// Open `preferred_device_name` (or the default output) at 24 kHz.
    ///
    /// # Errors
    /// `ParleyError::NoDefaultOutputDevice` without any output device,
    /// `ParleyError::AudioDevice` if no config on the device supports
    /// 24 kHz, `ParleyError::AudioStream` if cpal cannot start the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open(preferred_device_name: Option<&str>, wiring: OutputWiring) -> Result<Self> {
        let device = super::device::resolve_output_device(preferred_device_name)?;
        let rate = SampleRate(PLAYBACK_SAMPLE_RATE);

        let supported = device
            .supported_output_configs()
            .map_err(|e| ParleyError::AudioDevice(e.to_string()))?
            .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
            .min_by_key(|c| (c.channels(), c.sample_format() != SampleFormat::F32))
            .ok_or_else(|| {
                ParleyError::AudioDevice(format!(
                    "no output config supports {PLAYBACK_SAMPLE_RATE} Hz"
                ))
            })?
            .with_sample_rate(rate);

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.config();

        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            format = ?sample_format,
            "opening output device"
        );

        let (commands, consumer) = create_command_ring();
        let clock = Arc::new(RenderClock::default());
        let mut renderer = Renderer::new(consumer, Arc::clone(&clock));
        renderer.set_notifier(wiring.notifier);
        if let Some(tap) = wiring.tap {
            renderer.set_tap(tap);
        }

        let stream = match sample_format {
            SampleFormat::F32 => build_render_stream::<f32>(&device, &config, renderer),
            SampleFormat::I16 => build_render_stream::<i16>(&device, &config, renderer),
            SampleFormat::U16 => build_render_stream::<u16>(&device, &config, renderer),
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            commands,
            clock,
            sample_rate: PLAYBACK_SAMPLE_RATE,
        })
    }

    /// Stub when the `audio-cpal` feature is disabled.
    #[cfg(not(feature = "audio-cpal"))]
    pub fn open(_preferred_device_name: Option<&str>, _wiring: OutputWiring) -> Result<Self> {
        Err(ParleyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

/// Render mono, then fan each sample out to every device channel.
#[cfg(feature = "audio-cpal")]
fn build_render_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut renderer: Renderer,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    device.build_output_stream(
        config,
        move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
            let mono = renderer.render(data.len() / channels);
            for (frame, sample) in data.chunks_mut(channels).zip(mono) {
                let value = T::from_sample(*sample);
                for out in frame.iter_mut() {
                    *out = value;
                }
            }
        },
        |err| tracing::error!("output stream error: {err}"),
        None,
    )
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames already handed to the device, plus one block of lead so a unit
    /// started "now" lands on the next block instead of being clipped.
    fn now(&self) -> f64 {
        (self.clock.frames() + self.clock.last_block()) as f64 / self.sample_rate as f64
    }

    fn played_frames(&self) -> u64 {
        self.clock.frames()
    }

    fn start_unit(&mut self, unit: &ScheduledUnit) -> bool {
        submit_unit(&mut self.commands, &self.clock, unit, self.sample_rate)
    }

    fn stop_all(&mut self) {
        self.clock.request_stop();
    }

    fn close(&mut self) {
        self.release_stream();
    }
}

impl CpalOutput {
    #[cfg(feature = "audio-cpal")]
    fn release_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            info!("output device released");
        }
    }

    #[cfg(not(feature = "audio-cpal"))]
    fn release_stream(&mut self) {}
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}
