//! Loopback agent: plays the microphone back through the speaker.
//!
//! Every captured 16 kHz frame is decoded, resampled to the 24 kHz playback
//! rate and fed to the engine as if the agent had sent it. Useful for
//! checking devices and latency without a remote agent.

use std::sync::Arc;

use parley_core::audio::{resample::RateConverter, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use parley_core::codec::{decode_chunk, encode_chunk};
use parley_core::{ConversationEngine, PcmBlob, ServerEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Resampler block: one capture frame.
const LOOPBACK_CHUNK: usize = 4096;

pub fn spawn(
    engine: Arc<ConversationEngine>,
    mut outbound: mpsc::Receiver<PcmBlob>,
) -> anyhow::Result<JoinHandle<()>> {
    let mut converter = RateConverter::new(CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE, LOOPBACK_CHUNK)?;

    Ok(tokio::task::spawn_blocking(move || {
        info!("loopback agent running");
        while let Some(blob) = outbound.blocking_recv() {
            let samples = match decode_chunk(&blob.data) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!("loopback could not decode its own frame: {e}");
                    continue;
                }
            };
            let upsampled = converter.process(&samples);
            if upsampled.is_empty() {
                continue;
            }
            debug!(samples = upsampled.len(), "echoing frame");
            let event = ServerEvent::AudioChunk {
                data: encode_chunk(&upsampled),
            };
            if engine.handle_event(event).is_err() {
                break;
            }
        }
        info!("loopback agent stopped");
    }))
}
