//! Capture worker: microphone ring → 16 kHz frames → outbound sink.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Drain the capture ring (device rate, mono)
//! 2. Convert to CAPTURE_SAMPLE_RATE
//! 3. Cut into CAPTURE_FRAME_SAMPLES frames
//! 4. Encode each frame as a PcmBlob and hand it to the sink
//! ```
//!
//! The cpal callback only fills the ring. Everything above runs here, on a
//! plain thread, so a slow sink can never stall the audio device.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
    audio::{resample::RateConverter, CAPTURE_FRAME_SAMPLES, CAPTURE_SAMPLE_RATE},
    buffering::{frame::FrameAssembler, AudioConsumer, Consumer},
    codec::PcmBlob,
    diagnostics::PipelineDiagnostics,
    error::Result,
};

/// Samples drained from the capture ring per iteration.
const DRAIN_CHUNK: usize = 4096;

/// Sleep when the ring is empty (avoids busy-wait burning a core).
const SLEEP_EMPTY_MS: u64 = 5;

/// Where encoded microphone frames go.
///
/// `send` must not block. Returning `false` means the frame was refused;
/// it is counted and dropped, never retried.
pub trait OutboundSink: Send + Sync {
    fn send(&self, blob: PcmBlob) -> bool;
}

impl<F> OutboundSink for F
where
    F: Fn(PcmBlob) -> bool + Send + Sync,
{
    fn send(&self, blob: PcmBlob) -> bool {
        self(blob)
    }
}

/// Sink backed by a bounded tokio channel, for async transports.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<PcmBlob>,
}

impl ChannelSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PcmBlob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl OutboundSink for ChannelSink {
    fn send(&self, blob: PcmBlob) -> bool {
        self.tx.try_send(blob).is_ok()
    }
}

/// Resamples device audio and emits one `PcmBlob` per full frame.
pub struct CaptureEncoder {
    converter: RateConverter,
    framer: FrameAssembler,
}

impl CaptureEncoder {
    /// # Errors
    /// `ParleyError::AudioDevice` if no resampler exists for `device_rate`.
    pub fn new(device_rate: u32) -> Result<Self> {
        // 20 ms of device audio per resampler call.
        let chunk = (device_rate / 50).max(64) as usize;
        Ok(Self {
            converter: RateConverter::new(device_rate, CAPTURE_SAMPLE_RATE, chunk)?,
            framer: FrameAssembler::new(CAPTURE_FRAME_SAMPLES, CAPTURE_SAMPLE_RATE),
        })
    }

    /// Feed device-rate samples. Returns how many frames the sink accepted.
    pub fn push(
        &mut self,
        samples: &[f32],
        sink: &dyn OutboundSink,
        diagnostics: &PipelineDiagnostics,
    ) -> usize {
        let converted = self.converter.process(samples);
        let mut accepted = 0;
        self.framer.push(&converted, |frame| {
            PipelineDiagnostics::bump(&diagnostics.frames_captured);
            let blob = PcmBlob::from_capture_frame(&frame.samples);
            PipelineDiagnostics::bump(&diagnostics.frames_encoded);
            if sink.send(blob) {
                accepted += 1;
            } else {
                PipelineDiagnostics::bump(&diagnostics.frames_dropped);
                warn!(samples = frame.len(), "outbound sink refused capture frame");
            }
        });
        accepted
    }

    /// Samples waiting for the next full frame, at 16 kHz.
    pub fn pending_len(&self) -> usize {
        self.framer.pending_len()
    }
}

/// All context the capture worker needs.
pub struct CaptureContext {
    pub encoder: CaptureEncoder,
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    pub sink: Arc<dyn OutboundSink>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Run until `ctx.running` becomes false.
pub fn run(mut ctx: CaptureContext) {
    info!("capture worker started");
    let mut buf = vec![0f32; DRAIN_CHUNK];

    while ctx.running.load(Ordering::Acquire) {
        let n = ctx.consumer.pop_slice(&mut buf);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(SLEEP_EMPTY_MS));
            continue;
        }
        ctx.encoder
            .push(&buf[..n], ctx.sink.as_ref(), &ctx.diagnostics);
    }

    // A partial frame is never sent.
    info!(
        discarded = ctx.encoder.pending_len(),
        "capture worker stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_audio_ring, Producer};
    use crate::codec::decode_chunk;
    use parking_lot::Mutex;

    fn collecting_sink() -> (Arc<Mutex<Vec<PcmBlob>>>, impl OutboundSink) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = move |blob: PcmBlob| {
            sink_seen.lock().push(blob);
            true
        };
        (seen, sink)
    }

    #[test]
    fn emits_one_blob_per_full_frame() {
        let diag = PipelineDiagnostics::default();
        let (seen, sink) = collecting_sink();
        let mut encoder = CaptureEncoder::new(CAPTURE_SAMPLE_RATE).unwrap();

        assert_eq!(encoder.push(&vec![0.25; 4000], &sink, &diag), 0);
        assert_eq!(encoder.push(&vec![0.25; 5000], &sink, &diag), 2);
        assert_eq!(encoder.pending_len(), 9000 - 2 * CAPTURE_FRAME_SAMPLES);

        let blobs = seen.lock();
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].mime_type, "audio/pcm;rate=16000");
        let samples = decode_chunk(&blobs[0].data).unwrap();
        assert_eq!(samples.len(), CAPTURE_FRAME_SAMPLES);
        assert!(samples.iter().all(|s| (*s - 0.25).abs() <= 1.0 / 32_768.0));
        assert_eq!(diag.snapshot().frames_encoded, 2);
    }

    #[test]
    fn refused_frames_are_counted_not_retried() {
        let diag = PipelineDiagnostics::default();
        let refuse = |_: PcmBlob| false;
        let mut encoder = CaptureEncoder::new(CAPTURE_SAMPLE_RATE).unwrap();
        assert_eq!(encoder.push(&vec![0.0; CAPTURE_FRAME_SAMPLES * 3], &refuse, &diag), 0);

        let snap = diag.snapshot();
        assert_eq!(snap.frames_captured, 3);
        assert_eq!(snap.frames_dropped, 3);
    }

    #[test]
    fn channel_sink_refuses_when_full() {
        let (sink, mut rx) = ChannelSink::channel(1);
        let blob = PcmBlob::from_capture_frame(&[0.0; 4]);
        assert!(sink.send(blob.clone()));
        assert!(!sink.send(blob.clone()));
        assert_eq!(rx.try_recv().ok(), Some(blob));
    }

    #[test]
    fn worker_resamples_device_audio_into_frames() {
        let (mut producer, consumer) = create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let (seen, sink) = collecting_sink();

        // Just over two frames' worth at 48 kHz once converted to 16 kHz.
        producer.push_slice(&vec![0.1; 3 * CAPTURE_FRAME_SAMPLES * 2 + 4800]);

        let ctx = CaptureContext {
            encoder: CaptureEncoder::new(48_000).unwrap(),
            consumer,
            running: Arc::clone(&running),
            sink: Arc::new(sink),
            diagnostics: Arc::clone(&diagnostics),
        };
        let worker = std::thread::spawn(move || run(ctx));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        running.store(false, Ordering::Release);
        worker.join().unwrap();

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(diagnostics.snapshot().frames_captured, 2);
    }
}
