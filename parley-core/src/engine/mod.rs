//! `ConversationEngine`: top-level session controller.
//!
//! ## Lifecycle
//!
//! ```text
//! ConversationEngine::new()
//!     └─► start(sink)          → speaker + microphone open, status = Connected
//!         ├─► handle_event()   → audio / interruption / transcripts, in arrival order
//!         ├─► render_tick()    → once per display frame
//!         └─► end_session()    → playback stopped, devices released, status = Disconnected
//! ```
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS, so each device is opened
//! *inside* the thread that owns it: the playback thread opens the speaker
//! and owns the `PlaybackScheduler`; the capture thread opens the
//! microphone and runs the encoder. A sync oneshot channel propagates any
//! open-device error back to the caller of `start()`.

pub mod capture;
pub mod playback;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    mpsc as sync_mpsc, Arc,
};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    analysis::{AnalyserConfig, FeatureExtractor, SpectrumAnalyser},
    audio::{
        output::{OutputDevice, OutputWiring},
        speaker::CpalOutput,
        AudioCapture,
    },
    buffering::{create_audio_ring, create_tap_ring, TapConsumer},
    diagnostics::{DiagnosticsSnapshot, PipelineDiagnostics},
    error::{ParleyError, Result},
    ipc::events::{Message, RenderFrame, ServerEvent, SessionStatus, SessionStatusEvent},
    playback::PlaybackScheduler,
    transcript::{ConversationLog, TurnAggregator},
};

use capture::{CaptureContext, CaptureEncoder, OutboundSink};
use playback::{PlaybackCommand, PlaybackContext, COMPLETION_QUEUE_CAPACITY};

/// Broadcast channel capacity for slow message/status consumers.
const BROADCAST_CAP: usize = 256;

/// Configuration for `ConversationEngine`.
///
/// Sample rates and the capture frame size are fixed by the agent and live
/// in `crate::audio` as constants.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Microphone to open by name. `None` uses the system default.
    pub preferred_input_device: Option<String>,
    /// Speaker to open by name. `None` uses the system default.
    pub preferred_output_device: Option<String>,
    /// Inbound playback commands buffered ahead of the playback thread.
    /// Default: 256.
    pub inbound_queue_capacity: usize,
    /// Encoded microphone frames buffered for the transport. Default: 64.
    pub outbound_queue_capacity: usize,
    pub analyser: AnalyserConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            inbound_queue_capacity: 256,
            outbound_queue_capacity: 64,
            analyser: AnalyserConfig::default(),
        }
    }
}

struct PlaybackHandle {
    commands: Sender<PlaybackCommand>,
    generation: Arc<AtomicU64>,
    thread: JoinHandle<()>,
}

struct CaptureHandle {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Render-tick state. Only the render loop touches it.
struct RenderState {
    analyser: SpectrumAnalyser,
    extractor: FeatureExtractor,
    tap: Option<TapConsumer>,
}

/// The top-level engine handle.
///
/// `ConversationEngine` is `Send + Sync`; wrap it in an `Arc` to share it
/// between the transport reader, the render loop and the host.
pub struct ConversationEngine {
    config: EngineConfig,
    playback: Mutex<Option<PlaybackHandle>>,
    capture: Mutex<Option<CaptureHandle>>,
    render: Mutex<RenderState>,
    /// Live unit count published by the playback thread.
    active_units: Arc<AtomicUsize>,
    turns: Mutex<TurnAggregator>,
    log: ConversationLog,
    status: Arc<Mutex<SessionStatus>>,
    message_tx: broadcast::Sender<Message>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl ConversationEngine {
    /// Create an idle engine. Nothing is opened until `start()`.
    pub fn new(config: EngineConfig) -> Self {
        let (message_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let render = RenderState {
            analyser: SpectrumAnalyser::new(config.analyser),
            extractor: FeatureExtractor::new(),
            tap: None,
        };

        Self {
            config,
            playback: Mutex::new(None),
            capture: Mutex::new(None),
            render: Mutex::new(render),
            active_units: Arc::new(AtomicUsize::new(0)),
            turns: Mutex::new(TurnAggregator::new()),
            log: ConversationLog::new(),
            status: Arc::new(Mutex::new(SessionStatus::Disconnected)),
            message_tx,
            status_tx,
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open the speaker and the microphone and start streaming frames to
    /// `sink`.
    ///
    /// Blocks until both devices are confirmed open (or one fails). A
    /// failure is reported once: status becomes `Error`, anything already
    /// opened is torn down, nothing is retried.
    ///
    /// # Errors
    /// - `ParleyError::AlreadyRunning` if a session is active.
    /// - Device errors from either side.
    pub fn start(&self, sink: impl OutboundSink + 'static) -> Result<()> {
        if self.is_running() {
            return Err(ParleyError::AlreadyRunning);
        }
        self.diagnostics.reset();
        self.set_status(SessionStatus::Connecting, None);

        let preferred_output = self.config.preferred_output_device.clone();
        let opened = self
            .open_playback(move |wiring| CpalOutput::open(preferred_output.as_deref(), wiring))
            .and_then(|()| self.open_capture(Arc::new(sink)));

        match opened {
            Ok(()) => {
                self.set_status(SessionStatus::Connected, None);
                info!("session started");
                Ok(())
            }
            Err(e) => {
                self.shutdown();
                self.set_status(SessionStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Start only the playback side, on an output opened by `open`.
    ///
    /// `open` runs on the playback thread, so `O` does not need to be `Send`.
    /// This is how headless hosts and tests drive the engine with a
    /// `VirtualOutput`.
    pub fn start_playback_with<O, F>(&self, open: F) -> Result<()>
    where
        O: OutputDevice + 'static,
        F: FnOnce(OutputWiring) -> Result<O> + Send + 'static,
    {
        if self.playback.lock().is_some() {
            return Err(ParleyError::AlreadyRunning);
        }
        self.diagnostics.reset();
        self.set_status(SessionStatus::Connecting, None);
        match self.open_playback(open) {
            Ok(()) => {
                self.set_status(SessionStatus::Connected, None);
                Ok(())
            }
            Err(e) => {
                self.set_status(SessionStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Start only the microphone side.
    pub fn start_capture(&self, sink: impl OutboundSink + 'static) -> Result<()> {
        if self.capture.lock().is_some() {
            return Err(ParleyError::AlreadyRunning);
        }
        self.open_capture(Arc::new(sink))
    }

    fn open_playback<O, F>(&self, open: F) -> Result<()>
    where
        O: OutputDevice + 'static,
        F: FnOnce(OutputWiring) -> Result<O> + Send + 'static,
    {
        let (commands, command_rx) = bounded(self.config.inbound_queue_capacity.max(1));
        let (done_tx, done_rx) = bounded(COMPLETION_QUEUE_CAPACITY);
        let (tap, tap_rx) = create_tap_ring();
        let generation = Arc::new(AtomicU64::new(0));

        let wiring = OutputWiring {
            notifier: Box::new(move |id| {
                // Never block the render callback. A notice lost to a full
                // queue is recovered by the playback loop's clock reap.
                let _ = done_tx.try_send(id);
            }),
            tap: Some(tap),
        };

        let active_units = Arc::clone(&self.active_units);
        let diagnostics = Arc::clone(&self.diagnostics);
        let thread_generation = Arc::clone(&generation);
        let (open_tx, open_rx) = sync_mpsc::channel::<Result<()>>();

        let thread = std::thread::Builder::new()
            .name("parley-playback".into())
            .spawn(move || {
                // Must happen on THIS thread: cpal::Stream is !Send.
                let output = match open(wiring) {
                    Ok(output) => {
                        let _ = open_tx.send(Ok(()));
                        output
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                let scheduler = PlaybackScheduler::with_diagnostics(output, diagnostics)
                    .with_active_count(active_units);
                playback::run(PlaybackContext {
                    scheduler,
                    commands: command_rx,
                    completions: done_rx,
                    generation: thread_generation,
                });
                // The output drops here, releasing the device on this thread.
            })?;

        match open_rx.recv() {
            Ok(Ok(())) => {
                {
                    let mut render = self.render.lock();
                    render.tap = Some(tap_rx);
                    render.analyser.reset();
                }
                *self.playback.lock() = Some(PlaybackHandle {
                    commands,
                    generation,
                    thread,
                });
                info!("playback started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(ParleyError::Other(anyhow::anyhow!(
                    "playback thread died unexpectedly"
                )))
            }
        }
    }

    fn open_capture(&self, sink: Arc<dyn OutboundSink>) -> Result<()> {
        let (producer, consumer) = create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let diagnostics = Arc::clone(&self.diagnostics);
        let preferred_input = self.config.preferred_input_device.clone();
        let (open_tx, open_rx) = sync_mpsc::channel::<Result<u32>>();

        let thread = std::thread::Builder::new()
            .name("parley-capture".into())
            .spawn(move || {
                // Must happen on THIS thread: cpal::Stream is !Send.
                let opened = AudioCapture::open_with_preference(
                    producer,
                    Arc::clone(&thread_running),
                    preferred_input.as_deref(),
                )
                .and_then(|capture| {
                    let encoder = CaptureEncoder::new(capture.sample_rate)?;
                    Ok((capture, encoder))
                });

                let (capture, encoder) = match opened {
                    Ok(pair) => {
                        let _ = open_tx.send(Ok(pair.0.sample_rate));
                        pair
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                capture::run(CaptureContext {
                    encoder,
                    consumer,
                    running: thread_running,
                    sink,
                    diagnostics,
                });

                capture.stop();
                drop(capture);
            })?;

        match open_rx.recv() {
            Ok(Ok(rate)) => {
                *self.capture.lock() = Some(CaptureHandle { running, thread });
                info!(device_rate = rate, "capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(ParleyError::Other(anyhow::anyhow!(
                    "capture thread died unexpectedly"
                )))
            }
        }
    }

    /// Dispatch one transport event.
    ///
    /// Audio, interruption and session close keep their relative order
    /// through a single command queue. Transcript fragments go to the turn
    /// aggregator; `TurnComplete` flushes it into the conversation log.
    ///
    /// # Errors
    /// `ParleyError::NotRunning` for audio or interruption events while no
    /// playback session is active.
    pub fn handle_event(&self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::AudioChunk { data } => {
                let (commands, generation) = self.playback_sender()?;
                let cmd = PlaybackCommand::Chunk {
                    data,
                    generation: generation.load(Ordering::Acquire),
                };
                // Back-pressure lands on the transport reader, never on audio.
                commands.send(cmd).map_err(|_| ParleyError::NotRunning)
            }
            ServerEvent::Interrupted => {
                let (commands, generation) = self.playback_sender()?;
                let current = generation.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(generation = current, "interruption received");
                match commands.try_send(PlaybackCommand::Interrupted) {
                    // A full queue means the loop is awake and will see the
                    // new generation before its next command.
                    Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
                    Err(TrySendError::Disconnected(_)) => Err(ParleyError::NotRunning),
                }
            }
            ServerEvent::InputTranscription { text } => {
                self.turns.lock().append_inbound(&text);
                Ok(())
            }
            ServerEvent::OutputTranscription { text } => {
                self.turns.lock().append_outbound(&text);
                Ok(())
            }
            ServerEvent::TurnComplete => {
                self.flush_turn();
                Ok(())
            }
            ServerEvent::SessionClosed => {
                info!("remote closed the session");
                self.end_session();
                Ok(())
            }
        }
    }

    fn playback_sender(&self) -> Result<(Sender<PlaybackCommand>, Arc<AtomicU64>)> {
        self.playback
            .lock()
            .as_ref()
            .map(|p| (p.commands.clone(), Arc::clone(&p.generation)))
            .ok_or(ParleyError::NotRunning)
    }

    fn flush_turn(&self) -> Vec<Message> {
        let messages = self.turns.lock().close_turn();
        if messages.is_empty() {
            return messages;
        }
        self.log.append(messages.iter().cloned());
        for message in &messages {
            debug!(id = message.id.as_str(), sender = ?message.sender, "message finalised");
            let _ = self.message_tx.send(message.clone());
        }
        messages
    }

    /// One display frame: analyse what is playing and derive avatar features.
    ///
    /// While the agent is silent the spectrum is not computed and the
    /// features are neutral.
    pub fn render_tick(&self) -> RenderFrame {
        let speaking = self.is_speaking();
        let connected = self.status() == SessionStatus::Connected;

        let mut guard = self.render.lock();
        let render = &mut *guard;

        let features = if speaking {
            if let Some(tap) = render.tap.as_mut() {
                render.analyser.drain(tap);
            }
            let spectrum = render.analyser.compute();
            render.extractor.tick(true, spectrum)
        } else {
            if let Some(tap) = render.tap.as_mut() {
                render.analyser.discard_pending(tap);
            }
            render.analyser.reset();
            render.extractor.tick(false, &[])
        };

        RenderFrame {
            features,
            speaking,
            listening: connected && !speaking,
        }
    }

    /// Stop playback and capture, release both devices, flush the open turn.
    /// Safe to call when nothing is running.
    pub fn end_session(&self) {
        if self.shutdown() {
            self.flush_turn();
            self.set_status(SessionStatus::Disconnected, None);
            info!("session ended");
        }
    }

    /// Like `end_session`, but reports whether anything was running.
    ///
    /// # Errors
    /// `ParleyError::NotRunning` if no session is active.
    pub fn stop(&self) -> Result<()> {
        if !self.is_running() {
            return Err(ParleyError::NotRunning);
        }
        self.end_session();
        Ok(())
    }

    /// Tear down both workers. Returns `true` if either was running.
    fn shutdown(&self) -> bool {
        let capture = self.capture.lock().take();
        let playback = self.playback.lock().take();
        let was_running = capture.is_some() || playback.is_some();

        if let Some(capture) = capture {
            capture.running.store(false, Ordering::Release);
            if capture.thread.join().is_err() {
                warn!("capture thread panicked");
            }
        }

        if let Some(playback) = playback {
            // If the queue is full the loop still exits once the sender drops.
            let _ = playback.commands.try_send(PlaybackCommand::SessionEnd);
            drop(playback.commands);
            if playback.thread.join().is_err() {
                warn!("playback thread panicked");
            }
        }

        self.active_units.store(0, Ordering::Release);
        self.render.lock().tap = None;
        was_running
    }

    pub fn is_running(&self) -> bool {
        self.playback.lock().is_some() || self.capture.lock().is_some()
    }

    /// `true` while any agent audio is queued or playing.
    pub fn is_speaking(&self) -> bool {
        self.active_units.load(Ordering::Acquire) > 0
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Subscribe to finalised conversation messages.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.message_tx.subscribe()
    }

    /// Subscribe to session status changes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Shared handle to the conversation log.
    pub fn conversation_log(&self) -> ConversationLog {
        self.log.clone()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn set_status(&self, new_status: SessionStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(SessionStatusEvent {
            status: new_status,
            detail,
        });
    }
}

impl Drop for ConversationEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
