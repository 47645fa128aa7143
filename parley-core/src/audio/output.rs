//! Output device abstraction used by the playback scheduler.
//!
//! The scheduler only needs three things from a speaker: a clock, a way to
//! start a unit at a given time, and a way to silence everything. Keeping
//! that behind `OutputDevice` lets the scheduler run against `CpalOutput`
//! in production and `VirtualOutput` in tests or headless runs.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::render::{
    create_command_ring, queue_unit, CommandProducer, CompletionNotifier, RenderClock,
    RenderUnit, Renderer,
};
use crate::buffering::TapProducer;
use crate::playback::{ScheduledUnit, UnitId};

/// Contract between the playback scheduler and a speaker.
///
/// Not `Send`: real devices are bound to the thread that opened them.
pub trait OutputDevice {
    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Current output clock time in seconds. Never decreases.
    fn now(&self) -> f64;

    /// Frames the device has actually rendered. Any unit whose last frame
    /// lies below this has finished or was stopped.
    fn played_frames(&self) -> u64;

    /// Queue `unit` to start at `unit.start` on the output clock.
    ///
    /// Returns `false` if the device cannot take the unit right now. A
    /// refused unit is never played.
    fn start_unit(&mut self, unit: &ScheduledUnit) -> bool;

    /// Silence every queued or playing unit immediately. Cannot fail.
    fn stop_all(&mut self);

    /// Release the underlying device. Later calls are no-ops.
    fn close(&mut self) {}
}

/// Connections a device needs back into the engine.
pub struct OutputWiring {
    /// Told about each unit that played to its end.
    pub notifier: CompletionNotifier,
    /// Receives a copy of the rendered signal for spectrum analysis.
    pub tap: Option<TapProducer>,
}

/// Nearest output frame for a time in seconds.
pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> u64 {
    (seconds * sample_rate as f64).round().max(0.0) as u64
}

/// Output frame one past the last sample of `unit`.
pub fn end_frame(unit: &ScheduledUnit, sample_rate: u32) -> u64 {
    seconds_to_frames(unit.start, sample_rate) + unit.samples.len() as u64
}

/// Hand `unit` to the renderer behind `commands`, tagged with the clock's
/// current stop epoch.
pub(crate) fn submit_unit(
    commands: &mut CommandProducer,
    clock: &RenderClock,
    unit: &ScheduledUnit,
    sample_rate: u32,
) -> bool {
    let render = RenderUnit {
        id: unit.id,
        start_frame: seconds_to_frames(unit.start, sample_rate),
        samples: Arc::clone(&unit.samples),
        epoch: clock.stop_epoch(),
    };
    let queued = queue_unit(commands, render);
    if !queued {
        warn!(unit_id = unit.id, "render queue full, unit refused");
    }
    queued
}

/// What a unit looked like when the scheduler started it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitRecord {
    pub id: UnitId,
    pub start: f64,
    pub end: f64,
}

/// Result of advancing a `VirtualOutput`.
#[derive(Debug, Clone, Default)]
pub struct Advance {
    /// Mono samples rendered during the advance.
    pub samples: Vec<f32>,
    /// Units that played to their end during the advance.
    pub finished: Vec<UnitId>,
}

struct VirtualInner {
    renderer: Renderer,
    commands: CommandProducer,
    started: Vec<UnitRecord>,
    stop_all_calls: usize,
    closed: bool,
}

/// Device-free output whose clock only moves when `advance` is called.
///
/// Cloning yields another handle to the same device, so a test can keep one
/// handle while the scheduler owns the other.
#[derive(Clone)]
pub struct VirtualOutput {
    inner: Arc<Mutex<VirtualInner>>,
    clock: Arc<RenderClock>,
    sample_rate: u32,
}

impl VirtualOutput {
    pub fn new(sample_rate: u32) -> Self {
        let (commands, consumer) = create_command_ring();
        let clock = Arc::new(RenderClock::default());
        let renderer = Renderer::new(consumer, Arc::clone(&clock));
        Self {
            inner: Arc::new(Mutex::new(VirtualInner {
                renderer,
                commands,
                started: Vec::new(),
                stop_all_calls: 0,
                closed: false,
            })),
            clock,
            sample_rate,
        }
    }

    /// Install the engine's completion notifier and analyser tap.
    pub fn attach(&self, wiring: OutputWiring) {
        let mut inner = self.inner.lock();
        inner.renderer.set_notifier(wiring.notifier);
        if let Some(tap) = wiring.tap {
            inner.renderer.set_tap(tap);
        }
    }

    /// Render `seconds` of output, moving the clock forward.
    pub fn advance(&self, seconds: f64) -> Advance {
        self.advance_frames(seconds_to_frames(seconds, self.sample_rate) as usize)
    }

    pub fn advance_frames(&self, frames: usize) -> Advance {
        let mut inner = self.inner.lock();
        let samples = inner.renderer.render(frames).to_vec();
        Advance {
            samples,
            finished: inner.renderer.last_finished().to_vec(),
        }
    }

    /// Every unit started so far, in the order the scheduler started them.
    pub fn started(&self) -> Vec<UnitRecord> {
        self.inner.lock().started.clone()
    }

    pub fn stop_all_calls(&self) -> usize {
        self.inner.lock().stop_all_calls
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Output clock in frames.
    pub fn frames(&self) -> u64 {
        self.clock.frames()
    }
}

impl OutputDevice for VirtualOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> f64 {
        self.clock.frames() as f64 / self.sample_rate as f64
    }

    fn played_frames(&self) -> u64 {
        self.clock.frames()
    }

    fn start_unit(&mut self, unit: &ScheduledUnit) -> bool {
        let mut inner = self.inner.lock();
        if !submit_unit(&mut inner.commands, &self.clock, unit, self.sample_rate) {
            return false;
        }
        inner.started.push(UnitRecord {
            id: unit.id,
            start: unit.start,
            end: unit.end(),
        });
        true
    }

    fn stop_all(&mut self) {
        self.clock.request_stop();
        self.inner.lock().stop_all_calls += 1;
    }

    fn close(&mut self) {
        self.inner.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::render::COMMAND_RING_CAPACITY;

    fn scheduled(id: UnitId, start: f64, len: usize) -> ScheduledUnit {
        ScheduledUnit::new(id, start, Arc::from(vec![0.5f32; len]), 24_000)
    }

    #[test]
    fn seconds_round_to_nearest_frame() {
        assert_eq!(seconds_to_frames(0.5, 24_000), 12_000);
        assert_eq!(seconds_to_frames(0.5 + 0.3, 24_000), 19_200);
        assert_eq!(seconds_to_frames(-1.0, 24_000), 0);
    }

    #[test]
    fn virtual_clock_moves_only_on_advance() {
        let out = VirtualOutput::new(24_000);
        assert_eq!(out.now(), 0.0);
        out.advance(0.25);
        assert!((out.now() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn virtual_output_renders_started_units_and_reports_finish() {
        let mut out = VirtualOutput::new(24_000);
        assert!(out.start_unit(&scheduled(1, 0.0, 2_400)));

        let first = out.advance(0.05);
        assert!(first.samples.iter().all(|s| *s == 0.5));
        assert!(first.finished.is_empty());

        let second = out.advance(0.1);
        assert_eq!(second.finished, vec![1]);
        assert_eq!(out.started()[0].id, 1);
    }

    #[test]
    fn stop_all_is_counted_and_silences() {
        let mut out = VirtualOutput::new(24_000);
        assert!(out.start_unit(&scheduled(1, 0.0, 24_000)));
        out.stop_all();
        let adv = out.advance(0.1);
        assert!(adv.samples.iter().all(|s| *s == 0.0));
        assert_eq!(out.stop_all_calls(), 1);
    }

    #[test]
    fn full_render_queue_refuses_units_until_drained() {
        let mut out = VirtualOutput::new(24_000);
        for id in 0..COMMAND_RING_CAPACITY as u64 {
            assert!(out.start_unit(&scheduled(id, 10.0, 24)));
        }
        assert!(!out.start_unit(&scheduled(9_999, 10.0, 24)));
        assert_eq!(out.started().len(), COMMAND_RING_CAPACITY);

        out.advance_frames(1);
        assert!(out.start_unit(&scheduled(10_000, 10.0, 24)));
    }

    #[test]
    fn end_frame_matches_rendered_length() {
        let unit = scheduled(1, 0.5, 2_400);
        assert_eq!(end_frame(&unit, 24_000), 14_400);
    }
}
