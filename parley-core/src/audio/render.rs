//! Sample-exact playback timeline renderer.
//!
//! The renderer owns the device-side view of every scheduled unit and the
//! output clock. It is driven by whoever pulls audio: the cpal output
//! callback in production, `VirtualOutput::advance` in tests.
//!
//! ```text
//! scheduler ──RenderUnit (SPSC)──► Renderer::render(frames)
//!           ──stop epoch (atomic)─┘   │  mixes units covering [clock, clock+frames)
//!                                     ├─► device buffer
//!                                     ├─► tap ring (spectrum analyser)
//!                                     └─► CompletionNotifier(unit_id) when end ≤ clock
//! ```
//!
//! A stop never travels through the ring, so it cannot be lost to a full
//! ring. Each unit carries the stop epoch current when it was queued, and
//! the renderer discards every unit older than the latest epoch at the
//! start of each block.
//!
//! Nothing here locks or performs I/O. `render` only allocates if a block is
//! larger than any block seen before.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ringbuf::{traits::Split, HeapRb};

use crate::buffering::{Consumer, Producer, TapProducer};
use crate::playback::UnitId;

/// Called from the render thread once per unit that played to its end.
/// Must not block.
pub type CompletionNotifier = Box<dyn FnMut(UnitId) + Send>;

pub type CommandProducer = ringbuf::HeapProd<RenderUnit>;
pub type CommandConsumer = ringbuf::HeapCons<RenderUnit>;

/// Units queued between two render calls. A render call drains all of them.
pub const COMMAND_RING_CAPACITY: usize = 1024;

/// Units the renderer can hold without reallocating: a full ring of fresh
/// units on top of a full set from before a stop it has not seen yet.
pub const MAX_RENDER_UNITS: usize = 2 * COMMAND_RING_CAPACITY;

/// Largest block pre-allocated for the mix buffer (frames).
const INITIAL_MIX_CAPACITY: usize = 8192;

pub fn create_command_ring() -> (CommandProducer, CommandConsumer) {
    HeapRb::<RenderUnit>::new(COMMAND_RING_CAPACITY).split()
}

/// Decoded audio pinned to a start frame on the output clock.
#[derive(Debug, Clone)]
pub struct RenderUnit {
    pub id: UnitId,
    pub start_frame: u64,
    pub samples: Arc<[f32]>,
    /// Stop epoch at the time the unit was queued.
    pub epoch: u64,
}

impl RenderUnit {
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Output clock and stop epoch shared between the renderer and the
/// scheduler thread.
#[derive(Debug, Default)]
pub struct RenderClock {
    /// Frames rendered so far.
    frames: AtomicU64,
    /// Size of the most recent render block, in frames.
    last_block: AtomicU64,
    /// Bumped once per hard stop.
    stop_epoch: AtomicU64,
}

impl RenderClock {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn last_block(&self) -> u64 {
        self.last_block.load(Ordering::Acquire)
    }

    pub fn stop_epoch(&self) -> u64 {
        self.stop_epoch.load(Ordering::Acquire)
    }

    /// Silence everything queued so far, from the next block on.
    pub fn request_stop(&self) {
        self.stop_epoch.fetch_add(1, Ordering::AcqRel);
    }
}

/// Queue `unit` for the renderer. `false` when the ring is full; the unit
/// is then never played.
pub fn queue_unit(commands: &mut CommandProducer, unit: RenderUnit) -> bool {
    commands.try_push(unit).is_ok()
}

pub struct Renderer {
    commands: CommandConsumer,
    units: Vec<RenderUnit>,
    clock: Arc<RenderClock>,
    tap: Option<TapProducer>,
    notifier: Option<CompletionNotifier>,
    mix: Vec<f32>,
    finished: Vec<UnitId>,
}

impl Renderer {
    pub fn new(commands: CommandConsumer, clock: Arc<RenderClock>) -> Self {
        Self {
            commands,
            units: Vec::with_capacity(MAX_RENDER_UNITS),
            clock,
            tap: None,
            notifier: None,
            mix: Vec::with_capacity(INITIAL_MIX_CAPACITY),
            finished: Vec::with_capacity(MAX_RENDER_UNITS),
        }
    }

    pub fn set_tap(&mut self, tap: TapProducer) {
        self.tap = Some(tap);
    }

    pub fn set_notifier(&mut self, notifier: CompletionNotifier) {
        self.notifier = Some(notifier);
    }

    fn apply_commands(&mut self) {
        let epoch = self.clock.stop_epoch();
        self.units.retain(|unit| unit.epoch >= epoch);

        while let Some(unit) = self.commands.try_pop() {
            if unit.epoch < epoch {
                continue;
            }
            // Never grow inside the callback. The scheduler caps its own
            // active set well below this, so it only trips on misuse.
            if self.units.len() == self.units.capacity() {
                continue;
            }
            self.units.push(unit);
        }
    }

    /// Render the next `frames` mono samples and advance the clock.
    pub fn render(&mut self, frames: usize) -> &[f32] {
        self.apply_commands();
        self.finished.clear();

        let block_start = self.clock.frames.load(Ordering::Relaxed);
        let block_end = block_start + frames as u64;

        self.mix.clear();
        self.mix.resize(frames, 0.0);

        for unit in &self.units {
            let from = unit.start_frame.max(block_start);
            let to = unit.end_frame().min(block_end);
            if from >= to {
                continue;
            }
            let src = &unit.samples[(from - unit.start_frame) as usize..(to - unit.start_frame) as usize];
            let dst = &mut self.mix[(from - block_start) as usize..(to - block_start) as usize];
            for (out, sample) in dst.iter_mut().zip(src) {
                *out += *sample;
            }
        }

        // Published before any completion goes out, so a reader that sees a
        // completion also sees a clock past that unit's end.
        self.clock.frames.store(block_end, Ordering::Release);
        self.clock.last_block.store(frames as u64, Ordering::Release);

        if let Some(tap) = self.tap.as_mut() {
            // Overflow only means the analyser is not reading; drop silently.
            let _ = tap.push_slice(&self.mix);
        }

        let finished = &mut self.finished;
        self.units.retain(|unit| {
            if unit.end_frame() <= block_end {
                finished.push(unit.id);
                false
            } else {
                true
            }
        });
        if let Some(notify) = self.notifier.as_mut() {
            for id in &self.finished {
                notify(*id);
            }
        }

        &self.mix
    }

    /// Units that reached their end during the last `render` call.
    pub fn last_finished(&self) -> &[UnitId] {
        &self.finished
    }

    /// Units the renderer currently holds (after the last command drain).
    pub fn pending_units(&self) -> usize {
        self.units.len()
    }
}
