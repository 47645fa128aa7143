//! Gapless, interruptible playback scheduling.
//!
//! ## Timeline
//!
//! ```text
//! output clock ─────────────────────────────────────────────►
//!               │◄── unit 1 ──►│◄─ unit 2 ─►│      │◄─ unit 3 ─►│
//!               start=now       start=cursor        start=now (idle resume)
//! ```
//!
//! Every accepted chunk starts at `max(cursor, now)` and pushes the cursor
//! forward by its own duration, so units are back to back in arrival order.
//! An interruption stops everything on the device and resets the cursor.
//!
//! A chunk is only registered once the device has accepted it, and the
//! active set never grows past `MAX_ACTIVE_UNITS`. Anything beyond that is
//! dropped and counted like a malformed chunk, so the set always mirrors
//! what the device will actually play.
//!
//! `PlaybackScheduler` has exactly one owner (the playback thread in
//! `engine::playback`); completions from the device are routed back to that
//! owner instead of touching the scheduler from the audio callback.

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tracing::{debug, info, warn};

use crate::audio::{
    output::{end_frame, OutputDevice},
    render::COMMAND_RING_CAPACITY,
    PLAYBACK_SAMPLE_RATE,
};
use crate::codec;
use crate::diagnostics::PipelineDiagnostics;
use crate::error::{ParleyError, Result};

/// Identity of a scheduled unit, unique for the scheduler's lifetime.
pub type UnitId = u64;

/// Most units queued or playing at once.
pub const MAX_ACTIVE_UNITS: usize = COMMAND_RING_CAPACITY;

/// Decoded agent audio pinned to a start time on the output clock.
#[derive(Debug, Clone)]
pub struct ScheduledUnit {
    pub id: UnitId,
    /// Output clock time, in seconds.
    pub start: f64,
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl ScheduledUnit {
    pub fn new(id: UnitId, start: f64, samples: Arc<[f32]>, sample_rate: u32) -> Self {
        Self {
            id,
            start,
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration()
    }
}

pub struct PlaybackScheduler<O: OutputDevice> {
    output: O,
    /// Where the next unit starts. Only moves backwards on interruption.
    cursor: f64,
    active: BTreeMap<UnitId, ScheduledUnit>,
    next_id: UnitId,
    /// Mirrors `active.len()` for readers on other threads.
    active_count: Arc<AtomicUsize>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl<O: OutputDevice> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        Self::with_diagnostics(output, Arc::new(PipelineDiagnostics::default()))
    }

    pub fn with_diagnostics(output: O, diagnostics: Arc<PipelineDiagnostics>) -> Self {
        Self {
            output,
            cursor: 0.0,
            active: BTreeMap::new(),
            next_id: 1,
            active_count: Arc::new(AtomicUsize::new(0)),
            diagnostics,
        }
    }

    /// Publish the active unit count through `count` instead of a private
    /// counter, so the owner of `count` can tell whether the agent is speaking.
    pub fn with_active_count(mut self, count: Arc<AtomicUsize>) -> Self {
        self.active_count = count;
        self.sync_active_count();
        self
    }

    /// Decode a transport chunk and queue it right after everything already
    /// scheduled.
    ///
    /// A malformed chunk, or one the device has no room for, is logged,
    /// counted and rejected. It leaves the cursor and the active set exactly
    /// as they were.
    pub fn on_chunk_received(&mut self, encoded: &str) -> Result<UnitId> {
        PipelineDiagnostics::bump(&self.diagnostics.chunks_received);

        let decoded = codec::decode_chunk(encoded).and_then(|samples| {
            if samples.is_empty() {
                Err(ParleyError::EmptyChunk)
            } else {
                Ok(samples)
            }
        });

        match decoded {
            Ok(samples) => self.schedule_samples(samples.into()),
            Err(e) => {
                PipelineDiagnostics::bump(&self.diagnostics.chunks_dropped);
                warn!(text_len = encoded.len(), "dropping inbound chunk: {e}");
                Err(e)
            }
        }
    }

    /// Queue already-decoded 24 kHz samples.
    ///
    /// # Errors
    /// `ParleyError::OutputBacklog` when `MAX_ACTIVE_UNITS` are already live
    /// or the device refuses the unit.
    pub fn schedule_samples(&mut self, samples: Arc<[f32]>) -> Result<UnitId> {
        if self.active.len() >= MAX_ACTIVE_UNITS {
            return Err(self.refuse(samples.len()));
        }

        let start = self.cursor.max(self.output.now());
        let id = self.next_id;
        self.next_id += 1;

        let unit = ScheduledUnit::new(id, start, samples, PLAYBACK_SAMPLE_RATE);
        if !self.output.start_unit(&unit) {
            return Err(self.refuse(unit.samples.len()));
        }
        self.cursor = unit.end();

        debug!(
            unit_id = id,
            start = unit.start,
            duration = unit.duration(),
            cursor = self.cursor,
            "unit scheduled"
        );

        if self.active.is_empty() {
            info!("agent started speaking");
        }
        self.active.insert(id, unit);
        self.sync_active_count();
        PipelineDiagnostics::bump(&self.diagnostics.chunks_scheduled);
        Ok(id)
    }

    fn refuse(&self, samples: usize) -> ParleyError {
        PipelineDiagnostics::bump(&self.diagnostics.chunks_dropped);
        warn!(
            samples,
            active = self.active.len(),
            "output backlog full, dropping chunk"
        );
        ParleyError::OutputBacklog
    }

    /// Forget a unit the device finished playing.
    ///
    /// Returns `false` for ids that are no longer active, such as a late
    /// completion for a unit an interruption already removed.
    pub fn on_unit_ended(&mut self, id: UnitId) -> bool {
        if self.active.remove(&id).is_none() {
            return false;
        }
        self.after_completions(1);
        true
    }

    /// Forget every unit the output clock has already played past.
    ///
    /// Recovers from completion notices that never arrived. Returns how many
    /// units were removed.
    pub fn reap_finished(&mut self) -> usize {
        let played = self.output.played_frames();
        let rate = self.output.sample_rate();
        let before = self.active.len();
        self.active.retain(|_, unit| end_frame(unit, rate) > played);
        let reaped = before - self.active.len();
        if reaped > 0 {
            debug!(reaped, "reaped units without a completion notice");
            self.after_completions(reaped);
        }
        reaped
    }

    fn after_completions(&self, n: usize) {
        for _ in 0..n {
            PipelineDiagnostics::bump(&self.diagnostics.units_completed);
        }
        self.sync_active_count();
        if self.active.is_empty() {
            info!("agent finished speaking");
        }
    }

    /// Hard cut: silence the device, forget every unit, rewind the cursor.
    pub fn on_interrupted(&mut self) {
        let dropped = self.active.len();
        self.stop_everything();
        PipelineDiagnostics::bump(&self.diagnostics.interruptions);
        info!(dropped_units = dropped, "playback interrupted");
    }

    /// Interruption plus release of the output device.
    pub fn on_session_end(&mut self) {
        self.stop_everything();
        self.output.close();
        info!("playback session ended");
    }

    fn stop_everything(&mut self) {
        self.output.stop_all();
        self.active.clear();
        self.cursor = 0.0;
        self.sync_active_count();
    }

    fn sync_active_count(&self) {
        self.active_count.store(self.active.len(), Ordering::Release);
    }

    /// `true` while any unit is queued or playing.
    pub fn is_speaking(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Ids of every live unit, oldest first.
    pub fn active_ids(&self) -> Vec<UnitId> {
        self.active.keys().copied().collect()
    }

    /// Shared view of the active unit count, for "speaking" checks on
    /// threads that do not own the scheduler.
    pub fn active_count_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_count)
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::VirtualOutput;
    use approx::assert_relative_eq;

    fn chunk(seconds: f64) -> String {
        let len = (seconds * PLAYBACK_SAMPLE_RATE as f64).round() as usize;
        codec::encode_chunk(&vec![0.25f32; len])
    }

    fn scheduler() -> (PlaybackScheduler<VirtualOutput>, VirtualOutput) {
        let out = VirtualOutput::new(PLAYBACK_SAMPLE_RATE);
        (PlaybackScheduler::new(out.clone()), out)
    }

    #[test]
    fn consecutive_chunks_play_back_to_back_in_arrival_order() {
        let (mut sched, out) = scheduler();
        out.advance(1.0);

        let a = sched.on_chunk_received(&chunk(0.5)).unwrap();
        let b = sched.on_chunk_received(&chunk(0.3)).unwrap();

        let started = out.started();
        assert_eq!(started.iter().map(|u| u.id).collect::<Vec<_>>(), vec![a, b]);
        assert_relative_eq!(started[0].start, 1.0);
        assert_relative_eq!(started[1].start, 1.5, epsilon = 1e-9);
        assert_relative_eq!(started[0].end, started[1].start, epsilon = 1e-9);
        assert_relative_eq!(sched.cursor(), 1.8, epsilon = 1e-9);
        assert!(sched.is_speaking());
    }

    #[test]
    fn idle_scheduler_resumes_at_clock_not_stale_cursor() {
        let (mut sched, out) = scheduler();
        let a = sched.on_chunk_received(&chunk(0.5)).unwrap();

        let adv = out.advance(2.0);
        assert_eq!(adv.finished, vec![a]);
        assert!(sched.on_unit_ended(a));
        assert!(!sched.is_speaking());

        sched.on_chunk_received(&chunk(0.1)).unwrap();
        assert_relative_eq!(out.started()[1].start, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn interruption_stops_everything_and_restarts_from_now() {
        let (mut sched, out) = scheduler();
        sched.on_chunk_received(&chunk(0.5)).unwrap();
        sched.on_chunk_received(&chunk(0.3)).unwrap();
        out.advance(0.2);

        sched.on_interrupted();
        assert_eq!(sched.active_len(), 0);
        assert!(!sched.is_speaking());
        assert_eq!(sched.cursor(), 0.0);
        assert_eq!(out.stop_all_calls(), 1);

        let silent = out.advance(0.1);
        assert!(silent.samples.iter().all(|s| *s == 0.0));
        assert!(silent.finished.is_empty());

        sched.on_chunk_received(&chunk(0.2)).unwrap();
        let last = *out.started().last().unwrap();
        assert_relative_eq!(last.start, 0.3, epsilon = 1e-9);
    }

    #[test]
    fn malformed_chunks_leave_state_untouched() {
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let out = VirtualOutput::new(PLAYBACK_SAMPLE_RATE);
        let mut sched = PlaybackScheduler::with_diagnostics(out.clone(), Arc::clone(&diagnostics));
        sched.on_chunk_received(&chunk(0.5)).unwrap();
        let cursor = sched.cursor();

        let odd = codec::encode_transport(&[1, 2, 3]);
        let err = sched.on_chunk_received(&odd).unwrap_err();
        assert!(matches!(err, ParleyError::OddLengthChunk { len: 3 }));
        assert!(sched.on_chunk_received("not*base64!").unwrap_err().is_malformed_input());
        assert!(matches!(
            sched.on_chunk_received("").unwrap_err(),
            ParleyError::EmptyChunk
        ));

        assert_eq!(sched.cursor(), cursor);
        assert_eq!(sched.active_len(), 1);
        assert_eq!(out.started().len(), 1);

        let snap = diagnostics.snapshot();
        assert_eq!(snap.chunks_received, 4);
        assert_eq!(snap.chunks_scheduled, 1);
        assert_eq!(snap.chunks_dropped, 3);
    }

    #[test]
    fn late_completion_after_interrupt_is_ignored() {
        let (mut sched, _out) = scheduler();
        let a = sched.on_chunk_received(&chunk(0.1)).unwrap();
        sched.on_interrupted();
        assert!(!sched.on_unit_ended(a));
        assert_eq!(sched.active_len(), 0);
    }

    #[test]
    fn session_end_stops_and_closes_output() {
        let (mut sched, out) = scheduler();
        sched.on_chunk_received(&chunk(0.1)).unwrap();
        sched.on_session_end();
        assert!(out.is_closed());
        assert_eq!(out.stop_all_calls(), 1);
        assert_eq!(sched.active_len(), 0);
    }

    #[test]
    fn active_count_handle_tracks_active_set() {
        let (mut sched, out) = scheduler();
        let handle = sched.active_count_handle();
        let a = sched.on_chunk_received(&chunk(0.05)).unwrap();
        let b = sched.on_chunk_received(&chunk(0.05)).unwrap();
        assert_eq!(handle.load(Ordering::Acquire), 2);
        assert_eq!(sched.active_ids(), vec![a, b]);

        for id in out.advance(0.2).finished {
            sched.on_unit_ended(id);
        }
        assert_eq!(handle.load(Ordering::Acquire), 0);
    }

    #[test]
    fn refused_chunks_are_not_registered() {
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let out = VirtualOutput::new(PLAYBACK_SAMPLE_RATE);
        let mut sched = PlaybackScheduler::with_diagnostics(out.clone(), Arc::clone(&diagnostics));
        let ten_ms = chunk(0.01);

        for _ in 0..1100 {
            let _ = sched.on_chunk_received(&ten_ms);
        }
        assert_eq!(sched.active_len(), MAX_ACTIVE_UNITS);
        assert_relative_eq!(sched.cursor(), MAX_ACTIVE_UNITS as f64 * 0.01, epsilon = 1e-6);
        assert_eq!(diagnostics.snapshot().chunks_dropped, 1100 - MAX_ACTIVE_UNITS);

        for id in out.advance(30.0).finished {
            sched.on_unit_ended(id);
        }
        assert_eq!(sched.active_len(), 0);
        assert!(!sched.is_speaking());
    }

    #[test]
    fn interruption_silences_a_full_render_queue() {
        let (mut sched, out) = scheduler();
        let ten_ms = chunk(0.01);
        for _ in 0..MAX_ACTIVE_UNITS {
            sched.on_chunk_received(&ten_ms).unwrap();
        }

        sched.on_interrupted();
        let after = out.advance(0.1);
        assert!(after.samples.iter().all(|s| *s == 0.0));
        assert!(after.finished.is_empty());
    }

    #[test]
    fn device_refusal_leaves_cursor_and_active_set_alone() {
        let (mut sched, out) = scheduler();
        let ten_ms = chunk(0.01);
        for _ in 0..MAX_ACTIVE_UNITS {
            sched.on_chunk_received(&ten_ms).unwrap();
        }
        // The stale units still fill the render queue until the next block.
        sched.on_interrupted();
        let err = sched.on_chunk_received(&ten_ms).unwrap_err();
        assert!(matches!(err, ParleyError::OutputBacklog));
        assert_eq!(sched.active_len(), 0);
        assert_eq!(sched.cursor(), 0.0);

        out.advance_frames(1);
        let id = sched.on_chunk_received(&ten_ms).unwrap();
        assert_eq!(sched.active_ids(), vec![id]);
    }

    #[test]
    fn lost_completions_are_reaped_from_the_clock() {
        let (mut sched, out) = scheduler();
        let a = sched.on_chunk_received(&chunk(0.1)).unwrap();
        sched.on_chunk_received(&chunk(0.1)).unwrap();
        sched.on_chunk_received(&chunk(0.5)).unwrap();

        let adv = out.advance(0.25);
        assert_eq!(adv.finished.len(), 2);
        // Only the first notice makes it through.
        assert!(sched.on_unit_ended(a));
        assert_eq!(sched.reap_finished(), 1);
        assert_eq!(sched.active_len(), 1);
        assert!(sched.is_speaking());

        out.advance(1.0);
        assert_eq!(sched.reap_finished(), 1);
        assert!(!sched.is_speaking());
        assert_eq!(sched.active_count_handle().load(Ordering::Acquire), 0);
    }
}
