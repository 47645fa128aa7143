//! Lock-free pipeline counters.
//!
//! Incremented from the capture worker and the playback thread, read from
//! anywhere via `snapshot()`. Relaxed ordering is enough: the values are
//! independent tallies, never used for synchronisation.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub frames_captured: AtomicUsize,
    pub frames_encoded: AtomicUsize,
    /// Encoded frames the outbound sink refused.
    pub frames_dropped: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub chunks_scheduled: AtomicUsize,
    /// Inbound chunks rejected as malformed.
    pub chunks_dropped: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub units_completed: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.frames_encoded.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.chunks_received.store(0, Ordering::Relaxed);
        self.chunks_scheduled.store(0, Ordering::Relaxed);
        self.chunks_dropped.store(0, Ordering::Relaxed);
        self.interruptions.store(0, Ordering::Relaxed);
        self.units_completed.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            units_completed: self.units_completed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_captured: usize,
    pub frames_encoded: usize,
    pub frames_dropped: usize,
    pub chunks_received: usize,
    pub chunks_scheduled: usize,
    pub chunks_dropped: usize,
    pub interruptions: usize,
    pub units_completed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_zeroes_every_counter() {
        let diag = PipelineDiagnostics::default();
        PipelineDiagnostics::bump(&diag.frames_captured);
        PipelineDiagnostics::bump(&diag.chunks_dropped);
        assert_eq!(diag.snapshot().frames_captured, 1);
        assert_eq!(diag.snapshot().chunks_dropped, 1);

        diag.reset();
        assert_eq!(diag.snapshot(), DiagnosticsSnapshot::default());
    }
}
