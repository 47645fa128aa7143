//! Playback thread: the single owner of the `PlaybackScheduler`.
//!
//! ## Inputs
//!
//! ```text
//! handle_event ──PlaybackCommand (bounded, FIFO)──┐
//!                                                 ├─► select! ─► PlaybackScheduler
//! render callback ──UnitId (bounded, try_send)────┘
//! ```
//!
//! Completions are sent with `try_send`, so one can be lost when the queue
//! is full. Each time the queue drains, the loop reaps every unit the
//! output clock has played past, which covers any notice that was lost.
//!
//! Interruptions also bump a shared generation counter the moment they are
//! received. Before acting on any command the loop catches up with that
//! counter, so an interruption always lands before chunks queued behind it,
//! and chunks stamped with an older generation are discarded unplayed.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::{never, select, Receiver};
use tracing::{debug, info};

use crate::audio::output::OutputDevice;
use crate::playback::{PlaybackScheduler, UnitId};

/// Finished-unit notifications buffered between the render callback and the
/// playback thread.
pub const COMPLETION_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum PlaybackCommand {
    /// Transport text of one agent chunk, stamped with the interrupt
    /// generation current when it arrived.
    Chunk { data: String, generation: u64 },
    /// Wake-up after the generation counter moved.
    Interrupted,
    /// Stop everything, release the device and exit the loop.
    SessionEnd,
}

pub struct PlaybackContext<O: OutputDevice> {
    pub scheduler: PlaybackScheduler<O>,
    pub commands: Receiver<PlaybackCommand>,
    pub completions: Receiver<UnitId>,
    /// Starts at zero for each session.
    pub generation: Arc<AtomicU64>,
}

/// Run until `SessionEnd` arrives or every command sender is gone.
pub fn run<O: OutputDevice>(ctx: PlaybackContext<O>) {
    let PlaybackContext {
        mut scheduler,
        commands,
        mut completions,
        generation,
    } = ctx;
    let mut applied = 0;

    info!("playback loop started");

    loop {
        select! {
            recv(commands) -> cmd => {
                let Ok(cmd) = cmd else {
                    scheduler.on_session_end();
                    break;
                };

                let current = generation.load(Ordering::Acquire);
                if current > applied {
                    scheduler.on_interrupted();
                    applied = current;
                }

                match cmd {
                    PlaybackCommand::Chunk { data, generation: stamp } => {
                        if stamp < applied {
                            debug!(stamp, applied, "discarding chunk from before interruption");
                            continue;
                        }
                        // Malformed chunks are logged and counted by the scheduler.
                        let _ = scheduler.on_chunk_received(&data);
                    }
                    PlaybackCommand::Interrupted => {}
                    PlaybackCommand::SessionEnd => {
                        scheduler.on_session_end();
                        break;
                    }
                }
            }
            recv(completions) -> id => match id {
                Ok(id) => {
                    scheduler.on_unit_ended(id);
                    if completions.is_empty() {
                        scheduler.reap_finished();
                    }
                }
                // The device is gone; keep serving commands until told to stop.
                Err(_) => completions = never(),
            },
        }
    }

    info!("playback loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::{OutputWiring, VirtualOutput};
    use crate::audio::PLAYBACK_SAMPLE_RATE;
    use crate::codec::encode_chunk;
    use crossbeam_channel::bounded;

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        cond()
    }

    struct Harness {
        out: VirtualOutput,
        commands: crossbeam_channel::Sender<PlaybackCommand>,
        generation: Arc<AtomicU64>,
        thread: std::thread::JoinHandle<()>,
    }

    fn spawn() -> Harness {
        let out = VirtualOutput::new(PLAYBACK_SAMPLE_RATE);
        let (done_tx, done_rx) = bounded(COMPLETION_QUEUE_CAPACITY);
        out.attach(OutputWiring {
            notifier: Box::new(move |id| {
                let _ = done_tx.try_send(id);
            }),
            tap: None,
        });
        let (commands, rx) = bounded(64);
        let generation = Arc::new(AtomicU64::new(0));
        let ctx = PlaybackContext {
            scheduler: PlaybackScheduler::new(out.clone()),
            commands: rx,
            completions: done_rx,
            generation: Arc::clone(&generation),
        };
        let thread = std::thread::spawn(move || run(ctx));
        Harness {
            out,
            commands,
            generation,
            thread,
        }
    }

    fn chunk(samples: usize, generation: u64) -> PlaybackCommand {
        PlaybackCommand::Chunk {
            data: encode_chunk(&vec![0.5; samples]),
            generation,
        }
    }

    #[test]
    fn stale_chunks_behind_an_interrupt_are_discarded() {
        let h = spawn();
        // Bump before the loop sees any of these, as handle_event would.
        h.generation.store(1, Ordering::Release);
        h.commands.send(chunk(240, 0)).unwrap();
        h.commands.send(PlaybackCommand::Interrupted).unwrap();
        h.commands.send(chunk(240, 1)).unwrap();
        h.commands.send(PlaybackCommand::SessionEnd).unwrap();
        h.thread.join().unwrap();

        let started = h.out.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].start, 0.0);
        // One stop for the interrupt, one for the session end.
        assert_eq!(h.out.stop_all_calls(), 2);
        assert!(h.out.is_closed());
    }

    #[test]
    fn dropping_the_sender_ends_the_session() {
        let h = spawn();
        h.commands.send(chunk(240, 0)).unwrap();
        drop(h.commands);
        h.thread.join().unwrap();
        assert_eq!(h.out.started().len(), 1);
        assert!(h.out.is_closed());
    }

    #[test]
    fn units_whose_completion_was_lost_still_end() {
        let out = VirtualOutput::new(PLAYBACK_SAMPLE_RATE);
        // Room for a single notice: the rest of the burst is refused.
        let (done_tx, done_rx) = bounded(1);
        out.attach(OutputWiring {
            notifier: Box::new(move |id| {
                let _ = done_tx.try_send(id);
            }),
            tap: None,
        });
        let (commands, rx) = bounded(64);
        let scheduler = PlaybackScheduler::new(out.clone());
        let active = scheduler.active_count_handle();
        let ctx = PlaybackContext {
            scheduler,
            commands: rx,
            completions: done_rx,
            generation: Arc::new(AtomicU64::new(0)),
        };
        let thread = std::thread::spawn(move || run(ctx));

        for _ in 0..3 {
            commands.send(chunk(240, 0)).unwrap();
        }
        assert!(wait_until(|| active.load(Ordering::Acquire) == 3));

        let adv = out.advance(0.1);
        assert_eq!(adv.finished.len(), 3);
        assert!(wait_until(|| active.load(Ordering::Acquire) == 0));

        drop(commands);
        thread.join().unwrap();
    }
}
