//! End-to-end session behaviour with a virtual speaker in place of cpal.

use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use parley_core::audio::PLAYBACK_SAMPLE_RATE;
use parley_core::codec::encode_chunk;
use parley_core::{
    ConversationEngine, EngineConfig, FeatureSnapshot, ParleyError, Role, ServerEvent,
    SessionStatus, VirtualOutput,
};
use tokio::sync::broadcast::error::TryRecvError;

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn started_engine() -> (ConversationEngine, VirtualOutput) {
    let engine = ConversationEngine::new(EngineConfig::default());
    let out = VirtualOutput::new(PLAYBACK_SAMPLE_RATE);
    let device = out.clone();
    engine
        .start_playback_with(move |wiring| {
            device.attach(wiring);
            Ok(device)
        })
        .expect("virtual playback should start");
    (engine, out)
}

fn audio(seconds: f64, level: f32) -> ServerEvent {
    let len = (seconds * PLAYBACK_SAMPLE_RATE as f64).round() as usize;
    ServerEvent::AudioChunk {
        data: encode_chunk(&vec![level; len]),
    }
}

fn tone(seconds: f64, hz: f32) -> ServerEvent {
    let len = (seconds * PLAYBACK_SAMPLE_RATE as f64).round() as usize;
    let samples: Vec<f32> = (0..len)
        .map(|i| {
            0.5 * (2.0 * std::f32::consts::PI * hz * i as f32 / PLAYBACK_SAMPLE_RATE as f32).sin()
        })
        .collect();
    ServerEvent::AudioChunk {
        data: encode_chunk(&samples),
    }
}

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn chunks_play_back_to_back_and_speaking_follows_completion() {
    let (engine, out) = started_engine();
    assert_eq!(engine.status(), SessionStatus::Connected);

    engine.handle_event(audio(0.5, 0.2)).unwrap();
    engine.handle_event(audio(0.3, 0.2)).unwrap();
    assert!(wait_until(WAIT, || {
        engine.diagnostics_snapshot().chunks_scheduled == 2
    }));

    let started = out.started();
    assert_relative_eq!(started[0].start, 0.0);
    assert_relative_eq!(started[1].start, 0.5, epsilon = 1e-9);
    assert!(engine.is_speaking());
    assert!(engine.render_tick().speaking);

    out.advance(1.0);
    assert!(wait_until(WAIT, || !engine.is_speaking()));

    let frame = engine.render_tick();
    assert_eq!(frame.features, FeatureSnapshot::NEUTRAL);
    assert!(frame.listening);
    assert_eq!(frame.avatar_scale(), 1.0);

    assert_eq!(engine.diagnostics_snapshot().units_completed, 2);
}

#[test]
fn interruption_cuts_playback_and_next_chunk_starts_now() {
    let (engine, out) = started_engine();
    engine.handle_event(audio(1.0, 0.4)).unwrap();
    assert!(wait_until(WAIT, || out.started().len() == 1));
    out.advance(0.25);

    engine.handle_event(ServerEvent::Interrupted).unwrap();
    engine.handle_event(audio(0.2, 0.4)).unwrap();
    assert!(wait_until(WAIT, || out.started().len() == 2));

    assert_eq!(out.stop_all_calls(), 1);
    assert_relative_eq!(out.started()[1].start, 0.25, epsilon = 1e-9);
    assert_eq!(engine.diagnostics_snapshot().interruptions, 1);

    // Only the post-interruption unit is left to finish.
    let rest = out.advance(0.5);
    assert_eq!(rest.finished, vec![out.started()[1].id]);
}

#[test]
fn malformed_chunk_is_dropped_without_disturbing_playback() {
    let (engine, out) = started_engine();
    engine
        .handle_event(ServerEvent::AudioChunk {
            data: "%%not base64%%".into(),
        })
        .unwrap();
    engine.handle_event(audio(0.1, 0.2)).unwrap();
    assert!(wait_until(WAIT, || out.started().len() == 1));

    let diag = engine.diagnostics_snapshot();
    assert_eq!(diag.chunks_received, 2);
    assert_eq!(diag.chunks_dropped, 1);
    assert_relative_eq!(out.started()[0].start, 0.0);
}

#[test]
fn render_tick_reports_spectrum_of_playing_audio() {
    let (engine, out) = started_engine();
    engine.handle_event(tone(0.5, 1_000.0)).unwrap();
    assert!(wait_until(WAIT, || engine.is_speaking()));

    out.advance(0.1);
    let frame = engine.render_tick();
    assert!(frame.speaking);
    assert!(!frame.listening);
    // 1 kHz lands around bin 21 of 256 at 24 kHz: the mid band.
    assert!(frame.features.mid > 0.0, "{:?}", frame.features);
    assert!(frame.features.energy > 0.0);
    assert!(frame.avatar_scale() > 1.0);
}

#[test]
fn turn_complete_publishes_user_then_agent_message() {
    let (engine, _out) = started_engine();
    let mut messages = engine.subscribe_messages();

    engine
        .handle_event(ServerEvent::InputTranscription { text: "hi".into() })
        .unwrap();
    engine
        .handle_event(ServerEvent::OutputTranscription {
            text: "hello".into(),
        })
        .unwrap();
    engine.handle_event(ServerEvent::TurnComplete).unwrap();

    let first = messages.try_recv().expect("user message");
    let second = messages.try_recv().expect("agent message");
    assert_eq!((first.sender, first.text.as_str()), (Role::User, "hi"));
    assert_eq!((second.sender, second.text.as_str()), (Role::Agent, "hello"));
    assert!(matches!(messages.try_recv(), Err(TryRecvError::Empty)));

    let log = engine.conversation_log().snapshot();
    assert_eq!(log, vec![first, second]);
}

#[test]
fn session_closed_releases_output_and_rejects_audio() {
    let (engine, out) = started_engine();
    let mut status = engine.subscribe_status();
    engine.handle_event(audio(0.5, 0.2)).unwrap();
    assert!(wait_until(WAIT, || engine.is_speaking()));

    engine.handle_event(ServerEvent::SessionClosed).unwrap();

    assert!(out.is_closed());
    assert!(!engine.is_running());
    assert!(!engine.is_speaking());
    assert_eq!(engine.status(), SessionStatus::Disconnected);
    assert_eq!(
        status.try_recv().map(|e| e.status).ok(),
        Some(SessionStatus::Disconnected)
    );
    assert!(matches!(
        engine.handle_event(audio(0.1, 0.2)),
        Err(ParleyError::NotRunning)
    ));
    assert!(matches!(engine.stop(), Err(ParleyError::NotRunning)));
}

#[test]
fn second_start_is_rejected() {
    let (engine, _out) = started_engine();
    let again = engine.start_playback_with(|wiring| {
        let out = VirtualOutput::new(PLAYBACK_SAMPLE_RATE);
        out.attach(wiring);
        Ok(out)
    });
    assert!(matches!(again, Err(ParleyError::AlreadyRunning)));
    engine.stop().unwrap();
}

#[test]
fn failed_output_open_reports_error_status() {
    let engine = ConversationEngine::new(EngineConfig::default());
    let result = engine.start_playback_with(|_wiring| -> parley_core::error::Result<VirtualOutput> {
        Err(ParleyError::NoDefaultOutputDevice)
    });
    assert!(matches!(result, Err(ParleyError::NoDefaultOutputDevice)));
    assert_eq!(engine.status(), SessionStatus::Error);
    assert!(!engine.is_running());
}
