//! JSON-lines transport bridge.
//!
//! stdout carries one `ClientEvent` per line for the agent; stdin carries
//! one `ServerEvent` per line back. Logs go to stderr so the two never mix.

use std::io::BufRead;
use std::sync::Arc;

use parley_core::{ClientEvent, ConversationEngine, ParleyError, PcmBlob, ServerEvent};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Forward every encoded microphone frame to stdout.
pub fn spawn_writer(mut outbound: mpsc::Receiver<PcmBlob>) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(media) = outbound.recv().await {
            let mut line = serde_json::to_vec(&ClientEvent::RealtimeInput { media })?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        debug!("outbound channel closed");
        Ok(())
    })
}

/// Feed stdin lines into the engine until EOF or the session ends.
///
/// Runs on a detached OS thread: a blocking stdin read cannot be cancelled,
/// and a runtime blocking task would hold up shutdown.
pub fn spawn_reader(engine: Arc<ConversationEngine>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("parley-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("stdin read failed: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let event = match parse_event(&line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("ignoring unparseable server event: {e}");
                        continue;
                    }
                };
                match engine.handle_event(event) {
                    Ok(()) => {}
                    Err(ParleyError::NotRunning) => break,
                    Err(e) => warn!("server event rejected: {e}"),
                }
            }
            info!("transport input closed");
            engine.end_session();
        })?;
    Ok(())
}

pub fn parse_event(line: &str) -> serde_json::Result<ServerEvent> {
    serde_json::from_str(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trimmed_server_event_lines() {
        let event = parse_event("  {\"type\":\"interrupted\"}\r").unwrap();
        assert_eq!(event, ServerEvent::Interrupted);
    }

    #[test]
    fn rejects_unknown_event_types() {
        assert!(parse_event(r#"{"type":"goAway"}"#).is_err());
    }
}
