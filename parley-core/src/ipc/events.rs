//! Event types exchanged with the agent transport and the host UI.
//!
//! | Type | Direction |
//! |------|-----------|
//! | `ServerEvent` | agent → engine |
//! | `ClientEvent` | engine → agent |
//! | `SessionStatusEvent` | engine → host |
//! | `Message` | engine → host (conversation log) |
//! | `RenderFrame` | engine → avatar, once per display frame |

use serde::{Deserialize, Serialize};

use crate::analysis::FeatureSnapshot;
use crate::codec::PcmBlob;

// ---------------------------------------------------------------------------
// Transport events
// ---------------------------------------------------------------------------

/// Everything the agent transport can deliver, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Base64 16-bit PCM at 24 kHz.
    AudioChunk { data: String },
    /// The user started talking over the agent.
    Interrupted,
    /// Speech-to-text of what the user said.
    InputTranscription { text: String },
    /// Speech-to-text of what the agent said.
    OutputTranscription { text: String },
    TurnComplete,
    SessionClosed,
}

/// Outbound realtime input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    RealtimeInput { media: PcmBlob },
}

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No session, or the last one ended normally.
    Disconnected,
    /// Opening devices.
    Connecting,
    /// Capturing and ready to play agent audio.
    Connected,
    /// Start failed; a new session is required.
    Error,
}

// ---------------------------------------------------------------------------
// Conversation log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// One finalised utterance. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// `<timestamp>-<seq>-u` or `<timestamp>-<seq>-a`.
    pub id: String,
    pub text: String,
    pub sender: Role,
    /// UTC milliseconds since the Unix epoch.
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Render tick
// ---------------------------------------------------------------------------

/// Maximum growth of the avatar over its resting size.
const MAX_AVATAR_BOOST: f32 = 0.25;
const AVATAR_VOLUME_GAIN: f32 = 0.7;

/// What the avatar needs for one display frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderFrame {
    pub features: FeatureSnapshot,
    /// The agent has audio queued or playing.
    pub speaking: bool,
    /// The session is up and the agent is silent.
    pub listening: bool,
}

impl RenderFrame {
    /// Avatar scale: grows with volume while speaking, 1.0 otherwise.
    pub fn avatar_scale(&self) -> f32 {
        if !self.speaking {
            return 1.0;
        }
        1.0 + (self.features.volume * AVATAR_VOLUME_GAIN).min(MAX_AVATAR_BOOST)
    }
}
