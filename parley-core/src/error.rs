use thiserror::Error;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("malformed transport text: {0}")]
    MalformedTransport(String),

    #[error("PCM chunk has odd byte length {len}")]
    OddLengthChunk { len: usize },

    #[error("PCM chunk contains no samples")]
    EmptyChunk,

    #[error("output backlog is full")]
    OutputBacklog,

    #[error("session is already running")]
    AlreadyRunning,

    #[error("session is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// `true` for errors caused by a bad inbound payload rather than the
    /// local device or session state. Such chunks are dropped, never fatal.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            ParleyError::MalformedTransport(_)
                | ParleyError::OddLengthChunk { .. }
                | ParleyError::EmptyChunk
        )
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
