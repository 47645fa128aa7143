//! PCM wire codec.
//!
//! The agent speaks 16-bit signed little-endian mono PCM, carried as
//! base64 text inside JSON messages. Everything here is a pure function:
//!
//! ```text
//! [f32] ──samples_to_chunk──► [u8; 2n] ──encode_transport──► "base64…"
//! [f32] ◄─chunk_to_samples─── [u8; 2n] ◄─decode_transport─── "base64…"
//! ```
//!
//! Encoding never fails: out-of-range samples are clamped, not rejected.
//! Decoding fails only on malformed input (bad alphabet, odd byte count).

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use serde::{Deserialize, Serialize};

use crate::audio::CAPTURE_SAMPLE_RATE;
use crate::error::{ParleyError, Result};

/// Scale between normalised f32 samples and i16 PCM.
pub const PCM_SCALE: f32 = 32_768.0;

/// Standard alphabet, padded on encode, padding optional on decode.
const TRANSPORT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Convert f32 samples to 16-bit little-endian PCM bytes.
///
/// Each sample is scaled by 32768, clamped to the i16 range and truncated
/// toward zero. NaN maps to 0.
pub fn samples_to_chunk(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // `as` truncates toward zero and saturates; the clamp keeps +1.0 at 32767.
        let pcm = (sample * PCM_SCALE).clamp(-PCM_SCALE, PCM_SCALE - 1.0) as i16;
        bytes.extend_from_slice(&pcm.to_le_bytes());
    }
    bytes
}

/// Convert 16-bit little-endian PCM bytes back to f32 samples in [-1, 1).
///
/// # Errors
/// `ParleyError::OddLengthChunk` when `bytes` cannot be split into whole samples.
pub fn chunk_to_samples(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(ParleyError::OddLengthChunk { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM_SCALE)
        .collect())
}

/// Encode raw bytes as transport text.
pub fn encode_transport(bytes: &[u8]) -> String {
    TRANSPORT.encode(bytes)
}

/// Decode transport text back into raw bytes.
///
/// # Errors
/// `ParleyError::MalformedTransport` on characters outside the alphabet or
/// an impossible length.
pub fn decode_transport(text: &str) -> Result<Vec<u8>> {
    TRANSPORT
        .decode(text)
        .map_err(|e| ParleyError::MalformedTransport(e.to_string()))
}

/// Full inbound path: transport text → PCM bytes → samples.
pub fn decode_chunk(text: &str) -> Result<Vec<f32>> {
    let bytes = decode_transport(text)?;
    chunk_to_samples(&bytes)
}

/// Full outbound path: samples → PCM bytes → transport text.
pub fn encode_chunk(samples: &[f32]) -> String {
    encode_transport(&samples_to_chunk(samples))
}

/// Realtime-input media payload, as the agent expects it on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcmBlob {
    /// Base64 of the 16-bit little-endian PCM bytes.
    pub data: String,
    /// Always `audio/pcm;rate=<capture rate>`.
    pub mime_type: String,
}

impl PcmBlob {
    /// Encode one capture frame (16 kHz mono).
    pub fn from_capture_frame(samples: &[f32]) -> Self {
        Self {
            data: encode_chunk(samples),
            mime_type: pcm_mime_type(CAPTURE_SAMPLE_RATE),
        }
    }
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}
