//! # Audio Chunk Decoding
//!
//! Clients send audio either as binary WebSocket frames or as base64 text
//! inside an `audioInput` event. Both carry raw 16-bit little-endian PCM.
//! This module turns either form into bytes that can be streamed to a
//! session, rejecting chunks that cannot be PCM.
//!
//! ## Audio Format:
//! - **Bit Depth**: 16-bit PCM, little-endian signed integers
//! - **Validation**: non-empty and an even number of bytes

use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

/// A transport-encoded audio chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AudioPayload {
    /// Base64 text, as sent by browsers that cannot emit binary events
    Encoded(String),
    /// Already-decoded bytes (binary frame or JSON byte array)
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    InvalidBase64(String),
    Empty,
    OddLength(usize),
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioError::InvalidBase64(msg) => write!(f, "Audio chunk is not valid base64: {}", msg),
            AudioError::Empty => write!(f, "Audio chunk is empty"),
            AudioError::OddLength(len) => write!(
                f,
                "Audio chunk length {} is not a whole number of 16-bit samples",
                len
            ),
        }
    }
}

impl std::error::Error for AudioError {}

/// Decode and validate one chunk.
pub fn decode_chunk(payload: AudioPayload) -> Result<Vec<u8>, AudioError> {
    let bytes = match payload {
        AudioPayload::Raw(bytes) => bytes,
        AudioPayload::Encoded(text) => base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .map_err(|e| AudioError::InvalidBase64(e.to_string()))?,
    };

    if bytes.is_empty() {
        return Err(AudioError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(AudioError::OddLength(bytes.len()));
    }
    Ok(bytes)
}

/// Sample count and peak absolute amplitude of a PCM chunk.
///
/// Only used for trace logging, so it reads at most the first 1000 samples.
pub fn chunk_levels(pcm: &[u8]) -> (usize, u16) {
    let mut cursor = Cursor::new(pcm);
    let mut peak = 0u16;
    let mut read = 0;
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        peak = peak.max(sample.unsigned_abs());
        read += 1;
        if read >= 1000 {
            break;
        }
    }
    (pcm.len() / 2, peak)
}
