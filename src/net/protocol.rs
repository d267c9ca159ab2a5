//! Broadcast payload schema and codec
//!
//! Every message on the presence channel is a [`PresencePayload`]. Inbound
//! bytes are decoded and validated here, so nothing past this module sees a
//! payload with missing or nonsensical fields.

use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::presence::types::{Direction, ParticipantId, PositionSample};
use crate::util::vec2::Vec2;

/// Encoding used on the broadcast channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// bincode, legacy config (fixed-size integers)
    #[default]
    Binary,
    /// JSON, for backends that relay text frames
    Json,
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "bincode" => Ok(WireFormat::Binary),
            "json" => Ok(WireFormat::Json),
            other => Err(format!("unknown wire format '{}'", other)),
        }
    }
}

/// Live position update published on the presence channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresencePayload {
    pub user_id: ParticipantId,
    pub username: String,
    pub position_x: f32,
    pub position_y: f32,
    pub direction: Direction,
    pub is_moving: bool,
    /// Sender wall-clock milliseconds
    pub timestamp: u64,
}

impl PresencePayload {
    pub fn from_sample(user_id: &str, username: &str, sample: &PositionSample) -> Self {
        Self {
            user_id: user_id.to_string(),
            username: username.to_string(),
            position_x: sample.position.x,
            position_y: sample.position.y,
            direction: sample.direction,
            is_moving: sample.is_moving,
            timestamp: sample.timestamp,
        }
    }

    pub fn position(&self) -> Vec2 {
        Vec2::new(self.position_x, self.position_y)
    }

    pub fn sample(&self) -> PositionSample {
        PositionSample::new(self.position(), self.direction, self.is_moving, self.timestamp)
    }

    /// Reject payloads that decode but cannot describe a real participant
    pub fn validate(&self, max_name_len: usize) -> Result<(), ProtocolError> {
        if self.user_id.trim().is_empty() {
            return Err(ProtocolError::EmptyIdentity);
        }
        let name_len = self.username.chars().count();
        if name_len > max_name_len {
            return Err(ProtocolError::NameTooLong(name_len, max_name_len));
        }
        if !self.position().is_finite() {
            return Err(ProtocolError::NonFiniteCoordinates);
        }
        if self.timestamp == 0 {
            return Err(ProtocolError::MissingTimestamp);
        }
        Ok(())
    }
}

/// Largest inbound message accepted, in either format. Covers a
/// maximum-length name with every character escaped in JSON.
pub const MAX_PAYLOAD_BYTES: usize = 4096;

/// Encode a message in the given wire format
pub fn encode<T: Serialize>(message: &T, format: WireFormat) -> Result<Vec<u8>, EncodeError> {
    match format {
        WireFormat::Binary => bincode::serde::encode_to_vec(message, bincode::config::legacy())
            .map_err(|e| EncodeError(e.to_string())),
        WireFormat::Json => serde_json::to_vec(message).map_err(|e| EncodeError(e.to_string())),
    }
}

/// Decode a message in the given wire format.
///
/// Binary decoding is capped at [`MAX_PAYLOAD_BYTES`], so a forged length
/// prefix fails instead of allocating.
pub fn decode<T: DeserializeOwned>(data: &[u8], format: WireFormat) -> Result<T, DecodeError> {
    let config = bincode::config::legacy().with_limit::<MAX_PAYLOAD_BYTES>();
    match format {
        WireFormat::Binary => bincode::serde::decode_from_slice(data, config)
            .map(|(msg, _)| msg)
            .map_err(|e| DecodeError(e.to_string())),
        WireFormat::Json => serde_json::from_slice(data).map_err(|e| DecodeError(e.to_string())),
    }
}

/// Decode and validate an inbound presence payload
pub fn decode_payload(
    data: &[u8],
    format: WireFormat,
    max_name_len: usize,
) -> Result<PresencePayload, ProtocolError> {
    if data.len() > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::Oversized(data.len(), MAX_PAYLOAD_BYTES));
    }
    let payload: PresencePayload = decode(data, format)?;
    payload.validate(max_name_len)?;
    Ok(payload)
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);

/// Reasons an inbound payload is rejected
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("payload is {0} bytes, limit is {1}")]
    Oversized(usize, usize),
    #[error("payload has an empty user_id")]
    EmptyIdentity,
    #[error("username is {0} characters, limit is {1}")]
    NameTooLong(usize, usize),
    #[error("NaN or Infinity in position")]
    NonFiniteCoordinates,
    #[error("payload has no timestamp")]
    MissingTimestamp,
}
