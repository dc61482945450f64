//! protocol - control message envelope
//!
//! Every message on the control channel is a `ControlMessage`:
//! `{type, sender_id, payload?, timestamp}`. The payload is opaque bytes whose
//! meaning depends on `type`; [`ControlMessage::payload`] decodes it into the
//! matching [`Payload`] variant.
//!
//! Delivery is best-effort, at-most-once, and unordered across receivers, so
//! every handler of these messages must be idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::session::{Session, SessionParticipant};
use crate::types::{ParticipantId, PeerId};

/// control message types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// full session record (handled like a snapshot)
    SessionInfo,
    ParticipantJoined,
    ParticipantLeft,
    GameStart,
    GameEnd,
    Loss,
    Ping,
    Pong,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionInfo => "sessionInfo",
            Self::ParticipantJoined => "participantJoined",
            Self::ParticipantLeft => "participantLeft",
            Self::GameStart => "gameStart",
            Self::GameEnd => "gameEnd",
            Self::Loss => "loss",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "sessionInfo" => Self::SessionInfo,
            "participantJoined" => Self::ParticipantJoined,
            "participantLeft" => Self::ParticipantLeft,
            "gameStart" => Self::GameStart,
            "gameEnd" => Self::GameEnd,
            "loss" => Self::Loss,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        })
    }
}

/// decoded payload, selected by message type
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    None,
    Identifier(ParticipantId),
    Participant(SessionParticipant),
    Session(Box<Session>),
}

/// wire envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlMessage {
    pub kind: MessageType,
    pub sender_id: PeerId,
    pub payload: Option<Vec<u8>>,
    /// informational only, never used for protocol timing
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    sender_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Vec<u8>>,
    timestamp: DateTime<Utc>,
}

impl ControlMessage {
    pub fn new(kind: MessageType, sender_id: PeerId, payload: Option<Vec<u8>>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            sender_id,
            payload,
            timestamp,
        }
    }

    pub fn participant_joined(
        sender_id: PeerId,
        participant: &SessionParticipant,
        now: DateTime<Utc>,
    ) -> Result<Self, ProtocolError> {
        let payload = encode_payload(participant)?;
        Ok(Self::new(MessageType::ParticipantJoined, sender_id, Some(payload), now))
    }

    pub fn participant_left(sender_id: PeerId, id: ParticipantId, now: DateTime<Utc>) -> Result<Self, ProtocolError> {
        let payload = encode_payload(&id)?;
        Ok(Self::new(MessageType::ParticipantLeft, sender_id, Some(payload), now))
    }

    /// `gameStart` carries no payload; the replicated session has `started_at`
    pub fn game_start(sender_id: PeerId, now: DateTime<Utc>) -> Self {
        Self::new(MessageType::GameStart, sender_id, None, now)
    }

    pub fn game_end(sender_id: PeerId, loser: Option<ParticipantId>, now: DateTime<Utc>) -> Result<Self, ProtocolError> {
        let payload = loser.map(|id| encode_payload(&id)).transpose()?;
        Ok(Self::new(MessageType::GameEnd, sender_id, payload, now))
    }

    pub fn loss(sender_id: PeerId, id: ParticipantId, now: DateTime<Utc>) -> Result<Self, ProtocolError> {
        let payload = encode_payload(&id)?;
        Ok(Self::new(MessageType::Loss, sender_id, Some(payload), now))
    }

    pub fn session_info(sender_id: PeerId, session: &Session, now: DateTime<Utc>) -> Result<Self, ProtocolError> {
        let payload = encode_payload(session)?;
        Ok(Self::new(MessageType::SessionInfo, sender_id, Some(payload), now))
    }

    pub fn ping(sender_id: PeerId, now: DateTime<Utc>) -> Self {
        Self::new(MessageType::Ping, sender_id, None, now)
    }

    pub fn pong(sender_id: PeerId, now: DateTime<Utc>) -> Self {
        Self::new(MessageType::Pong, sender_id, None, now)
    }

    /// encode to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let envelope = Envelope {
            kind: self.kind.as_str().to_string(),
            sender_id: self.sender_id.clone(),
            payload: self.payload.clone(),
            timestamp: self.timestamp,
        };
        serde_json::to_vec(&envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// decode from wire bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = envelope.kind.parse()?;
        Ok(Self {
            kind,
            sender_id: envelope.sender_id,
            payload: envelope.payload,
            timestamp: envelope.timestamp,
        })
    }

    /// Decode the payload into the variant this message type calls for.
    pub fn payload(&self) -> Result<Payload, ProtocolError> {
        let bytes = self.payload.as_deref();
        match self.kind {
            MessageType::ParticipantJoined => {
                let participant = decode_required(bytes, "participantJoined")?;
                Ok(Payload::Participant(participant))
            }
            MessageType::ParticipantLeft | MessageType::Loss => {
                let id = decode_required(bytes, self.kind.as_str())?;
                Ok(Payload::Identifier(id))
            }
            MessageType::GameEnd => match bytes {
                None => Ok(Payload::None),
                Some(bytes) => Ok(Payload::Identifier(decode_bytes(bytes, "gameEnd")?)),
            },
            MessageType::GameStart => match bytes {
                None => Ok(Payload::None),
                // older hosts attached the started session
                Some(bytes) => Ok(Payload::Session(Box::new(decode_bytes(bytes, "gameStart")?))),
            },
            MessageType::SessionInfo => {
                let session = decode_required(bytes, "sessionInfo")?;
                Ok(Payload::Session(Box::new(session)))
            }
            MessageType::Ping | MessageType::Pong => Ok(Payload::None),
        }
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode_required<T: for<'de> Deserialize<'de>>(
    bytes: Option<&[u8]>,
    kind: &'static str,
) -> Result<T, ProtocolError> {
    let bytes = bytes.ok_or(ProtocolError::PayloadMismatch(kind))?;
    decode_bytes(bytes, kind)
}

fn decode_bytes<T: for<'de> Deserialize<'de>>(bytes: &[u8], kind: &'static str) -> Result<T, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|_| ProtocolError::PayloadMismatch(kind))
}
