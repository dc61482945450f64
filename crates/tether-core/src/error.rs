use thiserror::Error;

use crate::types::ParticipantId;

/// Error kinds surfaced to the session owner.
///
/// Transport and protocol failures never cross the coordinator boundary as
/// panics; they arrive here and the state machine decides whether they end the
/// session ([`TetherError::is_fatal`]) or are only reported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TetherError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("failed to start advertising: {0}")]
    AdvertiseFailed(String),

    #[error("failed to start scanning: {0}")]
    ScanFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection timed out after {0}ms")]
    ConnectionTimeout(u64),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("no heartbeat for {0}ms")]
    HeartbeatTimeout(u64),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("rejected session data: {0}")]
    InvalidSession(String),
}

impl TetherError {
    /// Whether this error ends (or prevents) the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TetherError::TransportUnavailable(_)
                | TetherError::ConnectionFailed(_)
                | TetherError::ConnectionTimeout(_)
                | TetherError::HeartbeatTimeout(_)
                | TetherError::PeerNotFound(_)
                | TetherError::ChannelNotFound(_)
        )
    }
}

/// Wire encoding and decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("payload does not match {0} message")]
    PayloadMismatch(&'static str),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("invalid session: {0}")]
    InvalidSession(String),
}

impl From<ProtocolError> for TetherError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Encode(msg) => TetherError::Encode(msg),
            ProtocolError::InvalidSession(msg) => TetherError::InvalidSession(msg),
            other => TetherError::Decode(other.to_string()),
        }
    }
}

/// Operations the state machine refused to perform
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    #[error("operation not allowed while {0}")]
    InvalidPhase(&'static str),

    #[error("only the host can do that")]
    NotHost,

    #[error("insufficient balance for bet of {0}")]
    InsufficientBalance(u64),

    #[error("{0} minutes is not an offered duration")]
    UnsupportedDuration(u32),

    #[error("{0} is not an offered bet amount")]
    UnsupportedBet(u64),

    #[error("need at least {needed} participants, have {have}")]
    NotEnoughParticipants { needed: usize, have: usize },

    #[error("local participant missing from session")]
    NotParticipant,

    #[error("participant {0} is not in this session")]
    UnknownParticipant(ParticipantId),

    #[error("no nearby session from {0}")]
    SessionNotFound(String),
}

pub type Result<T> = std::result::Result<T, TetherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(TetherError::HeartbeatTimeout(3000).is_fatal());
        assert!(TetherError::ConnectionTimeout(10_000).is_fatal());
        assert!(!TetherError::Decode("bad json".into()).is_fatal());
        assert!(!TetherError::Delivery("queue full".into()).is_fatal());
    }

    #[test]
    fn test_protocol_error_mapping() {
        let err: TetherError = ProtocolError::Malformed("eof".into()).into();
        assert!(matches!(err, TetherError::Decode(_)));

        let err: TetherError = ProtocolError::Encode("nan".into()).into();
        assert!(matches!(err, TetherError::Encode(_)));
    }
}
