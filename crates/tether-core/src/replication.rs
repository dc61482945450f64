//! replication - session snapshots
//!
//! The host serialises the whole [`Session`] after every mutation and pushes
//! it on the session-state channel. Clients replace their mirror with each
//! snapshot; there is no merge and no partial history to reconcile.

use crate::config::OptionSets;
use crate::error::ProtocolError;
use crate::session::{Session, SessionState};

/// encode a session for the session-state channel
pub fn encode_snapshot(session: &Session) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(session).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// decode a snapshot without validating it
pub fn decode_snapshot(bytes: &[u8]) -> Result<Session, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Reject session data a host could not legitimately have produced.
///
/// Applied at the boundary, before anything touches local state.
pub fn validate_snapshot(session: &Session, options: &OptionSets) -> Result<(), ProtocolError> {
    let invalid = |msg: String| Err(ProtocolError::InvalidSession(msg));

    if !options.allows_duration(session.duration_minutes) {
        return invalid(format!("duration {} not offered", session.duration_minutes));
    }
    if !options.allows_bet(session.bet_amount) {
        return invalid(format!("bet {} not offered", session.bet_amount));
    }
    if session.participants.is_empty() && session.state != SessionState::Cancelled {
        return invalid("no participants".into());
    }
    if session.participants.iter().all(|p| p.id != session.host_id)
        && session.state != SessionState::Cancelled
    {
        return invalid("host missing from participants".into());
    }

    let losers: Vec<_> = session.participants.iter().filter(|p| p.has_lost).collect();
    if losers.len() > 1 {
        return invalid(format!("{} participants marked lost", losers.len()));
    }
    if let Some(loser) = losers.first() {
        if session.state != SessionState::Ended {
            return invalid("loser recorded before the session ended".into());
        }
        if session.loser_id != Some(loser.id) {
            return invalid("loser id does not match participant".into());
        }
    }

    if session.state == SessionState::Active && session.started_at.is_none() {
        return invalid("active session without start time".into());
    }
    Ok(())
}

/// decode and validate in one step
pub fn accept_snapshot(bytes: &[u8], options: &OptionSets) -> Result<Session, ProtocolError> {
    let session = decode_snapshot(bytes)?;
    validate_snapshot(&session, options)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionParticipant;
    use chrono::{TimeZone, Utc};

    fn session() -> Session {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let host = SessionParticipant::host("host".into(), "Emma", 0);
        let mut session = Session::new(host, 15, 20, now);
        session.add_participant(SessionParticipant::new("peer1".into(), "Sam", 1));
        session.start(now);
        session
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_fields() {
        let original = session();
        let bytes = encode_snapshot(&original).unwrap();
        let decoded = accept_snapshot(&bytes, &OptionSets::default()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.started_at, original.started_at);
    }

    #[test]
    fn test_rejects_unoffered_bet() {
        let mut s = session();
        s.bet_amount = 1_000_000;
        let err = validate_snapshot(&s, &OptionSets::default()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSession(_)));
    }

    #[test]
    fn test_rejects_zero_duration() {
        let mut s = session();
        s.duration_minutes = 0;
        assert!(validate_snapshot(&s, &OptionSets::default()).is_err());
    }

    #[test]
    fn test_rejects_two_losers() {
        let mut s = session();
        s.state = SessionState::Ended;
        for p in s.participants.iter_mut() {
            p.has_lost = true;
        }
        assert!(validate_snapshot(&s, &OptionSets::default()).is_err());
    }

    #[test]
    fn test_rejects_loser_while_active() {
        let mut s = session();
        s.participants[1].has_lost = true;
        s.loser_id = Some(s.participants[1].id);
        assert!(validate_snapshot(&s, &OptionSets::default()).is_err());
    }

    #[test]
    fn test_rejects_empty_unless_cancelled() {
        let mut s = session();
        s.participants.clear();
        assert!(validate_snapshot(&s, &OptionSets::default()).is_err());
        s.state = SessionState::Cancelled;
        assert!(validate_snapshot(&s, &OptionSets::default()).is_ok());
    }

    #[test]
    fn test_malformed_bytes() {
        assert!(matches!(
            accept_snapshot(b"{\"id\":", &OptionSets::default()),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
