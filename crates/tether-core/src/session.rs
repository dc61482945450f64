//! session - the canonical record of one hosted activity
//!
//! Only the host mutates a `Session`; clients hold a mirror that is replaced
//! wholesale by every snapshot they receive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GameError;
use crate::timer;
use crate::types::{ParticipantId, PeerId, SessionId};

/// session lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// host created session, waiting for players
    Waiting,
    /// countdown before start
    Countdown,
    /// game in progress
    Active,
    /// someone lost or the timer ran out
    Ended,
    /// cancelled before it became active
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Countdown => "countdown",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Cancelled => "cancelled",
        }
    }
}

/// one device's presence in a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParticipant {
    pub id: ParticipantId,
    /// transport address, stable for the connection's lifetime
    pub peer_id: PeerId,
    pub display_name: String,
    pub avatar_color_index: u8,
    pub is_host: bool,
    pub has_lost: bool,
    pub lost_at: Option<DateTime<Utc>>,
}

impl SessionParticipant {
    pub fn new(peer_id: PeerId, display_name: impl Into<String>, avatar_color_index: u8) -> Self {
        Self {
            id: ParticipantId::random(),
            peer_id,
            display_name: display_name.into(),
            avatar_color_index,
            is_host: false,
            has_lost: false,
            lost_at: None,
        }
    }

    pub fn host(peer_id: PeerId, display_name: impl Into<String>, avatar_color_index: u8) -> Self {
        Self {
            is_host: true,
            ..Self::new(peer_id, display_name, avatar_color_index)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub host_id: ParticipantId,
    /// join order
    pub participants: Vec<SessionParticipant>,
    pub duration_minutes: u32,
    pub bet_amount: u64,
    pub state: SessionState,
    /// authoritative time anchor, set once on entering `Active`
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub loser_id: Option<ParticipantId>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// create a new waiting session with the host as its only participant
    pub fn new(host: SessionParticipant, duration_minutes: u32, bet_amount: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::random(),
            host_id: host.id,
            participants: vec![host],
            duration_minutes,
            bet_amount,
            state: SessionState::Waiting,
            started_at: None,
            ended_at: None,
            loser_id: None,
            created_at: now,
        }
    }

    /// `participants.count * betAmount`
    pub fn total_pot(&self) -> u64 {
        self.participants.len() as u64 * self.bet_amount
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&SessionParticipant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn participant_by_peer(&self, peer: &PeerId) -> Option<&SessionParticipant> {
        self.participants.iter().find(|p| &p.peer_id == peer)
    }

    pub fn host(&self) -> Option<&SessionParticipant> {
        self.participant(self.host_id)
    }

    /// participants who have not lost
    pub fn winners(&self) -> impl Iterator<Item = &SessionParticipant> {
        self.participants.iter().filter(|p| !p.has_lost)
    }

    pub fn loser(&self) -> Option<&SessionParticipant> {
        self.participants.iter().find(|p| p.has_lost)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state, SessionState::Ended | SessionState::Cancelled)
    }

    /// Append a participant. Returns `false` (and changes nothing) when the id
    /// or peer is already present, so duplicate joins are harmless.
    pub fn add_participant(&mut self, participant: SessionParticipant) -> bool {
        let duplicate = self
            .participants
            .iter()
            .any(|p| p.id == participant.id || p.peer_id == participant.peer_id);
        if duplicate {
            return false;
        }
        self.participants.push(participant);
        true
    }

    /// Remove a participant. Removing an absent id is a no-op returning `false`.
    /// The host is never removed; the session is cancelled instead.
    pub fn remove_participant(&mut self, id: ParticipantId) -> bool {
        if id == self.host_id {
            return false;
        }
        let before = self.participants.len();
        self.participants.retain(|p| p.id != id);
        self.participants.len() != before
    }

    pub fn begin_countdown(&mut self) {
        if self.state == SessionState::Waiting {
            self.state = SessionState::Countdown;
        }
    }

    /// Enter `Active` and set the anchor. Returns `false` if the anchor was
    /// already set; `started_at` is never revised.
    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.started_at.is_some() || self.is_completed() {
            return false;
        }
        self.started_at = Some(now);
        self.state = SessionState::Active;
        true
    }

    /// Mark `id` as the loser and end the session.
    ///
    /// At most one participant ever loses: once a loser is recorded further
    /// calls return `Ok(false)`.
    pub fn mark_lost(&mut self, id: ParticipantId, now: DateTime<Utc>) -> Result<bool, GameError> {
        if self.loser_id.is_some() || self.state == SessionState::Cancelled {
            return Ok(false);
        }
        let participant = self
            .participants
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(GameError::UnknownParticipant(id))?;

        participant.has_lost = true;
        participant.lost_at = Some(now);
        self.loser_id = Some(id);
        self.state = SessionState::Ended;
        self.ended_at.get_or_insert(now);
        Ok(true)
    }

    /// end without a loser (timer exhausted)
    pub fn end(&mut self, now: DateTime<Utc>) {
        if self.state == SessionState::Cancelled {
            return;
        }
        self.state = SessionState::Ended;
        self.ended_at.get_or_insert(now);
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        if self.state == SessionState::Ended {
            return;
        }
        self.state = SessionState::Cancelled;
        self.ended_at.get_or_insert(now);
    }

    /// seconds left, only while active
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        match (self.state, self.started_at) {
            (SessionState::Active, Some(started_at)) => {
                Some(timer::remaining_secs(now, started_at, self.duration_minutes))
            }
            _ => None,
        }
    }
}
