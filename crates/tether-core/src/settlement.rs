//! settlement - who gets what when a session ends

use serde::{Deserialize, Serialize};

use crate::session::Session;
use crate::types::ParticipantId;

/// result of a finished session from one participant's point of view
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub loser_id: Option<ParticipantId>,
    pub won: bool,
    /// amount credited back to this participant
    pub credit: u64,
    pub pot: u64,
}

/// Each non-losing participant's share of the pot.
///
/// Integer division; any remainder is dropped rather than redistributed. A
/// session with no winners divides by one instead of faulting.
pub fn share_per_winner(session: &Session) -> u64 {
    let winners = session.winners().count().max(1) as u64;
    session.total_pot() / winners
}

/// Settle an ended session for `local`.
///
/// With a loser every other participant splits the pot. Without one (timer
/// exhausted) every survivor is credited an equal share, which for a session
/// with no early losers is exactly their own bet back.
pub fn settle(session: &Session, local: ParticipantId) -> Outcome {
    let pot = session.total_pot();
    let local_lost = session
        .participant(local)
        .map(|p| p.has_lost)
        .unwrap_or(session.loser_id == Some(local));

    let credit = if local_lost { 0 } else { share_per_winner(session) };

    Outcome {
        loser_id: session.loser_id,
        won: !local_lost,
        credit,
        pot,
    }
}
