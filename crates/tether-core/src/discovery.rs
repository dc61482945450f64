//! discovery - advertisement record packed into the broadcast name
//!
//! The bearer's advertised local name is the only thing a scanner sees before
//! connecting, so it carries a compact `name|duration|bet|count` record:
//!
//! ```text
//! Emma|15|20|3
//! ```
//!
//! Decoding is lenient on purpose: records from unrelated broadcasters or
//! truncated names are dropped silently, and unparsable numbers fall back to
//! defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::DiscoveryConfig;
use crate::session::Session;
use crate::types::PeerId;

/// field delimiter
pub const DELIMITER: char = '|';

/// number of fields in a record
pub const FIELD_COUNT: usize = 4;

pub const DEFAULT_HOST_NAME: &str = "Player";
pub const DEFAULT_DURATION_MINUTES: u32 = 15;
pub const DEFAULT_BET_AMOUNT: u64 = 15;
pub const DEFAULT_PARTICIPANT_COUNT: u32 = 1;

/// decoded advertisement record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub host_name: String,
    pub duration_minutes: u32,
    pub bet_amount: u64,
    pub participant_count: u32,
}

impl Advertisement {
    /// advertisement describing the current state of a hosted session
    pub fn for_session(session: &Session) -> Self {
        let host_name = session
            .host()
            .map(|h| h.display_name.clone())
            .unwrap_or_else(|| DEFAULT_HOST_NAME.to_string());
        Self {
            host_name,
            duration_minutes: session.duration_minutes,
            bet_amount: session.bet_amount,
            participant_count: session.participants.len() as u32,
        }
    }

    /// Encode into an ASCII local name that fits the bearer's budget.
    pub fn encode(&self, config: &DiscoveryConfig) -> String {
        let tail = format!(
            "{DELIMITER}{}{DELIMITER}{}{DELIMITER}{}",
            self.duration_minutes, self.bet_amount, self.participant_count
        );
        let room = config.max_local_name_bytes.saturating_sub(tail.len());
        let budget = config.name_budget.min(room);

        // sanitized names are ASCII, so chars == bytes
        let name: String = sanitize_name(&self.host_name).chars().take(budget).collect();
        format!("{name}{tail}")
    }

    /// Decode a received local name. Returns `None` for records with fewer
    /// than four fields.
    pub fn decode(local_name: &str) -> Option<Self> {
        let fields: Vec<&str> = local_name.split(DELIMITER).collect();
        if fields.len() < FIELD_COUNT {
            return None;
        }

        let host_name = match fields[0].trim() {
            "" => DEFAULT_HOST_NAME.to_string(),
            name => name.to_string(),
        };

        Some(Self {
            host_name,
            duration_minutes: fields[1].trim().parse().unwrap_or(DEFAULT_DURATION_MINUTES),
            bet_amount: fields[2].trim().parse().unwrap_or(DEFAULT_BET_AMOUNT),
            participant_count: fields[3].trim().parse().unwrap_or(DEFAULT_PARTICIPANT_COUNT),
        })
    }
}

/// replace anything outside printable ASCII, and the delimiter, with `_`
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == DELIMITER || !(c.is_ascii_graphic() || c == ' ') {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// a hosted session seen while scanning
///
/// Client-local and never replicated; `host_peer_id` is the only identity that
/// survives advertisement refreshes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NearbySession {
    pub host_peer_id: PeerId,
    pub host_name: String,
    pub duration_minutes: u32,
    pub bet_amount: u64,
    pub participant_count: u32,
    /// RSSI in dBm
    pub signal_strength: i16,
}

impl NearbySession {
    pub fn from_advertisement(host_peer_id: PeerId, ad: Advertisement, signal_strength: i16) -> Self {
        Self {
            host_peer_id,
            host_name: ad.host_name,
            duration_minutes: ad.duration_minutes,
            bet_amount: ad.bet_amount,
            participant_count: ad.participant_count,
            signal_strength,
        }
    }

    pub fn formatted_bet(&self) -> String {
        format!("{}b", self.bet_amount)
    }

    pub fn formatted_duration(&self) -> String {
        format!("{} min", self.duration_minutes)
    }
}

/// sessions discovered during one scan, keyed by host peer
#[derive(Debug, Default)]
pub struct NearbySessions {
    sessions: HashMap<PeerId, NearbySession>,
}

impl NearbySessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an advertisement. Returns the refreshed entry, or `None` when
    /// the name is not a session record.
    pub fn observe(&mut self, peer: PeerId, local_name: &str, signal_strength: i16) -> Option<&NearbySession> {
        let ad = Advertisement::decode(local_name)?;
        let nearby = NearbySession::from_advertisement(peer.clone(), ad, signal_strength);
        self.sessions.insert(peer.clone(), nearby);
        self.sessions.get(&peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&NearbySession> {
        self.sessions.get(peer)
    }

    /// strongest signal first
    pub fn sorted(&self) -> Vec<NearbySession> {
        let mut all: Vec<_> = self.sessions.values().cloned().collect();
        all.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// discard everything, called when scanning stops
    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
