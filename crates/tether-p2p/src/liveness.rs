//! liveness - heartbeat payload, emitter and watchdog
//!
//! the host publishes a tiny bincode heartbeat every interval while it
//! advertises. a client arms its watchdog when it subscribes and treats any
//! value on the heartbeat channel as proof of life; silence past the timeout
//! is reported as connection loss even if the bearer never says so.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use tether_core::{ProtocolError, TetherError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub seq: u64,
    /// host wall clock, informational
    pub sent_at_ms: i64,
}

impl Heartbeat {
    pub fn encode(&self) -> Result<Vec<u8>, TetherError> {
        bincode::serialize(self).map_err(|e| TetherError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Malformed(format!("heartbeat: {e}")))
    }
}

/// sequence numbering for outgoing heartbeats
#[derive(Debug, Default)]
pub struct HeartbeatEmitter {
    seq: u64,
}

impl HeartbeatEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, now: DateTime<Utc>) -> Heartbeat {
        self.seq += 1;
        Heartbeat {
            seq: self.seq,
            sent_at_ms: now.timestamp_millis(),
        }
    }
}

/// client-side silence detector
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    last_seen: Option<Instant>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_seen: None,
        }
    }

    /// start watching; the arming instant counts as the first sighting
    pub fn arm(&mut self, now: Instant) {
        self.last_seen = Some(now);
    }

    pub fn disarm(&mut self) {
        self.last_seen = None;
    }

    pub fn is_armed(&self) -> bool {
        self.last_seen.is_some()
    }

    /// a heartbeat (or anything on the heartbeat channel) arrived
    pub fn observe(&mut self, now: Instant) {
        if self.last_seen.is_some() {
            self.last_seen = Some(now);
        }
    }

    pub fn silence(&self, now: Instant) -> Option<Duration> {
        self.last_seen.map(|seen| now.saturating_duration_since(seen))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.silence(now).map_or(false, |s| s > self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_is_compact() {
        let mut emitter = HeartbeatEmitter::new();
        let first = emitter.next(Utc::now());
        let second = emitter.next(Utc::now());
        assert_eq!(second.seq, first.seq + 1);

        let bytes = second.encode().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(Heartbeat::decode(&bytes).unwrap(), second);
        assert!(Heartbeat::decode(&[1, 2]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_expiry() {
        let mut watchdog = Watchdog::new(Duration::from_millis(3_000));
        assert!(!watchdog.is_expired(Instant::now()));

        watchdog.arm(Instant::now());
        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert!(!watchdog.is_expired(Instant::now()));

        watchdog.observe(Instant::now());
        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert!(!watchdog.is_expired(Instant::now()));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(watchdog.is_expired(Instant::now()));

        watchdog.disarm();
        assert!(!watchdog.is_expired(Instant::now()));
    }
}
