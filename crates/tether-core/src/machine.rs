//! machine - the game state machine
//!
//! `GameMachine` owns the session record (host) or its mirror (client) and is
//! driven by two kinds of input: commands from the local user, which may be
//! refused with a [`GameError`], and events from the transport and timers,
//! which never fail. Every input returns the list of [`Effect`]s the caller
//! must carry out. The machine itself does no I/O apart from the synchronous
//! wallet calls, so whole sessions can be replayed in tests with explicit
//! timestamps.
//!
//! ```text
//! idle -> waiting -> countdown -> active -> ended
//!   \        \___________\_____________/
//!    joining              cancelled
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::collaborators::{Cue, IdentityProvider};
use crate::config::TetherConfig;
use crate::discovery::{Advertisement, NearbySession, NearbySessions};
use crate::error::{GameError, ProtocolError, TetherError};
use crate::protocol::{ControlMessage, MessageType, Payload};
use crate::replication::{accept_snapshot, encode_snapshot, validate_snapshot};
use crate::session::{Session, SessionParticipant, SessionState};
use crate::settlement::{settle, Outcome};
use crate::types::{ParticipantId, PeerId};
use crate::wallet::{Reason, Wallet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// local phase, a superset of [`SessionState`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    /// connecting to a host, no snapshot yet
    Joining,
    Waiting,
    Countdown,
    Active,
    Ended,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Waiting => "waiting",
            Self::Countdown => "countdown",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Cancelled => "cancelled",
        }
    }

    /// a new session may be created from here
    pub fn is_resting(&self) -> bool {
        matches!(self, Self::Idle | Self::Ended | Self::Cancelled)
    }
}

/// periodic work owned by the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Timer {
    /// countdown ticks before start (host)
    Countdown,
    /// remaining-time ticks while active
    Active,
    /// heartbeat publishing (host)
    Heartbeat,
    /// heartbeat silence check (client)
    Watchdog,
    /// one-shot connection deadline (client)
    Connect,
}

/// notification for the surrounding application
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GameEvent {
    Discovered(NearbySession),
    PhaseChanged(Phase),
    CountdownTick(u32),
    Tick { remaining_secs: u64 },
    ParticipantJoined(SessionParticipant),
    ParticipantLeft(ParticipantId),
    Ended(Outcome),
    Error { message: String, fatal: bool },
}

/// work the caller must perform on the machine's behalf
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    StartAdvertising(String),
    RefreshAdvertisement(String),
    StopAdvertising,
    StartScan,
    StopScan,
    /// push a full snapshot on the session-state channel
    PublishSnapshot(Vec<u8>),
    /// push on the control channel to every subscriber
    Broadcast(ControlMessage),
    /// write on the host's control channel
    SendToHost(ControlMessage),
    Connect(PeerId),
    /// subscribe to all three channels of the connected host
    Subscribe(PeerId),
    Disconnect,
    StartTimer(Timer),
    StopTimer(Timer),
    StartLifecycle,
    StopLifecycle,
    Feedback(Cue),
    Notify(GameEvent),
}

#[derive(Clone, Debug)]
struct LocalIdentity {
    peer_id: PeerId,
    display_name: String,
    avatar_color_index: u8,
}

pub struct GameMachine {
    config: TetherConfig,
    me: LocalIdentity,
    wallet: Arc<dyn Wallet>,
    role: Option<Role>,
    phase: Phase,
    session: Option<Session>,
    local_id: Option<ParticipantId>,
    host_peer: Option<PeerId>,
    nearby: NearbySessions,
    countdown_remaining: u32,
    /// `started_at` was set locally because no authoritative value arrived
    degraded_anchor: bool,
    bet_debited: bool,
    settled: bool,
}

impl GameMachine {
    pub fn new(config: TetherConfig, identity: &dyn IdentityProvider, wallet: Arc<dyn Wallet>) -> Self {
        Self {
            config,
            me: LocalIdentity {
                peer_id: identity.local_peer_id(),
                display_name: identity.display_name(),
                avatar_color_index: identity.avatar_color_index(),
            },
            wallet,
            role: None,
            phase: Phase::Idle,
            session: None,
            local_id: None,
            host_peer: None,
            nearby: NearbySessions::new(),
            countdown_remaining: 0,
            degraded_anchor: false,
            bet_debited: false,
            settled: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn local_id(&self) -> Option<ParticipantId> {
        self.local_id
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.me.peer_id
    }

    pub fn host_peer(&self) -> Option<&PeerId> {
        self.host_peer.as_ref()
    }

    pub fn nearby(&self) -> &NearbySessions {
        &self.nearby
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    /// remaining seconds of the active session
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        self.session.as_ref().and_then(|s| s.remaining_secs(now))
    }

    /// current snapshot bytes, for subscribe-triggered pushes
    pub fn snapshot_bytes(&self) -> Option<Vec<u8>> {
        self.session.as_ref().and_then(|s| encode_snapshot(s).ok())
    }

    // -- host commands --

    /// Create a session and start advertising it.
    pub fn host(&mut self, duration_minutes: u32, bet_amount: u64, now: DateTime<Utc>) -> Result<Vec<Effect>, GameError> {
        if !self.phase.is_resting() {
            return Err(GameError::InvalidPhase(self.phase.as_str()));
        }
        if !self.config.options.allows_duration(duration_minutes) {
            return Err(GameError::UnsupportedDuration(duration_minutes));
        }
        if !self.config.options.allows_bet(bet_amount) {
            return Err(GameError::UnsupportedBet(bet_amount));
        }
        if !self.wallet.has_sufficient_balance(bet_amount) {
            return Err(GameError::InsufficientBalance(bet_amount));
        }

        self.reset();
        let host = SessionParticipant::host(
            self.me.peer_id.clone(),
            self.me.display_name.clone(),
            self.me.avatar_color_index,
        );
        self.local_id = Some(host.id);
        let session = Session::new(host, duration_minutes, bet_amount, now);
        tracing::info!(
            session = %session.id,
            duration_minutes,
            bet_amount,
            "hosting session"
        );
        self.session = Some(session);
        self.role = Some(Role::Host);

        let mut fx = Vec::new();
        fx.push(Effect::StartAdvertising(self.advertisement()));
        fx.push(Effect::StartTimer(Timer::Heartbeat));
        self.publish(&mut fx);
        self.set_phase(Phase::Waiting, &mut fx);
        Ok(fx)
    }

    /// Begin the countdown. Needs at least `min_participants`.
    pub fn start_countdown(&mut self, now: DateTime<Utc>) -> Result<Vec<Effect>, GameError> {
        self.require_host()?;
        if self.phase != Phase::Waiting {
            return Err(GameError::InvalidPhase(self.phase.as_str()));
        }
        self.require_quorum()?;

        let ticks = self.config.timing.countdown_ticks;
        if ticks == 0 {
            return self.start_now(now);
        }

        let mut fx = Vec::new();
        if let Some(session) = self.session.as_mut() {
            session.begin_countdown();
        }
        self.countdown_remaining = ticks;
        self.publish(&mut fx);
        self.set_phase(Phase::Countdown, &mut fx);
        fx.push(Effect::StartTimer(Timer::Countdown));
        fx.push(Effect::Feedback(Cue::CountdownTick));
        fx.push(Effect::Notify(GameEvent::CountdownTick(ticks)));
        Ok(fx)
    }

    /// Skip (or cut short) the countdown and go active immediately.
    pub fn start_now(&mut self, now: DateTime<Utc>) -> Result<Vec<Effect>, GameError> {
        self.require_host()?;
        if !matches!(self.phase, Phase::Waiting | Phase::Countdown) {
            return Err(GameError::InvalidPhase(self.phase.as_str()));
        }
        self.require_quorum()?;

        let mut fx = Vec::new();
        self.host_start(now, &mut fx);
        Ok(fx)
    }

    // -- client commands --

    pub fn start_scan(&mut self) -> Vec<Effect> {
        self.nearby.clear();
        vec![Effect::StartScan]
    }

    pub fn stop_scan(&mut self) -> Vec<Effect> {
        self.nearby.clear();
        vec![Effect::StopScan]
    }

    /// Connect to a discovered session.
    pub fn join(&mut self, host_peer: &PeerId, _now: DateTime<Utc>) -> Result<Vec<Effect>, GameError> {
        if !self.phase.is_resting() {
            return Err(GameError::InvalidPhase(self.phase.as_str()));
        }
        let nearby = self
            .nearby
            .get(host_peer)
            .cloned()
            .ok_or_else(|| GameError::SessionNotFound(host_peer.to_string()))?;
        if !self.wallet.has_sufficient_balance(nearby.bet_amount) {
            return Err(GameError::InsufficientBalance(nearby.bet_amount));
        }

        self.reset();
        tracing::info!(host = %host_peer, name = %nearby.host_name, "joining session");
        self.role = Some(Role::Client);
        self.host_peer = Some(host_peer.clone());
        self.nearby.clear();

        let mut fx = vec![
            Effect::StopScan,
            Effect::Connect(host_peer.clone()),
            Effect::StartTimer(Timer::Connect),
        ];
        self.set_phase(Phase::Joining, &mut fx);
        Ok(fx)
    }

    // -- shared commands --

    /// Concede the active session. The local participant loses.
    pub fn concede(&mut self, now: DateTime<Utc>) -> Result<Vec<Effect>, GameError> {
        if self.phase != Phase::Active {
            return Err(GameError::InvalidPhase(self.phase.as_str()));
        }
        let local = self.local_id.ok_or(GameError::NotParticipant)?;
        let mut fx = Vec::new();

        match self.role {
            Some(Role::Host) => self.host_resolve_loss(local, now, &mut fx),
            Some(Role::Client) => {
                tracing::info!("conceding");
                self.send_to_host(ControlMessage::loss(self.me.peer_id.clone(), local, now), &mut fx);
                // optimistic: a later snapshot may still replace the record
                if let Some(session) = self.session.as_mut() {
                    if let Err(e) = session.mark_lost(local, now) {
                        tracing::warn!("local concession not recorded: {}", e);
                    }
                }
                self.enter_ended(&mut fx);
            }
            None => return Err(GameError::NotParticipant),
        }
        Ok(fx)
    }

    /// The application left the foreground. Concedes while active.
    pub fn app_backgrounded(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        if self.phase != Phase::Active {
            return Vec::new();
        }
        tracing::info!("app backgrounded during active session");
        self.concede(now).unwrap_or_default()
    }

    /// Cancel before the session goes active. On a client this leaves.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<Vec<Effect>, GameError> {
        match self.role {
            Some(Role::Host) => {
                if !matches!(self.phase, Phase::Waiting | Phase::Countdown) {
                    return Err(GameError::InvalidPhase(self.phase.as_str()));
                }
                tracing::info!("cancelling hosted session");
                let mut fx = Vec::new();
                if let Some(session) = self.session.as_mut() {
                    session.cancel(now);
                }
                self.publish(&mut fx);
                fx.push(Effect::StopTimer(Timer::Countdown));
                fx.push(Effect::StopAdvertising);
                fx.push(Effect::StopTimer(Timer::Heartbeat));
                self.set_phase(Phase::Cancelled, &mut fx);
                Ok(fx)
            }
            Some(Role::Client) => self.leave(now),
            None => Err(GameError::InvalidPhase(self.phase.as_str())),
        }
    }

    /// Walk away from the current session, returning to idle.
    ///
    /// While active this concedes first.
    pub fn leave(&mut self, now: DateTime<Utc>) -> Result<Vec<Effect>, GameError> {
        let mut fx = Vec::new();
        match (self.role, self.phase) {
            (_, Phase::Idle) => return Ok(fx),
            (_, Phase::Active) => fx.extend(self.concede(now)?),
            (Some(Role::Host), Phase::Waiting | Phase::Countdown) => fx.extend(self.cancel(now)?),
            (Some(Role::Client), Phase::Waiting | Phase::Countdown) => {
                if let Some(local) = self.local_id {
                    self.send_to_host(ControlMessage::participant_left(self.me.peer_id.clone(), local, now), &mut fx);
                }
            }
            _ => {}
        }

        match self.role {
            Some(Role::Client) => {
                fx.push(Effect::StopTimer(Timer::Connect));
                fx.push(Effect::StopTimer(Timer::Watchdog));
                fx.push(Effect::Disconnect);
            }
            Some(Role::Host) => {
                fx.push(Effect::StopAdvertising);
                fx.push(Effect::StopTimer(Timer::Heartbeat));
            }
            None => {}
        }
        self.reset();
        self.set_phase(Phase::Idle, &mut fx);
        Ok(fx)
    }

    // -- transport input --

    /// An advertisement was received while scanning.
    pub fn on_discovered(&mut self, peer: PeerId, local_name: &str, signal_strength: i16) -> Vec<Effect> {
        match self.nearby.observe(peer, local_name, signal_strength) {
            Some(nearby) => vec![Effect::Notify(GameEvent::Discovered(nearby.clone()))],
            None => Vec::new(),
        }
    }

    /// The transport confirmed the connection to the host.
    pub fn on_connected(&mut self, peer: &PeerId, now: DateTime<Utc>) -> Vec<Effect> {
        if self.role != Some(Role::Client) || self.phase != Phase::Joining || self.host_peer.as_ref() != Some(peer) {
            tracing::debug!(%peer, "ignoring unexpected connection");
            return Vec::new();
        }
        tracing::info!(%peer, "connected to host");

        let participant = SessionParticipant::new(
            self.me.peer_id.clone(),
            self.me.display_name.clone(),
            self.me.avatar_color_index,
        );
        self.local_id = Some(participant.id);

        let mut fx = vec![
            Effect::StopTimer(Timer::Connect),
            Effect::Subscribe(peer.clone()),
            Effect::StartTimer(Timer::Watchdog),
        ];
        self.send_to_host(
            ControlMessage::participant_joined(self.me.peer_id.clone(), &participant, now),
            &mut fx,
        );
        fx
    }

    /// A value arrived on the session-state channel.
    pub fn on_snapshot(&mut self, bytes: &[u8], now: DateTime<Utc>) -> Vec<Effect> {
        match accept_snapshot(bytes, &self.config.options) {
            Ok(session) => self.apply_snapshot(session, now),
            Err(e) => {
                tracing::warn!("rejected snapshot: {}", e);
                vec![error_event(&TetherError::from(e))]
            }
        }
    }

    /// A message arrived on the control channel. `from` is the transport
    /// address the message came from, never the claimed sender.
    pub fn on_control(&mut self, from: &PeerId, message: ControlMessage, now: DateTime<Utc>) -> Vec<Effect> {
        let payload = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(%from, kind = %message.kind, "bad control payload: {}", e);
                return vec![error_event(&TetherError::from(e))];
            }
        };

        let mut fx = Vec::new();
        match self.role {
            Some(Role::Host) => self.host_control(from, message.kind, payload, now, &mut fx),
            Some(Role::Client) => self.client_control(message.kind, payload, now, &mut fx),
            None => tracing::debug!(%from, kind = %message.kind, "control message while idle"),
        }
        fx
    }

    /// The transport reported that `peer` went away.
    pub fn on_disconnected(&mut self, peer: &PeerId, now: DateTime<Utc>) -> Vec<Effect> {
        let mut fx = Vec::new();
        match self.role {
            Some(Role::Host) => {
                let id = self
                    .session
                    .as_ref()
                    .and_then(|s| s.participant_by_peer(peer))
                    .filter(|p| !p.is_host)
                    .map(|p| p.id);
                match id {
                    Some(id) => {
                        tracing::info!(%peer, participant = %id.short(), "participant disconnected");
                        self.participant_unreachable(id, now, &mut fx);
                    }
                    None => tracing::debug!(%peer, "disconnect from untracked peer"),
                }
            }
            Some(Role::Client) if self.host_peer.as_ref() == Some(peer) => {
                let err = TetherError::ConnectionFailed(format!("host {peer} disconnected"));
                self.host_unreachable(err, now, &mut fx);
            }
            _ => {}
        }
        fx
    }

    /// The watchdog saw no heartbeat within the timeout.
    pub fn on_heartbeat_timeout(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.role == Some(Role::Client) {
            let err = TetherError::HeartbeatTimeout(self.config.timing.heartbeat_timeout_ms);
            self.host_unreachable(err, now, &mut fx);
        }
        fx
    }

    /// A timer owned by the caller fired.
    pub fn on_timer(&mut self, timer: Timer, now: DateTime<Utc>) -> Vec<Effect> {
        let mut fx = Vec::new();
        match timer {
            Timer::Countdown => self.countdown_tick(now, &mut fx),
            Timer::Active => self.active_tick(now, &mut fx),
            Timer::Connect => {
                if self.phase == Phase::Joining {
                    let err = TetherError::ConnectionTimeout(self.config.timing.connect_timeout_ms);
                    self.abort_join(err, now, &mut fx);
                }
            }
            // driven by the caller's liveness code
            Timer::Heartbeat | Timer::Watchdog => {}
        }
        fx
    }

    /// Surface an error that needs no state change of its own.
    pub fn report(&self, err: &TetherError) -> Vec<Effect> {
        if err.is_fatal() {
            tracing::error!("{}", err);
        } else {
            tracing::warn!("{}", err);
        }
        vec![error_event(err)]
    }

    // -- host internals --

    fn host_control(
        &mut self,
        from: &PeerId,
        kind: MessageType,
        payload: Payload,
        now: DateTime<Utc>,
        fx: &mut Vec<Effect>,
    ) {
        match (kind, payload) {
            (MessageType::ParticipantJoined, Payload::Participant(mut participant)) => {
                if self.phase != Phase::Waiting {
                    tracing::warn!(%from, phase = self.phase.as_str(), "join refused");
                    return;
                }
                // the bearer's address is what disconnect callbacks report
                participant.peer_id = from.clone();
                participant.is_host = false;
                participant.has_lost = false;
                participant.lost_at = None;

                let added = match self.session.as_mut() {
                    Some(session) => session.add_participant(participant.clone()),
                    None => return,
                };
                if added {
                    tracing::info!(%from, name = %participant.display_name, "participant joined");
                    fx.push(Effect::RefreshAdvertisement(self.advertisement()));
                    fx.push(Effect::Notify(GameEvent::ParticipantJoined(participant)));
                }
                self.publish(fx);
            }
            (MessageType::ParticipantLeft, Payload::Identifier(id)) => {
                if !self.speaks_for(from, id) {
                    tracing::warn!(%from, participant = %id.short(), "ignoring leave for another peer");
                    return;
                }
                self.participant_unreachable(id, now, fx);
            }
            (MessageType::Loss, Payload::Identifier(id)) => {
                if !self.speaks_for(from, id) {
                    tracing::warn!(%from, participant = %id.short(), "ignoring loss for another peer");
                } else if self.phase == Phase::Active {
                    self.host_resolve_loss(id, now, fx);
                } else {
                    tracing::debug!(participant = %id.short(), "loss outside active session");
                }
            }
            (MessageType::Ping | MessageType::Pong, _) => {}
            (kind, _) => tracing::debug!(%from, %kind, "ignoring client-originated message"),
        }
    }

    /// Only a participant's own link, or the host itself, may report it gone.
    /// Unknown ids pass through so the usual unknown-participant handling applies.
    fn speaks_for(&self, from: &PeerId, id: ParticipantId) -> bool {
        if *from == self.me.peer_id {
            return true;
        }
        match self.session.as_ref().and_then(|s| s.participant(id)) {
            Some(p) => p.peer_id == *from,
            None => true,
        }
    }

    /// Single entry point for "this participant is gone", whether it said so
    /// or the transport noticed.
    fn participant_unreachable(&mut self, id: ParticipantId, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        match self.phase {
            Phase::Active => self.host_resolve_loss(id, now, fx),
            Phase::Waiting | Phase::Countdown => {
                let removed = self.session.as_mut().map(|s| s.remove_participant(id)).unwrap_or(false);
                if removed {
                    tracing::info!(participant = %id.short(), "participant left");
                    fx.push(Effect::RefreshAdvertisement(self.advertisement()));
                    fx.push(Effect::Notify(GameEvent::ParticipantLeft(id)));
                    self.publish(fx);
                }
            }
            _ => {}
        }
    }

    fn host_resolve_loss(&mut self, id: ParticipantId, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.mark_lost(id, now) {
            Ok(true) => {
                tracing::info!(loser = %id.short(), "participant lost");
                self.publish(fx);
                self.broadcast(ControlMessage::game_end(self.me.peer_id.clone(), Some(id), now), fx);
                self.enter_ended(fx);
            }
            Ok(false) => tracing::debug!(participant = %id.short(), "loss already resolved"),
            Err(e) => tracing::warn!("ignoring loss: {}", e),
        }
    }

    fn host_start(&mut self, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        let started = self.session.as_mut().map(|s| s.start(now)).unwrap_or(false);
        if !started {
            return;
        }
        tracing::info!("session active");
        // snapshot first so gameStart finds started_at already replicated
        self.publish(fx);
        self.broadcast(Ok(ControlMessage::game_start(self.me.peer_id.clone(), now)), fx);
        self.enter_active(now, fx);
    }

    fn countdown_tick(&mut self, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        if self.role != Some(Role::Host) || self.phase != Phase::Countdown {
            return;
        }
        self.countdown_remaining = self.countdown_remaining.saturating_sub(1);
        if self.countdown_remaining > 0 {
            fx.push(Effect::Feedback(Cue::CountdownTick));
            fx.push(Effect::Notify(GameEvent::CountdownTick(self.countdown_remaining)));
            return;
        }

        fx.push(Effect::StopTimer(Timer::Countdown));
        if let Err(e) = self.require_quorum() {
            // someone left during the countdown
            tracing::warn!("countdown aborted: {}", e);
            if let Some(session) = self.session.as_mut() {
                session.state = SessionState::Waiting;
            }
            self.publish(fx);
            self.set_phase(Phase::Waiting, fx);
            fx.push(Effect::Notify(GameEvent::Error {
                message: e.to_string(),
                fatal: false,
            }));
            return;
        }
        self.host_start(now, fx);
    }

    fn active_tick(&mut self, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        if self.phase != Phase::Active {
            return;
        }
        let Some(remaining) = self.remaining_secs(now) else {
            tracing::warn!("active without a start time, skipping tick");
            return;
        };
        fx.push(Effect::Notify(GameEvent::Tick { remaining_secs: remaining }));
        if remaining > 0 {
            return;
        }

        tracing::info!("timer exhausted");
        if let Some(session) = self.session.as_mut() {
            session.end(now);
        }
        if self.role == Some(Role::Host) {
            self.publish(fx);
            self.broadcast(ControlMessage::game_end(self.me.peer_id.clone(), None, now), fx);
        }
        self.enter_ended(fx);
    }

    // -- client internals --

    fn client_control(&mut self, kind: MessageType, payload: Payload, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        match (kind, payload) {
            (MessageType::SessionInfo, Payload::Session(session))
            | (MessageType::GameStart, Payload::Session(session)) => {
                if let Err(e) = validate_snapshot(&session, &self.config.options) {
                    tracing::warn!("rejected session record: {}", e);
                    fx.push(error_event(&TetherError::from(e)));
                    return;
                }
                fx.extend(self.apply_snapshot(*session, now));
            }
            (MessageType::GameStart, Payload::None) => self.client_game_start(now, fx),
            (MessageType::GameEnd, Payload::Identifier(id)) | (MessageType::Loss, Payload::Identifier(id)) => {
                self.client_game_end(Some(id), now, fx)
            }
            (MessageType::GameEnd, Payload::None) => self.client_game_end(None, now, fx),
            (MessageType::ParticipantJoined, Payload::Participant(participant)) => {
                let added = self
                    .session
                    .as_mut()
                    .map(|s| s.add_participant(participant.clone()))
                    .unwrap_or(false);
                if added {
                    fx.push(Effect::Notify(GameEvent::ParticipantJoined(participant)));
                }
            }
            (MessageType::ParticipantLeft, Payload::Identifier(id)) => {
                let removed = self.session.as_mut().map(|s| s.remove_participant(id)).unwrap_or(false);
                if removed {
                    fx.push(Effect::Notify(GameEvent::ParticipantLeft(id)));
                }
            }
            (MessageType::Ping | MessageType::Pong, _) => {}
            (kind, _) => tracing::debug!(%kind, "unexpected message on client"),
        }
    }

    /// Replace the mirror and follow the host's state.
    fn apply_snapshot(&mut self, mut session: Session, now: DateTime<Utc>) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.role != Some(Role::Client) || matches!(self.phase, Phase::Idle | Phase::Cancelled) {
            tracing::debug!("snapshot outside a joined session");
            return fx;
        }

        // records delivered out of order must not walk the session backwards
        let stale = match self.phase {
            Phase::Active => matches!(session.state, SessionState::Waiting | SessionState::Countdown),
            Phase::Ended => session.state != SessionState::Ended,
            _ => false,
        };
        if stale {
            tracing::debug!(
                state = session.state.as_str(),
                phase = self.phase.as_str(),
                "ignoring stale session record"
            );
            return fx;
        }

        let admitted = self.local_id.map(|id| session.participant(id).is_some()).unwrap_or(false);
        if !admitted && matches!(session.state, SessionState::Countdown | SessionState::Active | SessionState::Ended) {
            if matches!(self.phase, Phase::Joining | Phase::Waiting) {
                self.abort_join(TetherError::InvalidSession("session started without us".into()), now, &mut fx);
            }
            return fx;
        }

        if let Some(old) = self.session.as_ref() {
            for p in session.participants.iter().filter(|p| old.participant(p.id).is_none()) {
                fx.push(Effect::Notify(GameEvent::ParticipantJoined(p.clone())));
            }
            for p in old.participants.iter().filter(|p| session.participant(p.id).is_none()) {
                fx.push(Effect::Notify(GameEvent::ParticipantLeft(p.id)));
            }
        }

        let state = session.state;
        let authoritative_anchor = session.started_at.is_some();

        // a known start time only yields to the host's when ours was local
        let known = self.session.as_ref().filter(|s| s.id == session.id).and_then(|s| s.started_at);
        if let Some(known) = known {
            if !authoritative_anchor || !self.degraded_anchor {
                session.started_at = Some(known);
            }
        }
        self.session = Some(session);

        match state {
            SessionState::Waiting => {
                if matches!(self.phase, Phase::Joining | Phase::Countdown) {
                    self.set_phase(Phase::Waiting, &mut fx);
                }
            }
            SessionState::Countdown => {
                if matches!(self.phase, Phase::Joining | Phase::Waiting) {
                    self.set_phase(Phase::Countdown, &mut fx);
                }
            }
            SessionState::Active => {
                if self.phase == Phase::Active {
                    if self.degraded_anchor && authoritative_anchor {
                        tracing::info!("authoritative start time replaced local anchor");
                        self.degraded_anchor = false;
                        let remaining = self.remaining_secs(now).unwrap_or(0);
                        fx.push(Effect::Notify(GameEvent::Tick { remaining_secs: remaining }));
                    }
                } else if !self.phase.is_resting() {
                    self.degraded_anchor = false;
                    self.enter_active(now, &mut fx);
                }
            }
            SessionState::Ended => {
                if !self.phase.is_resting() {
                    self.enter_ended(&mut fx);
                }
            }
            SessionState::Cancelled => {
                if !self.phase.is_resting() {
                    tracing::info!("host cancelled the session");
                    fx.push(Effect::StopTimer(Timer::Watchdog));
                    fx.push(Effect::StopTimer(Timer::Active));
                    fx.push(Effect::Disconnect);
                    self.refund();
                    self.set_phase(Phase::Cancelled, &mut fx);
                }
            }
        }
        fx
    }

    fn client_game_start(&mut self, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        if !matches!(self.phase, Phase::Waiting | Phase::Countdown) {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.started_at.is_none() {
            tracing::warn!("gameStart without start time, anchoring locally");
            session.start(now);
            self.degraded_anchor = true;
        } else {
            session.state = SessionState::Active;
        }
        self.enter_active(now, fx);
    }

    fn client_game_end(&mut self, loser: Option<ParticipantId>, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        if self.phase.is_resting() || self.phase == Phase::Joining {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match loser {
            Some(id) => {
                if let Err(e) = session.mark_lost(id, now) {
                    tracing::warn!("ignoring game end: {}", e);
                    return;
                }
            }
            None => session.end(now),
        }
        self.enter_ended(fx);
    }

    /// The host went away: lose it if active, otherwise abandon the join.
    fn host_unreachable(&mut self, err: TetherError, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        match self.phase {
            Phase::Active => {
                tracing::warn!("host unreachable during active session: {}", err);
                if let Some(session) = self.session.as_mut() {
                    let host = session.host_id;
                    if let Err(e) = session.mark_lost(host, now) {
                        tracing::warn!("host loss not recorded: {}", e);
                    }
                }
                fx.push(error_event(&err));
                fx.push(Effect::Disconnect);
                self.enter_ended(fx);
            }
            Phase::Joining | Phase::Waiting | Phase::Countdown => self.abort_join(err, now, fx),
            _ => {}
        }
    }

    fn abort_join(&mut self, err: TetherError, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        tracing::warn!("join aborted: {}", err);
        if let Some(session) = self.session.as_mut() {
            session.cancel(now);
        }
        fx.push(Effect::StopTimer(Timer::Connect));
        fx.push(Effect::StopTimer(Timer::Watchdog));
        fx.push(Effect::Disconnect);
        fx.push(Effect::Notify(GameEvent::Error {
            message: err.to_string(),
            fatal: true,
        }));
        self.set_phase(Phase::Cancelled, fx);
    }

    // -- shared internals --

    fn enter_active(&mut self, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        if let Some(session) = self.session.as_ref() {
            if !self.bet_debited {
                if self.wallet.debit(session.bet_amount, Reason::Bet(session.id)) {
                    self.bet_debited = true;
                } else {
                    fx.push(error_event(&TetherError::InvalidSession(
                        GameError::InsufficientBalance(session.bet_amount).to_string(),
                    )));
                }
            }
        }

        fx.push(Effect::StopTimer(Timer::Countdown));
        fx.push(Effect::StartTimer(Timer::Active));
        fx.push(Effect::StartLifecycle);
        fx.push(Effect::Feedback(Cue::GameStart));
        self.set_phase(Phase::Active, fx);
        let remaining = self.remaining_secs(now).unwrap_or(0);
        fx.push(Effect::Notify(GameEvent::Tick { remaining_secs: remaining }));
    }

    fn enter_ended(&mut self, fx: &mut Vec<Effect>) {
        if self.phase == Phase::Ended {
            return;
        }
        fx.push(Effect::StopTimer(Timer::Active));
        fx.push(Effect::StopTimer(Timer::Countdown));
        fx.push(Effect::StopTimer(Timer::Watchdog));
        fx.push(Effect::StopLifecycle);
        if self.role == Some(Role::Host) {
            fx.push(Effect::StopAdvertising);
            fx.push(Effect::StopTimer(Timer::Heartbeat));
        }
        self.set_phase(Phase::Ended, fx);

        let (Some(session), Some(local)) = (self.session.as_ref(), self.local_id) else {
            return;
        };
        let outcome = settle(session, local);
        if self.bet_debited && !self.settled {
            self.settled = true;
            if outcome.credit > 0 {
                let reason = match outcome.loser_id {
                    Some(_) => Reason::Winnings(session.id),
                    None => Reason::Refund(session.id),
                };
                self.wallet.credit(outcome.credit, reason);
            }
        }
        tracing::info!(won = outcome.won, credit = outcome.credit, pot = outcome.pot, "session ended");
        fx.push(Effect::Feedback(if outcome.won { Cue::Victory } else { Cue::Loss }));
        fx.push(Effect::Notify(GameEvent::Ended(outcome)));
    }

    /// return a debited bet without a result
    fn refund(&mut self) {
        if let Some(session) = self.session.as_ref() {
            if self.bet_debited && !self.settled {
                self.settled = true;
                self.wallet.credit(session.bet_amount, Reason::Refund(session.id));
            }
        }
    }

    fn set_phase(&mut self, phase: Phase, fx: &mut Vec<Effect>) {
        if self.phase != phase {
            tracing::debug!(from = self.phase.as_str(), to = phase.as_str(), "phase");
            self.phase = phase;
            fx.push(Effect::Notify(GameEvent::PhaseChanged(phase)));
        }
    }

    fn publish(&self, fx: &mut Vec<Effect>) {
        if let Some(session) = self.session.as_ref() {
            match encode_snapshot(session) {
                Ok(bytes) => fx.push(Effect::PublishSnapshot(bytes)),
                Err(e) => fx.push(error_event(&TetherError::from(e))),
            }
        }
    }

    fn broadcast(&self, message: Result<ControlMessage, ProtocolError>, fx: &mut Vec<Effect>) {
        match message {
            Ok(message) => fx.push(Effect::Broadcast(message)),
            Err(e) => fx.push(error_event(&TetherError::from(e))),
        }
    }

    fn send_to_host(&self, message: Result<ControlMessage, ProtocolError>, fx: &mut Vec<Effect>) {
        match message {
            Ok(message) => fx.push(Effect::SendToHost(message)),
            Err(e) => fx.push(error_event(&TetherError::from(e))),
        }
    }

    fn advertisement(&self) -> String {
        self.session
            .as_ref()
            .map(|s| Advertisement::for_session(s).encode(&self.config.discovery))
            .unwrap_or_default()
    }

    fn require_host(&self) -> Result<(), GameError> {
        match self.role {
            Some(Role::Host) => Ok(()),
            _ => Err(GameError::NotHost),
        }
    }

    fn require_quorum(&self) -> Result<(), GameError> {
        let have = self.session.as_ref().map(|s| s.participants.len()).unwrap_or(0);
        let needed = self.config.transport.min_participants;
        if have < needed {
            return Err(GameError::NotEnoughParticipants { needed, have });
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.role = None;
        self.session = None;
        self.local_id = None;
        self.host_peer = None;
        self.countdown_remaining = 0;
        self.degraded_anchor = false;
        self.bet_debited = false;
        self.settled = false;
    }
}

fn error_event(err: &TetherError) -> Effect {
    Effect::Notify(GameEvent::Error {
        message: err.to_string(),
        fatal: err.is_fatal(),
    })
}
