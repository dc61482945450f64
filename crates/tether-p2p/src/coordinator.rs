//! coordinator - one task per device that owns the game machine
//!
//! every input funnels into a single `select!` loop: user commands from the
//! [`CoordinatorHandle`], bearer events, and the timers the machine asked
//! for. nothing else touches the session, so no two mutations interleave.
//!
//! ```text
//! handle ──commands──┐
//! bearer ──events────┼──> Coordinator ──effects──> bearer / timers / collaborators
//! timers ──ticks─────┘          └──────GameEvent──> application
//! ```

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};

use tether_core::{
    ControlMessage, Effect, Feedback, GameError, GameEvent, GameMachine, IdentityProvider, Lifecycle, NearbySession,
    ParticipantId, Phase, PeerId, Role, Session, TetherConfig, TetherError, Timer, Wallet,
};
use thiserror::Error;

use crate::client::ClientLink;
use crate::clock::Clock;
use crate::host::HostChannels;
use crate::liveness::{Heartbeat, HeartbeatEmitter, Watchdog};
use crate::transport::{CentralBearer, Channel, PeripheralBearer, TransportEvent};

/// everything outside the session the coordinator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub wallet: Arc<dyn Wallet>,
    pub feedback: Arc<dyn Feedback>,
    pub lifecycle: Arc<dyn Lifecycle>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error(transparent)]
    Game(#[from] GameError),

    #[error("coordinator stopped")]
    Stopped,
}

/// point-in-time view for the application
#[derive(Clone, Debug)]
pub struct SessionView {
    pub phase: Phase,
    pub role: Option<Role>,
    pub session: Option<Session>,
    pub local_id: Option<ParticipantId>,
    pub remaining_secs: Option<u64>,
    pub nearby: Vec<NearbySession>,
}

type Reply = oneshot::Sender<Result<(), GameError>>;

enum Command {
    Host { duration_minutes: u32, bet_amount: u64, reply: Reply },
    StartScan,
    StopScan,
    Join { host: PeerId, reply: Reply },
    StartCountdown { reply: Reply },
    StartNow { reply: Reply },
    Concede { reply: Reply },
    AppBackgrounded,
    Cancel { reply: Reply },
    Leave { reply: Reply },
    Snapshot { reply: oneshot::Sender<SessionView> },
    Shutdown,
}

/// cloneable handle to a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    pub async fn host(&self, duration_minutes: u32, bet_amount: u64) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Host {
            duration_minutes,
            bet_amount,
            reply,
        })
        .await
    }

    pub async fn start_scan(&self) -> Result<(), CoordinatorError> {
        self.send(Command::StartScan).await
    }

    pub async fn stop_scan(&self) -> Result<(), CoordinatorError> {
        self.send(Command::StopScan).await
    }

    pub async fn join(&self, host: PeerId) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Join { host, reply }).await
    }

    pub async fn start_countdown(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::StartCountdown { reply }).await
    }

    pub async fn start_now(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::StartNow { reply }).await
    }

    pub async fn concede(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Concede { reply }).await
    }

    /// the application lost the foreground
    pub async fn app_backgrounded(&self) -> Result<(), CoordinatorError> {
        self.send(Command::AppBackgrounded).await
    }

    pub async fn cancel(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    pub async fn leave(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Leave { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionView, CoordinatorError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        response.await.map_err(|_| CoordinatorError::Stopped)
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.commands.send(command).await.map_err(|_| CoordinatorError::Stopped)
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), CoordinatorError> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply)).await?;
        response.await.map_err(|_| CoordinatorError::Stopped)??;
        Ok(())
    }
}

#[derive(Default)]
struct Timers {
    countdown: Option<Interval>,
    active: Option<Interval>,
    heartbeat: Option<Interval>,
    watchdog: Option<Interval>,
    connect: Option<Pin<Box<Sleep>>>,
}

pub struct Coordinator {
    config: TetherConfig,
    machine: GameMachine,
    host: HostChannels,
    client: ClientLink,
    feedback: Arc<dyn Feedback>,
    lifecycle: Arc<dyn Lifecycle>,
    clock: Arc<dyn Clock>,
    events: mpsc::Sender<GameEvent>,
    timers: Timers,
    watchdog: Watchdog,
    emitter: HeartbeatEmitter,
}

impl Coordinator {
    /// Start a coordinator task for one device.
    ///
    /// `transport_events` must be the queue both bearers report into.
    pub fn spawn(
        config: TetherConfig,
        collaborators: Collaborators,
        peripheral: Box<dyn PeripheralBearer>,
        central: Box<dyn CentralBearer>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (CoordinatorHandle, mpsc::Receiver<GameEvent>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);

        let machine = GameMachine::new(
            config.clone(),
            collaborators.identity.as_ref(),
            collaborators.wallet.clone(),
        );
        let coordinator = Self {
            host: HostChannels::new(peripheral, config.transport.max_transfer_size),
            client: ClientLink::new(central),
            watchdog: Watchdog::new(config.timing.heartbeat_timeout()),
            emitter: HeartbeatEmitter::new(),
            feedback: collaborators.feedback,
            lifecycle: collaborators.lifecycle,
            clock: collaborators.clock,
            events: event_tx,
            timers: Timers::default(),
            machine,
            config,
        };

        tokio::spawn(coordinator.run(command_rx, transport_events));
        (CoordinatorHandle { commands: command_tx }, event_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        tracing::info!(peer = %self.machine.local_peer_id(), "coordinator started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = transport.recv() => self.handle_transport(event),
                _ = tick(&mut self.timers.countdown) => self.fire(Timer::Countdown),
                _ = tick(&mut self.timers.active) => self.fire(Timer::Active),
                _ = tick(&mut self.timers.heartbeat) => self.emit_heartbeat(),
                _ = tick(&mut self.timers.watchdog) => self.check_watchdog(),
                _ = deadline(&mut self.timers.connect) => {
                    self.timers.connect = None;
                    self.fire(Timer::Connect);
                }
            }
        }

        self.host.reset();
        self.client.disconnect();
        tracing::info!("coordinator stopped");
    }

    fn handle_command(&mut self, command: Command) {
        let now = self.clock.now();
        match command {
            Command::Host {
                duration_minutes,
                bet_amount,
                reply,
            } => {
                let result = self.machine.host(duration_minutes, bet_amount, now);
                self.answer(result, reply);
            }
            Command::StartScan => {
                let fx = self.machine.start_scan();
                self.apply(fx);
            }
            Command::StopScan => {
                let fx = self.machine.stop_scan();
                self.apply(fx);
            }
            Command::Join { host, reply } => {
                let result = self.machine.join(&host, now);
                self.answer(result, reply);
            }
            Command::StartCountdown { reply } => {
                let result = self.machine.start_countdown(now);
                self.answer(result, reply);
            }
            Command::StartNow { reply } => {
                let result = self.machine.start_now(now);
                self.answer(result, reply);
            }
            Command::Concede { reply } => {
                let result = self.machine.concede(now);
                self.answer(result, reply);
            }
            Command::AppBackgrounded => {
                let fx = self.machine.app_backgrounded(now);
                self.apply(fx);
            }
            Command::Cancel { reply } => {
                let result = self.machine.cancel(now);
                self.answer(result, reply);
            }
            Command::Leave { reply } => {
                let result = self.machine.leave(now);
                self.answer(result, reply);
            }
            Command::Snapshot { reply } => {
                let view = SessionView {
                    phase: self.machine.phase(),
                    role: self.machine.role(),
                    session: self.machine.session().cloned(),
                    local_id: self.machine.local_id(),
                    remaining_secs: self.machine.remaining_secs(now),
                    nearby: self.machine.nearby().sorted(),
                };
                let _ = reply.send(view);
            }
            Command::Shutdown => {}
        }
    }

    fn answer(&mut self, result: Result<Vec<Effect>, GameError>, reply: Reply) {
        match result {
            Ok(fx) => {
                self.apply(fx);
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                tracing::debug!("command refused: {}", e);
                let _ = reply.send(Err(e));
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        let now = self.clock.now();
        let fx = match event {
            TransportEvent::Unavailable(reason) => self.machine.report(&TetherError::TransportUnavailable(reason)),

            TransportEvent::Subscribed { peer, channel } => {
                if self.host.on_subscribed(peer.clone(), channel) {
                    tracing::debug!(%peer, channel = channel.as_str(), "subscribed");
                }
                // a new subscriber gets the current snapshot right away
                if channel == Channel::SessionState && self.machine.role() == Some(Role::Host) {
                    if let Some(bytes) = self.machine.snapshot_bytes() {
                        if let Err(e) = self.host.send_to(&peer, Channel::SessionState, bytes) {
                            self.report(e.into());
                        }
                    }
                }
                Vec::new()
            }
            TransportEvent::Unsubscribed { peer, channel } => {
                self.host.on_unsubscribed(&peer, channel);
                Vec::new()
            }
            TransportEvent::Written { peer, channel, value } => match channel {
                Channel::Control => match ControlMessage::decode(&value) {
                    Ok(message) => self.machine.on_control(&peer, message, now),
                    Err(e) => self.machine.report(&e.into()),
                },
                other => {
                    tracing::debug!(%peer, channel = other.as_str(), "ignoring write");
                    Vec::new()
                }
            },
            TransportEvent::ReadRequest {
                peer,
                channel,
                offset,
                respond,
            } => {
                let response = self.host.read(channel, offset);
                if let Err(e) = &response {
                    tracing::debug!(%peer, offset, "read refused: {}", e);
                }
                let _ = respond.send(response);
                Vec::new()
            }
            TransportEvent::ReadyToUpdate => match self.host.on_ready() {
                Ok(_) => Vec::new(),
                Err(e) => self.machine.report(&e.into()),
            },

            TransportEvent::Discovered {
                peer,
                local_name,
                signal_strength,
            } => self.machine.on_discovered(peer, &local_name, signal_strength),
            TransportEvent::Connected { peer } => {
                self.client.on_connected(&peer);
                self.machine.on_connected(&peer, now)
            }
            TransportEvent::ConnectFailed { peer, reason } => {
                tracing::warn!(%peer, "connect failed: {}", reason);
                self.client.on_disconnected(&peer);
                self.machine.on_disconnected(&peer, now)
            }
            TransportEvent::Notified { peer, channel, value } => match channel {
                Channel::SessionState => self.machine.on_snapshot(&value, now),
                Channel::Control => match ControlMessage::decode(&value) {
                    Ok(message) => self.machine.on_control(&peer, message, now),
                    Err(e) => self.machine.report(&e.into()),
                },
                Channel::Heartbeat => {
                    // undecodable still proves the host is there
                    self.watchdog.observe(Instant::now());
                    match Heartbeat::decode(&value) {
                        Ok(heartbeat) => {
                            tracing::trace!(seq = heartbeat.seq, "heartbeat");
                            Vec::new()
                        }
                        Err(e) => self.machine.report(&e.into()),
                    }
                }
            },

            TransportEvent::Disconnected { peer } => {
                tracing::info!(%peer, "disconnected");
                self.host.on_disconnected(&peer);
                self.client.on_disconnected(&peer);
                self.machine.on_disconnected(&peer, now)
            }
        };
        self.apply(fx);
    }

    fn fire(&mut self, timer: Timer) {
        let fx = self.machine.on_timer(timer, self.clock.now());
        self.apply(fx);
    }

    fn emit_heartbeat(&mut self) {
        let heartbeat = self.emitter.next(self.clock.now());
        match heartbeat.encode() {
            Ok(bytes) => {
                if let Err(e) = self.host.publish(Channel::Heartbeat, bytes) {
                    tracing::warn!("heartbeat publish failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("{}", e),
        }
    }

    fn check_watchdog(&mut self) {
        let now = Instant::now();
        if !self.watchdog.is_expired(now) {
            return;
        }
        let silence = self.watchdog.silence(now).unwrap_or_default();
        tracing::warn!(silence_ms = silence.as_millis() as u64, "heartbeat timeout");
        self.watchdog.disarm();
        self.timers.watchdog = None;
        let fx = self.machine.on_heartbeat_timeout(self.clock.now());
        self.apply(fx);
    }

    fn report(&mut self, err: TetherError) {
        let fx = self.machine.report(&err);
        self.apply(fx);
    }

    /// Carry out effects in order. Failures feed back in as more effects.
    fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            let failure: Option<TetherError> = match effect {
                Effect::StartAdvertising(name) => self.host.start_advertising(&name).err().map(Into::into),
                Effect::RefreshAdvertisement(name) => self.host.refresh_advertisement(&name).err().map(Into::into),
                Effect::StopAdvertising => {
                    self.host.stop_advertising();
                    None
                }
                Effect::StartScan => self.client.start_scan().err().map(Into::into),
                Effect::StopScan => {
                    self.client.stop_scan();
                    None
                }
                Effect::PublishSnapshot(bytes) => self.host.publish(Channel::SessionState, bytes).err().map(Into::into),
                Effect::Broadcast(message) => match message.encode() {
                    Ok(bytes) => self.host.publish(Channel::Control, bytes).err().map(Into::into),
                    Err(e) => Some(e.into()),
                },
                Effect::SendToHost(message) => match message.encode() {
                    Ok(bytes) => self.client.write_control(&bytes).err().map(Into::into),
                    Err(e) => Some(e.into()),
                },
                Effect::Connect(peer) => {
                    if let Err(e) = self.client.connect(&peer) {
                        tracing::warn!(%peer, "connect failed: {}", e);
                        queue.extend(self.machine.on_disconnected(&peer, self.clock.now()));
                    }
                    None
                }
                Effect::Subscribe(_) => self.client.subscribe_all().err().map(Into::into),
                Effect::Disconnect => {
                    self.client.disconnect();
                    None
                }
                Effect::StartTimer(timer) => {
                    self.start_timer(timer);
                    None
                }
                Effect::StopTimer(timer) => {
                    self.stop_timer(timer);
                    None
                }
                Effect::StartLifecycle => {
                    self.lifecycle.start_monitoring();
                    None
                }
                Effect::StopLifecycle => {
                    self.lifecycle.stop_monitoring();
                    None
                }
                Effect::Feedback(cue) => {
                    self.feedback.play(cue);
                    None
                }
                Effect::Notify(event) => {
                    // never block the loop on the listener
                    match self.events.try_send(event) {
                        Ok(()) => {}
                        Err(TrySendError::Full(event)) => tracing::warn!(?event, "event queue full, dropping event"),
                        Err(TrySendError::Closed(_)) => tracing::trace!("no event listener"),
                    }
                    None
                }
            };
            if let Some(err) = failure {
                queue.extend(self.machine.report(&err));
            }
        }
    }

    fn start_timer(&mut self, timer: Timer) {
        let timing = self.config.timing.clone();
        match timer {
            Timer::Countdown => self.timers.countdown = Some(periodic(timing.tick_interval())),
            Timer::Active => self.timers.active = Some(periodic(timing.tick_interval())),
            Timer::Heartbeat => {
                self.emit_heartbeat();
                self.timers.heartbeat = Some(periodic(timing.heartbeat_interval()));
            }
            Timer::Watchdog => {
                self.watchdog.arm(Instant::now());
                self.timers.watchdog = Some(periodic(timing.watchdog_interval()));
            }
            Timer::Connect => self.timers.connect = Some(Box::pin(sleep(timing.connect_timeout()))),
        }
    }

    fn stop_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Countdown => self.timers.countdown = None,
            Timer::Active => self.timers.active = None,
            Timer::Heartbeat => self.timers.heartbeat = None,
            Timer::Watchdog => {
                self.watchdog.disarm();
                self.timers.watchdog = None;
            }
            Timer::Connect => self.timers.connect = None,
        }
    }
}

/// interval whose first tick is one period away
fn periodic(period: std::time::Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn deadline(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
