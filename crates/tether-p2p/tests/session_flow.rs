//! end-to-end sessions between coordinators over the loopback bearer

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use tether_core::collaborators::Silent;
use tether_core::replication::decode_snapshot;
use tether_core::{GameError, GameEvent, Ledger, Phase, PeerId, StaticIdentity, TetherConfig, Wallet};
use tether_p2p::client::ClientLink;
use tether_p2p::transport::{ReadError, TransportEvent};
use tether_p2p::{Air, Channel, Collaborators, Coordinator, CoordinatorError, CoordinatorHandle, MonotonicClock};

struct Device {
    name: &'static str,
    peer: PeerId,
    handle: CoordinatorHandle,
    wallet: Arc<Ledger>,
    events: Arc<Mutex<Vec<GameEvent>>>,
    // held but never read
    _unread: Option<mpsc::Receiver<GameEvent>>,
}

impl Device {
    fn spawn(air: &Air, clock: &MonotonicClock, name: &'static str) -> Self {
        Self::start(air, clock, name, true)
    }

    /// a device whose application never reads its events
    fn spawn_undrained(air: &Air, clock: &MonotonicClock, name: &'static str) -> Self {
        Self::start(air, clock, name, false)
    }

    fn start(air: &Air, clock: &MonotonicClock, name: &'static str, drain: bool) -> Self {
        let (peripheral, central, transport_rx) = air.device(name);
        let wallet = Arc::new(Ledger::new());
        let collaborators = Collaborators {
            identity: Arc::new(StaticIdentity::new(name, name, 0)),
            wallet: wallet.clone(),
            feedback: Arc::new(Silent),
            lifecycle: Arc::new(Silent),
            clock: Arc::new(clock.clone()),
        };
        let (handle, mut rx) = Coordinator::spawn(
            TetherConfig::default(),
            collaborators,
            Box::new(peripheral),
            Box::new(central),
            transport_rx,
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let mut unread = None;
        if drain {
            let sink = events.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    sink.lock().push(event);
                }
            });
        } else {
            unread = Some(rx);
        }

        Self {
            name,
            peer: PeerId::from(name),
            handle,
            wallet,
            events,
            _unread: unread,
        }
    }

    fn saw(&self, pred: &impl Fn(&GameEvent) -> bool) -> bool {
        self.events.lock().iter().any(pred)
    }

    async fn wait_for(&self, what: &str, pred: impl Fn(&GameEvent) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(30 * 60);
        while !self.saw(&pred) {
            assert!(Instant::now() < deadline, "{} never saw {}", self.name, what);
            sleep(Duration::from_millis(100)).await;
        }
    }

    async fn wait_phase(&self, phase: Phase) {
        self.wait_for(phase.as_str(), |e| *e == GameEvent::PhaseChanged(phase)).await;
    }

    async fn phase(&self) -> Phase {
        self.handle.snapshot().await.unwrap().phase
    }

    fn outcome(&self) -> Option<tether_core::Outcome> {
        self.events.lock().iter().find_map(|e| match e {
            GameEvent::Ended(outcome) => Some(outcome.clone()),
            _ => None,
        })
    }
}

fn setup() -> (Air, MonotonicClock) {
    let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    (Air::new(), MonotonicClock::new(base))
}

/// scan, see the host and join it, then wait until the host has admitted us
async fn join(client: &Device, host: &Device) {
    client.handle.start_scan().await.unwrap();
    let host_peer = host.peer.clone();
    client
        .wait_for("host advertisement", |e| matches!(e, GameEvent::Discovered(n) if n.host_peer_id == host_peer))
        .await;
    client.handle.join(host.peer.clone()).await.unwrap();
    client.wait_phase(Phase::Waiting).await;

    let client_peer = client.peer.clone();
    host.wait_for("join", |e| matches!(e, GameEvent::ParticipantJoined(p) if p.peer_id == client_peer))
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_timer_exhaustion_refunds_everyone() {
    let (air, clock) = setup();
    let host = Device::spawn(&air, &clock, "emma");
    let client = Device::spawn(&air, &clock, "noah");

    host.handle.host(5, 15).await.unwrap();
    join(&client, &host).await;

    host.handle.start_countdown().await.unwrap();
    host.wait_for("countdown", |e| *e == GameEvent::CountdownTick(1)).await;
    tokio::join!(host.wait_phase(Phase::Active), client.wait_phase(Phase::Active));
    assert_eq!(host.wallet.balance(), 85);
    assert_eq!(client.wallet.balance(), 85);

    tokio::join!(host.wait_phase(Phase::Ended), client.wait_phase(Phase::Ended));

    for device in [&host, &client] {
        let outcome = device.outcome().unwrap();
        assert_eq!(outcome.loser_id, None);
        assert_eq!(outcome.credit, 15);
        assert_eq!(outcome.pot, 30);
        assert_eq!(device.wallet.balance(), 100);
    }
}

#[tokio::test(start_paused = true)]
async fn test_severed_client_loses() {
    let (air, clock) = setup();
    let host = Device::spawn(&air, &clock, "emma");
    let quitter = Device::spawn(&air, &clock, "liam");
    let stayer = Device::spawn(&air, &clock, "ava");

    host.handle.host(10, 20).await.unwrap();
    join(&quitter, &host).await;
    join(&stayer, &host).await;

    host.handle.start_now().await.unwrap();
    tokio::join!(
        host.wait_phase(Phase::Active),
        quitter.wait_phase(Phase::Active),
        stayer.wait_phase(Phase::Active)
    );

    sleep(Duration::from_secs(30)).await;
    air.sever(&quitter.peer, &host.peer);

    tokio::join!(host.wait_phase(Phase::Ended), stayer.wait_phase(Phase::Ended));
    let quitter_id = quitter.handle.snapshot().await.unwrap().local_id.unwrap();

    for device in [&host, &stayer] {
        let outcome = device.outcome().unwrap();
        assert_eq!(outcome.loser_id, Some(quitter_id));
        assert!(outcome.won);
        assert_eq!(outcome.credit, 30);
        assert_eq!(device.wallet.balance(), 110);
    }
    assert_eq!(quitter.phase().await, Phase::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_client_concession_over_control_channel() {
    let (air, clock) = setup();
    let host = Device::spawn(&air, &clock, "emma");
    let client = Device::spawn(&air, &clock, "noah");

    host.handle.host(15, 10).await.unwrap();
    join(&client, &host).await;
    host.handle.start_now().await.unwrap();
    client.wait_phase(Phase::Active).await;

    client.handle.concede().await.unwrap();
    tokio::join!(host.wait_phase(Phase::Ended), client.wait_phase(Phase::Ended));

    assert!(host.outcome().unwrap().won);
    assert!(!client.outcome().unwrap().won);
    assert_eq!(host.wallet.balance(), 110);
    assert_eq!(client.wallet.balance(), 90);
}

#[tokio::test(start_paused = true)]
async fn test_silent_host_times_out() {
    let (air, clock) = setup();
    let host = Device::spawn(&air, &clock, "emma");
    let client = Device::spawn(&air, &clock, "noah");

    host.handle.host(15, 15).await.unwrap();
    join(&client, &host).await;
    host.handle.start_now().await.unwrap();
    client.wait_phase(Phase::Active).await;

    air.set_silenced(&host.peer, true);
    client.wait_phase(Phase::Ended).await;

    assert!(client.saw(&|e: &GameEvent| matches!(e, GameEvent::Error { fatal: true, message } if message.contains("heartbeat"))));
    let outcome = client.outcome().unwrap();
    assert!(outcome.won);
    assert_eq!(client.wallet.balance(), 115);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_host_connect_timeout() {
    let (air, clock) = setup();
    let host = Device::spawn(&air, &clock, "emma");
    let client = Device::spawn(&air, &clock, "noah");

    host.handle.host(15, 15).await.unwrap();
    air.set_unreachable(&host.peer, true);

    client.handle.start_scan().await.unwrap();
    client.wait_for("advertisement", |e| matches!(e, GameEvent::Discovered(_))).await;
    client.handle.join(host.peer.clone()).await.unwrap();
    assert_eq!(client.phase().await, Phase::Joining);

    client.wait_phase(Phase::Cancelled).await;
    assert!(client.saw(&|e: &GameEvent| matches!(e, GameEvent::Error { fatal: true, message } if message.contains("timed out"))));
    assert_eq!(client.wallet.balance(), 100);
    assert_eq!(host.phase().await, Phase::Waiting);
}

#[tokio::test(start_paused = true)]
async fn test_congested_host_delivers_after_ready() {
    let (air, clock) = setup();
    let host = Device::spawn(&air, &clock, "emma");
    let client = Device::spawn(&air, &clock, "noah");

    host.handle.host(15, 15).await.unwrap();
    client.handle.start_scan().await.unwrap();
    client.wait_for("advertisement", |e| matches!(e, GameEvent::Discovered(_))).await;

    air.set_congested(&host.peer, true);
    client.handle.join(host.peer.clone()).await.unwrap();
    host.wait_for("join", |e| matches!(e, GameEvent::ParticipantJoined(_))).await;
    sleep(Duration::from_millis(500)).await;
    assert_eq!(client.phase().await, Phase::Joining);

    air.set_congested(&host.peer, false);
    client.wait_phase(Phase::Waiting).await;
    let view = client.handle.snapshot().await.unwrap();
    assert_eq!(view.session.unwrap().participants.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_host_cancel_reaches_clients() {
    let (air, clock) = setup();
    let host = Device::spawn(&air, &clock, "emma");
    let client = Device::spawn(&air, &clock, "noah");

    host.handle.host(15, 15).await.unwrap();
    join(&client, &host).await;

    host.handle.cancel().await.unwrap();
    client.wait_phase(Phase::Cancelled).await;
    assert_eq!(host.phase().await, Phase::Cancelled);
    assert_eq!(client.wallet.balance(), 100);
    assert_eq!(host.wallet.balance(), 100);
}

#[tokio::test(start_paused = true)]
async fn test_commands_refused() {
    let (air, clock) = setup();
    let device = Device::spawn(&air, &clock, "emma");

    let err = device.handle.join(PeerId::from("nobody")).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Game(GameError::SessionNotFound(_))));
    assert_eq!(
        device.handle.host(7, 15).await,
        Err(CoordinatorError::Game(GameError::UnsupportedDuration(7)))
    );

    device.handle.host(15, 15).await.unwrap();
    assert_eq!(
        device.handle.start_now().await,
        Err(CoordinatorError::Game(GameError::NotEnoughParticipants { needed: 2, have: 1 }))
    );

    device.handle.shutdown().await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(device.handle.leave().await, Err(CoordinatorError::Stopped));
}

#[tokio::test(start_paused = true)]
async fn test_offset_read_of_hosted_snapshot() {
    let (air, clock) = setup();
    let host = Device::spawn(&air, &clock, "emma");
    host.handle.host(20, 25).await.unwrap();

    let (_, central, mut probe_rx) = air.device("probe");
    let mut link = ClientLink::new(Box::new(central));
    link.connect(&host.peer).unwrap();
    match probe_rx.recv().await {
        Some(TransportEvent::Connected { peer }) => link.on_connected(&peer),
        other => panic!("unexpected {:?}", other),
    }

    let bytes = link.pull(Channel::SessionState, 182).await.unwrap();
    let session = decode_snapshot(&bytes).unwrap();
    assert_eq!(session.duration_minutes, 20);
    assert_eq!(session.bet_amount, 25);
    assert_eq!(session.participants.len(), 1);

    let past_end = bytes.len() + 1;
    assert_eq!(
        link.read_at(Channel::SessionState, past_end).await,
        Err(ReadError::InvalidOffset {
            offset: past_end,
            len: bytes.len()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_unread_events_do_not_stall_host() {
    let (air, clock) = setup();
    let host = Device::spawn_undrained(&air, &clock, "emma");
    let client = Device::spawn(&air, &clock, "noah");

    host.handle.host(15, 15).await.unwrap();
    client.handle.start_scan().await.unwrap();
    client.wait_for("advertisement", |e| matches!(e, GameEvent::Discovered(_))).await;
    client.handle.join(host.peer.clone()).await.unwrap();
    client.wait_phase(Phase::Waiting).await;
    while host.handle.snapshot().await.unwrap().session.map(|s| s.participants.len()) != Some(2) {
        sleep(Duration::from_millis(100)).await;
    }

    host.handle.start_now().await.unwrap();
    client.wait_phase(Phase::Active).await;

    // one tick a second fills the host's event queue long before this
    sleep(Duration::from_secs(5 * 60)).await;

    assert_eq!(host.phase().await, Phase::Active);
    assert_eq!(client.phase().await, Phase::Active);
    assert!(!client.saw(&|e: &GameEvent| matches!(e, GameEvent::Error { fatal: true, .. })));
    let remaining = client.handle.snapshot().await.unwrap().remaining_secs.unwrap();
    assert!((590..=600).contains(&remaining), "remaining {}", remaining);
}
