//! tether - run wagered sessions between simulated devices in one process

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_core::collaborators::{LogFeedback, Silent};
use tether_core::timer::format_remaining;
use tether_core::{FileIdentity, GameEvent, IdentityProvider, Ledger, Outcome, Phase, PeerId, StaticIdentity, TetherConfig, Wallet};
use tether_p2p::{Air, Collaborators, Coordinator, CoordinatorHandle, SystemClock};

const NAMES: [&str; 8] = ["Emma", "Noah", "Ava", "Liam", "Mia", "Lucas", "Zoe", "Leo"];

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "local wagered sessions over a simulated radio", long_about = None)]
struct Args {
    /// TOML config file
    #[arg(long, short, env = "TETHER_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// host one session and join it from simulated clients
    Simulate {
        /// number of joining clients
        #[arg(long, default_value_t = 1)]
        clients: usize,

        /// session length in minutes
        #[arg(long)]
        duration: Option<u32>,

        /// bet per participant
        #[arg(long)]
        bet: Option<u64>,

        /// what to do once the session is active
        #[arg(long, value_enum)]
        action: Option<Action>,

        /// device the action applies to, 0 is the host
        #[arg(long, default_value_t = 1)]
        actor: usize,

        /// seconds into the active session before the action
        #[arg(long, default_value_t = 10)]
        after: u64,
    },

    /// show or edit the persisted local identity
    Identity {
        /// identity store
        #[arg(long, default_value = "./tether-identity.json")]
        store: PathBuf,

        /// set the display name
        #[arg(long)]
        name: Option<String>,

        /// set the avatar color index
        #[arg(long)]
        avatar: Option<u8>,
    },

    /// print the effective configuration as TOML
    Config,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Action {
    /// the actor concedes
    Concede,
    /// the actor's link to the host drops
    Disconnect,
    /// the actor's app goes to the background
    Background,
}

struct Player {
    name: String,
    peer: PeerId,
    handle: CoordinatorHandle,
    wallet: Arc<Ledger>,
}

/// how a device's session finished
#[derive(Debug)]
enum Finish {
    Ended(Outcome),
    Cancelled,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=info,tether_p2p=info,tether_core=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => TetherConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => TetherConfig::default(),
    };

    match args.command {
        Cmd::Simulate {
            clients,
            duration,
            bet,
            action,
            actor,
            after,
        } => {
            let duration = duration.unwrap_or(config.options.default_duration_minutes);
            let bet = bet.unwrap_or(config.options.default_bet_amount);
            simulate(config, clients, duration, bet, action.map(|a| (a, actor, after))).await
        }
        Cmd::Identity { store, name, avatar } => identity(store, name, avatar),
        Cmd::Config => {
            print!("{}", toml::to_string_pretty(&config).context("serializing config")?);
            Ok(())
        }
    }
}

fn identity(store: PathBuf, name: Option<String>, avatar: Option<u8>) -> Result<()> {
    let identity = FileIdentity::open(&store).with_context(|| format!("opening {}", store.display()))?;
    if let Some(name) = name {
        identity.set_display_name(&name)?;
    }
    if let Some(avatar) = avatar {
        identity.set_avatar_color_index(avatar)?;
    }
    println!("peer id: {}", identity.local_peer_id());
    println!("name:    {}", identity.display_name());
    println!("avatar:  {}", identity.avatar_color_index());
    Ok(())
}

async fn simulate(
    config: TetherConfig,
    clients: usize,
    duration: u32,
    bet: u64,
    action: Option<(Action, usize, u64)>,
) -> Result<()> {
    if clients == 0 || clients >= NAMES.len() {
        bail!("clients must be between 1 and {}", NAMES.len() - 1);
    }
    if let Some((_, actor, _)) = action {
        if actor > clients {
            bail!("actor {} does not exist", actor);
        }
    }

    let air = Air::new();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let players: Vec<Player> = (0..=clients)
        .map(|i| spawn_player(&air, &config, i, done_tx.clone()))
        .collect();
    drop(done_tx);

    let host = &players[0];
    host.handle.host(duration, bet).await.context("host refused to start")?;

    for client in &players[1..] {
        client.handle.start_scan().await?;
        wait_for_nearby(client, &host.peer).await?;
        client
            .handle
            .join(host.peer.clone())
            .await
            .with_context(|| format!("{} could not join", client.name))?;
    }

    let expected = clients + 1;
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let joined = host
                .handle
                .snapshot()
                .await
                .ok()
                .and_then(|v| v.session)
                .map(|s| s.participants.len())
                .unwrap_or(0);
            if joined >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("clients never all joined")?;

    info!(participants = expected, duration, bet, "all joined, starting countdown");
    host.handle.start_countdown().await.context("countdown refused")?;

    if let Some((action, actor, after)) = action {
        let target = &players[actor];
        wait_for_phase(target, Phase::Active).await?;
        tokio::time::sleep(Duration::from_secs(after)).await;
        info!(player = %target.name, ?action, "acting");
        match action {
            Action::Concede => target.handle.concede().await?,
            Action::Background => target.handle.app_backgrounded().await?,
            Action::Disconnect => {
                if actor == 0 {
                    for client in &players[1..] {
                        air.sever(&client.peer, &host.peer);
                    }
                } else {
                    air.sever(&target.peer, &host.peer);
                }
            }
        }
    }

    // generous bound past the session length for countdown and teardown
    let limit = Duration::from_secs(u64::from(duration) * 60 + 60);
    let mut finished = Vec::new();
    while finished.len() < players.len() {
        match tokio::time::timeout(limit, done_rx.recv()).await {
            Ok(Some(done)) => finished.push(done),
            Ok(None) => break,
            Err(_) => bail!("session did not finish within {:?}", limit),
        }
    }

    println!();
    println!("{:<8} {:<10} {:>7} {:>8}", "player", "result", "credit", "balance");
    for (index, finish) in finished {
        let player = &players[index];
        let (result, credit) = match finish {
            Finish::Ended(outcome) if outcome.won => ("won", outcome.credit),
            Finish::Ended(outcome) => ("lost", outcome.credit),
            Finish::Cancelled => ("cancelled", 0),
        };
        println!(
            "{:<8} {:<10} {:>7} {:>8}",
            player.name,
            result,
            credit,
            player.wallet.balance()
        );
    }

    for player in &players {
        player.handle.shutdown().await;
    }
    Ok(())
}

fn spawn_player(
    air: &Air,
    config: &TetherConfig,
    index: usize,
    done: mpsc::UnboundedSender<(usize, Finish)>,
) -> Player {
    let name = NAMES[index].to_string();
    let peer = PeerId::new(format!("device-{index}"));
    let (peripheral, central, transport_rx) = air.device(peer.clone());
    let wallet = Arc::new(Ledger::new());

    let collaborators = Collaborators {
        identity: Arc::new(StaticIdentity::new(peer.to_string(), name.clone(), index as u8)),
        wallet: wallet.clone(),
        feedback: Arc::new(LogFeedback),
        lifecycle: Arc::new(Silent),
        clock: Arc::new(SystemClock),
    };
    let (handle, mut events) = Coordinator::spawn(
        config.clone(),
        collaborators,
        Box::new(peripheral),
        Box::new(central),
        transport_rx,
    );

    let who = name.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                GameEvent::Discovered(nearby) => {
                    debug!(player = %who, host = %nearby.host_name, bet = %nearby.formatted_bet(), "found session")
                }
                GameEvent::PhaseChanged(phase) => {
                    info!(player = %who, phase = phase.as_str(), "phase");
                    if phase == Phase::Cancelled {
                        let _ = done.send((index, Finish::Cancelled));
                    }
                }
                GameEvent::CountdownTick(n) => info!(player = %who, "{}...", n),
                GameEvent::Tick { remaining_secs } => {
                    if remaining_secs % 60 == 0 || remaining_secs <= 5 {
                        info!(player = %who, remaining = %format_remaining(remaining_secs), "tick");
                    }
                }
                GameEvent::ParticipantJoined(p) => info!(player = %who, joined = %p.display_name, "participant joined"),
                GameEvent::ParticipantLeft(id) => info!(player = %who, left = %id.short(), "participant left"),
                GameEvent::Error { message, fatal } => warn!(player = %who, fatal, "{}", message),
                GameEvent::Ended(outcome) => {
                    let _ = done.send((index, Finish::Ended(outcome)));
                }
            }
        }
    });

    Player {
        name,
        peer,
        handle,
        wallet,
    }
}

async fn wait_for_nearby(client: &Player, host: &PeerId) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(view) = client.handle.snapshot().await {
                if view.nearby.iter().any(|n| &n.host_peer_id == host) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .with_context(|| format!("{} never saw the host", client.name))
}

async fn wait_for_phase(player: &Player, phase: Phase) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Ok(view) = player.handle.snapshot().await {
                if view.phase == phase {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .with_context(|| format!("{} never reached {}", player.name, phase.as_str()))
}
