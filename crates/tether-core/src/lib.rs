//! tether-core: session model and game logic for local p2p wagers
//!
//! one device hosts a timed, wagered session; nearby devices discover it from
//! a compact advertisement, join, and follow a host-replicated snapshot. the
//! first participant to concede or drop off loses, the rest split the pot.
//!
//! this crate is synchronous. transports, timers and the actor that drives
//! [`GameMachine`] live in `tether-p2p`.
//!
//! ## layout
//!
//! ```text
//! discovery    name|duration|bet|count advertisement codec
//! protocol     control message envelope + tagged payloads
//! replication  snapshot encode/validate
//! machine      state machine emitting effects
//! settlement   pot split
//! wallet       balance collaborator + ledger
//! ```

pub mod collaborators;
pub mod config;
pub mod discovery;
pub mod error;
pub mod machine;
pub mod protocol;
pub mod replication;
pub mod session;
pub mod settlement;
pub mod timer;
pub mod types;
pub mod wallet;

pub use collaborators::{Cue, Feedback, FileIdentity, IdentityProvider, Lifecycle, StaticIdentity};
pub use config::TetherConfig;
pub use discovery::{Advertisement, NearbySession, NearbySessions};
pub use error::{GameError, ProtocolError, Result, TetherError};
pub use machine::{Effect, GameEvent, GameMachine, Phase, Role, Timer};
pub use protocol::{ControlMessage, MessageType, Payload};
pub use session::{Session, SessionParticipant, SessionState};
pub use settlement::Outcome;
pub use types::{ParticipantId, PeerId, SessionId};
pub use wallet::{Ledger, Wallet};
