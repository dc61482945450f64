//! tether-p2p: local transport and session runtime for tether
//!
//! carries the session over three logical channels between one host and
//! its clients, and runs the [`coordinator::Coordinator`] task that drives a
//! [`tether_core::GameMachine`] from bearer events, timers and user commands.
//!
//! ## channels
//!
//! ```text
//! session-state  host -> clients   serialized session snapshot, offset-readable
//! control        both ways         control messages
//! heartbeat      host -> clients   {seq, sent_at_ms} once per interval
//! ```
//!
//! real radios plug in behind [`transport::PeripheralBearer`] and
//! [`transport::CentralBearer`]. [`loopback::Air`] is the in-process bearer
//! used by tests and the simulator.

pub mod client;
pub mod clock;
pub mod coordinator;
pub mod host;
pub mod liveness;
pub mod loopback;
pub mod transport;

pub use clock::{Clock, MonotonicClock, SystemClock};
pub use coordinator::{Collaborators, Coordinator, CoordinatorError, CoordinatorHandle, SessionView};
pub use loopback::Air;
pub use transport::{Channel, TransportError, TransportEvent, SERVICE_UUID};
