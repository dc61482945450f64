//! transport - the three logical channels and the bearer seam
//!
//! a bearer is whatever radio (or in-memory stand-in) carries the channels.
//! calls into a bearer are synchronous and return immediately; anything that
//! completes later (connections, incoming values, read requests, readiness
//! after backpressure) comes back as a [`TransportEvent`] on the device's
//! single inbound queue.

use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use tether_core::{PeerId, TetherError};

/// service identifier advertised by hosts
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xA1B2C3D4_E5F6_7890_ABCD_EF1234567890);

const SESSION_STATE_UUID: Uuid = Uuid::from_u128(0xA1B2C3D4_E5F6_7890_ABCD_EF1234567891);
const CONTROL_UUID: Uuid = Uuid::from_u128(0xA1B2C3D4_E5F6_7890_ABCD_EF1234567892);
const HEARTBEAT_UUID: Uuid = Uuid::from_u128(0xA1B2C3D4_E5F6_7890_ABCD_EF1234567893);

/// logical channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// host publishes snapshots, clients may pull
    SessionState,
    /// clients write, host pushes
    Control,
    /// host publishes, clients observe
    Heartbeat,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::SessionState, Channel::Control, Channel::Heartbeat];

    pub fn uuid(&self) -> Uuid {
        match self {
            Channel::SessionState => SESSION_STATE_UUID,
            Channel::Control => CONTROL_UUID,
            Channel::Heartbeat => HEARTBEAT_UUID,
        }
    }

    /// resolve a remote channel id; unknown ids mean a protocol mismatch
    pub fn from_uuid(id: Uuid) -> Result<Self, TransportError> {
        Channel::ALL
            .into_iter()
            .find(|c| c.uuid() == id)
            .ok_or(TransportError::ChannelNotFound(id))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::SessionState => "session-state",
            Channel::Control => "control",
            Channel::Heartbeat => "heartbeat",
        }
    }

    /// only the newest value matters; control messages are each distinct
    pub fn is_latest_value(&self) -> bool {
        !matches!(self, Channel::Control)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("bearer unavailable: {0}")]
    Unavailable(String),

    #[error("advertising failed: {0}")]
    AdvertiseFailed(String),

    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("channel not found: {0}")]
    ChannelNotFound(Uuid),

    #[error("not connected")]
    NotConnected,

    #[error("write rejected: {0}")]
    WriteRejected(String),
}

impl From<TransportError> for TetherError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(msg) => TetherError::TransportUnavailable(msg),
            TransportError::AdvertiseFailed(msg) => TetherError::AdvertiseFailed(msg),
            TransportError::ScanFailed(msg) => TetherError::ScanFailed(msg),
            TransportError::ConnectionFailed(msg) => TetherError::ConnectionFailed(msg),
            TransportError::PeerNotFound(peer) => TetherError::PeerNotFound(peer.to_string()),
            TransportError::ChannelNotFound(id) => TetherError::ChannelNotFound(id.to_string()),
            TransportError::NotConnected => TetherError::Delivery("not connected".into()),
            TransportError::WriteRejected(msg) => TetherError::Delivery(msg),
        }
    }
}

/// outcome of an offset-addressed read
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("offset {offset} is past the end of a {len} byte value")]
    InvalidOffset { offset: usize, len: usize },

    #[error("{0} channel has no readable value")]
    NotReadable(&'static str),

    #[error("read abandoned by the host")]
    Abandoned,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type ReadResponse = Result<Vec<u8>, ReadError>;

/// everything a bearer reports back
#[derive(Debug)]
pub enum TransportEvent {
    /// the radio went away or was never there
    Unavailable(String),

    // host side
    Subscribed { peer: PeerId, channel: Channel },
    Unsubscribed { peer: PeerId, channel: Channel },
    Written { peer: PeerId, channel: Channel, value: Vec<u8> },
    ReadRequest {
        peer: PeerId,
        channel: Channel,
        offset: usize,
        respond: oneshot::Sender<ReadResponse>,
    },
    /// the bearer can take updates again after refusing one
    ReadyToUpdate,

    // client side
    Discovered { peer: PeerId, local_name: String, signal_strength: i16 },
    Connected { peer: PeerId },
    ConnectFailed { peer: PeerId, reason: String },
    Notified { peer: PeerId, channel: Channel, value: Vec<u8> },

    /// either side
    Disconnected { peer: PeerId },
}

/// the host half of a bearer
pub trait PeripheralBearer: Send {
    fn start_advertising(&mut self, local_name: &str) -> Result<(), TransportError>;

    fn stop_advertising(&mut self);

    /// Push `value` to subscribers of `channel`, or only to `to`.
    ///
    /// `Ok(false)` means the bearer is momentarily full; nothing was sent and
    /// the caller must retry after [`TransportEvent::ReadyToUpdate`].
    fn update_value(&mut self, channel: Channel, value: &[u8], to: Option<&PeerId>) -> Result<bool, TransportError>;

    fn disconnect(&mut self, peer: &PeerId);
}

/// the client half of a bearer
pub trait CentralBearer: Send {
    fn start_scan(&mut self) -> Result<(), TransportError>;

    fn stop_scan(&mut self);

    /// Begin connecting. Completion arrives as `Connected` or `ConnectFailed`.
    fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError>;

    fn subscribe(&mut self, peer: &PeerId, channel: Channel) -> Result<(), TransportError>;

    fn write(&mut self, peer: &PeerId, channel: Channel, value: &[u8]) -> Result<(), TransportError>;

    /// Request bytes of `channel`'s value starting at `offset`.
    fn read(
        &mut self,
        peer: &PeerId,
        channel: Channel,
        offset: usize,
    ) -> Result<oneshot::Receiver<ReadResponse>, TransportError>;

    fn disconnect(&mut self, peer: &PeerId);
}

/// Answer a read request: bytes from `offset` to the end, at most
/// `max_transfer_size` of them.
pub fn read_at(value: &[u8], offset: usize, max_transfer_size: usize) -> ReadResponse {
    if offset > value.len() {
        return Err(ReadError::InvalidOffset {
            offset,
            len: value.len(),
        });
    }
    let end = value.len().min(offset.saturating_add(max_transfer_size));
    Ok(value[offset..end].to_vec())
}

/// await a read response, mapping a dropped responder
pub async fn await_read(response: oneshot::Receiver<ReadResponse>) -> ReadResponse {
    response.await.unwrap_or(Err(ReadError::Abandoned))
}

/// client-side reassembly of an offset-addressed read
///
/// a chunk shorter than the transfer size is the last one.
#[derive(Debug)]
pub struct ReadAssembler {
    max_transfer_size: usize,
    buf: Vec<u8>,
    done: bool,
}

impl ReadAssembler {
    pub fn new(max_transfer_size: usize) -> Self {
        Self {
            max_transfer_size,
            buf: Vec::new(),
            done: false,
        }
    }

    /// offset for the next request
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Append a chunk. Returns `true` once the value is complete.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        if !self.done {
            self.buf.extend_from_slice(chunk);
            self.done = chunk.len() < self.max_transfer_size;
        }
        self.done
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
