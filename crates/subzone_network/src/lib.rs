#![doc = include_str!("../README.md")]

pub mod bandwidth;
pub mod conn;
pub mod crypt;
mod io;
pub mod lag;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
pub use conn::{ConnSettings, ConnState, ConnectionCore};
pub use io::{NetEngine, SizedSource};
use subzone_protocol::frame::ClientKind;
use tokio::runtime::Handle;

/// Identifies one connection for the lifetime of the process.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Why a connection went away.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DisconnectReason {
    /// The peer sent 0x07.
    Remote,
    /// Nothing received within the no-data timeout.
    IdleTimeout,
    /// A reliable exceeded the retransmit ceiling.
    TooManyRetries,
    /// The server asked for the teardown.
    Requested,
    /// The engine is shutting down.
    ServerShutdown,
}

/// What the engine reports to the game loop. Events for one connection are
/// ordered: reliable payloads in strict sequence order, unreliable payloads
/// in arrival order.
#[derive(Debug)]
pub enum NetEvent {
    /// The conn-init handshake completed and the first real packet arrived.
    Connected {
        id: ConnId,
        addr: SocketAddr,
        kind: ClientKind,
    },
    /// An application payload.
    Packet {
        id: ConnId,
        data: Bytes,
        reliable: bool,
    },
    /// A sized-data stream finished (all chunks acked) or was cancelled by
    /// the client. The producer has been closed either way.
    SizedDone { id: ConnId, cancelled: bool },
    /// The connection is gone. No further events for this id will follow.
    Disconnected { id: ConnId, reason: DisconnectReason },
}

/// Engine-wide configuration, resolved from the `[Net]` config section.
#[derive(Clone, Debug)]
pub struct NetSettings {
    /// Game listeners; each also gets a ping responder on port + 1.
    pub bind: Vec<SocketAddr>,
    /// `[Net] AllowVIE`.
    pub allow_vie: bool,
    /// `[Net] AllowCont`.
    pub allow_cont: bool,
    /// Per-connection tuning.
    pub conn: ConnSettings,
    /// How often per-connection send queues are drained.
    pub send_interval: Duration,
    /// Concurrent datagram readers per socket.
    pub recv_workers: usize,
    /// A tokio runtime to run on; the engine creates its own when `None`.
    pub tokio_handle: Option<Handle>,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            bind: vec!["0.0.0.0:5000".parse().expect("valid literal")],
            allow_vie: true,
            allow_cont: true,
            conn: ConnSettings::default(),
            send_interval: Duration::from_millis(10),
            recv_workers: 2,
            tokio_handle: None,
        }
    }
}
