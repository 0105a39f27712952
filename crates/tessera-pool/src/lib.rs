//! # tessera-pool
//!
//! P2P connection pool for the Tessera blockchain node.
//!
//! This crate provides:
//! - TCP connection establishment: dial/accept, authenticated handshake
//!   with proof-of-work, version negotiation
//! - Point and peer registries with bounded history, GC and persistence
//! - Per-connection message routing with control-plane multiplexing
//!   (bootstrap, advertise, swap)
//! - Capacity enforcement and pool event watchers

mod ban;
mod codec;
mod config;
mod connection;
mod error;
mod events;
mod handshake;
mod message;
mod persist;
mod pool;
mod registry;
mod scheduler;
mod swap;
mod transport;
mod worker;

pub use ban::BanTable;
pub use codec::{Frame, FrameCodec};
pub use config::{MetadataConfig, PoolConfig, DEFAULT_HISTORY_SIZE};
pub use connection::{Connection, ConnectionInfo};
pub use error::{PoolError, PoolResult};
pub use events::{PoolEvent, PoolWatcher};
pub use message::{
    AppEncoding, ControlMessage, MessageConfig, CONTROL_TAG_MAX, TAG_ADVERTISE, TAG_BOOTSTRAP,
    TAG_DISCONNECT, TAG_SWAP_ACK, TAG_SWAP_REQUEST,
};
pub use pool::{NewConnectionCallback, Pool};
pub use registry::{
    EventKind, KnownSet, LogEntry, PeerInfo, PeerState, PointInfo, PointState,
};
pub use scheduler::{ConnStatSnapshot, IoScheduler, PoolStat};

/// Default maximum raw chunk size per transport write.
pub const DEFAULT_BINARY_CHUNK_SIZE: usize = 65_536;

/// Fallback frame size cap for application tags without an explicit limit.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024; // 10 MB

/// Peer metadata bound: cloneable, shareable, JSON-serializable.
pub trait Metadata:
    Clone + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}

impl<T> Metadata for T where
    T: Clone + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
