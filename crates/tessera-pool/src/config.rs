//! Pool configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tessera_identity::Keypair;

use crate::DEFAULT_BINARY_CHUNK_SIZE;

/// Default rolling event-log capacity per known point or peer.
pub const DEFAULT_HISTORY_SIZE: usize = 50;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Local keypair and proof-of-work stamp.
    pub identity: Arc<Keypair>,
    /// Minimum PoW difficulty (leading zero bits) accepted from peers.
    pub proof_of_work_target: u32,
    /// Pinned bootstrap addresses; never evicted by GC.
    pub trusted_points: Vec<SocketAddr>,
    /// JSON persistence path for the known-set. `None` disables persistence.
    pub peers_file: Option<PathBuf>,
    /// If set, reject every peer whose point is not trusted.
    pub closed_network: bool,
    /// Port advertised to peers during authentication.
    pub listening_port: Option<u16>,
    /// Below this many connections the `too_few` condition is signalled.
    pub min_connections: usize,
    /// Hard cap on simultaneous connections.
    pub max_connections: usize,
    /// Cap on half-open (accepted, not yet authenticated) incoming sockets.
    pub max_incoming_connections: usize,
    /// End-to-end budget for the connection pipeline.
    pub connection_timeout: Duration,
    /// Budget for the authentication phase alone.
    pub authentication_timeout: Duration,
    /// Per-connection application message queue bound. `None` = unbounded.
    pub incoming_app_message_queue_size: Option<usize>,
    /// Transport reader queue bound.
    pub incoming_message_queue_size: usize,
    /// Transport writer queue bound.
    pub outgoing_message_queue_size: usize,
    /// Rolling event-log capacity per known peer id.
    pub known_peer_ids_history_size: usize,
    /// Rolling event-log capacity per known point.
    pub known_points_history_size: usize,
    /// `(upper, lower)` GC thresholds for known points. `None` = no GC.
    pub max_known_points: Option<(usize, usize)>,
    /// `(upper, lower)` GC thresholds for known peer ids. `None` = no GC.
    pub max_known_peer_ids: Option<(usize, usize)>,
    /// Minimum interval between swaps on a single connection.
    pub swap_linger: Duration,
    /// Maximum raw chunk size per transport write.
    pub binary_chunks_size: usize,
}

impl PoolConfig {
    /// Build a configuration with defaults around the given identity.
    pub fn new(identity: Arc<Keypair>) -> Self {
        Self {
            identity,
            proof_of_work_target: 8,
            trusted_points: Vec::new(),
            peers_file: None,
            closed_network: false,
            listening_port: None,
            min_connections: 10,
            max_connections: 50,
            max_incoming_connections: 20,
            connection_timeout: Duration::from_secs(10),
            authentication_timeout: Duration::from_secs(5),
            incoming_app_message_queue_size: Some(1000),
            incoming_message_queue_size: 1000,
            outgoing_message_queue_size: 100,
            known_peer_ids_history_size: DEFAULT_HISTORY_SIZE,
            known_points_history_size: DEFAULT_HISTORY_SIZE,
            max_known_points: Some((400, 300)),
            max_known_peer_ids: Some((400, 300)),
            swap_linger: Duration::from_secs(30),
            binary_chunks_size: DEFAULT_BINARY_CHUNK_SIZE,
        }
    }

    /// Whether `point` is in the trusted set.
    pub fn is_trusted(&self, point: &SocketAddr) -> bool {
        self.trusted_points.contains(point)
    }
}

/// Caller-supplied peer metadata hooks: the initial blob attached to a
/// freshly seen peer and the score derived from a blob.
pub struct MetadataConfig<Meta> {
    /// Metadata for a peer seen for the first time.
    pub initial: Arc<dyn Fn() -> Meta + Send + Sync>,
    /// Score derived from a metadata blob.
    pub score: Arc<dyn Fn(&Meta) -> f64 + Send + Sync>,
}

impl<Meta> MetadataConfig<Meta> {
    /// Build from the two hooks.
    pub fn new(
        initial: impl Fn() -> Meta + Send + Sync + 'static,
        score: impl Fn(&Meta) -> f64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            initial: Arc::new(initial),
            score: Arc::new(score),
        }
    }

    /// Metadata for a freshly seen peer.
    pub fn initial_meta(&self) -> Meta {
        (self.initial.as_ref())()
    }

    /// Score a metadata blob.
    pub fn score_meta(&self, meta: &Meta) -> f64 {
        (self.score.as_ref())(meta)
    }
}

impl<Meta: Default + 'static> Default for MetadataConfig<Meta> {
    fn default() -> Self {
        Self::new(Meta::default, |_| 0.0)
    }
}

impl<Meta> Clone for MetadataConfig<Meta> {
    fn clone(&self) -> Self {
        Self {
            initial: self.initial.clone(),
            score: self.score.clone(),
        }
    }
}

impl<Meta> std::fmt::Debug for MetadataConfig<Meta> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataConfig").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = PoolConfig::new(Arc::new(Keypair::generate(0)));
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.min_connections, 10);
        assert_eq!(config.known_points_history_size, DEFAULT_HISTORY_SIZE);
        assert_eq!(config.binary_chunks_size, DEFAULT_BINARY_CHUNK_SIZE);
        assert_eq!(config.swap_linger, Duration::from_secs(30));
        assert!(!config.closed_network);
        assert!(config.peers_file.is_none());
    }

    #[test]
    fn test_trusted_points_lookup() {
        let mut config = PoolConfig::new(Arc::new(Keypair::generate(0)));
        let addr: SocketAddr = "127.0.0.1:9732".parse().unwrap();
        assert!(!config.is_trusted(&addr));
        config.trusted_points.push(addr);
        assert!(config.is_trusted(&addr));
    }
}
