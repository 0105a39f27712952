//! Known-set persistence.
//!
//! One JSON document with two arrays, written atomically (temp file, then
//! rename). Malformed entries are skipped with a warning on load so a
//! damaged file costs entries, not the node.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tessera_identity::PeerId;

use crate::now_ms;
use crate::registry::{KnownSet, PeerState, PointState};

/// A persisted point record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PersistedPoint {
    pub address: SocketAddr,
    pub trusted: bool,
    #[serde(default)]
    pub last_seen_ms: Option<u64>,
    #[serde(default)]
    pub last_peer: Option<PeerId>,
}

/// A persisted peer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PersistedPeer<Meta> {
    pub peer_id: PeerId,
    pub trusted: bool,
    #[serde(default)]
    pub last_seen_ms: Option<u64>,
    #[serde(default)]
    pub last_point: Option<SocketAddr>,
    pub metadata: Meta,
}

#[derive(Serialize)]
struct FileContents<'a, Meta> {
    known_points: Vec<PersistedPoint>,
    known_peer_ids: Vec<PersistedPeerRef<'a, Meta>>,
}

#[derive(Serialize)]
struct PersistedPeerRef<'a, Meta> {
    peer_id: PeerId,
    trusted: bool,
    last_seen_ms: Option<u64>,
    last_point: Option<SocketAddr>,
    metadata: &'a Meta,
}

#[derive(Deserialize, Default)]
struct RawFile {
    #[serde(default)]
    known_points: Vec<serde_json::Value>,
    #[serde(default)]
    known_peer_ids: Vec<serde_json::Value>,
}

/// Serialize the known-set to `path` atomically.
pub(crate) fn save<Meta: Serialize>(path: &Path, known: &KnownSet<Meta>) -> io::Result<()> {
    let known_points: Vec<PersistedPoint> = known
        .points()
        .map(|(addr, info)| PersistedPoint {
            address: *addr,
            trusted: info.trusted,
            last_seen_ms: info.last_seen_ms,
            last_peer: info.last_peer,
        })
        .collect();
    let peer_refs: Vec<PersistedPeerRef<'_, Meta>> = known
        .peers()
        .map(|(peer, info)| PersistedPeerRef {
            peer_id: *peer,
            trusted: info.trusted,
            last_seen_ms: info.last_seen_ms,
            last_point: info.last_point,
            metadata: &info.metadata,
        })
        .collect();
    let contents = FileContents {
        known_points,
        known_peer_ids: peer_refs,
    };

    let json = serde_json::to_vec_pretty(&contents)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "Saved known-set");
    Ok(())
}

/// Load persisted records from `path`. A missing file yields empty sets;
/// malformed entries are skipped with a warning.
pub(crate) fn load<Meta: DeserializeOwned>(
    path: &Path,
) -> io::Result<(Vec<PersistedPoint>, Vec<PersistedPeer<Meta>>)> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), Vec::new())),
        Err(err) => return Err(err),
    };
    let file: RawFile = serde_json::from_slice(&raw)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut points = Vec::with_capacity(file.known_points.len());
    for value in file.known_points {
        match serde_json::from_value::<PersistedPoint>(value) {
            Ok(point) => points.push(point),
            Err(err) => warn!(error = %err, "Skipping malformed known point"),
        }
    }
    let mut peers = Vec::with_capacity(file.known_peer_ids.len());
    for value in file.known_peer_ids {
        match serde_json::from_value::<PersistedPeer<Meta>>(value) {
            Ok(peer) => peers.push(peer),
            Err(err) => warn!(error = %err, "Skipping malformed known peer"),
        }
    }
    Ok((points, peers))
}

/// Install loaded records into a fresh known-set.
pub(crate) fn install<Meta>(
    known: &mut KnownSet<Meta>,
    points: Vec<PersistedPoint>,
    peers: Vec<PersistedPeer<Meta>>,
) {
    let now = now_ms();
    for record in points {
        let info = known.get_or_create_point(record.address);
        info.trusted = record.trusted;
        info.last_seen_ms = record.last_seen_ms;
        info.last_peer = record.last_peer;
        info.state = PointState::Disconnected {
            since_ms: record.last_seen_ms.unwrap_or(now),
        };
    }
    for record in peers {
        let info = known.get_or_create_peer(record.peer_id, record.metadata);
        info.trusted = record.trusted;
        info.last_seen_ms = record.last_seen_ms;
        info.last_point = record.last_point;
        info.state = PeerState::Disconnected {
            since_ms: record.last_seen_ms.unwrap_or(now),
        };
    }
}
