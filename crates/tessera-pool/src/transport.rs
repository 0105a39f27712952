//! Authentication exchange.
//!
//! Before any framed traffic, both sides exchange two length-prefixed raw
//! frames on the fresh socket:
//!
//! 1. An *auth frame*: public key, proof-of-work nonce, declared listening
//!    port, supported protocol versions and a fresh 32-byte challenge.
//! 2. A *proof frame*: an Ed25519 signature over
//!    `Blake2b-256(domain || peer_challenge || own_public_key)`, proving
//!    possession of the secret key for the announced identity.
//!
//! The encrypted channel itself is the transport layer's business; the
//! pool only mediates identity, proof-of-work and version agreement.

use blake2::{Blake2b, Digest};
use bytes::{Buf, Bytes};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use typenum::U32;

use tessera_identity::{verify_pow, verify_signature, PeerId, PEER_ID_LENGTH, SIGNATURE_LENGTH};

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};

/// Domain separator for proof signatures.
const AUTH_DOMAIN: &[u8] = b"tessera.p2p.auth.v1";

/// Size cap for a raw auth frame.
const MAX_AUTH_FRAME_SIZE: usize = 1024;

/// Challenge length in bytes.
const CHALLENGE_LENGTH: usize = 32;

/// What authentication established about the remote end.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AuthOutcome {
    /// The remote identity.
    pub peer_id: PeerId,
    /// The port the remote accepts connections on, if it listens.
    pub listening_port: Option<u16>,
    /// The negotiated protocol version.
    pub version: u16,
}

struct AuthPayload {
    peer_id: PeerId,
    pow_nonce: u64,
    listening_port: Option<u16>,
    versions: Vec<u16>,
    challenge: [u8; CHALLENGE_LENGTH],
}

impl AuthPayload {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(self.peer_id.as_bytes());
        buf.extend_from_slice(&self.pow_nonce.to_be_bytes());
        match self.listening_port {
            Some(port) => {
                buf.push(1);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            None => buf.push(0),
        }
        buf.push(self.versions.len() as u8);
        for version in &self.versions {
            buf.extend_from_slice(&version.to_be_bytes());
        }
        buf.extend_from_slice(&self.challenge);
        buf
    }

    fn parse(raw: &[u8]) -> PoolResult<Self> {
        let mut bytes = Bytes::copy_from_slice(raw);
        if bytes.remaining() < PEER_ID_LENGTH + 8 + 1 {
            return Err(PoolError::DecodingError("auth frame too short".to_string()));
        }
        let mut id = [0u8; PEER_ID_LENGTH];
        bytes.copy_to_slice(&mut id);
        let pow_nonce = bytes.get_u64();
        let listening_port = match bytes.get_u8() {
            0 => None,
            1 => {
                if bytes.remaining() < 2 {
                    return Err(PoolError::DecodingError("auth frame truncated".to_string()));
                }
                Some(bytes.get_u16())
            }
            _ => return Err(PoolError::DecodingError("bad port marker".to_string())),
        };
        if bytes.remaining() < 1 {
            return Err(PoolError::DecodingError("auth frame truncated".to_string()));
        }
        let count = bytes.get_u8() as usize;
        if count == 0 || bytes.remaining() < count * 2 + CHALLENGE_LENGTH {
            return Err(PoolError::DecodingError("auth frame truncated".to_string()));
        }
        let mut versions = Vec::with_capacity(count);
        for _ in 0..count {
            versions.push(bytes.get_u16());
        }
        let mut challenge = [0u8; CHALLENGE_LENGTH];
        bytes.copy_to_slice(&mut challenge);
        if bytes.has_remaining() {
            return Err(PoolError::DecodingError("trailing bytes".to_string()));
        }
        Ok(Self {
            peer_id: PeerId::from_bytes(id),
            pow_nonce,
            listening_port,
            versions,
            challenge,
        })
    }
}

/// First entry of the initiator's list that the responder also supports.
pub(crate) fn negotiate_version(initiator: &[u16], responder: &[u16]) -> Option<u16> {
    initiator.iter().copied().find(|v| responder.contains(v))
}

fn proof_digest(challenge: &[u8; CHALLENGE_LENGTH], signer: &PeerId) -> [u8; 32] {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(AUTH_DOMAIN);
    hasher.update(challenge);
    hasher.update(signer.as_bytes());
    hasher.finalize().into()
}

/// Run the authentication exchange on a fresh socket.
///
/// `incoming` selects the version-negotiation role and the error mapped
/// onto an early EOF: a remote that drops an outbound dial during auth is
/// reported as `ConnectionRefused`.
pub(crate) async fn authenticate<S>(
    stream: &mut S,
    config: &PoolConfig,
    versions: &[u16],
    incoming: bool,
) -> PoolResult<AuthOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; CHALLENGE_LENGTH];
    rand::thread_rng().fill_bytes(&mut challenge);

    let own = AuthPayload {
        peer_id: config.identity.peer_id(),
        pow_nonce: config.identity.pow().nonce,
        listening_port: config.listening_port,
        versions: versions.to_vec(),
        challenge,
    };

    write_prefixed(stream, &own.serialize(), incoming).await?;
    let raw = read_prefixed(stream, incoming).await?;
    let theirs = AuthPayload::parse(&raw)?;

    if !verify_pow(&theirs.peer_id, theirs.pow_nonce, config.proof_of_work_target) {
        return Err(PoolError::AuthenticationFailed(format!(
            "proof-of-work below target {}",
            config.proof_of_work_target
        )));
    }
    if theirs.peer_id == config.identity.peer_id() {
        return Err(PoolError::Myself);
    }
    let version = if incoming {
        negotiate_version(&theirs.versions, versions)
    } else {
        negotiate_version(versions, &theirs.versions)
    }
    .ok_or(PoolError::NoCommonProtocol)?;

    // Prove possession of our secret key over their challenge, and check
    // their proof over ours.
    let own_proof = config.identity.sign(&proof_digest(&theirs.challenge, &own.peer_id));
    write_prefixed(stream, &own_proof, incoming).await?;

    let raw_proof = read_prefixed(stream, incoming).await?;
    let their_sig: [u8; SIGNATURE_LENGTH] = raw_proof
        .as_slice()
        .try_into()
        .map_err(|_| PoolError::DecodingError("bad proof frame length".to_string()))?;
    if !verify_signature(
        &theirs.peer_id,
        &proof_digest(&challenge, &theirs.peer_id),
        &their_sig,
    ) {
        return Err(PoolError::AuthenticationFailed("bad identity proof".to_string()));
    }

    debug!(
        peer = %theirs.peer_id,
        version,
        port = ?theirs.listening_port,
        "Authentication complete"
    );

    Ok(AuthOutcome {
        peer_id: theirs.peer_id,
        listening_port: theirs.listening_port,
        version,
    })
}

/// A remote hanging up mid-auth on a connection we dialed counts as a
/// refusal; anywhere else it is a plain close.
fn map_hangup(err: std::io::Error, incoming: bool) -> PoolError {
    use std::io::ErrorKind;
    let hangup = matches!(
        err.kind(),
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
    );
    if hangup && !incoming {
        PoolError::ConnectionRefused
    } else {
        PoolError::ConnectionClosed
    }
}

async fn write_prefixed<S: AsyncWrite + Unpin>(
    stream: &mut S,
    payload: &[u8],
    incoming: bool,
) -> PoolResult<()> {
    let map = |e| map_hangup(e, incoming);
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(map)?;
    stream.write_all(payload).await.map_err(map)?;
    stream.flush().await.map_err(map)?;
    Ok(())
}

async fn read_prefixed<S: AsyncRead + Unpin>(stream: &mut S, incoming: bool) -> PoolResult<Vec<u8>> {
    let map = |e| map_hangup(e, incoming);

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(map)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_AUTH_FRAME_SIZE {
        return Err(PoolError::DecodingError("auth frame too large".to_string()));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(map)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_identity::Keypair;

    fn config_with(target: u32) -> PoolConfig {
        let mut config = PoolConfig::new(Arc::new(Keypair::generate(target)));
        config.proof_of_work_target = target;
        config
    }

    #[test]
    fn test_negotiate_version_prefers_initiator_order() {
        assert_eq!(negotiate_version(&[3, 1], &[1, 2, 3]), Some(3));
        assert_eq!(negotiate_version(&[5, 1], &[1, 2]), Some(1));
        assert_eq!(negotiate_version(&[5], &[1, 2]), None);
    }

    #[test]
    fn test_auth_payload_roundtrip() {
        let payload = AuthPayload {
            peer_id: Keypair::generate(0).peer_id(),
            pow_nonce: 42,
            listening_port: Some(9732),
            versions: vec![1, 2],
            challenge: [7u8; CHALLENGE_LENGTH],
        };
        let parsed = AuthPayload::parse(&payload.serialize()).unwrap();
        assert_eq!(parsed.peer_id, payload.peer_id);
        assert_eq!(parsed.pow_nonce, 42);
        assert_eq!(parsed.listening_port, Some(9732));
        assert_eq!(parsed.versions, vec![1, 2]);
        assert_eq!(parsed.challenge, payload.challenge);
    }

    #[tokio::test]
    async fn test_mutual_authentication() {
        let a = config_with(0);
        let b = config_with(0);
        let (mut sa, mut sb) = tokio::io::duplex(4096);

        let (ra, rb) = tokio::join!(
            authenticate(&mut sa, &a, &[1, 2], false),
            authenticate(&mut sb, &b, &[2], true),
        );
        let ra = ra.unwrap();
        let rb = rb.unwrap();

        assert_eq!(ra.peer_id, b.identity.peer_id());
        assert_eq!(rb.peer_id, a.identity.peer_id());
        assert_eq!(ra.version, 2);
        assert_eq!(rb.version, 2);
    }

    #[tokio::test]
    async fn test_no_common_protocol() {
        let a = config_with(0);
        let b = config_with(0);
        let (mut sa, mut sb) = tokio::io::duplex(4096);

        let (ra, rb) = tokio::join!(
            authenticate(&mut sa, &a, &[1], false),
            authenticate(&mut sb, &b, &[2], true),
        );
        assert!(matches!(ra, Err(PoolError::NoCommonProtocol)));
        assert!(matches!(rb, Err(PoolError::NoCommonProtocol)));
    }

    #[tokio::test]
    async fn test_pow_below_target_is_rejected() {
        // `a` demands a difficulty that `b`'s stamp will not meet.
        let mut a = config_with(0);
        a.proof_of_work_target = 64;
        let b = config_with(0);
        let (mut sa, mut sb) = tokio::io::duplex(4096);

        let (ra, _) = tokio::join!(
            authenticate(&mut sa, &a, &[1], true),
            authenticate(&mut sb, &b, &[1], false),
        );
        assert!(matches!(ra, Err(PoolError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn test_self_dial_is_detected() {
        let identity = Arc::new(Keypair::generate(0));
        let mut a = PoolConfig::new(identity.clone());
        a.proof_of_work_target = 0;
        let mut b = PoolConfig::new(identity);
        b.proof_of_work_target = 0;
        let (mut sa, mut sb) = tokio::io::duplex(4096);

        let (ra, rb) = tokio::join!(
            authenticate(&mut sa, &a, &[1], false),
            authenticate(&mut sb, &b, &[1], true),
        );
        assert!(matches!(ra, Err(PoolError::Myself)));
        assert!(matches!(rb, Err(PoolError::Myself)));
    }

    #[tokio::test]
    async fn test_eof_maps_by_direction() {
        // Remote consumes our auth frame, then hangs up without replying.
        let a = config_with(0);
        let (mut sa, mut sb) = tokio::io::duplex(4096);
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = sb.read(&mut buf).await;
        });
        let err = authenticate(&mut sa, &a, &[1], false).await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectionRefused));
        reader.await.unwrap();

        // The same hangup on an incoming socket is a plain close.
        let (mut sc, mut sd) = tokio::io::duplex(4096);
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = sd.read(&mut buf).await;
        });
        let err = authenticate(&mut sc, &a, &[1], true).await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectionClosed));
        reader.await.unwrap();
    }
}
