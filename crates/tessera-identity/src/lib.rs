//! # tessera-identity
//!
//! Node identity for the Tessera networking layer.
//!
//! A node's identity is an Ed25519 keypair; the 32-byte public key doubles
//! as the node's [`PeerId`] on the wire. Generating an identity requires
//! solving a proof-of-work puzzle: `Blake2b-256(public_key || nonce)` must
//! have at least `target` leading zero bits. This makes bulk identity
//! generation expensive while keeping verification O(1).

use blake2::{Blake2b, Digest};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::Rng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use typenum::U32;

/// Length of a peer id in bytes (Ed25519 public key).
pub const PEER_ID_LENGTH: usize = 32;

/// Length of a signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Identity errors.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Peer id was not valid hex or had the wrong length.
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}

/// Unique peer identifier: the node's Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LENGTH]);

impl PeerId {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PEER_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let raw = hex::decode(s).map_err(|e| IdentityError::InvalidPeerId(e.to_string()))?;
        let bytes: [u8; PEER_ID_LENGTH] = raw
            .try_into()
            .map_err(|_| IdentityError::InvalidPeerId(format!("wrong length for {s}")))?;
        Ok(Self(bytes))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LENGTH] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({}..)", hex::encode(&self.0[..4]))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Proof-of-work stamp attached to an identity.
///
/// The stamp is a nonce such that `Blake2b-256(peer_id || nonce)` has the
/// required number of leading zero bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowStamp {
    /// The mined nonce.
    pub nonce: u64,
}

impl PowStamp {
    /// Mine a stamp for `peer_id` meeting `target` leading zero bits.
    ///
    /// Starts from a random nonce and scans forward. With small targets
    /// (the defaults used on private networks and in tests) this returns
    /// almost immediately.
    pub fn mine(peer_id: &PeerId, target: u32) -> Self {
        let mut nonce: u64 = rand::thread_rng().gen();
        loop {
            if pow_difficulty(peer_id, nonce) >= target {
                return Self { nonce };
            }
            nonce = nonce.wrapping_add(1);
        }
    }

    /// Difficulty this stamp achieves for `peer_id`.
    pub fn difficulty(&self, peer_id: &PeerId) -> u32 {
        pow_difficulty(peer_id, self.nonce)
    }
}

/// Count the leading zero bits of `Blake2b-256(peer_id || nonce)`.
pub fn pow_difficulty(peer_id: &PeerId, nonce: u64) -> u32 {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(peer_id.as_bytes());
    hasher.update(nonce.to_be_bytes());
    let hash = hasher.finalize();

    let mut bits = 0u32;
    for byte in hash.iter() {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Check that a stamp meets the given difficulty target.
pub fn verify_pow(peer_id: &PeerId, nonce: u64, target: u32) -> bool {
    pow_difficulty(peer_id, nonce) >= target
}

/// Verify an Ed25519 signature made by `peer_id` over `message`.
///
/// Returns `false` for malformed keys as well as bad signatures.
pub fn verify_signature(peer_id: &PeerId, message: &[u8], signature: &[u8; SIGNATURE_LENGTH]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(peer_id.as_bytes()) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    key.verify(message, &sig).is_ok()
}

/// A node's long-lived identity: signing key plus proof-of-work stamp.
pub struct Keypair {
    signing: SigningKey,
    peer_id: PeerId,
    pow: PowStamp,
}

impl Keypair {
    /// Generate a fresh identity, mining a stamp for `pow_target`.
    pub fn generate(pow_target: u32) -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let peer_id = PeerId::from_bytes(signing.verifying_key().to_bytes());
        let pow = PowStamp::mine(&peer_id, pow_target);
        Self {
            signing,
            peer_id,
            pow,
        }
    }

    /// The peer id derived from this keypair.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The proof-of-work stamp.
    pub fn pow(&self) -> PowStamp {
        self.pow
    }

    /// Sign a message with the secret key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id)
            .field("pow", &self.pow)
            .finish()
    }
}
