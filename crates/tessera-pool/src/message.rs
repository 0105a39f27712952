//! Control-plane messages and the application encoding registry.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::{Buf, Bytes};
use tessera_identity::{PeerId, PEER_ID_LENGTH};

use crate::codec::Frame;
use crate::error::{PoolError, PoolResult};
use crate::MAX_FRAME_SIZE;

/// Graceful close notice.
pub const TAG_DISCONNECT: u8 = 0x01;
/// Request for known points.
pub const TAG_BOOTSTRAP: u8 = 0x02;
/// Sample of known points.
pub const TAG_ADVERTISE: u8 = 0x03;
/// Topology-refresh proposal.
pub const TAG_SWAP_REQUEST: u8 = 0x04;
/// Topology-refresh confirmation.
pub const TAG_SWAP_ACK: u8 = 0x05;

/// Highest reserved control tag; application tags start above it.
pub const CONTROL_TAG_MAX: u8 = 0x05;

/// Payload limit for control frames.
const CONTROL_MAX_LENGTH: usize = 16 * 1024;

/// Cap on points carried by a single `Advertise`.
pub(crate) const MAX_ADVERTISED_POINTS: usize = 100;

/// Internal messages multiplexed with application traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// The remote is closing the connection.
    Disconnect,
    /// The remote asks for a sample of our known points.
    Bootstrap,
    /// A sample of the sender's known points.
    Advertise(Vec<SocketAddr>),
    /// The sender proposes we connect to `point` and drop one of ours.
    SwapRequest {
        /// Suggested point.
        point: SocketAddr,
        /// Identity expected at the point.
        peer: PeerId,
    },
    /// The sender accepted a swap and dropped the named connection.
    SwapAck {
        /// The dropped point.
        point: SocketAddr,
        /// The dropped identity.
        peer: PeerId,
    },
}

impl ControlMessage {
    /// Wire tag of this message.
    pub fn tag(&self) -> u8 {
        match self {
            ControlMessage::Disconnect => TAG_DISCONNECT,
            ControlMessage::Bootstrap => TAG_BOOTSTRAP,
            ControlMessage::Advertise(_) => TAG_ADVERTISE,
            ControlMessage::SwapRequest { .. } => TAG_SWAP_REQUEST,
            ControlMessage::SwapAck { .. } => TAG_SWAP_ACK,
        }
    }

    /// Encode into a frame.
    pub(crate) fn to_frame(&self) -> Frame {
        let mut buf = Vec::new();
        match self {
            ControlMessage::Disconnect | ControlMessage::Bootstrap => {}
            ControlMessage::Advertise(points) => {
                buf.extend_from_slice(&(points.len() as u16).to_be_bytes());
                for point in points {
                    put_addr(&mut buf, point);
                }
            }
            ControlMessage::SwapRequest { point, peer }
            | ControlMessage::SwapAck { point, peer } => {
                put_addr(&mut buf, point);
                buf.extend_from_slice(peer.as_bytes());
            }
        }
        Frame {
            tag: self.tag(),
            payload: Bytes::from(buf),
        }
    }

    /// Decode from a tagged payload.
    pub(crate) fn from_frame(tag: u8, payload: &[u8]) -> PoolResult<Self> {
        let mut bytes = Bytes::copy_from_slice(payload);
        let msg = match tag {
            TAG_DISCONNECT => ControlMessage::Disconnect,
            TAG_BOOTSTRAP => ControlMessage::Bootstrap,
            TAG_ADVERTISE => {
                if bytes.remaining() < 2 {
                    return Err(PoolError::DecodingError("advertise too short".to_string()));
                }
                let count = bytes.get_u16() as usize;
                if count > MAX_ADVERTISED_POINTS {
                    return Err(PoolError::DecodingError(format!(
                        "advertise carries {} points, cap is {}",
                        count, MAX_ADVERTISED_POINTS
                    )));
                }
                let mut points = Vec::with_capacity(count);
                for _ in 0..count {
                    points.push(get_addr(&mut bytes)?);
                }
                ControlMessage::Advertise(points)
            }
            TAG_SWAP_REQUEST | TAG_SWAP_ACK => {
                let point = get_addr(&mut bytes)?;
                let peer = get_peer_id(&mut bytes)?;
                if tag == TAG_SWAP_REQUEST {
                    ControlMessage::SwapRequest { point, peer }
                } else {
                    ControlMessage::SwapAck { point, peer }
                }
            }
            other => {
                return Err(PoolError::DecodingError(format!(
                    "unknown control tag 0x{:02x}",
                    other
                )))
            }
        };
        if bytes.has_remaining() {
            return Err(PoolError::DecodingError("trailing bytes".to_string()));
        }
        Ok(msg)
    }
}

fn put_addr(buf: &mut Vec<u8>, addr: &SocketAddr) {
    let s = addr.to_string();
    buf.push(s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
}

fn get_addr(bytes: &mut Bytes) -> PoolResult<SocketAddr> {
    if bytes.remaining() < 1 {
        return Err(PoolError::DecodingError("address truncated".to_string()));
    }
    let len = bytes.get_u8() as usize;
    if bytes.remaining() < len {
        return Err(PoolError::DecodingError("address truncated".to_string()));
    }
    let raw = bytes.copy_to_bytes(len);
    let s = std::str::from_utf8(&raw)
        .map_err(|_| PoolError::DecodingError("address is not utf-8".to_string()))?;
    s.parse()
        .map_err(|_| PoolError::DecodingError(format!("bad address {s:?}")))
}

fn get_peer_id(bytes: &mut Bytes) -> PoolResult<PeerId> {
    if bytes.remaining() < PEER_ID_LENGTH {
        return Err(PoolError::DecodingError("peer id truncated".to_string()));
    }
    let mut raw = [0u8; PEER_ID_LENGTH];
    bytes.copy_to_slice(&mut raw);
    Ok(PeerId::from_bytes(raw))
}

/// One registered application message variant.
///
/// The registry of these is heterogeneous: each entry recognizes its own
/// tag, decodes payloads into the shared message type and encodes the
/// variants it owns (`encode` returns `None` for foreign variants).
pub trait AppEncoding<M>: Send + Sync {
    /// Wire tag; must be above [`CONTROL_TAG_MAX`].
    fn tag(&self) -> u8;
    /// Payload limit for this tag. `None` falls back to the global cap.
    fn max_length(&self) -> Option<usize>;
    /// Encode `msg` if this entry owns the variant.
    fn encode(&self, msg: &M) -> Option<Vec<u8>>;
    /// Decode a payload carrying this tag.
    fn decode(&self, payload: &[u8]) -> Option<M>;
}

/// Application message configuration: protocol versions and the encoding
/// registry.
pub struct MessageConfig<M> {
    versions: Vec<u16>,
    encodings: Vec<Box<dyn AppEncoding<M>>>,
}

impl<M> MessageConfig<M> {
    /// Create a configuration supporting the given protocol versions, in
    /// preference order.
    pub fn new(versions: Vec<u16>) -> Self {
        assert!(!versions.is_empty(), "at least one protocol version required");
        Self {
            versions,
            encodings: Vec::new(),
        }
    }

    /// Register an application encoding.
    ///
    /// Panics if the tag is reserved or already registered; both are
    /// configuration bugs.
    pub fn with_encoding(mut self, encoding: Box<dyn AppEncoding<M>>) -> Self {
        let tag = encoding.tag();
        assert!(tag > CONTROL_TAG_MAX, "tag 0x{:02x} is reserved", tag);
        assert!(
            self.encodings.iter().all(|e| e.tag() != tag),
            "tag 0x{:02x} registered twice",
            tag
        );
        self.encodings.push(encoding);
        self
    }

    /// Supported protocol versions, in preference order.
    pub fn versions(&self) -> &[u16] {
        &self.versions
    }

    /// Per-tag payload limits for the frame codec: all control tags plus
    /// every registered application tag.
    pub(crate) fn frame_limits(&self) -> HashMap<u8, usize> {
        let mut limits = HashMap::new();
        for tag in [
            TAG_DISCONNECT,
            TAG_BOOTSTRAP,
            TAG_ADVERTISE,
            TAG_SWAP_REQUEST,
            TAG_SWAP_ACK,
        ] {
            limits.insert(tag, CONTROL_MAX_LENGTH);
        }
        for encoding in &self.encodings {
            limits.insert(encoding.tag(), encoding.max_length().unwrap_or(MAX_FRAME_SIZE));
        }
        limits
    }

    /// Encode an application message into a frame.
    pub(crate) fn encode_app(&self, msg: &M) -> PoolResult<Frame> {
        for encoding in &self.encodings {
            if let Some(payload) = encoding.encode(msg) {
                let limit = encoding.max_length().unwrap_or(MAX_FRAME_SIZE);
                if payload.len() > limit {
                    return Err(PoolError::DecodingError(format!(
                        "encoded message of {} bytes exceeds limit {} for tag 0x{:02x}",
                        payload.len(),
                        limit,
                        encoding.tag()
                    )));
                }
                return Ok(Frame {
                    tag: encoding.tag(),
                    payload: Bytes::from(payload),
                });
            }
        }
        Err(PoolError::DecodingError(
            "no encoding registered for message".to_string(),
        ))
    }

    /// Decode an application payload by tag.
    pub(crate) fn decode_app(&self, tag: u8, payload: &[u8]) -> PoolResult<M> {
        let encoding = self
            .encodings
            .iter()
            .find(|e| e.tag() == tag)
            .ok_or_else(|| PoolError::DecodingError(format!("unknown tag 0x{:02x}", tag)))?;
        encoding
            .decode(payload)
            .ok_or_else(|| PoolError::DecodingError(format!("malformed payload for tag 0x{:02x}", tag)))
    }
}

impl<M> std::fmt::Debug for MessageConfig<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConfig")
            .field("versions", &self.versions)
            .field("tags", &self.encodings.iter().map(|e| e.tag()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_identity::Keypair;

    /// Plain-text test messages on tag 0x10.
    pub(crate) struct TextEncoding;

    impl AppEncoding<String> for TextEncoding {
        fn tag(&self) -> u8 {
            0x10
        }
        fn max_length(&self) -> Option<usize> {
            Some(256)
        }
        fn encode(&self, msg: &String) -> Option<Vec<u8>> {
            Some(msg.as_bytes().to_vec())
        }
        fn decode(&self, payload: &[u8]) -> Option<String> {
            String::from_utf8(payload.to_vec()).ok()
        }
    }

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_control_roundtrip() {
        let peer = Keypair::generate(0).peer_id();
        let messages = vec![
            ControlMessage::Disconnect,
            ControlMessage::Bootstrap,
            ControlMessage::Advertise(vec![test_addr(9732), test_addr(9733)]),
            ControlMessage::SwapRequest {
                point: test_addr(9734),
                peer,
            },
            ControlMessage::SwapAck {
                point: test_addr(9735),
                peer,
            },
        ];

        for msg in messages {
            let frame = msg.to_frame();
            let back = ControlMessage::from_frame(frame.tag, &frame.payload).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn test_advertise_count_cap() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_ADVERTISED_POINTS as u16 + 1).to_be_bytes());
        let err = ControlMessage::from_frame(TAG_ADVERTISE, &buf).unwrap_err();
        assert!(matches!(err, PoolError::DecodingError(_)));
    }

    #[test]
    fn test_truncated_swap_is_rejected() {
        let frame = ControlMessage::SwapRequest {
            point: test_addr(9736),
            peer: Keypair::generate(0).peer_id(),
        }
        .to_frame();
        let cut = &frame.payload[..frame.payload.len() - 1];
        assert!(ControlMessage::from_frame(TAG_SWAP_REQUEST, cut).is_err());
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn test_reserved_tag_is_refused() {
        struct BadEncoding;
        impl AppEncoding<String> for BadEncoding {
            fn tag(&self) -> u8 {
                TAG_ADVERTISE
            }
            fn max_length(&self) -> Option<usize> {
                None
            }
            fn encode(&self, _: &String) -> Option<Vec<u8>> {
                None
            }
            fn decode(&self, _: &[u8]) -> Option<String> {
                None
            }
        }
        let _ = MessageConfig::new(vec![1]).with_encoding(Box::new(BadEncoding));
    }

    #[test]
    fn test_app_encode_decode() {
        let config = MessageConfig::new(vec![1]).with_encoding(Box::new(TextEncoding));

        let frame = config.encode_app(&"hi".to_string()).unwrap();
        assert_eq!(frame.tag, 0x10);

        let back = config.decode_app(frame.tag, &frame.payload).unwrap();
        assert_eq!(back, "hi");

        assert!(config.decode_app(0x77, b"x").is_err());
    }

    #[test]
    fn test_app_encode_respects_limit() {
        let config = MessageConfig::new(vec![1]).with_encoding(Box::new(TextEncoding));
        let oversized = "x".repeat(300);
        assert!(config.encode_app(&oversized).is_err());
    }

    #[test]
    fn test_frame_limits_include_control_tags() {
        let config = MessageConfig::new(vec![1]).with_encoding(Box::new(TextEncoding));
        let limits = config.frame_limits();
        assert_eq!(limits.get(&TAG_ADVERTISE), Some(&CONTROL_MAX_LENGTH));
        assert_eq!(limits.get(&0x10), Some(&256));
    }
}
