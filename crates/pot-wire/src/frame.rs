//! Broadcast and bulk frame grammars.
//!
//! Broadcast frames lead with a whitespace-delimited topic; the topic suffix
//! distinguishes plain descriptors from bulk continuations and bundles.

use bytes::Bytes;

use crate::error::{WireError, WireResult};
use crate::ids::TransactionId;
use crate::message::Response;

/// Topic suffix marking the raw second frame of a two-frame message.
pub const BULK_SUFFIX: &str = ";bulk";

/// Topic suffix marking an aggregated broadcast.
pub const BUNDLE_SUFFIX: &str = ";bundle";

/// True when the frame's leading topic token ends with `;bulk`.
///
/// This peeks at the topic exactly the way the publish socket's server-side
/// filter does; the remainder of the frame is not examined.
pub fn is_bulk_topic(frame: &[u8]) -> bool {
    let topic = frame
        .split(|&byte| byte == b' ')
        .next()
        .unwrap_or(frame);
    topic.ends_with(BULK_SUFFIX.as_bytes())
}

/// The raw second frame of a two-frame message:
/// `<name>;bulk <8-hex-id> <raw bytes…>`.
///
/// Only the topic and id are text; the payload is carried byte-exact and may
/// contain any octet, including spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkFrame {
    /// Element name, without the `;bulk` suffix.
    pub name: String,
    pub id: TransactionId,
    pub payload: Bytes,
}

impl BulkFrame {
    pub fn new(name: impl Into<String>, id: TransactionId, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            id,
            payload: payload.into(),
        }
    }

    pub fn parse(frame: &[u8]) -> WireResult<Self> {
        let first_space = frame
            .iter()
            .position(|&byte| byte == b' ')
            .ok_or_else(|| WireError::BadFrame("truncated bulk frame".to_string()))?;
        let topic = std::str::from_utf8(&frame[..first_space])
            .map_err(|_| WireError::BadFrame("bulk topic is not UTF-8".to_string()))?;
        let name = topic
            .strip_suffix(BULK_SUFFIX)
            .ok_or_else(|| WireError::BadFrame(format!("topic {topic:?} lacks the ;bulk suffix")))?;

        // The id is the next token; the payload begins after the single
        // following space.
        let rest = &frame[first_space + 1..];
        let (id_text, payload) = match rest.iter().position(|&byte| byte == b' ') {
            Some(second_space) => (&rest[..second_space], &rest[second_space + 1..]),
            None => (rest, &[][..]),
        };
        let id_text = std::str::from_utf8(id_text)
            .map_err(|_| WireError::BadFrame("bulk id is not UTF-8".to_string()))?;
        let id = TransactionId::from_hex(id_text)?;

        Ok(Self {
            name: name.to_string(),
            id,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Encodes the frame; the payload bytes are emitted verbatim.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame =
            Vec::with_capacity(self.name.len() + BULK_SUFFIX.len() + 10 + self.payload.len());
        frame.extend_from_slice(self.name.as_bytes());
        frame.extend_from_slice(BULK_SUFFIX.as_bytes());
        frame.push(b' ');
        frame.extend_from_slice(self.id.to_string().as_bytes());
        frame.push(b' ');
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// The same frame under a different transaction id.
    pub fn with_id(mut self, id: TransactionId) -> Self {
        self.id = id;
        self
    }
}

/// A broadcast frame as read from a publish socket, classified by topic.
#[derive(Debug, Clone)]
pub enum Broadcast {
    /// Plain `<topic> <json>` publish descriptor.
    Message { topic: String, descriptor: Response },
    /// Bulk continuation frame.
    Bulk(BulkFrame),
    /// `<prefix>;bundle <json-array>` aggregated publish.
    Bundle {
        topic: String,
        descriptors: Vec<Response>,
    },
}

impl Broadcast {
    pub fn parse(frame: &[u8]) -> WireResult<Self> {
        if is_bulk_topic(frame) {
            return Ok(Broadcast::Bulk(BulkFrame::parse(frame)?));
        }

        let space = frame
            .iter()
            .position(|&byte| byte == b' ')
            .ok_or_else(|| WireError::BadFrame("truncated broadcast frame".to_string()))?;
        let topic = std::str::from_utf8(&frame[..space])
            .map_err(|_| WireError::BadFrame("broadcast topic is not UTF-8".to_string()))?
            .to_string();
        let body = std::str::from_utf8(&frame[space + 1..])
            .map_err(|_| WireError::BadFrame("broadcast body is not UTF-8".to_string()))?;

        if topic.ends_with(BUNDLE_SUFFIX) {
            let descriptors: Vec<Response> = serde_json::from_str(body)
                .map_err(|e| WireError::BadFrame(format!("bundle body: {e}")))?;
            // Every element of a bundle shares a single transaction id.
            if let Some(first) = descriptors.first() {
                if descriptors.iter().any(|d| d.id != first.id) {
                    return Err(WireError::BadFrame(
                        "bundle elements disagree on the transaction id".to_string(),
                    ));
                }
            }
            return Ok(Broadcast::Bundle { topic, descriptors });
        }

        let descriptor = serde_json::from_str(body)
            .map_err(|e| WireError::BadFrame(format!("broadcast body: {e}")))?;
        Ok(Broadcast::Message { topic, descriptor })
    }

    /// Encodes a plain publish descriptor under its topic.
    pub fn encode_message(topic: &str, descriptor: &Response) -> WireResult<Vec<u8>> {
        let body = descriptor.to_bytes()?;
        let mut frame = Vec::with_capacity(topic.len() + 1 + body.len());
        frame.extend_from_slice(topic.as_bytes());
        frame.push(b' ');
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Encodes a bundle of descriptors under its `;bundle` topic.
    pub fn encode_bundle(prefix: &str, descriptors: &[Response]) -> WireResult<Vec<u8>> {
        let body = serde_json::to_vec(descriptors)?;
        let mut frame = Vec::with_capacity(prefix.len() + BUNDLE_SUFFIX.len() + 1 + body.len());
        frame.extend_from_slice(prefix.as_bytes());
        frame.extend_from_slice(BUNDLE_SUFFIX.as_bytes());
        frame.push(b' ');
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

#[cfg(test)]
mod frame_tests {
    use super::*;

    #[test]
    fn bulk_frame_round_trips_byte_exact() {
        let payload: &[u8] = b"\x00\x01 raw bytes with spaces \xff\xfe";
        let frame = BulkFrame::new("kpfguide.LASTIMAGE", TransactionId::new(0x42), payload);
        let encoded = frame.encode();

        assert!(encoded.starts_with(b"kpfguide.LASTIMAGE;bulk 00000042 "));
        let decoded = BulkFrame::parse(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(&decoded.payload[..], payload);
    }

    #[test]
    fn bulk_frame_id_rewrite_preserves_payload() {
        let frame = BulkFrame::new("s.EL", TransactionId::new(1), &b"a b c"[..]);
        let rewritten = BulkFrame::parse(&frame.encode())
            .unwrap()
            .with_id(TransactionId::new(0xdead))
            .encode();
        assert_eq!(&rewritten[..], b"s.EL;bulk 0000dead a b c".as_slice());
    }

    #[test]
    fn bulk_frame_rejects_bad_ids() {
        assert!(BulkFrame::parse(b"s.EL;bulk 123 payload").is_err());
        assert!(BulkFrame::parse(b"s.EL;bulk zzzzzzzz payload").is_err());
        assert!(BulkFrame::parse(b"s.EL 00000001 payload").is_err());
        assert!(BulkFrame::parse(b"s.EL;bulk").is_err());
    }

    #[test]
    fn topic_peek_spots_bulk_frames() {
        assert!(is_bulk_topic(b"kpfguide.LASTIMAGE;bulk 00000001 x"));
        assert!(!is_bulk_topic(b"kpfguide.LASTIMAGE {\"message\":\"PUB\"}"));
        assert!(!is_bulk_topic(b"kpfguide;bundle []"));
    }

    #[test]
    fn classifies_plain_broadcasts() {
        let descriptor = Response::publish(TransactionId::new(5)).with_name("s.EL");
        let frame = Broadcast::encode_message("s.EL", &descriptor).unwrap();
        match Broadcast::parse(&frame).unwrap() {
            Broadcast::Message { topic, descriptor } => {
                assert_eq!(topic, "s.EL");
                assert_eq!(descriptor.id, TransactionId::new(5));
            }
            other => panic!("expected a plain broadcast, got {other:?}"),
        }
    }

    #[test]
    fn bundle_elements_must_share_an_id() {
        let shared = vec![
            Response::publish(TransactionId::new(9)).with_name("s.A"),
            Response::publish(TransactionId::new(9)).with_name("s.B"),
        ];
        let frame = Broadcast::encode_bundle("s", &shared).unwrap();
        match Broadcast::parse(&frame).unwrap() {
            Broadcast::Bundle { topic, descriptors } => {
                assert_eq!(topic, "s;bundle");
                assert_eq!(descriptors.len(), 2);
            }
            other => panic!("expected a bundle, got {other:?}"),
        }

        let mixed = vec![
            Response::publish(TransactionId::new(1)),
            Response::publish(TransactionId::new(2)),
        ];
        let frame = Broadcast::encode_bundle("s", &mixed).unwrap();
        assert!(Broadcast::parse(&frame).is_err());
    }
}
