//! Wire-level message shapes traded between nodes, plus the canonical
//! serialization and fingerprinting used to identify reliable
//! broadcast messages across nodes.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::communication::{NodeId, SENDER_ID_TOPIC};
use crate::engine::crypto::hash::Digest;
use crate::engine::error::*;

/// Bound satisfied by any application payload this crate carries.
///
/// Anything the underlying JSON encoding can round-trip qualifies;
/// there is no further constraint on shape.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// The body of a frame on the plain transport: `[topic, payload]`.
pub type TopicBody<P> = (String, P);

/// Initial-phase reliable broadcast message: `[uuid, payload]`. The
/// UUID is generated fresh by the original sender.
pub type MessageWithId<P> = (String, P);

/// Echo/ready-phase reliable broadcast message:
/// `[uuid, payload, originatorId]`. The originator is appended by the
/// first receiver when promoting an `initial` into an `echo`.
pub type AnnotatedMessage<P> = (String, P, NodeId);

/// `(uuid, sha256(canonical-serialization(AnnotatedMessage)))`, stored
/// as a stable string. Two `AnnotatedMessage`s are the same logical
/// message iff their fingerprints match.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct MessageFingerprint(String);

impl MessageFingerprint {
    /// Computes the fingerprint of an `AnnotatedMessage`.
    pub fn of<P: Serialize>(msg: &AnnotatedMessage<P>) -> Result<Self> {
        let bytes = canonical_json_bytes(msg)?;
        let digest = Digest::from_data(&bytes);
        Ok(MessageFingerprint(format!("{}:{}", msg.0, digest.to_hex())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serializes `value` to a canonical byte form: a `serde_json::Value`
/// with every object's keys in sorted order (the default,
/// `preserve_order`-free behavior of `serde_json::Value`), so that two
/// structurally equal values serialize identically regardless of the
/// order their fields were declared or populated in.
///
/// Picking one canonical form and committing to it matters because
/// fingerprints are compared across nodes and across independent
/// serializations of the same logical value, and naive JSON encoders
/// give no key-ordering guarantee on their own.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let as_value = serde_json::to_value(value).wrapped(ErrorKind::CommunicationMessage)?;
    serde_json::to_vec(&as_value).wrapped(ErrorKind::CommunicationMessage)
}

/// Serializes a `TopicBody` to the UTF-8 JSON bytes carried inside one
/// frame's payload.
pub fn encode_topic_body<P: Serialize>(body: &TopicBody<P>) -> Result<Vec<u8>> {
    serde_json::to_vec(body).wrapped(ErrorKind::CommunicationMessage)
}

/// Parses a `TopicBody` from frame payload bytes. Returns an error
/// (never a panic) on malformed or shape-invalid data, so the caller
/// can drop the frame and keep the connection open.
pub fn decode_topic_body<P: DeserializeOwned>(bytes: &[u8]) -> Result<TopicBody<P>> {
    serde_json::from_slice(bytes).wrapped(ErrorKind::CommunicationMessage)
}

/// Escapes a topic name so it cannot collide with the reserved
/// `senderId` pseudo-topic: a topic ending in `"senderId"` gets one
/// leading underscore prefixed before it is sent.
///
/// This is a brittle scheme — a typed frame discriminator would be
/// cleaner — but it is kept here for fidelity with the source design.
pub fn escape_topic(topic: &str) -> String {
    if topic.ends_with(SENDER_ID_TOPIC) {
        format!("_{}", topic)
    } else {
        topic.to_owned()
    }
}

/// Reverses `escape_topic`: strips one leading underscore from a topic
/// that otherwise ends in `"senderId"`.
pub fn unescape_topic(topic: &str) -> String {
    if topic.ends_with(SENDER_ID_TOPIC) && topic.starts_with('_') {
        topic[1..].to_owned()
    } else {
        topic.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_equal_messages() {
        let a: AnnotatedMessage<i32> = ("u1".into(), 42, NodeId::from("n1"));
        let b: AnnotatedMessage<i32> = ("u1".into(), 42, NodeId::from("n1"));
        assert_eq!(MessageFingerprint::of(&a).unwrap(), MessageFingerprint::of(&b).unwrap());
    }

    #[test]
    fn fingerprint_differs_on_content_with_same_uuid() {
        let a: AnnotatedMessage<&str> = ("u1".into(), "hello", NodeId::from("n1"));
        let b: AnnotatedMessage<&str> = ("u1".into(), "bye", NodeId::from("n1"));
        assert_ne!(MessageFingerprint::of(&a).unwrap(), MessageFingerprint::of(&b).unwrap());
    }

    #[test]
    fn fingerprint_depends_on_originator() {
        let a: AnnotatedMessage<&str> = ("u1".into(), "hello", NodeId::from("n1"));
        let b: AnnotatedMessage<&str> = ("u1".into(), "hello", NodeId::from("n2"));
        assert_ne!(MessageFingerprint::of(&a).unwrap(), MessageFingerprint::of(&b).unwrap());
    }

    #[test]
    fn escape_and_unescape_round_trip_a_colliding_topic() {
        let topic = "weirdSenderId";
        let escaped = escape_topic(topic);
        assert_eq!(escaped, "_weirdSenderId");
        assert_eq!(unescape_topic(&escaped), topic);
    }

    #[test]
    fn ordinary_topics_are_untouched() {
        assert_eq!(escape_topic("echo"), "echo");
        assert_eq!(unescape_topic("echo"), "echo");
    }

    #[test]
    fn topic_body_round_trips_through_json() {
        let body: TopicBody<i32> = ("echo".to_owned(), 7);
        let bytes = encode_topic_body(&body).unwrap();
        let decoded: TopicBody<i32> = decode_topic_body(&bytes).unwrap();
        assert_eq!(body, decoded);
    }
}
