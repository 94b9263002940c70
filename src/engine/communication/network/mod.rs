//! The `Network` contract shared by the plain and encrypted
//! transports: per-peer connection management, topic-based
//! demultiplexing, and send/receive.
//!
//! A single `Network` carries every topic this node ever uses — best
//! effort broadcast, the three reliable-broadcast phases, and the
//! bootstrap barrier's setup topic all multiplex over the same set of
//! connections, each with its own wire shape. To let that happen
//! without pinning the whole transport to one payload type, the core
//! trait moves bytes (already-serialized JSON values), and a generic
//! convenience layer on top (`NetworkExt`) does the `Payload`
//! serialization at the call site. This keeps `dyn Network` usable
//! while every caller still works with its own concrete message type.

pub mod encrypted;
pub mod plain;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::communication::message::{self, Payload};
use crate::engine::communication::{Membership, NodeId, Peer};
use crate::engine::error::*;

pub use self::encrypted::{EncryptedNetwork, EncryptedNetworkConfig, GetPublicKeyFilePath};
pub use self::plain::PlainNetwork;

/// A boxed, `Send` future, used wherever a trait needs to return an
/// async value without pulling in the `async-trait` macro.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered topic callback, given the id of the peer a frame
/// arrived from and its value still encoded as JSON bytes. Receivers
/// run strictly sequentially as far as a single connection's frames
/// are concerned (each inbound connection is read by exactly one
/// task), matching the "no two handlers execute concurrently on the
/// same component" requirement.
pub type RawReceiver = Arc<dyn Fn(NodeId, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Configuration shared by both transports' constructors.
pub struct NetworkConfig {
    pub membership: Membership,
}

/// Contract implemented by both `PlainNetwork` and `EncryptedNetwork`.
///
/// Delivers every message sent between correct peers exactly once to
/// the registered receiver for its topic (best-effort, backed by
/// reliable stream semantics while connections are up). Neither
/// implementation authenticates the *application-level* sender beyond
/// what its own handshake provides (none, for the plain transport;
/// RSA-to-known-public-key, for the encrypted one).
pub trait Network: Send + Sync {
    fn self_id(&self) -> &NodeId;

    /// Tears down any prior outbound socket to `id` (if `id` isn't
    /// self) and opens a new one, re-announcing this node's id.
    fn register_node(&self, id: NodeId, peer: Peer) -> BoxFuture<'_, ()>;

    /// Replaces any prior handler for `topic`.
    fn register_raw_receiver(&self, topic: &str, receiver: RawReceiver);

    /// Sends the JSON-encoded `value` on `topic` to `target`. If
    /// `target` is this node, the registered receiver (if any) is
    /// invoked directly, without touching the network, with this
    /// node's own id as the apparent sender.
    fn send_raw(&self, target: NodeId, topic: String, value: Vec<u8>) -> BoxFuture<'_, ()>;

    /// Stops reconnection and tears down every connection. Sends after
    /// `stop()` are dropped.
    fn stop(&self) -> BoxFuture<'_, ()>;
}

/// Typed convenience methods layered over the byte-oriented `Network`
/// core, so call sites never touch JSON directly. Kept separate from
/// `Network` itself (rather than added as default methods there)
/// because a generic method on `Network` would make it impossible to
/// use as a trait object.
pub trait NetworkExt: Network {
    fn register_receiver<P, F>(&self, topic: &str, handler: F)
    where
        P: Payload,
        F: Fn(NodeId, P) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.register_raw_receiver(topic, typed_receiver(handler));
    }

    fn send_message<P: Payload>(
        &self,
        target: NodeId,
        topic: String,
        payload: P,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let bytes = serde_json::to_vec(&payload).wrapped(ErrorKind::CommunicationMessage)?;
            self.send_raw(target, topic, bytes).await;
            Ok(())
        })
    }
}

impl<T: Network + ?Sized> NetworkExt for T {}

/// Wraps a typed handler into a `RawReceiver`, deserializing the JSON
/// value lazily as each frame arrives. A value that doesn't decode as
/// `P` is dropped, matching the transport's error-handling contract.
pub fn typed_receiver<P, F>(handler: F) -> RawReceiver
where
    P: Payload,
    F: Fn(NodeId, P) -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
    Arc::new(move |from, bytes| match serde_json::from_slice::<P>(&bytes) {
        Ok(payload) => handler(from, payload),
        Err(_) => {
            tracing::debug!("dropping frame with undecodable payload");
            Box::pin(async {})
        }
    })
}

/// Builds a full frame body — `[escaped_topic, value]` — from a raw
/// JSON-encoded value, ready to be written by a transport.
pub(crate) fn wrap_frame(topic: &str, value_bytes: &[u8]) -> Result<Vec<u8>> {
    let value: serde_json::Value =
        serde_json::from_slice(value_bytes).wrapped(ErrorKind::CommunicationMessage)?;
    let escaped = message::escape_topic(topic);
    serde_json::to_vec(&(escaped, value)).wrapped(ErrorKind::CommunicationMessage)
}

/// Parses a frame body as `[topic, value]`, unescapes the topic, and
/// invokes the registered receiver (if any) with the sender's id and
/// the value re-serialized to bytes. Malformed frames and frames for
/// topics with no registered receiver are silently dropped.
pub(crate) async fn dispatch_frame(
    receivers: &parking_lot::Mutex<std::collections::HashMap<String, RawReceiver>>,
    sender_id: &NodeId,
    bytes: &[u8],
) {
    let (topic, value) = match serde_json::from_slice::<(String, serde_json::Value)>(bytes) {
        Ok(tb) => tb,
        Err(_) => {
            tracing::debug!("dropping frame with malformed topic body");
            return;
        }
    };
    let topic = message::unescape_topic(&topic);
    let receiver = receivers.lock().get(&topic).cloned();
    let Some(receiver) = receiver else { return };
    let value_bytes = match serde_json::to_vec(&value) {
        Ok(bytes) => bytes,
        Err(_) => return,
    };
    receiver(sender_id.clone(), value_bytes).await;
}

/// Bounded exponential backoff for outbound reconnection attempts:
/// `min(base * 2^attempt, cap)`, resetting to `attempt = 0` on a
/// successful connection.
pub(crate) fn reconnect_backoff(attempt: u32) -> Duration {
    const BASE: Duration = Duration::from_millis(100);
    const CAP: Duration = Duration::from_secs(5);
    let scaled = BASE.saturating_mul(1u32 << attempt.min(16));
    scaled.min(CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        assert_eq!(reconnect_backoff(0), Duration::from_millis(100));
        assert_eq!(reconnect_backoff(1), Duration::from_millis(200));
        assert_eq!(reconnect_backoff(2), Duration::from_millis(400));
        assert_eq!(reconnect_backoff(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn wrap_and_dispatch_round_trip() {
        let bytes = serde_json::to_vec(&7i32).unwrap();
        let framed = wrap_frame("echo", &bytes).unwrap();

        let receivers = parking_lot::Mutex::new(std::collections::HashMap::new());
        let got = Arc::new(parking_lot::Mutex::new(None));
        let got2 = got.clone();
        receivers.lock().insert(
            "echo".to_owned(),
            typed_receiver::<i32, _>(move |_from, value| {
                let got2 = got2.clone();
                Box::pin(async move {
                    *got2.lock() = Some(value);
                })
            }),
        );

        let sender = NodeId::from("n1");
        dispatch_frame(&receivers, &sender, &framed).await;
        assert_eq!(*got.lock(), Some(7));
    }
}
