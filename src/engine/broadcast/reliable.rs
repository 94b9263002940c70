//! Byzantine-fault-tolerant reliable broadcast: Bracha's three-phase
//! protocol (initial → echo → ready), with per-fingerprint state
//! tracking, quorum thresholds derived from membership size, and
//! content-hash based message deduplication.
//!
//! Guarantees, for `n` members and `f = (n - 1) / 3` tolerated
//! Byzantine members:
//!
//! - **Validity**: if a correct sender broadcasts `m`, every correct
//!   member eventually delivers `m`.
//! - **No duplication**: every correct member delivers at most once
//!   per fingerprint.
//! - **Integrity**: if a correct member delivers `m` attributed to a
//!   correct sender `s`, then `s` broadcast `m`.
//! - **Consistency**: no two correct members deliver different
//!   payloads for the same fingerprint.

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::engine::broadcast::Dispatcher;
use crate::engine::collections::{self, HashMap, HashSet};
use crate::engine::communication::message::{AnnotatedMessage, MessageFingerprint, MessageWithId, Payload};
use crate::engine::communication::network::{Network, NetworkExt};
use crate::engine::communication::{Membership, NodeId};
use crate::engine::error::Result;

const TOPIC_INITIAL: &str = "initial";
const TOPIC_ECHO: &str = "echo";
const TOPIC_READY: &str = "ready";

/// Per-fingerprint protocol state. `echo_senders` is released once
/// `ready_sent` flips (the quorum argument only consults ready counts
/// after that point); `ready_senders` is released once `accepted`
/// flips (exactly one delivery has occurred for this fingerprint).
struct MessageState<P> {
    message: AnnotatedMessage<P>,
    echo_sent: bool,
    ready_sent: bool,
    accepted: bool,
    echo_senders: Option<HashSet<NodeId>>,
    ready_senders: Option<HashSet<NodeId>>,
}

impl<P: Clone> MessageState<P> {
    fn new(message: AnnotatedMessage<P>) -> Self {
        MessageState {
            message,
            echo_sent: false,
            ready_sent: false,
            accepted: false,
            echo_senders: Some(collections::hash_set()),
            ready_senders: Some(collections::hash_set()),
        }
    }
}

/// Quorum thresholds derived from membership size.
#[derive(Copy, Clone)]
struct Quorum {
    n: usize,
    f: usize,
}

impl Quorum {
    fn from_membership(membership: &Membership) -> Self {
        let n = membership.len();
        let f = n.saturating_sub(1) / 3;
        Quorum { n, f }
    }

    /// Fires once `|readySenders| >= f + 1` or `|echoSenders| > (n + f) / 2`.
    fn readiness(&self, echo_count: usize, ready_count: usize) -> bool {
        ready_count >= self.f + 1 || echo_count > (self.n + self.f) / 2
    }

    /// Fires once `|readySenders| >= 2f + 1`.
    fn acceptance(&self, ready_count: usize) -> bool {
        ready_count >= 2 * self.f + 1
    }
}

struct State<N, P: Payload> {
    network: Arc<N>,
    membership: Membership,
    dispatcher: Arc<Dispatcher<P>>,
    quorum: Quorum,
    messages: Mutex<HashMap<MessageFingerprint, MessageState<P>>>,
}

/// A reliable broadcast instance bound to one payload type `P` and one
/// `Network`. Registers its `initial`/`echo`/`ready` receivers at
/// construction time.
pub struct ReliableBroadcast<N, P: Payload> {
    state: Arc<State<N, P>>,
}

impl<N: Network + 'static, P: Payload> ReliableBroadcast<N, P> {
    pub fn new(network: Arc<N>, membership: Membership, dispatcher: Arc<Dispatcher<P>>) -> Self {
        let quorum = Quorum::from_membership(&membership);
        let state = Arc::new(State {
            network: network.clone(),
            membership,
            dispatcher,
            quorum,
            messages: Mutex::new(collections::hash_map()),
        });

        {
            let state = state.clone();
            network.register_receiver::<MessageWithId<P>, _>(TOPIC_INITIAL, move |from, msg| {
                let state = state.clone();
                Box::pin(async move {
                    on_initial(state, from, msg).await;
                })
            });
        }
        {
            let state = state.clone();
            network.register_receiver::<AnnotatedMessage<P>, _>(TOPIC_ECHO, move |from, msg| {
                let state = state.clone();
                Box::pin(async move {
                    on_echo(state, from, msg).await;
                })
            });
        }
        {
            let state = state.clone();
            network.register_receiver::<AnnotatedMessage<P>, _>(TOPIC_READY, move |from, msg| {
                let state = state.clone();
                Box::pin(async move {
                    on_ready(state, from, msg).await;
                })
            });
        }

        ReliableBroadcast { state }
    }

    /// Assigns a fresh UUID and sends `["initial", [uuid, m]]` to
    /// every member, including self — the sender goes through the
    /// same echo/ready/accept path as everyone else, so it also
    /// delivers to itself exactly once.
    pub async fn broadcast(&self, payload: P) -> Result<()> {
        let uuid = Uuid::new_v4().to_string();
        let msg: MessageWithId<P> = (uuid, payload);
        for id in self.state.membership.all_ids() {
            self.state
                .network
                .send_message(id.clone(), TOPIC_INITIAL.to_owned(), msg.clone())
                .await?;
        }
        Ok(())
    }
}

async fn on_initial<N: Network, P: Payload>(state: Arc<State<N, P>>, from: NodeId, msg: MessageWithId<P>) {
    let (uuid, payload) = msg;
    let annotated: AnnotatedMessage<P> = (uuid, payload, from);
    let fingerprint = match MessageFingerprint::of(&annotated) {
        Ok(fp) => fp,
        Err(_) => {
            tracing::debug!("dropping initial message: fingerprint computation failed");
            return;
        }
    };
    send_own_echo_if_needed(&state, &fingerprint, &annotated).await;
}

async fn on_echo<N: Network, P: Payload>(state: Arc<State<N, P>>, from: NodeId, msg: AnnotatedMessage<P>) {
    let fingerprint = match MessageFingerprint::of(&msg) {
        Ok(fp) => fp,
        Err(_) => return,
    };

    let (echo_count, ready_count) = {
        let mut messages = state.messages.lock();
        let entry = messages
            .entry(fingerprint.clone())
            .or_insert_with(|| MessageState::new(msg.clone()));
        if let Some(senders) = entry.echo_senders.as_mut() {
            senders.insert(from);
        }
        (
            entry.echo_senders.as_ref().map_or(0, |s| s.len()),
            entry.ready_senders.as_ref().map_or(0, |s| s.len()),
        )
    };

    if state.quorum.readiness(echo_count, ready_count) {
        send_own_echo_if_needed(&state, &fingerprint, &msg).await;
        send_own_ready_if_needed(&state, &fingerprint, &msg).await;
    }
}

async fn on_ready<N: Network, P: Payload>(state: Arc<State<N, P>>, from: NodeId, msg: AnnotatedMessage<P>) {
    let fingerprint = match MessageFingerprint::of(&msg) {
        Ok(fp) => fp,
        Err(_) => return,
    };

    let (echo_count, ready_count) = {
        let mut messages = state.messages.lock();
        let entry = messages
            .entry(fingerprint.clone())
            .or_insert_with(|| MessageState::new(msg.clone()));
        if let Some(senders) = entry.ready_senders.as_mut() {
            senders.insert(from);
        }
        (
            entry.echo_senders.as_ref().map_or(0, |s| s.len()),
            entry.ready_senders.as_ref().map_or(0, |s| s.len()),
        )
    };

    if state.quorum.readiness(echo_count, ready_count) {
        send_own_echo_if_needed(&state, &fingerprint, &msg).await;
        send_own_ready_if_needed(&state, &fingerprint, &msg).await;
    }

    maybe_accept(&state, &fingerprint, &msg).await;
}

/// Sends this node's own echo for `fingerprint`, exactly once, the
/// first time this function observes `echo_sent == false` for it —
/// whether that's because a valid `initial` just arrived, or because
/// an echo/ready quorum was just reached for a fingerprint this node
/// never saw the `initial` for.
async fn send_own_echo_if_needed<N: Network, P: Payload>(
    state: &Arc<State<N, P>>,
    fingerprint: &MessageFingerprint,
    msg: &AnnotatedMessage<P>,
) {
    let should_send = {
        let mut messages = state.messages.lock();
        let entry = messages
            .entry(fingerprint.clone())
            .or_insert_with(|| MessageState::new(msg.clone()));
        if entry.echo_sent {
            false
        } else {
            entry.echo_sent = true;
            true
        }
    };
    if !should_send {
        return;
    }
    for id in state.membership.all_ids() {
        let _ = state
            .network
            .send_message(id.clone(), TOPIC_ECHO.to_owned(), msg.clone())
            .await;
    }
}

async fn send_own_ready_if_needed<N: Network, P: Payload>(
    state: &Arc<State<N, P>>,
    fingerprint: &MessageFingerprint,
    msg: &AnnotatedMessage<P>,
) {
    let should_send = {
        let mut messages = state.messages.lock();
        let entry = messages
            .entry(fingerprint.clone())
            .or_insert_with(|| MessageState::new(msg.clone()));
        if entry.ready_sent {
            false
        } else {
            entry.ready_sent = true;
            entry.echo_senders = None;
            true
        }
    };
    if !should_send {
        return;
    }
    for id in state.membership.all_ids() {
        let _ = state
            .network
            .send_message(id.clone(), TOPIC_READY.to_owned(), msg.clone())
            .await;
    }
}

/// Delivers `msg` locally, exactly once, the first time the
/// acceptance condition (`|readySenders| >= 2f + 1`) fires for its
/// fingerprint. Releases `readySenders` on the same transition.
async fn maybe_accept<N: Network, P: Payload>(
    state: &Arc<State<N, P>>,
    fingerprint: &MessageFingerprint,
    msg: &AnnotatedMessage<P>,
) {
    let should_deliver = {
        let mut messages = state.messages.lock();
        let entry = match messages.get_mut(fingerprint) {
            Some(entry) => entry,
            None => return,
        };
        if entry.accepted {
            false
        } else {
            let ready_count = entry.ready_senders.as_ref().map_or(0, |s| s.len());
            if state.quorum.acceptance(ready_count) {
                entry.accepted = true;
                entry.ready_senders = None;
                true
            } else {
                false
            }
        }
    };
    if should_deliver {
        let (_, payload, originator) = msg.clone();
        state.dispatcher.deliver(originator, payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::async_runtime;
    use crate::engine::communication::network::{NetworkConfig, PlainNetwork};
    use crate::engine::communication::Peer;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn membership_of(self_id: &str, ports: &[(&str, u16)]) -> Membership {
        let mut peers = StdHashMap::new();
        for (id, port) in ports {
            peers.insert(
                NodeId::from(*id),
                Peer::new(format!("127.0.0.1:{}", port).parse().unwrap()),
            );
        }
        Membership::new(NodeId::from(self_id), peers)
    }

    fn counting_dispatcher() -> (Arc<Dispatcher<String>>, Arc<AtomicUsize>) {
        let dispatcher: Arc<Dispatcher<String>> = Arc::new(Dispatcher::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        dispatcher.add_receiver(Arc::new(move |_from, _payload| {
            let count2 = count2.clone();
            Box::pin(async move {
                count2.fetch_add(1, Ordering::SeqCst);
            })
        }));
        (dispatcher, count)
    }

    #[test]
    fn single_node_delivers_to_self() {
        crate::init_test_tracing();
        async_runtime::init(1).unwrap();
        async_runtime::block_on(async {
            let membership = membership_of("solo", &[("solo", 46001)]);
            let net = Arc::new(
                PlainNetwork::new(NetworkConfig { membership: membership.clone() })
                    .await
                    .unwrap(),
            );
            let (dispatcher, count) = counting_dispatcher();
            let rb = ReliableBroadcast::new(net.clone(), membership, dispatcher);

            rb.broadcast("hello".to_owned()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;

            assert_eq!(count.load(Ordering::SeqCst), 1);
            net.stop().await;
        });
    }

    #[test]
    fn four_correct_nodes_all_deliver_exactly_once() {
        crate::init_test_tracing();
        async_runtime::init(4).unwrap();
        async_runtime::block_on(async {
            let ports = [("a", 46101), ("b", 46102), ("c", 46103), ("d", 46104)];
            let ids = ["a", "b", "c", "d"];

            let mut nets = Vec::new();
            let mut counts = Vec::new();
            let mut rbs = Vec::new();

            for id in ids {
                let membership = membership_of(id, &ports);
                let net = Arc::new(
                    PlainNetwork::new(NetworkConfig { membership: membership.clone() })
                        .await
                        .unwrap(),
                );
                let (dispatcher, count) = counting_dispatcher();
                let rb = ReliableBroadcast::new(net.clone(), membership, dispatcher);
                nets.push(net);
                counts.push(count);
                rbs.push(rb);
            }

            tokio::time::sleep(Duration::from_millis(400)).await;
            rbs[0].broadcast("hello".to_owned()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(600)).await;

            for count in &counts {
                assert_eq!(count.load(Ordering::SeqCst), 1);
            }

            for net in &nets {
                net.stop().await;
            }
        });
    }

    #[test]
    fn three_correct_nodes_deliver_despite_one_silent_faulty_node() {
        crate::init_test_tracing();
        async_runtime::init(4).unwrap();
        async_runtime::block_on(async {
            let ports = [("a", 46201), ("b", 46202), ("c", 46203), ("d", 46204)];

            let mut nets = Vec::new();
            let mut counts = Vec::new();
            let mut rbs = Vec::new();

            // only a, b, c actually start; d never participates, which
            // is enough to model a silent-faulty member since n=4,
            // f=1, and 2f+1 = 3 readies are reachable from a, b, c alone.
            for id in ["a", "b", "c"] {
                let membership = membership_of(id, &ports);
                let net = Arc::new(
                    PlainNetwork::new(NetworkConfig { membership: membership.clone() })
                        .await
                        .unwrap(),
                );
                let (dispatcher, count) = counting_dispatcher();
                let rb = ReliableBroadcast::new(net.clone(), membership, dispatcher);
                nets.push(net);
                counts.push(count);
                rbs.push(rb);
            }

            tokio::time::sleep(Duration::from_millis(400)).await;
            rbs[0].broadcast("hello".to_owned()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(600)).await;

            for count in &counts {
                assert_eq!(count.load(Ordering::SeqCst), 1);
            }

            for net in &nets {
                net.stop().await;
            }
        });
    }

    #[test]
    fn quorum_thresholds_for_four_members() {
        let membership = membership_of(
            "a",
            &[("a", 1), ("b", 2), ("c", 3), ("d", 4)],
        );
        let quorum = Quorum::from_membership(&membership);
        assert_eq!(quorum.n, 4);
        assert_eq!(quorum.f, 1);
        assert!(!quorum.readiness(0, 0));
        assert!(quorum.readiness(0, 2)); // f + 1 readies
        assert!(quorum.readiness(3, 0)); // > (n + f) / 2 == 2
        assert!(!quorum.acceptance(2));
        assert!(quorum.acceptance(3)); // 2f + 1
    }

    #[test]
    fn equivocating_sender_is_never_accepted_by_any_correct_node() {
        crate::init_test_tracing();
        async_runtime::init(4).unwrap();
        async_runtime::block_on(async {
            let ports = [("a", 46301), ("b", 46302), ("c", 46303), ("d", 46304)];

            let mut nets = Vec::new();
            let mut counts = Vec::new();
            let mut rbs = Vec::new();

            for id in ["a", "b", "c", "d"] {
                let membership = membership_of(id, &ports);
                let net = Arc::new(
                    PlainNetwork::new(NetworkConfig { membership: membership.clone() })
                        .await
                        .unwrap(),
                );
                let (dispatcher, count) = counting_dispatcher();
                let rb = ReliableBroadcast::new(net.clone(), membership, dispatcher);
                nets.push(net);
                counts.push(count);
                rbs.push(rb);
            }

            tokio::time::sleep(Duration::from_millis(400)).await;

            // `d` is Byzantine: instead of calling `broadcast`, it sends
            // two different payloads under the same uuid directly to
            // `a` and `b`. The two resulting fingerprints differ (the
            // payload is part of the hashed content), so neither can
            // reach a 2f+1 ready quorum from three correct nodes.
            let uuid = Uuid::new_v4().to_string();
            let d_net = &nets[3];
            d_net
                .send_message(
                    NodeId::from("a"),
                    TOPIC_INITIAL.to_owned(),
                    (uuid.clone(), "hello".to_owned()),
                )
                .await
                .unwrap();
            d_net
                .send_message(
                    NodeId::from("b"),
                    TOPIC_INITIAL.to_owned(),
                    (uuid.clone(), "bye".to_owned()),
                )
                .await
                .unwrap();

            tokio::time::sleep(Duration::from_millis(600)).await;

            for count in &counts {
                assert_eq!(count.load(Ordering::SeqCst), 0);
            }

            for net in &nets {
                net.stop().await;
            }
        });
    }
}
