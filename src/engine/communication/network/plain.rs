//! Unencrypted TCP transport: one outbound connection per peer,
//! reconnected with backoff, plus an accept loop that reads frames off
//! whatever connects in and demultiplexes them by topic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::async_runtime;
use crate::engine::communication::channel::{self, ChannelTx};
use crate::engine::communication::message;
use crate::engine::communication::network::{self, reconnect_backoff, BoxFuture, Network, NetworkConfig, RawReceiver};
use crate::engine::communication::socket::{self, FramedReader};
use crate::engine::communication::{NodeId, Peer, SENDER_ID_TOPIC};
use crate::engine::error::*;

/// Bound of the per-peer outbound frame queue. Once full, `send_raw`
/// backpressures the caller rather than growing memory without limit.
const OUTBOUND_QUEUE_BOUND: usize = 1024;

struct State {
    self_id: NodeId,
    listen_addr: SocketAddr,
    peer_addrs: Mutex<HashMap<NodeId, Peer>>,
    outbound: Mutex<HashMap<NodeId, ChannelTx<Vec<u8>>>>,
    receivers: Mutex<HashMap<String, RawReceiver>>,
    stopped: AtomicBool,
}

/// A `Network` backed by plain TCP: no authentication, no
/// confidentiality. Suitable for trusted networks or development.
pub struct PlainNetwork {
    inner: Arc<State>,
}

impl Clone for PlainNetwork {
    fn clone(&self) -> Self {
        PlainNetwork { inner: self.inner.clone() }
    }
}

impl PlainNetwork {
    /// Binds the local listener, spawns the accept loop, and begins
    /// connecting outward to every other member of `config.membership`.
    pub async fn new(config: NetworkConfig) -> Result<Self> {
        let membership = config.membership;
        let self_id = membership.self_id().clone();
        let listen_addr = membership
            .peer(&self_id)
            .ok_or_else(|| Error::simple(ErrorKind::Communication))?
            .addr;

        let state = Arc::new(State {
            self_id: self_id.clone(),
            listen_addr,
            peer_addrs: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            receivers: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        });

        let listener = socket::bind(listen_addr).await.wrapped(ErrorKind::Communication)?;
        spawn_accept_loop(state.clone(), listener);

        let net = PlainNetwork { inner: state };
        for id in membership.other_ids() {
            let peer = membership.peer(id).expect("member listed in other_ids").clone();
            net.register_node(id.clone(), peer).await;
        }
        Ok(net)
    }
}

fn spawn_accept_loop(state: Arc<State>, listener: socket::Listener) {
    async_runtime::spawn(async move {
        loop {
            if state.stopped.load(Ordering::SeqCst) {
                return;
            }
            match listener.accept().await {
                Ok((sock, addr)) => {
                    let state = state.clone();
                    async_runtime::spawn(async move {
                        read_loop(state, sock, addr).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    });
}

async fn read_loop(state: Arc<State>, sock: socket::Socket, addr: SocketAddr) {
    let mut reader = FramedReader::new(sock);

    let sender_id = match reader.read_frame().await {
        Ok(Some(bytes)) => match message::decode_topic_body::<NodeId>(&bytes) {
            Ok((topic, id)) if topic == SENDER_ID_TOPIC => id,
            _ => {
                tracing::debug!(%addr, "inbound connection skipped its senderId announcement");
                return;
            }
        },
        _ => return,
    };
    tracing::debug!(peer = %sender_id, %addr, "inbound connection identified");

    loop {
        match reader.read_frame().await {
            Ok(Some(bytes)) => network::dispatch_frame(&state.receivers, &sender_id, &bytes).await,
            Ok(None) => {
                tracing::debug!(peer = %sender_id, "inbound connection closed");
                return;
            }
            Err(e) => {
                tracing::warn!(peer = %sender_id, error = %e, "inbound read failed");
                return;
            }
        }
    }
}

fn spawn_outbound(state: Arc<State>, id: NodeId) {
    async_runtime::spawn(async move {
        let mut attempt = 0u32;
        loop {
            if state.stopped.load(Ordering::SeqCst) {
                return;
            }
            let Some(peer) = state.peer_addrs.lock().get(&id).cloned() else { return };

            match socket::connect(peer.addr).await {
                Ok(mut sock) => {
                    let announce = match message::encode_topic_body(&(
                        SENDER_ID_TOPIC.to_owned(),
                        state.self_id.clone(),
                    )) {
                        Ok(bytes) => bytes,
                        Err(_) => return,
                    };
                    if socket::write_frame(&mut sock, &announce).await.is_err() {
                        // fall through to backoff below
                    } else {
                        attempt = 0;
                        let (tx, mut rx) = channel::new_channel::<Vec<u8>>(OUTBOUND_QUEUE_BOUND);
                        state.outbound.lock().insert(id.clone(), tx);
                        while let Some(bytes) = rx.recv().await {
                            if socket::write_frame(&mut sock, &bytes).await.is_err() {
                                tracing::warn!(peer = %id, "send failed, reconnecting");
                                break;
                            }
                        }
                        state.outbound.lock().remove(&id);
                        if state.stopped.load(Ordering::SeqCst) {
                            return;
                        }
                        continue;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %id, error = %e, "connect failed");
                }
            }

            let delay = reconnect_backoff(attempt);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
    });
}

impl Network for PlainNetwork {
    fn self_id(&self) -> &NodeId {
        &self.inner.self_id
    }

    fn register_node(&self, id: NodeId, peer: Peer) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if id == self.inner.self_id {
                return;
            }
            self.inner.peer_addrs.lock().insert(id.clone(), peer);
            self.inner.outbound.lock().remove(&id);
            spawn_outbound(self.inner.clone(), id);
        })
    }

    fn register_raw_receiver(&self, topic: &str, receiver: RawReceiver) {
        self.inner.receivers.lock().insert(topic.to_owned(), receiver);
    }

    fn send_raw(&self, target: NodeId, topic: String, value: Vec<u8>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if target == self.inner.self_id {
                let receiver = self.inner.receivers.lock().get(&topic).cloned();
                if let Some(receiver) = receiver {
                    receiver(self.inner.self_id.clone(), value).await;
                }
                return;
            }

            let bytes = match network::wrap_frame(&topic, &value) {
                Ok(bytes) => bytes,
                Err(_) => return,
            };
            let tx = self.inner.outbound.lock().get(&target).cloned();
            if let Some(tx) = tx {
                let _ = tx.send(bytes).await;
            }
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inner.stopped.store(true, Ordering::SeqCst);
            self.inner.outbound.lock().clear();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::communication::network::NetworkExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn membership_of(self_id: &str, ports: &[(&str, u16)]) -> crate::engine::communication::Membership {
        let mut peers = HashMap::new();
        for (id, port) in ports {
            peers.insert(
                NodeId::from(*id),
                Peer::new(format!("127.0.0.1:{}", port).parse().unwrap()),
            );
        }
        crate::engine::communication::Membership::new(NodeId::from(self_id), peers)
    }

    // Runs on the engine's own runtime rather than `#[tokio::test]`'s
    // private one: `spawn_accept_loop`/`spawn_outbound` schedule work
    // via `async_runtime::spawn`, which always targets the globally
    // installed runtime, so the listeners and sockets they create must
    // live on that same runtime too.
    #[test]
    fn two_nodes_exchange_a_message() {
        crate::init_test_tracing();
        async_runtime::init(2).unwrap();
        async_runtime::block_on(async {
            let m_a = membership_of("a", &[("a", 42001), ("b", 42002)]);
            let m_b = membership_of("b", &[("a", 42001), ("b", 42002)]);

            let net_a = PlainNetwork::new(NetworkConfig { membership: m_a }).await.unwrap();
            let net_b = PlainNetwork::new(NetworkConfig { membership: m_b }).await.unwrap();

            let received = Arc::new(AtomicUsize::new(0));
            let received2 = received.clone();
            net_b.register_receiver::<String, _>("greetings", move |_from, _msg| {
                let received2 = received2.clone();
                Box::pin(async move {
                    received2.fetch_add(1, Ordering::SeqCst);
                })
            });

            // give the reconnect loop time to establish the outbound link
            tokio::time::sleep(Duration::from_millis(300)).await;

            net_a
                .send_message(NodeId::from("b"), "greetings".to_owned(), "hi".to_owned())
                .await
                .unwrap();

            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(received.load(Ordering::SeqCst), 1);

            net_a.stop().await;
            net_b.stop().await;
        });
    }
}
