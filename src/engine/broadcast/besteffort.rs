//! Best-effort broadcast: every member sends directly to every other
//! member, with no acknowledgement and no agreement property beyond
//! whatever the underlying transport already gives a live connection.
//! A Byzantine or crashed sender can make correct nodes see different
//! subsets of messages, or none at all.

use std::sync::Arc;

use crate::engine::broadcast::{DeliverFn, Dispatcher};
use crate::engine::communication::message::Payload;
use crate::engine::communication::network::{Network, NetworkExt};
use crate::engine::communication::Membership;
use crate::engine::error::Result;

const TOPIC_MESSAGE: &str = "MESSAGE";

pub struct BestEffortBroadcast<N: Network> {
    network: Arc<N>,
    membership: Membership,
}

impl<N: Network> BestEffortBroadcast<N> {
    /// Registers a receiver for the `MESSAGE` topic on `network` that
    /// fans delivered messages out through `dispatcher`.
    pub fn new<P: Payload>(
        network: Arc<N>,
        membership: Membership,
        dispatcher: Arc<Dispatcher<P>>,
    ) -> Self {
        network.register_receiver::<P, _>(TOPIC_MESSAGE, move |from, payload| {
            let dispatcher = dispatcher.clone();
            Box::pin(async move {
                dispatcher.deliver(from, payload).await;
            })
        });
        BestEffortBroadcast { network, membership }
    }

    /// Sends `payload` to every member, including self, on the
    /// `MESSAGE` topic. Failures to reach any one member are not
    /// reported; this is best effort by design.
    pub async fn broadcast<P: Payload>(&self, payload: P) -> Result<()> {
        for id in self.membership.all_ids() {
            self.network
                .send_message(id.clone(), TOPIC_MESSAGE.to_owned(), payload.clone())
                .await?;
        }
        Ok(())
    }
}

/// Convenience alias for registering a receiver directly, for callers
/// that want to add listeners after construction without going through
/// a shared `Dispatcher`.
pub fn add_receiver<P: Payload>(dispatcher: &Dispatcher<P>, receiver: DeliverFn<P>) {
    dispatcher.add_receiver(receiver);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::async_runtime;
    use crate::engine::communication::network::{NetworkConfig, PlainNetwork};
    use crate::engine::communication::{NodeId, Peer};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn membership_of(self_id: &str, ports: &[(&str, u16)]) -> Membership {
        let mut peers = HashMap::new();
        for (id, port) in ports {
            peers.insert(
                NodeId::from(*id),
                Peer::new(format!("127.0.0.1:{}", port).parse().unwrap()),
            );
        }
        Membership::new(NodeId::from(self_id), peers)
    }

    #[test]
    fn every_member_including_self_receives_the_broadcast() {
        async_runtime::init(2).unwrap();
        async_runtime::block_on(async {
            let m_a = membership_of("a", &[("a", 45001), ("b", 45002)]);
            let m_b = membership_of("b", &[("a", 45001), ("b", 45002)]);

            let net_a = Arc::new(PlainNetwork::new(NetworkConfig { membership: m_a.clone() }).await.unwrap());
            let net_b = Arc::new(PlainNetwork::new(NetworkConfig { membership: m_b.clone() }).await.unwrap());

            let count_a = Arc::new(AtomicUsize::new(0));
            let count_b = Arc::new(AtomicUsize::new(0));

            let dispatcher_a: Arc<Dispatcher<String>> = Arc::new(Dispatcher::new());
            let count_a2 = count_a.clone();
            dispatcher_a.add_receiver(Arc::new(move |_from, _payload| {
                let count_a2 = count_a2.clone();
                Box::pin(async move {
                    count_a2.fetch_add(1, Ordering::SeqCst);
                })
            }));

            let dispatcher_b: Arc<Dispatcher<String>> = Arc::new(Dispatcher::new());
            let count_b2 = count_b.clone();
            dispatcher_b.add_receiver(Arc::new(move |_from, _payload| {
                let count_b2 = count_b2.clone();
                Box::pin(async move {
                    count_b2.fetch_add(1, Ordering::SeqCst);
                })
            }));

            let beb_a = BestEffortBroadcast::new(net_a.clone(), m_a, dispatcher_a);
            let _beb_b = BestEffortBroadcast::new(net_b.clone(), m_b, dispatcher_b);

            tokio::time::sleep(Duration::from_millis(300)).await;
            beb_a.broadcast("hello".to_owned()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;

            assert_eq!(count_a.load(Ordering::SeqCst), 1);
            assert_eq!(count_b.load(Ordering::SeqCst), 1);

            net_a.stop().await;
            net_b.stop().await;
        });
    }
}
