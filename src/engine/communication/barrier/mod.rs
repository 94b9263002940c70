//! Bootstrap readiness barrier: blocks a node until every other member
//! of its `Membership` has exchanged a setup message with it over the
//! reserved setup topic.
//!
//! This runs before any application-level receiver is safe to rely on:
//! broadcast and routing both assume every member's transport
//! connections are already up.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::engine::communication::message::Payload;
use crate::engine::communication::network::{Network, NetworkExt};
use crate::engine::communication::{Membership, NodeId, NETWORK_MESSAGE_DISTRIBUTOR_SETUP_TOPIC};
use crate::engine::error::Result;

/// How often the barrier re-sends its greeting to peers it hasn't
/// heard back from yet, to cover the case where the first send raced
/// ahead of the peer's own listener coming up.
const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Blocks until every member of `membership` other than self has been
/// heard from on the reserved setup topic. Also sends `greeting` to
/// every other member at start, and again on `RETRY_INTERVAL` as a
/// fallback in case a send races ahead of the peer's own listener
/// coming up. On every receive from a peer not yet marked seen, the
/// peer is marked seen and a reply carrying `greeting` is sent back to
/// it immediately on the same topic — so a pair converges on its own
/// first contact rather than waiting for the next retry tick.
///
/// A single-member `membership` (no peers) returns immediately.
pub async fn await_ready<N: Network + Clone + 'static, P: Payload>(
    network: &N,
    membership: &Membership,
    greeting: P,
) -> Result<()> {
    let others: Vec<NodeId> = membership.other_ids().cloned().collect();
    if others.is_empty() {
        return Ok(());
    }

    let heard = Arc::new(Mutex::new(HashSet::new()));
    let notify = Arc::new(Notify::new());
    let expected = others.len();

    {
        let heard = heard.clone();
        let notify = notify.clone();
        let reply_network = network.clone();
        let reply_greeting = greeting.clone();
        network.register_receiver::<P, _>(NETWORK_MESSAGE_DISTRIBUTOR_SETUP_TOPIC, move |from, _greeting| {
            let heard = heard.clone();
            let notify = notify.clone();
            let reply_network = reply_network.clone();
            let reply_greeting = reply_greeting.clone();
            Box::pin(async move {
                let (was_missing, heard_count) = {
                    let mut set = heard.lock();
                    let was_missing = set.insert(from.clone());
                    (was_missing, set.len())
                };
                if was_missing {
                    let _ = reply_network
                        .send_message(from, NETWORK_MESSAGE_DISTRIBUTOR_SETUP_TOPIC.to_owned(), reply_greeting)
                        .await;
                }
                if heard_count >= expected {
                    notify.notify_waiters();
                }
            })
        });
    }

    loop {
        for id in &others {
            let _ = network
                .send_message(
                    id.clone(),
                    NETWORK_MESSAGE_DISTRIBUTOR_SETUP_TOPIC.to_owned(),
                    greeting.clone(),
                )
                .await;
        }

        if heard.lock().len() >= expected {
            return Ok(());
        }

        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(RETRY_INTERVAL) => {}
        }

        if heard.lock().len() >= expected {
            return Ok(());
        }
    }
}
