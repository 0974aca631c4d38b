//! Broadcast engine: a pool of workers draining the hub's inbound message queue.
//!
//! Every message is first fanned out to the local connections (except its origin) and
//! then, unless it came off the relay bus, published to the bus. Checking the sender
//! against the bus topic is the only thing that keeps hubs from bouncing each other's
//! messages forever.
//!
//! The queue is split into one bounded shard per worker and a message is routed by its
//! origin id, so messages from a single origin keep their order end to end while the
//! workers stay independent of each other.

use crate::connection::Delivery;
use crate::error::{Error, HubErrorKind, Result};
use crate::message::Message;
use crate::registry::ConnectionRegistry;
use crate::relay::RelayBus;
use log::*;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BROADCAST_WORKERS: usize = 2;
/// Total capacity of the inbound queue across all shards; sized for bursts.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Producer handle for the engine's inbound queue. Cheap to clone.
#[derive(Clone)]
pub struct EngineSender {
    hub_id: Arc<str>,
    shards: Arc<[mpsc::Sender<Message>]>,
}

impl EngineSender {
    /// Creates the sharded queue: `workers` shards sharing `capacity` slots.
    pub fn channel(
        hub_id: &str,
        workers: usize,
        capacity: usize,
    ) -> (EngineSender, Vec<mpsc::Receiver<Message>>) {
        let workers = workers.max(1);
        let per_shard = (capacity / workers).max(1);

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..workers).map(|_| mpsc::channel(per_shard)).unzip();

        let sender = EngineSender {
            hub_id: Arc::from(hub_id),
            shards: senders.into(),
        };
        (sender, receivers)
    }

    /// Identity of the hub this queue belongs to.
    pub fn hub_id(&self) -> &str {
        &self.hub_id
    }

    /// Waits for room in the origin's shard.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.shard_for(message.origin_id())
            .send(message)
            .await
            .map_err(|_| Error::hub(HubErrorKind::NotRunning))
    }

    fn shard_for(&self, origin_id: &str) -> &mpsc::Sender<Message> {
        let mut hasher = DefaultHasher::new();
        origin_id.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }
}

/// Result of one local fan-out pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub queued: usize,
    pub dropped: usize,
}

pub struct BroadcastEngine {
    registry: Arc<ConnectionRegistry>,
    relay: Arc<dyn RelayBus>,
    sender: EngineSender,
    receivers: Mutex<Vec<mpsc::Receiver<Message>>>,
}

impl BroadcastEngine {
    pub fn new(
        hub_id: &str,
        workers: usize,
        capacity: usize,
        registry: Arc<ConnectionRegistry>,
        relay: Arc<dyn RelayBus>,
    ) -> Self {
        let (sender, receivers) = EngineSender::channel(hub_id, workers, capacity);
        Self {
            registry,
            relay,
            sender,
            receivers: Mutex::new(receivers),
        }
    }

    pub fn sender(&self) -> EngineSender {
        self.sender.clone()
    }

    /// Spawns one worker per queue shard. Calling it again spawns nothing.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let receivers = std::mem::take(
            &mut *self
                .receivers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        info!("Starting {} broadcast worker(s)", receivers.len());
        receivers
            .into_iter()
            .enumerate()
            .map(|(index, rx)| tokio::spawn(Arc::clone(self).run_worker(index, rx, cancel.clone())))
            .collect()
    }

    async fn run_worker(
        self: Arc<Self>,
        index: usize,
        mut rx: mpsc::Receiver<Message>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(message) => self.process(message).await,
                    None => {
                        debug!("Broadcast worker {index} queue closed");
                        return;
                    }
                },
            }
        }

        // Best effort: handle what is already queued, accept nothing new.
        rx.close();
        let mut drained = 0;
        while let Ok(message) = rx.try_recv() {
            self.process(message).await;
            drained += 1;
        }
        debug!("Broadcast worker {index} stopped after draining {drained} message(s)");
    }

    /// Fans `message` out locally, then forwards it to the relay bus unless it came from there.
    pub async fn process(&self, message: Message) {
        let message = Arc::new(message);
        let fan_out = self.fan_out(&message);
        trace!(
            "Message from {} fanned out: {} queued, {} dropped",
            message.sender_id(),
            fan_out.queued,
            fan_out.dropped
        );

        if message.is_from_relay(self.relay.topic()) {
            return;
        }

        if let Err(e) = self.relay.publish(&message).await {
            error!(
                "Failed to publish message from {} to relay topic {}: {e}",
                message.origin_id(),
                self.relay.topic()
            );
        }
    }

    /// Queues `message` on every registered connection except its origin.
    pub fn fan_out(&self, message: &Arc<Message>) -> FanOut {
        let mut fan_out = FanOut::default();
        self.registry
            .for_each_except(message.origin_id(), |connection| {
                match connection.deliver(Arc::clone(message)) {
                    Delivery::Queued => fan_out.queued += 1,
                    Delivery::Dropped => fan_out.dropped += 1,
                    Delivery::Closed => {}
                }
            });
        fan_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionConfig, OutboundReceiver};
    use crate::relay::memory::MemoryBus;
    use futures::StreamExt;
    use std::time::Duration;

    const TOPIC: &str = "hub-topic";

    fn attach(registry: &ConnectionRegistry, capacity: usize) -> (Arc<Connection>, OutboundReceiver) {
        let config = ConnectionConfig {
            outbound_capacity: capacity,
            ..ConnectionConfig::default()
        };
        let (connection, outbound) = Connection::new(config);
        registry.add(connection.clone()).unwrap();
        (connection, outbound)
    }

    fn engine(registry: Arc<ConnectionRegistry>, bus: &MemoryBus) -> Arc<BroadcastEngine> {
        Arc::new(BroadcastEngine::new("hub-1", 2, 16, registry, Arc::new(bus.relay())))
    }

    #[tokio::test]
    async fn messages_from_one_origin_share_a_shard() {
        let (sender, mut receivers) = EngineSender::channel("hub-1", 4, 64);
        for i in 0..8u8 {
            sender
                .send(Message::from_client("conn-a", "hub-1", vec![i]))
                .await
                .unwrap();
        }

        let non_empty: Vec<_> = receivers.iter_mut().filter(|rx| !rx.is_empty()).collect();
        assert_eq!(non_empty.len(), 1);
        let rx = non_empty.into_iter().next().unwrap();
        for i in 0..8u8 {
            assert_eq!(rx.try_recv().unwrap().payload(), &[i]);
        }
    }

    #[tokio::test]
    async fn fan_out_skips_origin_and_reaches_everyone_else_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, mut a_rx) = attach(&registry, 8);
        let (_b, mut b_rx) = attach(&registry, 8);
        let (_c, mut c_rx) = attach(&registry, 8);
        let bus = MemoryBus::new(TOPIC, 16);
        let engine = engine(registry, &bus);

        let message = Message::from_client(a.id().as_str(), "hub-1", b"hi".to_vec());
        engine.process(message).await;

        assert_eq!(b_rx.try_recv().unwrap().payload(), b"hi");
        assert_eq!(c_rx.try_recv().unwrap().payload(), b"hi");
        assert!(b_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn saturated_connection_does_not_affect_other_targets() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (slow, _slow_rx) = attach(&registry, 1);
        let (_fast, mut fast_rx) = attach(&registry, 8);
        let bus = MemoryBus::new(TOPIC, 16);
        let engine = engine(registry, &bus);

        let first = Arc::new(Message::from_client("remote", "hub-1", b"1".to_vec()));
        let second = Arc::new(Message::from_client("remote", "hub-1", b"2".to_vec()));

        assert_eq!(engine.fan_out(&first), FanOut { queued: 2, dropped: 0 });
        assert_eq!(engine.fan_out(&second), FanOut { queued: 1, dropped: 1 });
        assert_eq!(slow.dropped(), 1);
        assert_eq!(fast_rx.try_recv().unwrap().payload(), b"1");
        assert_eq!(fast_rx.try_recv().unwrap().payload(), b"2");
    }

    #[tokio::test]
    async fn local_messages_are_published_to_the_relay() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = MemoryBus::new(TOPIC, 16);
        let observer = bus.relay();
        let mut published = observer.subscribe().await.unwrap();
        let engine = engine(registry, &bus);

        engine
            .process(Message::from_client("conn-a", "hub-1", b"hi".to_vec()))
            .await;

        let payload = published.next().await.unwrap();
        let message = Message::from_bytes(&payload).unwrap();
        assert_eq!(message.origin_id(), "conn-a");
        assert_eq!(message.hub_id(), "hub-1");
        assert_eq!(message.sender_id(), "conn-a");
    }

    #[tokio::test]
    async fn relayed_messages_are_never_republished() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_local, mut local_rx) = attach(&registry, 8);
        let bus = MemoryBus::new(TOPIC, 16);
        let observer = bus.relay();
        let mut published = observer.subscribe().await.unwrap();
        let engine = engine(registry, &bus);

        let relayed = Message::from_client("remote-conn", "hub-2", b"hi".to_vec()).relayed_from(TOPIC);
        engine.process(relayed).await;

        assert_eq!(local_rx.try_recv().unwrap().payload(), b"hi");
        let republished = tokio::time::timeout(Duration::from_millis(50), published.next()).await;
        assert!(republished.is_err(), "relayed message was published again");
    }

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_b, mut b_rx) = attach(&registry, 8);
        let bus = MemoryBus::new(TOPIC, 16);
        let engine = engine(registry, &bus);
        let cancel = CancellationToken::new();
        let workers = engine.start(cancel.clone());
        assert_eq!(workers.len(), 2);
        assert!(engine.start(cancel.clone()).is_empty());

        let sender = engine.sender();
        sender
            .send(Message::from_client("conn-a", "hub-1", b"first".to_vec()))
            .await
            .unwrap();
        sender
            .send(Message::from_client("conn-a", "hub-1", b"second".to_vec()))
            .await
            .unwrap();

        assert_eq!(b_rx.recv().await.unwrap().payload(), b"first");
        assert_eq!(b_rx.recv().await.unwrap().payload(), b"second");

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }
}
