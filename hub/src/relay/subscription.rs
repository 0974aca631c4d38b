use super::{RelayBus, RelayStream};
use crate::engine::EngineSender;
use crate::message::Message;
use futures::StreamExt;
use log::*;
use std::sync::Arc;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

/// First delay before reopening a subscription the bus ended on its own.
const RESUBSCRIBE_BACKOFF_MIN: Duration = Duration::from_millis(500);
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// The hub's standing subscription to the relay topic.
///
/// Decodes each payload, discards what this hub published itself, stamps the topic as
/// sender and hands the message to the broadcast engine. If the bus drops the
/// subscription (a lost Redis connection, for instance) it is reopened with backoff for
/// as long as the hub runs.
pub struct RelaySubscription {
    bus: Arc<dyn RelayBus>,
    engine: EngineSender,
}

impl RelaySubscription {
    pub fn new(bus: Arc<dyn RelayBus>, engine: EngineSender) -> Self {
        Self { bus, engine }
    }

    /// Consumes `stream` until `cancel` fires, resubscribing whenever the bus ends it.
    pub async fn run(self, mut stream: RelayStream, cancel: CancellationToken) {
        let topic = self.bus.topic().to_string();
        info!("Relay subscription on {topic} running");
        let mut backoff = RESUBSCRIBE_BACKOFF_MIN;

        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(payload) => payload,
                    None => {
                        warn!("Relay subscription on {topic} ended, resubscribing");
                        match self.resubscribe(&cancel, &mut backoff).await {
                            Some(next) => {
                                stream = next;
                                continue;
                            }
                            None => break,
                        }
                    }
                },
            };
            backoff = RESUBSCRIBE_BACKOFF_MIN;

            let Some(message) = self.accept(&payload) else {
                continue;
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = self.engine.send(message) => if sent.is_err() {
                    warn!("Broadcast queue closed, stopping relay subscription on {topic}");
                    break;
                },
            }
        }

        info!("Relay subscription on {topic} stopped");
    }

    /// Reopens the subscription, doubling `backoff` after every attempt. `None` once cancelled.
    async fn resubscribe(
        &self,
        cancel: &CancellationToken,
        backoff: &mut Duration,
    ) -> Option<RelayStream> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = time::sleep(*backoff) => {}
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = self.bus.subscribe() => result,
            };
            *backoff = (*backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);

            match result {
                Ok(stream) => {
                    info!("Resubscribed to relay topic {}", self.bus.topic());
                    return Some(stream);
                }
                Err(e) => warn!("Failed to resubscribe to relay topic {}: {e}", self.bus.topic()),
            }
        }
    }

    /// Turns a raw bus payload into a message for local fan-out, or `None` if it must be skipped.
    pub fn accept(&self, payload: &[u8]) -> Option<Message> {
        let message = match Message::from_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to decode message from relay topic {}: {e}", self.bus.topic());
                return None;
            }
        };

        // Already fanned out locally before it was published.
        if message.hub_id() == self.engine.hub_id() {
            trace!("Skipping own publication from {}", message.origin_id());
            return None;
        }

        Some(message.relayed_from(self.bus.topic()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::relay::{MemoryBus, MemoryRelay};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out a stream that ends at once on the first subscribe, then behaves normally.
    struct DroppingRelay {
        inner: MemoryRelay,
        subscribes: AtomicUsize,
    }

    #[async_trait]
    impl RelayBus for DroppingRelay {
        fn topic(&self) -> &str {
            self.inner.topic()
        }

        async fn publish(&self, message: &Message) -> Result<()> {
            self.inner.publish(message).await
        }

        async fn subscribe(&self) -> Result<RelayStream> {
            let stream = if self.subscribes.load(Ordering::SeqCst) == 0 {
                futures::stream::empty::<Vec<u8>>().boxed()
            } else {
                self.inner.subscribe().await?
            };
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(stream)
        }

        async fn unsubscribe(&self) -> Result<()> {
            self.inner.unsubscribe().await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    fn subscription(
        bus: &MemoryBus,
        hub_id: &str,
    ) -> (RelaySubscription, Vec<tokio::sync::mpsc::Receiver<Message>>) {
        let (engine, queues) = EngineSender::channel(hub_id, 1, 8);
        (RelaySubscription::new(Arc::new(bus.relay()), engine), queues)
    }

    #[test]
    fn own_publications_are_discarded() {
        let bus = MemoryBus::new("topic", 8);
        let (subscription, _queues) = subscription(&bus, "H1");

        let payload = Message::from_client("conn-a", "H1", b"hi".to_vec())
            .to_bytes()
            .unwrap();
        assert!(subscription.accept(&payload).is_none());
    }

    #[test]
    fn peer_messages_are_stamped_with_the_topic() {
        let bus = MemoryBus::new("topic", 8);
        let (subscription, _queues) = subscription(&bus, "H2");

        let payload = Message::from_client("conn-a", "H1", b"hi".to_vec())
            .to_bytes()
            .unwrap();
        let message = subscription.accept(&payload).unwrap();
        assert_eq!(message.sender_id(), "topic");
        assert_eq!(message.origin_id(), "conn-a");
        assert_eq!(message.hub_id(), "H1");
    }

    #[test]
    fn malformed_payloads_are_skipped() {
        let bus = MemoryBus::new("topic", 8);
        let (subscription, _queues) = subscription(&bus, "H2");
        assert!(subscription.accept(b"{not json").is_none());
    }

    #[tokio::test]
    async fn run_forwards_only_peer_messages() {
        let bus = MemoryBus::new("topic", 8);
        let (subscription, mut queues) = subscription(&bus, "H2");
        let relay = bus.relay();
        let stream = relay.subscribe().await.unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(subscription.run(stream, cancel.clone()));

        let raw = bus.relay();
        raw.publish(&Message::from_client("conn-x", "H2", b"own".to_vec()))
            .await
            .unwrap();
        raw.publish(&Message::from_client("conn-a", "H1", b"peer".to_vec()))
            .await
            .unwrap();

        let message = queues[0].recv().await.unwrap();
        assert_eq!(message.payload(), b"peer");
        assert!(message.is_from_relay("topic"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_resubscribes_when_the_bus_ends_the_stream() {
        let bus = MemoryBus::new("topic", 8);
        let relay = Arc::new(DroppingRelay {
            inner: bus.relay(),
            subscribes: AtomicUsize::new(0),
        });
        let (engine, mut queues) = EngineSender::channel("H2", 1, 8);
        let subscription = RelaySubscription::new(relay.clone(), engine);
        let stream = relay.subscribe().await.unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(subscription.run(stream, cancel.clone()));

        while relay.subscribes.load(Ordering::SeqCst) < 2 {
            time::sleep(Duration::from_millis(100)).await;
        }
        bus.relay()
            .publish(&Message::from_client("conn-a", "H1", b"back".to_vec()))
            .await
            .unwrap();

        let message = queues[0].recv().await.unwrap();
        assert_eq!(message.payload(), b"back");

        cancel.cancel();
        task.await.unwrap();
    }
}
