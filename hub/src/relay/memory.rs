use super::{RelayBus, RelayStream};
use crate::error::{Error, RelayErrorKind, Result};
use crate::message::Message;
use async_trait::async_trait;
use futures::StreamExt;
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// In-process bus over a `tokio::sync::broadcast` channel.
///
/// Hubs sharing one `MemoryBus` relay to each other exactly as they would over Redis,
/// which makes it the bus for single-process deployments and tests. Slow subscribers
/// that fall behind skip messages, matching the best-effort delivery of the hub.
#[derive(Clone)]
pub struct MemoryBus {
    topic: Arc<str>,
    sender: broadcast::Sender<Vec<u8>>,
}

impl MemoryBus {
    pub fn new(topic: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            topic: Arc::from(topic),
            sender,
        }
    }

    /// A fresh handle for one hub. Closing it does not affect other handles.
    pub fn relay(&self) -> MemoryRelay {
        MemoryRelay {
            topic: self.topic.clone(),
            sender: self.sender.clone(),
            closed: AtomicBool::new(false),
            subscriptions: CancellationToken::new(),
        }
    }
}

pub struct MemoryRelay {
    topic: Arc<str>,
    sender: broadcast::Sender<Vec<u8>>,
    closed: AtomicBool,
    subscriptions: CancellationToken,
}

#[async_trait]
impl RelayBus for MemoryRelay {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::relay(RelayErrorKind::Closed));
        }
        // No subscribers is not an error, nobody is listening yet.
        let _ = self.sender.send(message.to_bytes()?);
        Ok(())
    }

    async fn subscribe(&self) -> Result<RelayStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::relay(RelayErrorKind::Closed));
        }

        let topic = self.topic.clone();
        let stream = futures::stream::unfold(self.sender.subscribe(), move |mut rx| {
            let topic = topic.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Subscriber on {topic} lagged, skipped {skipped} message(s)")
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream
            .take_until(self.subscriptions.clone().cancelled_owned())
            .boxed())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.subscriptions.cancel();
        info!("Unsubscribed from relay topic {}", self.topic);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.subscriptions.cancel();
        Ok(())
    }
}
