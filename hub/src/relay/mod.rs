//! The relay bus connecting hub instances.
//!
//! Every hub of a deployment publishes its locally authored messages on one shared
//! topic and consumes everyone else's from it. Implementations only move raw payloads;
//! decoding, the hub-id self filter and sender stamping live in [`subscription`] so
//! they behave the same whatever the bus is.

pub mod memory;
pub mod redis;
pub mod subscription;

use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Raw payloads received on the topic, in the order the bus delivered them.
pub type RelayStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait RelayBus: Send + Sync {
    /// Name of the shared topic; also the `sender_id` stamped on relayed messages.
    fn topic(&self) -> &str;

    async fn publish(&self, message: &Message) -> Result<()>;

    /// Opens the subscription to the topic. The stream ends after `unsubscribe` or `close`.
    async fn subscribe(&self) -> Result<RelayStream>;

    async fn unsubscribe(&self) -> Result<()>;

    /// Releases the bus handle. Safe to call while a subscription is still draining.
    async fn close(&self) -> Result<()>;
}

pub use self::memory::{MemoryBus, MemoryRelay};
pub use self::redis::RedisRelay;
pub use self::subscription::RelaySubscription;
