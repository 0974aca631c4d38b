use super::{RelayBus, RelayStream};
use crate::error::{Error, ErrorKind, RelayErrorKind, Result};
use crate::message::Message;
use ::redis::aio::MultiplexedConnection;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use futures::StreamExt;
use log::*;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Redis pub/sub backed relay bus.
///
/// Publishing goes through a multiplexed connection shared by all broadcast workers;
/// each subscription holds its own dedicated pub/sub connection, which is dropped when
/// the subscription is cancelled.
pub struct RedisRelay {
    client: ::redis::Client,
    publisher: Mutex<Option<MultiplexedConnection>>,
    topic: String,
    subscriptions: CancellationToken,
}

impl RedisRelay {
    /// Connects to `address` and verifies the server answers a PING.
    pub async fn connect(
        address: &str,
        username: Option<&str>,
        password: Option<&str>,
        topic: &str,
    ) -> Result<Self> {
        let url = connection_url(address, username, password);
        let client = ::redis::Client::open(url)
            .map_err(|e| Error::with_source(ErrorKind::Relay(RelayErrorKind::Connect), e))?;

        let mut publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::with_source(ErrorKind::Relay(RelayErrorKind::Connect), e))?;

        let pong: String = ::redis::cmd("PING")
            .query_async(&mut publisher)
            .await
            .map_err(|e| Error::with_source(ErrorKind::Relay(RelayErrorKind::Connect), e))?;
        info!("Successfully connected to Redis at {address} ({pong})");

        Ok(Self {
            client,
            publisher: Mutex::new(Some(publisher)),
            topic: topic.to_string(),
            subscriptions: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl RelayBus for RedisRelay {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        let data = message.to_bytes()?;
        let mut connection = self
            .publisher
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::relay(RelayErrorKind::Closed))?;

        connection
            .publish::<_, _, ()>(&self.topic, data)
            .await
            .map_err(|e| Error::with_source(ErrorKind::Relay(RelayErrorKind::Publish), e))
    }

    async fn subscribe(&self) -> Result<RelayStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::with_source(ErrorKind::Relay(RelayErrorKind::Subscribe), e))?;
        pubsub
            .subscribe(&self.topic)
            .await
            .map_err(|e| Error::with_source(ErrorKind::Relay(RelayErrorKind::Subscribe), e))?;
        info!("Subscribed to Redis channel {}", self.topic);

        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .take_until(self.subscriptions.clone().cancelled_owned())
            .boxed())
    }

    async fn unsubscribe(&self) -> Result<()> {
        // Ending the stream drops the dedicated pub/sub connection along with its subscription.
        self.subscriptions.cancel();
        info!("Unsubscribed from Redis channel {}", self.topic);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.subscriptions.cancel();
        if self.publisher.lock().await.take().is_some() {
            info!("Redis relay for channel {} closed", self.topic);
        }
        Ok(())
    }
}

/// Builds a `redis://` URL from a bare `host:port` address and optional credentials.
/// Addresses that already carry a scheme are used verbatim.
fn connection_url(address: &str, username: Option<&str>, password: Option<&str>) -> String {
    if address.starts_with("redis://") || address.starts_with("rediss://") {
        return address.to_string();
    }

    let username = username.filter(|u| !u.is_empty());
    let password = password.filter(|p| !p.is_empty());
    match (username, password) {
        (Some(user), Some(pass)) => format!(
            "redis://{}:{}@{address}",
            urlencoding::encode(user),
            urlencoding::encode(pass)
        ),
        (None, Some(pass)) => format!("redis://:{}@{address}", urlencoding::encode(pass)),
        (Some(user), None) => format!("redis://{}@{address}", urlencoding::encode(user)),
        (None, None) => format!("redis://{address}"),
    }
}
