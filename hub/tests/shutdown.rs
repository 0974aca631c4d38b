use futures::{Sink, Stream};
use hub::transport::{ChannelTransport, Frame};
use hub::relay::{MemoryBus, RelayBus};
use hub::{ConnectionConfig, ConnectionState, Error, Hub, HubSettings, HubState, Message, Result};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// A peer that never reads, never writes and never acknowledges a close.
struct HungTransport;

impl Stream for HungTransport {
    type Item = Result<Frame>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Pending
    }
}

impl Sink<Frame> for HungTransport {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: Frame) -> Result<()> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Pending
    }
}

fn settings() -> HubSettings {
    HubSettings {
        connection: ConnectionConfig {
            write_wait: Duration::from_secs(1),
            ..ConnectionConfig::default()
        },
        ..HubSettings::new("hub-1")
    }
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let bus = MemoryBus::new("topic", 16);
    let hub = Hub::new(settings(), Arc::new(bus.relay()));
    hub.start().await.unwrap();

    let mut peers = Vec::new();
    let mut connections = Vec::new();
    for _ in 0..3 {
        let (transport, peer) = ChannelTransport::pair(8);
        connections.push(hub.attach(transport).unwrap());
        peers.push(peer);
    }
    assert_eq!(hub.connection_count(), 3);

    hub.shutdown(Duration::from_secs(10)).await.unwrap();

    assert_eq!(hub.state(), HubState::Stopped);
    assert_eq!(hub.connection_count(), 0);
    for connection in &connections {
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
    for peer in &mut peers {
        assert_eq!(peer.recv().await, Some(Frame::Close));
        assert_eq!(peer.recv().await, None);
    }
}

#[tokio::test(start_paused = true)]
async fn hung_connection_turns_shutdown_into_a_timeout() {
    let bus = MemoryBus::new("topic", 16);
    let relay = Arc::new(bus.relay());
    let hub = Hub::new(settings(), relay.clone());
    hub.start().await.unwrap();

    let mut peers = Vec::new();
    for _ in 0..3 {
        let (transport, peer) = ChannelTransport::pair(8);
        hub.attach(transport).unwrap();
        peers.push(peer);
    }
    let hung = hub.attach(HungTransport).unwrap();

    // Shorter than the write deadline the hung connection is allowed per frame.
    let err = hub.shutdown(Duration::from_millis(500)).await.unwrap_err();
    assert!(err.is_shutdown_timeout());
    assert_eq!(hub.state(), HubState::Stopped);
    assert_ne!(hung.state(), ConnectionState::Active);

    // The healthy connections were closed regardless.
    for peer in &mut peers {
        assert_eq!(peer.recv().await, Some(Frame::Close));
    }
    // And the bus handle was still released.
    let message = Message::from_client("conn-a", "hub-1", b"late".to_vec());
    assert!(relay.publish(&message).await.is_err());

    // A later call neither blocks nor fails.
    hub.shutdown(Duration::from_millis(500)).await.unwrap();
}
