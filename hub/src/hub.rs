use crate::connection::{Connection, ConnectionConfig, ConnectionId};
use crate::engine::{BroadcastEngine, DEFAULT_BROADCAST_WORKERS, DEFAULT_QUEUE_CAPACITY};
use crate::error::{Error, HubErrorKind, Result};
use crate::registry::ConnectionRegistry;
use crate::relay::{RelayBus, RelaySubscription};
use crate::transport::Transport;
use futures::future::join_all;
use log::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

/// Upper bound for a graceful shutdown triggered by a process signal.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on releasing the relay bus after a shutdown ran out of time.
const RELAY_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a hub. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Identity of this hub instance; stamped on every locally authored message.
    pub hub_id: String,
    pub broadcast_workers: usize,
    /// Total capacity of the broadcast queue.
    pub queue_capacity: usize,
    pub connection: ConnectionConfig,
}

impl HubSettings {
    pub fn new(hub_id: impl Into<String>) -> Self {
        Self {
            hub_id: hub_id.into(),
            broadcast_workers: DEFAULT_BROADCAST_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connection: ConnectionConfig::default(),
        }
    }
}

#[derive(Default)]
struct HubTasks {
    subscription: Option<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// Composition root tying the registry, the broadcast engine and the relay bus together.
///
/// Connections report their own failures on a single removal channel. One reaper task
/// drains it, unregisters the connection and closes it, so every close path goes through
/// the same place whether it was caused by the client, the transport or the hub.
pub struct Hub {
    settings: HubSettings,
    state: Mutex<HubState>,
    registry: Arc<ConnectionRegistry>,
    engine: Arc<BroadcastEngine>,
    relay: Arc<dyn RelayBus>,
    removals: mpsc::UnboundedSender<ConnectionId>,
    removals_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionId>>>,
    /// Stops the relay subscription and the reaper.
    cancel: CancellationToken,
    workers_cancel: CancellationToken,
    tasks: Mutex<HubTasks>,
}

impl Hub {
    pub fn new(settings: HubSettings, relay: Arc<dyn RelayBus>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = Arc::new(BroadcastEngine::new(
            &settings.hub_id,
            settings.broadcast_workers,
            settings.queue_capacity,
            registry.clone(),
            relay.clone(),
        ));
        let (removals, removals_rx) = mpsc::unbounded_channel();

        Self {
            settings,
            state: Mutex::new(HubState::Starting),
            registry,
            engine,
            relay,
            removals,
            removals_rx: Mutex::new(Some(removals_rx)),
            cancel: CancellationToken::new(),
            workers_cancel: CancellationToken::new(),
            tasks: Mutex::new(HubTasks::default()),
        }
    }

    pub fn hub_id(&self) -> &str {
        &self.settings.hub_id
    }

    pub fn state(&self) -> HubState {
        *self.lock_state()
    }

    /// Whether the hub currently accepts client attachments.
    pub fn is_ready(&self) -> bool {
        self.state() == HubState::Running
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Opens the relay subscription, launches the broadcast workers and the reaper, and
    /// starts accepting attachments. A failed subscription leaves the hub in `Starting`.
    pub async fn start(&self) -> Result<()> {
        let removals = {
            if self.state() != HubState::Starting {
                return Err(Error::hub(HubErrorKind::AlreadyStarted));
            }
            self.lock(&self.removals_rx)
                .take()
                .ok_or_else(|| Error::hub(HubErrorKind::AlreadyStarted))?
        };

        let stream = match self.relay.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    "Hub {} failed to subscribe to relay topic {}: {e}",
                    self.hub_id(),
                    self.relay.topic()
                );
                *self.lock(&self.removals_rx) = Some(removals);
                return Err(e);
            }
        };

        let workers = self.engine.start(self.workers_cancel.clone());
        let subscription = RelaySubscription::new(self.relay.clone(), self.engine.sender());
        let subscription = tokio::spawn(subscription.run(stream, self.cancel.clone()));
        let reaper = tokio::spawn(reap(self.registry.clone(), removals, self.cancel.clone()));

        *self.lock(&self.tasks) = HubTasks {
            subscription: Some(subscription),
            reaper: Some(reaper),
            workers,
        };

        let mut state = self.lock_state();
        if *state == HubState::Starting {
            *state = HubState::Running;
            info!("Hub {} running on relay topic {}", self.hub_id(), self.relay.topic());
        }
        Ok(())
    }

    /// Registers a new connection over `transport` and starts its reader and writer.
    pub fn attach<T: Transport>(&self, transport: T) -> Result<Arc<Connection>> {
        let (connection, outbound) = {
            // Held across registration so shutdown cannot miss a connection.
            let state = self.lock_state();
            if *state != HubState::Running {
                return Err(Error::hub(HubErrorKind::NotRunning));
            }
            let (connection, outbound) = Connection::new(self.settings.connection.clone());
            self.registry.add(connection.clone())?;
            (connection, outbound)
        };

        connection.spawn(
            transport,
            outbound,
            self.engine.sender(),
            self.removals.clone(),
        );
        info!("Connection {} attached to hub {}", connection.id(), self.hub_id());
        Ok(connection)
    }

    /// Stops accepting attachments, closes every connection, then releases the relay bus.
    ///
    /// Returns `Hub(ShutdownTimeout)` if that does not complete within `timeout`. The hub
    /// ends up `Stopped` either way and later calls do nothing.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        {
            let mut state = self.lock_state();
            let current = *state;
            match current {
                HubState::Starting => {
                    *state = HubState::Stopped;
                    drop(state);
                    self.cancel_all();
                    info!("Hub {} stopped before it was started", self.hub_id());
                    return Ok(());
                }
                HubState::Draining | HubState::Stopped => return Ok(()),
                HubState::Running => *state = HubState::Draining,
            }
        }

        info!("Hub {} shutting down", self.hub_id());
        let drained = time::timeout(timeout, self.drain()).await;

        self.cancel_all();
        *self.lock_state() = HubState::Stopped;

        match drained {
            Ok(()) => {
                info!("Hub {} stopped", self.hub_id());
                Ok(())
            }
            Err(_) => {
                error!(
                    "Hub {} did not shut down within {:?}, {} connection(s) still registered",
                    self.hub_id(),
                    timeout,
                    self.registry.len()
                );
                // The abandoned drain may not have reached the bus yet.
                match time::timeout(RELAY_CLOSE_TIMEOUT, self.relay.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Failed to close relay for topic {}: {e}", self.relay.topic())
                    }
                    Err(_) => warn!("Timed out closing relay for topic {}", self.relay.topic()),
                }
                Err(Error::hub(HubErrorKind::ShutdownTimeout))
            }
        }
    }

    async fn drain(&self) {
        let connections = self.registry.drain();
        debug!("Closing {} connection(s)", connections.len());
        for connection in &connections {
            connection.close();
        }
        join_all(connections.iter().map(|connection| connection.closed())).await;

        let tasks = std::mem::take(&mut *self.lock(&self.tasks));

        self.cancel.cancel();
        if let Some(subscription) = tasks.subscription {
            let _ = subscription.await;
        }
        if let Err(e) = self.relay.unsubscribe().await {
            warn!("Failed to unsubscribe from relay topic {}: {e}", self.relay.topic());
        }

        // Workers may still publish what they drain, so the bus closes after them.
        self.workers_cancel.cancel();
        join_all(tasks.workers).await;
        if let Err(e) = self.relay.close().await {
            warn!("Failed to close relay for topic {}: {e}", self.relay.topic());
        }

        if let Some(reaper) = tasks.reaper {
            let _ = reaper.await;
        }
    }

    fn cancel_all(&self) {
        self.cancel.cancel();
        self.workers_cancel.cancel();
    }

    fn lock_state(&self) -> MutexGuard<'_, HubState> {
        self.lock(&self.state)
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Unregisters and closes every connection reported on the removal channel.
async fn reap(
    registry: Arc<ConnectionRegistry>,
    mut removals: mpsc::UnboundedReceiver<ConnectionId>,
    cancel: CancellationToken,
) {
    loop {
        let id = tokio::select! {
            _ = cancel.cancelled() => break,
            next = removals.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        // Both activities of a connection report; only the first finds it registered.
        if let Some(connection) = registry.remove(id.as_str()) {
            connection.close();
            debug!("Connection {id} removed, {} remaining", registry.len());
        }
    }
    debug!("Connection reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, RelayErrorKind, TransportErrorKind};
    use crate::relay::MemoryBus;
    use crate::transport::{ChannelTransport, Frame};
    use futures::{Sink, Stream};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Accepts frames but fails every flush, and records how many connections were still
    /// registered when it was closed.
    struct FailingTransport {
        inner: ChannelTransport,
        registry: Arc<ConnectionRegistry>,
        registered_at_close: Arc<Mutex<Option<usize>>>,
    }

    impl Stream for FailingTransport {
        type Item = Result<Frame>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.inner).poll_next(cx)
        }
    }

    impl Sink<Frame> for FailingTransport {
        type Error = Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, _item: Frame) -> Result<()> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Ready(Err(Error::transport(TransportErrorKind::Write)))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            *self.registered_at_close.lock().unwrap() = Some(self.registry.len());
            Poll::Ready(Ok(()))
        }
    }

    fn hub(bus: &MemoryBus) -> Hub {
        Hub::new(HubSettings::new("hub-1"), Arc::new(bus.relay()))
    }

    #[tokio::test]
    async fn start_moves_to_running_once() {
        let bus = MemoryBus::new("topic", 8);
        let hub = hub(&bus);
        assert_eq!(hub.state(), HubState::Starting);
        assert!(!hub.is_ready());

        hub.start().await.unwrap();
        assert_eq!(hub.state(), HubState::Running);
        assert!(hub.is_ready());

        let err = hub.start().await.unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Hub(HubErrorKind::AlreadyStarted));
        hub.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn failed_subscription_keeps_the_hub_starting() {
        let bus = MemoryBus::new("topic", 8);
        let relay = Arc::new(bus.relay());
        relay.close().await.unwrap();
        let hub = Hub::new(HubSettings::new("hub-1"), relay);

        let err = hub.start().await.unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Relay(RelayErrorKind::Closed));
        assert_eq!(hub.state(), HubState::Starting);
    }

    #[tokio::test]
    async fn attach_is_rejected_unless_running() {
        let bus = MemoryBus::new("topic", 8);
        let hub = hub(&bus);

        let (transport, _peer) = ChannelTransport::pair(8);
        let err = hub.attach(transport).unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Hub(HubErrorKind::NotRunning));

        hub.start().await.unwrap();
        let (transport, _peer) = ChannelTransport::pair(8);
        hub.attach(transport).unwrap();
        assert_eq!(hub.connection_count(), 1);

        hub.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
        let (transport, _peer) = ChannelTransport::pair(8);
        let err = hub.attach(transport).unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Hub(HubErrorKind::NotRunning));
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn disconnected_client_is_reaped() {
        let bus = MemoryBus::new("topic", 8);
        let hub = hub(&bus);
        hub.start().await.unwrap();

        let (transport, mut peer) = ChannelTransport::pair(8);
        let connection = hub.attach(transport).unwrap();
        peer.disconnect();

        connection.closed().await;
        while hub.connection_count() > 0 {
            tokio::task::yield_now().await;
        }
        hub.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_before_start_stops_immediately() {
        let bus = MemoryBus::new("topic", 8);
        let hub = hub(&bus);

        hub.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
        assert_eq!(hub.state(), HubState::Stopped);
        let err = hub.start().await.unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Hub(HubErrorKind::AlreadyStarted));
    }

    #[tokio::test]
    async fn second_shutdown_is_a_no_op() {
        let bus = MemoryBus::new("topic", 8);
        let hub = hub(&bus);
        hub.start().await.unwrap();

        hub.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
        hub.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
        assert_eq!(hub.state(), HubState::Stopped);
    }

    #[tokio::test]
    async fn failed_write_unregisters_before_releasing_the_transport() {
        let bus = MemoryBus::new("topic", 8);
        let hub = hub(&bus);
        hub.start().await.unwrap();

        let (inner, _failing_peer) = ChannelTransport::pair(8);
        let registered_at_close = Arc::new(Mutex::new(None));
        let failing = hub
            .attach(FailingTransport {
                inner,
                registry: hub.registry.clone(),
                registered_at_close: registered_at_close.clone(),
            })
            .unwrap();
        let (transport, mut sender) = ChannelTransport::pair(8);
        hub.attach(transport).unwrap();
        assert_eq!(hub.connection_count(), 2);

        sender.send_data("x").await.unwrap();
        failing.closed().await;

        assert_eq!(*registered_at_close.lock().unwrap(), Some(1));
        assert_eq!(hub.connection_count(), 1);
        hub.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await.unwrap();
    }
}
