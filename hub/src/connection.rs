use crate::engine::EngineSender;
use crate::error::{Error, ErrorKind, Result, TransportErrorKind};
use crate::message::Message;
use crate::transport::{Frame, Transport};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::*;
use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Time allowed to write a single frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(1);
/// Time allowed between reads (data or liveness acknowledgments) from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Liveness pings go out at 9/10 of the idle deadline.
pub const PING_PERIOD: Duration = Duration::from_secs(54);
/// Largest inbound payload accepted from a client, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 512;
pub const OUTBOUND_CAPACITY: usize = 256;

/// Receiving half of a connection's outbound queue, owned by its writer task.
pub type OutboundReceiver = mpsc::Receiver<Arc<Message>>;

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_size: usize,
    pub outbound_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            max_message_size: MAX_MESSAGE_SIZE,
            outbound_capacity: OUTBOUND_CAPACITY,
        }
    }
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closing,
    Closed,
}

/// Outcome of handing a message to a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The outbound queue was full and the message was discarded.
    Dropped,
    Closed,
}

/// One attached client.
///
/// The connection runs two tasks against its transport: a reader that turns inbound
/// frames into [`Message`]s for the broadcast engine, and a writer that drains the
/// outbound queue and sends liveness pings. Whichever task stops first reports the
/// connection id on the removal channel; the hub then unregisters and closes the
/// connection, which stops the other task. Only the writer releases the transport,
/// exactly once, and never before the connection has been closed.
pub struct Connection {
    id: ConnectionId,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    outbound: mpsc::Sender<Arc<Message>>,
    dropped: AtomicU64,
    shutdown: CancellationToken,
    released: CancellationToken,
}

impl Connection {
    /// Creates a connection in the `Active` state. No task runs until [`Connection::spawn`].
    pub fn new(config: ConnectionConfig) -> (Arc<Self>, OutboundReceiver) {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            config,
            state: Mutex::new(ConnectionState::Active),
            outbound,
            dropped: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            released: CancellationToken::new(),
        });
        (connection, outbound_rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    /// Number of messages discarded because the outbound queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Starts the reader and writer tasks on `transport`.
    pub fn spawn<T: Transport>(
        self: &Arc<Self>,
        transport: T,
        outbound: OutboundReceiver,
        inbound: EngineSender,
        removals: mpsc::UnboundedSender<ConnectionId>,
    ) {
        let (sink, stream) = transport.split::<Frame>();

        tokio::spawn(Arc::clone(self).read_pump(stream, inbound, removals.clone()));
        tokio::spawn(Arc::clone(self).write_pump(sink, outbound, removals));
    }

    /// Queues `message` for delivery to this client without waiting.
    ///
    /// A full queue drops the message so one slow client cannot stall the fan-out.
    pub fn deliver(&self, message: Arc<Message>) -> Delivery {
        if self.state() != ConnectionState::Active {
            return Delivery::Closed;
        }

        match self.outbound.try_send(message) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Outbound queue full for connection {}, dropping message from {}",
                    self.id,
                    message.sender_id()
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Begins tearing the connection down. Safe to call any number of times from any task;
    /// returns `true` only for the call that moved the connection out of `Active`.
    pub fn close(&self) -> bool {
        {
            let mut state = self.lock_state();
            if *state != ConnectionState::Active {
                return false;
            }
            *state = ConnectionState::Closing;
        }

        debug!("Closing connection {}", self.id);
        self.shutdown.cancel();
        true
    }

    /// Resolves once the transport has been released and the state is `Closed`.
    pub async fn closed(&self) {
        self.released.cancelled().await
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read_pump<S>(
        self: Arc<Self>,
        mut stream: S,
        inbound: EngineSender,
        removals: mpsc::UnboundedSender<ConnectionId>,
    ) where
        S: Stream<Item = Result<Frame>> + Unpin,
    {
        match self.read_loop(&mut stream, &inbound).await {
            Ok(()) => debug!("Reader for connection {} stopped", self.id),
            Err(e) => warn!("Error reading from connection {}: {e}", self.id),
        }
        let _ = removals.send(self.id.clone());
    }

    async fn read_loop<S>(&self, stream: &mut S, inbound: &EngineSender) -> Result<()>
    where
        S: Stream<Item = Result<Frame>> + Unpin,
    {
        let mut deadline = Instant::now() + self.config.pong_wait;

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                next = time::timeout_at(deadline, stream.next()) => next,
            };

            let frame = match next {
                Err(_) => return Err(Error::transport(TransportErrorKind::Deadline)),
                // Peer went away without a close frame.
                Ok(None) => return Ok(()),
                Ok(Some(frame)) => frame?,
            };

            deadline = Instant::now() + self.config.pong_wait;
            match frame {
                Frame::Data(payload) => {
                    if payload.len() > self.config.max_message_size {
                        return Err(Error::with_source(
                            ErrorKind::Transport(TransportErrorKind::Protocol),
                            format!(
                                "message of {} bytes exceeds limit of {}",
                                payload.len(),
                                self.config.max_message_size
                            ),
                        ));
                    }

                    let message = Message::from_client(self.id.as_str(), inbound.hub_id(), payload);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        sent = inbound.send(message) => sent?,
                    }
                }
                Frame::Ping(_) | Frame::Pong(_) => {}
                Frame::Close => return Ok(()),
            }
        }
    }

    async fn write_pump<K>(
        self: Arc<Self>,
        mut sink: K,
        mut outbound: OutboundReceiver,
        removals: mpsc::UnboundedSender<ConnectionId>,
    ) where
        K: Sink<Frame, Error = Error> + Unpin,
    {
        match self.write_loop(&mut sink, &mut outbound).await {
            Ok(()) => debug!("Writer for connection {} stopped", self.id),
            Err(e) => warn!("Error writing to connection {}: {e}", self.id),
        }

        outbound.close();
        let _ = removals.send(self.id.clone());

        // The hub unregisters the connection before closing it; release only after that.
        self.shutdown.cancelled().await;
        self.release(&mut sink).await;
    }

    async fn write_loop<K>(&self, sink: &mut K, outbound: &mut OutboundReceiver) -> Result<()>
    where
        K: Sink<Frame, Error = Error> + Unpin,
    {
        let period = self.config.ping_period;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                next = outbound.recv() => match next {
                    Some(message) => {
                        self.write_frame(sink, Frame::Data(message.payload().to_vec())).await?
                    }
                    None => return Ok(()),
                },
                _ = ticker.tick() => {
                    // Pending application traffic already proves liveness.
                    if outbound.is_empty() {
                        self.write_frame(sink, Frame::Ping(Vec::new())).await?;
                    }
                }
            }
        }
    }

    async fn write_frame<K>(&self, sink: &mut K, frame: Frame) -> Result<()>
    where
        K: Sink<Frame, Error = Error> + Unpin,
    {
        match time::timeout(self.config.write_wait, sink.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(Error::transport(TransportErrorKind::Deadline)),
        }
    }

    async fn release<K>(&self, sink: &mut K)
    where
        K: Sink<Frame, Error = Error> + Unpin,
    {
        if let Err(e) = self.write_frame(sink, Frame::Close).await {
            debug!("Could not send close frame to connection {}: {e}", self.id);
        }
        match time::timeout(self.config.write_wait, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error closing transport of connection {}: {e}", self.id),
            Err(_) => debug!("Timed out closing transport of connection {}", self.id),
        }

        *self.lock_state() = ConnectionState::Closed;
        self.released.cancel();
        info!("Connection {} closed", self.id);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("dropped", &self.dropped())
            .finish()
    }
}
