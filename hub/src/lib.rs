//! Realtime message relay hub.
//!
//! A hub accepts long-lived duplex client connections and rebroadcasts every message a
//! client sends to all other clients, both on this hub and on every peer hub attached to
//! the same relay bus.
//!
//! # Architecture
//!
//! - **Connections**: each attached client gets a reader task, a writer task and a bounded
//!   outbound queue. A full queue drops messages for that client only.
//! - **Registry**: the set of live connections, guarded by a single reader/writer lock.
//! - **Broadcast engine**: a pool of workers draining the inbound queue, fanning each
//!   message out locally and publishing locally authored messages to the relay bus.
//! - **Relay bus**: a pub/sub topic shared by every hub of a deployment (Redis, or an
//!   in-process bus for single-node setups and tests).
//!
//! # Message Flow
//!
//! 1. A client on hub H1 sends a payload over its transport
//! 2. The connection's reader stamps it with the connection id and H1's id
//! 3. A broadcast worker queues it on every other local connection
//! 4. The worker publishes it to the relay topic
//! 5. Hub H2 receives it, stamps the topic as sender and fans it out locally
//! 6. H2 does not publish it again because its sender is the topic
//!
//! # Example
//!
//! ```rust,ignore
//! use hub::relay::MemoryBus;
//! use hub::{Hub, HubSettings};
//!
//! let bus = MemoryBus::new("hub-messages", 1024);
//! let hub = Hub::new(HubSettings::new("hub-1"), Arc::new(bus.relay()));
//! hub.start().await?;
//! let connection = hub.attach(transport)?;
//! ```

pub mod connection;
pub mod engine;
pub mod error;
pub mod hub;
pub mod message;
pub mod registry;
pub mod relay;
pub mod transport;

pub use connection::{Connection, ConnectionConfig, ConnectionId, ConnectionState};
pub use error::{Error, ErrorKind, Result};
pub use hub::{Hub, HubSettings, HubState, DEFAULT_SHUTDOWN_TIMEOUT};
pub use message::Message;
pub use relay::RelayBus;
pub use transport::{Frame, Transport};
