//! # MQTT Engine
//!
//! Reliable publish, redelivery and reconnection against a single broker.
//!
//! The engine is split into four focused submodules:
//!
//! ```text
//! mqtt/
//! ├── supervisor.rs - connection state machine (pure transitions)
//! ├── session.rs    - one rumqttc client + event pump per connect attempt
//! ├── pipeline.rs   - publish tracking and durable post records
//! └── resolver.rs   - page-bounded replay of unconfirmed samples
//! ```
//!
//! ## Design
//!
//! All mutation happens on the single service task. The supervisor computes
//! side effects as data; the service executes them. Broker I/O events are
//! tagged with the generation of the session that produced them so events
//! from a superseded session (or a stale reconnect timer) are discarded
//! instead of corrupting the current connection state.

pub mod pipeline;
pub mod resolver;
pub mod session;
pub mod supervisor;

pub use pipeline::{ConfirmedPublish, PublishError, PublishPipeline};
pub use resolver::{RedeliveryResolver, ReplayAction, REPLAY_PAGE_SIZE};
pub use session::{BrokerSession, SessionEvent};
pub use supervisor::{SideEffect, Supervisor, SupervisorEvent};

use std::time::Duration;

/// Delay before a scheduled reconnection attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Broker session lifecycle. Exactly one instance, owned by the supervisor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

/// Events the session pump forwards from the broker into the service loop.
#[derive(Debug)]
pub enum BrokerEvent {
    /// CONNACK received, session is live.
    Connected,
    /// SUBACK for the config-topic subscription.
    Subscribed,
    /// The client assigned a packet id to the oldest queued publish.
    PublishQueued(u16),
    /// PUBACK: the publish with this packet id is confirmed delivered.
    PublishConfirmed(u16),
    /// Inbound message on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// Socket closed, broker disconnect, or protocol error.
    ConnectionLost(String),
}
