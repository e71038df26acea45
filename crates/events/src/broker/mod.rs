//! Broker transport abstraction (mechanics only).
//!
//! The substrate talks to a fanout broker through two small traits:
//!
//! - [`Connector`] opens a connection plus one channel, with publisher
//!   confirms enabled and the consumer prefetch applied.
//! - [`BrokerChannel`] is that channel: declare topology, publish, consume,
//!   acknowledge.
//!
//! ## Topology
//!
//! ```text
//! publisher ──► exchange `app` (fanout) ──► queue `app` (durable) ──► subscriber worker
//!                                      └──► any other bound queue
//! ```
//!
//! One exchange and one durable queue per app, both named after the app.
//!
//! ## Thread Safety
//!
//! A channel is `Send` but not `Sync`: it is owned by exactly one thread (the
//! publisher behind a mutex, or one subscriber worker). Acknowledgements from
//! other threads go through [`AckScheduler`], which hands delivery tags back
//! to the owning thread.
//!
//! Implementations: [`InMemoryBroker`] (tests/dev) and the AMQP connector in
//! `edas-infra` (feature `amqp`).

mod client;
mod in_memory;

use std::time::Duration;

use thiserror::Error;

use edas_core::ErrorKind;

pub use client::{AckScheduler, BrokerClient, ConsumeExit};
pub use in_memory::{BrokerStats, InMemoryBroker, InMemoryChannel};

/// Default consumer prefetch (unacknowledged in-flight messages per consumer).
pub const DEFAULT_PREFETCH: u16 = 5;

/// Minimum (and default) connection heartbeat.
pub const MIN_HEARTBEAT: Duration = Duration::from_secs(600);

/// AMQP delivery mode for persistent messages.
pub const PERSISTENT: u8 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Opening the connection or channel failed.
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    /// No connection has been opened (or it was torn down).
    #[error("not connected to broker")]
    NotConnected,

    /// The broker closed the connection.
    #[error("broker connection closed: {0}")]
    ConnectionClosed(String),

    /// The underlying stream was lost (socket reset, missed heartbeats).
    #[error("broker stream lost: {0}")]
    StreamLost(String),

    /// The channel was closed while the connection stayed up.
    #[error("broker channel closed: {0}")]
    ChannelClosed(String),

    /// A mandatory publish matched no queue.
    #[error("message to exchange `{exchange}` was unroutable")]
    Unroutable { exchange: String },

    /// The broker negatively confirmed a publish.
    #[error("broker rejected message to exchange `{exchange}`")]
    Nack { exchange: String },

    /// Any other protocol-level failure.
    #[error("broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Failures after which the publish path reconnects and retries once.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionClosed(_)
                | BrokerError::StreamLost(_)
                | BrokerError::ChannelClosed(_)
                | BrokerError::NotConnected
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Unroutable { .. } => ErrorKind::Warning,
            BrokerError::Connect(_) => ErrorKind::Error,
            _ => ErrorKind::Base,
        }
    }
}

/// Transport-independent client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Consumer prefetch.
    pub prefetch: u16,
    /// Connection heartbeat; never below [`MIN_HEARTBEAT`].
    pub heartbeat: Duration,
    /// How long one consume wait blocks before the loop checks for shutdown.
    pub consume_poll: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
            heartbeat: MIN_HEARTBEAT,
            consume_poll: Duration::from_millis(250),
        }
    }
}

impl ClientSettings {
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat.max(MIN_HEARTBEAT);
        self
    }

    pub fn with_consume_poll(mut self, poll: Duration) -> Self {
        self.consume_poll = poll;
        self
    }
}

/// Properties attached to a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub delivery_mode: u8,
    pub correlation_id: Option<String>,
    /// Ask the broker to return the message when no queue is bound.
    pub mandatory: bool,
}

impl PublishProperties {
    pub fn persistent(correlation_id: Option<String>) -> Self {
        Self {
            delivery_mode: PERSISTENT,
            correlation_id,
            mandatory: true,
        }
    }
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

/// An open connection + channel.
///
/// All methods block until the broker answers.
pub trait BrokerChannel: Send {
    /// Declare a fanout exchange (idempotent).
    fn declare_exchange(&mut self, exchange: &str) -> Result<(), BrokerError>;

    /// Declare a durable queue and bind it to `exchange` (idempotent).
    fn declare_queue_and_bind(&mut self, exchange: &str, queue: &str) -> Result<(), BrokerError>;

    /// Publish and wait for the broker's confirm.
    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError>;

    /// Register this channel as a consumer of `queue`.
    fn start_consume(&mut self, queue: &str) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for the next delivery.
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    fn close(&mut self);
}

/// Opens broker channels.
pub trait Connector: Send + Sync {
    fn connect(&self, settings: &ClientSettings) -> Result<Box<dyn BrokerChannel>, BrokerError>;
}

impl<C> Connector for std::sync::Arc<C>
where
    C: Connector + ?Sized,
{
    fn connect(&self, settings: &ClientSettings) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        (**self).connect(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_clamp_heartbeat_and_prefetch() {
        let settings = ClientSettings::default()
            .with_heartbeat(Duration::from_secs(30))
            .with_prefetch(0);
        assert_eq!(settings.heartbeat, MIN_HEARTBEAT);
        assert_eq!(settings.prefetch, 1);
        assert_eq!(ClientSettings::default().prefetch, 5);
    }

    #[test]
    fn only_connection_failures_trigger_reconnect() {
        assert!(BrokerError::ConnectionClosed("x".into()).is_connection_loss());
        assert!(BrokerError::StreamLost("x".into()).is_connection_loss());
        assert!(!BrokerError::Unroutable { exchange: "policy".into() }.is_connection_loss());
        assert!(!BrokerError::Protocol("x".into()).is_connection_loss());
    }
}
