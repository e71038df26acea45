//! Infrastructure layer: broker configuration and the AMQP transport.

pub mod config;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "amqp")]
pub mod tls;

pub use config::{derive_vhost, BrokerConfig, ConfigError, Environment, TlsSettings};

#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannel, AmqpConnector};
#[cfg(feature = "amqp")]
pub use tls::TlsPolicyError;
