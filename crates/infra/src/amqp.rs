//! AMQP 0-9-1 transport (RabbitMQ) over `lapin`.
//!
//! Requires feature `amqp`.
//!
//! lapin is async; the broker client is blocking and owns its channel on a
//! single thread. Each [`AmqpChannel`] therefore carries a current-thread
//! tokio runtime and drives every lapin future to completion on the calling
//! thread. lapin's own I/O loop keeps the heartbeat going in between.
//!
//! Behaviour:
//! - Publisher confirms are enabled on every channel; `publish` waits for the
//!   confirm and turns a returned (unroutable) message into
//!   `BrokerError::Unroutable`.
//! - Exchanges are durable fanout exchanges, queues are durable.
//! - In production the connection uses `amqps` and performs its own rustls
//!   handshake with the client config built from [`TlsSettings`]
//!   (see [`crate::tls`]), so only the suites and protocol versions the
//!   policy allows are offered.
//!
//! [`TlsSettings`]: crate::config::TlsSettings

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::tcp::{HandshakeError, HandshakeResult, TcpStream};
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use rustls_connector::RustlsConnector;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

use edas_events::broker::{BrokerChannel, BrokerError, ClientSettings, Connector, Delivery, PublishProperties};

use crate::config::BrokerConfig;
use crate::tls;

const CONSUMER_TAG_PREFIX: &str = "edas";

/// Opens AMQP connections described by a [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: Arc<BrokerConfig>,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> Result<Self, crate::config::ConfigError> {
        BrokerConfig::from_env().map(Self::new)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Connection URI with the heartbeat applied.
    pub fn uri(&self, settings: &ClientSettings) -> AMQPUri {
        let config = &self.config;
        AMQPUri {
            scheme: if config.uses_tls() {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: config.username.clone(),
                    password: config.password.clone(),
                },
                host: config.host.clone(),
                port: config.port,
            },
            vhost: config.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(heartbeat_secs(settings.heartbeat)),
                ..AMQPQueryString::default()
            },
        }
    }
}

impl Connector for AmqpConnector {
    fn connect(&self, settings: &ClientSettings) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|err| BrokerError::Connect(err.to_string()))?;

        let uri = self.uri(settings);
        let tls_connector = match &self.config.tls {
            Some(policy) => {
                let config = tls::client_config(policy).map_err(|err| BrokerError::Connect(err.to_string()))?;
                Some(RustlsConnector::from(Arc::new(config)))
            }
            None => None,
        };

        let (connection, channel) = runtime.block_on(async {
            let connection = match tls_connector {
                Some(tls_connector) => {
                    let handshake = move |uri: &AMQPUri| tls_handshake(uri, &tls_connector);
                    Connection::connector(uri, Box::new(handshake), ConnectionProperties::default()).await
                }
                None => Connection::connect_uri(uri, ConnectionProperties::default()).await,
            }
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
            let channel = connection
                .create_channel()
                .await
                .map_err(|err| BrokerError::Connect(err.to_string()))?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| BrokerError::Connect(err.to_string()))?;
            channel
                .basic_qos(settings.prefetch, BasicQosOptions::default())
                .await
                .map_err(|err| BrokerError::Connect(err.to_string()))?;
            Ok::<_, BrokerError>((connection, channel))
        })?;

        info!(
            host = %self.config.host,
            port = self.config.port,
            vhost = %self.config.vhost,
            tls = self.config.uses_tls(),
            "amqp connection opened"
        );

        Ok(Box::new(AmqpChannel {
            runtime,
            connection,
            channel,
            consumer: None,
        }))
    }
}

/// One AMQP connection with its single channel.
pub struct AmqpChannel {
    runtime: Runtime,
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
}

impl core::fmt::Debug for AmqpChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AmqpChannel")
            .field("channel_id", &self.channel.id())
            .field("open", &self.is_open())
            .field("consuming", &self.consumer.is_some())
            .finish()
    }
}

impl BrokerChannel for AmqpChannel {
    fn declare_exchange(&mut self, exchange: &str) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.runtime
            .block_on(self.channel.exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                options,
                FieldTable::default(),
            ))
            .map_err(map_lapin_error)
    }

    fn declare_queue_and_bind(&mut self, exchange: &str, queue: &str) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        let channel = &self.channel;
        self.runtime
            .block_on(async {
                channel
                    .queue_declare(queue, options, FieldTable::default())
                    .await?;
                channel
                    .queue_bind(queue, exchange, "", QueueBindOptions::default(), FieldTable::default())
                    .await
            })
            .map_err(map_lapin_error)
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        let mut amqp_properties = BasicProperties::default().with_delivery_mode(properties.delivery_mode);
        if let Some(correlation_id) = &properties.correlation_id {
            amqp_properties = amqp_properties.with_correlation_id(ShortString::from(correlation_id.clone()));
        }
        let options = BasicPublishOptions {
            mandatory: properties.mandatory,
            ..BasicPublishOptions::default()
        };

        let channel = &self.channel;
        let confirmation = self
            .runtime
            .block_on(async {
                channel
                    .basic_publish(exchange, routing_key, options, body, amqp_properties)
                    .await?
                    .await
            })
            .map_err(map_lapin_error)?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(returned)) => {
                debug!(exchange, reply = returned.reply_text.as_str(), "message returned by broker");
                Err(BrokerError::Unroutable {
                    exchange: exchange.to_string(),
                })
            }
            Confirmation::Nack(_) => Err(BrokerError::Nack {
                exchange: exchange.to_string(),
            }),
        }
    }

    fn start_consume(&mut self, queue: &str) -> Result<(), BrokerError> {
        let tag = format!("{CONSUMER_TAG_PREFIX}-{queue}-{}", self.channel.id());
        let consumer = self
            .runtime
            .block_on(self.channel.basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            ))
            .map_err(map_lapin_error)?;
        self.consumer = Some(consumer);
        Ok(())
    }

    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Err(BrokerError::Protocol("channel is not consuming".to_string()));
        };

        let next = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, consumer.next()).await });

        match next {
            Err(_elapsed) => Ok(None),
            Ok(None) => Err(BrokerError::ChannelClosed("consumer stream ended".to_string())),
            Ok(Some(Err(err))) => Err(map_lapin_error(err)),
            Ok(Some(Ok(delivery))) => Ok(Some(Delivery {
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                redelivered: delivery.redelivered,
                correlation_id: delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string()),
                body: delivery.data,
            })),
        }
    }

    fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.runtime
            .block_on(self.channel.basic_ack(delivery_tag, BasicAckOptions::default()))
            .map_err(map_lapin_error)
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    fn close(&mut self) {
        self.consumer = None;
        if !self.connection.status().connected() {
            return;
        }
        if let Err(err) = self.runtime.block_on(self.connection.close(200, "closing")) {
            warn!(error = %err, "failed to close amqp connection cleanly");
        }
    }
}

impl Drop for AmqpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// TCP connect followed by a rustls handshake with the policy's client config.
fn tls_handshake(uri: &AMQPUri, connector: &RustlsConnector) -> HandshakeResult {
    let host = uri.authority.host.as_str();
    TcpStream::connect((host, uri.authority.port))
        .map_err(HandshakeError::Failure)?
        .into_rustls(connector, host)
}

fn heartbeat_secs(heartbeat: Duration) -> u16 {
    u16::try_from(heartbeat.as_secs()).unwrap_or(u16::MAX)
}

fn map_lapin_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::IOError(io) => BrokerError::StreamLost(io.to_string()),
        lapin::Error::InvalidConnectionState(state) => BrokerError::ConnectionClosed(format!("{state:?}")),
        lapin::Error::InvalidChannelState(state) => BrokerError::ChannelClosed(format!("{state:?}")),
        other => BrokerError::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Environment, TlsSettings};

    #[test]
    fn local_uri_is_plaintext_with_heartbeat() {
        let connector = AmqpConnector::new(BrokerConfig::default());
        let uri = connector.uri(&ClientSettings::default());
        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.query.heartbeat, Some(600));
    }

    #[test]
    fn production_uri_uses_amqps() {
        let connector = AmqpConnector::new(BrokerConfig {
            environment: Environment::Production,
            tls: Some(TlsSettings::default()),
            port: 5671,
            vhost: "edas-ab-1234".to_string(),
            ..BrokerConfig::default()
        });
        let uri = connector.uri(&ClientSettings::default().with_heartbeat(Duration::from_secs(900)));
        assert_eq!(uri.scheme, AMQPScheme::AMQPS);
        assert_eq!(uri.authority.port, 5671);
        assert_eq!(uri.vhost, "edas-ab-1234");
        assert_eq!(uri.query.heartbeat, Some(900));
    }

    #[test]
    fn production_connector_carries_a_usable_tls_policy() {
        let config = BrokerConfig::from_lookup(|var| (var == "EDAS_ENVIRONMENT").then(|| "production".to_string())).unwrap();
        let connector = AmqpConnector::new(config);
        let policy = connector.config().tls.as_ref().unwrap();
        let client = tls::client_config_with_roots(policy, rustls::RootCertStore::empty()).unwrap();
        assert_eq!(client.crypto_provider().cipher_suites.len(), 2);
    }

    #[test]
    fn transport_failures_map_to_connection_loss() {
        let io = lapin::Error::IOError(Arc::new(std::io::Error::from(std::io::ErrorKind::ConnectionReset)));
        assert!(map_lapin_error(io).is_connection_loss());
    }
}
