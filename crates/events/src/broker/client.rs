//! Broker client: the sole holder of transport state.

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{BrokerChannel, BrokerError, ClientSettings, Connector, Delivery, PublishProperties};

/// Thread-safe handle that schedules acknowledgements onto the thread owning
/// the channel.
///
/// The owning thread drains scheduled tags between deliveries; a tag is only
/// acknowledged if the channel is still open at that point.
#[derive(Debug, Clone)]
pub struct AckScheduler {
    tx: mpsc::Sender<u64>,
}

impl AckScheduler {
    pub fn schedule(&self, delivery_tag: u64) {
        // The receiver lives as long as the client; a send failure means the
        // client is gone and so is its channel.
        let _ = self.tx.send(delivery_tag);
    }
}

/// Why a consume loop returned without error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConsumeExit {
    /// The shutdown signal fired.
    Shutdown,
}

/// One connection + one channel, with reconnect-once publishing and an
/// acknowledging consume loop.
///
/// Not `Sync`: the publisher keeps it behind a mutex, each subscriber worker
/// owns its own.
pub struct BrokerClient {
    connector: Arc<dyn Connector>,
    settings: ClientSettings,
    channel: Option<Box<dyn BrokerChannel>>,
    declared: HashSet<String>,
    ack_tx: mpsc::Sender<u64>,
    ack_rx: mpsc::Receiver<u64>,
}

impl core::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("settings", &self.settings)
            .field("connected", &self.is_connected())
            .field("declared", &self.declared)
            .finish()
    }
}

impl BrokerClient {
    pub fn new(connector: Arc<dyn Connector>, settings: ClientSettings) -> Self {
        let (ack_tx, ack_rx) = mpsc::channel();
        Self {
            connector,
            settings,
            channel: None,
            declared: HashSet::new(),
            ack_tx,
            ack_rx,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    /// Open a fresh connection and channel, replacing any existing one.
    pub fn connect(&mut self) -> Result<(), BrokerError> {
        self.close();

        match self.connector.connect(&self.settings) {
            Ok(channel) => {
                info!(
                    prefetch = self.settings.prefetch,
                    heartbeat_secs = self.settings.heartbeat.as_secs(),
                    "broker connection established"
                );
                self.channel = Some(channel);
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "failed to open broker connection");
                Err(err)
            }
        }
    }

    /// Close the channel (if any). Unacknowledged deliveries return to the broker.
    pub fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.declared.clear();
    }

    pub fn declare_exchange(&mut self, exchange: &str) -> Result<(), BrokerError> {
        if self.declared.contains(exchange) && self.is_connected() {
            return Ok(());
        }
        self.channel_mut()?.declare_exchange(exchange)?;
        self.declared.insert(exchange.to_string());
        debug!(exchange, "exchange declared");
        Ok(())
    }

    pub fn declare_queue_and_bind(&mut self, exchange: &str, queue: &str) -> Result<(), BrokerError> {
        self.declare_exchange(exchange)?;
        self.channel_mut()?.declare_queue_and_bind(exchange, queue)?;
        debug!(exchange, queue, "queue declared and bound");
        Ok(())
    }

    /// Publish a persistent message and wait for the broker's confirm.
    ///
    /// - Unroutable: logged and dropped (no retry).
    /// - Connection loss: reconnect once and retry the same body and
    ///   correlation id exactly once; a second failure is logged and dropped.
    pub fn publish(
        &mut self,
        body: &[u8],
        exchange: &str,
        routing_key: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), BrokerError> {
        let properties = PublishProperties::persistent(correlation_id.map(str::to_string));

        if !self.is_connected() {
            self.connect()?;
        }

        match self.publish_once(body, exchange, routing_key, &properties) {
            Ok(()) => Ok(()),
            Err(err) if err.is_connection_loss() => {
                warn!(exchange, error = %err, "publish hit a lost connection; reconnecting once");
                self.connect()?;
                self.publish_once(body, exchange, routing_key, &properties)
                    .inspect_err(|err| {
                        error!(exchange, error = %err, "publish retry failed; dropping message");
                    })
            }
            Err(err @ BrokerError::Unroutable { .. }) => {
                warn!(exchange, error = %err, "unroutable message dropped");
                Err(err)
            }
            Err(err) => {
                error!(exchange, error = %err, "publish failed");
                Err(err)
            }
        }
    }

    fn publish_once(
        &mut self,
        body: &[u8],
        exchange: &str,
        routing_key: &str,
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        self.declare_exchange(exchange)?;
        self.channel_mut()?
            .publish(exchange, routing_key, body, properties)
    }

    /// Handle for scheduling acks from other threads.
    pub fn ack_scheduler(&self) -> AckScheduler {
        AckScheduler {
            tx: self.ack_tx.clone(),
        }
    }

    /// Blocking consume loop.
    ///
    /// Each delivery is handed to `callback`; once it returns, the delivery's
    /// ack is scheduled and flushed on this thread. Returns when `shutdown`
    /// receives a message (or its sender is dropped) and with an error when
    /// the transport fails.
    pub fn consume<F>(
        &mut self,
        queue: &str,
        shutdown: &mpsc::Receiver<()>,
        mut callback: F,
    ) -> Result<ConsumeExit, BrokerError>
    where
        F: FnMut(Delivery),
    {
        let poll = self.settings.consume_poll;
        self.channel_mut()?.start_consume(queue)?;
        info!(queue, "consuming");

        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(mpsc::TryRecvError::Disconnected) => {
                    self.flush_acks();
                    return Ok(ConsumeExit::Shutdown);
                }
                Err(mpsc::TryRecvError::Empty) => {}
            }

            self.flush_acks();

            let delivery = self.channel_mut()?.next_delivery(poll)?;
            if let Some(delivery) = delivery {
                let tag = delivery.delivery_tag;
                debug!(queue, delivery_tag = tag, redelivered = delivery.redelivered, "delivery received");
                callback(delivery);
                self.ack_scheduler().schedule(tag);
                self.flush_acks();
            }
        }
    }

    /// Acknowledge every scheduled delivery tag, if the channel is still open.
    fn flush_acks(&mut self) {
        while let Ok(tag) = self.ack_rx.try_recv() {
            match self.channel.as_mut() {
                Some(channel) if channel.is_open() => {
                    if let Err(err) = channel.ack(tag) {
                        warn!(delivery_tag = tag, error = %err, "failed to acknowledge delivery");
                    }
                }
                _ => {
                    debug!(delivery_tag = tag, "channel closed; broker will redeliver");
                }
            }
        }
    }

    fn channel_mut(&mut self) -> Result<&mut Box<dyn BrokerChannel>, BrokerError> {
        self.channel.as_mut().ok_or(BrokerError::NotConnected)
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::InMemoryBroker;

    fn client(broker: &InMemoryBroker) -> BrokerClient {
        BrokerClient::new(
            Arc::new(broker.clone()),
            ClientSettings::default().with_consume_poll(Duration::from_millis(10)),
        )
    }

    fn bind(broker: &InMemoryBroker, app: &str) -> BrokerClient {
        let mut c = client(broker);
        c.connect().unwrap();
        c.declare_queue_and_bind(app, app).unwrap();
        c
    }

    #[test]
    fn publish_connects_lazily() {
        let broker = InMemoryBroker::new();
        let _consumer = bind(&broker, "policy");

        let mut publisher = client(&broker);
        publisher.publish(b"{}", "policy", "", Some("req-1")).unwrap();
        assert_eq!(broker.queue_depth("policy"), (1, 0));
    }

    #[test]
    fn publish_reconnects_once_after_connection_loss() {
        let broker = InMemoryBroker::new();
        let _consumer = bind(&broker, "policy");
        let mut publisher = client(&broker);
        publisher.publish(b"1", "policy", "", Some("req-1")).unwrap();

        broker.fail_next_publishes(1);
        publisher.publish(b"2", "policy", "", Some("req-2")).unwrap();

        let stats = broker.stats();
        assert_eq!(stats.publish_attempts, 3);
        assert_eq!(stats.published, 2);
    }

    #[test]
    fn second_failure_is_not_retried() {
        let broker = InMemoryBroker::new();
        let _consumer = bind(&broker, "policy");
        let mut publisher = client(&broker);
        publisher.connect().unwrap();
        let opened = broker.stats().connections_opened;

        broker.fail_next_publishes(2);
        let err = publisher.publish(b"{}", "policy", "", None).unwrap_err();

        assert!(err.is_connection_loss());
        let stats = broker.stats();
        assert_eq!(stats.connections_opened, opened + 1);
        assert_eq!(stats.publish_attempts, 2);
        assert_eq!(stats.published, 0);
    }

    #[test]
    fn unroutable_is_dropped_without_retry() {
        let broker = InMemoryBroker::new();
        let mut publisher = client(&broker);
        let err = publisher.publish(b"{}", "nobody", "", None).unwrap_err();
        assert!(matches!(err, BrokerError::Unroutable { .. }));
        assert_eq!(broker.stats().connections_opened, 1);
    }

    #[test]
    fn consume_acks_after_callback_and_stops_on_shutdown() {
        let broker = InMemoryBroker::new();
        let mut consumer = bind(&broker, "policy");
        let mut publisher = client(&broker);
        publisher.publish(b"{}", "policy", "", Some("req-9")).unwrap();

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let mut seen = Vec::new();
        let exit = consumer
            .consume("policy", &shutdown_rx, |d| {
                seen.push(d.correlation_id.clone());
                let _ = shutdown_tx.send(());
            })
            .unwrap();

        assert_eq!(exit, ConsumeExit::Shutdown);
        assert_eq!(seen, vec![Some("req-9".to_string())]);
        assert_eq!(broker.stats().acked, 1);
        assert_eq!(broker.queue_depth("policy"), (0, 0));
    }

    #[test]
    fn consume_surfaces_transport_errors() {
        let broker = InMemoryBroker::new();
        let mut consumer = bind(&broker, "policy");
        let (_shutdown_tx, shutdown_rx) = mpsc::channel();

        let closer = broker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            closer.close_all_connections();
        });

        let err = consumer.consume("policy", &shutdown_rx, |_| {}).unwrap_err();
        assert!(err.is_connection_loss());
        handle.join().unwrap();
    }

    #[test]
    fn acks_scheduled_on_closed_channel_are_dropped() {
        let broker = InMemoryBroker::new();
        let mut consumer = bind(&broker, "policy");
        consumer.ack_scheduler().schedule(42);
        broker.close_all_connections();
        consumer.flush_acks();
        assert_eq!(broker.stats().acked, 0);
    }
}
