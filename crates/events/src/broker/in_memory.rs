//! In-memory fanout broker for tests/dev.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{BrokerChannel, BrokerError, ClientSettings, Connector, Delivery, PublishProperties};

/// In-process broker with fanout exchanges and durable queues.
///
/// - Fan-out: every queue bound to an exchange gets its own copy
/// - Prefetch: a consumer holds at most `prefetch` unacknowledged deliveries
/// - Redelivery: unacknowledged deliveries go back to the head of their queue
///   (flagged `redelivered`) when the owning connection closes
/// - Fault injection for reconnect paths
///
/// Cloning yields another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, BTreeSet<String>>,
    queues: HashMap<String, QueueState>,
    open: HashSet<u64>,
    next_connection: u64,
    next_tag: u64,
    fail_connects: usize,
    fail_publishes: usize,
    stats: BrokerStats,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, (u64, StoredMessage)>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    correlation_id: Option<String>,
    body: Vec<u8>,
    redelivered: bool,
}

/// Counters exposed for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections_opened: u64,
    pub publish_attempts: u64,
    pub published: u64,
    pub acked: u64,
    pub redelivered: u64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().map(|s| s.stats.clone()).unwrap_or_default()
    }

    /// `(ready, unacked)` message counts of a queue.
    pub fn queue_depth(&self, queue: &str) -> (usize, usize) {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| (q.ready.len(), q.unacked.len())))
            .unwrap_or((0, 0))
    }

    /// Queues currently bound to `exchange`.
    pub fn bindings(&self, exchange: &str) -> Vec<String> {
        self.lock()
            .ok()
            .and_then(|s| s.exchanges.get(exchange).map(|q| q.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Force-close every open connection, as a broker restart would.
    pub fn close_all_connections(&self) {
        if let Ok(mut state) = self.lock() {
            let open: Vec<u64> = state.open.drain().collect();
            for connection in open {
                release_unacked(&mut state, connection);
            }
        }
        self.shared.available.notify_all();
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: usize) {
        if let Ok(mut state) = self.lock() {
            state.fail_connects = n;
        }
    }

    /// Drop the connection on each of the next `n` publishes.
    pub fn fail_next_publishes(&self, n: usize) {
        if let Ok(mut state) = self.lock() {
            state.fail_publishes = n;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.shared
            .state
            .lock()
            .map_err(|_| BrokerError::Protocol("broker state poisoned".to_string()))
    }
}

impl Connector for InMemoryBroker {
    fn connect(&self, settings: &ClientSettings) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let mut state = self.lock()?;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BrokerError::Connect("connection refused".to_string()));
        }

        state.next_connection += 1;
        let connection = state.next_connection;
        state.open.insert(connection);
        state.stats.connections_opened += 1;

        Ok(Box::new(InMemoryChannel {
            broker: self.clone(),
            connection,
            prefetch: settings.prefetch.max(1) as usize,
            consuming: None,
        }))
    }
}

/// Channel handed out by [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    connection: u64,
    prefetch: usize,
    consuming: Option<String>,
}

impl InMemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        let state = self.broker.lock()?;
        if !state.open.contains(&self.connection) {
            return Err(BrokerError::ConnectionClosed(
                "connection closed by broker".to_string(),
            ));
        }
        Ok(state)
    }

    /// Channel-level protocol error: the broker closes the channel.
    fn fail_channel(&self, mut state: MutexGuard<'_, State>, reason: String) -> BrokerError {
        state.open.remove(&self.connection);
        release_unacked(&mut state, self.connection);
        drop(state);
        self.broker.shared.available.notify_all();
        BrokerError::Protocol(reason)
    }
}

impl BrokerChannel for InMemoryChannel {
    fn declare_exchange(&mut self, exchange: &str) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        state.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    fn declare_queue_and_bind(&mut self, exchange: &str, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(self.fail_channel(state, format!("NOT_FOUND - no exchange '{exchange}'")));
        }
        state.queues.entry(queue.to_string()).or_default();
        if let Some(bound) = state.exchanges.get_mut(exchange) {
            bound.insert(queue.to_string());
        }
        Ok(())
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        state.stats.publish_attempts += 1;

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            state.open.remove(&self.connection);
            release_unacked(&mut state, self.connection);
            drop(state);
            self.broker.shared.available.notify_all();
            return Err(BrokerError::StreamLost("connection reset by peer".to_string()));
        }

        let bound = state.exchanges.get(exchange).cloned();
        let Some(bound) = bound else {
            return Err(self.fail_channel(state, format!("NOT_FOUND - no exchange '{exchange}'")));
        };

        if bound.is_empty() && properties.mandatory {
            return Err(BrokerError::Unroutable {
                exchange: exchange.to_string(),
            });
        }

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            correlation_id: properties.correlation_id.clone(),
            body: body.to_vec(),
            redelivered: false,
        };
        for queue in bound {
            state
                .queues
                .entry(queue)
                .or_default()
                .ready
                .push_back(message.clone());
        }
        state.stats.published += 1;
        drop(state);

        self.broker.shared.available.notify_all();
        Ok(())
    }

    fn start_consume(&mut self, queue: &str) -> Result<(), BrokerError> {
        let state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(self.fail_channel(state, format!("NOT_FOUND - no queue '{queue}'")));
        }
        drop(state);
        self.consuming = Some(queue.to_string());
        Ok(())
    }

    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let queue = self
            .consuming
            .clone()
            .ok_or_else(|| BrokerError::Protocol("channel is not consuming".to_string()))?;
        let deadline = Instant::now() + timeout;
        let mut state = self.open_state()?;

        loop {
            if !state.open.contains(&self.connection) {
                return Err(BrokerError::ConnectionClosed(
                    "connection closed by broker".to_string(),
                ));
            }

            let connection = self.connection;
            let prefetch = self.prefetch;
            let next = state.queues.get_mut(&queue).and_then(|q| {
                let in_flight = q.unacked.values().filter(|(c, _)| *c == connection).count();
                if in_flight < prefetch { q.ready.pop_front() } else { None }
            });

            if let Some(message) = next {
                state.next_tag += 1;
                let tag = state.next_tag;
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.unacked.insert(tag, (connection, message.clone()));
                }
                return Ok(Some(Delivery {
                    delivery_tag: tag,
                    exchange: message.exchange,
                    routing_key: message.routing_key,
                    redelivered: message.redelivered,
                    correlation_id: message.correlation_id,
                    body: message.body,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            state = self
                .broker
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| BrokerError::Protocol("broker state poisoned".to_string()))?
                .0;
        }
    }

    fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        let removed = state
            .queues
            .values_mut()
            .find_map(|q| q.unacked.remove(&delivery_tag));

        match removed {
            Some(_) => {
                state.stats.acked += 1;
                drop(state);
                self.broker.shared.available.notify_all();
                Ok(())
            }
            None => Err(self.fail_channel(
                state,
                format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"),
            )),
        }
    }

    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .map(|s| s.open.contains(&self.connection))
            .unwrap_or(false)
    }

    fn close(&mut self) {
        if let Ok(mut state) = self.broker.lock() {
            if state.open.remove(&self.connection) {
                release_unacked(&mut state, self.connection);
            }
        }
        self.broker.shared.available.notify_all();
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Put a connection's unacknowledged deliveries back at the head of their queues.
fn release_unacked(state: &mut State, connection: u64) {
    let mut released = 0;
    for queue in state.queues.values_mut() {
        let mut tags: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, (c, _))| *c == connection)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some((_, mut message)) = queue.unacked.remove(&tag) {
                message.redelivered = true;
                queue.ready.push_front(message);
                released += 1;
            }
        }
    }
    state.stats.redelivered += released;
}
