//! One subscriber worker thread per app, restarted with backoff.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use edas_core::App;

use crate::broker::{BrokerClient, BrokerError, ClientSettings, ConsumeExit, Connector};
use crate::dispatcher::Dispatcher;

/// What a subscriber worker does after its consume loop fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Log and stop; the app receives nothing until the host restarts.
    Never,
    /// Reconnect after `initial`, doubling up to `max` between failed
    /// attempts. The delay resets once a connection is established.
    Backoff { initial: Duration, max: Duration },
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart attempt `attempt` (0-based), or `None` to stop.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match *self {
            RestartPolicy::Never => None,
            RestartPolicy::Backoff { initial, max } => {
                let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
                Some(initial.saturating_mul(factor).min(max))
            }
        }
    }
}

/// Handle to control and join a subscriber worker.
#[derive(Debug)]
pub struct WorkerHandle {
    app: App,
    shutdown: mpsc::Sender<()>,
    ready: mpsc::Receiver<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn app(&self) -> &App {
        &self.app
    }

    /// Wait until the worker's queue is declared, bound and being consumed.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        self.ready.recv_timeout(timeout).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(thread::JoinHandle::is_finished)
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// Listener tasks already spawned by the worker keep running.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// One consumer per app: queue `app` bound to exchange `app`, every delivery
/// handed to the dispatcher.
#[derive(Debug)]
pub struct SubscriberWorker;

impl SubscriberWorker {
    /// Spawn the worker thread for `app`. The caller's tracing dispatcher
    /// follows the worker (and the listener tasks it spawns).
    pub fn spawn(
        app: App,
        connector: Arc<dyn Connector>,
        settings: ClientSettings,
        restart: RestartPolicy,
        dispatcher: Arc<Dispatcher>,
    ) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());

        let worker_app = app.clone();
        let join = thread::Builder::new()
            .name(format!("edas-subscriber-{app}"))
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let client = BrokerClient::new(connector, settings);
                    worker_loop(&worker_app, client, &shutdown_rx, &ready_tx, restart, &dispatcher);
                })
            })?;

        Ok(WorkerHandle {
            app,
            shutdown: shutdown_tx,
            ready: ready_rx,
            join: Some(join),
        })
    }
}

fn worker_loop(
    app: &App,
    mut client: BrokerClient,
    shutdown_rx: &mpsc::Receiver<()>,
    ready_tx: &mpsc::Sender<()>,
    restart: RestartPolicy,
    dispatcher: &Dispatcher,
) {
    let mut attempt = 0u32;

    loop {
        match session(app, &mut client, shutdown_rx, ready_tx, dispatcher, &mut attempt) {
            Ok(ConsumeExit::Shutdown) => {
                info!(app = %app, "subscriber worker stopped");
                break;
            }
            Err(err) => {
                error!(app = %app, error = %err, kind = %err.kind(), "subscriber worker failed");
                client.close();

                let Some(delay) = restart.delay(attempt) else {
                    warn!(app = %app, "subscriber worker not restarted");
                    break;
                };
                attempt = attempt.saturating_add(1);
                info!(app = %app, delay_ms = delay.as_millis() as u64, attempt, "restarting subscriber worker");

                match shutdown_rx.recv_timeout(delay) {
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        }
    }

    client.close();
}

fn session(
    app: &App,
    client: &mut BrokerClient,
    shutdown_rx: &mpsc::Receiver<()>,
    ready_tx: &mpsc::Sender<()>,
    dispatcher: &Dispatcher,
    attempt: &mut u32,
) -> Result<ConsumeExit, BrokerError> {
    client.connect()?;
    client.declare_queue_and_bind(app.as_str(), app.as_str())?;
    *attempt = 0;

    // Nobody waiting is fine; readiness is only a courtesy to the host.
    let _ = ready_tx.send(());

    client.consume(app.as_str(), shutdown_rx, |delivery| {
        dispatcher.dispatch(&delivery);
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::listener::on_event;
    use crate::registry::RegistryBuilder;

    fn settings() -> ClientSettings {
        ClientSettings::default().with_consume_poll(Duration::from_millis(10))
    }

    fn fast_restart() -> RestartPolicy {
        RestartPolicy::Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.delay(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(4), Some(Duration::from_secs(16)));
        assert_eq!(policy.delay(5), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(40), Some(Duration::from_secs(30)));
        assert_eq!(RestartPolicy::Never.delay(0), None);
    }

    #[test]
    fn consumes_dispatches_and_acks() {
        let broker = InMemoryBroker::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let mut builder = RegistryBuilder::new();
        builder
            .add_listener(on_event("PolicyPublished", false).bind("tests", "record", move |_, msg| {
                tx.lock().unwrap().send(msg.get_str("policy_id").map(str::to_string)).unwrap();
                Ok(())
            }))
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(builder.freeze())));

        let handle = SubscriberWorker::spawn(
            App::new("policy").unwrap(),
            Arc::new(broker.clone()),
            settings(),
            fast_restart(),
            dispatcher,
        )
        .unwrap();
        assert!(handle.wait_ready(Duration::from_secs(2)));
        assert_eq!(broker.bindings("policy"), vec!["policy"]);

        let mut publisher = BrokerClient::new(Arc::new(broker.clone()), settings());
        let body = json!({"event": "policy::PolicyPublished", "policy_id": "P-1"}).to_string();
        publisher.publish(body.as_bytes(), "policy", "", Some("req-1")).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.as_deref(), Some("P-1"));

        handle.shutdown();
        assert_eq!(broker.queue_depth("policy"), (0, 0));
        assert_eq!(broker.stats().acked, 1);
    }

    #[test]
    fn restarts_after_losing_the_connection() {
        let broker = InMemoryBroker::new();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(RegistryBuilder::new().freeze())));
        let handle = SubscriberWorker::spawn(
            App::new("policy").unwrap(),
            Arc::new(broker.clone()),
            settings(),
            fast_restart(),
            dispatcher,
        )
        .unwrap();
        assert!(handle.wait_ready(Duration::from_secs(2)));

        broker.close_all_connections();
        assert!(handle.wait_ready(Duration::from_secs(2)));
        assert!(broker.stats().connections_opened >= 2);

        handle.shutdown();
    }

    #[test]
    fn never_policy_stops_the_worker() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(RegistryBuilder::new().freeze())));
        let handle = SubscriberWorker::spawn(
            App::new("policy").unwrap(),
            Arc::new(broker.clone()),
            settings(),
            RestartPolicy::Never,
            dispatcher,
        )
        .unwrap();

        assert!(!handle.wait_ready(Duration::from_millis(200)));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !handle.is_finished() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.is_finished());
        handle.shutdown();
    }
}
