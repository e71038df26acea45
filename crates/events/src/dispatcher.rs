//! Consume callback: restore context, decode, fan out to listeners.
//!
//! ```text
//! Delivery
//!   ↓
//! 1. Install the correlation id as `request_id` on the consumer thread
//!   ↓
//! 2. Decode the JSON body into a generic map
//!   ↓
//! 3. Read `event`, keep the suffix of `app::event_name`
//!   ↓
//! 4. Look up listeners (none → done)
//!   ↓
//! 5. Spawn one listener task per listener with a context snapshot
//! ```
//!
//! The dispatcher never waits for listeners; the broker client acknowledges
//! the delivery as soon as `dispatch` returns, whatever the listeners do.

use std::sync::Arc;

use tracing::{debug, error};

use edas_core::{context, Message, QualifiedEvent};

use crate::broker::Delivery;
use crate::listener::ListenerHooks;
use crate::registry::Registry;
use crate::task::{ListenerHandle, ListenerOutcome, ListenerTask};

/// What one dispatch started.
#[derive(Debug, Default)]
pub struct DispatchReport {
    event: Option<QualifiedEvent>,
    handles: Vec<ListenerHandle>,
}

impl DispatchReport {
    /// Event of the delivery, when it decoded.
    pub fn event(&self) -> Option<&QualifiedEvent> {
        self.event.as_ref()
    }

    pub fn spawned(&self) -> usize {
        self.handles.len()
    }

    pub fn handles(&self) -> &[ListenerHandle] {
        &self.handles
    }

    /// Wait for every spawned listener (hosts and tests only; the consume
    /// loop never does this).
    pub fn join_all(self) -> Vec<ListenerOutcome> {
        self.handles.into_iter().map(ListenerHandle::join).collect()
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    hooks: Option<Arc<dyn ListenerHooks>>,
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            hooks: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ListenerHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one delivery. Never blocks on listeners, never fails.
    pub fn dispatch(&self, delivery: &Delivery) -> DispatchReport {
        context::set_request_id(delivery.correlation_id.clone());

        let message = match Message::decode(&delivery.body) {
            Ok(message) => Arc::new(message),
            Err(err) => {
                error!(
                    delivery_tag = delivery.delivery_tag,
                    exchange = %delivery.exchange,
                    error = %err,
                    "undecodable delivery dropped"
                );
                return DispatchReport::default();
            }
        };

        let event = message.event().clone();
        let listeners = self.registry.listeners(message.event_name().as_str());
        if listeners.is_empty() {
            debug!(event = %event, "no listeners");
            return DispatchReport {
                event: Some(event),
                handles: Vec::new(),
            };
        }

        let snapshot = context::current();
        let handles = listeners
            .iter()
            .map(|listener| {
                debug!(event = %event, listener = %listener.name(), "spawning listener");
                ListenerTask::new(listener.clone(), message.clone(), snapshot.clone())
                    .with_hooks(self.hooks.clone())
                    .spawn()
            })
            .collect();

        DispatchReport {
            event: Some(event),
            handles,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::listener::{on_event, ListenerError};
    use crate::registry::RegistryBuilder;

    fn delivery(body: serde_json::Value, correlation_id: Option<&str>) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: "policy".into(),
            routing_key: String::new(),
            redelivered: false,
            correlation_id: correlation_id.map(str::to_string),
            body: body.to_string().into_bytes(),
        }
    }

    #[test]
    fn fans_out_the_same_message_to_every_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut builder = RegistryBuilder::new();
        for name in ["a", "b", "c"] {
            let sink = seen.clone();
            builder
                .add_listener(on_event("PolicyPublished", false).bind("tests", name, move |ctx, msg| {
                    sink.lock().unwrap().push((
                        ctx.listener().to_string(),
                        msg.body().clone(),
                        ctx.request_id().map(str::to_string),
                    ));
                    Ok(())
                }))
                .unwrap();
        }
        let dispatcher = Dispatcher::new(Arc::new(builder.freeze()));

        let body = json!({"event": "policy::PolicyPublished", "policy_id": "P-7"});
        let report = dispatcher.dispatch(&delivery(body.clone(), Some("req-1")));
        assert_eq!(report.spawned(), 3);
        assert!(report.join_all().iter().all(|o| *o == ListenerOutcome::Completed));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        for (_, map, request_id) in seen.iter() {
            assert_eq!(&serde_json::Value::Object(map.clone()), &body);
            assert_eq!(request_id.as_deref(), Some("req-1"));
        }
    }

    #[test]
    fn correlation_id_is_installed_on_the_consumer_thread() {
        let dispatcher = Dispatcher::new(Arc::new(RegistryBuilder::new().freeze()));
        let report = dispatcher.dispatch(&delivery(json!({"event": "policy::Nobody"}), Some("req-3")));
        assert_eq!(report.spawned(), 0);
        assert_eq!(report.event().map(ToString::to_string).as_deref(), Some("policy::Nobody"));
        assert_eq!(context::request_id().as_deref(), Some("req-3"));
        context::set_request_id(None);
    }

    #[test]
    fn failing_listener_does_not_stop_the_others() {
        let mut builder = RegistryBuilder::new();
        builder
            .add_listener(on_event("X", false).bind("tests", "l1", |_, _| Err(ListenerError::error("nope"))))
            .unwrap();
        builder
            .add_listener(on_event("X", false).bind("tests", "l2", |_, _| Ok(())))
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(builder.freeze()));

        let outcomes = dispatcher
            .dispatch(&delivery(json!({"event": "tests::X"}), None))
            .join_all();
        assert_eq!(outcomes, vec![ListenerOutcome::Failed, ListenerOutcome::Completed]);
    }

    #[test]
    fn undecodable_deliveries_are_dropped() {
        let dispatcher = Dispatcher::new(Arc::new(RegistryBuilder::new().freeze()));
        let mut bad = delivery(json!({}), None);
        bad.body = b"\xff not json".to_vec();
        let report = dispatcher.dispatch(&bad);
        assert!(report.event().is_none());
        assert_eq!(report.spawned(), 0);
    }

    #[test]
    fn undecodable_delivery_still_replaces_the_previous_request_id() {
        let dispatcher = Dispatcher::new(Arc::new(RegistryBuilder::new().freeze()));
        dispatcher.dispatch(&delivery(json!({"event": "policy::Nobody"}), Some("req-A")));
        assert_eq!(context::request_id().as_deref(), Some("req-A"));

        let mut bad = delivery(json!({}), Some("req-B"));
        bad.body = b"{truncated".to_vec();
        dispatcher.dispatch(&bad);
        assert_eq!(context::request_id().as_deref(), Some("req-B"));
        context::set_request_id(None);
    }
}
