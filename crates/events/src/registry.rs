//! Event registry: `{app → {event_name → Event}}` and `{event_name → [Listener]}`.
//!
//! The registry is written only during boot through [`RegistryBuilder`] and
//! then frozen into an immutable [`Registry`] shared by the publisher and
//! every subscriber worker, so lookups need no locking.
//!
//! Event names are globally unique: registering a bare name that another app
//! already owns is rejected, which keeps bare-name lookups unambiguous.
//! Registration is otherwise idempotent, and listeners may subscribe to
//! events nobody registered (they stay dormant).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use edas_core::{App, ErrorKind, Event, EventName, NameError, QualifiedEvent, SEPARATOR};

use crate::discovery::DiscoveredModule;
use crate::listener::{AtomicWrapper, Listener, ListenerDeclaration};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("invalid app `{app}`: {source}")]
    InvalidApp { app: String, source: NameError },

    #[error("invalid event `{event}` for app `{app}`: {source}")]
    InvalidEvent {
        app: String,
        event: String,
        source: NameError,
    },

    #[error("event `{event}` is already registered by app `{owner}`; rejected for app `{app}`")]
    DuplicateEvent {
        event: EventName,
        owner: App,
        app: App,
    },

    #[error("listener `{listener}` has no event name")]
    MissingEventName { listener: String },

    #[error("listener `{listener}` names a malformed event `{event}`: {source}")]
    InvalidListenerEvent {
        listener: String,
        event: String,
        source: NameError,
    },
}

impl RegistrationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Error
    }
}

/// Boot-time registry writer.
#[derive(Default)]
pub struct RegistryBuilder {
    events: BTreeMap<App, BTreeMap<EventName, Event>>,
    owners: HashMap<EventName, App>,
    listeners: BTreeMap<EventName, Vec<Listener>>,
    atomic_wrapper: Option<Arc<dyn AtomicWrapper>>,
}

impl core::fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("events", &self.events)
            .field("listeners", &self.listeners)
            .field("atomic_wrapper", &self.atomic_wrapper.is_some())
            .finish()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrapper applied to listeners declared `atomic`.
    pub fn with_atomic_wrapper(mut self, wrapper: Arc<dyn AtomicWrapper>) -> Self {
        self.atomic_wrapper = Some(wrapper);
        self
    }

    /// Register events for an app (idempotent).
    ///
    /// Every valid name is registered even if others fail; the first failure
    /// is returned after all of them have been logged.
    pub fn register_events<I, S>(&mut self, app: &str, events: I) -> Result<(), RegistrationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let app = match App::new(app) {
            Ok(app) => app,
            Err(source) => {
                let err = RegistrationError::InvalidApp {
                    app: app.to_string(),
                    source,
                };
                error!(error = %err, "event registration rejected");
                return Err(err);
            }
        };

        let mut first_error = None;
        for raw in events {
            if let Err(err) = self.register_event(&app, raw.as_ref()) {
                error!(app = %app, error = %err, "event registration rejected");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        let registered: Vec<&str> = self
            .events
            .get(&app)
            .map(|events| events.keys().map(EventName::as_str).collect())
            .unwrap_or_default();
        info!(app = %app, events = ?registered, "events registered");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn register_event(&mut self, app: &App, raw: &str) -> Result<(), RegistrationError> {
        let name = EventName::new(raw).map_err(|source| RegistrationError::InvalidEvent {
            app: app.to_string(),
            event: raw.to_string(),
            source,
        })?;

        if let Some(owner) = self.owners.get(&name) {
            if owner != app {
                return Err(RegistrationError::DuplicateEvent {
                    event: name,
                    owner: owner.clone(),
                    app: app.clone(),
                });
            }
            return Ok(());
        }

        self.owners.insert(name.clone(), app.clone());
        self.events
            .entry(app.clone())
            .or_default()
            .insert(name.clone(), Event::new(app.clone(), name));
        Ok(())
    }

    /// Validate and add one listener.
    pub fn add_listener(&mut self, declaration: ListenerDeclaration) -> Result<(), RegistrationError> {
        let ListenerDeclaration {
            event_name,
            atomic,
            name,
            handler,
        } = declaration;

        let raw = event_name.trim();
        if raw.is_empty() {
            let err = RegistrationError::MissingEventName { listener: name };
            error!(error = %err, "listener registration rejected");
            return Err(err);
        }

        let parsed = if raw.contains(SEPARATOR) {
            QualifiedEvent::parse(raw).map(|q| q.event_name().clone())
        } else {
            EventName::new(raw)
        };
        let event = match parsed {
            Ok(event) => event,
            Err(source) => {
                let err = RegistrationError::InvalidListenerEvent {
                    listener: name,
                    event: raw.to_string(),
                    source,
                };
                error!(error = %err, "listener registration rejected");
                return Err(err);
            }
        };

        let set = self.listeners.entry(event.clone()).or_default();
        if set.iter().any(|l| l.name() == name) {
            debug!(event = %event, listener = %name, "listener already registered");
            return Ok(());
        }

        let handler = match (&self.atomic_wrapper, atomic) {
            (Some(wrapper), true) => wrapper.wrap(&name, handler),
            _ => handler,
        };
        set.push(Listener::new(event, atomic, Arc::from(name), handler));
        Ok(())
    }

    /// Add every listener the discovered modules declare and log the
    /// resulting `event → [module.function]` mapping.
    ///
    /// Invalid declarations are logged and left out.
    pub fn register_listeners(&mut self, modules: &[DiscoveredModule]) {
        for module in modules {
            for declaration in module.listeners() {
                let _ = self.add_listener(declaration);
            }
        }
        info!(listeners = ?summarize(&self.listeners), "listeners registered");
    }

    /// Freeze into the read-only registry.
    pub fn freeze(self) -> Registry {
        for event in self.listeners.keys() {
            if !self.owners.contains_key(event) {
                debug!(event = %event, "listeners registered for an unknown event stay dormant");
            }
        }

        Registry {
            events: self.events,
            owners: self.owners,
            listeners: self.listeners,
        }
    }
}

/// Read-only registry, shared after boot.
#[derive(Debug, Default)]
pub struct Registry {
    events: BTreeMap<App, BTreeMap<EventName, Event>>,
    owners: HashMap<EventName, App>,
    listeners: BTreeMap<EventName, Vec<Listener>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Find a registered event by `app::event_name` or bare `event_name`.
    ///
    /// Unknown names log a warning and return `None`.
    pub fn event_lookup(&self, name: &str) -> Option<&Event> {
        let found = if name.contains(SEPARATOR) {
            QualifiedEvent::parse(name)
                .ok()
                .and_then(|q| self.events.get(q.app())?.get(q.event_name()))
        } else {
            let name = name.trim();
            self.owners
                .get(name)
                .and_then(|app| self.events.get(app)?.get(name))
        };

        if found.is_none() {
            warn!(event = %name, "unknown event");
        }
        found
    }

    /// Apps with at least one registered event.
    pub fn apps(&self) -> impl Iterator<Item = &App> {
        self.events.keys()
    }

    pub fn events_for(&self, app: &str) -> Vec<&Event> {
        self.events
            .get(app)
            .map(|events| events.values().collect())
            .unwrap_or_default()
    }

    /// Listeners subscribed to the bare `event_name`.
    pub fn listeners(&self, event_name: &str) -> &[Listener] {
        self.listeners
            .get(event_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn listener_names(&self, event_name: &str) -> Vec<&str> {
        self.listeners(event_name).iter().map(Listener::name).collect()
    }

    /// `event → [module.function]` for every listener set.
    pub fn summary(&self) -> BTreeMap<String, Vec<String>> {
        summarize(&self.listeners)
    }
}

fn summarize(listeners: &BTreeMap<EventName, Vec<Listener>>) -> BTreeMap<String, Vec<String>> {
    listeners
        .iter()
        .map(|(event, set)| {
            (
                event.to_string(),
                set.iter().map(|l| l.name().to_string()).collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use edas_core::{Message, RequestContext};

    use crate::listener::{on_event, ListenerContext, ListenerFn};

    fn noop(event: &str, function: &str) -> ListenerDeclaration {
        on_event(event, false).bind("tests", function, |_, _| Ok(()))
    }

    #[test]
    fn registration_is_idempotent() {
        let mut builder = RegistryBuilder::new();
        builder.register_events("policy", ["PolicyPublished"]).unwrap();
        builder.register_events("policy", ["PolicyPublished"]).unwrap();
        let registry = builder.freeze();

        assert_eq!(registry.events_for("policy").len(), 1);
        let event = registry.event_lookup("PolicyPublished").unwrap();
        assert_eq!(event.name(), "policy::PolicyPublished");
    }

    #[test]
    fn lookup_accepts_qualified_names() {
        let mut builder = RegistryBuilder::new();
        builder.register_events("policy", ["PolicyPublished"]).unwrap();
        let registry = builder.freeze();

        assert!(registry.event_lookup("policy::PolicyPublished").is_some());
        assert!(registry.event_lookup("vendor::PolicyPublished").is_none());
        assert!(registry.event_lookup("NotRegistered").is_none());
    }

    #[test]
    fn duplicate_names_across_apps_are_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register_events("policy", ["Published"]).unwrap();
        let err = builder
            .register_events("vendor", ["Published", "VendorCreated"])
            .unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateEvent { .. }));

        let registry = builder.freeze();
        assert_eq!(registry.event_lookup("Published").unwrap().app().as_str(), "policy");
        assert!(registry.event_lookup("VendorCreated").is_some());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut builder = RegistryBuilder::new();
        assert!(matches!(
            builder.register_events("", ["X"]),
            Err(RegistrationError::InvalidApp { .. })
        ));
        assert!(matches!(
            builder.register_events("policy", [""]),
            Err(RegistrationError::InvalidEvent { .. })
        ));
    }

    #[test]
    fn empty_listener_event_is_a_configuration_error() {
        let mut builder = RegistryBuilder::new();
        let err = builder.add_listener(noop("  ", "broken")).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::MissingEventName { listener: "tests.broken".into() }
        );
        assert_eq!(err.kind(), ErrorKind::Error);
        assert!(builder.freeze().summary().is_empty());
    }

    #[test]
    fn listeners_are_keyed_by_bare_name_and_deduplicated() {
        let mut builder = RegistryBuilder::new();
        builder.add_listener(noop("policy::PolicyPublished", "a")).unwrap();
        builder.add_listener(noop("PolicyPublished", "a")).unwrap();
        builder.add_listener(noop("PolicyPublished", "b")).unwrap();
        let registry = builder.freeze();

        assert_eq!(registry.listener_names("PolicyPublished"), vec!["tests.a", "tests.b"]);
    }

    #[test]
    fn dormant_listeners_are_kept() {
        let mut builder = RegistryBuilder::new();
        builder.add_listener(noop("NobodyPublishes", "a")).unwrap();
        let registry = builder.freeze();
        assert_eq!(registry.listeners("NobodyPublishes").len(), 1);
        assert!(registry.listeners("Other").is_empty());
    }

    struct CountingWrapper(Arc<AtomicUsize>);

    impl AtomicWrapper for CountingWrapper {
        fn wrap(&self, _listener: &str, handler: ListenerFn) -> ListenerFn {
            let count = self.0.clone();
            Arc::new(move |ctx: &ListenerContext, message: &Message| {
                count.fetch_add(1, Ordering::SeqCst);
                handler(ctx, message)
            })
        }
    }

    #[test]
    fn atomic_listeners_are_wrapped_at_registration() {
        let transactions = Arc::new(AtomicUsize::new(0));
        let mut builder =
            RegistryBuilder::new().with_atomic_wrapper(Arc::new(CountingWrapper(transactions.clone())));
        builder
            .add_listener(on_event("X", true).bind("tests", "atomic", |_, _| Ok(())))
            .unwrap();
        builder.add_listener(noop("X", "plain")).unwrap();
        let registry = builder.freeze();

        let message = Message::from_map(
            serde_json::json!({"event": "app::X"}).as_object().cloned().unwrap(),
        )
        .unwrap();
        let ctx = ListenerContext::new(
            RequestContext::default(),
            message.event().clone(),
            Arc::from("tests"),
        );
        for listener in registry.listeners("X") {
            listener.call(&ctx, &message).unwrap();
        }

        assert_eq!(transactions.load(Ordering::SeqCst), 1);
        assert!(registry.listeners("X")[0].is_atomic());
    }
}
