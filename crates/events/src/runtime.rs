//! Boot sequence and process-level handle.
//!
//! ```text
//! discover modules
//!   → register each module's events
//!   → register every module's listeners
//!   → freeze the registry
//!   → connect the publisher (degraded boot if the broker is down)
//!   → spawn one subscriber worker per registered app
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let edas = Edas::builder(Arc::new(broker))
//!     .catalog(ModuleCatalog::new(["policy", "vendor"]).provide_module("policy", Arc::new(PolicyEdas)))
//!     .init()?;
//!
//! let envelope = Envelope::build(edas.event_lookup("policy::PolicyPublished"))?
//!     .field("policy_id", "P-7")
//!     .finish();
//! edas.submit_event(&envelope);
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use edas_core::{Envelope, ErrorKind, Event};

use crate::broker::{ClientSettings, Connector};
use crate::discovery::{DiscoveryReport, ModuleCatalog};
use crate::dispatcher::Dispatcher;
use crate::listener::{AtomicWrapper, ListenerHooks};
use crate::publisher::Publisher;
use crate::registry::{Registry, RegistryBuilder};
use crate::worker::{RestartPolicy, SubscriberWorker, WorkerHandle};

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BootError {
    #[error("failed to spawn subscriber worker for `{app}`: {source}")]
    SpawnWorker {
        app: String,
        #[source]
        source: std::io::Error,
    },
}

impl BootError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Error
    }
}

/// Boot configuration.
pub struct EdasBuilder {
    connector: Arc<dyn Connector>,
    catalog: ModuleCatalog,
    extra_events: Vec<(String, Vec<String>)>,
    settings: ClientSettings,
    restart: RestartPolicy,
    hooks: Option<Arc<dyn ListenerHooks>>,
    atomic_wrapper: Option<Arc<dyn AtomicWrapper>>,
    startup_timeout: Duration,
}

impl core::fmt::Debug for EdasBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EdasBuilder")
            .field("catalog", &self.catalog)
            .field("extra_events", &self.extra_events)
            .field("settings", &self.settings)
            .field("restart", &self.restart)
            .field("startup_timeout", &self.startup_timeout)
            .finish_non_exhaustive()
    }
}

impl EdasBuilder {
    pub fn catalog(mut self, catalog: ModuleCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Register events for an app outside of module discovery.
    pub fn register_events<I, S>(mut self, app: impl Into<String>, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_events
            .push((app.into(), events.into_iter().map(Into::into).collect()));
        self
    }

    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn ListenerHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn atomic_wrapper(mut self, wrapper: Arc<dyn AtomicWrapper>) -> Self {
        self.atomic_wrapper = Some(wrapper);
        self
    }

    /// How long `init` waits for each subscriber worker to start consuming.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Boot. Registration problems are logged and leave the offending event
    /// or listener out; only a failure to start a worker thread is fatal.
    pub fn init(self) -> Result<Edas, BootError> {
        let discovery = self.catalog.discover();

        let mut builder = RegistryBuilder::new();
        if let Some(wrapper) = self.atomic_wrapper {
            builder = builder.with_atomic_wrapper(wrapper);
        }
        for module in &discovery.modules {
            let _ = builder.register_events(module.app().as_str(), module.events());
        }
        for (app, events) in &self.extra_events {
            let _ = builder.register_events(app, events);
        }
        builder.register_listeners(&discovery.modules);
        let registry = Arc::new(builder.freeze());

        let publisher = Publisher::connect(self.connector.clone(), self.settings.clone());

        let mut dispatcher = Dispatcher::new(registry.clone());
        if let Some(hooks) = self.hooks {
            dispatcher = dispatcher.with_hooks(hooks);
        }
        let dispatcher = Arc::new(dispatcher);

        let mut workers: Vec<WorkerHandle> = Vec::new();
        for app in registry.apps() {
            let spawned = SubscriberWorker::spawn(
                app.clone(),
                self.connector.clone(),
                self.settings.clone(),
                self.restart,
                dispatcher.clone(),
            );
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    error!(app = %app, error = %source, "failed to spawn subscriber worker");
                    for worker in workers {
                        worker.shutdown();
                    }
                    publisher.close();
                    return Err(BootError::SpawnWorker {
                        app: app.to_string(),
                        source,
                    });
                }
            }
        }

        for worker in &workers {
            if !worker.wait_ready(self.startup_timeout) {
                warn!(app = %worker.app(), "subscriber worker not consuming yet; continuing boot");
            }
        }

        info!(
            apps = ?registry.apps().map(ToString::to_string).collect::<Vec<_>>(),
            workers = workers.len(),
            publisher_connected = publisher.is_connected(),
            "edas started"
        );

        Ok(Edas {
            registry,
            publisher,
            workers,
            discovery: discovery.report,
        })
    }
}

/// A booted event substrate.
#[derive(Debug)]
pub struct Edas {
    registry: Arc<Registry>,
    publisher: Publisher,
    workers: Vec<WorkerHandle>,
    discovery: DiscoveryReport,
}

impl Edas {
    pub fn builder(connector: Arc<dyn Connector>) -> EdasBuilder {
        EdasBuilder {
            connector,
            catalog: ModuleCatalog::default(),
            extra_events: Vec::new(),
            settings: ClientSettings::default(),
            restart: RestartPolicy::default(),
            hooks: None,
            atomic_wrapper: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn discovery(&self) -> &DiscoveryReport {
        &self.discovery
    }

    /// See [`Registry::event_lookup`].
    pub fn event_lookup(&self, name: &str) -> Option<&Event> {
        self.registry.event_lookup(name)
    }

    /// See [`Publisher::submit_event`].
    pub fn submit_event(&self, envelope: &Envelope) -> bool {
        self.publisher.submit_event(envelope)
    }

    /// Stop every subscriber worker, then close the publisher.
    ///
    /// Listener tasks still running are not waited for.
    pub fn shutdown(self) {
        let count = self.workers.len();
        for worker in self.workers {
            worker.shutdown();
        }
        self.publisher.close();
        info!(workers = count, "edas stopped");
    }
}
