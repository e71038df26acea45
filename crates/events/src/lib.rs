//! Event-driven app substrate: registry, publisher, subscriber workers and
//! per-listener tasks over a fanout broker.

pub mod broker;
pub mod discovery;
pub mod dispatcher;
pub mod listener;
pub mod publisher;
pub mod registry;
pub mod runtime;
pub mod task;
pub mod worker;


pub use broker::{BrokerClient, BrokerError, ClientSettings, Connector, Delivery, InMemoryBroker};
pub use discovery::{DiscoveredModule, DiscoveryReport, EdasModule, ModuleCatalog};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use listener::{
    on_event, AtomicWrapper, ListenerContext, ListenerDeclaration, ListenerError, ListenerFn, ListenerHooks,
};
pub use publisher::Publisher;
pub use registry::{Registry, RegistryBuilder, RegistrationError};
pub use runtime::{BootError, Edas, EdasBuilder};
pub use task::{ListenerHandle, ListenerOutcome};
pub use worker::{RestartPolicy, SubscriberWorker, WorkerHandle};
