//! Listener declaration (collaborator-facing).
//!
//! A listener is a plain function tagged with the event it reacts to:
//!
//! ```ignore
//! fn on_published(ctx: &ListenerContext, message: &Message) -> Result<(), ListenerError> {
//!     let policy_id = message.get_str("policy_id").ok_or_else(|| ListenerError::warning("no policy_id"))?;
//!     tracing::info!(policy_id, "refreshing action items");
//!     Ok(())
//! }
//!
//! let declaration = on_event("PolicyPublished", true).bind("policy.handlers", "on_published", on_published);
//! ```
//!
//! Declarations are collected by modules and handed to the registry at boot.
//! Validation (e.g. an empty event name) happens at registration.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use edas_core::{EdasError, ErrorKind, Message, QualifiedEvent, RequestContext};

/// Listener body.
pub type ListenerFn = Arc<dyn Fn(&ListenerContext, &Message) -> Result<(), ListenerError> + Send + Sync>;

/// Outcome a listener reports back to the core.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Expected but noteworthy; logged at warn level without a stack.
    #[error("{0}")]
    Warning(String),

    /// Contract violation; logged at error level with a stack.
    #[error("{0}")]
    Error(String),

    /// Unexpected internal condition; logged at error level with a stack.
    #[error("{0}")]
    Base(String),

    /// Anything else the listener propagated.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ListenerError {
    pub fn warning(msg: impl Into<String>) -> Self {
        Self::Warning(msg.into())
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error(msg.into())
    }

    pub fn base(msg: impl Into<String>) -> Self {
        Self::Base(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ListenerError::Warning(_) => ErrorKind::Warning,
            ListenerError::Error(_) | ListenerError::Other(_) => ErrorKind::Error,
            ListenerError::Base(_) => ErrorKind::Base,
        }
    }
}

impl From<EdasError> for ListenerError {
    fn from(err: EdasError) -> Self {
        let message = err.message().to_string();
        match err.kind() {
            ErrorKind::Warning => ListenerError::Warning(message),
            ErrorKind::Error => ListenerError::Error(message),
            ErrorKind::Base => ListenerError::Base(message),
        }
    }
}

/// Context handed to a listener invocation.
///
/// The same values are installed in the thread-local request context and on
/// the `listener` tracing span for the duration of the call.
#[derive(Debug, Clone)]
pub struct ListenerContext {
    request: RequestContext,
    span_id: Uuid,
    event: QualifiedEvent,
    listener: Arc<str>,
}

impl ListenerContext {
    pub(crate) fn new(request: RequestContext, event: QualifiedEvent, listener: Arc<str>) -> Self {
        let request = request.with_fresh_span();
        let span_id = request.span_id().unwrap_or_else(Uuid::new_v4);
        Self {
            request,
            span_id,
            event,
            listener,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request.request_id()
    }

    pub fn span_id(&self) -> Uuid {
        self.span_id
    }

    pub fn event(&self) -> &QualifiedEvent {
        &self.event
    }

    /// `module.function` of the running listener.
    pub fn listener(&self) -> &str {
        &self.listener
    }

    pub fn request_context(&self) -> &RequestContext {
        &self.request
    }
}

/// Wraps atomic listeners in a storage transaction.
///
/// The core does not know what a transaction is; the host supplies this and
/// the registry applies it once, at registration, to every listener declared
/// `atomic`.
pub trait AtomicWrapper: Send + Sync {
    fn wrap(&self, listener: &str, handler: ListenerFn) -> ListenerFn;
}

/// Per-invocation hooks.
///
/// `after_run` is guaranteed to run once per invocation, whether the listener
/// returned, failed or panicked. Hosts release per-task resources there
/// (database connections above all).
pub trait ListenerHooks: Send + Sync {
    fn before_run(&self, _ctx: &ListenerContext) {}

    fn after_run(&self, _ctx: &ListenerContext) {}
}

/// A registered listener.
#[derive(Clone)]
pub struct Listener {
    event_name: edas_core::EventName,
    atomic: bool,
    name: Arc<str>,
    handler: ListenerFn,
}

impl core::fmt::Debug for Listener {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Listener")
            .field("event_name", &self.event_name)
            .field("atomic", &self.atomic)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Listener {
    pub(crate) fn new(event_name: edas_core::EventName, atomic: bool, name: Arc<str>, handler: ListenerFn) -> Self {
        Self {
            event_name,
            atomic,
            name,
            handler,
        }
    }

    pub fn event_name(&self) -> &edas_core::EventName {
        &self.event_name
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    /// `module.function`, used only in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    pub(crate) fn call(&self, ctx: &ListenerContext, message: &Message) -> Result<(), ListenerError> {
        (self.handler)(ctx, message)
    }
}

/// Tag a listener function with the event it subscribes to.
///
/// `event_name` may be bare (`PolicyPublished`) or qualified
/// (`policy::PolicyPublished`); listeners are keyed by the bare name.
pub fn on_event(event_name: impl Into<String>, atomic: bool) -> ListenerTag {
    ListenerTag {
        event_name: event_name.into(),
        atomic,
    }
}

/// Result of [`on_event`], waiting for the function it tags.
#[derive(Debug, Clone)]
pub struct ListenerTag {
    event_name: String,
    atomic: bool,
}

impl ListenerTag {
    pub fn bind<F>(self, module: &str, function: &str, handler: F) -> ListenerDeclaration
    where
        F: Fn(&ListenerContext, &Message) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        ListenerDeclaration {
            event_name: self.event_name,
            atomic: self.atomic,
            name: format!("{module}.{function}"),
            handler: Arc::new(handler),
        }
    }
}

/// An unvalidated listener, as declared by a module.
#[derive(Clone)]
pub struct ListenerDeclaration {
    pub(crate) event_name: String,
    pub(crate) atomic: bool,
    pub(crate) name: String,
    pub(crate) handler: ListenerFn,
}

impl ListenerDeclaration {
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl core::fmt::Debug for ListenerDeclaration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListenerDeclaration")
            .field("event_name", &self.event_name)
            .field("atomic", &self.atomic)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
