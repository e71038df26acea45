//! Per-thread request context (`request_id`, `span_id`).
//!
//! The publisher reads the current `request_id` when an envelope is built; the
//! dispatcher reinstalls it from the broker's correlation id on the consumer
//! thread, and every listener task installs a snapshot plus a fresh `span_id`
//! on its own thread. Listener code also receives the context explicitly, so
//! the thread-local copy only matters for code that does not take it as an
//! argument.

use std::cell::RefCell;

use uuid::Uuid;

thread_local! {
    static CURRENT: RefCell<RequestContext> = RefCell::new(RequestContext::default());
}

/// Correlation identifiers of the unit of work running on a thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    request_id: Option<String>,
    span_id: Option<Uuid>,
}

impl RequestContext {
    pub fn new(request_id: Option<String>) -> Self {
        Self {
            request_id,
            span_id: None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn span_id(&self) -> Option<Uuid> {
        self.span_id
    }

    /// Same request, new span.
    pub fn with_fresh_span(&self) -> Self {
        Self {
            request_id: self.request_id.clone(),
            span_id: Some(Uuid::new_v4()),
        }
    }
}

/// Snapshot of the context installed on the calling thread.
pub fn current() -> RequestContext {
    CURRENT.with(|c| c.borrow().clone())
}

/// The `request_id` installed on the calling thread, if any.
pub fn request_id() -> Option<String> {
    CURRENT.with(|c| c.borrow().request_id.clone())
}

/// Replace the `request_id` on the calling thread, keeping the span.
pub fn set_request_id(request_id: Option<String>) {
    CURRENT.with(|c| c.borrow_mut().request_id = request_id);
}

/// Install `context` on the calling thread until the guard is dropped.
pub fn install(context: RequestContext) -> ContextGuard {
    let previous = CURRENT.with(|c| c.replace(context));
    ContextGuard {
        previous: Some(previous),
    }
}

/// Restores the previously installed context on drop.
#[derive(Debug)]
#[must_use = "the context is uninstalled when the guard is dropped"]
pub struct ContextGuard {
    previous: Option<RequestContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            CURRENT.with(|c| *c.borrow_mut() = previous);
        }
    }
}
