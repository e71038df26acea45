//! Listener task: one listener, one message, one thread.
//!
//! Each task gets a fresh execution context: the inherited `request_id`, a
//! new `span_id`, and a `listener` tracing span carrying both. The listener's
//! outcome is translated into a log record:
//!
//! | Outcome                     | Level | Stack |
//! |-----------------------------|-------|-------|
//! | `Ok(())`                    | —     | —     |
//! | `ListenerError::Warning`    | warn  | no    |
//! | `Error`, `Base`, `Other`    | error | yes   |
//! | panic                       | error | yes   |
//!
//! Hooks' `after_run` runs on every exit path.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tracing::{error, info_span, warn};

use edas_core::{context, ErrorKind, Message, RequestContext};

use crate::listener::{Listener, ListenerContext, ListenerError, ListenerHooks};

const MAX_STACK_FRAMES: usize = 12;

/// How a listener invocation ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ListenerOutcome {
    Completed,
    Warned,
    Failed,
    Panicked,
}

pub struct ListenerTask {
    listener: Listener,
    message: Arc<Message>,
    inherited: RequestContext,
    hooks: Option<Arc<dyn ListenerHooks>>,
}

impl core::fmt::Debug for ListenerTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListenerTask")
            .field("listener", &self.listener.name())
            .field("event", self.message.event())
            .field("inherited", &self.inherited)
            .finish_non_exhaustive()
    }
}

impl ListenerTask {
    pub fn new(listener: Listener, message: Arc<Message>, inherited: RequestContext) -> Self {
        Self {
            listener,
            message,
            inherited,
            hooks: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Option<Arc<dyn ListenerHooks>>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Run on a new thread. The caller's tracing dispatcher follows the task.
    pub fn spawn(self) -> ListenerHandle {
        let listener = self.listener.name_arc();
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());

        let spawned = thread::Builder::new()
            .name("edas-listener".to_string())
            .spawn(move || tracing::dispatcher::with_default(&dispatch, || self.run()));

        match spawned {
            Ok(join) => ListenerHandle {
                listener,
                state: HandleState::Running(join),
            },
            Err(err) => {
                error!(listener = %listener, error = %err, "failed to spawn listener thread");
                ListenerHandle {
                    listener,
                    state: HandleState::Finished(ListenerOutcome::Failed),
                }
            }
        }
    }

    /// Run on the calling thread.
    pub fn run(self) -> ListenerOutcome {
        let ctx = ListenerContext::new(
            self.inherited,
            self.message.event().clone(),
            self.listener.name_arc(),
        );
        let _context = context::install(ctx.request_context().clone());

        let span = info_span!(
            "listener",
            listener = %ctx.listener(),
            event = %ctx.event(),
            request_id = ctx.request_id().unwrap_or_default(),
            span_id = %ctx.span_id(),
        );
        let _entered = span.enter();

        let hooks = self.hooks.as_deref();
        let _scope = ResourceScope { hooks, ctx: &ctx };

        let listener = &self.listener;
        let message = &self.message;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(hooks) = hooks {
                hooks.before_run(&ctx);
            }
            listener.call(&ctx, message)
        }));

        let (module, function) = split_name(listener.name());
        match result {
            Ok(Ok(())) => ListenerOutcome::Completed,
            Ok(Err(err)) if err.kind() == ErrorKind::Warning => {
                warn!(
                    module,
                    function,
                    listener = %listener.name(),
                    event = %ctx.event(),
                    error = %err,
                    "listener raised a warning"
                );
                ListenerOutcome::Warned
            }
            Ok(Err(err)) => {
                let stack = error_stack(&err);
                error!(
                    module,
                    function,
                    listener = %listener.name(),
                    event = %ctx.event(),
                    kind = %err.kind(),
                    error = %format!("{err:#}"),
                    stack = %stack,
                    "listener failed"
                );
                ListenerOutcome::Failed
            }
            Err(payload) => {
                let stack = compact_backtrace(&Backtrace::force_capture());
                error!(
                    module,
                    function,
                    listener = %listener.name(),
                    event = %ctx.event(),
                    error = %panic_message(payload.as_ref()),
                    stack = %stack,
                    "listener panicked"
                );
                ListenerOutcome::Panicked
            }
        }
    }
}

/// Releases per-task resources on every exit path.
struct ResourceScope<'a> {
    hooks: Option<&'a dyn ListenerHooks>,
    ctx: &'a ListenerContext,
}

impl Drop for ResourceScope<'_> {
    fn drop(&mut self) {
        let Some(hooks) = self.hooks else { return };
        let ctx = self.ctx;
        if panic::catch_unwind(AssertUnwindSafe(|| hooks.after_run(ctx))).is_err() {
            error!(listener = %ctx.listener(), "after_run hook panicked");
        }
    }
}

/// Handle to a spawned listener task.
#[derive(Debug)]
pub struct ListenerHandle {
    listener: Arc<str>,
    state: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Running(thread::JoinHandle<ListenerOutcome>),
    Finished(ListenerOutcome),
}

impl ListenerHandle {
    pub fn listener(&self) -> &str {
        &self.listener
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            HandleState::Running(join) => join.is_finished(),
            HandleState::Finished(_) => true,
        }
    }

    /// Wait for the task to end.
    pub fn join(self) -> ListenerOutcome {
        match self.state {
            HandleState::Running(join) => join.join().unwrap_or(ListenerOutcome::Panicked),
            HandleState::Finished(outcome) => outcome,
        }
    }
}

fn split_name(name: &str) -> (&str, &str) {
    name.rsplit_once('.').unwrap_or(("", name))
}

fn error_stack(err: &ListenerError) -> String {
    if let ListenerError::Other(inner) = err {
        if inner.backtrace().status() == BacktraceStatus::Captured {
            return compact_backtrace(inner.backtrace());
        }
    }
    compact_backtrace(&Backtrace::force_capture())
}

/// One line, innermost application frames first, runtime frames dropped.
fn compact_backtrace(backtrace: &Backtrace) -> String {
    if backtrace.status() != BacktraceStatus::Captured {
        return String::new();
    }

    backtrace
        .to_string()
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("at "))
        .filter_map(|line| line.split_once(": ").map(|(_, frame)| frame))
        .filter(|frame| !is_runtime_frame(frame))
        .take(MAX_STACK_FRAMES)
        .collect::<Vec<_>>()
        .join(" <- ")
}

fn is_runtime_frame(frame: &str) -> bool {
    const RUNTIME: [&str; 9] = [
        "std::", "core::", "alloc::", "<std::", "<core::", "<alloc::", "__rust", "rust_", "anyhow::",
    ];
    RUNTIME.iter().any(|prefix| frame.starts_with(prefix))
        || frame.starts_with("edas_events::task::")
        || frame.starts_with("<edas_events::task::")
        || frame.starts_with("tracing")
        || frame.starts_with("<tracing")
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
