//! `edas-core` — value types of the event-driven architecture substrate.
//!
//! This crate contains **pure** building blocks shared by the registry, the
//! publisher and the dispatcher (no IO, no threads).

pub mod context;
pub mod envelope;
pub mod error;
pub mod event;
pub mod message;

pub use context::{ContextGuard, RequestContext};
pub use envelope::{Envelope, EnvelopeBuilder, EnvelopeError, RESERVED_FIELDS};
pub use error::{EdasError, EdasResult, ErrorKind, NameError};
pub use event::{App, Event, EventName, QualifiedEvent, SEPARATOR};
pub use message::{Message, MessageError};
