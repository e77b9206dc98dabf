//! Observability
//!
//! Structured JSON logging with typed events. Observability never fails the
//! operation that emits it.

mod events;
mod logger;

pub use events::Event;
pub use logger::{Logger, Severity};
