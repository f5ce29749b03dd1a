//! `jobforge-core`: building blocks shared by every job-core component.
//!
//! This crate holds **pure** primitives (no IO, no threads): identifiers,
//! the priority value object, the error taxonomy, optimistic version
//! expectations and the clock abstraction.

pub mod clock;
pub mod error;
pub mod id;
pub mod priority;
pub mod value_object;
pub mod version;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use id::{LeaseId, SagaId, TaskId, WorkerId};
pub use priority::Priority;
pub use value_object::ValueObject;
pub use version::ExpectedVersion;
