//! Task lifecycle events and the in-process bus that distributes them.
//!
//! External notification dispatchers subscribe here; the core never formats
//! notifications itself.

pub mod bus;
pub mod in_memory_bus;
pub mod lifecycle;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use lifecycle::{LifecycleEvent, LifecycleEventKind};
