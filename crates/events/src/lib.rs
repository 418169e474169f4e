//! Channel-keyed publish/subscribe mechanics.
//!
//! Transport-agnostic: the in-memory bus lives here, network-backed buses
//! live in `canopy-infra`.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
