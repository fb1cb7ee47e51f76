//! In-process multi-channel pub/sub.

mod bus;

pub use bus::{Event, EventBus, Unsubscribe};
