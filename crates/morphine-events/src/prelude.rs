//! Prelude module - commonly used types for convenient import.
//!
//! Use `use morphine_events::prelude::*;` to import all essential types.

// Event bus
pub use crate::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventReceiver};

// Events
pub use crate::{EXTENSION_LOADED, EXTENSION_UNLOADED, Event, EventMetadata, scoped_topic};

// Subscriber system
pub use crate::{EventSubscriber, FilterSubscriber, SubscriberId, SubscriberRegistry};
