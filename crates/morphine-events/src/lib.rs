//! Morphine Events - namespaced publish/subscribe for extensions.
//!
//! This crate provides:
//! - [`Event`] values with topic strings and JSON payloads
//! - A [`SubscriberRegistry`] of synchronous, owner-tagged subscriptions
//! - An [`EventBus`] that fans each event out to the registry and to async
//!   [`EventReceiver`]s
//!
//! # Topics
//!
//! Extension-scoped topics have the form `extension:<id>:<name>` and are only
//! delivered to subscribers of that exact string. Anything else is a global
//! topic; the host publishes `extensionLoaded` and `extensionUnloaded` there.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use morphine_events::{Event, EventBus, FilterSubscriber, scoped_topic};
//! use serde_json::json;
//!
//! let bus = EventBus::new();
//! let handle = bus.registry().register(
//!     scoped_topic("B", "ping"),
//!     Some("B"),
//!     Arc::new(FilterSubscriber::new("b-ping", |event: &Event| {
//!         assert_eq!(event.payload["from"], "A");
//!     })),
//! );
//!
//! assert_eq!(bus.publish(Event::direct("A", "B", "ping", json!({ "x": 1 }))), 1);
//! assert!(bus.registry().unregister(handle));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod bus;
mod event;
mod subscriber;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventReceiver};
pub use event::{
    EXTENSION_LOADED, EXTENSION_NAMESPACE, EXTENSION_UNLOADED, Event, EventMetadata, scoped_topic,
};
pub use subscriber::{EventSubscriber, FilterSubscriber, SubscriberId, SubscriberRegistry};
