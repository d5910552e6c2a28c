//! imgcache - image document cache with staged loading
//!
//! Re-exports all modules for use by the binary target.

// Core (registry, resources, undo, events, workers)
pub mod core;

// App modules
pub mod cli;
pub mod config;
pub mod entities;

// Re-export commonly used types from core
pub use core::event_bus::{downcast_event, BoxedEvent, EventBus};
pub use core::registry::{CacheStats, Registry, Resolution};
pub use core::registry_events::{BusyStateChanged, ModifiedListChanged, ResourceChanged};
pub use core::resource::{Granularity, LoadState, ResourceError, ResourceHandle, ResourceId};

// Re-export entities
pub use entities::{Decoder, Edit, ImageMetadata, ImageSaver, Saver};
