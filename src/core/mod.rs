//! Core modules - registry, resources, undo, events, workers
//!
//! Independent of any UI: views talk to the registry and subscribe to its events.

pub mod event_bus;
pub mod registry;
pub mod registry_events;
pub mod resource;
pub mod undo;
pub mod workers;

// Re-exports for convenience
pub use event_bus::EventBus;
pub use registry::{CacheStats, Registry, Resolution};
pub use resource::{Granularity, LoadState, Resource, ResourceError, ResourceHandle, ResourceId};
pub use undo::{UndoGroup, UndoScope};
pub use workers::Workers;
