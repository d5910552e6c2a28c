//! Notifications fanned out by the registry.

use crate::core::resource::ResourceId;

/// A resource finished loading, was saved, or was modified
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceChanged(pub ResourceId);

/// The set of resources with unsaved changes changed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModifiedListChanged;

/// A decode started (`busy = true`) or finished
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusyStateChanged {
    pub id: ResourceId,
    pub busy: bool,
}
