//! Per-resource undo scopes and the group that aggregates them.
//!
//! Every resource gets exactly one `UndoScope` at construction. The group only
//! keeps weak references, so a scope disappears together with its resource.
//! Scopes are independent: there is no ordering across resources, the group
//! just tells the UI which scope belongs to the currently active resource.

use std::sync::{Arc, Mutex, RwLock, Weak};

use log::debug;
use uuid::Uuid;

use crate::core::resource::ResourceId;

#[derive(Debug, Default)]
struct ScopeState {
    labels: Vec<String>,
    /// Stack depth at last save/load
    clean_index: usize,
}

/// Undo history attached to a single resource
#[derive(Debug)]
pub struct UndoScope {
    id: Uuid,
    resource: ResourceId,
    state: Mutex<ScopeState>,
}

impl UndoScope {
    fn new(resource: ResourceId) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource,
            state: Mutex::new(ScopeState::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Record an applied edit
    pub fn push(&self, label: impl Into<String>) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .labels
            .push(label.into());
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels in the order the edits were applied
    pub fn labels(&self) -> Vec<String> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).labels.clone()
    }

    /// True when the current stack depth matches the last saved state
    pub fn is_clean(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.clean_index == state.labels.len()
    }

    /// Mark current depth as the saved state
    pub fn set_clean(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.clean_index = state.labels.len();
    }

    /// Drop all history (after a reload replaced the payload)
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.labels.clear();
        state.clean_index = 0;
    }
}

/// Cross-resource registry of undo scopes
#[derive(Debug, Default)]
pub struct UndoGroup {
    scopes: RwLock<Vec<Weak<UndoScope>>>,
    active: RwLock<Option<ResourceId>>,
}

impl UndoGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scope for `resource` and register it. The caller owns the
    /// only strong reference.
    pub fn create_scope(&self, resource: ResourceId) -> Arc<UndoScope> {
        let scope = Arc::new(UndoScope::new(resource));
        let mut scopes = self.scopes.write().unwrap_or_else(|e| e.into_inner());
        scopes.retain(|s| s.strong_count() > 0);
        scopes.push(Arc::downgrade(&scope));
        debug!("Undo scope {} registered for {}", scope.id, scope.resource);
        scope
    }

    /// Select which resource's scope is exposed as active
    pub fn set_active(&self, resource: Option<ResourceId>) {
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = resource;
    }

    pub fn active_id(&self) -> Option<ResourceId> {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Scope of the active resource, if it is still alive
    pub fn active_scope(&self) -> Option<Arc<UndoScope>> {
        let active = self.active_id()?;
        self.scope_for(&active)
    }

    /// Live scope registered for `resource`. If a resource was dropped from
    /// the cache while still held and a new one created, the newest wins.
    pub fn scope_for(&self, resource: &ResourceId) -> Option<Arc<UndoScope>> {
        self.scopes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .filter_map(Weak::upgrade)
            .find(|s| s.resource() == resource)
    }

    /// Number of scopes whose resource is still alive
    pub fn scope_count(&self) -> usize {
        self.scopes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.strong_count() > 0)
            .count()
    }
}
