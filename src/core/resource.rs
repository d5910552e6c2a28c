//! Cached image document with a staged loading state machine.
//!
//! **Why**: Browsing a folder only needs dimensions and format for most files,
//! pixels are decoded on demand when a view actually shows the image.
//!
//! **Used by**: Registry (owns one cache slot per resource), views (hold a
//! `ResourceHandle` while displaying it).
//!
//! # States
//!
//! ```text
//! MetadataLoading -> MetadataLoaded -> PixelLoading -> FullyLoaded
//!        \________________\_________________\__________-> Failed
//! ```
//!
//! # Ownership
//!
//! A `Resource` lives in an `Arc` shared by the registry slot, the registry's
//! in-flight table and any number of external holders. External holders are
//! counted explicitly by `ResourceHandle`, so eviction never has to guess
//! which strong references belong to the cache itself.
//!
//! State and dirty flag are only mutated through `pub(crate)` transitions
//! called by the registry on its serialized mutator path.

use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::core::undo::UndoScope;
use crate::entities::decoder::DecodeError;
use crate::entities::payload::{Decoded, Edit, ImageMetadata, Pixels};
use crate::entities::saver::SaveError;

/// Opaque, hashable name of a loadable image (its location)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(Arc<Path>);

impl ResourceId {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self(Arc::from(path.as_ref()))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({})", self.0.display())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&Path> for ResourceId {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for ResourceId {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl From<&str> for ResourceId {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// How much of an image a caller wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    MetadataOnly,
    Full,
}

/// Loading state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    MetadataLoading,
    MetadataLoaded,
    PixelLoading,
    FullyLoaded,
    Failed,
}

impl LoadState {
    /// Decode in flight
    pub fn is_busy(self) -> bool {
        matches!(self, LoadState::MetadataLoading | LoadState::PixelLoading)
    }
}

/// Errors from resource operations that are invalid in the current state
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("{id} cannot be modified while {state:?}")]
    NotEditable { id: ResourceId, state: LoadState },

    #[error("{id} has no pixel data loaded")]
    NoPixels { id: ResourceId },

    #[error("failed to save {id}: {source}")]
    Save {
        id: ResourceId,
        #[source]
        source: SaveError,
    },
}

/// Outcome of feeding a decoder completion into a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    /// Ticket does not match the pending decode, result dropped
    Stale,
    /// Payload stored; `continue_full` asks for a pixel decode next
    Completed { continue_full: bool },
    /// Decoder reported an error, resource is now `Failed`
    Failed,
}

#[derive(Debug)]
struct ResourceData {
    state: LoadState,
    modified: bool,
    metadata: Option<ImageMetadata>,
    pixels: Option<Pixels>,
    last_error: Option<String>,
    last_access: Instant,
    /// Insertion sequence into the current map, eviction tie-break
    seq: u64,
    /// Ticket of the decode currently in flight
    pending: Option<u64>,
    /// Pixels were requested while metadata was still loading
    wants_pixels: bool,
    /// Bumped on every modification, lets a save tell whether it is stale
    generation: u64,
}

/// One cached image document
#[derive(Debug)]
pub struct Resource {
    id: ResourceId,
    data: Mutex<ResourceData>,
    holders: AtomicUsize,
    undo_scope: Arc<UndoScope>,
}

impl Resource {
    pub(crate) fn new(id: ResourceId, granularity: Granularity, seq: u64, undo_scope: Arc<UndoScope>) -> Self {
        Self {
            id,
            data: Mutex::new(ResourceData {
                state: LoadState::MetadataLoading,
                modified: false,
                metadata: None,
                pixels: None,
                last_error: None,
                last_access: Instant::now(),
                seq,
                pending: None,
                wants_pixels: granularity == Granularity::Full,
                generation: 0,
            }),
            holders: AtomicUsize::new(0),
            undo_scope,
        }
    }

    fn data(&self) -> std::sync::MutexGuard<'_, ResourceData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ===== Queries =====

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn state(&self) -> LoadState {
        self.data().state
    }

    pub fn is_modified(&self) -> bool {
        self.data().modified
    }

    /// Loaded relative to the requested granularity.
    ///
    /// Metadata is available in `MetadataLoaded`, `PixelLoading` and
    /// `FullyLoaded`; pixels only in `FullyLoaded`. `Failed` is never loaded.
    pub fn is_loaded(&self, granularity: Granularity) -> bool {
        let state = self.state();
        match granularity {
            Granularity::Full => state == LoadState::FullyLoaded,
            Granularity::MetadataOnly => matches!(
                state,
                LoadState::MetadataLoaded | LoadState::PixelLoading | LoadState::FullyLoaded
            ),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state().is_busy()
    }

    pub fn last_access(&self) -> Instant {
        self.data().last_access
    }

    pub fn metadata(&self) -> Option<ImageMetadata> {
        self.data().metadata.clone()
    }

    pub fn pixels(&self) -> Option<Pixels> {
        self.data().pixels.clone()
    }

    /// Message of the last failed decode, if any
    pub fn last_error(&self) -> Option<String> {
        self.data().last_error.clone()
    }

    /// Number of live `ResourceHandle`s, the registry's slot not included
    pub fn external_holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    pub fn undo_scope(&self) -> &Arc<UndoScope> {
        &self.undo_scope
    }

    /// Register an external holder. The returned guard releases it on drop.
    pub fn acquire(self: &Arc<Self>) -> ResourceHandle {
        self.holders.fetch_add(1, Ordering::AcqRel);
        ResourceHandle {
            resource: Arc::clone(self),
        }
    }

    // ===== Transitions (registry only) =====

    pub(crate) fn touch(&self) {
        self.data().last_access = Instant::now();
    }

    pub(crate) fn eviction_key(&self) -> (Instant, u64) {
        let data = self.data();
        (data.last_access, data.seq)
    }

    #[cfg(test)]
    pub(crate) fn set_last_access(&self, at: Instant) {
        self.data().last_access = at;
    }

    pub(crate) fn set_seq(&self, seq: u64) {
        self.data().seq = seq;
    }

    pub(crate) fn pending_ticket(&self) -> Option<u64> {
        self.data().pending
    }

    /// Attach a decode ticket. The state stays as-is: fresh resources are
    /// already `MetadataLoading`, promotions already `PixelLoading`.
    pub(crate) fn begin_decode(&self, ticket: u64) {
        self.data().pending = Some(ticket);
    }

    /// Request pixels for a metadata-level resource.
    ///
    /// Returns true when a pixel decode must be issued now. Idempotent: a
    /// resource that is `PixelLoading` or `FullyLoaded` is left untouched,
    /// one still loading metadata continues to pixels once that completes.
    pub(crate) fn finish_loading(&self) -> bool {
        let mut data = self.data();
        match data.state {
            LoadState::MetadataLoaded => {
                data.state = LoadState::PixelLoading;
                data.wants_pixels = true;
                true
            }
            LoadState::MetadataLoading => {
                data.wants_pixels = true;
                false
            }
            LoadState::PixelLoading | LoadState::FullyLoaded | LoadState::Failed => false,
        }
    }

    /// Restart loading from the source at `granularity`; the completion for
    /// `ticket` replaces the payload and clears the dirty flag.
    pub(crate) fn begin_reload(&self, granularity: Granularity, ticket: u64) {
        let mut data = self.data();
        data.wants_pixels = granularity == Granularity::Full;
        data.state = if data.wants_pixels && data.metadata.is_some() {
            LoadState::PixelLoading
        } else {
            LoadState::MetadataLoading
        };
        data.pending = Some(ticket);
    }

    /// Apply a decoder completion.
    ///
    /// Any successful completion supersedes in-memory edits, so the dirty flag
    /// is cleared here; the registry mirrors that in its modified set.
    pub(crate) fn apply_decode(&self, ticket: u64, result: Result<Decoded, DecodeError>) -> Applied {
        let mut data = self.data();
        if data.pending != Some(ticket) {
            return Applied::Stale;
        }
        data.pending = None;

        match result {
            Ok(Decoded::Metadata(meta)) => {
                data.metadata = Some(meta);
                data.last_error = None;
                data.modified = false;
                if data.wants_pixels {
                    data.state = LoadState::PixelLoading;
                    Applied::Completed { continue_full: true }
                } else {
                    data.state = LoadState::MetadataLoaded;
                    Applied::Completed { continue_full: false }
                }
            }
            Ok(Decoded::Full { metadata, pixels }) => {
                data.metadata = Some(metadata);
                data.pixels = Some(pixels);
                data.last_error = None;
                data.modified = false;
                data.state = LoadState::FullyLoaded;
                Applied::Completed { continue_full: false }
            }
            Err(e) => {
                data.last_error = Some(e.to_string());
                data.state = LoadState::Failed;
                Applied::Failed
            }
        }
    }

    /// Set the dirty flag. Returns true if it was clear before.
    pub(crate) fn set_modified(&self) -> Result<bool, ResourceError> {
        let mut data = self.data();
        match data.state {
            LoadState::MetadataLoaded | LoadState::FullyLoaded => {
                let was_clean = !data.modified;
                data.modified = true;
                data.generation += 1;
                Ok(was_clean)
            }
            state => Err(ResourceError::NotEditable {
                id: self.id.clone(),
                state,
            }),
        }
    }

    /// Pixels to persist, together with the modification generation they
    /// reflect
    pub(crate) fn save_snapshot(&self) -> Option<(Pixels, u64)> {
        let data = self.data();
        data.pixels.clone().map(|pixels| (pixels, data.generation))
    }

    /// Clear the dirty flag after `generation` was persisted. A resource
    /// modified since the snapshot stays dirty. Returns true if cleared.
    pub(crate) fn mark_saved(&self, generation: u64) -> bool {
        let mut data = self.data();
        if data.generation != generation {
            return false;
        }
        data.modified = false;
        true
    }

    /// Replace pixels with `edit` applied. Returns true if the resource was
    /// clean before.
    pub(crate) fn apply_edit(&self, edit: Edit) -> Result<bool, ResourceError> {
        let mut data = self.data();
        if data.state != LoadState::FullyLoaded {
            return Err(ResourceError::NotEditable {
                id: self.id.clone(),
                state: data.state,
            });
        }
        let Some(pixels) = data.pixels.clone() else {
            return Err(ResourceError::NoPixels { id: self.id.clone() });
        };

        let edited = edit.apply(&pixels);
        if let Some(meta) = data.metadata.as_mut() {
            meta.width = edited.width();
            meta.height = edited.height();
        }
        data.pixels = Some(Arc::new(edited));
        let was_clean = !data.modified;
        data.modified = true;
        data.generation += 1;
        Ok(was_clean)
    }
}

/// Scoped external holder of a resource.
///
/// While at least one handle is alive the resource is exempt from garbage
/// collection. Cloning registers another holder.
#[derive(Debug)]
pub struct ResourceHandle {
    resource: Arc<Resource>,
}

impl ResourceHandle {
    /// Same underlying resource (identity, not equality)
    pub fn ptr_eq(a: &ResourceHandle, b: &ResourceHandle) -> bool {
        Arc::ptr_eq(&a.resource, &b.resource)
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }
}

impl Clone for ResourceHandle {
    fn clone(&self) -> Self {
        self.resource.acquire()
    }
}

impl Deref for ResourceHandle {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.resource
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        self.resource.holders.fetch_sub(1, Ordering::AcqRel);
    }
}
