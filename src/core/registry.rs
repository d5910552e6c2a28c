//! Process-wide cache of image documents with staged loading.
//!
//! Structure: two maps keyed by `ResourceId`
//! - `metadata_map`: resources loaded at metadata granularity
//! - `full_map`: resources whose pixels are loaded or loading
//!
//! An id lives in at most one map. Promotion (metadata -> full) moves the
//! same `Arc<Resource>`, it never creates a second instance.
//!
//! # Single writer
//!
//! Every insertion, promotion, eviction and modified-set update happens under
//! the write lock. Decoders run on worker threads and only send completions
//! over a channel; `pump()` applies them under the same lock. Queries take the
//! read lock and may run concurrently with each other.
//!
//! Events are collected while locked and emitted after the lock is released,
//! so subscribers can call straight back into the registry.
//!
//! # Garbage collection
//!
//! After each insert into a map, entries with no external holder and no
//! unsaved changes are candidates. While there are more candidates than
//! `eviction_floor`, the one with the oldest access time goes (ties broken by
//! insertion sequence). Held or modified entries are never collected, so the
//! floor is a soft bound.
//!
//! # In-flight decodes
//!
//! The in-flight table keeps a resource alive until its decode completes, even
//! if it was evicted or the cache was cleared meanwhile. The result is still
//! applied so external holders see it; a completion superseded by a reload is
//! discarded by ticket.
//!
//! # Detached instances
//!
//! The modified set is keyed by id, while evicted or cleared resources can
//! outlive their slot in a holder's hands. Such a detached instance only
//! drives the modified set and id-keyed events while no other instance for
//! its id is cached. Creating a new instance for an id resets the id's entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use indexmap::IndexSet;
use log::{debug, info, warn};

use crate::config::{ModifiedBehavior, RegistryConfig};
use crate::core::event_bus::EventBus;
use crate::core::registry_events::{BusyStateChanged, ModifiedListChanged, ResourceChanged};
use crate::core::resource::{Applied, Granularity, Resource, ResourceError, ResourceHandle, ResourceId};
use crate::core::undo::UndoGroup;
use crate::core::workers::Workers;
use crate::entities::decoder::{DecodeCompletion, DecodeRequest, Decoder, ImageDecoder};
use crate::entities::payload::Edit;
use crate::entities::saver::Saver;

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }
}

/// Typed notifications from resource transitions to the registry
#[derive(Debug, Clone)]
pub(crate) enum ResourceEvent {
    LoadCompleted(ResourceId),
    Modified(ResourceId),
    Saved(ResourceId),
}

/// Answer of the `Ask` prompt in `save_if_modified`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Save,
    Discard,
    Cancel,
}

enum Notice {
    Changed(ResourceId),
    ModifiedList,
    Busy(ResourceId, bool),
}

/// Side effects gathered under the lock, flushed after it is released
#[derive(Default)]
struct Outbox {
    notices: Vec<Notice>,
    decodes: Vec<DecodeRequest>,
}

type ResourceMap = HashMap<ResourceId, Arc<Resource>>;

#[derive(Default)]
struct RegistryState {
    metadata_map: ResourceMap,
    full_map: ResourceMap,
    /// Ids with unsaved changes, in the order they became dirty
    modified: IndexSet<ResourceId>,
    /// Decode ticket -> resource kept alive until the completion arrives
    in_flight: HashMap<u64, Arc<Resource>>,
    next_seq: u64,
    next_ticket: u64,
}

impl RegistryState {
    fn map(&self, granularity: Granularity) -> &ResourceMap {
        match granularity {
            Granularity::MetadataOnly => &self.metadata_map,
            Granularity::Full => &self.full_map,
        }
    }

    fn map_mut(&mut self, granularity: Granularity) -> &mut ResourceMap {
        match granularity {
            Granularity::MetadataOnly => &mut self.metadata_map,
            Granularity::Full => &mut self.full_map,
        }
    }

    fn find(&self, id: &ResourceId) -> Option<&Arc<Resource>> {
        self.full_map.get(id).or_else(|| self.metadata_map.get(id))
    }

    /// Whether `res` speaks for its id: it is the cached instance, or it is
    /// detached and nothing else is cached under that id
    fn owns_id(&self, res: &Arc<Resource>) -> bool {
        self.find(res.id()).is_none_or(|cached| Arc::ptr_eq(cached, res))
    }

    fn take_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn take_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Evict the oldest candidates of one map down to `floor`.
    /// Returns the number of evicted entries.
    fn collect_garbage(&mut self, granularity: Granularity, floor: usize) -> usize {
        let map = self.map_mut(granularity);

        let mut candidates: Vec<_> = map
            .iter()
            .filter(|(_, res)| res.external_holders() == 0 && !res.is_modified())
            .map(|(id, res)| (res.eviction_key(), id.clone()))
            .collect();

        if candidates.len() <= floor {
            return 0;
        }

        // Oldest access first; equal timestamps fall back to insertion order
        candidates.sort();
        let excess = candidates.len() - floor;
        for (_, id) in candidates.into_iter().take(excess) {
            map.remove(&id);
            debug!("Collecting {} from {:?} map", id, granularity);
        }
        excess
    }

    fn dispatch(&mut self, event: ResourceEvent, out: &mut Outbox) {
        match event {
            ResourceEvent::LoadCompleted(id) => {
                if !self.on_load_completed(id.clone(), out) {
                    // Not dirty: still tell views the payload arrived
                    out.notices.push(Notice::Changed(id));
                }
            }
            ResourceEvent::Modified(id) => self.on_modified(id, out),
            ResourceEvent::Saved(id) => self.on_saved(id, out),
        }
    }

    /// A reload cleared the dirty flag. Returns true if anything was emitted.
    fn on_load_completed(&mut self, id: ResourceId, out: &mut Outbox) -> bool {
        if self.modified.shift_remove(&id) {
            out.notices.push(Notice::ModifiedList);
            out.notices.push(Notice::Changed(id));
            true
        } else {
            false
        }
    }

    fn on_saved(&mut self, id: ResourceId, out: &mut Outbox) {
        self.modified.shift_remove(&id);
        out.notices.push(Notice::ModifiedList);
        out.notices.push(Notice::Changed(id));
    }

    fn on_modified(&mut self, id: ResourceId, out: &mut Outbox) {
        if self.modified.insert(id.clone()) {
            out.notices.push(Notice::ModifiedList);
        }
        out.notices.push(Notice::Changed(id));
    }
}

/// Image document registry.
///
/// Owned by the application's top-level context and passed to consumers;
/// construct one with `new()` and tear it down by dropping it.
pub struct Registry {
    state: RwLock<RegistryState>,
    decoder: Arc<dyn Decoder>,
    completion_tx: Sender<DecodeCompletion>,
    completion_rx: Receiver<DecodeCompletion>,
    events: EventBus,
    undo_group: Arc<UndoGroup>,
    stats: CacheStats,
    eviction_floor: usize,
}

impl Registry {
    /// Create a registry that decodes through `decoder`
    pub fn new(decoder: Arc<dyn Decoder>, config: &RegistryConfig) -> Self {
        let (completion_tx, completion_rx) = unbounded();

        info!("Registry created: eviction_floor={}", config.eviction_floor);

        Self {
            state: RwLock::new(RegistryState::default()),
            decoder,
            completion_tx,
            completion_rx,
            events: EventBus::new(),
            undo_group: Arc::new(UndoGroup::new()),
            stats: CacheStats::default(),
            eviction_floor: config.eviction_floor,
        }
    }

    /// Registry decoding files with the `image` crate on its own worker pool
    pub fn with_image_decoder(config: &RegistryConfig) -> Self {
        let workers = Arc::new(Workers::new(config.decoder_threads));
        Self::new(Arc::new(ImageDecoder::new(workers)), config)
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn undo_group(&self) -> &Arc<UndoGroup> {
        &self.undo_group
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn eviction_floor(&self) -> usize {
        self.eviction_floor
    }

    /// Get the resource for `id` at `granularity`, starting a load if needed.
    ///
    /// Returns immediately; completion is announced via `ResourceChanged`
    /// once `pump()` applies it. For a given id, calls before any eviction
    /// always return the same resource.
    pub fn load(&self, id: impl Into<ResourceId>, granularity: Granularity) -> ResourceHandle {
        let id = id.into();
        let mut out = Outbox::default();

        let handle = {
            let mut state = self.write();

            if let Some(res) = state.full_map.get(&id) {
                // Pixels satisfy any request
                self.stats.record_hit();
                res.touch();
                res.acquire()
            } else if let Some(res) = state.metadata_map.get(&id).cloned() {
                self.stats.record_hit();
                res.touch();
                match granularity {
                    Granularity::MetadataOnly => res.acquire(),
                    Granularity::Full => self.promote(&mut state, res, &mut out),
                }
            } else {
                self.stats.record_miss();
                self.create(&mut state, id, granularity, &mut out)
            }
        };

        self.flush(out);
        handle
    }

    /// Move a metadata-level resource to the full map and start its pixels
    fn promote(&self, state: &mut RegistryState, res: Arc<Resource>, out: &mut Outbox) -> ResourceHandle {
        let id = res.id().clone();
        debug!("{}: metadata cached, promoting to full", id);

        state.metadata_map.remove(&id);
        let seq = state.take_seq();
        res.set_seq(seq);
        state.full_map.insert(id, Arc::clone(&res));
        self.stats.record_promotion();

        if res.finish_loading() {
            self.start_decode(state, &res, Granularity::Full, out);
        }

        self.collect(state, Granularity::Full);
        res.acquire()
    }

    fn create(
        &self,
        state: &mut RegistryState,
        id: ResourceId,
        granularity: Granularity,
        out: &mut Outbox,
    ) -> ResourceHandle {
        debug!("{}: loading {:?}", id, granularity);

        // Left over from an instance dropped after clear_cache()
        if state.modified.shift_remove(&id) {
            debug!("{}: new instance starts clean", id);
            out.notices.push(Notice::ModifiedList);
        }

        let scope = self.undo_group.create_scope(id.clone());
        let seq = state.take_seq();
        let res = Arc::new(Resource::new(id.clone(), granularity, seq, scope));

        self.start_decode(state, &res, granularity, out);
        state.map_mut(granularity).insert(id, Arc::clone(&res));

        // New entry has no holder yet, so it counts as a candidate too
        self.collect(state, granularity);
        res.acquire()
    }

    fn start_decode(&self, state: &mut RegistryState, res: &Arc<Resource>, granularity: Granularity, out: &mut Outbox) {
        let announce = state.owns_id(res);
        let ticket = state.take_ticket();
        res.begin_decode(ticket);
        state.in_flight.insert(ticket, Arc::clone(res));
        out.decodes.push(DecodeRequest::new(
            res.id().clone(),
            ticket,
            granularity,
            self.completion_tx.clone(),
        ));
        if announce {
            out.notices.push(Notice::Busy(res.id().clone(), true));
        }
    }

    fn collect(&self, state: &mut RegistryState, granularity: Granularity) {
        let evicted = state.collect_garbage(granularity, self.eviction_floor);
        if evicted > 0 {
            self.stats.record_evictions(evicted);
        }
    }

    /// Membership in the map for `granularity` only
    pub fn has_resource(&self, id: &ResourceId, granularity: Granularity) -> bool {
        self.read().map(granularity).contains_key(id)
    }

    /// Ids with unsaved changes, in the order they became dirty
    pub fn modified_resource_list(&self) -> Vec<ResourceId> {
        self.read().modified.iter().cloned().collect()
    }

    pub fn is_modified(&self, id: &ResourceId) -> bool {
        self.read().modified.contains(id)
    }

    /// True while the cached resource for `id` has a decode in flight
    pub fn is_busy(&self, id: &ResourceId) -> bool {
        self.read().find(id).is_some_and(|res| res.is_busy())
    }

    /// Number of cached entries at `granularity`
    pub fn cached_count(&self, granularity: Granularity) -> usize {
        self.read().map(granularity).len()
    }

    /// Number of decodes not yet applied
    pub fn in_flight_count(&self) -> usize {
        self.read().in_flight.len()
    }

    /// Drop every cached entry, including ones with unsaved changes.
    ///
    /// **Data loss**: modified resources nobody else holds are discarded
    /// without confirmation, and their ids leave the modified list. Use
    /// `clear_unmodified()` to keep dirty documents.
    pub fn clear_cache(&self) {
        let mut out = Outbox::default();
        {
            let mut guard = self.write();
            let state = &mut *guard;
            let dropped: Vec<Arc<Resource>> = state
                .metadata_map
                .drain()
                .chain(state.full_map.drain())
                .map(|(_, res)| res)
                .collect();

            let mut list_changed = false;
            for res in &dropped {
                if res.is_modified() && res.external_holders() == 0 {
                    warn!("clear_cache: discarding unsaved changes of {}", res.id());
                    list_changed |= state.modified.shift_remove(res.id());
                }
            }
            if list_changed {
                out.notices.push(Notice::ModifiedList);
            }
            debug!("Cleared cache: {} entries dropped", dropped.len());
        }
        self.flush(out);
    }

    /// Drop cached entries without unsaved changes; dirty ones stay
    pub fn clear_unmodified(&self) {
        let mut state = self.write();
        let before = state.metadata_map.len() + state.full_map.len();
        state.metadata_map.retain(|_, res| res.is_modified());
        state.full_map.retain(|_, res| res.is_modified());
        let after = state.metadata_map.len() + state.full_map.len();
        debug!("Cleared unmodified entries: {} dropped, {} kept", before - after, after);
    }

    /// Mark a loaded resource as having unsaved changes
    pub fn set_modified(&self, handle: &ResourceHandle) -> Result<(), ResourceError> {
        let mut out = Outbox::default();
        {
            let mut state = self.write();
            handle.set_modified()?;
            if state.owns_id(handle.resource()) {
                state.dispatch(ResourceEvent::Modified(handle.id().clone()), &mut out);
            }
        }
        self.flush(out);
        Ok(())
    }

    /// Apply a pixel edit. Requires `FullyLoaded`; marks the resource modified
    /// and records the edit in its undo scope.
    pub fn apply_edit(&self, handle: &ResourceHandle, edit: Edit) -> Result<(), ResourceError> {
        let mut out = Outbox::default();
        {
            let mut state = self.write();
            handle.apply_edit(edit)?;
            handle.undo_scope().push(edit.label());
            debug!("{}: applied {}", handle.id(), edit.label());
            if state.owns_id(handle.resource()) {
                state.dispatch(ResourceEvent::Modified(handle.id().clone()), &mut out);
            }
        }
        self.flush(out);
        Ok(())
    }

    /// Persist the resource's pixels through `saver`.
    ///
    /// On failure the resource stays modified and the error is returned;
    /// nothing is retried. Edits applied while the saver runs are not part of
    /// what was written, so they keep the resource modified.
    pub fn save(&self, handle: &ResourceHandle, saver: &dyn Saver) -> Result<(), ResourceError> {
        let id = handle.id().clone();
        let (pixels, generation) = handle
            .save_snapshot()
            .ok_or_else(|| ResourceError::NoPixels { id: id.clone() })?;

        saver.save(&id, &pixels).map_err(|source| {
            warn!("Saving {} failed: {}", id, source);
            ResourceError::Save { id: id.clone(), source }
        })?;

        let mut out = Outbox::default();
        {
            let mut state = self.write();
            if handle.mark_saved(generation) {
                handle.undo_scope().set_clean();
                if state.owns_id(handle.resource()) {
                    state.dispatch(ResourceEvent::Saved(id), &mut out);
                }
            } else {
                debug!("{}: modified while saving, stays dirty", id);
            }
        }
        self.flush(out);
        Ok(())
    }

    /// Reload from the source at the granularity the resource is cached at.
    /// The completion replaces the payload and clears the dirty flag.
    pub fn reload(&self, handle: &ResourceHandle) {
        let mut out = Outbox::default();
        {
            let mut state = self.write();
            let res = handle.resource();
            let granularity = if state.full_map.contains_key(res.id()) || res.is_loaded(Granularity::Full) {
                Granularity::Full
            } else {
                Granularity::MetadataOnly
            };
            debug!("{}: reloading {:?}", res.id(), granularity);

            // Supersede whatever is in flight: its completion becomes stale
            let ticket = state.take_ticket();
            res.begin_reload(granularity, ticket);
            state.in_flight.insert(ticket, Arc::clone(res));
            out.decodes.push(DecodeRequest::new(
                res.id().clone(),
                ticket,
                granularity,
                self.completion_tx.clone(),
            ));
            if state.owns_id(res) {
                out.notices.push(Notice::Busy(res.id().clone(), true));
            }
        }
        self.flush(out);
    }

    /// Resolve unsaved changes before the caller switches to another image.
    ///
    /// Returns true when it is safe to switch away. `ask` is only consulted
    /// for `ModifiedBehavior::Ask`.
    pub fn save_if_modified(
        &self,
        handle: &ResourceHandle,
        saver: &dyn Saver,
        behavior: ModifiedBehavior,
        ask: impl FnOnce(&ResourceId) -> Resolution,
    ) -> Result<bool, ResourceError> {
        if !handle.is_modified() {
            return Ok(true);
        }
        let resolution = match behavior {
            ModifiedBehavior::Ask => ask(handle.id()),
            ModifiedBehavior::SaveSilently => Resolution::Save,
            ModifiedBehavior::DiscardChanges => Resolution::Discard,
        };
        match resolution {
            Resolution::Save => self.save(handle, saver).map(|()| true),
            Resolution::Discard => {
                self.reload(handle);
                Ok(true)
            }
            Resolution::Cancel => Ok(false),
        }
    }

    /// Apply every decoder completion received so far. Call from the thread
    /// that owns the registry (e.g. once per UI frame). Returns the count.
    pub fn pump(&self) -> usize {
        let completions: Vec<DecodeCompletion> = self.completion_rx.try_iter().collect();
        self.apply_completions(completions)
    }

    /// Block until at least one completion arrives (or `timeout`), then pump
    pub fn pump_blocking(&self, timeout: Duration) -> usize {
        match self.completion_rx.recv_timeout(timeout) {
            Ok(first) => {
                let mut completions = vec![first];
                completions.extend(self.completion_rx.try_iter());
                self.apply_completions(completions)
            }
            Err(_) => 0,
        }
    }

    /// Pump until no decode is in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if self.in_flight_count() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.pump_blocking(deadline - now);
        }
    }

    fn apply_completions(&self, completions: Vec<DecodeCompletion>) -> usize {
        if completions.is_empty() {
            return 0;
        }
        let count = completions.len();
        let mut out = Outbox::default();
        {
            let mut state = self.write();
            for completion in completions {
                self.apply_completion(&mut state, completion, &mut out);
            }
        }
        self.flush(out);
        count
    }

    fn apply_completion(&self, state: &mut RegistryState, completion: DecodeCompletion, out: &mut Outbox) {
        let DecodeCompletion {
            id,
            ticket,
            granularity,
            result,
        } = completion;

        let Some(res) = state.in_flight.remove(&ticket) else {
            debug!("{}: completion for unknown ticket {}", id, ticket);
            return;
        };
        if let Err(e) = &result {
            warn!("Decoding {} ({:?}) failed: {}", id, granularity, e);
        }

        let applied = res.apply_decode(ticket, result);
        // A detached instance only updates its own holders
        let owner = state.owns_id(&res);
        match applied {
            Applied::Stale => {
                debug!("{}: dropping stale completion {}", id, ticket);
            }
            Applied::Completed { continue_full } => {
                res.undo_scope().clear();
                if continue_full {
                    // Promoted while metadata was loading
                    self.start_decode(state, &res, Granularity::Full, out);
                } else if owner {
                    out.notices.push(Notice::Busy(id.clone(), false));
                }
                if owner {
                    state.dispatch(ResourceEvent::LoadCompleted(id), out);
                } else {
                    debug!("{}: completion {} applied to detached instance", id, ticket);
                }
            }
            Applied::Failed if owner => {
                out.notices.push(Notice::Busy(id.clone(), false));
                out.notices.push(Notice::Changed(id));
            }
            Applied::Failed => {}
        }
    }

    /// Issue decodes and emit events gathered under the lock
    fn flush(&self, out: Outbox) {
        for request in out.decodes {
            self.decoder.begin_load(request);
        }
        for notice in out.notices {
            match notice {
                Notice::Changed(id) => self.events.emit(ResourceChanged(id)),
                Notice::ModifiedList => self.events.emit(ModifiedListChanged),
                Notice::Busy(id, busy) => self.events.emit(BusyStateChanged { id, busy }),
            }
        }
    }

    /// Dump both maps at debug level
    pub fn log_maps(&self) {
        let state = self.read();
        for (name, map) in [("metadata", &state.metadata_map), ("full", &state.full_map)] {
            debug!("{} map ({} entries):", name, map.len());
            for (id, res) in map.iter() {
                debug!(
                    "- {} state={:?} pending={:?} holders={} modified={} last_access={:?} ago",
                    id,
                    res.state(),
                    res.pending_ticket(),
                    res.external_holders(),
                    res.is_modified(),
                    res.last_access().elapsed()
                );
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let state = self.read();
        info!(
            "Registry shut down: {} cached, {} in flight, {} unsaved",
            state.metadata_map.len() + state.full_map.len(),
            state.in_flight.len(),
            state.modified.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::decoder::testing::ManualDecoder;
    use crate::entities::saver::SaveError;
    use crate::core::resource::LoadState;
    use image::DynamicImage;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn registry_with(floor: usize) -> (Registry, Arc<ManualDecoder>) {
        let decoder = ManualDecoder::new();
        let config = RegistryConfig {
            eviction_floor: floor,
            decoder_threads: 1,
            modified_behavior: ModifiedBehavior::Ask,
        };
        (Registry::new(decoder.clone(), &config), decoder)
    }

    fn id(name: &str) -> ResourceId {
        ResourceId::from(name)
    }

    /// Load fully and apply the decode
    fn loaded(registry: &Registry, decoder: &ManualDecoder, name: &str) -> ResourceHandle {
        let handle = registry.load(id(name), Granularity::Full);
        decoder.succeed(&id(name));
        registry.pump();
        handle
    }

    fn count_events<E: crate::core::event_bus::Event + Clone>(registry: &Registry) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        registry.events().subscribe::<E, _>(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    struct RecordingSaver {
        saved: Mutex<Vec<ResourceId>>,
        fail: bool,
    }

    impl RecordingSaver {
        fn new(fail: bool) -> Self {
            Self {
                saved: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    impl Saver for RecordingSaver {
        fn save(&self, id: &ResourceId, _image: &DynamicImage) -> Result<(), SaveError> {
            if self.fail {
                return Err(SaveError::Rejected("read-only".into()));
            }
            self.saved.lock().unwrap().push(id.clone());
            Ok(())
        }
    }

    #[test]
    fn test_identity_stable_and_access_refreshed() {
        let (registry, _decoder) = registry_with(3);
        let first = registry.load(id("a.png"), Granularity::MetadataOnly);
        let t1 = first.last_access();
        let second = registry.load(id("a.png"), Granularity::MetadataOnly);

        assert!(ResourceHandle::ptr_eq(&first, &second));
        assert!(second.last_access() >= t1);
        assert_eq!(registry.stats().misses(), 1);
        assert_eq!(registry.stats().hits(), 1);
    }

    #[test]
    fn test_promotion_preserves_identity() {
        let (registry, decoder) = registry_with(3);
        let meta = registry.load(id("a.png"), Granularity::MetadataOnly);
        decoder.succeed(&id("a.png"));
        registry.pump();
        assert_eq!(meta.state(), LoadState::MetadataLoaded);

        let full = registry.load(id("a.png"), Granularity::Full);
        assert!(ResourceHandle::ptr_eq(&meta, &full));
        assert!(registry.has_resource(&id("a.png"), Granularity::Full));
        assert!(!registry.has_resource(&id("a.png"), Granularity::MetadataOnly));
        assert_eq!(full.state(), LoadState::PixelLoading);
        assert_eq!(decoder.pending_for(&id("a.png")), vec![Granularity::Full]);

        decoder.succeed(&id("a.png"));
        registry.pump();
        assert_eq!(meta.state(), LoadState::FullyLoaded);
        assert!(meta.pixels().is_some());
        assert_eq!(registry.stats().promotions(), 1);
    }

    #[test]
    fn test_full_entry_satisfies_metadata_request() {
        let (registry, decoder) = registry_with(3);
        let full = loaded(&registry, &decoder, "a.png");
        let meta = registry.load(id("a.png"), Granularity::MetadataOnly);

        assert!(ResourceHandle::ptr_eq(&full, &meta));
        assert!(!registry.has_resource(&id("a.png"), Granularity::MetadataOnly));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_promotion_while_metadata_loading() {
        let (registry, decoder) = registry_with(3);
        let handle = registry.load(id("a.png"), Granularity::MetadataOnly);
        registry.load(id("a.png"), Granularity::Full);
        // Still only the metadata decode is outstanding
        assert_eq!(decoder.pending_for(&id("a.png")), vec![Granularity::MetadataOnly]);

        decoder.succeed(&id("a.png"));
        registry.pump();
        assert_eq!(handle.state(), LoadState::PixelLoading);
        assert_eq!(decoder.pending_for(&id("a.png")), vec![Granularity::Full]);

        decoder.succeed(&id("a.png"));
        registry.pump();
        assert_eq!(handle.state(), LoadState::FullyLoaded);
    }

    #[test]
    fn test_maps_stay_exclusive() {
        let (registry, decoder) = registry_with(2);
        let names = ["a", "b", "c", "d", "e"];
        for (i, name) in names.iter().enumerate() {
            let granularity = if i % 2 == 0 { Granularity::MetadataOnly } else { Granularity::Full };
            registry.load(id(name), granularity);
            decoder.succeed_all();
            registry.pump();
            registry.load(id(names[i / 2]), Granularity::Full);
            decoder.succeed_all();
            registry.pump();

            for name in names {
                let in_meta = registry.has_resource(&id(name), Granularity::MetadataOnly);
                let in_full = registry.has_resource(&id(name), Granularity::Full);
                assert!(!(in_meta && in_full), "{} in both maps", name);
            }
        }
    }

    #[test]
    fn test_eviction_floor() {
        let (registry, decoder) = registry_with(3);
        for name in ["1", "2", "3", "4", "5"] {
            registry.load(id(name), Granularity::MetadataOnly);
            std::thread::sleep(Duration::from_millis(2));
        }
        decoder.succeed_all();
        registry.pump();

        assert_eq!(registry.cached_count(Granularity::MetadataOnly), 3);
        assert!(!registry.has_resource(&id("1"), Granularity::MetadataOnly));
        assert!(!registry.has_resource(&id("2"), Granularity::MetadataOnly));
        for name in ["3", "4", "5"] {
            assert!(registry.has_resource(&id(name), Granularity::MetadataOnly));
        }
        assert_eq!(registry.stats().evictions(), 2);
    }

    #[test]
    fn test_eviction_is_per_map() {
        let (registry, _decoder) = registry_with(1);
        registry.load(id("m1"), Granularity::MetadataOnly);
        registry.load(id("f1"), Granularity::Full);
        registry.load(id("f2"), Granularity::Full);

        assert!(registry.has_resource(&id("m1"), Granularity::MetadataOnly));
        assert!(!registry.has_resource(&id("f1"), Granularity::Full));
        assert!(registry.has_resource(&id("f2"), Granularity::Full));
    }

    #[test]
    fn test_held_and_modified_never_evicted() {
        let (registry, decoder) = registry_with(1);
        let held = registry.load(id("held"), Granularity::Full);
        let dirty = loaded(&registry, &decoder, "dirty");
        registry.apply_edit(&dirty, Edit::Flip).unwrap();
        drop(dirty);

        for i in 0..10 {
            registry.load(id(&format!("filler{}", i)), Granularity::Full);
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(registry.has_resource(&id("held"), Granularity::Full));
        assert!(registry.has_resource(&id("dirty"), Granularity::Full));
        // Floor of one unreferenced, unmodified entry: only the newest filler
        assert_eq!(registry.cached_count(Granularity::Full), 3);
        assert_eq!(held.external_holders(), 1);
    }

    #[test]
    fn test_equal_timestamps_break_by_insertion_order() {
        let mut state = RegistryState::default();
        let group = UndoGroup::new();
        let stamp = Instant::now();
        // Ids sort opposite to insertion, so only the sequence can decide
        for name in ["c", "b", "a"] {
            let seq = state.take_seq();
            let res = Arc::new(Resource::new(id(name), Granularity::MetadataOnly, seq, group.create_scope(id(name))));
            res.set_last_access(stamp);
            state.metadata_map.insert(id(name), res);
        }

        assert_eq!(state.collect_garbage(Granularity::MetadataOnly, 1), 2);
        assert!(state.metadata_map.contains_key(&id("a")));
    }

    #[test]
    fn test_dirty_set_tracks_flag() {
        let (registry, decoder) = registry_with(3);
        let list_changes = count_events::<ModifiedListChanged>(&registry);
        let changes = count_events::<ResourceChanged>(&registry);

        let a = loaded(&registry, &decoder, "a.png");
        let b = loaded(&registry, &decoder, "b.png");
        let changes_after_load = changes.load(Ordering::SeqCst);
        assert_eq!(changes_after_load, 2);

        registry.apply_edit(&b, Edit::Mirror).unwrap();
        registry.apply_edit(&a, Edit::RotateLeft).unwrap();
        registry.apply_edit(&a, Edit::RotateRight).unwrap();

        assert_eq!(registry.modified_resource_list(), vec![id("b.png"), id("a.png")]);
        assert!(registry.is_modified(&id("a.png")));
        assert_eq!(list_changes.load(Ordering::SeqCst), 2);
        // Every modification emits changed, even when already dirty
        assert_eq!(changes.load(Ordering::SeqCst), changes_after_load + 3);
        assert_eq!(a.undo_scope().labels(), vec!["Rotate Left", "Rotate Right"]);
    }

    #[test]
    fn test_save_clears_dirty_once() {
        let (registry, decoder) = registry_with(3);
        let a = loaded(&registry, &decoder, "a.png");
        registry.apply_edit(&a, Edit::Flip).unwrap();

        let list_changes = count_events::<ModifiedListChanged>(&registry);
        let saver = RecordingSaver::new(false);
        registry.save(&a, &saver).unwrap();

        assert!(!a.is_modified());
        assert!(registry.modified_resource_list().is_empty());
        assert_eq!(list_changes.load(Ordering::SeqCst), 1);
        assert_eq!(*saver.saved.lock().unwrap(), vec![id("a.png")]);
        assert!(a.undo_scope().is_clean());
    }

    #[test]
    fn test_failed_save_keeps_dirty() {
        let (registry, decoder) = registry_with(3);
        let a = loaded(&registry, &decoder, "a.png");
        registry.apply_edit(&a, Edit::Flip).unwrap();

        let err = registry.save(&a, &RecordingSaver::new(true)).unwrap_err();
        assert!(matches!(err, ResourceError::Save { .. }));
        assert!(a.is_modified());
        assert_eq!(registry.modified_resource_list(), vec![id("a.png")]);
    }

    #[test]
    fn test_metadata_resource_can_be_marked_modified() {
        let (registry, decoder) = registry_with(3);
        let a = registry.load(id("a.png"), Granularity::MetadataOnly);
        assert!(registry.set_modified(&a).is_err());

        decoder.succeed(&id("a.png"));
        registry.pump();
        registry.set_modified(&a).unwrap();
        assert_eq!(registry.modified_resource_list(), vec![id("a.png")]);

        // Nothing to save without pixels
        let err = registry.save(&a, &RecordingSaver::new(false)).unwrap_err();
        assert!(matches!(err, ResourceError::NoPixels { .. }));
    }

    #[test]
    fn test_reload_clears_dirty() {
        let (registry, decoder) = registry_with(3);
        let a = loaded(&registry, &decoder, "a.png");
        registry.apply_edit(&a, Edit::RotateLeft).unwrap();
        let list_changes = count_events::<ModifiedListChanged>(&registry);

        registry.reload(&a);
        assert!(registry.is_busy(&id("a.png")));
        assert!(a.is_modified());

        decoder.succeed(&id("a.png"));
        registry.pump();
        assert!(!a.is_modified());
        assert!(registry.modified_resource_list().is_empty());
        assert_eq!(list_changes.load(Ordering::SeqCst), 1);
        assert!(a.undo_scope().is_empty());
        assert_eq!(a.state(), LoadState::FullyLoaded);
    }

    #[test]
    fn test_reload_supersedes_in_flight_decode() {
        let (registry, decoder) = registry_with(3);
        let a = registry.load(id("a.png"), Granularity::MetadataOnly);
        registry.reload(&a);
        assert_eq!(decoder.pending(), 2);

        decoder.succeed(&id("a.png"));
        registry.pump();
        // First completion carried the old ticket
        assert_eq!(a.state(), LoadState::MetadataLoading);

        decoder.succeed(&id("a.png"));
        registry.pump();
        assert_eq!(a.state(), LoadState::MetadataLoaded);
        assert_eq!(registry.in_flight_count(), 0);
    }

    #[test]
    fn test_clear_cache_drops_everything() {
        let (registry, decoder) = registry_with(3);
        let a = loaded(&registry, &decoder, "a.png");
        registry.apply_edit(&a, Edit::Flip).unwrap();
        drop(a);
        registry.load(id("b.png"), Granularity::MetadataOnly);
        decoder.succeed_all();
        registry.pump();

        let list_changes = count_events::<ModifiedListChanged>(&registry);
        registry.clear_cache();

        for name in ["a.png", "b.png"] {
            assert!(!registry.has_resource(&id(name), Granularity::MetadataOnly));
            assert!(!registry.has_resource(&id(name), Granularity::Full));
        }
        assert!(registry.modified_resource_list().is_empty());
        assert_eq!(list_changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_cache_keeps_dirty_id_of_held_resource() {
        let (registry, decoder) = registry_with(3);
        let a = loaded(&registry, &decoder, "a.png");
        registry.apply_edit(&a, Edit::Flip).unwrap();

        registry.clear_cache();

        assert!(!registry.has_resource(&id("a.png"), Granularity::Full));
        assert!(a.is_modified());
        assert_eq!(registry.modified_resource_list(), vec![id("a.png")]);
    }

    #[test]
    fn test_clear_unmodified_keeps_dirty() {
        let (registry, decoder) = registry_with(3);
        let a = loaded(&registry, &decoder, "a.png");
        registry.apply_edit(&a, Edit::Flip).unwrap();
        drop(a);
        loaded(&registry, &decoder, "b.png");

        registry.clear_unmodified();
        assert!(registry.has_resource(&id("a.png"), Granularity::Full));
        assert!(!registry.has_resource(&id("b.png"), Granularity::Full));
    }

    #[test]
    fn test_evicted_while_loading_still_completes() {
        let (registry, decoder) = registry_with(1);
        let a = registry.load(id("a.png"), Granularity::MetadataOnly);
        let weak = Arc::downgrade(a.resource());
        drop(a);
        registry.load(id("b.png"), Granularity::MetadataOnly);
        assert!(!registry.has_resource(&id("a.png"), Granularity::MetadataOnly));

        // In-flight table keeps it alive until the decode lands
        assert!(weak.upgrade().is_some());
        decoder.succeed_all();
        registry.pump();
        assert!(weak.upgrade().is_none());
        assert_eq!(registry.in_flight_count(), 0);
    }

    #[test]
    fn test_cleared_while_loading_reaches_holder() {
        let (registry, decoder) = registry_with(3);
        let a = registry.load(id("a.png"), Granularity::Full);
        registry.clear_cache();

        decoder.succeed(&id("a.png"));
        registry.pump();
        assert_eq!(a.state(), LoadState::FullyLoaded);
        assert!(!registry.has_resource(&id("a.png"), Granularity::Full));
    }

    #[test]
    fn test_failed_decode() {
        let (registry, decoder) = registry_with(3);
        let busy_events = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::clone(&busy_events);
        registry.events().subscribe::<BusyStateChanged, _>(move |e| {
            b.lock().unwrap().push(e.busy);
        });

        let a = registry.load(id("a.png"), Granularity::Full);
        decoder.fail(&id("a.png"));
        registry.pump();

        assert_eq!(a.state(), LoadState::Failed);
        assert!(!a.is_loaded(Granularity::MetadataOnly));
        assert!(!registry.is_busy(&id("a.png")));
        assert_eq!(*busy_events.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_save_if_modified() {
        let (registry, decoder) = registry_with(3);
        let saver = RecordingSaver::new(false);
        let a = loaded(&registry, &decoder, "a.png");

        // Clean: nothing to ask
        let ok = registry
            .save_if_modified(&a, &saver, ModifiedBehavior::Ask, |_| panic!("should not ask"))
            .unwrap();
        assert!(ok);

        registry.apply_edit(&a, Edit::Flip).unwrap();
        let ok = registry
            .save_if_modified(&a, &saver, ModifiedBehavior::Ask, |_| Resolution::Cancel)
            .unwrap();
        assert!(!ok);
        assert!(a.is_modified());

        let ok = registry
            .save_if_modified(&a, &saver, ModifiedBehavior::SaveSilently, |_| Resolution::Cancel)
            .unwrap();
        assert!(ok);
        assert!(!a.is_modified());

        registry.apply_edit(&a, Edit::Flip).unwrap();
        let ok = registry
            .save_if_modified(&a, &saver, ModifiedBehavior::DiscardChanges, |_| Resolution::Cancel)
            .unwrap();
        assert!(ok);
        decoder.succeed(&id("a.png"));
        registry.pump();
        assert!(!a.is_modified());
        assert_eq!(saver.saved.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_undo_scope_registered_per_resource() {
        let (registry, _decoder) = registry_with(3);
        let a = registry.load(id("a.png"), Granularity::MetadataOnly);
        let _b = registry.load(id("b.png"), Granularity::MetadataOnly);
        assert_eq!(registry.undo_group().scope_count(), 2);

        registry.undo_group().set_active(Some(id("a.png")));
        let active = registry.undo_group().active_scope().unwrap();
        assert_eq!(active.id(), a.undo_scope().id());
    }

    #[test]
    fn test_subscriber_can_reenter_registry() {
        let (registry, decoder) = registry_with(3);
        let registry = Arc::new(registry);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&registry);
        let s = Arc::clone(&seen);
        registry.events().subscribe::<ModifiedListChanged, _>(move |_| {
            if let Some(registry) = weak.upgrade() {
                s.lock().unwrap().push(registry.modified_resource_list());
            }
        });

        let a = loaded(&registry, &decoder, "a.png");
        registry.apply_edit(&a, Edit::Mirror).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![vec![id("a.png")]]);
    }

    #[test]
    fn test_reload_after_clear_resets_dirty_set() {
        let (registry, decoder) = registry_with(3);
        let a = loaded(&registry, &decoder, "a.png");
        registry.apply_edit(&a, Edit::Flip).unwrap();
        registry.clear_cache();
        drop(a);
        assert_eq!(registry.modified_resource_list(), vec![id("a.png")]);

        let list_changes = count_events::<ModifiedListChanged>(&registry);
        let fresh = registry.load(id("a.png"), Granularity::Full);

        assert!(!fresh.is_modified());
        assert!(registry.modified_resource_list().is_empty());
        assert_eq!(registry.is_modified(&id("a.png")), fresh.is_modified());
        assert_eq!(list_changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_completion_leaves_live_instance_alone() {
        let (registry, decoder) = registry_with(1);
        let old = registry.load(id("a.png"), Granularity::MetadataOnly);
        drop(old);
        // Evicts a while its metadata decode is still in flight
        registry.load(id("b.png"), Granularity::MetadataOnly);
        assert!(!registry.has_resource(&id("a.png"), Granularity::MetadataOnly));

        let live = registry.load(id("a.png"), Granularity::Full);
        decoder.succeed_latest(&id("a.png"));
        registry.pump();
        registry.apply_edit(&live, Edit::Flip).unwrap();
        assert_eq!(registry.modified_resource_list(), vec![id("a.png")]);

        let list_changes = count_events::<ModifiedListChanged>(&registry);
        let changes = count_events::<ResourceChanged>(&registry);
        decoder.succeed(&id("a.png"));
        assert_eq!(registry.pump(), 1);

        assert!(live.is_modified());
        assert_eq!(registry.modified_resource_list(), vec![id("a.png")]);
        assert_eq!(list_changes.load(Ordering::SeqCst), 0);
        assert_eq!(changes.load(Ordering::SeqCst), 0);
        // Only b is still decoding
        assert_eq!(registry.in_flight_count(), 1);
    }

    #[test]
    fn test_detached_save_does_not_clear_live_entry() {
        let (registry, decoder) = registry_with(3);
        let old = loaded(&registry, &decoder, "a.png");
        registry.apply_edit(&old, Edit::Flip).unwrap();
        registry.clear_cache();

        let live = loaded(&registry, &decoder, "a.png");
        registry.apply_edit(&live, Edit::Mirror).unwrap();

        registry.save(&old, &RecordingSaver::new(false)).unwrap();
        assert!(!old.is_modified());
        assert!(live.is_modified());
        assert_eq!(registry.modified_resource_list(), vec![id("a.png")]);
    }

    /// Saver that edits the same resource while "writing"
    struct EditingSaver {
        registry: Arc<Registry>,
        handle: ResourceHandle,
    }

    impl Saver for EditingSaver {
        fn save(&self, _id: &ResourceId, _image: &DynamicImage) -> Result<(), SaveError> {
            self.registry
                .apply_edit(&self.handle, Edit::Mirror)
                .map_err(|e| SaveError::Rejected(e.to_string()))
        }
    }

    #[test]
    fn test_edit_during_save_stays_dirty() {
        let (registry, decoder) = registry_with(3);
        let registry = Arc::new(registry);
        let a = loaded(&registry, &decoder, "a.png");
        registry.apply_edit(&a, Edit::Flip).unwrap();

        let saver = EditingSaver {
            registry: Arc::clone(&registry),
            handle: a.clone(),
        };
        registry.save(&a, &saver).unwrap();

        assert!(a.is_modified());
        assert_eq!(registry.modified_resource_list(), vec![id("a.png")]);
        assert!(!a.undo_scope().is_clean());

        // A plain save afterwards persists the latest edit
        registry.save(&a, &RecordingSaver::new(false)).unwrap();
        assert!(!a.is_modified());
        assert!(registry.modified_resource_list().is_empty());
    }

    /// Decoder that loses every request
    struct DroppingDecoder;

    impl Decoder for DroppingDecoder {
        fn begin_load(&self, _request: DecodeRequest) {}
    }

    #[test]
    fn test_abandoned_decode_fails_resource() {
        let registry = Registry::new(Arc::new(DroppingDecoder), &RegistryConfig::default());
        let a = registry.load(id("a.png"), Granularity::Full);

        assert_eq!(registry.pump(), 1);
        assert_eq!(a.state(), LoadState::Failed);
        assert!(!registry.is_busy(&id("a.png")));
        assert_eq!(registry.in_flight_count(), 0);
        assert!(a.last_error().unwrap().contains("abandoned"));
    }

    #[test]
    fn test_image_decoder_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pic.png");
        DynamicImage::ImageRgba8(image::RgbaImage::new(6, 4)).save(&path).unwrap();

        let config = RegistryConfig {
            decoder_threads: 2,
            ..RegistryConfig::default()
        };
        let registry = Registry::with_image_decoder(&config);
        let handle = registry.load(path.as_path(), Granularity::MetadataOnly);
        assert!(registry.wait_idle(Duration::from_secs(5)));
        assert_eq!(handle.metadata().unwrap().width, 6);

        registry.load(path.as_path(), Granularity::Full);
        assert!(registry.wait_idle(Duration::from_secs(5)));
        assert_eq!(handle.state(), LoadState::FullyLoaded);
        assert_eq!(handle.pixels().unwrap().height(), 4);
    }
}
