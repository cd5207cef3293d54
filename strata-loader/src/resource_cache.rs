use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use crossbeam_channel::{Receiver, Sender};

use strata_base::handle::{GenericHandle, HandleState, LoadStateProvider, RefOp, Resource};
use strata_base::hashing::{HashMap, HashSet};
use strata_base::header::{
    read_payload, write_resource_file, CompressionMethod, ResourceHeader,
};
use strata_base::ResourceId;

use crate::decode_pool::{DecodeJob, DecodePool, PayloadJob};
use crate::error::{CacheError, CacheResult};
use crate::manifest::Manifest;

bitflags! {
    /// Behavior flags for load requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoadFlags: u32 {
        /// Schedule every dependency discovered in the header through the
        /// same pipeline and hold the parent until they complete.
        const LOAD_DEPENDENCIES = 1 << 0;
        /// Pin the resource inside the cache so it survives after every
        /// caller-owned handle drops, until released.
        const KEEP_INTERNAL_REF = 1 << 1;
        /// Retain the decoded payload bytes alongside the live object.
        const KEEP_SOURCE_DATA = 1 << 2;
    }
}

impl Default for LoadFlags {
    fn default() -> Self {
        LoadFlags::LOAD_DEPENDENCIES | LoadFlags::KEEP_INTERNAL_REF
    }
}

/// Collaborator seam for the payload codec. Implementations translate
/// between stored payload bytes and live resource objects; the cache never
/// interprets payload bytes itself.
pub trait ResourceCodec: Send + Sync {
    fn decode(
        &self,
        id: ResourceId,
        bytes: &[u8],
    ) -> CacheResult<Arc<dyn Resource>>;

    fn encode(
        &self,
        id: ResourceId,
        resource: &dyn Resource,
    ) -> CacheResult<Vec<u8>>;
}

/// Lifecycle events published on the cache's event channel, consumed by the
/// [`ListenerRegistry`](crate::listener::ListenerRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Loaded(ResourceId),
    Destroyed(ResourceId),
    Modified(ResourceId),
}

// Transient bookkeeping for one in-flight load. Lives as a value inside the
// in_progress map for exactly the duration of the load.
//
// `remaining` always accounts one unit for the resource's own payload decode,
// so a record can never finalize before its payload exists even with zero
// real dependencies.
struct LoadRecord {
    state: Arc<HandleState>,
    payload: Option<Arc<dyn Resource>>,
    remaining: u32,
    // Dependency ids already folded into `remaining`, so a racing second
    // header merge extends the countdown instead of double-counting.
    tracked: HashSet<ResourceId>,
    // Strong handles pinning dependencies alive for the load's duration.
    dependencies: Vec<GenericHandle>,
    flags: LoadFlags,
    // Internal refs taken through this record while in flight; unwound if
    // the load fails.
    internal_refs_taken: u32,
    header: Option<ResourceHeader>,
    source_data: Option<Vec<u8>>,
}

impl LoadRecord {
    fn new(
        state: Arc<HandleState>,
        flags: LoadFlags,
    ) -> Self {
        LoadRecord {
            state,
            payload: None,
            remaining: 1,
            tracked: HashSet::default(),
            dependencies: Vec::new(),
            flags,
            internal_refs_taken: 0,
            header: None,
            source_data: None,
        }
    }
}

struct LoadedEntry {
    state: Arc<HandleState>,
    // Keeps the dependency graph below this resource alive; dropping these
    // on destroy is what cascades reclamation.
    dependencies: Vec<GenericHandle>,
    header: ResourceHeader,
    source_data: Option<Vec<u8>>,
}

#[derive(Default)]
struct CacheState {
    // Every identity this cache has ever vended a handle for, while any such
    // handle or entry is alive.
    handles: HashMap<ResourceId, std::sync::Weak<HandleState>>,
    loaded: HashMap<ResourceId, LoadedEntry>,
    in_progress: HashMap<ResourceId, LoadRecord>,
    // dependency id -> parents whose countdown is waiting on it
    dependants: HashMap<ResourceId, Vec<ResourceId>>,
    manifests: Vec<Arc<dyn Manifest>>,
    // Identities minted for paths with no manifest entry, retained so every
    // later load of the same path resolves to the same identity.
    generated_ids: HashMap<PathBuf, ResourceId>,
}

impl CacheState {
    fn resolve_path(
        &self,
        id: ResourceId,
    ) -> Option<PathBuf> {
        // Most recently registered manifest wins.
        self.manifests.iter().rev().find_map(|m| m.path_for(id))
    }

    fn resolve_id(
        &self,
        path: &Path,
    ) -> Option<ResourceId> {
        self.manifests.iter().rev().find_map(|m| m.id_for(path))
    }
}

pub(crate) struct CacheCore {
    state: Mutex<CacheState>,
    codec: Box<dyn ResourceCodec>,
    ref_op_tx: Sender<RefOp>,
    ref_op_rx: Receiver<RefOp>,
    events_tx: Sender<CacheEvent>,
    events_rx: Receiver<CacheEvent>,
}

impl CacheCore {
    fn strong_handle(
        &self,
        state: &Arc<HandleState>,
    ) -> GenericHandle {
        GenericHandle::new(state.clone(), self.ref_op_tx.clone())
    }

    fn resolve_or_create_state(
        &self,
        s: &mut CacheState,
        id: ResourceId,
    ) -> Arc<HandleState> {
        if let Some(weak) = s.handles.get(&id) {
            if let Some(state) = weak.upgrade() {
                // A retired or failed state never resurrects; the identity
                // gets a fresh one.
                if !state.is_retired() && !state.is_failed() {
                    return state;
                }
            }
        }
        let state = HandleState::new(id);
        s.handles.insert(id, Arc::downgrade(&state));
        state
    }

    // Folds a freshly read header into the in-flight record: extends the
    // countdown by every dependency that is not the resource itself, not
    // already tracked, and not already loaded. Already-loaded dependencies
    // are pinned but never counted, since nothing will ever decrement them.
    // Returns the dependency ids the caller must now schedule.
    fn merge_header_locked(
        &self,
        s: &mut CacheState,
        id: ResourceId,
        header: ResourceHeader,
    ) -> Vec<ResourceId> {
        let (load_dependencies, tracked) = match s.in_progress.get(&id) {
            Some(record) => (
                record.flags.contains(LoadFlags::LOAD_DEPENDENCIES),
                record.tracked.clone(),
            ),
            None => return Vec::new(),
        };

        let mut count_deps = Vec::new();
        let mut pinned = Vec::new();
        if load_dependencies {
            for dep in &header.dependencies {
                // Self-dependency cycles are explicitly ignored.
                if *dep == id || tracked.contains(dep) || count_deps.contains(dep) {
                    continue;
                }
                match s.loaded.get(dep) {
                    Some(entry) => pinned.push(entry.state.clone()),
                    None => count_deps.push(*dep),
                }
            }
        }

        for dep in &count_deps {
            s.dependants.entry(*dep).or_default().push(id);
        }

        let record = s.in_progress.get_mut(&id).unwrap();
        record.header = Some(header);
        record.remaining += count_deps.len() as u32;
        for dep in &count_deps {
            record.tracked.insert(*dep);
        }
        for state in pinned {
            record.tracked.insert(state.resource_id());
            record
                .dependencies
                .push(GenericHandle::new(state, self.ref_op_tx.clone()));
        }

        count_deps
    }

    // Decrements the countdown of every record waiting on `id`, finalizing
    // any that reach zero. Runs for successful and failed completions alike:
    // a failed dependency counts as complete so a bad file cannot wedge every
    // parent above it, and the failure stays observable because the failed
    // identity never becomes created.
    fn notify_dependants_locked(
        &self,
        s: &mut CacheState,
        id: ResourceId,
    ) {
        let Some(waiting) = s.dependants.remove(&id) else {
            return;
        };
        for parent in waiting {
            let finalize = match s.in_progress.get_mut(&parent) {
                Some(record) => {
                    record.remaining -= 1;
                    record.remaining == 0
                }
                None => false,
            };
            if finalize {
                self.finalize_locked(s, parent);
            }
        }
    }

    // The countdown reaching zero exactly once makes this exactly-once per
    // identity: the record moves out of in_progress, the payload is
    // published (waking blocked waiters), and dependants are walked.
    fn finalize_locked(
        &self,
        s: &mut CacheState,
        id: ResourceId,
    ) {
        let Some(record) = s.in_progress.remove(&id) else {
            return;
        };
        debug_assert_eq!(record.remaining, 0);

        let Some(payload) = record.payload else {
            log::error!("{:?} finalized without a payload", id);
            record.state.mark_failed();
            self.notify_dependants_locked(s, id);
            return;
        };

        record.state.set_payload(payload);
        s.loaded.insert(
            id,
            LoadedEntry {
                state: record.state,
                dependencies: record.dependencies,
                header: record.header.unwrap_or_default(),
                source_data: record.source_data,
            },
        );
        let _ = self.events_tx.send(CacheEvent::Loaded(id));
        log::debug!("loaded resource {:?}", id);

        self.notify_dependants_locked(s, id);
    }

    fn fail_in_progress_locked(
        &self,
        s: &mut CacheState,
        id: ResourceId,
    ) {
        if let Some(record) = s.in_progress.remove(&id) {
            for _ in 0..record.internal_refs_taken {
                record.state.remove_internal();
            }
            record.state.mark_failed();
            // record.dependencies drop here; their ref-ops queue as usual.
        }
        self.notify_dependants_locked(s, id);
    }

    pub(crate) fn load_complete(
        &self,
        id: ResourceId,
        payload: Arc<dyn Resource>,
        source_bytes: Vec<u8>,
    ) {
        let mut s = self.state.lock().unwrap();
        let Some(record) = s.in_progress.get_mut(&id) else {
            log::warn!("completion for {:?} arrived after its record was removed", id);
            return;
        };
        record.payload = Some(payload);
        if record.flags.contains(LoadFlags::KEEP_SOURCE_DATA) {
            record.source_data = Some(source_bytes);
        }
        record.remaining -= 1;
        log::debug!("decoded {:?}, {} units outstanding", id, record.remaining);
        if record.remaining == 0 {
            self.finalize_locked(&mut s, id);
        }
    }

    pub(crate) fn load_failed(
        &self,
        id: ResourceId,
    ) {
        let mut s = self.state.lock().unwrap();
        self.fail_in_progress_locked(&mut s, id);
    }

    // Runs on a decode worker or inline on the calling thread.
    pub(crate) fn execute_decode(
        &self,
        job: PayloadJob,
    ) {
        let id = job.resource_id;
        match self.read_and_decode(&job) {
            Ok((payload, bytes)) => self.load_complete(id, payload, bytes),
            Err(e) => {
                log::error!("failed to decode {:?} from {:?}: {}", id, job.path, e);
                self.load_failed(id);
            }
        }
    }

    fn read_and_decode(
        &self,
        job: &PayloadJob,
    ) -> CacheResult<(Arc<dyn Resource>, Vec<u8>)> {
        let mut file = std::io::BufReader::new(std::fs::File::open(&job.path)?);
        // Skip past the header block to the payload.
        let _ = ResourceHeader::read(&mut file)?;
        let bytes = read_payload(&mut file, job.header.compression)?;
        let payload = self.codec.decode(job.resource_id, &bytes)?;
        Ok((payload, bytes))
    }

    // Pins a dependency handle to its parent for the remainder of the load,
    // or to the loaded entry if the parent already finalized.
    pub(crate) fn pin_dependency(
        &self,
        parent: ResourceId,
        dep_handle: GenericHandle,
    ) {
        let mut s = self.state.lock().unwrap();
        if let Some(record) = s.in_progress.get_mut(&parent) {
            record.dependencies.push(dep_handle);
        } else if let Some(entry) = s.loaded.get_mut(&parent) {
            entry.dependencies.push(dep_handle);
        }
        // Parent already failed or was destroyed: the handle just drops.
    }

    pub(crate) fn process_ref_ops(&self) {
        while let Ok(ref_op) = self.ref_op_rx.try_recv() {
            match ref_op {
                RefOp::Dropped(id) => self.handle_dropped(id),
            }
        }
    }

    fn handle_dropped(
        &self,
        id: ResourceId,
    ) {
        let mut s = self.state.lock().unwrap();
        let destroy = match s.loaded.get(&id) {
            // Re-check under the lock: a load since the drop resurrects the
            // count and cancels reclamation.
            Some(entry) => entry.state.external_refs() == 0,
            None => {
                let stale = s.handles.get(&id).map_or(false, |w| w.strong_count() == 0);
                if stale {
                    s.handles.remove(&id);
                }
                false
            }
        };
        if destroy {
            self.destroy_locked(&mut s, id);
        }
    }

    fn destroy_locked(
        &self,
        s: &mut CacheState,
        id: ResourceId,
    ) -> bool {
        let Some(entry) = s.loaded.get(&id) else {
            return false;
        };
        // try_retire re-verifies the external count against concurrent weak
        // upgrades before the payload is dropped.
        if !entry.state.try_retire() {
            return false;
        }
        let entry = s.loaded.remove(&id).unwrap();
        s.handles.remove(&id);
        let _ = self.events_tx.send(CacheEvent::Destroyed(id));
        log::debug!("destroyed resource {:?}", id);
        // Dropping the entry's dependency handles queues their ref-ops,
        // which is what cascades reclamation through the graph.
        drop(entry);
        true
    }

    fn release_id(
        &self,
        id: ResourceId,
    ) {
        // An accepted decode cannot be cancelled; wait it out first, then
        // re-evaluate.
        loop {
            let in_flight = {
                let s = self.state.lock().unwrap();
                s.in_progress.get(&id).map(|r| r.state.clone())
            };
            match in_flight {
                Some(state) => state.wait_until_complete(),
                None => break,
            }
        }

        let mut s = self.state.lock().unwrap();
        if let Some(entry) = s.loaded.get(&id) {
            if entry.state.internal_refs() > 0 {
                entry.state.remove_internal();
            }
            if entry.state.external_refs() == 0 {
                self.destroy_locked(&mut s, id);
            }
        }
    }

    fn is_loaded_locked(
        &self,
        s: &CacheState,
        id: ResourceId,
        check_dependencies: bool,
        visited: &mut HashSet<ResourceId>,
    ) -> bool {
        let Some(entry) = s.loaded.get(&id) else {
            return false;
        };
        let Some(payload) = entry.state.payload() else {
            return false;
        };
        if !check_dependencies {
            return true;
        }
        if !visited.insert(id) {
            // Already under evaluation higher up the walk.
            return true;
        }
        payload
            .dependencies()
            .iter()
            .all(|dep| *dep == id || self.is_loaded_locked(s, *dep, true, visited))
    }
}

/// The resource manager: turns identities and manifest-mapped paths into
/// live, reference-counted handles with at-most-once loading per identity.
///
/// Explicitly constructed and shared by reference; there is no global
/// instance. All map state sits behind one mutex, handle reference counts
/// are atomic on the shared [`HandleState`]s.
pub struct ResourceCache {
    core: Arc<CacheCore>,
    pool: DecodePool,
}

impl ResourceCache {
    pub fn new(codec: Box<dyn ResourceCodec>) -> Self {
        Self::with_worker_threads(codec, 4)
    }

    pub fn with_worker_threads(
        codec: Box<dyn ResourceCodec>,
        thread_count: usize,
    ) -> Self {
        let (ref_op_tx, ref_op_rx) = crossbeam_channel::unbounded();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        ResourceCache {
            core: Arc::new(CacheCore {
                state: Mutex::new(CacheState::default()),
                codec,
                ref_op_tx,
                ref_op_rx,
                events_tx,
                events_rx,
            }),
            pool: DecodePool::new(thread_count),
        }
    }

    pub fn register_manifest(
        &self,
        manifest: Arc<dyn Manifest>,
    ) {
        self.core.state.lock().unwrap().manifests.push(manifest);
    }

    pub fn unregister_manifest(
        &self,
        manifest: &Arc<dyn Manifest>,
    ) {
        self.core
            .state
            .lock()
            .unwrap()
            .manifests
            .retain(|m| !Arc::ptr_eq(m, manifest));
    }

    /// Receiver for lifecycle events. Intended for a single consumer such as
    /// the [`ListenerRegistry`](crate::listener::ListenerRegistry).
    pub fn events(&self) -> Receiver<CacheEvent> {
        self.core.events_rx.clone()
    }

    /// Blocking load by path. Returns an unresolved handle when the path
    /// cannot be resolved or read; loading is best-effort per request.
    pub fn load(
        &self,
        path: &Path,
        flags: LoadFlags,
    ) -> GenericHandle {
        let id = self.resolve_or_generate_id(path);
        self.load_internal(id, Some(path.to_path_buf()), false, flags)
    }

    /// Non-blocking load by path; the decode runs on the worker pool unless
    /// the resource's header forbids async loading.
    pub fn load_async(
        &self,
        path: &Path,
        flags: LoadFlags,
    ) -> GenericHandle {
        let id = self.resolve_or_generate_id(path);
        self.load_internal(id, Some(path.to_path_buf()), true, flags)
    }

    /// Load by identity; the path comes from the registered manifests.
    pub fn load_from_identifier(
        &self,
        id: ResourceId,
        asynchronous: bool,
        flags: LoadFlags,
    ) -> GenericHandle {
        self.load_internal(id, None, asynchronous, flags)
    }

    fn resolve_or_generate_id(
        &self,
        path: &Path,
    ) -> ResourceId {
        let mut s = self.core.state.lock().unwrap();
        if let Some(id) = s.resolve_id(path) {
            return id;
        }
        *s.generated_ids
            .entry(path.to_path_buf())
            .or_insert_with(ResourceId::generate)
    }

    #[profiling::function]
    fn load_internal(
        &self,
        id: ResourceId,
        path: Option<PathBuf>,
        asynchronous: bool,
        flags: LoadFlags,
    ) -> GenericHandle {
        let core = &self.core;
        let handle;
        let mut fresh: Option<PathBuf> = None;
        {
            let mut s = core.state.lock().unwrap();

            if let Some(record) = s.in_progress.get_mut(&id) {
                // Attach to the in-flight load instead of issuing another.
                if flags.contains(LoadFlags::KEEP_INTERNAL_REF) {
                    record.state.add_internal();
                    record.internal_refs_taken += 1;
                }
                handle = core.strong_handle(&record.state);
            } else if let Some(entry) = s.loaded.get(&id) {
                if flags.contains(LoadFlags::KEEP_INTERNAL_REF) {
                    entry.state.add_internal();
                }
                handle = core.strong_handle(&entry.state);
            } else {
                let state = core.resolve_or_create_state(&mut s, id);
                handle = core.strong_handle(&state);

                let resolved = path.or_else(|| s.resolve_path(id));
                let Some(file_path) = resolved else {
                    log::warn!("no manifest entry or in-memory resource for {:?}", id);
                    state.mark_failed();
                    core.notify_dependants_locked(&mut s, id);
                    return handle;
                };
                if !file_path.exists() {
                    log::warn!("resource file {:?} for {:?} does not exist", file_path, id);
                    state.mark_failed();
                    core.notify_dependants_locked(&mut s, id);
                    return handle;
                }

                let mut record = LoadRecord::new(state.clone(), flags);
                if flags.contains(LoadFlags::KEEP_INTERNAL_REF) {
                    state.add_internal();
                    record.internal_refs_taken = 1;
                }
                s.in_progress.insert(id, record);
                fresh = Some(file_path);
            }
        }

        if let Some(file_path) = fresh {
            self.start_load(id, file_path, asynchronous, flags);
        }

        // Synchronous semantics: never return an incomplete handle, even
        // when the actual decode was accepted by an async in-flight load.
        if !asynchronous {
            handle.wait_until_complete();
        }
        handle
    }

    fn start_load(
        &self,
        id: ResourceId,
        file_path: PathBuf,
        asynchronous: bool,
        flags: LoadFlags,
    ) {
        let core = &self.core;

        // The header is a small synchronous read; it reveals the dependency
        // list before the heavy decode is scheduled.
        let header = (|| -> CacheResult<ResourceHeader> {
            let mut file = std::io::BufReader::new(std::fs::File::open(&file_path)?);
            Ok(ResourceHeader::read(&mut file)?)
        })();
        let header = match header {
            Ok(header) => header,
            Err(e) => {
                log::error!("unreadable header for {:?} at {:?}: {}", id, file_path, e);
                let mut s = core.state.lock().unwrap();
                core.fail_in_progress_locked(&mut s, id);
                return;
            }
        };

        let new_deps = {
            let mut s = core.state.lock().unwrap();
            core.merge_header_locked(&mut s, id, header.clone())
        };

        // Heavy decode: inline when the request is synchronous or the
        // resource forbids async loading, on the worker pool otherwise.
        let job = PayloadJob {
            core: core.clone(),
            resource_id: id,
            path: file_path,
            header: header.clone(),
        };
        if asynchronous && header.allow_async_loading {
            self.pool.submit(DecodeJob::Payload(job));
        } else {
            core.execute_decode(job);
        }

        // Dependencies go through the same pipeline, in the parent's mode so
        // an async request never blocks its caller on dependency IO.
        // Internal-ref pinning never propagates to resources loaded purely
        // as dependencies.
        if flags.contains(LoadFlags::LOAD_DEPENDENCIES) {
            let dep_flags = flags & (LoadFlags::LOAD_DEPENDENCIES | LoadFlags::KEEP_SOURCE_DATA);
            for dep in new_deps {
                let dep_handle = self.load_from_identifier(dep, asynchronous, dep_flags);
                core.pin_dependency(id, dep_handle);
            }
        }
    }

    /// Publishes an in-memory object as a loaded resource, bypassing the
    /// loading pipeline entirely.
    pub fn insert(
        &self,
        id: ResourceId,
        resource: Arc<dyn Resource>,
        flags: LoadFlags,
    ) -> GenericHandle {
        let core = &self.core;
        let mut s = core.state.lock().unwrap();

        if let Some(record) = s.in_progress.get(&id) {
            log::warn!("{:?} is already being loaded; returning the in-flight handle", id);
            return core.strong_handle(&record.state);
        }
        if let Some(entry) = s.loaded.get(&id) {
            log::warn!("{:?} is already loaded; returning the existing resource", id);
            if flags.contains(LoadFlags::KEEP_INTERNAL_REF) {
                entry.state.add_internal();
            }
            return core.strong_handle(&entry.state);
        }

        let state = core.resolve_or_create_state(&mut s, id);
        state.set_payload(resource.clone());
        s.loaded.insert(
            id,
            LoadedEntry {
                state: state.clone(),
                dependencies: Vec::new(),
                header: ResourceHeader {
                    dependencies: resource.dependencies(),
                    ..Default::default()
                },
                source_data: None,
            },
        );
        if flags.contains(LoadFlags::KEEP_INTERNAL_REF) {
            state.add_internal();
        }
        let _ = core.events_tx.send(CacheEvent::Loaded(id));
        core.strong_handle(&state)
    }

    /// Swaps the live object for a loaded identity in place (hot reload).
    /// Every outstanding handle observes the new payload.
    pub fn replace(
        &self,
        id: ResourceId,
        resource: Arc<dyn Resource>,
    ) -> CacheResult<()> {
        let core = &self.core;
        let mut s = core.state.lock().unwrap();
        let Some(entry) = s.loaded.get_mut(&id) else {
            return Err(CacheError::NotLoaded(id));
        };
        entry.state.swap_payload(resource);
        let _ = core.events_tx.send(CacheEvent::Modified(id));
        log::debug!("replaced resource {:?}", id);
        Ok(())
    }

    /// Drops one cache-internal reference for the handle's identity,
    /// destroying the resource if nothing else owns it. Blocks while a load
    /// for the identity is in flight.
    pub fn release(
        &self,
        handle: &GenericHandle,
    ) {
        self.core.release_id(handle.resource_id());
    }

    /// Processes pending handle drops. Reclamation runs here, on the
    /// caller's schedule, never on whichever thread dropped the last handle.
    pub fn process_ref_ops(&self) {
        self.core.process_ref_ops();
    }

    /// Per-frame pump: currently ref-op processing.
    pub fn update(&self) {
        self.process_ref_ops();
    }

    /// Releases every loaded resource with no owner outside the cache's own
    /// bookkeeping, i.e. whose external count equals its internal count.
    /// Releasing one resource can cascade into its dependencies, so passes
    /// repeat until nothing else comes free.
    #[profiling::function]
    pub fn unload_all_unused(&self) {
        let core = &self.core;
        core.process_ref_ops();
        loop {
            let mut released_any = false;
            let ids: Vec<ResourceId> = {
                let s = core.state.lock().unwrap();
                s.loaded.keys().copied().collect()
            };
            for id in ids {
                let mut s = core.state.lock().unwrap();
                // Entries released by an earlier cascade are simply gone.
                let Some(entry) = s.loaded.get(&id) else {
                    continue;
                };
                if entry.state.external_refs() != entry.state.internal_refs() {
                    continue;
                }
                while entry.state.internal_refs() > 0 {
                    entry.state.remove_internal();
                }
                if core.destroy_locked(&mut s, id) {
                    released_any = true;
                }
            }
            core.process_ref_ops();
            if !released_any {
                break;
            }
        }
    }

    /// Forced teardown: waits out in-flight loads, then destroys every
    /// loaded resource regardless of outstanding references. Surviving
    /// handles can no longer reach a payload.
    pub fn unload_all(&self) {
        let core = &self.core;
        loop {
            let in_flight: Vec<Arc<HandleState>> = {
                let s = core.state.lock().unwrap();
                s.in_progress.values().map(|r| r.state.clone()).collect()
            };
            if in_flight.is_empty() {
                break;
            }
            for state in in_flight {
                state.wait_until_complete();
            }
        }

        core.process_ref_ops();
        let mut s = core.state.lock().unwrap();
        let ids: Vec<ResourceId> = s.loaded.keys().copied().collect();
        for id in ids {
            if let Some(entry) = s.loaded.remove(&id) {
                entry.state.retire();
                let _ = core.events_tx.send(CacheEvent::Destroyed(id));
            }
        }
        s.handles.clear();
        s.dependants.clear();
    }

    /// Persists a loaded resource. The dependency list is recomputed from
    /// the in-memory payload, never read back from disk. The destination is
    /// replaced atomically only after the full write succeeded, so an
    /// existing file can never be left half-written.
    pub fn save(
        &self,
        handle: &GenericHandle,
        path: Option<&Path>,
        overwrite: bool,
        compress: bool,
    ) -> CacheResult<()> {
        let core = &self.core;
        let id = handle.resource_id();

        // Wait out an in-flight load for this identity.
        loop {
            let in_flight = {
                let s = core.state.lock().unwrap();
                s.in_progress.get(&id).map(|r| r.state.clone())
            };
            match in_flight {
                Some(state) => state.wait_until_complete(),
                None => break,
            }
        }

        let (payload, allow_async_loading) = {
            let s = core.state.lock().unwrap();
            match s.loaded.get(&id) {
                Some(entry) => {
                    let payload = entry.state.payload().ok_or(CacheError::NotLoaded(id))?;
                    (payload, entry.header.allow_async_loading)
                }
                // A handle constructed straight from an in-memory object may
                // never have gone through this cache.
                None => (handle.payload().ok_or(CacheError::NotLoaded(id))?, true),
            }
        };

        let destination = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let s = core.state.lock().unwrap();
                s.resolve_path(id)
                    .ok_or(CacheError::UnresolvableIdentifier(id))?
            }
        };
        if destination.exists() && !overwrite {
            return Err(CacheError::SaveConflict(destination));
        }

        let header = ResourceHeader {
            dependencies: payload.dependencies(),
            allow_async_loading,
            compression: if compress {
                CompressionMethod::Deflate
            } else {
                CompressionMethod::None
            },
        };
        let bytes = core.codec.encode(id, payload.as_ref())?;

        let mut temp_path = destination.as_os_str().to_owned();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let write_result = (|| -> CacheResult<()> {
            let file = std::fs::File::create(&temp_path)?;
            let mut writer = std::io::BufWriter::new(file);
            write_resource_file(&mut writer, &header, &bytes)?;
            use std::io::Write;
            writer.flush()?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        std::fs::rename(&temp_path, &destination)?;
        log::debug!("saved {:?} to {:?}", id, destination);
        Ok(())
    }

    /// Reads only the header of the file at `path` and returns its
    /// dependency identities.
    pub fn get_dependencies(
        &self,
        path: &Path,
    ) -> CacheResult<Vec<ResourceId>> {
        if !path.exists() {
            return Err(CacheError::MissingFile(path.to_path_buf()));
        }
        let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
        let header = ResourceHeader::read(&mut file)?;
        Ok(header.dependencies)
    }

    /// Membership query: is the identity published as loaded (optionally
    /// counting an in-flight load as a hit)?
    pub fn is_loaded(
        &self,
        id: ResourceId,
        check_in_progress: bool,
    ) -> bool {
        let s = self.core.state.lock().unwrap();
        s.loaded.contains_key(&id) || (check_in_progress && s.in_progress.contains_key(&id))
    }

    /// Blocks until the handle's load finished; errors if it failed rather
    /// than loaded.
    pub fn block_until_loaded(
        &self,
        handle: &GenericHandle,
    ) -> CacheResult<()> {
        handle.wait_until_complete();
        if handle.is_created() {
            Ok(())
        } else {
            Err(CacheError::NotLoaded(handle.resource_id()))
        }
    }

    /// Decoded payload bytes retained for a `KEEP_SOURCE_DATA` load.
    pub fn source_data(
        &self,
        id: ResourceId,
    ) -> Option<Vec<u8>> {
        let s = self.core.state.lock().unwrap();
        s.loaded.get(&id).and_then(|e| e.source_data.clone())
    }

    /// Number of decode jobs currently queued or running.
    pub fn pending_decodes(&self) -> usize {
        self.pool.active_request_count()
    }
}

impl LoadStateProvider for ResourceCache {
    fn is_resource_loaded(
        &self,
        id: ResourceId,
        check_dependencies: bool,
    ) -> bool {
        let s = self.core.state.lock().unwrap();
        let mut visited = HashSet::default();
        self.core
            .is_loaded_locked(&s, id, check_dependencies, &mut visited)
    }
}
