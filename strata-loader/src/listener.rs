use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;

use strata_base::hashing::{HashMap, HashSet};
use strata_base::ResourceId;

use crate::resource_cache::CacheEvent;

/// Implemented by systems that want to react to resource lifecycle changes
/// without being wired into the loading machinery itself.
pub trait ResourceListener: Send + Sync {
    /// The identities this listener currently depends on. Queried lazily
    /// when the listener is dirty, not on every event.
    fn watched_resources(&self) -> Vec<ResourceId>;

    fn on_loaded(
        &self,
        _id: ResourceId,
    ) {
    }

    fn on_modified(
        &self,
        _id: ResourceId,
    ) {
    }

    fn on_destroyed(
        &self,
        _id: ResourceId,
    ) {
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct RegistryState {
    next_listener_id: u64,
    listeners: HashMap<ListenerId, Arc<dyn ResourceListener>>,
    by_resource: HashMap<ResourceId, Vec<ListenerId>>,
    by_listener: HashMap<ListenerId, Vec<ResourceId>>,
    // Listeners whose watched set must be re-queried before the next
    // delivery.
    dirty: HashSet<ListenerId>,
}

/// Fans the cache's lifecycle events out to registered listeners.
///
/// The listener <-> resource maps are rebuilt lazily: a listener is marked
/// dirty on registration or explicitly via `mark_dirty` when its dependencies
/// change, and the registry re-queries `watched_resources` on the next
/// `update`/`notify_listeners` pass.
pub struct ListenerRegistry {
    state: Mutex<RegistryState>,
    events_rx: Receiver<CacheEvent>,
}

impl ListenerRegistry {
    /// `events_rx` is the receiver handed out by
    /// [`ResourceCache::events`](crate::resource_cache::ResourceCache::events).
    pub fn new(events_rx: Receiver<CacheEvent>) -> Self {
        ListenerRegistry {
            state: Mutex::new(RegistryState::default()),
            events_rx,
        }
    }

    pub fn register(
        &self,
        listener: Arc<dyn ResourceListener>,
    ) -> ListenerId {
        let mut state = self.state.lock().unwrap();
        let id = ListenerId(state.next_listener_id);
        state.next_listener_id += 1;
        state.listeners.insert(id, listener);
        state.dirty.insert(id);
        id
    }

    pub fn unregister(
        &self,
        id: ListenerId,
    ) {
        let mut state = self.state.lock().unwrap();
        state.listeners.remove(&id);
        state.dirty.remove(&id);
        if let Some(watched) = state.by_listener.remove(&id) {
            for resource in watched {
                if let Some(listeners) = state.by_resource.get_mut(&resource) {
                    listeners.retain(|l| *l != id);
                }
            }
        }
    }

    /// Marks a listener's watched set stale, e.g. after it switched to a
    /// different set of resources.
    pub fn mark_dirty(
        &self,
        id: ListenerId,
    ) {
        self.state.lock().unwrap().dirty.insert(id);
    }

    /// Scheduled fan-out pass: rebuilds dirty listeners, then drains the
    /// event channel and delivers to every interested listener.
    #[profiling::function]
    pub fn update(&self) {
        self.rebuild_dirty();
        while let Ok(event) = self.events_rx.try_recv() {
            log::trace!("dispatch event {:?}", event);
            self.dispatch(event);
        }
    }

    /// Synchronous delivery for one identity, for callers that just blocked
    /// on a load and need listeners caught up before continuing.
    pub fn notify_listeners(
        &self,
        id: ResourceId,
    ) {
        self.rebuild_dirty();
        self.dispatch(CacheEvent::Loaded(id));
    }

    fn rebuild_dirty(&self) {
        // Query listeners outside the registry lock; a watched_resources
        // implementation may call back into the cache.
        let stale: Vec<(ListenerId, Arc<dyn ResourceListener>)> = {
            let mut state = self.state.lock().unwrap();
            let dirty = std::mem::take(&mut state.dirty);
            dirty
                .into_iter()
                .filter_map(|id| state.listeners.get(&id).map(|l| (id, l.clone())))
                .collect()
        };
        if stale.is_empty() {
            return;
        }

        let rebuilt: Vec<(ListenerId, Vec<ResourceId>)> = stale
            .into_iter()
            .map(|(id, listener)| (id, listener.watched_resources()))
            .collect();

        let mut state = self.state.lock().unwrap();
        for (id, watched) in rebuilt {
            if !state.listeners.contains_key(&id) {
                // Unregistered while we were querying it.
                continue;
            }
            if let Some(previous) = state.by_listener.remove(&id) {
                for resource in previous {
                    if let Some(listeners) = state.by_resource.get_mut(&resource) {
                        listeners.retain(|l| *l != id);
                    }
                }
            }
            for resource in &watched {
                state.by_resource.entry(*resource).or_default().push(id);
            }
            state.by_listener.insert(id, watched);
        }
    }

    fn dispatch(
        &self,
        event: CacheEvent,
    ) {
        let resource = match event {
            CacheEvent::Loaded(id) | CacheEvent::Destroyed(id) | CacheEvent::Modified(id) => id,
        };
        // Collect targets under the lock, call them outside it so a listener
        // can re-enter the registry.
        let targets: Vec<Arc<dyn ResourceListener>> = {
            let state = self.state.lock().unwrap();
            state
                .by_resource
                .get(&resource)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| state.listeners.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };
        for listener in targets {
            match event {
                CacheEvent::Loaded(id) => listener.on_loaded(id),
                CacheEvent::Modified(id) => listener.on_modified(id),
                CacheEvent::Destroyed(id) => listener.on_destroyed(id),
            }
        }
    }
}
