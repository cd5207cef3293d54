use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crossbeam_channel::Sender;
use downcast_rs::{impl_downcast, DowncastSync};

use crate::ResourceId;

/// The minimal capability the cache requires of a live resource object.
///
/// The dependency list is recomputed from the in-memory object every time it
/// is asked for; the loading machinery never caches it. Concrete resource
/// types layer any further capabilities (serialization, dual-representation
/// lifecycles) on top through their own traits.
pub trait Resource: DowncastSync {
    /// Identities of the resources this object refers to.
    fn dependencies(&self) -> Vec<ResourceId> {
        Vec::new()
    }
}
impl_downcast!(sync Resource);

/// Sent to the cache's ref-op channel by handle drops so reclamation can run
/// on the cache's schedule rather than on whichever thread dropped last.
#[derive(Debug)]
pub enum RefOp {
    /// The last strong handle for this identity went away.
    Dropped(ResourceId),
}

/// Lets a handle ask the component that loaded it about load state without
/// depending on that component's concrete type.
pub trait LoadStateProvider {
    /// True iff the identity is published as loaded. With
    /// `check_dependencies`, the whole graph reachable from its payload must
    /// be loaded too.
    fn is_resource_loaded(
        &self,
        id: ResourceId,
        check_dependencies: bool,
    ) -> bool;
}

#[derive(Default)]
struct StateInner {
    payload: Option<Arc<dyn Resource>>,
    created: bool,
    failed: bool,
    retired: bool,
}

/// The shared, mutable record backing every handle to one resource.
///
/// All handles for one identity point at the same `HandleState`. Once
/// `created` flips it never reverts for this instance; destroying the
/// resource retires the state and a later reload of the identity gets a
/// fresh one.
pub struct HandleState {
    resource_id: ResourceId,
    inner: Mutex<StateInner>,
    complete: Condvar,
    external_refs: AtomicU32,
    internal_refs: AtomicU32,
}

impl HandleState {
    /// An unresolved state. `set_payload` completes it later.
    pub fn new(resource_id: ResourceId) -> Arc<HandleState> {
        Arc::new(HandleState {
            resource_id,
            inner: Mutex::new(StateInner::default()),
            complete: Condvar::new(),
            external_refs: AtomicU32::new(0),
            internal_refs: AtomicU32::new(0),
        })
    }

    /// A state born created, for resources constructed from an in-memory
    /// object rather than loaded.
    pub fn new_created(
        resource_id: ResourceId,
        payload: Arc<dyn Resource>,
    ) -> Arc<HandleState> {
        let state = Self::new(resource_id);
        state.set_payload(payload);
        state
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub fn is_created(&self) -> bool {
        self.inner.lock().unwrap().created
    }

    pub fn is_failed(&self) -> bool {
        self.inner.lock().unwrap().failed
    }

    pub fn is_retired(&self) -> bool {
        self.inner.lock().unwrap().retired
    }

    pub fn payload(&self) -> Option<Arc<dyn Resource>> {
        self.inner.lock().unwrap().payload.clone()
    }

    /// Publishes the payload, marks the state created and wakes every thread
    /// blocked on this identity.
    pub fn set_payload(
        &self,
        payload: Arc<dyn Resource>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.payload = Some(payload);
        inner.created = true;
        self.complete.notify_all();
    }

    /// Swaps the live object in place (hot reload). The state stays created;
    /// returns the previous payload if there was one.
    pub fn swap_payload(
        &self,
        payload: Arc<dyn Resource>,
    ) -> Option<Arc<dyn Resource>> {
        let mut inner = self.inner.lock().unwrap();
        let previous = inner.payload.replace(payload);
        inner.created = true;
        previous
    }

    /// Marks the load as failed and wakes waiters. The state never becomes
    /// created afterwards.
    pub fn mark_failed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failed = true;
        self.complete.notify_all();
    }

    /// Retires the state iff no external reference exists, dropping the
    /// payload. Serialized against `upgrade` through the inner lock so a
    /// weak handle cannot resurrect a state that is being reclaimed.
    pub fn try_retire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if self.external_refs.load(Ordering::Acquire) != 0 {
            return false;
        }
        inner.retired = true;
        inner.payload = None;
        self.complete.notify_all();
        true
    }

    /// Unconditional retire, for forced unloads. Outstanding handles keep
    /// the state alive but can no longer reach a payload.
    pub fn retire(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.retired = true;
        inner.payload = None;
        self.complete.notify_all();
    }

    /// Blocks until the load for this identity finished, successfully or not.
    pub fn wait_until_complete(&self) {
        let mut inner = self.inner.lock().unwrap();
        while !inner.created && !inner.failed && !inner.retired {
            inner = self.complete.wait(inner).unwrap();
        }
    }

    //
    // Handle accounting. External references are owned by strong handles;
    // internal references are held by the cache and mirror into the external
    // counter, so `external >= internal` holds at all times and
    // `external == internal` means no owner exists outside the cache.
    //

    pub fn add_external(&self) -> u32 {
        self.external_refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn remove_external(&self) -> u32 {
        let previous = self.external_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
        previous - 1
    }

    pub fn add_internal(&self) {
        self.internal_refs.fetch_add(1, Ordering::AcqRel);
        self.add_external();
    }

    pub fn remove_internal(&self) {
        let previous = self.internal_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
        self.remove_external();
    }

    pub fn external_refs(&self) -> u32 {
        self.external_refs.load(Ordering::Acquire)
    }

    pub fn internal_refs(&self) -> u32 {
        self.internal_refs.load(Ordering::Acquire)
    }

    fn upgrade_external(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.retired {
            return false;
        }
        self.external_refs.fetch_add(1, Ordering::AcqRel);
        true
    }
}

impl Debug for HandleState {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("HandleState")
            .field("resource_id", &self.resource_id)
            .field("created", &self.is_created())
            .field("external_refs", &self.external_refs())
            .field("internal_refs", &self.internal_refs())
            .finish()
    }
}

/// One owned external reference. Construction and clone increment the
/// counter; drop decrements it and reports a drop-to-zero to the cache.
struct HandleRef {
    state: Arc<HandleState>,
    ref_op_tx: Sender<RefOp>,
}

impl HandleRef {
    fn new(
        state: Arc<HandleState>,
        ref_op_tx: Sender<RefOp>,
    ) -> Self {
        state.add_external();
        HandleRef { state, ref_op_tx }
    }
}

impl Clone for HandleRef {
    fn clone(&self) -> Self {
        self.state.add_external();
        HandleRef {
            state: self.state.clone(),
            ref_op_tx: self.ref_op_tx.clone(),
        }
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        if self.state.remove_external() == 0 {
            // The cache may already be gone during teardown.
            let _ = self
                .ref_op_tx
                .send(RefOp::Dropped(self.state.resource_id()));
        }
    }
}

/// Untyped strong handle to a resource.
pub struct GenericHandle {
    handle_ref: HandleRef,
}

impl GenericHandle {
    pub fn new(
        state: Arc<HandleState>,
        ref_op_tx: Sender<RefOp>,
    ) -> Self {
        GenericHandle {
            handle_ref: HandleRef::new(state, ref_op_tx),
        }
    }

    pub fn resource_id(&self) -> ResourceId {
        self.handle_ref.state.resource_id()
    }

    pub fn state(&self) -> &Arc<HandleState> {
        &self.handle_ref.state
    }

    pub fn is_created(&self) -> bool {
        self.handle_ref.state.is_created()
    }

    pub fn payload(&self) -> Option<Arc<dyn Resource>> {
        self.handle_ref.state.payload()
    }

    /// Typed access to the payload. Dereferencing a handle that never
    /// finished loading is a programmer error: fatal in debug builds,
    /// guarded (`None`) in release.
    pub fn get<T: Resource>(&self) -> Option<Arc<T>> {
        let payload = self.handle_ref.state.payload();
        debug_assert!(
            payload.is_some(),
            "dereferenced handle for {:?} before it was loaded",
            self.resource_id()
        );
        payload.and_then(|p| p.downcast_arc::<T>().ok())
    }

    /// Like `get`, but a miss is an expected outcome rather than an error.
    pub fn try_get<T: Resource>(&self) -> Option<Arc<T>> {
        self.handle_ref
            .state
            .payload()
            .and_then(|p| p.downcast_arc::<T>().ok())
    }

    /// True iff this handle's resource is created with a live payload and,
    /// if requested, every dependency reachable from the payload is loaded.
    pub fn is_loaded<P: LoadStateProvider>(
        &self,
        provider: &P,
        check_dependencies: bool,
    ) -> bool {
        let Some(payload) = self.handle_ref.state.payload() else {
            return false;
        };
        if !self.handle_ref.state.is_created() {
            return false;
        }
        if !check_dependencies {
            return true;
        }
        let own_id = self.resource_id();
        payload
            .dependencies()
            .iter()
            .all(|id| *id == own_id || provider.is_resource_loaded(*id, true))
    }

    /// Blocks until the load for this identity finished, successfully or not.
    pub fn wait_until_complete(&self) {
        self.handle_ref.state.wait_until_complete();
    }

    pub fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            state: Arc::downgrade(&self.handle_ref.state),
            ref_op_tx: self.handle_ref.ref_op_tx.clone(),
        }
    }

    pub fn typed<T: Resource>(self) -> Handle<T> {
        Handle {
            handle_ref: self.handle_ref,
            marker: PhantomData,
        }
    }
}

impl Clone for GenericHandle {
    fn clone(&self) -> Self {
        GenericHandle {
            handle_ref: self.handle_ref.clone(),
        }
    }
}

impl Debug for GenericHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("GenericHandle")
            .field("resource_id", &self.resource_id())
            .finish()
    }
}

impl PartialEq for GenericHandle {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.handle_ref.state, &other.handle_ref.state)
    }
}

impl Eq for GenericHandle {}

impl std::hash::Hash for GenericHandle {
    fn hash<H: std::hash::Hasher>(
        &self,
        state: &mut H,
    ) {
        self.resource_id().hash(state);
    }
}

/// Typed strong handle to a resource of a known concrete type.
pub struct Handle<T: Resource> {
    handle_ref: HandleRef,
    marker: PhantomData<T>,
}

impl<T: Resource> Handle<T> {
    pub fn resource_id(&self) -> ResourceId {
        self.handle_ref.state.resource_id()
    }

    pub fn state(&self) -> &Arc<HandleState> {
        &self.handle_ref.state
    }

    pub fn is_created(&self) -> bool {
        self.handle_ref.state.is_created()
    }

    /// See [`GenericHandle::get`].
    pub fn get(&self) -> Option<Arc<T>> {
        let payload = self.handle_ref.state.payload();
        debug_assert!(
            payload.is_some(),
            "dereferenced handle for {:?} before it was loaded",
            self.resource_id()
        );
        payload.and_then(|p| p.downcast_arc::<T>().ok())
    }

    pub fn try_get(&self) -> Option<Arc<T>> {
        self.handle_ref
            .state
            .payload()
            .and_then(|p| p.downcast_arc::<T>().ok())
    }

    pub fn is_loaded<P: LoadStateProvider>(
        &self,
        provider: &P,
        check_dependencies: bool,
    ) -> bool {
        self.untyped().is_loaded(provider, check_dependencies)
    }

    pub fn wait_until_complete(&self) {
        self.handle_ref.state.wait_until_complete();
    }

    pub fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            state: Arc::downgrade(&self.handle_ref.state),
            ref_op_tx: self.handle_ref.ref_op_tx.clone(),
        }
    }

    pub fn untyped(&self) -> GenericHandle {
        GenericHandle {
            handle_ref: self.handle_ref.clone(),
        }
    }
}

impl<T: Resource> From<GenericHandle> for Handle<T> {
    fn from(handle: GenericHandle) -> Self {
        handle.typed()
    }
}

impl<T: Resource> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle {
            handle_ref: self.handle_ref.clone(),
            marker: PhantomData,
        }
    }
}

impl<T: Resource> Debug for Handle<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("resource_id", &self.resource_id())
            .finish()
    }
}

impl<T: Resource> PartialEq for Handle<T> {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.handle_ref.state, &other.handle_ref.state)
    }
}

impl<T: Resource> Eq for Handle<T> {}

/// Non-owning handle. Never touches the reference count; must be upgraded
/// to a strong handle before the resource can be dereferenced.
#[derive(Clone)]
pub struct WeakHandle {
    state: Weak<HandleState>,
    ref_op_tx: Sender<RefOp>,
}

impl WeakHandle {
    /// Produces a strong handle unless the state was retired or dropped.
    pub fn upgrade(&self) -> Option<GenericHandle> {
        let state = self.state.upgrade()?;
        if !state.upgrade_external() {
            return None;
        }
        Some(GenericHandle {
            handle_ref: HandleRef {
                state,
                ref_op_tx: self.ref_op_tx.clone(),
            },
        })
    }
}

impl Debug for WeakHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WeakHandle")
            .field("alive", &(self.state.strong_count() > 0))
            .finish()
    }
}
