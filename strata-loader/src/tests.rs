use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use strata_base::handle::Resource;
use strata_base::header::{write_resource_file, CompressionMethod, ResourceHeader};
use strata_base::ResourceId;

use crate::error::{CacheError, CacheResult};
use crate::listener::{ListenerRegistry, ResourceListener};
use crate::manifest::MemoryManifest;
use crate::resource_cache::{CacheEvent, LoadFlags, ResourceCache, ResourceCodec};

#[derive(Serialize, Deserialize)]
struct BlockData {
    name: String,
    dependencies: Vec<ResourceId>,
}

struct Block {
    name: String,
    dependencies: Vec<ResourceId>,
}

impl Resource for Block {
    fn dependencies(&self) -> Vec<ResourceId> {
        self.dependencies.clone()
    }
}

#[derive(Default)]
struct BlockCodec {
    decode_count: AtomicUsize,
    decode_delay: Option<Duration>,
}

impl BlockCodec {
    fn decodes(&self) -> usize {
        self.decode_count.load(Ordering::SeqCst)
    }
}

impl ResourceCodec for BlockCodec {
    fn decode(
        &self,
        _id: ResourceId,
        bytes: &[u8],
    ) -> CacheResult<Arc<dyn Resource>> {
        if let Some(delay) = self.decode_delay {
            std::thread::sleep(delay);
        }
        self.decode_count.fetch_add(1, Ordering::SeqCst);
        let data: BlockData = bincode::deserialize(bytes)?;
        Ok(Arc::new(Block {
            name: data.name,
            dependencies: data.dependencies,
        }))
    }

    fn encode(
        &self,
        _id: ResourceId,
        resource: &dyn Resource,
    ) -> CacheResult<Vec<u8>> {
        let block = resource
            .downcast_ref::<Block>()
            .ok_or_else(|| CacheError::DecodeFailure("unexpected resource type".to_string()))?;
        Ok(bincode::serialize(&BlockData {
            name: block.name.clone(),
            dependencies: block.dependencies.clone(),
        })?)
    }
}

// Forwards to a shared codec so tests can observe decode counts after
// handing ownership to the cache.
struct SharedCodec(Arc<BlockCodec>);

impl ResourceCodec for SharedCodec {
    fn decode(
        &self,
        id: ResourceId,
        bytes: &[u8],
    ) -> CacheResult<Arc<dyn Resource>> {
        self.0.decode(id, bytes)
    }

    fn encode(
        &self,
        id: ResourceId,
        resource: &dyn Resource,
    ) -> CacheResult<Vec<u8>> {
        self.0.encode(id, resource)
    }
}

fn new_cache() -> (ResourceCache, Arc<BlockCodec>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let codec = Arc::new(BlockCodec::default());
    (
        ResourceCache::new(Box::new(SharedCodec(codec.clone()))),
        codec,
    )
}

fn new_cache_with_delay(delay: Duration) -> (ResourceCache, Arc<BlockCodec>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let codec = Arc::new(BlockCodec {
        decode_count: AtomicUsize::new(0),
        decode_delay: Some(delay),
    });
    (
        ResourceCache::new(Box::new(SharedCodec(codec.clone()))),
        codec,
    )
}

struct TestDir {
    path: PathBuf,
}

impl TestDir {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!(
            "strata-tests-{}",
            ResourceId::generate().as_uuid()
        ));
        std::fs::create_dir_all(&path).unwrap();
        TestDir { path }
    }

    fn file(
        &self,
        name: &str,
    ) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.path).ok();
    }
}

fn write_block(
    path: &Path,
    name: &str,
    dependencies: &[ResourceId],
    compression: CompressionMethod,
    allow_async_loading: bool,
) {
    let header = ResourceHeader {
        dependencies: dependencies.to_vec(),
        allow_async_loading,
        compression,
    };
    let payload = bincode::serialize(&BlockData {
        name: name.to_string(),
        dependencies: dependencies.to_vec(),
    })
    .unwrap();
    let mut file = std::fs::File::create(path).unwrap();
    write_resource_file(&mut file, &header, &payload).unwrap();
}

fn loaded_events(events: &[CacheEvent]) -> Vec<ResourceId> {
    events
        .iter()
        .filter_map(|e| match e {
            CacheEvent::Loaded(id) => Some(*id),
            _ => None,
        })
        .collect()
}

#[test]
fn sync_load_creates_resource() {
    let dir = TestDir::new();
    let (cache, codec) = new_cache();
    let events = cache.events();

    let id = ResourceId::generate();
    let path = dir.file("brick.res");
    write_block(&path, "brick", &[], CompressionMethod::None, true);

    let manifest = Arc::new(MemoryManifest::new());
    manifest.insert(id, path.clone());
    cache.register_manifest(manifest);

    let handle = cache.load(&path, LoadFlags::default());
    assert_eq!(handle.resource_id(), id);
    assert!(handle.is_created());
    assert!(handle.is_loaded(&cache, true));

    let block = handle.get::<Block>().unwrap();
    assert_eq!(block.name, "brick");
    assert_eq!(codec.decodes(), 1);

    // Exactly one completion event for the identity.
    let events: Vec<CacheEvent> = events.try_iter().collect();
    assert_eq!(loaded_events(&events), vec![id]);
}

#[test]
fn load_by_identifier_resolves_through_manifest() {
    let dir = TestDir::new();
    let (cache, _codec) = new_cache();

    let id = ResourceId::generate();
    let path = dir.file("wall.res");
    write_block(&path, "wall", &[], CompressionMethod::None, true);

    let manifest = Arc::new(MemoryManifest::new());
    manifest.insert(id, path);
    cache.register_manifest(manifest);

    let handle = cache.load_from_identifier(id, false, LoadFlags::default());
    assert!(handle.is_created());
    assert_eq!(handle.get::<Block>().unwrap().name, "wall");
}

#[test]
fn most_recently_registered_manifest_wins() {
    let dir = TestDir::new();
    let (cache, _codec) = new_cache();

    let id = ResourceId::generate();
    let old_path = dir.file("old.res");
    let new_path = dir.file("new.res");
    write_block(&old_path, "old", &[], CompressionMethod::None, true);
    write_block(&new_path, "new", &[], CompressionMethod::None, true);

    let old_manifest = Arc::new(MemoryManifest::new());
    old_manifest.insert(id, old_path);
    let new_manifest = Arc::new(MemoryManifest::new());
    new_manifest.insert(id, new_path);

    cache.register_manifest(old_manifest);
    cache.register_manifest(new_manifest);

    let handle = cache.load_from_identifier(id, false, LoadFlags::default());
    assert_eq!(handle.get::<Block>().unwrap().name, "new");
}

#[test]
fn async_load_with_dependency() {
    let dir = TestDir::new();
    let (cache, codec) = new_cache_with_delay(Duration::from_millis(50));

    let dep_id = ResourceId::generate();
    let dep_path = dir.file("leaf.res");
    write_block(&dep_path, "leaf", &[], CompressionMethod::None, true);

    let parent_path = dir.file("tree.res");
    write_block(&parent_path, "tree", &[dep_id], CompressionMethod::None, true);

    let manifest = Arc::new(MemoryManifest::new());
    manifest.insert(dep_id, dep_path);
    cache.register_manifest(manifest);

    let handle = cache.load_async(&parent_path, LoadFlags::default());
    assert!(!handle.is_loaded(&cache, false));

    cache.block_until_loaded(&handle).unwrap();
    assert!(handle.is_loaded(&cache, false));
    assert!(handle.is_loaded(&cache, true));
    assert!(cache.is_loaded(dep_id, false));
    assert_eq!(codec.decodes(), 2);
}

#[test]
fn parent_not_complete_before_dependencies() {
    let dir = TestDir::new();
    let (cache, _codec) = new_cache();

    let dep_a = ResourceId::generate();
    let dep_b = ResourceId::generate();
    write_block(&dir.file("a.res"), "a", &[], CompressionMethod::None, true);
    write_block(&dir.file("b.res"), "b", &[], CompressionMethod::None, true);
    let parent_path = dir.file("parent.res");
    write_block(&parent_path, "parent", &[dep_a, dep_b], CompressionMethod::None, true);

    let manifest = Arc::new(MemoryManifest::new());
    manifest.insert(dep_a, dir.file("a.res"));
    manifest.insert(dep_b, dir.file("b.res"));
    cache.register_manifest(manifest);

    let handle = cache.load(&parent_path, LoadFlags::default());
    // A synchronous load only returns once the whole graph is in.
    assert!(handle.is_loaded(&cache, true));
    assert!(cache.is_loaded(dep_a, false));
    assert!(cache.is_loaded(dep_b, false));
}

#[test]
fn concurrent_loads_share_state_and_decode_once() {
    let dir = TestDir::new();
    let (cache, codec) = new_cache_with_delay(Duration::from_millis(20));

    // Never-before-seen path without a manifest entry.
    let path = dir.file("racy.res");
    write_block(&path, "racy", &[], CompressionMethod::None, true);

    let handles: Vec<_> = std::thread::scope(|scope| {
        let threads: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| cache.load_async(&path, LoadFlags::default())))
            .collect();
        threads.into_iter().map(|t| t.join().unwrap()).collect()
    });

    for handle in &handles {
        cache.block_until_loaded(handle).unwrap();
        assert!(Arc::ptr_eq(handle.state(), handles[0].state()));
    }
    assert_eq!(codec.decodes(), 1);
}

#[test]
fn sync_attach_to_async_load_blocks_until_complete() {
    let dir = TestDir::new();
    let (cache, codec) = new_cache_with_delay(Duration::from_millis(50));

    let path = dir.file("slow.res");
    write_block(&path, "slow", &[], CompressionMethod::None, true);

    let async_handle = cache.load_async(&path, LoadFlags::default());
    assert!(!async_handle.is_created());

    // Attaches to the in-flight load rather than decoding again, but keeps
    // blocking semantics.
    let sync_handle = cache.load(&path, LoadFlags::default());
    assert!(sync_handle.is_created());
    assert!(Arc::ptr_eq(sync_handle.state(), async_handle.state()));
    assert_eq!(codec.decodes(), 1);
}

#[test]
fn missing_file_returns_unresolved_handle() {
    let dir = TestDir::new();
    let (cache, codec) = new_cache();

    let handle = cache.load(&dir.file("nothing.res"), LoadFlags::default());
    assert!(!handle.is_created());
    assert!(handle.try_get::<Block>().is_none());
    assert!(!cache.is_loaded(handle.resource_id(), true));
    assert_eq!(codec.decodes(), 0);
}

#[test]
fn unresolvable_identifier_returns_unresolved_handle() {
    let (cache, codec) = new_cache();

    let handle = cache.load_from_identifier(ResourceId::generate(), false, LoadFlags::default());
    assert!(!handle.is_created());
    assert!(!cache.is_loaded(handle.resource_id(), true));
    assert_eq!(codec.decodes(), 0);
}

#[test]
fn reload_before_reclamation_reuses_object() {
    let dir = TestDir::new();
    let (cache, codec) = new_cache();

    let path = dir.file("keep.res");
    write_block(&path, "keep", &[], CompressionMethod::None, true);

    let handle = cache.load(&path, LoadFlags::default());
    let first = handle.get::<Block>().unwrap();
    drop(handle);

    // No ref-op processing has run; the internal reference still pins it.
    let handle = cache.load(&path, LoadFlags::default());
    let second = handle.get::<Block>().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(codec.decodes(), 1);
}

#[test]
fn unload_all_unused_respects_outside_owners() {
    let dir = TestDir::new();
    let (cache, codec) = new_cache();

    let path = dir.file("owned.res");
    write_block(&path, "owned", &[], CompressionMethod::None, true);

    let handle = cache.load(&path, LoadFlags::default());
    let id = handle.resource_id();

    // External (caller + mirror) exceeds internal while the caller holds on.
    assert!(handle.state().external_refs() >= handle.state().internal_refs());
    cache.unload_all_unused();
    assert!(cache.is_loaded(id, false));

    drop(handle);
    cache.unload_all_unused();
    assert!(!cache.is_loaded(id, false));

    // A fresh load decodes again.
    let handle = cache.load(&path, LoadFlags::default());
    assert!(handle.is_created());
    assert_eq!(codec.decodes(), 2);
}

#[test]
fn unload_cascades_through_dependencies() {
    let dir = TestDir::new();
    let (cache, _codec) = new_cache();
    let events = cache.events();

    let dep_id = ResourceId::generate();
    write_block(&dir.file("limb.res"), "limb", &[], CompressionMethod::None, true);
    let parent_path = dir.file("body.res");
    write_block(&parent_path, "body", &[dep_id], CompressionMethod::None, true);

    let manifest = Arc::new(MemoryManifest::new());
    manifest.insert(dep_id, dir.file("limb.res"));
    cache.register_manifest(manifest);

    let handle = cache.load(&parent_path, LoadFlags::default());
    let parent_id = handle.resource_id();
    assert!(cache.is_loaded(dep_id, false));

    drop(handle);
    cache.unload_all_unused();

    assert!(!cache.is_loaded(parent_id, false));
    assert!(!cache.is_loaded(dep_id, false));

    let destroyed: Vec<ResourceId> = events
        .try_iter()
        .filter_map(|e| match e {
            CacheEvent::Destroyed(id) => Some(id),
            _ => None,
        })
        .collect();
    assert!(destroyed.contains(&parent_id));
    assert!(destroyed.contains(&dep_id));
}

#[test]
fn release_after_load_allows_reclamation() {
    let dir = TestDir::new();
    let (cache, _codec) = new_cache();

    let path = dir.file("transient.res");
    write_block(&path, "transient", &[], CompressionMethod::None, true);

    let handle = cache.load(&path, LoadFlags::default());
    let id = handle.resource_id();

    cache.release(&handle);
    assert!(cache.is_loaded(id, false));

    drop(handle);
    cache.process_ref_ops();
    assert!(!cache.is_loaded(id, false));
}

#[test]
fn failed_dependency_does_not_wedge_parent() {
    let dir = TestDir::new();
    let (cache, _codec) = new_cache();

    // The dependency has no manifest entry and no file anywhere.
    let missing = ResourceId::generate();
    let parent_path = dir.file("brave.res");
    write_block(&parent_path, "brave", &[missing], CompressionMethod::None, true);

    let handle = cache.load(&parent_path, LoadFlags::default());

    // The parent finalizes: a failed dependency counts as complete for the
    // countdown. The failure stays observable through the dependency check.
    assert!(handle.is_created());
    assert!(handle.is_loaded(&cache, false));
    assert!(!handle.is_loaded(&cache, true));
    assert!(!cache.is_loaded(missing, true));
}

#[test]
fn corrupt_payload_fails_only_its_own_identity() {
    let dir = TestDir::new();
    let (cache, _codec) = new_cache();

    let bad_id = ResourceId::generate();
    let bad_path = dir.file("bad.res");
    {
        // Valid header, garbage payload.
        let header = ResourceHeader::default();
        let mut file = std::fs::File::create(&bad_path).unwrap();
        write_resource_file(&mut file, &header, b"not bincode").unwrap();
    }

    let parent_path = dir.file("parent.res");
    write_block(&parent_path, "parent", &[bad_id], CompressionMethod::None, true);

    let manifest = Arc::new(MemoryManifest::new());
    manifest.insert(bad_id, bad_path);
    cache.register_manifest(manifest);

    let handle = cache.load(&parent_path, LoadFlags::default());
    assert!(handle.is_created());
    assert!(!handle.is_loaded(&cache, true));
    assert!(!cache.is_loaded(bad_id, true));
}

#[test]
fn save_round_trips_dependency_set() {
    let dir = TestDir::new();
    let (cache, _codec) = new_cache();

    let deps = vec![ResourceId::generate(), ResourceId::generate()];
    let id = ResourceId::generate();
    let handle = cache.insert(
        id,
        Arc::new(Block {
            name: "composite".to_string(),
            dependencies: deps.clone(),
        }),
        LoadFlags::default(),
    );

    let path = dir.file("composite.res");
    cache.save(&handle, Some(&path), false, false).unwrap();
    assert_eq!(cache.get_dependencies(&path).unwrap(), deps);

    // A clean cache sees the same graph shape.
    let (fresh, _codec) = new_cache();
    let reloaded = fresh.load(&path, LoadFlags::default());
    assert!(reloaded.is_created());
    let block = reloaded.get::<Block>().unwrap();
    assert_eq!(block.name, "composite");
    assert_eq!(block.dependencies, deps);
}

#[test]
fn save_refuses_to_clobber_without_overwrite() {
    let dir = TestDir::new();
    let (cache, _codec) = new_cache();

    let handle = cache.insert(
        ResourceId::generate(),
        Arc::new(Block {
            name: "precious".to_string(),
            dependencies: vec![],
        }),
        LoadFlags::default(),
    );

    let path = dir.file("precious.res");
    cache.save(&handle, Some(&path), false, false).unwrap();

    match cache.save(&handle, Some(&path), false, false) {
        Err(CacheError::SaveConflict(conflict)) => assert_eq!(conflict, path),
        other => panic!("expected SaveConflict, got {:?}", other),
    }

    // The original file is intact and overwrite succeeds.
    assert!(cache.load(&path, LoadFlags::default()).is_created());
    cache.save(&handle, Some(&path), true, false).unwrap();
}

#[test]
fn compressed_resource_round_trips() {
    let dir = TestDir::new();
    let (cache, _codec) = new_cache();

    let path = dir.file("squeezed.res");
    write_block(&path, "squeezed", &[], CompressionMethod::Deflate, true);

    let handle = cache.load(&path, LoadFlags::default());
    assert_eq!(handle.get::<Block>().unwrap().name, "squeezed");
}

#[test]
fn async_request_honors_no_async_header() {
    let dir = TestDir::new();
    let (cache, codec) = new_cache();

    let path = dir.file("mainthread.res");
    write_block(&path, "mainthread", &[], CompressionMethod::None, false);

    // The header forbids async loading, so the decode runs inline and the
    // handle is complete on return even for an async request.
    let handle = cache.load_async(&path, LoadFlags::default());
    assert!(handle.is_created());
    assert_eq!(codec.decodes(), 1);
    assert_eq!(cache.pending_decodes(), 0);
}

#[test]
fn keep_source_data_retains_payload_bytes() {
    let dir = TestDir::new();
    let (cache, _codec) = new_cache();

    let path = dir.file("sourced.res");
    write_block(&path, "sourced", &[], CompressionMethod::None, true);

    let flags = LoadFlags::default() | LoadFlags::KEEP_SOURCE_DATA;
    let handle = cache.load(&path, flags);
    let bytes = cache.source_data(handle.resource_id()).unwrap();
    let data: BlockData = bincode::deserialize(&bytes).unwrap();
    assert_eq!(data.name, "sourced");
}

#[test]
fn replace_swaps_payload_in_place() {
    let (cache, _codec) = new_cache();
    let events = cache.events();

    let id = ResourceId::generate();
    let handle = cache.insert(
        id,
        Arc::new(Block {
            name: "before".to_string(),
            dependencies: vec![],
        }),
        LoadFlags::default(),
    );
    assert_eq!(handle.get::<Block>().unwrap().name, "before");

    cache
        .replace(
            id,
            Arc::new(Block {
                name: "after".to_string(),
                dependencies: vec![],
            }),
        )
        .unwrap();

    // The existing handle observes the swap; no new state was minted.
    assert_eq!(handle.get::<Block>().unwrap().name, "after");
    assert!(events.try_iter().any(|e| e == CacheEvent::Modified(id)));
}

#[test]
fn replace_of_unknown_identity_errors() {
    let (cache, _codec) = new_cache();
    let result = cache.replace(
        ResourceId::generate(),
        Arc::new(Block {
            name: "ghost".to_string(),
            dependencies: vec![],
        }),
    );
    assert!(matches!(result, Err(CacheError::NotLoaded(_))));
}

#[test]
fn unload_all_severs_outstanding_handles() {
    let dir = TestDir::new();
    let (cache, _codec) = new_cache();

    let path = dir.file("doomed.res");
    write_block(&path, "doomed", &[], CompressionMethod::None, true);

    let handle = cache.load(&path, LoadFlags::default());
    let weak = handle.downgrade();
    assert!(weak.upgrade().is_some());

    cache.unload_all();
    assert!(!cache.is_loaded(handle.resource_id(), true));
    assert!(handle.try_get::<Block>().is_none());
    assert!(weak.upgrade().is_none());
}

#[test]
fn listener_hears_load_and_destroy() {
    struct WatchOne {
        id: ResourceId,
        loaded: AtomicUsize,
        destroyed: AtomicUsize,
    }
    impl ResourceListener for WatchOne {
        fn watched_resources(&self) -> Vec<ResourceId> {
            vec![self.id]
        }
        fn on_loaded(
            &self,
            _id: ResourceId,
        ) {
            self.loaded.fetch_add(1, Ordering::SeqCst);
        }
        fn on_destroyed(
            &self,
            _id: ResourceId,
        ) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    let dir = TestDir::new();
    let (cache, _codec) = new_cache();
    let registry = ListenerRegistry::new(cache.events());

    let id = ResourceId::generate();
    let path = dir.file("watched.res");
    write_block(&path, "watched", &[], CompressionMethod::None, true);
    let manifest = Arc::new(MemoryManifest::new());
    manifest.insert(id, path.clone());
    cache.register_manifest(manifest);

    let listener = Arc::new(WatchOne {
        id,
        loaded: AtomicUsize::new(0),
        destroyed: AtomicUsize::new(0),
    });
    registry.register(listener.clone());

    let handle = cache.load(&path, LoadFlags::default());
    registry.update();
    assert_eq!(listener.loaded.load(Ordering::SeqCst), 1);

    drop(handle);
    cache.unload_all_unused();
    registry.update();
    assert_eq!(listener.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn get_dependencies_reads_header_only() {
    let dir = TestDir::new();
    let (cache, codec) = new_cache();

    let deps = vec![ResourceId::generate()];
    let path = dir.file("shallow.res");
    write_block(&path, "shallow", &deps, CompressionMethod::None, true);

    assert_eq!(cache.get_dependencies(&path).unwrap(), deps);
    // Header inspection never runs the payload codec.
    assert_eq!(codec.decodes(), 0);

    assert!(matches!(
        cache.get_dependencies(&dir.file("absent.res")),
        Err(CacheError::MissingFile(_))
    ));
}
