use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use strata_base::hashing::HashMap;
use strata_base::ResourceId;

use crate::error::CacheResult;

/// Bidirectional identity <-> path lookup. Multiple manifests may be
/// registered with a cache; lookups walk them in reverse-registration order
/// and the first hit wins.
pub trait Manifest: Send + Sync {
    fn id_for(
        &self,
        path: &Path,
    ) -> Option<ResourceId>;

    fn path_for(
        &self,
        id: ResourceId,
    ) -> Option<PathBuf>;
}

/// Mutable in-memory manifest, useful for tools and tests.
#[derive(Default)]
pub struct MemoryManifest {
    inner: Mutex<MemoryManifestInner>,
}

#[derive(Default)]
struct MemoryManifestInner {
    by_id: HashMap<ResourceId, PathBuf>,
    by_path: HashMap<PathBuf, ResourceId>,
}

impl MemoryManifest {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(
        &self,
        id: ResourceId,
        path: impl Into<PathBuf>,
    ) {
        let path = path.into();
        let mut inner = self.inner.lock().unwrap();
        inner.by_path.insert(path.clone(), id);
        inner.by_id.insert(id, path);
    }

    pub fn remove(
        &self,
        id: ResourceId,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(path) = inner.by_id.remove(&id) {
            inner.by_path.remove(&path);
        }
    }
}

impl Manifest for MemoryManifest {
    fn id_for(
        &self,
        path: &Path,
    ) -> Option<ResourceId> {
        self.inner.lock().unwrap().by_path.get(path).copied()
    }

    fn path_for(
        &self,
        id: ResourceId,
    ) -> Option<PathBuf> {
        self.inner.lock().unwrap().by_id.get(&id).cloned()
    }
}

#[derive(Serialize, Deserialize)]
struct ManifestEntryJson {
    resource_id: ResourceId,
    path: String,
}

#[derive(Serialize, Deserialize, Default)]
struct ManifestFileJson {
    entries: Vec<ManifestEntryJson>,
}

/// Manifest loaded fully into memory from a JSON file of
/// `{ resource_id, path }` entries. Immutable after load.
pub struct FileManifest {
    by_id: HashMap<ResourceId, PathBuf>,
    by_path: HashMap<PathBuf, ResourceId>,
}

impl FileManifest {
    pub fn load_from_file(path: &Path) -> CacheResult<FileManifest> {
        let json_str = std::fs::read_to_string(path)?;
        let manifest_file: ManifestFileJson = serde_json::from_str(&json_str)
            .map_err(|e| crate::error::CacheError::DecodeFailure(e.to_string()))?;

        let mut by_id = HashMap::default();
        let mut by_path = HashMap::default();
        for entry in manifest_file.entries {
            let entry_path = PathBuf::from(entry.path);
            by_path.insert(entry_path.clone(), entry.resource_id);
            by_id.insert(entry.resource_id, entry_path);
        }

        Ok(FileManifest { by_id, by_path })
    }
}

impl Manifest for FileManifest {
    fn id_for(
        &self,
        path: &Path,
    ) -> Option<ResourceId> {
        self.by_path.get(path).copied()
    }

    fn path_for(
        &self,
        id: ResourceId,
    ) -> Option<PathBuf> {
        self.by_id.get(&id).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_manifest_maps_both_ways() {
        let manifest = MemoryManifest::new();
        let id = ResourceId::generate();
        manifest.insert(id, "data/brick.res");

        assert_eq!(manifest.id_for(Path::new("data/brick.res")), Some(id));
        assert_eq!(
            manifest.path_for(id),
            Some(PathBuf::from("data/brick.res"))
        );

        manifest.remove(id);
        assert_eq!(manifest.id_for(Path::new("data/brick.res")), None);
        assert_eq!(manifest.path_for(id), None);
    }

    #[test]
    fn file_manifest_loads_json() {
        let id = ResourceId::generate();
        let json = serde_json::to_string(&ManifestFileJson {
            entries: vec![ManifestEntryJson {
                resource_id: id,
                path: "data/wall.res".to_string(),
            }],
        })
        .unwrap();

        let dir = std::env::temp_dir().join(format!("strata-manifest-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let manifest_path = dir.join("build.manifest");
        std::fs::write(&manifest_path, json).unwrap();

        let manifest = FileManifest::load_from_file(&manifest_path).unwrap();
        assert_eq!(manifest.id_for(Path::new("data/wall.res")), Some(id));
        assert_eq!(manifest.path_for(id), Some(PathBuf::from("data/wall.res")));

        std::fs::remove_dir_all(&dir).ok();
    }
}
