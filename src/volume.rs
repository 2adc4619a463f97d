//! Volumes: the units of the exported namespace.
//!
//! A volume is hosted by its master node and mounted at a path in the
//! virtual tree. A volume with a `local_path` keeps a cache (or, when this
//! node is the master, the authoritative copy) on the local filesystem,
//! together with a metadata store. The per-volume mutex guards the root
//! dentry pointer and the metadata store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use crate::fh::InternalDentry;
use crate::lock_order::{LockClass, OrderedGuard, OrderedMutex};
use crate::metadata::MetadataStore;

/// A single volume.
pub struct Volume {
    pub id: u32,
    pub name: String,
    /// Mountpoint path inside the virtual tree, e.g. `/home/joe`.
    pub mountpoint: String,
    /// Id of the node authoritative for this volume.
    pub master_id: u32,
    /// Local cache directory; `None` for purely remote volumes.
    pub local_path: Option<PathBuf>,
    /// Maximum bytes of local cache; 0 means unlimited.
    pub size_limit: u64,
    state: OrderedMutex<VolumeState>,
}

/// Mutable volume state, under the volume mutex.
pub struct VolumeState {
    /// The dentry of the volume root, once resolved.
    pub root_dentry: Option<Arc<InternalDentry>>,
    /// Metadata store of a local volume.
    pub metadata: Option<MetadataStore>,
}

impl std::fmt::Debug for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeState")
            .field("root_dentry", &self.root_dentry.is_some())
            .field("metadata", &self.metadata.is_some())
            .finish()
    }
}

impl Volume {
    pub fn new(
        id: u32,
        name: String,
        mountpoint: String,
        master_id: u32,
        local_path: Option<PathBuf>,
        size_limit: u64,
    ) -> Arc<Volume> {
        Arc::new(Volume {
            id,
            name,
            mountpoint,
            master_id,
            local_path,
            size_limit,
            state: OrderedMutex::new(
                LockClass::Volume,
                VolumeState {
                    root_dentry: None,
                    metadata: None,
                },
            ),
        })
    }

    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// True when this node is authoritative for the volume.
    pub fn is_master(&self, this_node_id: u32) -> bool {
        self.master_id == this_node_id
    }

    pub fn lock_state(&self) -> OrderedGuard<'_, VolumeState> {
        self.state.lock()
    }

    /// Open the metadata store of a local volume. Called once at startup,
    /// before any operation can reach the volume.
    pub fn init_metadata(&self, tree_depth: u32) -> std::io::Result<()> {
        let Some(local_path) = &self.local_path else {
            return Ok(());
        };
        let store = MetadataStore::open(local_path, tree_depth)?;
        info!("volume {}: metadata at {}", self.name, store.root().display());
        self.state.lock().metadata = Some(store);
        Ok(())
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mountpoint", &self.mountpoint)
            .field("master_id", &self.master_id)
            .field("local_path", &self.local_path)
            .finish()
    }
}

/// The table of volumes, class 3 in the lock order.
pub struct VolumeTable {
    inner: OrderedMutex<HashMap<u32, Arc<Volume>>>,
}

impl VolumeTable {
    pub fn new() -> Self {
        VolumeTable {
            inner: OrderedMutex::new(LockClass::VolumeTable, HashMap::new()),
        }
    }

    pub fn insert(&self, volume: Arc<Volume>) {
        self.inner.lock().insert(volume.id, volume);
    }

    pub fn by_id(&self, id: u32) -> Option<Arc<Volume>> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Volume>> {
        self.inner
            .lock()
            .values()
            .find(|volume| volume.name == name)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Volume>> {
        self.inner.lock().values().cloned().collect()
    }
}

impl Default for VolumeTable {
    fn default() -> Self {
        VolumeTable::new()
    }
}

impl std::fmt::Debug for VolumeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeTable").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_volume_opens_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::new(
            3,
            "home".into(),
            "/home".into(),
            1,
            Some(dir.path().to_owned()),
            0,
        );
        assert!(volume.is_local());
        volume.init_metadata(1).unwrap();
        assert!(volume.lock_state().metadata.is_some());
        assert!(dir.path().join(".zfs/metadata.hash").exists());
    }

    #[test]
    fn remote_volume_has_no_metadata() {
        let volume = Volume::new(4, "proj".into(), "/proj".into(), 2, None, 0);
        assert!(!volume.is_local());
        volume.init_metadata(1).unwrap();
        assert!(volume.lock_state().metadata.is_none());
    }

    #[test]
    fn table_lookups() {
        let table = VolumeTable::new();
        table.insert(Volume::new(1, "a".into(), "/a".into(), 1, None, 0));
        table.insert(Volume::new(2, "b".into(), "/b".into(), 1, None, 0));
        assert_eq!(table.by_id(2).unwrap().name, "b");
        assert_eq!(table.by_name("a").unwrap().id, 1);
        assert!(table.by_id(9).is_none());
    }
}
