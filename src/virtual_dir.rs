//! The virtual directory tree.
//!
//! The daemon's top-level namespace is synthetic: a tree of virtual
//! directories built from the mountpoints of all configured volumes. The
//! whole tree lives in memory under the first-class mutex; its nodes carry
//! fabricated file handles with `sid = vid = 0`. The only cycle allowed is
//! the root's self-pointer.

use std::collections::HashMap;

use crate::lock_order::{LockClass, OrderedMutex};
use crate::proto::{FType, Fattr, ZfsFh, VIRTUAL_SID, VIRTUAL_VID};

/// Inode of the virtual root.
pub const ROOT_INO: u32 = 1;

/// Snapshot of one virtual directory, safe to use without the tree lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdEntry {
    pub ino: u32,
    pub name: Vec<u8>,
    pub parent: u32,
    pub volume_id: Option<u32>,
    pub children: usize,
}

impl VdEntry {
    pub fn fh(&self) -> ZfsFh {
        virtual_fh(self.ino)
    }

    /// Fabricated attributes of a virtual directory.
    pub fn attr(&self) -> Fattr {
        Fattr {
            dev: 0,
            ino: self.ino,
            version: 0,
            ftype: FType::Dir,
            mode: 0o555,
            nlink: 2 + self.children as u32,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 4096,
            blocks: 8,
            blksize: 4096,
            atime: 0,
            mtime: 0,
            ctime: 0,
        }
    }
}

/// The file handle fabricated for a virtual directory.
pub fn virtual_fh(ino: u32) -> ZfsFh {
    ZfsFh {
        sid: VIRTUAL_SID,
        vid: VIRTUAL_VID,
        dev: 0,
        ino,
        generation: 0,
    }
}

struct VdNode {
    name: Vec<u8>,
    parent: u32,
    /// Child inos ordered by child name.
    children: Vec<u32>,
    volume_id: Option<u32>,
}

struct VdState {
    nodes: HashMap<u32, VdNode>,
    next_ino: u32,
}

/// The virtual tree, class 1 in the lock order.
pub struct VirtualTree {
    inner: OrderedMutex<VdState>,
}

impl VirtualTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INO,
            VdNode {
                name: b"/".to_vec(),
                parent: ROOT_INO,
                children: Vec::new(),
                volume_id: None,
            },
        );
        VirtualTree {
            inner: OrderedMutex::new(
                LockClass::VdTree,
                VdState {
                    nodes,
                    next_ino: ROOT_INO + 1,
                },
            ),
        }
    }

    /// Create the virtual path of a mountpoint and attach `volume_id` to
    /// its final component. An empty path mounts the volume on the root.
    pub fn mount(&self, mountpoint: &str, volume_id: u32) -> Result<ZfsFh, MountError> {
        let mut state = self.inner.lock();
        let mut current = ROOT_INO;
        for component in mountpoint.split('/').filter(|c| !c.is_empty()) {
            let name = component.as_bytes().to_vec();
            let existing = state.nodes[&current]
                .children
                .iter()
                .copied()
                .find(|&child| state.nodes[&child].name == name);
            current = match existing {
                Some(child) => child,
                None => {
                    let ino = state.next_ino;
                    state.next_ino += 1;
                    // Children stay ordered by name.
                    let pos = state.nodes[&current]
                        .children
                        .iter()
                        .position(|&child| state.nodes[&child].name > name)
                        .unwrap_or(state.nodes[&current].children.len());
                    state.nodes.insert(
                        ino,
                        VdNode {
                            name,
                            parent: current,
                            children: Vec::new(),
                            volume_id: None,
                        },
                    );
                    state
                        .nodes
                        .get_mut(&current)
                        .expect("parent exists")
                        .children
                        .insert(pos, ino);
                    ino
                }
            };
        }
        let node = state.nodes.get_mut(&current).expect("node exists");
        if node.volume_id.is_some() {
            return Err(MountError::Occupied);
        }
        node.volume_id = Some(volume_id);
        Ok(virtual_fh(current))
    }

    fn entry_of(state: &VdState, ino: u32) -> VdEntry {
        let node = &state.nodes[&ino];
        VdEntry {
            ino,
            name: node.name.clone(),
            parent: node.parent,
            volume_id: node.volume_id,
            children: node.children.len(),
        }
    }

    /// Snapshot of the node with inode `ino`.
    pub fn get(&self, ino: u32) -> Option<VdEntry> {
        let state = self.inner.lock();
        state.nodes.contains_key(&ino).then(|| Self::entry_of(&state, ino))
    }

    /// Resolve `name` below the virtual directory `parent`.
    pub fn lookup(&self, parent: u32, name: &[u8]) -> Option<VdEntry> {
        let state = self.inner.lock();
        let node = state.nodes.get(&parent)?;
        if name == b".." {
            return Some(Self::entry_of(&state, node.parent));
        }
        let child = node
            .children
            .iter()
            .copied()
            .find(|&child| state.nodes[&child].name == name)?;
        Some(Self::entry_of(&state, child))
    }

    /// Children of `ino` in name order.
    pub fn readdir(&self, ino: u32) -> Option<Vec<VdEntry>> {
        let state = self.inner.lock();
        let node = state.nodes.get(&ino)?;
        Some(
            node.children
                .iter()
                .map(|&child| Self::entry_of(&state, child))
                .collect(),
        )
    }
}

impl Default for VirtualTree {
    fn default() -> Self {
        VirtualTree::new()
    }
}

impl std::fmt::Debug for VirtualTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualTree").finish()
    }
}

/// Errors while building the virtual tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountError {
    /// The mountpoint already carries a volume.
    Occupied,
}

impl std::fmt::Display for MountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountError::Occupied => write!(f, "mountpoint already carries a volume"),
        }
    }
}

impl std::error::Error for MountError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_builds_intermediate_directories() {
        let tree = VirtualTree::new();
        let fh = tree.mount("/home/joe", 5).unwrap();
        assert!(fh.is_virtual());

        let home = tree.lookup(ROOT_INO, b"home").unwrap();
        assert_eq!(home.volume_id, None);
        let joe = tree.lookup(home.ino, b"joe").unwrap();
        assert_eq!(joe.volume_id, Some(5));
        assert_eq!(joe.fh(), fh);
    }

    #[test]
    fn shared_prefixes_reuse_nodes() {
        let tree = VirtualTree::new();
        tree.mount("/vol/a", 1).unwrap();
        tree.mount("/vol/b", 2).unwrap();
        let vol = tree.lookup(ROOT_INO, b"vol").unwrap();
        let names: Vec<_> = tree
            .readdir(vol.ino)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn double_mount_is_rejected() {
        let tree = VirtualTree::new();
        tree.mount("/data", 1).unwrap();
        assert_eq!(tree.mount("/data", 2), Err(MountError::Occupied));
    }

    #[test]
    fn readdir_is_name_ordered() {
        let tree = VirtualTree::new();
        tree.mount("/zeta", 1).unwrap();
        tree.mount("/alpha", 2).unwrap();
        tree.mount("/mid", 3).unwrap();
        let names: Vec<_> = tree
            .readdir(ROOT_INO)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(
            names,
            vec![b"alpha".to_vec(), b"mid".to_vec(), b"zeta".to_vec()]
        );
    }

    #[test]
    fn only_root_points_to_itself() {
        let tree = VirtualTree::new();
        tree.mount("/a/b/c", 1).unwrap();
        let root = tree.get(ROOT_INO).unwrap();
        assert_eq!(root.parent, ROOT_INO);
        let a = tree.lookup(ROOT_INO, b"a").unwrap();
        assert_eq!(a.parent, ROOT_INO);
        let b = tree.lookup(a.ino, b"b").unwrap();
        assert_eq!(b.parent, a.ino);
        assert_ne!(b.parent, b.ino);
    }

    #[test]
    fn dotdot_resolves_to_parent() {
        let tree = VirtualTree::new();
        tree.mount("/a/b", 1).unwrap();
        let a = tree.lookup(ROOT_INO, b"a").unwrap();
        let b = tree.lookup(a.ino, b"b").unwrap();
        let up = tree.lookup(b.ino, b"..").unwrap();
        assert_eq!(up.ino, a.ino);
    }

    #[test]
    fn virtual_attr_is_a_directory() {
        let tree = VirtualTree::new();
        tree.mount("/a", 1).unwrap();
        tree.mount("/b", 2).unwrap();
        let root = tree.get(ROOT_INO).unwrap();
        let attr = root.attr();
        assert_eq!(attr.ftype, FType::Dir);
        assert_eq!(attr.nlink, 4);
    }
}
