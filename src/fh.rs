//! The in-memory object graph: internal file handles and dentries.
//!
//! Two tables under one mutex (class 2) index the graph: `fh_table` maps a
//! file handle to its [`InternalFh`], `dentry_table` maps `(parent_fh,
//! name)` to the [`InternalDentry`] edge. A dentry owns an `Arc` of its
//! file handle; the file handle keeps `Weak` back-edges to its dentries,
//! so hard links share one object and dropping the last edge lets the
//! object die.

use std::collections::HashMap;
use std::fs::File;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::warn;
use rand::RngCore;

use crate::codec::VERIFY_LEN;
use crate::hardlink::HardlinkList;
use crate::interval::IntervalTree;
use crate::journal::Journal;
use crate::lock_order::{LockClass, OrderedGuard, OrderedMutex};
use crate::metadata::MetadataFlags;
use crate::proto::{Fattr, ZfsCap, ZfsFh};

/// How long a dentry stays valid before the next revalidation.
pub const DENTRY_TTL: Duration = Duration::from_secs(2);

/// One issued capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapEntry {
    pub flags: u32,
    pub verify: [u8; VERIFY_LEN],
}

/// A cached open descriptor of a local file.
#[derive(Debug)]
pub struct CachedFd {
    pub file: File,
    pub generation: u64,
}

/// Mutable state of an internal file handle, under the fh mutex (class 5).
pub struct FhState {
    pub attr: Fattr,
    pub flags: MetadataFlags,
    /// Ranges whose cached content is fresh.
    pub updated: IntervalTree,
    /// Ranges written locally and not yet reconciled.
    pub modified: IntervalTree,
    pub journal: Journal,
    pub hardlinks: HardlinkList,
    dentries: Vec<Weak<InternalDentry>>,
    caps: Vec<CapEntry>,
    open_fd: Option<CachedFd>,
    fd_generation: u64,
    /// Outstanding lookups not yet balanced by a forget.
    pub nlookup: u64,
    /// Purge mark: the next lookup must rebuild this object.
    pub evict: bool,
    /// Capability held on the master for a file of a cached volume.
    pub master_cap: Option<ZfsCap>,
}

impl FhState {
    /// Dentries still alive that resolve to this file handle.
    pub fn live_dentries(&self) -> Vec<Arc<InternalDentry>> {
        self.dentries.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn caps(&self) -> &[CapEntry] {
        &self.caps
    }

    /// Store an open descriptor, invalidating any previous one.
    pub fn cache_fd(&mut self, file: File) -> u64 {
        self.fd_generation += 1;
        let generation = self.fd_generation;
        self.open_fd = Some(CachedFd { file, generation });
        generation
    }

    /// The cached descriptor, if its generation still matches.
    pub fn cached_fd(&self, generation: u64) -> Option<&File> {
        match &self.open_fd {
            Some(cached) if cached.generation == generation => Some(&cached.file),
            _ => None,
        }
    }

    /// Any cached descriptor, together with its generation.
    pub fn any_cached_fd(&self) -> Option<(&File, u64)> {
        self.open_fd
            .as_ref()
            .map(|cached| (&cached.file, cached.generation))
    }

    pub fn drop_cached_fd(&mut self) {
        self.open_fd = None;
    }
}

impl std::fmt::Debug for FhState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhState")
            .field("attr", &self.attr)
            .field("flags", &self.flags)
            .field("nlookup", &self.nlookup)
            .field("caps", &self.caps.len())
            .finish()
    }
}

/// A cached filesystem object.
pub struct InternalFh {
    pub fh: ZfsFh,
    state: OrderedMutex<FhState>,
}

impl InternalFh {
    fn new(fh: ZfsFh, attr: Fattr) -> Arc<InternalFh> {
        Arc::new(InternalFh {
            fh,
            state: OrderedMutex::new(
                LockClass::Fh,
                FhState {
                    attr,
                    flags: MetadataFlags::empty(),
                    updated: IntervalTree::new(),
                    modified: IntervalTree::new(),
                    journal: Journal::new(),
                    hardlinks: HardlinkList::new(),
                    dentries: Vec::new(),
                    caps: Vec::new(),
                    open_fd: None,
                    fd_generation: 0,
                    nlookup: 0,
                    evict: false,
                    master_cap: None,
                },
            ),
        })
    }

    pub fn lock_state(&self) -> OrderedGuard<'_, FhState> {
        self.state.lock()
    }

    /// Issue a capability for `flags`.
    pub fn issue_cap(&self, flags: u32) -> ZfsCap {
        let mut verify = [0u8; VERIFY_LEN];
        rand::thread_rng().fill_bytes(&mut verify);
        let mut state = self.state.lock();
        state.caps.push(CapEntry { flags, verify });
        ZfsCap {
            fh: self.fh,
            flags,
            verify,
        }
    }

    /// Register a capability issued elsewhere (by the master of a remote
    /// volume) so later calls can validate it locally.
    pub fn register_cap(&self, cap: &ZfsCap) {
        let mut state = self.state.lock();
        let entry = CapEntry {
            flags: cap.flags,
            verify: cap.verify,
        };
        if !state.caps.contains(&entry) {
            state.caps.push(entry);
        }
    }

    /// True iff `cap` matches an issued capability.
    pub fn verify_cap(&self, cap: &ZfsCap) -> bool {
        let state = self.state.lock();
        state
            .caps
            .iter()
            .any(|entry| entry.flags == cap.flags && entry.verify == cap.verify)
    }

    /// Revoke `cap`. Returns whether it existed; the cached descriptor is
    /// dropped with the last capability.
    pub fn close_cap(&self, cap: &ZfsCap) -> bool {
        let mut state = self.state.lock();
        let before = state.caps.len();
        state
            .caps
            .retain(|entry| !(entry.flags == cap.flags && entry.verify == cap.verify));
        let removed = state.caps.len() != before;
        if removed && state.caps.is_empty() {
            state.open_fd = None;
        }
        removed
    }
}

impl std::fmt::Debug for InternalFh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalFh").field("fh", &self.fh).finish()
    }
}

/// Mutable state of a dentry, under the dentry mutex (class 6).
pub struct DentryState {
    pub name: Vec<u8>,
    /// Parent edge; `None` for a volume root.
    pub parent: Option<Weak<InternalDentry>>,
    pub fh: Arc<InternalFh>,
    /// Wall-clock validity deadline; `None` marks the dentry stale.
    pub deadline: Option<Instant>,
    /// Set while the subtree is re-linked during a cross-directory rename.
    pub disconnected: bool,
}

impl std::fmt::Debug for DentryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DentryState")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("fh", &self.fh.fh)
            .field("disconnected", &self.disconnected)
            .finish()
    }
}

/// A name+parent edge of the namespace.
pub struct InternalDentry {
    state: OrderedMutex<DentryState>,
}

impl InternalDentry {
    fn new(name: Vec<u8>, parent: Option<Weak<InternalDentry>>, fh: Arc<InternalFh>) -> Arc<Self> {
        Arc::new(InternalDentry {
            state: OrderedMutex::new(
                LockClass::Dentry,
                DentryState {
                    name,
                    parent,
                    fh,
                    deadline: Some(Instant::now() + DENTRY_TTL),
                    disconnected: false,
                },
            ),
        })
    }

    pub fn lock_state(&self) -> OrderedGuard<'_, DentryState> {
        self.state.lock()
    }

    pub fn fh(&self) -> Arc<InternalFh> {
        self.state.lock().fh.clone()
    }

    pub fn name(&self) -> Vec<u8> {
        self.state.lock().name.clone()
    }

    /// Mark the dentry stale; the next lookup revalidates it.
    pub fn set_stale(&self) {
        self.state.lock().deadline = None;
    }

    /// Refresh the validity deadline.
    pub fn revalidate(&self) {
        self.state.lock().deadline = Some(Instant::now() + DENTRY_TTL);
    }

    pub fn is_valid(&self) -> bool {
        match self.state.lock().deadline {
            Some(deadline) => Instant::now() < deadline,
            None => false,
        }
    }

    /// Path components from the volume root down to this dentry. Walks the
    /// parent chain taking one dentry lock at a time.
    pub fn path_components(self: &Arc<Self>) -> Vec<Vec<u8>> {
        let mut components = Vec::new();
        let mut current = self.clone();
        loop {
            let (name, parent) = {
                let state = current.state.lock();
                (state.name.clone(), state.parent.clone())
            };
            match parent.and_then(|weak| weak.upgrade()) {
                Some(parent) => {
                    components.push(name);
                    current = parent;
                }
                None => break,
            }
        }
        components.reverse();
        components
    }
}

impl std::fmt::Debug for InternalDentry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InternalDentry")
            .field("name", &String::from_utf8_lossy(&state.name))
            .field("fh", &state.fh.fh)
            .finish()
    }
}

#[derive(Default)]
struct Tables {
    fh_table: HashMap<ZfsFh, Arc<InternalFh>>,
    dentry_table: HashMap<(ZfsFh, Vec<u8>), Arc<InternalDentry>>,
}

/// Outcome of dropping a dentry.
#[derive(Debug, PartialEq, Eq)]
pub enum DropOutcome {
    /// The file handle still has edges or capabilities.
    FhAlive,
    /// The file handle died with this dentry; a forget is owed upstream.
    FhDied(ZfsFh),
    /// No such dentry.
    NotFound,
}

/// The fh and dentry tables, class 2 in the lock order.
pub struct FhTables {
    inner: OrderedMutex<Tables>,
}

impl FhTables {
    pub fn new() -> Self {
        FhTables {
            inner: OrderedMutex::new(LockClass::FhTables, Tables::default()),
        }
    }

    pub fn get_fh(&self, fh: &ZfsFh) -> Option<Arc<InternalFh>> {
        self.inner.lock().fh_table.get(fh).cloned()
    }

    /// Fetch or create the object of `fh`. A purged object is replaced.
    /// `attr` refreshes the cached attributes either way.
    pub fn get_or_create_fh(&self, fh: ZfsFh, attr: Fattr) -> Arc<InternalFh> {
        let mut tables = self.inner.lock();
        if let Some(existing) = tables.fh_table.get(&fh).cloned() {
            let mut state = existing.lock_state();
            if !state.evict {
                state.attr = attr;
                drop(state);
                return existing;
            }
            let live = state.live_dentries().len() + state.caps.len();
            if live > 0 {
                warn!("purged fh {} still has {} references", fh, live);
            }
            drop(state);
            tables.fh_table.remove(&fh);
        }
        let created = InternalFh::new(fh, attr);
        tables.fh_table.insert(fh, created.clone());
        created
    }

    pub fn lookup_dentry(&self, parent_fh: &ZfsFh, name: &[u8]) -> Option<Arc<InternalDentry>> {
        self.inner
            .lock()
            .dentry_table
            .get(&(*parent_fh, name.to_vec()))
            .cloned()
    }

    /// Create (or replace) the dentry `(parent, name) -> fh`. A replaced
    /// dentry's file handle is reaped like a dropped one.
    pub fn add_dentry(
        &self,
        parent: Option<&Arc<InternalDentry>>,
        parent_fh: ZfsFh,
        name: &[u8],
        fh: Arc<InternalFh>,
    ) -> (Arc<InternalDentry>, DropOutcome) {
        let mut tables = self.inner.lock();
        let key = (parent_fh, name.to_vec());
        let replaced = tables.dentry_table.remove(&key);
        let outcome = match replaced {
            Some(old) => Self::reap_dentry(&mut tables, &old),
            None => DropOutcome::NotFound,
        };

        let dentry = InternalDentry::new(
            name.to_vec(),
            parent.map(Arc::downgrade),
            fh.clone(),
        );
        tables.dentry_table.insert(key, dentry.clone());
        let mut state = fh.lock_state();
        state.dentries.push(Arc::downgrade(&dentry));
        drop(state);
        (dentry, outcome)
    }

    /// Remove the dentry `(parent_fh, name)` and reap its file handle if
    /// this was the last edge.
    pub fn drop_dentry(&self, parent_fh: &ZfsFh, name: &[u8]) -> DropOutcome {
        let mut tables = self.inner.lock();
        match tables.dentry_table.remove(&(*parent_fh, name.to_vec())) {
            Some(dentry) => Self::reap_dentry(&mut tables, &dentry),
            None => DropOutcome::NotFound,
        }
    }

    /// Move a dentry to a new `(parent, name)` key, preserving its file
    /// handle. Used by rename; the dentry is disconnected while re-linked.
    pub fn rekey_dentry(
        &self,
        old_parent_fh: &ZfsFh,
        old_name: &[u8],
        new_parent: &Arc<InternalDentry>,
        new_parent_fh: ZfsFh,
        new_name: &[u8],
    ) -> Option<Arc<InternalDentry>> {
        let mut tables = self.inner.lock();
        let dentry = tables
            .dentry_table
            .remove(&(*old_parent_fh, old_name.to_vec()))?;
        // Anything previously at the target is replaced, as rename(2) does.
        if let Some(old) = tables
            .dentry_table
            .remove(&(new_parent_fh, new_name.to_vec()))
        {
            Self::reap_dentry(&mut tables, &old);
        }
        tables
            .dentry_table
            .insert((new_parent_fh, new_name.to_vec()), dentry.clone());
        drop(tables);

        let mut state = dentry.lock_state();
        state.disconnected = true;
        state.name = new_name.to_vec();
        state.parent = Some(Arc::downgrade(new_parent));
        state.disconnected = false;
        state.deadline = Some(Instant::now() + DENTRY_TTL);
        drop(state);
        Some(dentry)
    }

    fn reap_dentry(tables: &mut Tables, dentry: &Arc<InternalDentry>) -> DropOutcome {
        let fh = dentry.fh();
        let mut state = fh.lock_state();
        state
            .dentries
            .retain(|weak| match weak.upgrade() {
                Some(live) => !Arc::ptr_eq(&live, dentry),
                None => false,
            });
        let dead =
            state.dentries.is_empty() && state.caps.is_empty() && state.nlookup == 0;
        drop(state);
        if dead {
            tables.fh_table.remove(&fh.fh);
            DropOutcome::FhDied(fh.fh)
        } else {
            DropOutcome::FhAlive
        }
    }

    /// Record one more successful lookup of `fh`.
    pub fn note_lookup(&self, fh: &ZfsFh) {
        if let Some(obj) = self.get_fh(fh) {
            obj.lock_state().nlookup += 1;
        }
    }

    /// Balance `count` lookups of `fh`; evicts the object once nothing
    /// references it.
    pub fn forget(&self, fh: &ZfsFh, count: u32) {
        let mut tables = self.inner.lock();
        let Some(obj) = tables.fh_table.get(fh).cloned() else {
            return;
        };
        let mut state = obj.lock_state();
        state.nlookup = state.nlookup.saturating_sub(u64::from(count));
        let dead = state.nlookup == 0
            && state.live_dentries().is_empty()
            && state.caps.is_empty();
        drop(state);
        if dead {
            tables.fh_table.remove(fh);
        }
    }

    /// Current lookup balance of `fh`, for revalidation decisions.
    pub fn nlookup(&self, fh: &ZfsFh) -> u64 {
        self.get_fh(fh)
            .map(|obj| obj.lock_state().nlookup)
            .unwrap_or(0)
    }

    /// Mark `fh` for eviction. In-flight holders finish against their
    /// `Arc`; the next lookup rebuilds a fresh object.
    pub fn purge_fh(&self, fh: &ZfsFh) {
        if let Some(obj) = self.get_fh(fh) {
            let mut state = obj.lock_state();
            state.evict = true;
            for dentry in state.live_dentries() {
                dentry.set_stale();
            }
        }
    }

    /// Number of live file handles, for invariant checks.
    pub fn fh_count(&self) -> usize {
        self.inner.lock().fh_table.len()
    }

    /// Resolve a capability to its live file handle, verifying the token.
    pub fn resolve_cap(&self, cap: &ZfsCap) -> Option<Arc<InternalFh>> {
        let obj = self.get_fh(&cap.fh)?;
        obj.verify_cap(cap).then_some(obj)
    }
}

impl Default for FhTables {
    fn default() -> Self {
        FhTables::new()
    }
}

impl std::fmt::Debug for FhTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.inner.lock();
        f.debug_struct("FhTables")
            .field("fhs", &tables.fh_table.len())
            .field("dentries", &tables.dentry_table.len())
            .finish()
    }
}
