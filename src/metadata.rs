//! Per-volume metadata store.
//!
//! Every local volume keeps its bookkeeping under `<local_path>/.zfs`:
//! a hash file mapping `(dev, ino)` to the metadata record, a second hash
//! file mapping master file handles to local `(dev, ino)`, and per-inode
//! interval, journal and hardlink files fanned out over subdirectories
//! derived from the low bits of the inode number.
//!
//! The store belongs to its volume and every call happens under the
//! volume mutex; the store itself takes no locks.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use log::warn;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::hardlink::{HardlinkEntry, HardlinkList};
use crate::hashfile::{HashFile, HashFileRecord, VALID_SLOT};
use crate::interval::IntervalTree;
use crate::journal::{Journal, JournalEntry};
use crate::proto::ZfsFh;

/// Upper bound on the fan-out depth of the per-inode directories.
pub const MAX_METADATA_TREE_DEPTH: u32 = 8;

/// Initial slot count of a fresh hash file.
const INITIAL_TABLE_SIZE: u64 = 32;

bitflags! {
    /// Flags stored in a metadata record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MetadataFlags: u32 {
        /// All file data is cached locally.
        const COMPLETE = 1 << 0;
        /// Local state diverges from the master and awaits reconciliation.
        const MODIFIED = 1 << 1;
        /// A reconciliation pass currently owns the file.
        const UPDATE_IN_PROGRESS = 1 << 2;
    }
}

/// Pack a file type and permission bits into the stored modetype word.
pub fn make_modetype(ftype: crate::proto::FType, mode: u32) -> u32 {
    (u32::from(u8::from(ftype)) << 16) | (mode & 0xffff)
}

/// File type half of a modetype word.
pub fn modetype_ftype(modetype: u32) -> u8 {
    (modetype >> 16) as u8
}

/// Permission half of a modetype word.
pub fn modetype_mode(modetype: u32) -> u32 {
    modetype & 0xffff
}

/// On-disk rendering of a file handle.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Default)]
pub struct DiskFh {
    sid: U32,
    vid: U32,
    dev: U32,
    ino: U32,
    generation: U32,
}

impl From<ZfsFh> for DiskFh {
    fn from(fh: ZfsFh) -> DiskFh {
        DiskFh {
            sid: U32::new(fh.sid),
            vid: U32::new(fh.vid),
            dev: U32::new(fh.dev),
            ino: U32::new(fh.ino),
            generation: U32::new(fh.generation),
        }
    }
}

impl From<DiskFh> for ZfsFh {
    fn from(fh: DiskFh) -> ZfsFh {
        ZfsFh {
            sid: fh.sid.get(),
            vid: fh.vid.get(),
            dev: fh.dev.get(),
            ino: fh.ino.get(),
            generation: fh.generation.get(),
        }
    }
}

/// Metadata record keyed by `(dev, ino)`.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Default)]
pub struct MetadataRecord {
    slot_status: U32,
    generation: U32,
    local_version: U64,
    master_version: U64,
    flags: U32,
    modetype: U32,
    uid: U32,
    gid: U32,
    master_fh: DiskFh,
    dev: U32,
    ino: U32,
}

impl MetadataRecord {
    fn probe(dev: u32, ino: u32) -> MetadataRecord {
        MetadataRecord {
            dev: U32::new(dev),
            ino: U32::new(ino),
            ..MetadataRecord::default()
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev.get()
    }

    pub fn ino(&self) -> u32 {
        self.ino.get()
    }

    pub fn generation(&self) -> u32 {
        self.generation.get()
    }

    pub fn set_generation(&mut self, generation: u32) {
        self.generation = U32::new(generation);
    }

    pub fn local_version(&self) -> u64 {
        self.local_version.get()
    }

    pub fn set_local_version(&mut self, version: u64) {
        self.local_version = U64::new(version);
    }

    pub fn master_version(&self) -> u64 {
        self.master_version.get()
    }

    pub fn set_master_version(&mut self, version: u64) {
        self.master_version = U64::new(version);
    }

    pub fn flags(&self) -> MetadataFlags {
        MetadataFlags::from_bits_truncate(self.flags.get())
    }

    pub fn set_flags(&mut self, flags: MetadataFlags) {
        self.flags = U32::new(flags.bits());
    }

    pub fn modetype(&self) -> u32 {
        self.modetype.get()
    }

    pub fn set_modetype(&mut self, modetype: u32) {
        self.modetype = U32::new(modetype);
    }

    pub fn uid(&self) -> u32 {
        self.uid.get()
    }

    pub fn gid(&self) -> u32 {
        self.gid.get()
    }

    pub fn set_owner(&mut self, uid: u32, gid: u32) {
        self.uid = U32::new(uid);
        self.gid = U32::new(gid);
    }

    pub fn master_fh(&self) -> ZfsFh {
        self.master_fh.into()
    }

    pub fn set_master_fh(&mut self, fh: ZfsFh) {
        self.master_fh = fh.into();
    }
}

impl HashFileRecord for MetadataRecord {
    const BASE_SIZE: usize = size_of::<MetadataRecord>();

    fn slot_status(&self) -> u32 {
        self.slot_status.get()
    }

    fn set_slot_status(&mut self, status: u32) {
        self.slot_status = U32::new(status);
    }

    fn key_hash(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.dev.as_bytes());
        hasher.update(self.ino.as_bytes());
        hasher.finalize()
    }

    fn key_eq(&self, other: &Self) -> bool {
        self.dev == other.dev && self.ino == other.ino
    }
}

impl std::fmt::Debug for MetadataRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRecord")
            .field("dev", &self.dev())
            .field("ino", &self.ino())
            .field("generation", &self.generation())
            .field("local_version", &self.local_version())
            .field("master_version", &self.master_version())
            .field("flags", &self.flags())
            .field("uid", &self.uid())
            .field("gid", &self.gid())
            .field("master_fh", &self.master_fh())
            .finish()
    }
}

/// Record keyed by the master file handle, resolving it to the local
/// `(dev, ino)` without a directory walk.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Default)]
struct FhMappingRecord {
    slot_status: U32,
    master_fh: DiskFh,
    dev: U32,
    ino: U32,
}

impl HashFileRecord for FhMappingRecord {
    const BASE_SIZE: usize = size_of::<FhMappingRecord>();

    fn slot_status(&self) -> u32 {
        self.slot_status.get()
    }

    fn set_slot_status(&mut self, status: u32) {
        self.slot_status = U32::new(status);
    }

    fn key_hash(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.master_fh.as_bytes());
        hasher.finalize()
    }

    fn key_eq(&self, other: &Self) -> bool {
        self.master_fh.as_bytes() == other.master_fh.as_bytes()
    }
}

/// Which interval set of a file a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalKind {
    /// Byte ranges whose cached content is confirmed fresh.
    Updated,
    /// Byte ranges written locally and not yet reconciled.
    Modified,
}

impl IntervalKind {
    fn suffix(self) -> &'static str {
        match self {
            IntervalKind::Updated => "updated",
            IntervalKind::Modified => "modified",
        }
    }
}

/// The metadata store of one local volume.
pub struct MetadataStore {
    root: PathBuf,
    tree_depth: u32,
    metadata: HashFile<MetadataRecord>,
    fh_mapping: HashFile<FhMappingRecord>,
}

impl MetadataStore {
    /// Open (creating if needed) the store under `<local_path>/.zfs`.
    pub fn open(local_path: &Path, tree_depth: u32) -> io::Result<MetadataStore> {
        let root = local_path.join(".zfs");
        let tree_depth = tree_depth.min(MAX_METADATA_TREE_DEPTH);
        for dir in ["interval", "journal", "hardlinks"] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        let metadata = HashFile::open(&root.join("metadata.hash"), INITIAL_TABLE_SIZE)?;
        let fh_mapping = HashFile::open(&root.join("fh_mapping.hash"), INITIAL_TABLE_SIZE)?;
        Ok(MetadataStore {
            root,
            tree_depth,
            metadata,
            fh_mapping,
        })
    }

    /// The `.zfs` directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a per-inode file, fanned out below `kind_dir`.
    fn fanout_path(&self, kind_dir: &str, ino: u32, suffix: Option<&str>) -> PathBuf {
        let mut path = self.root.join(kind_dir);
        for level in 0..self.tree_depth {
            path.push(format!("{:02x}", (ino >> (8 * level)) & 0xff));
        }
        match suffix {
            Some(suffix) => path.push(format!("{ino}.{suffix}")),
            None => path.push(format!("{ino}")),
        }
        path
    }

    /// Fetch the metadata record of `(dev, ino)`, creating a fresh one on
    /// first sight. `modetype`, `uid` and `gid` seed the fresh record.
    pub fn get_metadata(
        &mut self,
        dev: u32,
        ino: u32,
        modetype: u32,
        uid: u32,
        gid: u32,
    ) -> io::Result<MetadataRecord> {
        if let Some(record) = self.metadata.lookup(&MetadataRecord::probe(dev, ino))? {
            return Ok(record);
        }
        let mut record = MetadataRecord::probe(dev, ino);
        record.set_slot_status(VALID_SLOT);
        record.set_generation(1);
        record.set_local_version(1);
        record.set_master_version(1);
        record.set_flags(MetadataFlags::COMPLETE);
        record.set_modetype(modetype);
        record.set_owner(uid, gid);
        self.metadata.insert(&mut record, false)?;
        Ok(record)
    }

    /// Look up a record without creating it.
    pub fn lookup_metadata(&mut self, dev: u32, ino: u32) -> io::Result<Option<MetadataRecord>> {
        self.metadata.lookup(&MetadataRecord::probe(dev, ino))
    }

    /// Store `record`, overwriting the previous state of its key.
    pub fn set_metadata(&mut self, record: &mut MetadataRecord) -> io::Result<()> {
        self.metadata.insert(record, false)
    }

    /// Drop the record of `(dev, ino)` together with its interval, journal
    /// and hardlink files.
    pub fn delete_metadata(&mut self, dev: u32, ino: u32) -> io::Result<bool> {
        let deleted = self.metadata.delete(&MetadataRecord::probe(dev, ino))?;
        for path in [
            self.fanout_path("interval", ino, Some(IntervalKind::Updated.suffix())),
            self.fanout_path("interval", ino, Some(IntervalKind::Modified.suffix())),
            self.fanout_path("journal", ino, None),
            self.fanout_path("hardlinks", ino, None),
        ] {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("cannot remove {}: {}", path.display(), err);
                }
            }
        }
        Ok(deleted)
    }

    /// Load one interval set of `ino` from disk.
    pub fn open_intervals(&self, ino: u32, kind: IntervalKind) -> io::Result<IntervalTree> {
        let path = self.fanout_path("interval", ino, Some(kind.suffix()));
        let mut tree = IntervalTree::new();
        match File::open(&path) {
            Ok(mut file) => {
                let n = file.metadata()?.len() / 16;
                tree.read_file(&mut file, n)?;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        Ok(tree)
    }

    /// Write one interval set of `ino` back to disk. An empty set removes
    /// the file; an unmodified set is left alone.
    pub fn close_intervals(
        &self,
        ino: u32,
        kind: IntervalKind,
        tree: &mut IntervalTree,
    ) -> io::Result<()> {
        if !tree.dirty() {
            return Ok(());
        }
        let path = self.fanout_path("interval", ino, Some(kind.suffix()));
        if tree.is_empty() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            return Ok(());
        }
        std::fs::create_dir_all(path.parent().expect("fanout path has a parent"))?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        tree.write_file(&mut file)
    }

    /// Append one journal record for directory `ino`.
    pub fn append_journal(&mut self, ino: u32, entry: &JournalEntry) -> io::Result<()> {
        let path = self.fanout_path("journal", ino, None);
        std::fs::create_dir_all(path.parent().expect("fanout path has a parent"))?;
        let mut file = OpenOptions::new().append(true).create(true).open(&path)?;
        let mut dc = crate::codec::DataCoder::new();
        entry
            .encode(&mut dc)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        use std::io::Write;
        file.write_all(dc.finish_encoding())
    }

    /// Replay the journal of directory `ino`.
    pub fn read_journal(&self, ino: u32) -> io::Result<Journal> {
        let path = self.fanout_path("journal", ino, None);
        let mut journal = Journal::new();
        match File::open(&path) {
            Ok(mut file) => journal.read_file(&mut file)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        Ok(journal)
    }

    /// Rewrite the journal of directory `ino` in compact replayed form.
    pub fn write_journal(&self, ino: u32, journal: &Journal) -> io::Result<()> {
        let path = self.fanout_path("journal", ino, None);
        if journal.is_empty() {
            match std::fs::remove_file(&path) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        std::fs::create_dir_all(path.parent().expect("fanout path has a parent"))?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        journal.write_file(&mut file)
    }

    /// Append one hardlink record for file `ino`.
    pub fn append_hardlink(&mut self, ino: u32, entry: &HardlinkEntry) -> io::Result<()> {
        let path = self.fanout_path("hardlinks", ino, None);
        std::fs::create_dir_all(path.parent().expect("fanout path has a parent"))?;
        let mut file = OpenOptions::new().append(true).create(true).open(&path)?;
        let mut dc = crate::codec::DataCoder::new();
        entry
            .encode(&mut dc)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        use std::io::Write;
        file.write_all(dc.finish_encoding())
    }

    /// Replay the hardlink list of file `ino`.
    pub fn read_hardlinks(&self, ino: u32) -> io::Result<HardlinkList> {
        let path = self.fanout_path("hardlinks", ino, None);
        let mut list = HardlinkList::new();
        match File::open(&path) {
            Ok(mut file) => list.read_file(&mut file)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        Ok(list)
    }

    /// Rewrite the hardlink list of file `ino`.
    pub fn write_hardlinks(&self, ino: u32, list: &HardlinkList) -> io::Result<()> {
        let path = self.fanout_path("hardlinks", ino, None);
        if list.is_empty() {
            match std::fs::remove_file(&path) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        std::fs::create_dir_all(path.parent().expect("fanout path has a parent"))?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        list.write_file(&mut file)
    }

    /// Remember that `master_fh` resolves to the local `(dev, ino)`.
    pub fn record_master_fh(&mut self, master_fh: ZfsFh, dev: u32, ino: u32) -> io::Result<()> {
        let mut record = FhMappingRecord {
            slot_status: U32::new(VALID_SLOT),
            master_fh: master_fh.into(),
            dev: U32::new(dev),
            ino: U32::new(ino),
        };
        self.fh_mapping.insert(&mut record, false)
    }

    /// Resolve a master file handle seen before.
    pub fn lookup_master_fh(&mut self, master_fh: ZfsFh) -> io::Result<Option<(u32, u32)>> {
        let probe = FhMappingRecord {
            slot_status: U32::new(0),
            master_fh: master_fh.into(),
            dev: U32::new(0),
            ino: U32::new(0),
        };
        Ok(self
            .fh_mapping
            .lookup(&probe)?
            .map(|r| (r.dev.get(), r.ino.get())))
    }

    /// Forget a master file handle mapping.
    pub fn delete_master_fh(&mut self, master_fh: ZfsFh) -> io::Result<bool> {
        let probe = FhMappingRecord {
            slot_status: U32::new(0),
            master_fh: master_fh.into(),
            dev: U32::new(0),
            ino: U32::new(0),
        };
        self.fh_mapping.delete(&probe)
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("root", &self.root)
            .field("tree_depth", &self.tree_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalOp;
    use crate::proto::FType;

    fn store(depth: u32) -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path(), depth).unwrap();
        (dir, store)
    }

    #[test]
    fn creates_layout() {
        let (dir, store) = store(1);
        assert_eq!(store.root(), dir.path().join(".zfs"));
        for entry in ["metadata.hash", "fh_mapping.hash", "interval", "journal", "hardlinks"] {
            assert!(dir.path().join(".zfs").join(entry).exists(), "{entry}");
        }
    }

    #[test]
    fn fanout_uses_low_bits() {
        let (_dir, store) = store(2);
        let path = store.fanout_path("journal", 0x1234, None);
        let rel: Vec<_> = path
            .strip_prefix(store.root())
            .unwrap()
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        assert_eq!(rel, vec!["journal", "34", "12", "4660"]);
    }

    #[test]
    fn fresh_metadata_seeds_generation_one() {
        let (_dir, mut store) = store(1);
        let modetype = make_modetype(FType::Reg, 0o644);
        let record = store.get_metadata(11, 22, modetype, 100, 200).unwrap();
        assert_eq!(record.generation(), 1);
        assert_eq!(record.local_version(), 1);
        assert_eq!(record.flags(), MetadataFlags::COMPLETE);
        assert_eq!(record.uid(), 100);
        assert_eq!(modetype_ftype(record.modetype()), u8::from(FType::Reg));
        assert_eq!(modetype_mode(record.modetype()), 0o644);

        // Second fetch returns the stored record, not a new one.
        let again = store.get_metadata(11, 22, 0, 0, 0).unwrap();
        assert_eq!(again.generation(), 1);
        assert_eq!(again.uid(), 100);
    }

    #[test]
    fn set_and_delete_metadata() {
        let (_dir, mut store) = store(1);
        let mut record = store.get_metadata(1, 2, 0, 0, 0).unwrap();
        record.set_local_version(7);
        record.set_flags(MetadataFlags::COMPLETE | MetadataFlags::MODIFIED);
        store.set_metadata(&mut record).unwrap();

        let read = store.lookup_metadata(1, 2).unwrap().unwrap();
        assert_eq!(read.local_version(), 7);
        assert!(read.flags().contains(MetadataFlags::MODIFIED));

        assert!(store.delete_metadata(1, 2).unwrap());
        assert!(store.lookup_metadata(1, 2).unwrap().is_none());
    }

    #[test]
    fn interval_files_round_trip() {
        let (_dir, store) = store(1);
        let mut tree = store.open_intervals(5, IntervalKind::Updated).unwrap();
        assert!(tree.is_empty());
        tree.insert(0, 100);
        tree.insert(200, 300);
        store
            .close_intervals(5, IntervalKind::Updated, &mut tree)
            .unwrap();

        let loaded = store.open_intervals(5, IntervalKind::Updated).unwrap();
        assert_eq!(loaded.iter().collect::<Vec<_>>(), vec![(0, 100), (200, 300)]);
        // The other kind is independent.
        let modified = store.open_intervals(5, IntervalKind::Modified).unwrap();
        assert!(modified.is_empty());
    }

    #[test]
    fn empty_intervals_remove_file() {
        let (_dir, store) = store(1);
        let mut tree = store.open_intervals(9, IntervalKind::Modified).unwrap();
        tree.insert(0, 10);
        store
            .close_intervals(9, IntervalKind::Modified, &mut tree)
            .unwrap();
        let path = store.fanout_path("interval", 9, Some("modified"));
        assert!(path.exists());

        let mut tree = store.open_intervals(9, IntervalKind::Modified).unwrap();
        tree.delete(0, 10);
        store
            .close_intervals(9, IntervalKind::Modified, &mut tree)
            .unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn journal_append_and_replay() {
        let (_dir, mut store) = store(1);
        let entry = JournalEntry {
            dev: 1,
            ino: 7,
            generation: 1,
            oper: JournalOp::Add,
            name: b"f".to_vec(),
            master_fh: ZfsFh::default(),
            master_version: 0,
        };
        store.append_journal(7, &entry).unwrap();
        let mut del = entry.clone();
        del.oper = JournalOp::Del;
        store.append_journal(7, &del).unwrap();

        // The pair annihilates during replay.
        let journal = store.read_journal(7).unwrap();
        assert!(journal.is_empty());
    }

    #[test]
    fn hardlinks_append_and_replay() {
        let (_dir, mut store) = store(1);
        let entry = HardlinkEntry {
            parent_dev: 1,
            parent_ino: 2,
            name: b"link".to_vec(),
        };
        store.append_hardlink(3, &entry).unwrap();
        store.append_hardlink(3, &entry).unwrap();
        let list = store.read_hardlinks(3).unwrap();
        // Duplicate records collapse on replay.
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn master_fh_mapping() {
        let (_dir, mut store) = store(1);
        let master = ZfsFh {
            sid: 2,
            vid: 3,
            dev: 4,
            ino: 5,
            generation: 6,
        };
        assert!(store.lookup_master_fh(master).unwrap().is_none());
        store.record_master_fh(master, 77, 88).unwrap();
        assert_eq!(store.lookup_master_fh(master).unwrap(), Some((77, 88)));
        assert!(store.delete_master_fh(master).unwrap());
        assert!(store.lookup_master_fh(master).unwrap().is_none());
    }
}
