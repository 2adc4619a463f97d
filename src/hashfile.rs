//! An open-addressed hash table persisted in a regular file.
//!
//! The file starts with a 16-byte header followed by fixed-size slots. Each
//! slot begins with a `u32` status word (empty / deleted / valid). Probing is
//! linear with wraparound. Before every mutation the table is rehashed when
//! it crosses a load threshold: the live slots are copied into `<name>.new`,
//! the new file is fsynced and renamed over the old one, and the new
//! descriptor is dup'ed onto the old descriptor number so callers holding
//! the original descriptor stay valid.

use std::fs::{File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::warn;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Slot has never held an element.
pub const EMPTY_SLOT: u32 = 0;
/// Slot held an element that was deleted.
pub const DELETED_SLOT: u32 = 1;
/// Slot holds a live element.
pub const VALID_SLOT: u32 = 2;

/// Size of the file header.
pub const HEADER_SIZE: u64 = 16;

/// Number of slots copied per read while rehashing.
const REHASH_CHUNK_SLOTS: usize = 256;

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy)]
struct Header {
    n_elements: U32,
    n_deleted: U32,
    pad: [u8; 8],
}

/// A fixed-layout record stored in a hash file. The first four bytes of the
/// serialized form must be the little-endian slot status.
pub trait HashFileRecord:
    FromBytes + IntoBytes + KnownLayout + Immutable + Unaligned + Copy + Send + 'static
{
    /// Length of the prefix written by a base-only insert.
    const BASE_SIZE: usize;

    fn slot_status(&self) -> u32;
    fn set_slot_status(&mut self, status: u32);

    /// Stable hash of the key fields; must not depend on process state.
    fn key_hash(&self) -> u32;

    /// Compare key fields only.
    fn key_eq(&self, other: &Self) -> bool;
}

enum Slot<R> {
    Found { index: u64, record: R },
    Free { index: u64, deleted: bool },
}

/// An open hash file of records of type `R`.
pub struct HashFile<R> {
    file: File,
    path: PathBuf,
    /// Number of slots.
    size: u64,
    /// Live plus reserved slots (the on-disk header mirrors this).
    n_elements: u32,
    n_deleted: u32,
    _record: PhantomData<R>,
}

impl<R: HashFileRecord> HashFile<R> {
    const ELEMENT_SIZE: u64 = size_of::<R>() as u64;

    /// Open an existing hash file or create a fresh one with `initial_size`
    /// slots.
    pub fn open(path: &Path, initial_size: u64) -> io::Result<HashFile<R>> {
        assert!(Self::ELEMENT_SIZE >= 4, "record must start with the status");
        assert!(R::BASE_SIZE >= 4 && R::BASE_SIZE <= size_of::<R>());
        assert!(initial_size.is_power_of_two());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "hash file is not a regular file",
            ));
        }

        let mut hfile = HashFile {
            file,
            path: path.to_owned(),
            size: initial_size,
            n_elements: 0,
            n_deleted: 0,
            _record: PhantomData,
        };

        if meta.len() >= HEADER_SIZE + Self::ELEMENT_SIZE {
            let mut raw = [0u8; HEADER_SIZE as usize];
            hfile.file.read_exact_at(&mut raw, 0)?;
            let header = Header::read_from_bytes(&raw)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad hash file header"))?;
            hfile.n_elements = header.n_elements.get();
            hfile.n_deleted = header.n_deleted.get();
            hfile.size = (meta.len() - HEADER_SIZE) / Self::ELEMENT_SIZE;
        } else {
            hfile
                .file
                .set_len(HEADER_SIZE + initial_size * Self::ELEMENT_SIZE)?;
            hfile.write_header()?;
        }
        Ok(hfile)
    }

    /// Number of live elements.
    pub fn live(&self) -> u32 {
        self.n_elements - self.n_deleted
    }

    /// Current number of slots.
    pub fn table_size(&self) -> u64 {
        self.size
    }

    /// Number of tombstoned slots.
    pub fn tombstones(&self) -> u32 {
        self.n_deleted
    }

    #[cfg(test)]
    fn set_counters(&mut self, n_elements: u32, n_deleted: u32) {
        self.n_elements = n_elements;
        self.n_deleted = n_deleted;
    }

    fn slot_offset(&self, index: u64) -> u64 {
        HEADER_SIZE + index * Self::ELEMENT_SIZE
    }

    fn write_header(&self) -> io::Result<()> {
        let header = Header {
            n_elements: U32::new(self.n_elements),
            n_deleted: U32::new(self.n_deleted),
            pad: [0; 8],
        };
        self.file.write_all_at(header.as_bytes(), 0)
    }

    fn read_slot(&self, index: u64) -> io::Result<R> {
        let mut raw = vec![0u8; size_of::<R>()];
        self.file.read_exact_at(&mut raw, self.slot_offset(index))?;
        R::read_from_bytes(&raw)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short hash file slot"))
    }

    /// Probe for the slot of `probe`. With `for_insert`, remember the first
    /// deleted slot so the insert can reuse it.
    fn find_slot(&self, probe: &R, for_insert: bool) -> io::Result<Slot<R>> {
        let mut index = u64::from(probe.key_hash()) % self.size;
        let mut first_deleted = None;
        for _ in 0..self.size {
            let record = self.read_slot(index)?;
            match record.slot_status() {
                EMPTY_SLOT => {
                    return Ok(match first_deleted {
                        Some(index) if for_insert => Slot::Free {
                            index,
                            deleted: true,
                        },
                        _ => Slot::Free {
                            index,
                            deleted: false,
                        },
                    });
                }
                DELETED_SLOT => {
                    if first_deleted.is_none() {
                        first_deleted = Some(index);
                    }
                }
                VALID_SLOT => {
                    if probe.key_eq(&record) {
                        return Ok(Slot::Found { index, record });
                    }
                }
                status => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("corrupt slot status {status}"),
                    ));
                }
            }
            index += 1;
            if index >= self.size {
                index -= self.size;
            }
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "hash file has no free slot",
        ))
    }

    /// Look up the record matching the key fields of `probe`.
    pub fn lookup(&self, probe: &R) -> io::Result<Option<R>> {
        match self.find_slot(probe, false)? {
            Slot::Found { record, .. } => Ok(Some(record)),
            Slot::Free { .. } => Ok(None),
        }
    }

    /// Insert `record`, overwriting a record with an equal key. With
    /// `base_only` just the first [`HashFileRecord::BASE_SIZE`] bytes are
    /// written, reserving the slot while the remaining fields are filled by
    /// a later full insert.
    pub fn insert(&mut self, record: &mut R, base_only: bool) -> io::Result<()> {
        self.maybe_rehash()?;

        record.set_slot_status(VALID_SLOT);
        let (index, rollback) = match self.find_slot(record, true)? {
            Slot::Found { index, .. } => (index, Rollback::None),
            Slot::Free {
                index,
                deleted: true,
            } => {
                self.n_deleted -= 1;
                (index, Rollback::Deleted)
            }
            Slot::Free {
                index,
                deleted: false,
            } => {
                self.n_elements += 1;
                (index, Rollback::Element)
            }
        };

        let bytes = record.as_bytes();
        let len = if base_only { R::BASE_SIZE } else { bytes.len() };
        let result = self
            .file
            .write_all_at(&bytes[..len], self.slot_offset(index))
            .and_then(|_| self.write_header());
        if let Err(err) = result {
            match rollback {
                Rollback::Deleted => self.n_deleted += 1,
                Rollback::Element => self.n_elements -= 1,
                Rollback::None => {}
            }
            return Err(err);
        }
        Ok(())
    }

    /// Delete the record matching the key fields of `probe`. Returns whether
    /// a live record was removed.
    pub fn delete(&mut self, probe: &R) -> io::Result<bool> {
        self.maybe_rehash()?;

        let index = match self.find_slot(probe, false)? {
            Slot::Found { index, .. } => index,
            Slot::Free { .. } => return Ok(false),
        };

        let mut tombstone = vec![0u8; size_of::<R>()];
        tombstone[..4].copy_from_slice(&DELETED_SLOT.to_le_bytes());
        self.n_deleted += 1;
        let result = self
            .file
            .write_all_at(&tombstone, self.slot_offset(index))
            .and_then(|_| self.write_header());
        if let Err(err) = result {
            self.n_deleted -= 1;
            return Err(err);
        }
        Ok(true)
    }

    fn maybe_rehash(&mut self) -> io::Result<()> {
        let live = u64::from(self.live());
        let new_size = if 2 * live >= self.size {
            self.size * 2
        } else if 8 * live <= self.size && self.size > 32 {
            self.size / 2
        } else if 2 * u64::from(self.n_elements) >= self.size {
            self.size
        } else {
            return Ok(());
        };
        self.rehash(new_size)
    }

    fn rehash(&mut self, new_size: u64) -> io::Result<()> {
        let new_path = self.path.with_extension("new");
        let result = self.rehash_into(&new_path, new_size);
        if result.is_err() {
            if let Err(err) = std::fs::remove_file(&new_path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("cannot remove {}: {}", new_path.display(), err);
                }
            }
        }
        result
    }

    fn rehash_into(&mut self, new_path: &Path, new_size: u64) -> io::Result<()> {
        let new_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(new_path)?;
        new_file.set_len(HEADER_SIZE + new_size * Self::ELEMENT_SIZE)?;

        let live = self.live();
        let header = Header {
            n_elements: U32::new(live),
            n_deleted: U32::new(0),
            pad: [0; 8],
        };
        new_file.write_all_at(header.as_bytes(), 0)?;

        let elem = size_of::<R>();
        let mut buffer = vec![0u8; elem * REHASH_CHUNK_SLOTS];
        let mut copied = 0u64;
        while copied < self.size {
            let chunk = REHASH_CHUNK_SLOTS.min((self.size - copied) as usize);
            let raw = &mut buffer[..chunk * elem];
            self.file.read_exact_at(raw, self.slot_offset(copied))?;
            for i in 0..chunk {
                let record = R::read_from_bytes(&raw[i * elem..(i + 1) * elem])
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short slot"))?;
                if record.slot_status() != VALID_SLOT {
                    continue;
                }
                let index = find_empty_slot(&new_file, new_size, elem as u64, record.key_hash())?;
                new_file.write_all_at(
                    record.as_bytes(),
                    HEADER_SIZE + index * Self::ELEMENT_SIZE,
                )?;
            }
            copied += chunk as u64;
        }

        new_file.sync_all()?;
        std::fs::rename(new_path, &self.path)?;

        // Preserve the descriptor number callers may have cloned.
        let rc = unsafe { libc::dup2(new_file.as_raw_fd(), self.file.as_raw_fd()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        self.size = new_size;
        self.n_elements = live;
        self.n_deleted = 0;
        Ok(())
    }
}

enum Rollback {
    None,
    Deleted,
    Element,
}

/// Probe a freshly written table (no deleted slots) for an empty slot.
fn find_empty_slot(file: &File, size: u64, elem: u64, hash: u32) -> io::Result<u64> {
    let mut index = u64::from(hash) % size;
    for _ in 0..size {
        let mut status = [0u8; 4];
        file.read_exact_at(&mut status, HEADER_SIZE + index * elem)?;
        if u32::from_le_bytes(status) == EMPTY_SLOT {
            return Ok(index);
        }
        index += 1;
        if index >= size {
            index -= size;
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "no empty slot while rehashing",
    ))
}

impl<R> std::fmt::Debug for HashFile<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashFile")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("n_elements", &self.n_elements)
            .field("n_deleted", &self.n_deleted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
    struct TestRecord {
        status: U32,
        key: U32,
        value: zerocopy::little_endian::U64,
    }

    impl TestRecord {
        fn new(key: u32, value: u64) -> Self {
            TestRecord {
                status: U32::new(0),
                key: U32::new(key),
                value: zerocopy::little_endian::U64::new(value),
            }
        }

        fn probe(key: u32) -> Self {
            TestRecord::new(key, 0)
        }
    }

    impl HashFileRecord for TestRecord {
        const BASE_SIZE: usize = 8;

        fn slot_status(&self) -> u32 {
            self.status.get()
        }

        fn set_slot_status(&mut self, status: u32) {
            self.status = U32::new(status);
        }

        fn key_hash(&self) -> u32 {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(self.key.as_bytes());
            hasher.finalize()
        }

        fn key_eq(&self, other: &Self) -> bool {
            self.key == other.key
        }
    }

    fn open_in(dir: &Path, size: u64) -> HashFile<TestRecord> {
        HashFile::open(&dir.join("test.hash"), size).unwrap()
    }

    #[test]
    fn insert_lookup_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut hfile = open_in(dir.path(), 32);

        let mut rec = TestRecord::new(7, 42);
        hfile.insert(&mut rec, false).unwrap();
        let found = hfile.lookup(&TestRecord::probe(7)).unwrap().unwrap();
        assert_eq!(found.value.get(), 42);

        assert!(hfile.delete(&TestRecord::probe(7)).unwrap());
        assert!(hfile.lookup(&TestRecord::probe(7)).unwrap().is_none());
        assert!(!hfile.delete(&TestRecord::probe(7)).unwrap());
    }

    #[test]
    fn overwrite_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut hfile = open_in(dir.path(), 32);

        hfile.insert(&mut TestRecord::new(1, 10), false).unwrap();
        hfile.insert(&mut TestRecord::new(1, 20), false).unwrap();
        assert_eq!(hfile.live(), 1);
        let found = hfile.lookup(&TestRecord::probe(1)).unwrap().unwrap();
        assert_eq!(found.value.get(), 20);
    }

    #[test]
    fn grows_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut hfile = open_in(dir.path(), 4);

        hfile.insert(&mut TestRecord::new(1, 1), false).unwrap();
        hfile.insert(&mut TestRecord::new(2, 2), false).unwrap();
        assert_eq!(hfile.table_size(), 4);
        assert_eq!(hfile.live(), 2);

        // The table is exactly at the threshold: the next insert grows it
        // first, then stores the element.
        hfile.insert(&mut TestRecord::new(3, 3), false).unwrap();
        assert_eq!(hfile.table_size(), 8);
        assert_eq!(hfile.live(), 3);
        for key in 1..=3 {
            let found = hfile.lookup(&TestRecord::probe(key)).unwrap().unwrap();
            assert_eq!(found.value.get(), u64::from(key));
        }
    }

    #[test]
    fn shrinks_when_sparse() {
        let dir = tempfile::tempdir().unwrap();
        let mut hfile = open_in(dir.path(), 64);
        for key in 0..8 {
            hfile.insert(&mut TestRecord::new(key, 1), false).unwrap();
        }
        // Draining below an eighth of the table halves it (but never below
        // 32 slots).
        for key in 0..7 {
            hfile.delete(&TestRecord::probe(key)).unwrap();
        }
        hfile.insert(&mut TestRecord::new(100, 5), false).unwrap();
        assert_eq!(hfile.table_size(), 32);
        assert!(hfile.lookup(&TestRecord::probe(7)).unwrap().is_some());
        assert!(hfile.lookup(&TestRecord::probe(100)).unwrap().is_some());
        assert!(hfile.lookup(&TestRecord::probe(3)).unwrap().is_none());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut hfile = open_in(dir.path(), 32);
            for key in 0..10 {
                hfile
                    .insert(&mut TestRecord::new(key, u64::from(key) * 3), false)
                    .unwrap();
            }
        }
        let hfile = open_in(dir.path(), 32);
        assert_eq!(hfile.live(), 10);
        for key in 0..10 {
            let found = hfile.lookup(&TestRecord::probe(key)).unwrap().unwrap();
            assert_eq!(found.value.get(), u64::from(key) * 3);
        }
    }

    #[test]
    fn base_only_reserves_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut hfile = open_in(dir.path(), 32);
        hfile.insert(&mut TestRecord::new(9, 999), true).unwrap();
        let found = hfile.lookup(&TestRecord::probe(9)).unwrap().unwrap();
        // The value lies beyond BASE_SIZE and was not written.
        assert_eq!(found.value.get(), 0);
        hfile.insert(&mut TestRecord::new(9, 999), false).unwrap();
        let found = hfile.lookup(&TestRecord::probe(9)).unwrap().unwrap();
        assert_eq!(found.value.get(), 999);
        assert_eq!(hfile.live(), 1);
    }

    #[test]
    fn tombstones_trigger_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut hfile = open_in(dir.path(), 64);
        for key in 0..16 {
            hfile.insert(&mut TestRecord::new(key, 1), false).unwrap();
        }
        for key in 0..4 {
            hfile.delete(&TestRecord::probe(key)).unwrap();
        }
        // Pretend a long churn left half the slots used (live count is
        // unchanged): the next mutation must compact at the same size.
        hfile.set_counters(32, 20);
        hfile.insert(&mut TestRecord::new(99, 9), false).unwrap();
        assert_eq!(hfile.table_size(), 64);
        assert_eq!(hfile.tombstones(), 0);
        assert_eq!(hfile.live(), 13);
        for key in 4..16 {
            assert!(hfile.lookup(&TestRecord::probe(key)).unwrap().is_some());
        }
        assert!(hfile.lookup(&TestRecord::probe(0)).unwrap().is_none());
        assert!(hfile.lookup(&TestRecord::probe(99)).unwrap().is_some());
    }
}
