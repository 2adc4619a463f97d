//! Journal of pending directory operations.
//!
//! Each directory on a cached volume carries an ordered log of `ADD` and
//! `DEL` entries still to be replayed against the master. The log keeps
//! insertion order in a doubly-linked chain and indexes entries by name.
//! Appending a `DEL` for a name whose `ADD` is still pending annihilates
//! both entries; re-appending an entry with the same operation and name
//! replaces the old one (the old record is a leftover of a crash).

use std::collections::HashMap;
use std::fs::File;
use std::io;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::codec::{read_frame, CodecError, DataCoder, FrameReader, MAX_NAME};
use crate::proto::ZfsFh;

/// Journaled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum JournalOp {
    Add = 0,
    Del = 1,
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub dev: u32,
    pub ino: u32,
    pub generation: u32,
    pub oper: JournalOp,
    pub name: Vec<u8>,
    pub master_fh: ZfsFh,
    pub master_version: u64,
}

impl JournalEntry {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        dc.start_encoding();
        dc.encode_u32(self.dev)?;
        dc.encode_u32(self.ino)?;
        dc.encode_u32(self.generation)?;
        dc.encode_u8(self.oper.into())?;
        dc.encode_str(&self.name)?;
        self.master_fh.encode(dc)?;
        dc.encode_u64(self.master_version)?;
        Ok(())
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(JournalEntry {
            dev: r.read_u32()?,
            ino: r.read_u32()?,
            generation: r.read_u32()?,
            oper: JournalOp::try_from(r.read_u8()?).map_err(|_| CodecError::BadEnum)?,
            name: r.read_str(MAX_NAME)?.to_vec(),
            master_fh: ZfsFh::decode(r)?,
            master_version: r.read_u64()?,
        })
    }
}

struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    entry: JournalEntry,
}

#[derive(Default)]
struct NameSlots {
    add: Option<usize>,
    del: Option<usize>,
}

impl NameSlots {
    fn get(&self, oper: JournalOp) -> Option<usize> {
        match oper {
            JournalOp::Add => self.add,
            JournalOp::Del => self.del,
        }
    }

    fn set(&mut self, oper: JournalOp, index: Option<usize>) {
        match oper {
            JournalOp::Add => self.add = index,
            JournalOp::Del => self.del = index,
        }
    }

    fn is_empty(&self) -> bool {
        self.add.is_none() && self.del.is_none()
    }
}

/// The in-memory journal of one directory.
#[derive(Default)]
pub struct Journal {
    links: Vec<Option<Link>>,
    free: Vec<usize>,
    first: Option<usize>,
    last: Option<usize>,
    len: usize,
    index: HashMap<Vec<u8>, NameSlots>,
}

impl Journal {
    pub fn new() -> Self {
        Journal::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn unlink(&mut self, index: usize) -> JournalEntry {
        let link = self.links[index].take().expect("unlinking a free slot");
        match link.prev {
            Some(prev) => {
                self.links[prev].as_mut().expect("corrupt chain").next = link.next;
            }
            None => self.first = link.next,
        }
        match link.next {
            Some(next) => {
                self.links[next].as_mut().expect("corrupt chain").prev = link.prev;
            }
            None => self.last = link.prev,
        }
        self.free.push(index);
        self.len -= 1;
        link.entry
    }

    fn push_tail(&mut self, entry: JournalEntry) -> usize {
        let link = Link {
            prev: self.last,
            next: None,
            entry,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.links[index] = Some(link);
                index
            }
            None => {
                self.links.push(Some(link));
                self.links.len() - 1
            }
        };
        if let Some(last) = self.last {
            self.links[last].as_mut().expect("corrupt chain").next = Some(index);
        }
        self.last = Some(index);
        if self.first.is_none() {
            self.first = Some(index);
        }
        self.len += 1;
        index
    }

    /// Append `entry`. Returns `false` when the entry annihilated a pending
    /// `ADD` and nothing was recorded.
    pub fn insert(&mut self, entry: JournalEntry) -> bool {
        // A record with the same operation is a crash leftover; drop it.
        let stale = self.index.get_mut(&entry.name).and_then(|slots| {
            let old = slots.get(entry.oper);
            if old.is_some() {
                slots.set(entry.oper, None);
            }
            old
        });
        if let Some(old) = stale {
            self.unlink(old);
        }

        if entry.oper == JournalOp::Del {
            let pending_add = self
                .index
                .get_mut(&entry.name)
                .and_then(|slots| slots.add.take());
            if let Some(add) = pending_add {
                if self.index.get(&entry.name).is_some_and(NameSlots::is_empty) {
                    self.index.remove(&entry.name);
                }
                self.unlink(add);
                return false;
            }
        }

        let oper = entry.oper;
        let name = entry.name.clone();
        let index = self.push_tail(entry);
        self.index.entry(name).or_default().set(oper, Some(index));
        true
    }

    pub fn member(&self, oper: JournalOp, name: &[u8]) -> bool {
        self.index
            .get(name)
            .and_then(|slots| slots.get(oper))
            .is_some()
    }

    /// Remove the entry with the given key. Returns whether one existed.
    pub fn delete(&mut self, oper: JournalOp, name: &[u8]) -> bool {
        let Some(slots) = self.index.get_mut(name) else {
            return false;
        };
        let Some(index) = slots.get(oper) else {
            return false;
        };
        slots.set(oper, None);
        if slots.is_empty() {
            self.index.remove(name);
        }
        self.unlink(index);
        true
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> JournalIter<'_> {
        JournalIter {
            journal: self,
            next: self.first,
        }
    }

    /// Replay all records from `file` into the journal. Annihilated pairs
    /// vanish during the replay.
    pub fn read_file(&mut self, file: &mut File) -> io::Result<()> {
        while let Some(frame) = read_frame(file)? {
            let mut r = FrameReader::new(&frame)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let entry = JournalEntry::decode(&mut r)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.insert(entry);
        }
        Ok(())
    }

    /// Write all entries, in order, to `file`.
    pub fn write_file(&self, file: &mut File) -> io::Result<()> {
        use std::io::Write;

        let mut dc = DataCoder::new();
        for entry in self.iter() {
            entry
                .encode(&mut dc)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            file.write_all(dc.finish_encoding())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|e| {
                (
                    e.oper,
                    String::from_utf8_lossy(&e.name).into_owned(),
                )
            }))
            .finish()
    }
}

/// Iterator over journal entries in insertion order.
#[derive(Debug)]
pub struct JournalIter<'a> {
    journal: &'a Journal,
    next: Option<usize>,
}

impl<'a> Iterator for JournalIter<'a> {
    type Item = &'a JournalEntry;

    fn next(&mut self) -> Option<&'a JournalEntry> {
        let index = self.next?;
        let link = self.journal.links[index].as_ref().expect("corrupt chain");
        self.next = link.next;
        Some(&link.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(oper: JournalOp, name: &[u8]) -> JournalEntry {
        JournalEntry {
            dev: 1,
            ino: 2,
            generation: 3,
            oper,
            name: name.to_vec(),
            master_fh: ZfsFh {
                sid: 4,
                vid: 5,
                dev: 6,
                ino: 7,
                generation: 8,
            },
            master_version: 9,
        }
    }

    fn names(journal: &Journal) -> Vec<(JournalOp, Vec<u8>)> {
        journal
            .iter()
            .map(|e| (e.oper, e.name.clone()))
            .collect()
    }

    #[test]
    fn add_del_annihilate() {
        let mut journal = Journal::new();
        assert!(journal.insert(entry(JournalOp::Add, b"x")));
        assert!(!journal.insert(entry(JournalOp::Del, b"x")));
        assert!(journal.is_empty());
    }

    #[test]
    fn same_oper_replaces() {
        let mut journal = Journal::new();
        journal.insert(entry(JournalOp::Add, b"x"));
        journal.insert(entry(JournalOp::Add, b"y"));
        journal.insert(entry(JournalOp::Add, b"x"));
        // Exactly one ADD("x") remains, now after "y".
        assert_eq!(
            names(&journal),
            vec![
                (JournalOp::Add, b"y".to_vec()),
                (JournalOp::Add, b"x".to_vec())
            ]
        );
    }

    #[test]
    fn del_then_add_coexist() {
        let mut journal = Journal::new();
        assert!(journal.insert(entry(JournalOp::Del, b"x")));
        assert!(journal.insert(entry(JournalOp::Add, b"x")));
        assert_eq!(journal.len(), 2);
        assert!(journal.member(JournalOp::Del, b"x"));
        assert!(journal.member(JournalOp::Add, b"x"));
    }

    #[test]
    fn delete_unlinks() {
        let mut journal = Journal::new();
        journal.insert(entry(JournalOp::Add, b"a"));
        journal.insert(entry(JournalOp::Add, b"b"));
        journal.insert(entry(JournalOp::Add, b"c"));
        assert!(journal.delete(JournalOp::Add, b"b"));
        assert!(!journal.delete(JournalOp::Add, b"b"));
        assert_eq!(
            names(&journal),
            vec![
                (JournalOp::Add, b"a".to_vec()),
                (JournalOp::Add, b"c".to_vec())
            ]
        );
    }

    #[test]
    fn replay_drops_annihilated_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        {
            let mut journal = Journal::new();
            journal.insert(entry(JournalOp::Add, b"keep"));
            let mut file = File::create(&path).unwrap();
            journal.write_file(&mut file).unwrap();
            // Simulate later appends of an annihilating pair.
            let mut dc = DataCoder::new();
            for e in [entry(JournalOp::Add, b"x"), entry(JournalOp::Del, b"x")] {
                e.encode(&mut dc).unwrap();
                use std::io::Write;
                file.write_all(dc.finish_encoding()).unwrap();
            }
        }
        let mut journal = Journal::new();
        let mut file = File::open(&path).unwrap();
        journal.read_file(&mut file).unwrap();
        assert_eq!(names(&journal), vec![(JournalOp::Add, b"keep".to_vec())]);
    }

    #[test]
    fn entry_codec_round_trip() {
        let e = entry(JournalOp::Del, b"some-name");
        let mut dc = DataCoder::new();
        e.encode(&mut dc).unwrap();
        let buf = dc.finish_encoding().to_vec();
        let mut r = FrameReader::new(&buf).unwrap();
        assert_eq!(JournalEntry::decode(&mut r).unwrap(), e);
        assert!(r.finished());
    }
}
