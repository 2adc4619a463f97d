//! Disjoint interval set over half-open `[start, end)` byte ranges.
//!
//! Inserting an interval absorbs every stored interval it overlaps or
//! touches, so the set always holds maximal, pairwise non-adjacent
//! intervals. Deleting may split one stored interval in two. The set
//! persists as a flat little-endian array of `(start, end)` pairs written
//! in order, batched [`INTERVAL_COUNT`] entries per syscall.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::io::{Read, Write};

use smallvec::SmallVec;
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Number of intervals read or written per syscall.
pub const INTERVAL_COUNT: usize = 1024;

/// Result buffer for range queries; nearly all queries touch a handful of
/// intervals.
pub type IntervalVec = SmallVec<[(u64, u64); 4]>;

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy)]
struct RawInterval {
    start: U64,
    end: U64,
}

const RAW_SIZE: usize = size_of::<RawInterval>();

/// The in-memory interval set.
#[derive(Debug, Default, Clone)]
pub struct IntervalTree {
    map: BTreeMap<u64, u64>,
    dirty: bool,
    deleted: bool,
}

impl IntervalTree {
    pub fn new() -> Self {
        IntervalTree::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// True once any mutation happened since the last load/store.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// True once an interval was deleted; the on-disk form can then no
    /// longer be maintained by appending.
    pub fn had_deletion(&self) -> bool {
        self.deleted
    }

    /// Insert `[start, end)`, merging every overlapping or adjacent
    /// interval into one maximal interval. Empty intervals are a no-op.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;

        if let Some((&s, &e)) = self.map.range(..=start).next_back() {
            if e >= start {
                if e >= end && s <= start {
                    // Already covered by a larger interval.
                    return;
                }
                new_start = new_start.min(s);
                new_end = new_end.max(e);
                self.map.remove(&s);
            }
        }
        // Absorb every interval starting inside or adjacent to the range.
        let absorbed: Vec<(u64, u64)> = self
            .map
            .range(new_start..=new_end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in absorbed {
            new_end = new_end.max(e);
            self.map.remove(&s);
        }

        self.map.insert(new_start, new_end);
        self.dirty = true;
    }

    /// Remove `[start, end)` from the set, splitting a covering interval if
    /// needed.
    pub fn delete(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        if let Some((&s, &e)) = self.map.range(..start).next_back() {
            if e > start {
                self.deleted = true;
                self.dirty = true;
                self.map.insert(s, start);
                if e > end {
                    self.map.insert(end, e);
                    return;
                }
            }
        }
        let overlapping: Vec<(u64, u64)> = self
            .map
            .range(start..end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in overlapping {
            self.deleted = true;
            self.dirty = true;
            self.map.remove(&s);
            if e > end {
                self.map.insert(end, e);
                return;
            }
        }
    }

    /// True iff one stored interval contains the whole of `[start, end)`.
    pub fn covered(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        match self.map.range(..=start).next_back() {
            Some((_, &e)) => end <= e,
            None => false,
        }
    }

    /// The clipped overlaps of `[start, end)` with the stored intervals,
    /// in order.
    pub fn intersection(&self, start: u64, end: u64) -> IntervalVec {
        let mut out = IntervalVec::new();
        if start >= end {
            return out;
        }
        if let Some((&s, &e)) = self.map.range(..=start).next_back() {
            if e > start {
                out.push((start.max(s), end.min(e)));
            }
        }
        for (&s, &e) in self.map.range(start + 1..end) {
            out.push((s, end.min(e)));
        }
        out
    }

    /// The parts of `[start, end)` covered by no stored interval, in order.
    pub fn complement(&self, start: u64, end: u64) -> IntervalVec {
        let mut out = IntervalVec::new();
        if start >= end {
            return out;
        }
        let mut last = start;
        if let Some((_, &e)) = self.map.range(..=start).next_back() {
            if e > start {
                last = e;
            }
        }
        for (&s, &e) in self.map.range(start + 1..end) {
            if last >= end {
                return out;
            }
            if s > last {
                out.push((last, s));
            }
            last = last.max(e);
        }
        if last < end {
            out.push((last, end));
        }
        out
    }

    pub fn min(&self) -> Option<(u64, u64)> {
        self.map.iter().next().map(|(&s, &e)| (s, e))
    }

    pub fn max(&self) -> Option<(u64, u64)> {
        self.map.iter().next_back().map(|(&s, &e)| (s, e))
    }

    /// The interval with the greatest start strictly below `key`.
    pub fn predecessor(&self, key: u64) -> Option<(u64, u64)> {
        self.map.range(..key).next_back().map(|(&s, &e)| (s, e))
    }

    /// The interval with the least start strictly above `key`.
    pub fn successor(&self, key: u64) -> Option<(u64, u64)> {
        let from = key.checked_add(1)?;
        self.map.range(from..).next().map(|(&s, &e)| (s, e))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.map.iter().map(|(&s, &e)| (s, e))
    }

    /// Load `n` intervals from the current position of `file`, merging them
    /// into the set.
    pub fn read_file(&mut self, file: &mut File, n: u64) -> io::Result<()> {
        let mut remaining = n;
        let mut buf = vec![0u8; RAW_SIZE * INTERVAL_COUNT];
        while remaining > 0 {
            let block = (remaining as usize).min(INTERVAL_COUNT);
            let raw = &mut buf[..block * RAW_SIZE];
            file.read_exact(raw)?;
            let intervals = <[RawInterval]>::ref_from_bytes(raw)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short interval array"))?;
            for iv in intervals {
                self.insert(iv.start.get(), iv.end.get());
            }
            remaining -= block as u64;
        }
        self.dirty = false;
        self.deleted = false;
        Ok(())
    }

    /// Write the whole set, in order, to the current position of `file`.
    /// The file should be truncated and rewound by the caller.
    pub fn write_file(&mut self, file: &mut File) -> io::Result<()> {
        let mut batch: Vec<RawInterval> = Vec::with_capacity(INTERVAL_COUNT);
        for (&start, &end) in &self.map {
            batch.push(RawInterval {
                start: U64::new(start),
                end: U64::new(end),
            });
            if batch.len() == INTERVAL_COUNT {
                file.write_all(batch.as_bytes())?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            file.write_all(batch.as_bytes())?;
        }
        self.dirty = false;
        self.deleted = false;
        Ok(())
    }
}
