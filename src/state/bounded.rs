//! Fixed-capacity record tables
//!
//! Neither table ever grows past its capacity. Inserting into a full table
//! evicts the oldest evictable entry and hands it back to the caller, who is
//! responsible for scheduling a compaction.

use super::record::{FileFingerprint, FingerprintFlags, PathHash};

/// Entries that may be pushed out of a full table.
pub trait Evictable {
    fn is_evictable(&self) -> bool {
        true
    }
}

/// Insertion-ordered list with a hard capacity.
#[derive(Debug, Clone)]
pub struct BoundedList<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T: Evictable> BoundedList<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append `item`. When full, the oldest evictable entry (or the oldest
    /// entry if none is evictable) is removed first and returned.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            let index = self
                .items
                .iter()
                .position(|i| i.is_evictable())
                .unwrap_or(0);
            Some(self.items.remove(index))
        } else {
            None
        };
        self.items.push(item);
        evicted
    }

    pub fn position<F: Fn(&T) -> bool>(&self, pred: F) -> Option<usize> {
        self.items.iter().position(pred)
    }

    pub fn contains<F: Fn(&T) -> bool>(&self, pred: F) -> bool {
        self.position(pred).is_some()
    }

    pub fn remove_where<F: Fn(&T) -> bool>(&mut self, pred: F) -> Option<T> {
        self.position(pred).map(|index| self.items.remove(index))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: PartialEq> PartialEq for BoundedList<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl Evictable for FileFingerprint {
    fn is_evictable(&self) -> bool {
        !self.is_persistent()
    }
}

#[derive(Debug, Clone)]
struct FileSlot {
    entry: FileFingerprint,
    seq: u64,
}

/// Slot table of file fingerprints addressed by index.
///
/// Removal clears the ACTIVE flag and leaves the slot for reuse; `seq`
/// records insertion order so eviction stays FIFO across reused slots.
#[derive(Debug, Clone)]
pub struct FileTable {
    slots: Vec<FileSlot>,
    capacity: usize,
    next_seq: u64,
}

impl FileTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    fn find(&self, hash: PathHash) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.entry.is_active() && s.entry.path_hash == hash)
    }

    pub fn get(&self, hash: PathHash) -> Option<&FileFingerprint> {
        self.find(hash).map(|i| &self.slots[i].entry)
    }

    /// Insert or replace the entry for `entry.path_hash`. Returns the entry
    /// evicted to make room, if any.
    pub fn upsert(&mut self, mut entry: FileFingerprint) -> Option<FileFingerprint> {
        entry.flags |= FingerprintFlags::ACTIVE;

        if let Some(index) = self.find(entry.path_hash) {
            self.slots[index].entry = entry;
            return None;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(index) = self.slots.iter().position(|s| !s.entry.is_active()) {
            self.slots[index] = FileSlot { entry, seq };
            return None;
        }
        if self.slots.len() < self.capacity {
            self.slots.push(FileSlot { entry, seq });
            return None;
        }

        let victim = self
            .oldest(|s| s.entry.is_evictable())
            .or_else(|| self.oldest(|_| true))?;
        let evicted = self.slots[victim].entry;
        self.slots[victim] = FileSlot { entry, seq };
        Some(evicted)
    }

    fn oldest<F: Fn(&FileSlot) -> bool>(&self, pred: F) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.entry.is_active() && pred(s))
            .min_by_key(|(_, s)| s.seq)
            .map(|(i, _)| i)
    }

    pub fn remove(&mut self, hash: PathHash) -> bool {
        match self.find(hash) {
            Some(index) => {
                self.slots[index].entry.flags.remove(FingerprintFlags::ACTIVE);
                true
            }
            None => false,
        }
    }

    /// Active entries in insertion order.
    pub fn ordered(&self) -> Vec<FileFingerprint> {
        let mut active: Vec<&FileSlot> =
            self.slots.iter().filter(|s| s.entry.is_active()).collect();
        active.sort_by_key(|s| s.seq);
        active.into_iter().map(|s| s.entry).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_active()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.next_seq = 0;
    }
}

impl PartialEq for FileTable {
    fn eq(&self, other: &Self) -> bool {
        self.ordered() == other.ordered()
    }
}
