// File: src/table.rs
//
// Open-addressing hash table with tombstones, specialised for interned
// string keys. Used for globals, instance fields, and class method tables;
// `find_string` additionally lets the interner look up an existing String
// by content and hash without allocating a new one.

use crate::heap::Heap;
use crate::value::{ObjHandle, Value};

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy, Debug)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(ObjHandle, u32),
}

#[derive(Clone, Debug)]
struct Entry {
    slot: Slot,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry { slot: Slot::Empty, value: Value::Nil }
    }
}

#[derive(Clone, Debug)]
pub struct Table {
    entries: Vec<Entry>,
    /// Live entries + tombstones; used to decide when to grow.
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| matches!(e.slot, Slot::Occupied(..))).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry(entries: &[Entry], cap: usize, key: ObjHandle, hash: u32) -> usize {
        let mut index = (hash as usize) & (cap - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match entries[index].slot {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) if k == key => return index,
                _ => {}
            }
            index = (index + 1) & (cap - 1);
        }
    }

    fn grow(&mut self) {
        let new_cap = if self.entries.is_empty() { 8 } else { self.entries.len() * 2 };
        let mut new_entries = vec![Entry::empty(); new_cap];
        let mut live = 0;
        for e in &self.entries {
            if let Slot::Occupied(key, hash) = e.slot {
                let idx = Self::find_entry(&new_entries, new_cap, key, hash);
                new_entries[idx] = Entry { slot: Slot::Occupied(key, hash), value: e.value };
                live += 1;
            }
        }
        self.entries = new_entries;
        self.count = live;
    }

    /// Returns true if this inserted a brand-new key (as opposed to
    /// overwriting an existing one).
    pub fn set(&mut self, key: ObjHandle, hash: u32, value: Value) -> bool {
        if self.entries.is_empty() || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.grow();
        }
        let cap = self.capacity();
        let index = Self::find_entry(&self.entries, cap, key, hash);
        let is_new = !matches!(self.entries[index].slot, Slot::Occupied(..));
        if is_new && !matches!(self.entries[index].slot, Slot::Tombstone) {
            self.count += 1;
        }
        self.entries[index] = Entry { slot: Slot::Occupied(key, hash), value };
        is_new
    }

    pub fn get(&self, key: ObjHandle, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let cap = self.capacity();
        let index = Self::find_entry(&self.entries, cap, key, hash);
        match self.entries[index].slot {
            Slot::Occupied(k, _) if k == key => Some(self.entries[index].value),
            _ => None,
        }
    }

    pub fn delete(&mut self, key: ObjHandle, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let cap = self.capacity();
        let index = Self::find_entry(&self.entries, cap, key, hash);
        match self.entries[index].slot {
            Slot::Occupied(k, _) if k == key => {
                self.entries[index] = Entry { slot: Slot::Tombstone, value: Value::Nil };
                true
            }
            _ => false,
        }
    }

    /// Copies every entry of `other` into `self`, used by `INHERIT`.
    pub fn add_all(&mut self, other: &Table) {
        for e in &other.entries {
            if let Slot::Occupied(key, hash) = e.slot {
                self.set(key, hash, e.value);
            }
        }
    }

    /// Content+hash lookup used by the string interner to find an existing
    /// String without allocating a new one.
    pub fn find_string(&self, heap: &Heap, hash: u32, text: &str) -> Option<ObjHandle> {
        if self.entries.is_empty() {
            return None;
        }
        let cap = self.capacity();
        let mut index = (hash as usize) & (cap - 1);
        loop {
            match self.entries[index].slot {
                Slot::Empty => return None,
                Slot::Occupied(key, h) if h == hash && heap.get_string(key) == text => {
                    return Some(key);
                }
                _ => {}
            }
            index = (index + 1) & (cap - 1);
        }
    }

    /// Iterates over every (key, value) pair, for GC marking.
    pub fn iter(&self) -> impl Iterator<Item = (ObjHandle, Value)> + '_ {
        self.entries.iter().filter_map(|e| match e.slot {
            Slot::Occupied(key, _) => Some((key, e.value)),
            _ => None,
        })
    }

    /// Removes every entry whose key fails `is_live`. Used to weak-sweep
    /// the intern table: a string present only in the intern table is not
    /// a GC root, so unmarked keys must be dropped before sweep frees them.
    pub fn retain_keys(&mut self, mut is_live: impl FnMut(ObjHandle) -> bool) {
        for e in &mut self.entries {
            if let Slot::Occupied(key, _) = e.slot {
                if !is_live(key) {
                    e.slot = Slot::Tombstone;
                    e.value = Value::Nil;
                }
            }
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u32) -> ObjHandle {
        ObjHandle(n)
    }

    #[test]
    fn set_get_roundtrip() {
        let mut t = Table::new();
        assert!(t.set(h(1), 111, Value::Number(1.0)));
        assert!(!t.set(h(1), 111, Value::Number(2.0)));
        assert_eq!(t.get(h(1), 111).unwrap().as_number(), Some(2.0));
    }

    #[test]
    fn delete_leaves_tombstone_that_probing_skips() {
        let mut t = Table::new();
        t.set(h(1), 8, Value::Number(1.0));
        t.set(h(2), 8, Value::Number(2.0)); // collides with key 1 under small capacity
        assert!(t.delete(h(1), 8));
        assert_eq!(t.get(h(2), 8).unwrap().as_number(), Some(2.0));
        assert!(t.get(h(1), 8).is_none());
    }

    #[test]
    fn grows_and_preserves_entries() {
        let mut t = Table::new();
        for i in 0..200u32 {
            t.set(h(i), i, Value::Number(i as f64));
        }
        for i in 0..200u32 {
            assert_eq!(t.get(h(i), i).unwrap().as_number(), Some(i as f64));
        }
    }
}
