//! Open-addressed hash table keyed by interned strings.
//!
//! Because strings are interned, key comparison is handle identity; the
//! cached string hash only seeds the probe sequence, so callers pass it in
//! alongside the key (the heap exposes it as
//! [`crate::heap::Heap::str_hash`]). Deleted slots become tombstones that
//! keep probe chains intact. The occupancy count includes tombstones and
//! drives growth at 75% load, which bounds probe length even under heavy
//! delete churn; growth rebuilds the table without tombstones.

use crate::value::{ObjRef, Value};

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Debug, Clone, Copy)]
enum Entry {
    Empty,
    Tombstone,
    Full { key: ObjRef, hash: u32, value: Value },
}

/// A string-keyed hash table used for globals, exports, fields and methods.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Full + tombstone slots.
    occupied: usize,
    /// Full slots only.
    live: usize,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match self.entries[self.find_slot(key, hash)] {
            Entry::Full { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, key: ObjRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Insert or overwrite. Returns `true` when the key was not present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.occupied + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            self.grow();
        }
        let slot = self.find_slot(key, hash);
        match self.entries[slot] {
            Entry::Full { .. } => {
                self.entries[slot] = Entry::Full { key, hash, value };
                false
            }
            reused => {
                // Reusing a tombstone does not raise occupancy again.
                if matches!(reused, Entry::Empty) {
                    self.occupied += 1;
                }
                self.live += 1;
                self.entries[slot] = Entry::Full { key, hash, value };
                true
            }
        }
    }

    /// Remove a key, leaving a tombstone. Returns `true` when it was present.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let slot = self.find_slot(key, hash);
        match self.entries[slot] {
            Entry::Full { .. } => {
                self.entries[slot] = Entry::Tombstone;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// Copy every entry of `other` into `self` (used for method inheritance).
    pub fn add_all(&mut self, other: &Table) {
        for (key, hash, value) in other.iter_with_hash() {
            self.set(key, hash, value);
        }
    }

    /// Iterate live `(key, value)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Full { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    fn iter_with_hash(&self) -> impl Iterator<Item = (ObjRef, u32, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Full { key, hash, value } => Some((*key, *hash, *value)),
            _ => None,
        })
    }

    /// Probe for `key`. Returns the index of its entry, or of the first
    /// reusable slot (preferring a tombstone) when absent.
    fn find_slot(&self, key: ObjRef, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            match self.entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Full { key: found, .. } => {
                    if found == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_cap = if self.entries.is_empty() { 8 } else { self.entries.len() * 2 };
        let old = std::mem::replace(&mut self.entries, vec![Entry::Empty; new_cap]);
        self.occupied = 0;
        self.live = 0;
        for entry in old {
            if let Entry::Full { key, hash, value } = entry {
                let slot = self.find_slot(key, hash);
                self.entries[slot] = Entry::Full { key, hash, value };
                self.occupied += 1;
                self.live += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> (ObjRef, u32) {
        // Interned strings have unique handles; the hash just seeds probing.
        (ObjRef(n), n.wrapping_mul(0x9e37_79b9))
    }

    #[test]
    fn set_get_overwrite() {
        let mut table = Table::new();
        let (k, h) = key(1);
        assert!(table.set(k, h, Value::Number(1.0)));
        assert!(!table.set(k, h, Value::Number(2.0)));
        assert_eq!(table.get(k, h), Some(Value::Number(2.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn delete_leaves_chain_intact() {
        let mut table = Table::new();
        // Three keys with the same hash collide into one probe chain.
        let (a, b, c) = (ObjRef(1), ObjRef(2), ObjRef(3));
        table.set(a, 7, Value::Number(1.0));
        table.set(b, 7, Value::Number(2.0));
        table.set(c, 7, Value::Number(3.0));
        assert!(table.delete(b, 7));
        // c sits past b's tombstone and must still be reachable.
        assert_eq!(table.get(c, 7), Some(Value::Number(3.0)));
        assert_eq!(table.get(b, 7), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn tombstone_reuse_keeps_occupancy_flat() {
        let mut table = Table::new();
        let (k, h) = key(9);
        table.set(k, h, Value::Null);
        table.delete(k, h);
        table.set(k, h, Value::Null);
        assert_eq!(table.occupied, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn growth_preserves_entries_and_drops_tombstones() {
        let mut table = Table::new();
        for n in 0..64 {
            let (k, h) = key(n);
            table.set(k, h, Value::Number(n as f64));
        }
        for n in 0..32 {
            let (k, h) = key(n);
            table.delete(k, h);
        }
        for n in 64..128 {
            let (k, h) = key(n);
            table.set(k, h, Value::Number(n as f64));
        }
        for n in 32..128 {
            let (k, h) = key(n);
            assert_eq!(table.get(k, h), Some(Value::Number(n as f64)), "key {}", n);
        }
        assert_eq!(table.len(), 96);
        // After at least one growth, occupancy equals the live count again.
        assert_eq!(table.occupied, table.live);
    }

    #[test]
    fn iterates_live_entries_only() {
        let mut table = Table::new();
        let (a, ha) = key(1);
        let (b, hb) = key(2);
        table.set(a, ha, Value::Bool(true));
        table.set(b, hb, Value::Bool(false));
        table.delete(a, ha);
        let collected: Vec<_> = table.iter().collect();
        assert_eq!(collected, vec![(b, Value::Bool(false))]);
    }
}
