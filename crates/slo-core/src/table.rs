//! table.rs — open-addressed hash table keyed by [`Value`] (§4.5).
//!
//! Empty slots carry `key = Nil, value = Nil`; tombstones carry
//! `key = Nil, value = Bool(true)` so probe chains survive deletions.
//! Load factor is kept at or below 0.75 by doubling capacity (floor 8).
//!
//! Hashing a [`Value`] can require heap access (a string's content hash
//! lives on its `Object::String`), so callers compute the hash once via
//! [`crate::heap::Heap::hash_value`] and pass it in here — `Table` itself
//! never touches the heap, which keeps borrow-checking straightforward.

use crate::value::{ObjRef, Value};

const MIN_CAPACITY: usize = 8;
const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Debug)]
enum Slot {
    Empty,
    Tombstone,
    Occupied { hash: u64, key: Value, value: Value },
}

#[derive(Clone, Debug, Default)]
pub struct Table {
    slots: Vec<Slot>,
    /// Occupied entries *and* tombstones — mirrors the reference
    /// implementation's conservative load-factor accounting so a table
    /// full of tombstones still triggers a rebuild.
    count: usize,
    live: usize,
}

impl Table {
    pub fn new() -> Self {
        Self { slots: Vec::new(), count: 0, live: 0 }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn find_slot(slots: &[Slot], hash: u64, key: &Value) -> usize {
        let cap = slots.len();
        let mut index = (hash as usize) % cap;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &slots[index] {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied { key: k, .. } if k == key => return index,
                Slot::Occupied { .. } => {}
            }
            index = (index + 1) % cap;
        }
    }

    fn grow(&mut self) {
        let new_cap = (self.slots.len() * 2).max(MIN_CAPACITY);
        let mut new_slots = (0..new_cap).map(|_| Slot::Empty).collect::<Vec<_>>();
        let mut live = 0;
        for slot in std::mem::take(&mut self.slots) {
            if let Slot::Occupied { hash, key, value } = slot {
                let idx = Self::find_slot(&new_slots, hash, &key);
                new_slots[idx] = Slot::Occupied { hash, key, value };
                live += 1;
            }
        }
        self.slots = new_slots;
        self.count = live;
        self.live = live;
    }

    /// Inserts or overwrites `key`. Returns `true` if this created a new
    /// entry (vs. overwriting an existing one).
    pub fn set(&mut self, hash: u64, key: Value, value: Value) -> bool {
        if self.slots.is_empty() || (self.count + 1) as f64 > self.slots.len() as f64 * MAX_LOAD {
            self.grow();
        }
        let idx = Self::find_slot(&self.slots, hash, &key);
        let is_new = !matches!(self.slots[idx], Slot::Occupied { .. });
        let was_tombstone = matches!(self.slots[idx], Slot::Tombstone);
        self.slots[idx] = Slot::Occupied { hash, key, value };
        if is_new {
            self.live += 1;
            if !was_tombstone {
                self.count += 1;
            }
        }
        is_new
    }

    pub fn get(&self, hash: u64, key: &Value) -> Option<&Value> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = Self::find_slot(&self.slots, hash, key);
        match &self.slots[idx] {
            Slot::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, hash: u64, key: &Value) -> bool {
        self.get(hash, key).is_some()
    }

    pub fn delete(&mut self, hash: u64, key: &Value) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let idx = Self::find_slot(&self.slots, hash, key);
        if matches!(self.slots[idx], Slot::Occupied { .. }) {
            self.slots[idx] = Slot::Tombstone;
            self.live -= 1;
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied { key, value, .. } => Some((key, value)),
            _ => None,
        })
    }

    /// Look up an interned string by its raw bytes' hash without having
    /// allocated a candidate `Object::String` yet. `eq` compares the
    /// candidate `ObjRef` (which must be a `String` object) against the
    /// bytes being interned.
    pub fn find_string(&self, hash: u64, mut eq: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.slots.is_empty() {
            return None;
        }
        let cap = self.slots.len();
        let mut index = (hash as usize) % cap;
        loop {
            match &self.slots[index] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied { hash: h, key: Value::Obj(r), .. } if *h == hash && eq(*r) => {
                    return Some(*r)
                }
                Slot::Occupied { .. } => {}
            }
            index = (index + 1) % cap;
        }
    }

    /// Every object handle reachable through this table's keys and values
    /// (used by the GC to mark a table's contents).
    pub fn for_each(&self, mut f: impl FnMut(&Value, &Value)) {
        for slot in &self.slots {
            if let Slot::Occupied { key, value, .. } = slot {
                f(key, value);
            }
        }
    }

    pub fn remove_if(&mut self, mut pred: impl FnMut(&Value, &Value) -> bool) {
        for slot in &mut self.slots {
            if let Slot::Occupied { key, value, .. } = slot {
                if pred(key, value) {
                    *slot = Slot::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u64) -> u64 {
        n
    }

    #[test]
    fn set_then_get() {
        let mut t = Table::new();
        t.set(h(1), Value::Number(1.0), Value::Bool(true));
        assert_eq!(t.get(h(1), &Value::Number(1.0)), Some(&Value::Bool(true)));
    }

    #[test]
    fn overwrite_updates_value() {
        let mut t = Table::new();
        t.set(h(1), Value::Number(1.0), Value::Bool(true));
        t.set(h(1), Value::Number(1.0), Value::Bool(false));
        assert_eq!(t.get(h(1), &Value::Number(1.0)), Some(&Value::Bool(false)));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn delete_then_miss() {
        let mut t = Table::new();
        t.set(h(1), Value::Number(1.0), Value::Bool(true));
        assert!(t.delete(h(1), &Value::Number(1.0)));
        assert_eq!(t.get(h(1), &Value::Number(1.0)), None);
    }

    #[test]
    fn load_factor_respected() {
        let mut t = Table::new();
        for i in 0..100 {
            t.set(h(i), Value::Number(i as f64), Value::Nil);
        }
        assert!((t.len() as f64) <= t.capacity() as f64 * MAX_LOAD + 1.0);
    }

    #[test]
    fn tombstones_preserve_probe_chain() {
        let mut t = Table::new();
        // Force collisions within the same small table by reusing hash.
        t.set(h(0), Value::Number(1.0), Value::Bool(true));
        t.set(h(0), Value::Number(2.0), Value::Bool(true));
        t.delete(h(0), &Value::Number(1.0));
        assert_eq!(t.get(h(0), &Value::Number(2.0)), Some(&Value::Bool(true)));
    }
}
