use crate::memory::grow_capacity;
use crate::objects::object_string::ObjectString;
use crate::value::{is_nil, make_bool_value, make_nil_value, Value};

/// One slot of the table. Empty is `key = null, value = nil`; a tombstone
/// left behind by a delete is `key = null, value = true`.
#[derive(Clone, Copy)]
pub struct Entry {
    pub key: *mut ObjectString,
    pub value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: std::ptr::null_mut(),
            value: make_nil_value(),
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_null() && !is_nil(&self.value)
    }
}

/// Open-addressed, linear-probed hash table keyed by interned strings.
/// Pointer comparison suffices for key equality because every key has been
/// interned. Capacity is a power of two; `count` covers live entries and
/// tombstones, which both count against the load factor.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Live entry count (tombstones excluded).
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.key.is_null()).count()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Index of the entry for `key`: the occupied slot holding it, or the
    /// slot an insertion should use (the first tombstone passed, if any).
    fn find_entry(entries: &[Entry], key: *mut ObjectString) -> usize {
        let capacity = entries.len();
        let mut index = unsafe { (*key).hash } as usize & (capacity - 1);
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            if entry.key.is_null() {
                if !entry.is_tombstone() {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key == key {
                return index;
            }

            index = (index + 1) & (capacity - 1);
        }
    }

    pub fn get(&self, key: *mut ObjectString) -> Option<Value> {
        if self.count == 0 {
            return None;
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        if entry.key.is_null() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Inserts or overwrites; returns whether the key was new.
    pub fn set(&mut self, key: *mut ObjectString, value: Value) -> bool {
        if (self.count + 1) * 4 > self.capacity() * 3 {
            let capacity = grow_capacity!(self.capacity());
            self.adjust_capacity(capacity);
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_null();
        if is_new_key && !entry.is_tombstone() {
            self.count += 1;
        }

        entry.key = key;
        entry.value = value;
        is_new_key
    }

    /// Replaces the entry with a tombstone so probe sequences stay intact.
    pub fn delete(&mut self, key: *mut ObjectString) -> bool {
        if self.count == 0 {
            return false;
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_null() {
            return false;
        }

        entry.key = std::ptr::null_mut();
        entry.value = make_bool_value(true);
        true
    }

    /// Copies every live entry into `to` (used by inheritance).
    pub fn add_all(&self, to: &mut Table) {
        for entry in &self.entries {
            if !entry.key.is_null() {
                to.set(entry.key, entry.value);
            }
        }
    }

    /// Content-based lookup used only by the intern table, probing with the
    /// precomputed hash and comparing bytes on hash match.
    pub fn find_string(&self, content: &str, hash: u32) -> *mut ObjectString {
        if self.count == 0 {
            return std::ptr::null_mut();
        }

        let capacity = self.capacity();
        let mut index = hash as usize & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            if entry.key.is_null() {
                if !entry.is_tombstone() {
                    return std::ptr::null_mut();
                }
            } else {
                let key = unsafe { &*entry.key };
                if key.hash == hash && key.content == content {
                    return entry.key;
                }
            }

            index = (index + 1) & (capacity - 1);
        }
    }

    /// Drops every entry whose key string was not marked by the current
    /// collection. Runs after marking and before sweep so the intern table
    /// behaves as a weak set.
    pub fn remove_white(&mut self) {
        for index in 0..self.entries.len() {
            let key = self.entries[index].key;
            if !key.is_null() && !unsafe { (*key).object.is_marked } {
                self.delete(key);
            }
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Entry::empty(); capacity];

        // Tombstones are dropped during rehash, so the count is rebuilt.
        self.count = 0;
        for entry in &self.entries {
            if entry.key.is_null() {
                continue;
            }
            let index = Self::find_entry(&entries, entry.key);
            entries[index] = *entry;
            self.count += 1;
        }

        self.entries = entries;
    }

    /// Bytes owned by the entry array, for GC accounting.
    pub fn deep_size(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry>()
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_manager::ObjectManager;
    use crate::objects::object_string::hash_string;
    use crate::value::{as_number, make_number_value};
    use proptest::prelude::*;

    fn key(object_manager: &mut ObjectManager, content: &str) -> *mut ObjectString {
        object_manager.alloc_string(content, hash_string(content))
    }

    #[test]
    fn set_get_and_overwrite() {
        let mut object_manager = ObjectManager::new();
        let mut table = Table::new();
        let a = key(&mut object_manager, "a");

        assert!(table.set(a, make_number_value(1.0)));
        assert!(!table.set(a, make_number_value(2.0)));
        assert_eq!(as_number(&table.get(a).unwrap()), 2.0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn missing_key_is_none() {
        let mut object_manager = ObjectManager::new();
        let mut table = Table::new();
        let a = key(&mut object_manager, "a");
        let b = key(&mut object_manager, "b");

        assert!(table.get(a).is_none());
        table.set(a, make_number_value(1.0));
        assert!(table.get(b).is_none());
    }

    #[test]
    fn delete_leaves_probing_intact() {
        let mut object_manager = ObjectManager::new();
        let mut table = Table::new();
        let keys: Vec<_> = (0..16)
            .map(|i| key(&mut object_manager, &format!("key{i}")))
            .collect();

        for (i, &k) in keys.iter().enumerate() {
            table.set(k, make_number_value(i as f64));
        }
        for &k in keys.iter().step_by(2) {
            assert!(table.delete(k));
            assert!(!table.delete(k));
        }
        for (i, &k) in keys.iter().enumerate() {
            if i % 2 == 0 {
                assert!(table.get(k).is_none());
            } else {
                assert_eq!(as_number(&table.get(k).unwrap()), i as f64);
            }
        }
    }

    #[test]
    fn tombstone_slot_is_reused() {
        let mut object_manager = ObjectManager::new();
        let mut table = Table::new();
        let a = key(&mut object_manager, "a");

        table.set(a, make_number_value(1.0));
        table.delete(a);
        assert!(table.set(a, make_number_value(2.0)));
        assert_eq!(as_number(&table.get(a).unwrap()), 2.0);
    }

    #[test]
    fn growth_preserves_entries() {
        let mut object_manager = ObjectManager::new();
        let mut table = Table::new();
        let keys: Vec<_> = (0..100)
            .map(|i| key(&mut object_manager, &format!("entry{i}")))
            .collect();

        for (i, &k) in keys.iter().enumerate() {
            table.set(k, make_number_value(i as f64));
        }
        assert_eq!(table.len(), 100);
        for (i, &k) in keys.iter().enumerate() {
            assert_eq!(as_number(&table.get(k).unwrap()), i as f64);
        }
    }

    #[test]
    fn find_string_matches_by_content() {
        let mut object_manager = ObjectManager::new();
        let mut table = Table::new();
        let a = key(&mut object_manager, "alpha");
        table.set(a, make_nil_value());

        assert_eq!(table.find_string("alpha", hash_string("alpha")), a);
        assert!(table.find_string("beta", hash_string("beta")).is_null());
    }

    #[test]
    fn add_all_copies_live_entries_only() {
        let mut object_manager = ObjectManager::new();
        let mut from = Table::new();
        let mut to = Table::new();
        let a = key(&mut object_manager, "a");
        let b = key(&mut object_manager, "b");

        from.set(a, make_number_value(1.0));
        from.set(b, make_number_value(2.0));
        from.delete(b);
        from.add_all(&mut to);

        assert_eq!(to.len(), 1);
        assert_eq!(as_number(&to.get(a).unwrap()), 1.0);
        assert!(to.get(b).is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(usize, f64),
        Delete(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..24, -1000.0f64..1000.0).prop_map(|(k, v)| Op::Set(k, v)),
            (0usize..24).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_a_map(ops in proptest::collection::vec(op_strategy(), 0..200)) {
            let mut object_manager = ObjectManager::new();
            let keys: Vec<_> = (0..24)
                .map(|i| key(&mut object_manager, &format!("k{i}")))
                .collect();

            let mut table = Table::new();
            let mut model = std::collections::HashMap::new();

            for op in ops {
                match op {
                    Op::Set(k, v) => {
                        table.set(keys[k], make_number_value(v));
                        model.insert(k, v);
                    }
                    Op::Delete(k) => {
                        table.delete(keys[k]);
                        model.remove(&k);
                    }
                }
            }

            prop_assert_eq!(table.len(), model.len());
            for (i, &k) in keys.iter().enumerate() {
                match model.get(&i) {
                    Some(&v) => prop_assert_eq!(as_number(&table.get(k).unwrap()), v),
                    None => prop_assert!(table.get(k).is_none()),
                }
            }
        }
    }
}
