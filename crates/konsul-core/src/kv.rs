//! Versioned key/value store with CAS (spec §4.2).
//!
//! `DashMap` plus a shared atomic index backs every entry, with a two-phase
//! validate-then-apply shape for batches. No RocksDB handle lives in the
//! store itself — persistence is the coordinator's job (see `persistence`
//! and `coordinator`).
//!
//! CAS checks and their corresponding mutation happen under a single
//! `DashMap` entry guard (the shard lock), never a separate get-then-set,
//! so concurrent `set_cas` calls on the same key cannot both observe a
//! stale `modify_index` and both "succeed".

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use konsul_common::ConError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::event::ChangeEvent;
use crate::index::IndexAllocator;

/// Persisted and in-memory shape are the same; the mirror stores this
/// directly (see `persistence::Mirror`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub flags: u64,
    pub create_index: u64,
    pub modify_index: u64,
}

pub struct KvStore {
    map: DashMap<String, KvEntry>,
    index: IndexAllocator,
    /// Single-key ops hold this for read (concurrent with each other);
    /// batch ops hold it for write, giving the "writer lock held for the
    /// duration of a mutation" discipline of §5 without serializing
    /// unrelated single-key reads/writes behind every batch.
    store_lock: RwLock<()>,
}

pub struct BatchSetItem {
    pub key: String,
    pub value: Vec<u8>,
    pub flags: u64,
    pub cas: Option<u64>,
}

impl KvStore {
    pub fn new(index: IndexAllocator) -> Self {
        Self {
            map: DashMap::new(),
            index,
            store_lock: RwLock::new(()),
        }
    }

    /// Restore an entry during mirror replay without emitting an event or
    /// allocating a new index (the index is already the persisted one).
    pub fn restore(&self, key: String, entry: KvEntry) {
        self.index.observe(entry.modify_index + 1);
        self.map.insert(key, entry);
    }

    pub fn get(&self, key: &str) -> Result<KvEntry, ConError> {
        self.map
            .get(key)
            .map(|e| e.clone())
            .ok_or_else(|| ConError::not_found(format!("key '{key}' not found")))
    }

    pub fn set(&self, key: impl Into<String>, value: Vec<u8>, flags: u64) -> (KvEntry, ChangeEvent) {
        let _guard = self.store_lock.read();
        let key = key.into();
        let (entry, event) = self.apply_set(&key, value, flags);
        (entry, event)
    }

    pub fn set_cas(
        &self,
        key: impl Into<String>,
        value: Vec<u8>,
        expected_index: u64,
        flags: u64,
    ) -> Result<(KvEntry, ChangeEvent), ConError> {
        let _guard = self.store_lock.read();
        let key = key.into();
        match self.map.entry(key.clone()) {
            Entry::Occupied(mut occ) => {
                let current = occ.get().modify_index;
                if current != expected_index {
                    return Err(ConError::cas_conflict(key, expected_index, current));
                }
                let index = self.index.next();
                occ.get_mut().value = value;
                occ.get_mut().flags = flags;
                occ.get_mut().modify_index = index;
                let entry = occ.get().clone();
                let event = ChangeEvent::set(&key, encode_value(&entry.value), index);
                Ok((entry, event))
            }
            Entry::Vacant(_) if expected_index != 0 => {
                Err(ConError::not_found(format!("key '{key}' not found")))
            }
            Entry::Vacant(vac) => {
                let index = self.index.next();
                let entry = KvEntry {
                    value,
                    flags,
                    create_index: index,
                    modify_index: index,
                };
                vac.insert(entry.clone());
                let event = ChangeEvent::set(&key, encode_value(&entry.value), index);
                Ok((entry, event))
            }
        }
    }

    /// Applies an unconditional set under the caller's already-held
    /// `store_lock` read guard, allocating exactly one index.
    fn apply_set(&self, key: &str, value: Vec<u8>, flags: u64) -> (KvEntry, ChangeEvent) {
        let index = self.index.next();
        let entry = match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occ) => {
                occ.get_mut().value = value;
                occ.get_mut().flags = flags;
                occ.get_mut().modify_index = index;
                occ.get().clone()
            }
            Entry::Vacant(vac) => {
                let entry = KvEntry {
                    value,
                    flags,
                    create_index: index,
                    modify_index: index,
                };
                vac.insert(entry.clone());
                entry
            }
        };
        let event = ChangeEvent::set(key, encode_value(&entry.value), index);
        (entry, event)
    }

    /// Returns `None` if the key was already absent (no-op, no event).
    pub fn delete(&self, key: &str) -> Option<ChangeEvent> {
        let _guard = self.store_lock.read();
        let (_, removed) = self.map.remove(key)?;
        let index = self.index.next();
        Some(ChangeEvent::delete(
            key,
            Some(encode_value(&removed.value)),
            index,
        ))
    }

    pub fn delete_cas(&self, key: &str, expected_index: u64) -> Result<ChangeEvent, ConError> {
        let _guard = self.store_lock.read();
        match self.map.entry(key.to_string()) {
            Entry::Vacant(_) => Err(ConError::not_found(format!("key '{key}' not found"))),
            Entry::Occupied(occ) => {
                let current = occ.get().modify_index;
                if current != expected_index {
                    return Err(ConError::cas_conflict(key, expected_index, current));
                }
                let removed = occ.remove();
                let index = self.index.next();
                Ok(ChangeEvent::delete(
                    key,
                    Some(encode_value(&removed.value)),
                    index,
                ))
            }
        }
    }

    /// Lexicographically sorted keys whose whole-key matches `prefix`.
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .map
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        keys
    }

    /// All-or-nothing: validate every CAS predicate first, then apply all,
    /// emitting one event per sub-op in application order (DESIGN.md §Open
    /// questions: one-per-sub-op, never an aggregate event).
    pub fn batch_set(&self, items: Vec<BatchSetItem>) -> Result<Vec<ChangeEvent>, ConError> {
        let _guard = self.store_lock.write();
        for item in &items {
            if let Some(expected) = item.cas {
                match self.map.get(&item.key) {
                    None if expected != 0 => {
                        return Err(ConError::not_found(format!(
                            "key '{}' not found",
                            item.key
                        )));
                    }
                    Some(existing) if existing.modify_index != expected => {
                        return Err(ConError::cas_conflict(
                            item.key.clone(),
                            expected,
                            existing.modify_index,
                        ));
                    }
                    _ => {}
                }
            }
        }
        let mut events = Vec::with_capacity(items.len());
        for item in items {
            let (_, event) = self.apply_set(&item.key, item.value, item.flags);
            events.push(event);
        }
        Ok(events)
    }

    pub fn batch_delete(
        &self,
        keys: Vec<String>,
        cas: Option<Vec<u64>>,
    ) -> Result<Vec<ChangeEvent>, ConError> {
        let _guard = self.store_lock.write();
        if let Some(expected) = &cas {
            if expected.len() != keys.len() {
                return Err(ConError::invalid_argument(
                    "cas list length must match keys length",
                ));
            }
            for (key, expected) in keys.iter().zip(expected.iter()) {
                match self.map.get(key) {
                    None => return Err(ConError::not_found(format!("key '{key}' not found"))),
                    Some(existing) if existing.modify_index != *expected => {
                        return Err(ConError::cas_conflict(
                            key.clone(),
                            *expected,
                            existing.modify_index,
                        ));
                    }
                    Some(_) => {}
                }
            }
        }
        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, removed)) = self.map.remove(&key) {
                let index = self.index.next();
                events.push(ChangeEvent::delete(
                    &key,
                    Some(encode_value(&removed.value)),
                    index,
                ));
            }
        }
        Ok(events)
    }
}

fn encode_value(value: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> KvStore {
        KvStore::new(IndexAllocator::starting_at(1))
    }

    #[test]
    fn set_then_get_round_trips() {
        let s = store();
        s.set("a", b"1".to_vec(), 0);
        assert_eq!(s.get("a").unwrap().value, b"1");
    }

    #[test]
    fn set_preserves_create_index_on_update() {
        let s = store();
        let (first, _) = s.set("a", b"1".to_vec(), 0);
        let (second, _) = s.set("a", b"2".to_vec(), 0);
        assert_eq!(first.create_index, second.create_index);
        assert!(second.modify_index > first.modify_index);
    }

    #[test]
    fn get_missing_is_not_found() {
        let s = store();
        assert!(matches!(s.get("nope"), Err(ConError::NotFound(_))));
    }

    #[test]
    fn set_cas_create_only_requires_zero_expected() {
        let s = store();
        assert!(s.set_cas("a", b"1".to_vec(), 0, 0).is_ok());
        assert!(matches!(
            s.set_cas("a", b"2".to_vec(), 0, 0),
            Err(ConError::CasConflict { .. })
        ));
    }

    #[test]
    fn set_cas_on_absent_key_with_nonzero_expected_is_not_found() {
        let s = store();
        assert!(matches!(
            s.set_cas("a", b"1".to_vec(), 5, 0),
            Err(ConError::NotFound(_))
        ));
    }

    #[test]
    fn set_cas_matching_expected_succeeds_and_bumps_index() {
        let s = store();
        let (entry, _) = s.set("a", b"1".to_vec(), 0);
        let (updated, _) = s
            .set_cas("a", b"2".to_vec(), entry.modify_index, 0)
            .unwrap();
        assert_eq!(updated.value, b"2");
        assert!(updated.modify_index > entry.modify_index);
    }

    #[test]
    fn delete_emits_event_with_old_value_and_is_noop_if_absent() {
        let s = store();
        s.set("a", b"1".to_vec(), 0);
        let event = s.delete("a").unwrap();
        match event {
            ChangeEvent::Delete { old_value, .. } => assert!(old_value.is_some()),
            _ => panic!("expected delete event"),
        }
        assert!(s.delete("a").is_none());
    }

    #[test]
    fn delete_then_recreate_gets_fresh_create_index() {
        let s = store();
        let (first, _) = s.set("a", b"1".to_vec(), 0);
        s.delete("a");
        let (second, _) = s.set("a", b"2".to_vec(), 0);
        assert_ne!(first.create_index, second.create_index);
        assert!(second.create_index > first.create_index);
    }

    #[test]
    fn list_is_lexicographically_sorted_and_prefix_scoped() {
        let s = store();
        s.set("b", b"1".to_vec(), 0);
        s.set("a", b"1".to_vec(), 0);
        s.set("ab", b"1".to_vec(), 0);
        s.set("other", b"1".to_vec(), 0);
        assert_eq!(s.list("a"), vec!["a".to_string(), "ab".to_string()]);
    }

    #[test]
    fn batch_set_is_all_or_nothing_on_cas_failure() {
        let s = store();
        let (ok_entry, _) = s.set("ok", b"0".to_vec(), 0);
        let items = vec![
            BatchSetItem {
                key: "ok".to_string(),
                value: b"1".to_vec(),
                flags: 0,
                cas: Some(ok_entry.modify_index),
            },
            BatchSetItem {
                key: "new".to_string(),
                value: b"1".to_vec(),
                flags: 0,
                cas: Some(99), // wrong: key absent with nonzero expected
            },
        ];
        let result = s.batch_set(items);
        assert!(result.is_err());
        // Neither sub-op should have applied.
        assert_eq!(s.get("ok").unwrap().value, b"0");
        assert!(s.get("new").is_err());
    }

    #[test]
    fn batch_set_emits_one_event_per_item_in_order() {
        let s = store();
        let items = vec![
            BatchSetItem {
                key: "x".to_string(),
                value: b"1".to_vec(),
                flags: 0,
                cas: None,
            },
            BatchSetItem {
                key: "y".to_string(),
                value: b"1".to_vec(),
                flags: 0,
                cas: None,
            },
        ];
        let events = s.batch_set(items).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key(), "x");
        assert_eq!(events[1].key(), "y");
        assert!(events[0].index() < events[1].index());
    }

    #[test]
    fn concurrent_cas_exactly_one_winner() {
        use std::sync::Arc;
        use std::thread;

        let s = Arc::new(store());
        s.set("x", b"seed".to_vec(), 0);
        let base_index = s.get("x").unwrap().modify_index;

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let s = s.clone();
                thread::spawn(move || {
                    s.set_cas("x", format!("v_{i}").into_bytes(), base_index, 0)
                        .is_ok()
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }
}
