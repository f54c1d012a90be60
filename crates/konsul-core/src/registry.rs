//! Service registry with TTL liveness and secondary indices (spec §4.3).
//!
//! `name` is treated as a single-identity primary key (DESIGN.md §Open
//! questions): a second `register` under the same name replaces the prior
//! entry, preserving `create_index` exactly like `KvStore::set`. The
//! sweeper walks live entries on a short fixed interval rather than
//! scheduling a per-entry timer, the same shape a liveness-check loop over
//! a shared registry typically takes.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use konsul_common::ConError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::event::ChangeEvent;
use crate::index::IndexAllocator;

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceEntry {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: HashSet<String>,
    pub meta: HashMap<String, String>,
    pub create_index: u64,
    pub modify_index: u64,
    pub(crate) expires_at: Instant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: HashSet<String>,
    pub meta: HashMap<String, String>,
}

pub struct ServiceRegistry {
    map: DashMap<String, ServiceEntry>,
    tag_index: DashMap<String, HashSet<String>>,
    meta_index: DashMap<String, HashSet<String>>,
    index: IndexAllocator,
    default_ttl: Duration,
    store_lock: RwLock<()>,
}

impl ServiceRegistry {
    pub fn new(index: IndexAllocator, default_ttl: Duration) -> Self {
        Self {
            map: DashMap::new(),
            tag_index: DashMap::new(),
            meta_index: DashMap::new(),
            index,
            default_ttl,
            store_lock: RwLock::new(()),
        }
    }

    /// Restore a registration during mirror replay. Per §4.9, restart
    /// extends liveness by one full TTL rather than resuming a stale deadline.
    pub fn restore(&self, reg: ServiceRegistration, create_index: u64, modify_index: u64) {
        self.index.observe(modify_index + 1);
        let entry = ServiceEntry {
            name: reg.name.clone(),
            address: reg.address,
            port: reg.port,
            tags: reg.tags,
            meta: reg.meta,
            create_index,
            modify_index,
            expires_at: Instant::now() + self.default_ttl,
        };
        self.index_secondary(&entry);
        self.map.insert(reg.name, entry);
    }

    pub fn register(
        &self,
        reg: ServiceRegistration,
        cas: Option<u64>,
    ) -> Result<(ServiceEntry, ChangeEvent), ConError> {
        let _guard = self.store_lock.read();
        let name = reg.name.clone();

        let entry = match self.map.entry(name.clone()) {
            Entry::Occupied(mut occ) => {
                if let Some(expected) = cas {
                    let current = occ.get().modify_index;
                    if current != expected {
                        return Err(ConError::cas_conflict(name, expected, current));
                    }
                }
                self.unindex_secondary(occ.get());
                let create_index = occ.get().create_index;
                let index = self.index.next();
                let entry = ServiceEntry {
                    name: reg.name,
                    address: reg.address,
                    port: reg.port,
                    tags: reg.tags,
                    meta: reg.meta,
                    create_index,
                    modify_index: index,
                    expires_at: Instant::now() + self.default_ttl,
                };
                self.index_secondary(&entry);
                occ.insert(entry.clone());
                entry
            }
            Entry::Vacant(vac) => {
                if let Some(expected) = cas {
                    if expected != 0 {
                        return Err(ConError::not_found(format!("service '{name}' not found")));
                    }
                }
                let index = self.index.next();
                let entry = ServiceEntry {
                    name: reg.name,
                    address: reg.address,
                    port: reg.port,
                    tags: reg.tags,
                    meta: reg.meta,
                    create_index: index,
                    modify_index: index,
                    expires_at: Instant::now() + self.default_ttl,
                };
                self.index_secondary(&entry);
                vac.insert(entry.clone());
                entry
            }
        };

        let event = ChangeEvent::set(&entry.name, service_summary(&entry), entry.modify_index);
        Ok((entry, event))
    }

    /// Extends liveness. Never bumps `modify_index`, never emits an event
    /// (spec §4.3/§8 heartbeat transparency invariant).
    pub fn heartbeat(&self, name: &str) -> Result<(), ConError> {
        let _guard = self.store_lock.read();
        let mut entry = self
            .map
            .get_mut(name)
            .ok_or_else(|| ConError::not_found(format!("service '{name}' not found")))?;
        entry.expires_at = Instant::now() + self.default_ttl;
        Ok(())
    }

    pub fn deregister(&self, name: &str) -> Option<ChangeEvent> {
        let _guard = self.store_lock.read();
        let (_, removed) = self.map.remove(name)?;
        self.unindex_secondary(&removed);
        let index = self.index.next();
        Some(ChangeEvent::delete(
            name,
            Some(service_summary(&removed)),
            index,
        ))
    }

    pub fn deregister_cas(&self, name: &str, expected_index: u64) -> Result<ChangeEvent, ConError> {
        let _guard = self.store_lock.read();
        match self.map.entry(name.to_string()) {
            Entry::Vacant(_) => Err(ConError::not_found(format!("service '{name}' not found"))),
            Entry::Occupied(occ) => {
                let current = occ.get().modify_index;
                if current != expected_index {
                    return Err(ConError::cas_conflict(name, expected_index, current));
                }
                let removed = occ.remove();
                self.unindex_secondary(&removed);
                let index = self.index.next();
                Ok(ChangeEvent::delete(name, Some(service_summary(&removed)), index))
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<ServiceEntry, ConError> {
        self.map
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| ConError::not_found(format!("service '{name}' not found")))
    }

    pub fn list(&self) -> Vec<ServiceEntry> {
        let mut all: Vec<ServiceEntry> = self.map.iter().map(|e| e.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn by_tag(&self, tag: &str) -> Vec<ServiceEntry> {
        let names = self
            .tag_index
            .get(tag)
            .map(|s| s.clone())
            .unwrap_or_default();
        self.names_to_entries(names)
    }

    pub fn by_meta(&self, key: &str, value: &str) -> Vec<ServiceEntry> {
        let meta_key = format!("{key}={value}");
        let names = self
            .meta_index
            .get(&meta_key)
            .map(|s| s.clone())
            .unwrap_or_default();
        self.names_to_entries(names)
    }

    /// Returns every live service (`expires_at > now`); used by the DNS
    /// resolver, which must never answer with expired entries (§4.8/§8).
    pub fn list_live(&self, now: Instant) -> Vec<ServiceEntry> {
        let mut all: Vec<ServiceEntry> = self
            .map
            .iter()
            .filter(|e| e.expires_at > now)
            .map(|e| e.clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Removes every entry whose TTL has elapsed, in stable (by-name) order,
    /// emitting one `delete` event per removal. Driven by the coordinator's
    /// periodic sweeper task.
    pub fn sweep_expired(&self, now: Instant) -> Vec<ChangeEvent> {
        let _guard = self.store_lock.write();
        let mut expired: Vec<String> = self
            .map
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.name.clone())
            .collect();
        expired.sort();

        let mut events = Vec::with_capacity(expired.len());
        for name in expired {
            if let Some((_, removed)) = self.map.remove(&name) {
                self.unindex_secondary(&removed);
                let index = self.index.next();
                events.push(ChangeEvent::delete(
                    &name,
                    Some(service_summary(&removed)),
                    index,
                ));
            }
        }
        events
    }

    fn names_to_entries(&self, names: HashSet<String>) -> Vec<ServiceEntry> {
        let mut out: Vec<ServiceEntry> = names
            .into_iter()
            .filter_map(|n| self.map.get(&n).map(|e| e.clone()))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn index_secondary(&self, entry: &ServiceEntry) {
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(entry.name.clone());
        }
        for (k, v) in &entry.meta {
            self.meta_index
                .entry(format!("{k}={v}"))
                .or_default()
                .insert(entry.name.clone());
        }
    }

    fn unindex_secondary(&self, entry: &ServiceEntry) {
        for tag in &entry.tags {
            if let Some(mut set) = self.tag_index.get_mut(tag) {
                set.remove(&entry.name);
            }
        }
        for (k, v) in &entry.meta {
            let meta_key = format!("{k}={v}");
            if let Some(mut set) = self.meta_index.get_mut(&meta_key) {
                set.remove(&entry.name);
            }
        }
    }
}

fn service_summary(entry: &ServiceEntry) -> String {
    serde_json::json!({
        "name": entry.name,
        "address": entry.address,
        "port": entry.port,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(name: &str, address: &str, port: u16) -> ServiceRegistration {
        ServiceRegistration {
            name: name.to_string(),
            address: address.to_string(),
            port,
            tags: HashSet::new(),
            meta: HashMap::new(),
        }
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(IndexAllocator::starting_at(1), Duration::from_secs(30))
    }

    #[test]
    fn register_then_get_round_trips() {
        let r = registry();
        r.register(registration("api", "10.0.0.1", 80), None).unwrap();
        let entry = r.get("api").unwrap();
        assert_eq!(entry.address, "10.0.0.1");
        assert_eq!(entry.port, 80);
    }

    #[test]
    fn duplicate_register_replaces_and_preserves_create_index() {
        let r = registry();
        let (first, _) = r.register(registration("api", "10.0.0.1", 80), None).unwrap();
        let (second, _) = r.register(registration("api", "10.0.0.2", 81), None).unwrap();
        assert_eq!(first.create_index, second.create_index);
        assert_eq!(second.address, "10.0.0.2");
    }

    #[test]
    fn heartbeat_does_not_bump_modify_index_or_emit_event() {
        let r = registry();
        let (entry, _) = r.register(registration("api", "10.0.0.1", 80), None).unwrap();
        let m = entry.modify_index;
        for _ in 0..10 {
            r.heartbeat("api").unwrap();
        }
        assert_eq!(r.get("api").unwrap().modify_index, m);
    }

    #[test]
    fn heartbeat_on_missing_service_is_not_found() {
        let r = registry();
        assert!(matches!(r.heartbeat("nope"), Err(ConError::NotFound(_))));
    }

    #[test]
    fn deregister_removes_from_secondary_indices() {
        let r = registry();
        let mut reg = registration("api", "10.0.0.1", 80);
        reg.tags.insert("web".to_string());
        r.register(reg, None).unwrap();
        assert_eq!(r.by_tag("web").len(), 1);
        r.deregister("api");
        assert_eq!(r.by_tag("web").len(), 0);
    }

    #[test]
    fn by_tag_and_by_meta_filter_correctly() {
        let r = registry();
        let mut a = registration("a", "1.1.1.1", 1);
        a.tags.insert("web".to_string());
        a.meta.insert("env".to_string(), "prod".to_string());
        let mut b = registration("b", "2.2.2.2", 2);
        b.tags.insert("db".to_string());
        b.meta.insert("env".to_string(), "staging".to_string());
        r.register(a, None).unwrap();
        r.register(b, None).unwrap();

        assert_eq!(r.by_tag("web").len(), 1);
        assert_eq!(r.by_tag("web")[0].name, "a");
        assert_eq!(r.by_meta("env", "staging").len(), 1);
        assert_eq!(r.by_meta("env", "staging")[0].name, "b");
    }

    #[test]
    fn sweep_expired_removes_stale_entries_in_name_order_and_emits_deletes() {
        let r = ServiceRegistry::new(IndexAllocator::starting_at(1), Duration::from_millis(1));
        r.register(registration("b", "1.1.1.1", 1), None).unwrap();
        r.register(registration("a", "2.2.2.2", 2), None).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let events = r.sweep_expired(Instant::now());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key(), "a");
        assert_eq!(events[1].key(), "b");
        assert!(r.get("a").is_err());
        assert!(r.get("b").is_err());
    }

    #[test]
    fn list_live_excludes_expired_entries() {
        let r = ServiceRegistry::new(IndexAllocator::starting_at(1), Duration::from_millis(1));
        r.register(registration("api", "1.1.1.1", 1), None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(r.list_live(Instant::now()).is_empty());
        assert!(r.get("api").is_ok()); // sweeper hasn't run yet, plain get still sees it
    }

    #[test]
    fn cas_register_create_only_requires_zero_expected() {
        let r = registry();
        assert!(
            r.register(registration("api", "1.1.1.1", 1), Some(0))
                .is_ok()
        );
        assert!(matches!(
            r.register(registration("api", "1.1.1.1", 1), Some(0)),
            Err(ConError::CasConflict { .. })
        ));
    }

    #[test]
    fn deregister_cas_matching_expected_removes_and_unindexes() {
        let r = registry();
        let mut reg = registration("api", "1.1.1.1", 1);
        reg.tags.insert("web".to_string());
        let (entry, _) = r.register(reg, None).unwrap();

        let event = r.deregister_cas("api", entry.modify_index).unwrap();
        assert_eq!(event.key(), "api");
        assert!(r.get("api").is_err());
        assert_eq!(r.by_tag("web").len(), 0);
    }

    #[test]
    fn deregister_cas_stale_expected_is_conflict_and_leaves_entry() {
        let r = registry();
        let (entry, _) = r.register(registration("api", "1.1.1.1", 1), None).unwrap();
        assert!(matches!(
            r.deregister_cas("api", entry.modify_index + 1),
            Err(ConError::CasConflict { .. })
        ));
        assert!(r.get("api").is_ok());
    }

    #[test]
    fn deregister_cas_missing_service_is_not_found() {
        let r = registry();
        assert!(matches!(
            r.deregister_cas("nope", 0),
            Err(ConError::NotFound(_))
        ));
    }
}
