//! Composition root: wires the stores, the mirror, and the change bus into
//! a single mutation pipeline, and owns the sweeper and shutdown lifecycle
//! (spec §4.9, §5).
//!
//! Mutation ordering follows §2's control-flow line and §7's rollback
//! guarantee ("mutations that fail mid-application roll back in-memory
//! changes before returning"): apply to the store, write through to the
//! mirror, and only on mirror success fan the event out to the bus; a
//! mirror failure reverts the store to its pre-mutation state and surfaces
//! `ConError::Internal`. Shutdown uses a `tokio::sync::watch<bool>` trigger
//! plus an `is_shutdown()` check, which gives the same "check or await a
//! single flip" shape as a broadcast channel without adding a dependency.

use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use konsul_common::ConError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::acl::AclEngine;
use crate::bus::ChangeBus;
use crate::index::IndexAllocator;
use crate::kv::{BatchSetItem, KvEntry, KvStore};
use crate::persistence::Mirror;
use crate::ratelimit::{BucketConfig, RateLimiter};
use crate::registry::{ServiceEntry, ServiceRegistration, ServiceRegistry};

pub struct Coordinator {
    pub kv: KvStore,
    pub registry: ServiceRegistry,
    pub bus: ChangeBus,
    pub acl: AclEngine,
    pub rate_limiter: RateLimiter,
    mirror: Option<Mirror>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// `data_dir = None` means persistence is disabled (spec §6 default).
    pub fn new(
        data_dir: Option<&Path>,
        default_ttl: Duration,
        watch_buffer_size: usize,
    ) -> Result<Self, ConError> {
        let index = IndexAllocator::starting_at(1);
        let kv = KvStore::new(index.clone());
        let registry = ServiceRegistry::new(index.clone(), default_ttl);

        let mirror = match data_dir {
            Some(dir) => {
                let mirror = Mirror::open(dir)?;
                let replayed = mirror.replay()?;
                for (key, entry) in replayed.kv_entries {
                    kv.restore(key, entry);
                }
                for (reg, create_index, modify_index) in replayed.services {
                    registry.restore(reg, create_index, modify_index);
                }
                index.observe(replayed.max_index + 1);
                info!("replayed persisted state, next index {}", index.current());
                Some(mirror)
            }
            None => None,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            kv,
            registry,
            bus: ChangeBus::new(watch_buffer_size),
            acl: AclEngine::new(),
            rate_limiter: RateLimiter::new(BucketConfig::default(), Duration::from_secs(300)),
            mirror,
            shutdown_tx,
            shutdown_rx,
            sweeper: StdMutex::new(None),
        })
    }

    pub fn kv_set(&self, key: String, value: Vec<u8>, flags: u64) -> Result<KvEntry, ConError> {
        let previous = self.kv.get(&key).ok();
        let (entry, event) = self.kv.set(key.clone(), value, flags);
        if let Err(e) = self.persist_kv(&key, Some(&entry)) {
            self.rollback_kv(&key, previous);
            return Err(e);
        }
        self.bus.publish(event);
        Ok(entry)
    }

    pub fn kv_set_cas(
        &self,
        key: String,
        value: Vec<u8>,
        expected_index: u64,
        flags: u64,
    ) -> Result<KvEntry, ConError> {
        let previous = self.kv.get(&key).ok();
        let (entry, event) = self.kv.set_cas(key.clone(), value, expected_index, flags)?;
        if let Err(e) = self.persist_kv(&key, Some(&entry)) {
            self.rollback_kv(&key, previous);
            return Err(e);
        }
        self.bus.publish(event);
        Ok(entry)
    }

    pub fn kv_delete(&self, key: &str) -> Result<bool, ConError> {
        let previous = self.kv.get(key).ok();
        let Some(event) = self.kv.delete(key) else {
            return Ok(false);
        };
        if let Err(e) = self.persist_kv(key, None) {
            self.rollback_kv(key, previous);
            return Err(e);
        }
        self.bus.publish(event);
        Ok(true)
    }

    pub fn kv_delete_cas(&self, key: &str, expected_index: u64) -> Result<(), ConError> {
        let previous = self.kv.get(key).ok();
        let event = self.kv.delete_cas(key, expected_index)?;
        if let Err(e) = self.persist_kv(key, None) {
            self.rollback_kv(key, previous);
            return Err(e);
        }
        self.bus.publish(event);
        Ok(())
    }

    pub fn kv_batch_set(&self, items: Vec<BatchSetItem>) -> Result<usize, ConError> {
        let previous: Vec<(String, Option<KvEntry>)> = items
            .iter()
            .map(|item| (item.key.clone(), self.kv.get(&item.key).ok()))
            .collect();
        let events = self.kv.batch_set(items)?;
        for event in &events {
            if let Err(e) = self.persist_kv_event(event) {
                warn!("mirror write failed mid-batch, rolling back in-memory state: {e}");
                for (key, prev) in previous {
                    self.rollback_kv(&key, prev);
                }
                return Err(e);
            }
        }
        let count = events.len();
        for event in events {
            self.bus.publish(event);
        }
        Ok(count)
    }

    pub fn kv_batch_delete(
        &self,
        keys: Vec<String>,
        cas: Option<Vec<u64>>,
    ) -> Result<usize, ConError> {
        let previous: Vec<(String, Option<KvEntry>)> = keys
            .iter()
            .map(|key| (key.clone(), self.kv.get(key).ok()))
            .collect();
        let events = self.kv.batch_delete(keys, cas)?;
        for event in &events {
            if let Err(e) = self.persist_kv_event(event) {
                warn!("mirror write failed mid-batch, rolling back in-memory state: {e}");
                for (key, prev) in previous {
                    self.rollback_kv(&key, prev);
                }
                return Err(e);
            }
        }
        let count = events.len();
        for event in events {
            self.bus.publish(event);
        }
        Ok(count)
    }

    pub fn register_service(
        &self,
        reg: ServiceRegistration,
        cas: Option<u64>,
    ) -> Result<ServiceEntry, ConError> {
        let previous = self.registry.get(&reg.name).ok();
        let name = reg.name.clone();
        let (entry, event) = self.registry.register(reg, cas)?;
        if let Err(e) = self.persist_service(&entry) {
            self.rollback_service(&name, previous);
            return Err(e);
        }
        self.bus.publish(event);
        Ok(entry)
    }

    pub fn heartbeat(&self, name: &str) -> Result<(), ConError> {
        self.registry.heartbeat(name)
    }

    pub fn deregister_service(&self, name: &str) -> Result<bool, ConError> {
        let previous = self.registry.get(name).ok();
        let Some(event) = self.registry.deregister(name) else {
            return Ok(false);
        };
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.delete_service(name) {
                self.rollback_service(name, previous);
                return Err(e);
            }
        }
        self.bus.publish(event);
        Ok(true)
    }

    pub fn deregister_service_cas(&self, name: &str, expected_index: u64) -> Result<(), ConError> {
        let previous = self.registry.get(name).ok();
        let event = self.registry.deregister_cas(name, expected_index)?;
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.delete_service(name) {
                self.rollback_service(name, previous);
                return Err(e);
            }
        }
        self.bus.publish(event);
        Ok(())
    }

    fn persist_kv(&self, key: &str, entry: Option<&KvEntry>) -> Result<(), ConError> {
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        match entry {
            Some(entry) => mirror.put_kv(key, entry),
            None => mirror.delete_kv(key),
        }
    }

    fn persist_kv_event(&self, event: &crate::event::ChangeEvent) -> Result<(), ConError> {
        use crate::event::ChangeEvent;
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        match event {
            ChangeEvent::Set { key, index, .. } => {
                let entry = self.kv.get(key).unwrap_or(KvEntry {
                    value: Vec::new(),
                    flags: 0,
                    create_index: *index,
                    modify_index: *index,
                });
                mirror.put_kv(key, &entry)
            }
            ChangeEvent::Delete { key, .. } => mirror.delete_kv(key),
        }
    }

    fn persist_service(&self, entry: &ServiceEntry) -> Result<(), ConError> {
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        let registration = ServiceRegistration {
            name: entry.name.clone(),
            address: entry.address.clone(),
            port: entry.port,
            tags: entry.tags.clone(),
            meta: entry.meta.clone(),
        };
        mirror.put_service(&registration, entry.create_index, entry.modify_index)
    }

    fn rollback_kv(&self, key: &str, previous: Option<KvEntry>) {
        match previous {
            Some(entry) => self.kv.restore(key.to_string(), entry),
            None => {
                self.kv.delete(key);
            }
        }
    }

    fn rollback_service(&self, name: &str, previous: Option<ServiceEntry>) {
        match previous {
            Some(entry) => {
                let registration = ServiceRegistration {
                    name: entry.name.clone(),
                    address: entry.address,
                    port: entry.port,
                    tags: entry.tags,
                    meta: entry.meta,
                };
                self.registry
                    .restore(registration, entry.create_index, entry.modify_index);
            }
            None => {
                self.registry.deregister(name);
            }
        }
    }

    /// Starts the TTL sweeper, running at `interval` until shutdown.
    pub fn start_sweeper(self: &std::sync::Arc<Self>, interval: Duration) {
        let coordinator = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let events = coordinator.registry.sweep_expired(Instant::now());
                        for event in events {
                            let name = event.key().to_string();
                            if let Some(mirror) = &coordinator.mirror {
                                if let Err(e) = mirror.delete_service(&name) {
                                    error!("sweeper mirror write failed for '{name}': {e}");
                                    continue;
                                }
                            }
                            coordinator.bus.publish(event);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.sweeper.lock().unwrap() = Some(handle);
    }

    /// Stops accepting new mutation-admitting work is the caller's
    /// responsibility (HTTP/DNS listeners); this flips the shared signal,
    /// cancels the sweeper, and waits `grace` before closing the mirror.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            let _ = tokio::time::timeout(grace, handle).await;
        }
        tokio::time::sleep(grace).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    fn registration(name: &str) -> ServiceRegistration {
        ServiceRegistration {
            name: name.to_string(),
            address: "10.0.0.1".to_string(),
            port: 80,
            tags: HashSet::new(),
            meta: HashMap::new(),
        }
    }

    #[test]
    fn kv_set_then_get_without_persistence() {
        let coordinator = Coordinator::new(None, Duration::from_secs(30), 10).unwrap();
        coordinator
            .kv_set("a".to_string(), b"1".to_vec(), 0)
            .unwrap();
        assert_eq!(coordinator.kv.get("a").unwrap().value, b"1");
    }

    #[test]
    fn persists_and_replays_kv_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let coordinator = Coordinator::new(Some(dir.path()), Duration::from_secs(30), 10).unwrap();
            coordinator
                .kv_set("a".to_string(), b"1".to_vec(), 0)
                .unwrap();
        }
        let coordinator = Coordinator::new(Some(dir.path()), Duration::from_secs(30), 10).unwrap();
        assert_eq!(coordinator.kv.get("a").unwrap().value, b"1");
    }

    #[test]
    fn register_then_deregister_round_trips_through_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(Some(dir.path()), Duration::from_secs(30), 10).unwrap();
        coordinator
            .register_service(registration("api"), None)
            .unwrap();
        assert!(coordinator.registry.get("api").is_ok());
        assert!(coordinator.deregister_service("api").unwrap());
        assert!(coordinator.registry.get("api").is_err());
    }

    #[test]
    fn kv_batch_delete_removes_all_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(Some(dir.path()), Duration::from_secs(30), 10).unwrap();
        coordinator.kv_set("a".to_string(), b"1".to_vec(), 0).unwrap();
        coordinator.kv_set("b".to_string(), b"1".to_vec(), 0).unwrap();

        let removed = coordinator
            .kv_batch_delete(vec!["a".to_string(), "b".to_string()], None)
            .unwrap();
        assert_eq!(removed, 2);
        assert!(coordinator.kv.get("a").is_err());
        assert!(coordinator.kv.get("b").is_err());

        drop(coordinator);
        let coordinator = Coordinator::new(Some(dir.path()), Duration::from_secs(30), 10).unwrap();
        assert!(coordinator.kv.get("a").is_err());
    }

    #[tokio::test]
    async fn sweeper_expires_and_publishes_deletes() {
        let coordinator = Arc::new(
            Coordinator::new(None, Duration::from_millis(20), 10).unwrap(),
        );
        coordinator
            .register_service(registration("api"), None)
            .unwrap();
        let (_id, mut rx) = coordinator.bus.subscribe_unrestricted("**");
        coordinator.start_sweeper(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key(), "api");
        coordinator.shutdown(Duration::from_millis(10)).await;
    }
}
