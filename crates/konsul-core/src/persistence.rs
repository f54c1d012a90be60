//! RocksDB-backed write-through mirror with boot-time replay (spec §4.9).
//!
//! Boot-time replay walks each column family with
//! `iterator_cf(IteratorMode::Start)`, and every mutation writes through via
//! a `put`/`delete` pair before the in-memory store is updated to match.
//! Two column families, `kv` and `services`, live in one DB per Konsul
//! instance. Persistence is never optional at the type level: the
//! coordinator decides whether to construct a `Mirror` at all (the
//! "persistence disabled by default" setting lives in configuration, not
//! inside this type).

use std::path::Path;
use std::sync::Arc;

use konsul_common::ConError;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};

use crate::kv::KvEntry;
use crate::registry::ServiceRegistration;

const CF_KV: &str = "kv";
const CF_SERVICES: &str = "services";

/// Per-service persisted record; `expires_at` is deliberately not part of
/// this shape (spec §4.9: "restart extends liveness by one TTL" — the
/// deadline is recomputed at replay time, never persisted).
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PersistedService {
    registration: ServiceRegistration,
    create_index: u64,
    modify_index: u64,
}

pub struct Mirror {
    db: Arc<DB>,
}

/// Everything loaded back from disk at boot, ready to feed into
/// `KvStore::restore` / `ServiceRegistry::restore` / `IndexAllocator::observe`.
pub struct ReplayedState {
    pub kv_entries: Vec<(String, KvEntry)>,
    pub services: Vec<(ServiceRegistration, u64, u64)>,
    pub max_index: u64,
}

impl Mirror {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_KV, Options::default()),
            ColumnFamilyDescriptor::new(CF_SERVICES, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)
            .map_err(|e| ConError::internal(format!("opening persistence mirror: {e}")))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Reads every entry back, tracking the highest index seen across both
    /// column families so the caller can seed the global counter.
    pub fn replay(&self) -> Result<ReplayedState, ConError> {
        let mut kv_entries = Vec::new();
        let mut max_index = 0u64;

        let kv_cf = self.cf(CF_KV)?;
        for item in self.db.iterator_cf(kv_cf, IteratorMode::Start) {
            let (key_bytes, value_bytes) =
                item.map_err(|e| ConError::internal(format!("replaying kv: {e}")))?;
            let key = String::from_utf8_lossy(&key_bytes).into_owned();
            let entry: KvEntry = serde_json::from_slice(&value_bytes)
                .map_err(|e| ConError::internal(format!("decoding kv entry '{key}': {e}")))?;
            max_index = max_index.max(entry.modify_index);
            kv_entries.push((key, entry));
        }

        let mut services = Vec::new();
        let services_cf = self.cf(CF_SERVICES)?;
        for item in self.db.iterator_cf(services_cf, IteratorMode::Start) {
            let (_key, value_bytes) =
                item.map_err(|e| ConError::internal(format!("replaying services: {e}")))?;
            let persisted: PersistedService = serde_json::from_slice(&value_bytes)
                .map_err(|e| ConError::internal(format!("decoding service entry: {e}")))?;
            max_index = max_index.max(persisted.modify_index);
            services.push((
                persisted.registration,
                persisted.create_index,
                persisted.modify_index,
            ));
        }

        Ok(ReplayedState {
            kv_entries,
            services,
            max_index,
        })
    }

    pub fn put_kv(&self, key: &str, entry: &KvEntry) -> Result<(), ConError> {
        let cf = self.cf(CF_KV)?;
        let bytes = serde_json::to_vec(entry)
            .map_err(|e| ConError::internal(format!("encoding kv entry '{key}': {e}")))?;
        self.db
            .put_cf(cf, key.as_bytes(), bytes)
            .map_err(|e| ConError::internal(format!("persisting kv entry '{key}': {e}")))
    }

    pub fn delete_kv(&self, key: &str) -> Result<(), ConError> {
        let cf = self.cf(CF_KV)?;
        self.db
            .delete_cf(cf, key.as_bytes())
            .map_err(|e| ConError::internal(format!("deleting kv entry '{key}': {e}")))
    }

    pub fn put_service(
        &self,
        registration: &ServiceRegistration,
        create_index: u64,
        modify_index: u64,
    ) -> Result<(), ConError> {
        let cf = self.cf(CF_SERVICES)?;
        let persisted = PersistedService {
            registration: registration.clone(),
            create_index,
            modify_index,
        };
        let bytes = serde_json::to_vec(&persisted).map_err(|e| {
            ConError::internal(format!(
                "encoding service entry '{}': {e}",
                registration.name
            ))
        })?;
        self.db
            .put_cf(cf, registration.name.as_bytes(), bytes)
            .map_err(|e| {
                ConError::internal(format!(
                    "persisting service entry '{}': {e}",
                    registration.name
                ))
            })
    }

    pub fn delete_service(&self, name: &str) -> Result<(), ConError> {
        let cf = self.cf(CF_SERVICES)?;
        self.db
            .delete_cf(cf, name.as_bytes())
            .map_err(|e| ConError::internal(format!("deleting service entry '{name}': {e}")))
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, ConError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ConError::internal(format!("missing column family '{name}'")))
    }
}
