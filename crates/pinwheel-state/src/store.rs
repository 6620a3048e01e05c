//! StateStore — redb-backed persistence for pinwheel.
//!
//! Typed operations over hosts, instances, and CPU mappings. Values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports both
//! on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use pinwheel_core::epoch_secs;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// What an upsert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    Created,
    /// Stored record replaced; lists the fields that differed.
    Updated(Vec<&'static str>),
    /// Snapshot matched the stored record; nothing written, so the stored
    /// `updated_at` keeps the time of the last change.
    Unchanged,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(HOSTS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(MAPPINGS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic record access ──────────────────────────────────────

    fn read_record<T: DeserializeOwned>(&self, def: RecordTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(&self, def: RecordTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    fn remove_record(&self, def: RecordTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Insert `record` unless the stored copy is equal under `diff`.
    /// Read, compare, and write share one write transaction.
    fn upsert_record<T, F>(&self, def: RecordTable, key: &str, record: &T, diff: F) -> StateResult<Upsert>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&T, &T) -> Vec<&'static str>,
    {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let stored: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?),
                None => None,
            };
            outcome = match stored {
                None => Upsert::Created,
                Some(stored) => {
                    let changed = diff(record, &stored);
                    if changed.is_empty() {
                        Upsert::Unchanged
                    } else {
                        Upsert::Updated(changed)
                    }
                }
            };
            if outcome != Upsert::Unchanged {
                table
                    .insert(key, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Create the host, or replace it when its snapshot differs.
    pub fn upsert_host(&self, host: &HostRecord) -> StateResult<Upsert> {
        let key = host.table_key();
        let outcome = self.upsert_record(HOSTS, &key, host, HostRecord::changed_fields)?;
        debug!(%key, ?outcome, "host upserted");
        Ok(outcome)
    }

    pub fn get_host(&self, host_name: &str) -> StateResult<Option<HostRecord>> {
        self.read_record(HOSTS, host_name)
    }

    pub fn list_hosts(&self) -> StateResult<Vec<HostRecord>> {
        self.list_records(HOSTS)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Create the instance, or replace it when its snapshot differs.
    pub fn upsert_instance(&self, instance: &InstanceRecord) -> StateResult<Upsert> {
        let key = instance.table_key();
        let outcome = self.upsert_record(INSTANCES, &key, instance, InstanceRecord::changed_fields)?;
        debug!(%key, ?outcome, "instance upserted");
        Ok(outcome)
    }

    pub fn get_instance(&self, uuid: &str) -> StateResult<Option<InstanceRecord>> {
        self.read_record(INSTANCES, uuid)
    }

    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        self.list_records(INSTANCES)
    }

    // ── CPU mappings ───────────────────────────────────────────────

    /// Persist a new `Pending` mapping. Fails with `AlreadyExists` if the
    /// instance already has one.
    pub fn create_mapping(&self, new: &NewMapping) -> StateResult<MappingRecord> {
        let key = new.instance_uuid.as_str();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record;
        {
            let mut table = txn.open_table(MAPPINGS).map_err(map_err!(Table))?;
            if table.get(key).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(format!("cpu mapping for instance {key}")));
            }

            let mut seq = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            let id = seq
                .get(MAPPING_ID_SEQ)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            seq.insert(MAPPING_ID_SEQ, id).map_err(map_err!(Write))?;

            let now = epoch_secs();
            record = MappingRecord {
                id,
                instance_uuid: new.instance_uuid.clone(),
                project_id: new.project_id.clone(),
                user_id: new.user_id.clone(),
                host: new.host.clone(),
                cpu_mappings: new.cpu_mappings.clone(),
                status: MappingStatus::Pending,
                status_reason: None,
                created_at: now,
                updated_at: now,
            };
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, id = record.id, "cpu mapping created");
        Ok(record)
    }

    pub fn get_mapping(&self, instance_uuid: &str) -> StateResult<Option<MappingRecord>> {
        self.read_record(MAPPINGS, instance_uuid)
    }

    pub fn list_mappings(&self) -> StateResult<Vec<MappingRecord>> {
        self.list_records(MAPPINGS)
    }

    /// Read-modify-write a mapping in one write transaction.
    ///
    /// Identity fields (`id`, `instance_uuid`, `created_at`) are kept from the
    /// stored record whatever `f` returns. A change back to `Pending` from a
    /// terminal status is rejected.
    pub fn update_mapping<F>(&self, instance_uuid: &str, f: F) -> StateResult<MappingRecord>
    where
        F: FnOnce(MappingRecord) -> MappingRecord,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(MAPPINGS).map_err(map_err!(Table))?;
            let stored: MappingRecord = match table.get(instance_uuid).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => {
                    return Err(StateError::NotFound(format!(
                        "cpu mapping for instance {instance_uuid}"
                    )));
                }
            };

            let mut updated = f(stored.clone());
            if !stored.status.can_transition_to(updated.status) {
                return Err(StateError::InvalidTransition {
                    key: instance_uuid.to_string(),
                    from: stored.status.to_string(),
                    to: updated.status.to_string(),
                });
            }
            updated.id = stored.id;
            updated.instance_uuid = stored.instance_uuid;
            updated.created_at = stored.created_at;
            updated.updated_at = epoch_secs();

            let value = serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
            table
                .insert(instance_uuid, value.as_slice())
                .map_err(map_err!(Write))?;
            next = updated;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%instance_uuid, status = %next.status, "cpu mapping updated");
        Ok(next)
    }

    pub fn delete_mapping(&self, instance_uuid: &str) -> StateResult<bool> {
        let existed = self.remove_record(MAPPINGS, instance_uuid)?;
        debug!(%instance_uuid, existed, "cpu mapping deleted");
        Ok(existed)
    }
}
