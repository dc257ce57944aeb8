pub mod clone;
pub mod collab;
pub mod diff;
pub mod error;
pub mod snapshot;

pub use collab::{MemoryCache, OpenGate, PermissionGate, SnapshotCache};
pub use error::{ApiError, EngineError};

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use datapub_core::{Dataset, Submission, document::format_timestamp_ms, ids::*};
use datapub_storage::{RecordRow, SqliteStorage, Storage, UserRow};

use crate::diff::Reconciler;
use crate::error::Tagged;

/// Result of reconciling a submission: the submitted tree with server ids,
/// names, and timestamps merged back in, plus whether anything was written.
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub dataset: Dataset,
    pub changed: bool,
    pub affected_datatypes: Vec<DatatypeId>,
}

/// Live selection count for one option of a field, keyed by option name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldStat {
    pub name: String,
    pub count: u64,
}

pub struct Engine<G = OpenGate, C = MemoryCache> {
    storage: SqliteStorage,
    gate: G,
    cache: C,
}

impl Engine {
    pub fn new(storage: SqliteStorage) -> Self {
        Self::with_collaborators(storage, OpenGate, MemoryCache::new())
    }
}

impl<G: PermissionGate, C: SnapshotCache> Engine<G, C> {
    pub fn with_collaborators(storage: SqliteStorage, gate: G, cache: C) -> Self {
        Self {
            storage,
            gate,
            cache,
        }
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut SqliteStorage {
        &mut self.storage
    }

    /// Reconcile a submitted document tree against the persisted record and
    /// apply the minimal set of writes. Any error aborts the whole pass.
    pub fn update_dataset(
        &mut self,
        submission: &Submission,
    ) -> Result<ReconcileOutcome, ApiError> {
        let user = self.acting_user(&submission.user_email).source(0x6a01_0001)?;
        let record_uuid = submission
            .dataset
            .record_uuid
            .ok_or_else(|| {
                EngineError::BadRequest("top-level record_uuid is required".into())
            })
            .source(0x6a01_0002)?;
        let record_id = RecordId::from_uuid(record_uuid);
        let record = self.live_record(record_id).source(0x6a01_0003)?;
        if !self.gate.can_edit(&user, &record) {
            return Err(EngineError::Forbidden(format!(
                "user {} may not edit record {record_id}",
                user.email
            )))
            .source(0x6a01_0004);
        }

        let orig = match self.cache.get(record_id) {
            Some(snapshot) => snapshot,
            None => snapshot::materialize(&self.storage, record_id).source(0x6a01_0005)?,
        };

        let now_ms = Utc::now().timestamp_millis();
        let mut reconciler = Reconciler::new(&mut self.storage, user.user_id, now_ms);
        let (mut dataset, changed, affected_datatypes, deleted_records) = reconciler
            .run(&submission.dataset, Some(&orig), &record)
            .source(0x6a01_0006)?;

        if changed {
            self.storage
                .touch_record(record_id, user.user_id, now_ms)
                .source(0x6a01_0007)?;
            dataset.updated_at = Some(format_timestamp_ms(now_ms));
            for gone in deleted_records {
                self.invalidate_record_and_linkers(gone).source(0x6a01_0009)?;
            }
            self.cache.invalidate(record_id);
            let fresh = snapshot::materialize(&self.storage, record_id).source(0x6a01_0008)?;
            self.cache.put(record_id, fresh);
        }
        info!(record = %record_id, changed, "dataset reconciled");
        Ok(ReconcileOutcome {
            dataset,
            changed,
            affected_datatypes,
        })
    }

    /// Materialize the persisted record tree into the document shape.
    pub fn export_record(&mut self, record_uuid: Uuid) -> Result<Dataset, ApiError> {
        let record_id = RecordId::from_uuid(record_uuid);
        if let Some(snapshot) = self.cache.get(record_id) {
            return Ok(snapshot);
        }
        let snapshot = snapshot::materialize(&self.storage, record_id).source(0x6a02_0001)?;
        self.cache.put(record_id, snapshot.clone());
        Ok(snapshot)
    }

    /// Clone a master template into a fresh group and create its first
    /// top-level record. Returns that record's uuid.
    pub fn create_dataset(
        &mut self,
        template_uuid: Uuid,
        user_email: &str,
    ) -> Result<Uuid, ApiError> {
        let user = self.acting_user(user_email).source(0x6a03_0001)?;
        let now_ms = Utc::now().timestamp_millis();
        let record_id = clone::instantiate_template(
            &mut self.storage,
            TemplateId::from_uuid(template_uuid),
            user.user_id,
            now_ms,
        )
        .source(0x6a03_0002)?;
        info!(template = %template_uuid, record = %record_id, "dataset created");
        Ok(*record_id.as_uuid())
    }

    /// Cascade soft-delete a record tree.
    pub fn delete_record(&mut self, record_uuid: Uuid, user_email: &str) -> Result<(), ApiError> {
        let user = self.acting_user(user_email).source(0x6a04_0001)?;
        let record_id = RecordId::from_uuid(record_uuid);
        let record = self.live_record(record_id).source(0x6a04_0002)?;
        if !self.gate.can_edit(&user, &record) {
            return Err(EngineError::Forbidden(format!(
                "user {} may not delete record {record_id}",
                user.email
            )))
            .source(0x6a04_0003);
        }
        let now_ms = Utc::now().timestamp_millis();
        let deleted = self
            .storage
            .delete_record_tree(record_id, user.user_id, now_ms)
            .source(0x6a04_0004)?;
        for gone in deleted {
            self.invalidate_record_and_linkers(gone.record_id)
                .source(0x6a04_0005)?;
        }
        self.cache.invalidate(record.grandparent_id);
        info!(record = %record_id, "record deleted");
        Ok(())
    }

    /// Live selection counts per option name across every clone of a
    /// template field.
    pub fn field_stats(&self, template_field_uuid: Uuid) -> Result<Vec<FieldStat>, ApiError> {
        let fields = self
            .storage
            .resolve_fields_by_template(TemplateFieldId::from_uuid(template_field_uuid))
            .source(0x6a05_0001)?;
        if fields.is_empty() {
            return Err(EngineError::NotFound(format!(
                "field {template_field_uuid}"
            )))
            .source(0x6a05_0002);
        }
        let mut by_name: BTreeMap<String, u64> = BTreeMap::new();
        for field in fields {
            for count in self
                .storage
                .count_selections_by_option(field.field_id)
                .source(0x6a05_0003)?
            {
                *by_name.entry(count.name).or_default() += count.count;
            }
        }
        Ok(by_name
            .into_iter()
            .map(|(name, count)| FieldStat { name, count })
            .collect())
    }

    /// Drop a deleted record's own snapshot and every tree that could still
    /// show it through a link junction. The junctions are soft-deleted by the
    /// cascade before this runs, which is why the deleted ones are consulted.
    fn invalidate_record_and_linkers(&mut self, record_id: RecordId) -> Result<(), EngineError> {
        self.cache.invalidate(record_id);
        for link in self.storage.get_links_to(record_id)? {
            if let Some(ancestor) = self.storage.get_record(link.ancestor_record_id)? {
                self.cache.invalidate(ancestor.record_id);
                self.cache.invalidate(ancestor.grandparent_id);
            }
        }
        Ok(())
    }

    fn acting_user(&self, email: &str) -> Result<UserRow, EngineError> {
        collab::resolve_user(&self.storage, email)
    }

    fn live_record(&self, record_id: RecordId) -> Result<RecordRow, EngineError> {
        self.storage
            .get_record(record_id)?
            .filter(|r| !r.deleted)
            .ok_or_else(|| EngineError::NotFound(format!("record {record_id}")))
    }
}
