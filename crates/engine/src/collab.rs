use std::collections::HashMap;

use datapub_core::{Dataset, ids::*};
use datapub_storage::{RecordRow, Storage, UserRow};

use crate::error::EngineError;

/// Authorization seam. The engine never consults permission state directly;
/// callers inject whatever policy applies to the deployment.
pub trait PermissionGate {
    fn can_edit(&self, user: &UserRow, record: &RecordRow) -> bool;
}

/// Allow-all gate used by tests and single-tenant deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

impl PermissionGate for OpenGate {
    fn can_edit(&self, _user: &UserRow, _record: &RecordRow) -> bool {
        true
    }
}

/// Cache of materialized record documents keyed by top-level record id.
/// Invalidation is per-key; there is no global flush.
pub trait SnapshotCache {
    fn get(&self, record_id: RecordId) -> Option<Dataset>;
    fn put(&mut self, record_id: RecordId, snapshot: Dataset);
    fn invalidate(&mut self, record_id: RecordId);
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: HashMap<RecordId, Dataset>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SnapshotCache for MemoryCache {
    fn get(&self, record_id: RecordId) -> Option<Dataset> {
        self.entries.get(&record_id).cloned()
    }

    fn put(&mut self, record_id: RecordId, snapshot: Dataset) {
        self.entries.insert(record_id, snapshot);
    }

    fn invalidate(&mut self, record_id: RecordId) {
        self.entries.remove(&record_id);
    }
}

pub(crate) fn resolve_user<S: Storage>(
    storage: &S,
    email: &str,
) -> Result<UserRow, EngineError> {
    storage
        .get_user_by_email(email)?
        .ok_or_else(|| EngineError::NotFound(format!("user {email}")))
}
