//! Reconciliation of a submitted document tree against persisted state.
//!
//! The submitted tree is never mutated; a merged copy is rebuilt with
//! server-resolved identifiers, names, and timestamps filled in. Every write
//! bumps the pass-level write counter, so reconciling a document against an
//! identical snapshot leaves storage untouched.

use std::collections::{HashMap, HashSet};

use tracing::debug;
use uuid::Uuid;

use datapub_core::{
    Dataset, FieldEntry, FieldInput, FieldKind, FieldValue, OptionNode, TagNode,
    document::format_timestamp_ms, ids::*,
};
use datapub_storage::{
    ContainerRow, FieldRow, LinkRow, OptionRow, RecordRow, SelectionRow, Storage, ValueRow,
};

use crate::error::EngineError;

pub(crate) struct Reconciler<'a, S: Storage> {
    storage: &'a mut S,
    user_id: UserId,
    now_ms: i64,
    /// Count of persistence writes, not a flag, so per-node dirtiness can be
    /// read off as a delta.
    writes: u64,
    affected: Vec<DatatypeId>,
    deleted_records: Vec<RecordId>,
    /// Options provisioned earlier in this pass, keyed by the submitted name,
    /// so a user-created tag can parent another created in the same document.
    provisional: HashMap<(FieldId, String), OptionId>,
}

impl<'a, S: Storage + 'static> Reconciler<'a, S> {
    pub(crate) fn new(storage: &'a mut S, user_id: UserId, now_ms: i64) -> Self {
        Self {
            storage,
            user_id,
            now_ms,
            writes: 0,
            affected: Vec::new(),
            deleted_records: Vec::new(),
            provisional: HashMap::new(),
        }
    }

    /// Reconcile one record node and everything below it. Returns the merged
    /// node, the changed flag, the affected datatypes, and the records
    /// removed by cascade; `orig` is the previous snapshot of the same node,
    /// absent for records created in this pass.
    pub(crate) fn run(
        &mut self,
        submitted: &Dataset,
        orig: Option<&Dataset>,
        record: &RecordRow,
    ) -> Result<(Dataset, bool, Vec<DatatypeId>, Vec<RecordId>), EngineError> {
        let merged = self.reconcile_record(submitted, orig, record)?;
        let mut affected = std::mem::take(&mut self.affected);
        affected.sort();
        affected.dedup();
        Ok((
            merged,
            self.writes > 0,
            affected,
            std::mem::take(&mut self.deleted_records),
        ))
    }

    fn reconcile_record(
        &mut self,
        submitted: &Dataset,
        orig: Option<&Dataset>,
        record: &RecordRow,
    ) -> Result<Dataset, EngineError> {
        let mut merged = submitted.clone();
        merged.record_uuid = Some(*record.record_id.as_uuid());
        merged.created_at = Some(format_timestamp_ms(record.created_at));

        let writes_before = self.writes;
        for entry in &mut merged.fields {
            let field = self
                .storage
                .resolve_field(
                    TemplateFieldId::from_uuid(entry.template_field_uuid),
                    record.datatype_id,
                )?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("field {}", entry.template_field_uuid))
                })?;
            strategy_for::<S>(field.kind).reconcile(self, record, &field, entry)?;
        }
        self.delete_vanished_children(submitted, orig)?;

        // Writes under descendant nodes do not dirty this node's timestamp.
        let node_dirty = self.writes > writes_before;
        merged.records = self.reconcile_children(submitted, orig, record)?;

        merged.updated_at = Some(format_timestamp_ms(if node_dirty {
            self.now_ms
        } else {
            record.updated_at
        }));
        Ok(merged)
    }

    /// Orig child records whose (template, record) uuid pair no longer appears
    /// in the submitted tree are cascade-deleted.
    fn delete_vanished_children(
        &mut self,
        submitted: &Dataset,
        orig: Option<&Dataset>,
    ) -> Result<(), EngineError> {
        let Some(orig) = orig else { return Ok(()) };
        let submitted_pairs: HashSet<(Option<Uuid>, Uuid)> = submitted
            .records
            .iter()
            .filter_map(|r| r.record_uuid.map(|uuid| (r.template_uuid, uuid)))
            .collect();
        for prev in &orig.records {
            let Some(uuid) = prev.record_uuid else { continue };
            if submitted_pairs.contains(&(prev.template_uuid, uuid)) {
                continue;
            }
            let record_id = RecordId::from_uuid(uuid);
            debug!(record = %record_id, "deleting vanished record");
            for gone in self
                .storage
                .delete_record_tree(record_id, self.user_id, self.now_ms)?
            {
                self.affected.push(gone.datatype_id);
                self.deleted_records.push(gone.record_id);
                self.writes += 1;
            }
        }
        Ok(())
    }

    fn reconcile_children(
        &mut self,
        submitted: &Dataset,
        orig: Option<&Dataset>,
        parent: &RecordRow,
    ) -> Result<Vec<Dataset>, EngineError> {
        let mut out = Vec::with_capacity(submitted.records.len());
        for child in &submitted.records {
            let merged = match child.record_uuid {
                Some(uuid) => {
                    let record_id = RecordId::from_uuid(uuid);
                    let record = self
                        .storage
                        .get_record(record_id)?
                        .filter(|r| !r.deleted)
                        .ok_or_else(|| EngineError::NotFound(format!("record {record_id}")))?;
                    let child_orig = orig.and_then(|o| {
                        o.records.iter().find(|r| r.record_uuid == Some(uuid))
                    });
                    self.reconcile_record(child, child_orig, &record)?
                }
                None => {
                    let record = self.create_child_record(child, parent)?;
                    self.reconcile_record(child, None, &record)?
                }
            };
            out.push(merged);
        }
        Ok(out)
    }

    /// Create a record for a submitted node carrying no uuid. The concrete
    /// datatype is resolved by (master template uuid, parent's template
    /// group); the datatype tree edge decides owned child versus link.
    fn create_child_record(
        &mut self,
        child: &Dataset,
        parent: &RecordRow,
    ) -> Result<RecordRow, EngineError> {
        let template_uuid = child.template_uuid.ok_or_else(|| {
            EngineError::BadRequest("new record is missing template_uuid".into())
        })?;
        let parent_datatype = self
            .storage
            .get_datatype(parent.datatype_id)?
            .ok_or_else(|| {
                EngineError::NotFound(format!("datatype {}", parent.datatype_id))
            })?;
        let datatype = self
            .storage
            .get_datatype_in_group(
                TemplateId::from_uuid(template_uuid),
                parent_datatype.template_group,
            )?
            .ok_or_else(|| EngineError::NotFound(format!("datatype for {template_uuid}")))?;
        let edge = self
            .storage
            .get_tree_edge(parent.datatype_id, datatype.datatype_id)?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "tree edge {} -> {}",
                    parent.datatype_id, datatype.datatype_id
                ))
            })?;

        let record_id = RecordId::new();
        let (parent_id, grandparent_id) = if edge.is_link {
            (record_id, record_id)
        } else {
            (parent.record_id, parent.grandparent_id)
        };
        self.storage.insert_record(&RecordRow {
            record_id,
            datatype_id: datatype.datatype_id,
            parent_id,
            grandparent_id,
            created_at: self.now_ms,
            created_by: self.user_id,
            updated_at: self.now_ms,
            updated_by: self.user_id,
            deleted: false,
        })?;
        if edge.is_link {
            self.storage.insert_link(&LinkRow {
                link_id: LinkId::new(),
                ancestor_record_id: parent.record_id,
                descendant_record_id: record_id,
                created_at: self.now_ms,
                created_by: self.user_id,
                deleted: false,
            })?;
        }
        debug!(record = %record_id, linked = edge.is_link, "created record");
        self.writes += 1;
        self.affected.push(datatype.datatype_id);

        self.storage
            .get_record(record_id)?
            .ok_or_else(|| EngineError::Internal(format!("record {record_id} not readable")))
    }

    fn existing_container(
        &mut self,
        record: &RecordRow,
        field: &FieldRow,
    ) -> Result<Option<ContainerRow>, EngineError> {
        Ok(self.storage.get_container(record.record_id, field.field_id)?)
    }

    /// Containers are created lazily, only once a value or selection write
    /// actually needs one, so a no-op pass leaves no rows behind.
    fn create_container(
        &mut self,
        record: &RecordRow,
        field: &FieldRow,
    ) -> Result<ContainerRow, EngineError> {
        let container_id = ContainerId::new();
        self.storage.insert_container(&ContainerRow {
            container_id,
            record_id: record.record_id,
            field_id: field.field_id,
            created_at: self.now_ms,
            created_by: self.user_id,
            deleted: false,
        })?;
        self.writes += 1;
        self.affected.push(field.datatype_id);
        self.storage
            .get_container(record.record_id, field.field_id)?
            .ok_or_else(|| {
                EngineError::Internal(format!("container {container_id} not readable"))
            })
    }

    /// Replace-on-change for scalar and boolean values: no writes when the
    /// live value already equals the desired one.
    fn write_value(
        &mut self,
        record: &RecordRow,
        field: &FieldRow,
        desired: FieldValue,
        entry: &mut FieldEntry,
    ) -> Result<(), EngineError> {
        entry.field_uuid = Some(*field.field_id.as_uuid());
        let container = match self.existing_container(record, field)? {
            Some(container) => container,
            // Nothing stored and nothing to store.
            None if desired.is_null() => return Ok(()),
            None => self.create_container(record, field)?,
        };
        let live = self.storage.get_live_value(container.container_id)?;

        if let Some(live) = &live {
            if live.value == desired {
                entry.id = Some(*live.value_id.as_uuid());
                entry.updated_at = Some(format_timestamp_ms(live.updated_at));
                return Ok(());
            }
            self.storage.supersede_value(live.value_id, self.now_ms)?;
        }

        let value_id = ValueId::new();
        self.storage.insert_value(&ValueRow {
            value_id,
            container_id: container.container_id,
            value: desired,
            created_at: self.now_ms,
            created_by: self.user_id,
            updated_at: self.now_ms,
            deleted: false,
        })?;
        let written = self
            .storage
            .get_value(value_id)?
            .ok_or_else(|| EngineError::Internal(format!("value {value_id} not readable")))?;
        debug!(field = %field.field_id, record = %record.record_id, "value replaced");
        self.writes += 1;
        self.affected.push(field.datatype_id);

        entry.id = Some(*written.value_id.as_uuid());
        entry.updated_at = Some(format_timestamp_ms(written.updated_at));
        Ok(())
    }

    /// Resolve a submitted option reference within a field: a real option
    /// uuid, or the name of an option provisioned earlier in this pass.
    fn resolve_option(
        &mut self,
        field: &FieldRow,
        raw: &str,
    ) -> Result<Option<OptionRow>, EngineError> {
        if let Ok(uuid) = Uuid::parse_str(raw) {
            if let Some(option) = self
                .storage
                .get_option_in_field(OptionId::from_uuid(uuid), field.field_id)?
            {
                return Ok(Some(option));
            }
        }
        if let Some(option_id) = self.provisional.get(&(field.field_id, raw.to_string())) {
            return Ok(self.storage.get_option(*option_id)?);
        }
        Ok(None)
    }

    /// Auto-provision a user-created option: the submitted uuid string is
    /// taken as the display name and a real uuid is minted server-side.
    fn provision_option(
        &mut self,
        field: &FieldRow,
        name: &str,
        parent_id: Option<OptionId>,
    ) -> Result<OptionRow, EngineError> {
        let option_id = OptionId::new();
        self.storage.insert_option(&OptionRow {
            option_id,
            field_id: field.field_id,
            name: name.to_string(),
            parent_id,
            user_created: true,
            display_order: 0,
            created_at: self.now_ms,
            deleted: false,
        })?;
        let option = self
            .storage
            .get_option(option_id)?
            .ok_or_else(|| EngineError::Internal(format!("option {option_id} not readable")))?;
        debug!(field = %field.field_id, name, "provisioned user-created option");
        self.provisional
            .insert((field.field_id, name.to_string()), option_id);
        self.writes += 1;
        self.affected.push(field.datatype_id);
        Ok(option)
    }

    /// Apply a desired selection set to a container: soft-delete survivors'
    /// complement, insert what is missing. Returns the live selection per
    /// option after the pass.
    fn apply_selection_set(
        &mut self,
        field: &FieldRow,
        container: &ContainerRow,
        desired: &[OptionId],
    ) -> Result<HashMap<OptionId, SelectionRow>, EngineError> {
        let mut live: HashMap<OptionId, SelectionRow> = self
            .storage
            .get_live_selections(container.container_id)?
            .into_iter()
            .map(|s| (s.option_id, s))
            .collect();
        let desired_set: HashSet<OptionId> = desired.iter().copied().collect();

        let removed: Vec<OptionId> = live
            .keys()
            .filter(|id| !desired_set.contains(id))
            .copied()
            .collect();
        for option_id in removed {
            if let Some(selection) = live.remove(&option_id) {
                self.storage
                    .delete_selection(selection.selection_id, self.now_ms)?;
                debug!(field = %field.field_id, option = %option_id, "selection removed");
                self.writes += 1;
                self.affected.push(field.datatype_id);
            }
        }

        let mut inserted = 0usize;
        for option_id in desired {
            if live.contains_key(option_id) {
                continue;
            }
            inserted += 1;
            if field.kind.single_cardinality() && inserted > 1 {
                return Err(EngineError::BadRequest(format!(
                    "field {} accepts a single selection",
                    field.template_field_uuid
                )));
            }
            let selection_id = SelectionId::new();
            self.storage.insert_selection(&SelectionRow {
                selection_id,
                container_id: container.container_id,
                option_id: *option_id,
                created_at: self.now_ms,
                created_by: self.user_id,
                updated_at: self.now_ms,
                deleted: false,
            })?;
            let selection = self.storage.get_selection(selection_id)?.ok_or_else(|| {
                EngineError::Internal(format!("selection {selection_id} not readable"))
            })?;
            debug!(field = %field.field_id, option = %option_id, "selection added");
            self.writes += 1;
            self.affected.push(field.datatype_id);
            live.insert(*option_id, selection);
        }
        Ok(live)
    }
}

/// Per-kind reconciliation behavior, dispatched once per field entry.
trait FieldStrategy<S: Storage> {
    fn reconcile(
        &self,
        cx: &mut Reconciler<'_, S>,
        record: &RecordRow,
        field: &FieldRow,
        entry: &mut FieldEntry,
    ) -> Result<(), EngineError>;
}

fn strategy_for<S: Storage + 'static>(kind: FieldKind) -> &'static dyn FieldStrategy<S> {
    match kind {
        FieldKind::Boolean => &BooleanStrategy,
        FieldKind::Integer | FieldKind::Decimal | FieldKind::Text => &ScalarStrategy,
        FieldKind::SingleRadio
        | FieldKind::MultiRadio
        | FieldKind::SingleSelect
        | FieldKind::MultiSelect => &OptionSetStrategy,
        FieldKind::TagTree => &TagTreeStrategy,
    }
}

struct ScalarStrategy;

impl<S: Storage + 'static> FieldStrategy<S> for ScalarStrategy {
    fn reconcile(
        &self,
        cx: &mut Reconciler<'_, S>,
        record: &RecordRow,
        field: &FieldRow,
        entry: &mut FieldEntry,
    ) -> Result<(), EngineError> {
        let raw = match &entry.value {
            Some(input) => input.as_scalar().ok_or_else(|| {
                EngineError::BadRequest(format!(
                    "field {} expects a scalar value",
                    field.template_field_uuid
                ))
            })?,
            None => &serde_json::Value::Null,
        };
        let desired = FieldValue::from_json(field.kind, raw)?;
        cx.write_value(record, field, desired, entry)
    }
}

struct BooleanStrategy;

impl<S: Storage + 'static> FieldStrategy<S> for BooleanStrategy {
    fn reconcile(
        &self,
        cx: &mut Reconciler<'_, S>,
        record: &RecordRow,
        field: &FieldRow,
        entry: &mut FieldEntry,
    ) -> Result<(), EngineError> {
        let desired = FieldValue::Boolean(entry.selected.unwrap_or(false));
        cx.write_value(record, field, desired, entry)
    }
}

struct OptionSetStrategy;

impl<S: Storage + 'static> FieldStrategy<S> for OptionSetStrategy {
    fn reconcile(
        &self,
        cx: &mut Reconciler<'_, S>,
        record: &RecordRow,
        field: &FieldRow,
        entry: &mut FieldEntry,
    ) -> Result<(), EngineError> {
        let mut nodes: Vec<OptionNode> = match &entry.value {
            Some(input) => input
                .as_options()
                .ok_or_else(|| {
                    EngineError::BadRequest(format!(
                        "field {} expects an option list",
                        field.template_field_uuid
                    ))
                })?
                .to_vec(),
            None => Vec::new(),
        };

        let mut desired = Vec::with_capacity(nodes.len());
        let mut resolved: HashMap<String, OptionRow> = HashMap::new();
        for node in &nodes {
            let raw = node.template_radio_option_uuid.clone();
            let option = match cx.resolve_option(field, &raw)? {
                Some(option) => option,
                None => cx.provision_option(field, &raw, None)?,
            };
            desired.push(option.option_id);
            resolved.insert(raw, option);
        }

        let container = match cx.existing_container(record, field)? {
            Some(container) => Some(container),
            // Nothing stored and nothing to select.
            None if desired.is_empty() => None,
            None => Some(cx.create_container(record, field)?),
        };
        let live = match &container {
            Some(container) => cx.apply_selection_set(field, container, &desired)?,
            None => HashMap::new(),
        };

        for node in &mut nodes {
            let Some(option) = resolved.get(&node.template_radio_option_uuid) else {
                continue;
            };
            node.template_radio_option_uuid = option.option_id.to_string();
            node.name = Some(option.name.clone());
            node.user_created = option.user_created;
            if let Some(selection) = live.get(&option.option_id) {
                node.id = Some(*selection.selection_id.as_uuid());
                node.created_at = Some(format_timestamp_ms(selection.created_at));
                node.updated_at = Some(format_timestamp_ms(selection.updated_at));
            }
        }
        entry.field_uuid = Some(*field.field_id.as_uuid());
        entry.id = container.map(|container| *container.container_id.as_uuid());
        entry.value = Some(FieldInput::Options(nodes));
        Ok(())
    }
}

struct TagTreeStrategy;

impl TagTreeStrategy {
    /// Walk the submitted tree in document order so a user-created parent is
    /// provisioned before any child naming it.
    fn collect<S: Storage + 'static>(
        cx: &mut Reconciler<'_, S>,
        field: &FieldRow,
        nodes: &[TagNode],
        resolved: &mut HashMap<String, OptionRow>,
        desired: &mut Vec<OptionId>,
    ) -> Result<(), EngineError> {
        for node in nodes {
            if node.selected {
                let raw = node.template_tag_uuid.clone();
                let option = match cx.resolve_option(field, &raw)? {
                    Some(option) => option,
                    None => {
                        let parent_raw = node.tag_parent_uuid.as_deref().ok_or_else(|| {
                            EngineError::BadRequest(format!(
                                "user-created tag {raw:?} is missing tag_parent_uuid"
                            ))
                        })?;
                        let parent =
                            cx.resolve_option(field, parent_raw)?.ok_or_else(|| {
                                EngineError::NotFound(format!("tag parent {parent_raw}"))
                            })?;
                        cx.provision_option(field, &raw, Some(parent.option_id))?
                    }
                };
                desired.push(option.option_id);
                resolved.insert(raw, option);
            }
            Self::collect(cx, field, &node.children, resolved, desired)?;
        }
        Ok(())
    }

    fn merge(
        nodes: &mut [TagNode],
        resolved: &HashMap<String, OptionRow>,
        live: &HashMap<OptionId, SelectionRow>,
    ) {
        for node in nodes {
            if let Some(option) = resolved.get(&node.template_tag_uuid) {
                node.template_tag_uuid = option.option_id.to_string();
                node.name = Some(option.name.clone());
                node.tag_parent_uuid = option.parent_id.map(|p| p.to_string());
                node.user_created = option.user_created;
                if let Some(selection) = live.get(&option.option_id) {
                    node.id = Some(*selection.selection_id.as_uuid());
                    node.created_at = Some(format_timestamp_ms(selection.created_at));
                    node.updated_at = Some(format_timestamp_ms(selection.updated_at));
                }
            }
            Self::merge(&mut node.children, resolved, live);
        }
    }
}

impl<S: Storage + 'static> FieldStrategy<S> for TagTreeStrategy {
    fn reconcile(
        &self,
        cx: &mut Reconciler<'_, S>,
        record: &RecordRow,
        field: &FieldRow,
        entry: &mut FieldEntry,
    ) -> Result<(), EngineError> {
        let mut nodes: Vec<TagNode> = match &entry.value {
            Some(input) => input
                .as_tags()
                .ok_or_else(|| {
                    EngineError::BadRequest(format!(
                        "field {} expects a tag tree",
                        field.template_field_uuid
                    ))
                })?
                .to_vec(),
            None => Vec::new(),
        };

        let mut desired = Vec::new();
        let mut resolved: HashMap<String, OptionRow> = HashMap::new();
        Self::collect(cx, field, &nodes, &mut resolved, &mut desired)?;

        let container = match cx.existing_container(record, field)? {
            Some(container) => Some(container),
            // Nothing stored and nothing to select.
            None if desired.is_empty() => None,
            None => Some(cx.create_container(record, field)?),
        };
        let live = match &container {
            Some(container) => cx.apply_selection_set(field, container, &desired)?,
            None => HashMap::new(),
        };

        Self::merge(&mut nodes, &resolved, &live);
        entry.field_uuid = Some(*field.field_id.as_uuid());
        entry.id = container.map(|container| *container.container_id.as_uuid());
        entry.value = Some(FieldInput::Tags(nodes));
        Ok(())
    }
}
