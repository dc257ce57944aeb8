//! Materialization of persisted records into the document tree shape.

use std::collections::HashMap;

use datapub_core::{
    Dataset, FieldEntry, FieldInput, FieldKind, OptionNode, TagNode,
    document::format_timestamp_ms, ids::*,
};
use datapub_storage::{FieldRow, OptionRow, SelectionRow, Storage};

use crate::error::EngineError;

/// Build the document tree for a record and everything below it: scalar
/// values, option selections, tag trees, owned children, linked records.
pub(crate) fn materialize<S: Storage>(
    storage: &S,
    record_id: RecordId,
) -> Result<Dataset, EngineError> {
    let record = storage
        .get_record(record_id)?
        .ok_or_else(|| EngineError::NotFound(format!("record {record_id}")))?;
    if record.deleted {
        return Err(EngineError::NotFound(format!("record {record_id}")));
    }
    let datatype = storage
        .get_datatype(record.datatype_id)?
        .ok_or_else(|| EngineError::NotFound(format!("datatype {}", record.datatype_id)))?;

    let mut fields = Vec::new();
    for field in storage.get_fields_for_datatype(record.datatype_id)? {
        if let Some(entry) = materialize_field(storage, record_id, &field)? {
            fields.push(entry);
        }
    }

    let mut records = Vec::new();
    for child in storage.get_child_records(record_id)? {
        records.push(materialize(storage, child.record_id)?);
    }
    for link in storage.get_links_from(record_id)? {
        records.push(materialize(storage, link.descendant_record_id)?);
    }

    Ok(Dataset {
        record_uuid: Some(*record.record_id.as_uuid()),
        template_uuid: Some(*datatype.template_uuid.as_uuid()),
        fields,
        records,
        created_at: Some(format_timestamp_ms(record.created_at)),
        updated_at: Some(format_timestamp_ms(record.updated_at)),
    })
}

fn materialize_field<S: Storage>(
    storage: &S,
    record_id: RecordId,
    field: &FieldRow,
) -> Result<Option<FieldEntry>, EngineError> {
    let Some(container) = storage.get_container(record_id, field.field_id)? else {
        // Tag trees render even when nothing was ever selected.
        if field.kind == FieldKind::TagTree {
            let tree = tag_tree(storage, field, &HashMap::new())?;
            return Ok(Some(entry_for(field, FieldInput::Tags(tree), None)));
        }
        return Ok(None);
    };

    if field.kind.is_scalar() || field.kind == FieldKind::Boolean {
        let Some(value) = storage.get_live_value(container.container_id)? else {
            return Ok(None);
        };
        let mut entry = FieldEntry {
            template_field_uuid: *field.template_field_uuid.as_uuid(),
            field_uuid: Some(*field.field_id.as_uuid()),
            id: Some(*value.value_id.as_uuid()),
            updated_at: Some(format_timestamp_ms(value.updated_at)),
            ..Default::default()
        };
        if field.kind == FieldKind::Boolean {
            entry.selected = value.value.as_boolean();
        } else {
            entry.value = Some(FieldInput::Scalar(value.value.to_json()));
        }
        return Ok(Some(entry));
    }

    let selections: HashMap<OptionId, SelectionRow> = storage
        .get_live_selections(container.container_id)?
        .into_iter()
        .map(|s| (s.option_id, s))
        .collect();

    if field.kind == FieldKind::TagTree {
        let tree = tag_tree(storage, field, &selections)?;
        return Ok(Some(entry_for(
            field,
            FieldInput::Tags(tree),
            Some(container.container_id),
        )));
    }

    let mut nodes = Vec::new();
    for option in storage.get_options_for_field(field.field_id)? {
        let Some(selection) = selections.get(&option.option_id) else {
            continue;
        };
        nodes.push(OptionNode {
            template_radio_option_uuid: option.option_id.to_string(),
            name: Some(option.name.clone()),
            id: Some(*selection.selection_id.as_uuid()),
            updated_at: Some(format_timestamp_ms(selection.updated_at)),
            created_at: Some(format_timestamp_ms(selection.created_at)),
            user_created: option.user_created,
        });
    }
    Ok(Some(entry_for(
        field,
        FieldInput::Options(nodes),
        Some(container.container_id),
    )))
}

fn entry_for(field: &FieldRow, value: FieldInput, container: Option<ContainerId>) -> FieldEntry {
    FieldEntry {
        template_field_uuid: *field.template_field_uuid.as_uuid(),
        field_uuid: Some(*field.field_id.as_uuid()),
        value: Some(value),
        id: container.map(|c| *c.as_uuid()),
        ..Default::default()
    }
}

/// Render the whole tag hierarchy of a field, marking selected nodes.
fn tag_tree<S: Storage>(
    storage: &S,
    field: &FieldRow,
    selections: &HashMap<OptionId, SelectionRow>,
) -> Result<Vec<TagNode>, EngineError> {
    let options = storage.get_options_for_field(field.field_id)?;
    let mut children_of: HashMap<Option<OptionId>, Vec<&OptionRow>> = HashMap::new();
    for option in &options {
        children_of.entry(option.parent_id).or_default().push(option);
    }
    Ok(build_tag_level(&children_of, selections, None))
}

fn build_tag_level(
    children_of: &HashMap<Option<OptionId>, Vec<&OptionRow>>,
    selections: &HashMap<OptionId, SelectionRow>,
    parent: Option<OptionId>,
) -> Vec<TagNode> {
    let Some(level) = children_of.get(&parent) else {
        return Vec::new();
    };
    level
        .iter()
        .map(|option| {
            let selection = selections.get(&option.option_id);
            TagNode {
                template_tag_uuid: option.option_id.to_string(),
                name: Some(option.name.clone()),
                tag_parent_uuid: option.parent_id.map(|p| p.to_string()),
                selected: selection.is_some(),
                children: build_tag_level(children_of, selections, Some(option.option_id)),
                id: selection.map(|s| *s.selection_id.as_uuid()),
                updated_at: selection.map(|s| format_timestamp_ms(s.updated_at)),
                created_at: selection.map(|s| format_timestamp_ms(s.created_at)),
                user_created: option.user_created,
            }
        })
        .collect()
}
