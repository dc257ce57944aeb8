//! Template instantiation: cloning a master datatype group into a fresh
//! template group and creating its initial top-level record.

use std::collections::HashMap;

use tracing::debug;

use datapub_core::ids::*;
use datapub_storage::{DatatypeRow, FieldRow, OptionRow, RecordRow, Storage, TreeEdgeRow};

use crate::error::EngineError;

/// Clone the master template rooted at `template_uuid` — datatypes, tree
/// edges, fields, options with their tag parents — into a new group, then
/// create the initial record of the root clone. Returns that record's id.
pub(crate) fn instantiate_template<S: Storage>(
    storage: &mut S,
    template_uuid: TemplateId,
    user_id: UserId,
    now_ms: i64,
) -> Result<RecordId, EngineError> {
    let master = storage
        .get_master_datatype(template_uuid)?
        .ok_or_else(|| EngineError::NotFound(format!("template {template_uuid}")))?;
    let group = GroupId::new();

    // Breadth-first over the master tree; linked descendants are cloned into
    // the same group so record creation can resolve them locally.
    let mut masters = vec![master.clone()];
    let mut edges: Vec<TreeEdgeRow> = Vec::new();
    let mut seen = vec![master.datatype_id];
    let mut cursor = 0;
    while cursor < masters.len() {
        let current = masters[cursor].datatype_id;
        cursor += 1;
        for edge in storage.get_tree_children(current)? {
            edges.push(edge);
            if seen.contains(&edge.descendant_id) {
                continue;
            }
            seen.push(edge.descendant_id);
            let descendant = storage.get_datatype(edge.descendant_id)?.ok_or_else(|| {
                EngineError::NotFound(format!("datatype {}", edge.descendant_id))
            })?;
            masters.push(descendant);
        }
    }

    let mut clone_of: HashMap<DatatypeId, DatatypeId> = HashMap::new();
    for source in &masters {
        let datatype_id = DatatypeId::new();
        storage.insert_datatype(&DatatypeRow {
            datatype_id,
            template_uuid: TemplateId::from_uuid(*source.datatype_id.as_uuid()),
            template_group: group,
            name: source.name.clone(),
            is_master: false,
            created_at: now_ms,
            deleted: false,
        })?;
        clone_of.insert(source.datatype_id, datatype_id);
        clone_fields(storage, source.datatype_id, datatype_id, now_ms)?;
    }

    for edge in &edges {
        let (Some(&ancestor), Some(&descendant)) = (
            clone_of.get(&edge.ancestor_id),
            clone_of.get(&edge.descendant_id),
        ) else {
            continue;
        };
        storage.insert_tree_edge(&TreeEdgeRow {
            ancestor_id: ancestor,
            descendant_id: descendant,
            is_link: edge.is_link,
        })?;
    }

    let root = clone_of
        .get(&master.datatype_id)
        .copied()
        .ok_or_else(|| EngineError::Internal("root clone missing".into()))?;
    let record_id = RecordId::new();
    storage.insert_record(&RecordRow {
        record_id,
        datatype_id: root,
        parent_id: record_id,
        grandparent_id: record_id,
        created_at: now_ms,
        created_by: user_id,
        updated_at: now_ms,
        updated_by: user_id,
        deleted: false,
    })?;
    debug!(template = %template_uuid, record = %record_id, "instantiated template");
    Ok(record_id)
}

fn clone_fields<S: Storage>(
    storage: &mut S,
    source: DatatypeId,
    target: DatatypeId,
    now_ms: i64,
) -> Result<(), EngineError> {
    for field in storage.get_fields_for_datatype(source)? {
        let field_id = FieldId::new();
        storage.insert_field(&FieldRow {
            field_id,
            datatype_id: target,
            template_field_uuid: field.template_field_uuid,
            kind: field.kind,
            name: field.name.clone(),
            created_at: now_ms,
        })?;

        // Options come back in display order, parents before children is not
        // guaranteed, so remap parent ids in a second pass.
        let options = storage.get_options_for_field(field.field_id)?;
        let mut option_clone: HashMap<OptionId, OptionId> = HashMap::new();
        for option in &options {
            option_clone.insert(option.option_id, OptionId::new());
        }
        for option in &options {
            let parent_id = option.parent_id.and_then(|p| option_clone.get(&p).copied());
            storage.insert_option(&OptionRow {
                option_id: option_clone[&option.option_id],
                field_id,
                name: option.name.clone(),
                parent_id,
                user_created: option.user_created,
                display_order: option.display_order,
                created_at: now_ms,
                deleted: false,
            })?;
        }
    }
    Ok(())
}
