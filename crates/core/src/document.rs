use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire shape accepted by the update operation: the proposed document tree
/// plus the email of the user the changes are attributed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub dataset: Dataset,
    pub user_email: String,
}

/// One record node of the hierarchical document. `records` holds both owned
/// child records and linked records; the two are not distinguished in the
/// document itself, only by the datatype tree in storage.
///
/// `record_uuid` is absent on records the client wants created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<Dataset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Dataset {
    /// Locate a field entry by template field uuid.
    pub fn field(&self, template_field_uuid: Uuid) -> Option<&FieldEntry> {
        self.fields
            .iter()
            .find(|f| f.template_field_uuid == template_field_uuid)
    }
}

/// One field of a record node. Scalar fields carry `value` as a raw JSON
/// scalar; selection-set fields carry a list of option or tag nodes; boolean
/// fields use `selected` instead of `value`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldEntry {
    pub template_field_uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<FieldInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Untagged payload of a field entry. Tag nodes and option nodes are
/// disambiguated by their required uuid key; anything else is a scalar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldInput {
    Tags(Vec<TagNode>),
    Options(Vec<OptionNode>),
    Scalar(serde_json::Value),
}

impl FieldInput {
    pub fn as_scalar(&self) -> Option<&serde_json::Value> {
        match self {
            FieldInput::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_options(&self) -> Option<&[OptionNode]> {
        match self {
            FieldInput::Options(nodes) => Some(nodes),
            _ => None,
        }
    }

    pub fn as_tags(&self) -> Option<&[TagNode]> {
        match self {
            FieldInput::Tags(nodes) => Some(nodes),
            _ => None,
        }
    }
}

/// A flat option reference for radio/select fields. Presence in the list
/// means the option is selected. The uuid field is a plain string because a
/// client may submit an option name here to request a user-created option.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OptionNode {
    pub template_radio_option_uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub user_created: bool,
}

impl OptionNode {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            template_radio_option_uuid: uuid.into(),
            ..Default::default()
        }
    }
}

/// A node of a tag hierarchy. Unlike flat options, tag trees are submitted
/// whole; only nodes with `selected` count as chosen. The uuid field doubles
/// as the requested display name for user-created tags, which must also name
/// their parent via `tag_parent_uuid`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TagNode {
    pub template_tag_uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_parent_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub selected: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TagNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub user_created: bool,
}

impl TagNode {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            template_tag_uuid: uuid.into(),
            ..Default::default()
        }
    }
}

/// Collect the uuids of every selected node in a tag tree, depth-first.
pub fn selected_tag_uuids(nodes: &[TagNode], out: &mut Vec<String>) {
    for node in nodes {
        if node.selected {
            out.push(node.template_tag_uuid.clone());
        }
        if !node.children.is_empty() {
            selected_tag_uuids(&node.children, out);
        }
    }
}

/// Timestamp rendering used everywhere a document carries a server time.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Unix-millisecond timestamp back into the document rendering.
pub fn format_timestamp_ms(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(ts) => format_timestamp(ts),
        None => String::from("1970-01-01 00:00:00"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_field_input_parses_all_shapes() {
        let doc: Dataset = serde_json::from_value(serde_json::json!({
            "record_uuid": "01890a5d-ac96-774b-bcce-b302099a8057",
            "fields": [
                {
                    "template_field_uuid": "01890a5d-ac96-774b-bcce-b30209000001",
                    "value": "basalt"
                },
                {
                    "template_field_uuid": "01890a5d-ac96-774b-bcce-b30209000002",
                    "value": [
                        {"template_radio_option_uuid": "opt-1", "name": "geochemistry"}
                    ]
                },
                {
                    "template_field_uuid": "01890a5d-ac96-774b-bcce-b30209000003",
                    "value": [
                        {
                            "template_tag_uuid": "tag-1",
                            "selected": true,
                            "children": [
                                {"template_tag_uuid": "tag-2", "selected": true}
                            ]
                        }
                    ]
                }
            ]
        }))
        .unwrap();

        assert!(matches!(
            doc.fields[0].value,
            Some(FieldInput::Scalar(serde_json::Value::String(_)))
        ));
        assert!(matches!(doc.fields[1].value, Some(FieldInput::Options(_))));
        assert!(matches!(doc.fields[2].value, Some(FieldInput::Tags(_))));
    }

    #[test]
    fn selected_tags_walk_nested_children() {
        let tree = vec![TagNode {
            template_tag_uuid: "a".into(),
            selected: false,
            children: vec![
                TagNode {
                    template_tag_uuid: "b".into(),
                    selected: true,
                    ..Default::default()
                },
                TagNode {
                    template_tag_uuid: "c".into(),
                    selected: true,
                    children: vec![TagNode {
                        template_tag_uuid: "d".into(),
                        selected: true,
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            ],
            ..Default::default()
        }];

        let mut out = Vec::new();
        selected_tag_uuids(&tree, &mut out);
        assert_eq!(out, vec!["b", "c", "d"]);
    }

    #[test]
    fn unselected_new_record_has_no_uuid() {
        let doc: Dataset = serde_json::from_value(serde_json::json!({
            "record_uuid": "01890a5d-ac96-774b-bcce-b302099a8057",
            "records": [
                {"template_uuid": "01890a5d-ac96-774b-bcce-b30209000009"}
            ]
        }))
        .unwrap();
        assert!(doc.records[0].record_uuid.is_none());
    }
}
