use std::error::Error;

use uuid::Uuid;

use datapub_core::{
    Dataset, FieldEntry, FieldInput, FieldKind, OptionNode, TagNode, Submission, ids::*,
};
use datapub_engine::{ApiError, Engine, ReconcileOutcome};
use datapub_storage::{
    DatatypeRow, FieldRow, OptionRow, SqliteStorage, Storage, TreeEdgeRow, UserRow,
};

pub const CURATOR: &str = "curator@example.org";

const SEED_MS: i64 = 1_700_000_000_000;

/// In-memory engine plus schema-seeding helpers. Masters are built directly
/// through storage; datasets then go through the engine operations.
pub struct TestBed {
    pub engine: Engine,
}

impl TestBed {
    pub fn new() -> Result<Self, Box<dyn Error>> {
        // RUST_LOG=debug surfaces reconciliation decisions while a test runs.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let mut storage = SqliteStorage::open_in_memory()?;
        storage.insert_user(&UserRow {
            user_id: UserId::new(),
            email: CURATOR.into(),
            display_name: "Curator".into(),
            created_at: SEED_MS,
        })?;
        Ok(Self {
            engine: Engine::new(storage),
        })
    }

    pub fn add_user(&mut self, email: &str) -> Result<(), Box<dyn Error>> {
        self.engine.storage_mut().insert_user(&UserRow {
            user_id: UserId::new(),
            email: email.into(),
            display_name: String::new(),
            created_at: SEED_MS,
        })?;
        Ok(())
    }

    /// Create a master template datatype. Masters reference themselves.
    pub fn new_master(&mut self, name: &str) -> Result<Uuid, Box<dyn Error>> {
        let datatype_id = DatatypeId::new();
        self.engine.storage_mut().insert_datatype(&DatatypeRow {
            datatype_id,
            template_uuid: TemplateId::from_uuid(*datatype_id.as_uuid()),
            template_group: GroupId::from_uuid(*datatype_id.as_uuid()),
            name: name.into(),
            is_master: true,
            created_at: SEED_MS,
            deleted: false,
        })?;
        Ok(*datatype_id.as_uuid())
    }

    pub fn add_child_master(
        &mut self,
        parent: Uuid,
        name: &str,
        is_link: bool,
    ) -> Result<Uuid, Box<dyn Error>> {
        let child = self.new_master(name)?;
        self.engine.storage_mut().insert_tree_edge(&TreeEdgeRow {
            ancestor_id: DatatypeId::from_uuid(parent),
            descendant_id: DatatypeId::from_uuid(child),
            is_link,
        })?;
        Ok(child)
    }

    /// Add a field to a master; returns the template field uuid the document
    /// model addresses it by.
    pub fn add_field(
        &mut self,
        master: Uuid,
        name: &str,
        kind: FieldKind,
    ) -> Result<Uuid, Box<dyn Error>> {
        let template_field_uuid = TemplateFieldId::new();
        self.engine.storage_mut().insert_field(&FieldRow {
            field_id: FieldId::new(),
            datatype_id: DatatypeId::from_uuid(master),
            template_field_uuid,
            kind,
            name: name.into(),
            created_at: SEED_MS,
        })?;
        Ok(*template_field_uuid.as_uuid())
    }

    pub fn add_option(
        &mut self,
        master: Uuid,
        template_field: Uuid,
        name: &str,
    ) -> Result<Uuid, Box<dyn Error>> {
        self.insert_option(master, template_field, name, None)
    }

    pub fn add_tag(
        &mut self,
        master: Uuid,
        template_field: Uuid,
        name: &str,
        parent: Option<Uuid>,
    ) -> Result<Uuid, Box<dyn Error>> {
        self.insert_option(master, template_field, name, parent)
    }

    fn insert_option(
        &mut self,
        master: Uuid,
        template_field: Uuid,
        name: &str,
        parent: Option<Uuid>,
    ) -> Result<Uuid, Box<dyn Error>> {
        let field = self
            .engine
            .storage()
            .resolve_field(
                TemplateFieldId::from_uuid(template_field),
                DatatypeId::from_uuid(master),
            )?
            .ok_or("field not found")?;
        let option_id = OptionId::new();
        self.engine.storage_mut().insert_option(&OptionRow {
            option_id,
            field_id: field.field_id,
            name: name.into(),
            parent_id: parent.map(OptionId::from_uuid),
            user_created: false,
            display_order: 0,
            created_at: SEED_MS,
            deleted: false,
        })?;
        Ok(*option_id.as_uuid())
    }

    pub fn create_dataset(&mut self, template: Uuid) -> Result<Uuid, ApiError> {
        self.engine.create_dataset(template, CURATOR)
    }

    pub fn export(&mut self, record: Uuid) -> Result<Dataset, ApiError> {
        self.engine.export_record(record)
    }

    pub fn submit(&mut self, dataset: Dataset) -> Result<ReconcileOutcome, ApiError> {
        self.submit_as(dataset, CURATOR)
    }

    pub fn submit_as(
        &mut self,
        dataset: Dataset,
        email: &str,
    ) -> Result<ReconcileOutcome, ApiError> {
        self.engine.update_dataset(&Submission {
            dataset,
            user_email: email.into(),
        })
    }

    /// Concrete option (uuid, name) pairs of a record's field, in display
    /// order. Useful because clones mint their own option uuids.
    pub fn options_of(
        &self,
        record: Uuid,
        template_field: Uuid,
    ) -> Result<Vec<(Uuid, String)>, Box<dyn Error>> {
        let storage = self.engine.storage();
        let record = storage
            .get_record(RecordId::from_uuid(record))?
            .ok_or("record not found")?;
        let field = storage
            .resolve_field(
                TemplateFieldId::from_uuid(template_field),
                record.datatype_id,
            )?
            .ok_or("field not found")?;
        Ok(storage
            .get_options_for_field(field.field_id)?
            .into_iter()
            .map(|o| (*o.option_id.as_uuid(), o.name))
            .collect())
    }

    pub fn option_named(
        &self,
        record: Uuid,
        template_field: Uuid,
        name: &str,
    ) -> Result<Uuid, Box<dyn Error>> {
        self.options_of(record, template_field)?
            .into_iter()
            .find(|(_, n)| n == name)
            .map(|(uuid, _)| uuid)
            .ok_or_else(|| format!("option {name} not found").into())
    }
}

pub fn scalar_field(template_field: Uuid, value: serde_json::Value) -> FieldEntry {
    FieldEntry {
        template_field_uuid: template_field,
        value: Some(FieldInput::Scalar(value)),
        ..Default::default()
    }
}

pub fn boolean_field(template_field: Uuid, selected: bool) -> FieldEntry {
    FieldEntry {
        template_field_uuid: template_field,
        selected: Some(selected),
        ..Default::default()
    }
}

pub fn option_field(template_field: Uuid, options: &[&str]) -> FieldEntry {
    FieldEntry {
        template_field_uuid: template_field,
        value: Some(FieldInput::Options(
            options.iter().map(|o| OptionNode::new(*o)).collect(),
        )),
        ..Default::default()
    }
}

pub fn tag_field(template_field: Uuid, nodes: Vec<TagNode>) -> FieldEntry {
    FieldEntry {
        template_field_uuid: template_field,
        value: Some(FieldInput::Tags(nodes)),
        ..Default::default()
    }
}

pub fn selected_tag(uuid: impl Into<String>) -> TagNode {
    TagNode {
        selected: true,
        ..TagNode::new(uuid)
    }
}

/// Depth-first lookup of a tag node by display name.
pub fn find_tag<'a>(nodes: &'a [TagNode], name: &str) -> Option<&'a TagNode> {
    for node in nodes {
        if node.name.as_deref() == Some(name) {
            return Some(node);
        }
        if let Some(found) = find_tag(&node.children, name) {
            return Some(found);
        }
    }
    None
}

/// Flip the `selected` flag on the named tag; returns whether it was found.
pub fn set_tag_selected(nodes: &mut [TagNode], name: &str, selected: bool) -> bool {
    for node in nodes {
        if node.name.as_deref() == Some(name) {
            node.selected = selected;
            return true;
        }
        if set_tag_selected(&mut node.children, name, selected) {
            return true;
        }
    }
    false
}
