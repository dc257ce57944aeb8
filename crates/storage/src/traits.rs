use datapub_core::{field_value::FieldValue, ids::*, kind::FieldKind};

use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct DatatypeRow {
    pub datatype_id: DatatypeId,
    /// Master template this datatype derives from; masters reference themselves.
    pub template_uuid: TemplateId,
    pub template_group: GroupId,
    pub name: String,
    pub is_master: bool,
    pub created_at: i64,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TreeEdgeRow {
    pub ancestor_id: DatatypeId,
    pub descendant_id: DatatypeId,
    pub is_link: bool,
}

#[derive(Debug, Clone)]
pub struct FieldRow {
    pub field_id: FieldId,
    pub datatype_id: DatatypeId,
    pub template_field_uuid: TemplateFieldId,
    pub kind: FieldKind,
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct OptionRow {
    pub option_id: OptionId,
    pub field_id: FieldId,
    pub name: String,
    pub parent_id: Option<OptionId>,
    pub user_created: bool,
    pub display_order: i64,
    pub created_at: i64,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct RecordRow {
    pub record_id: RecordId,
    pub datatype_id: DatatypeId,
    pub parent_id: RecordId,
    pub grandparent_id: RecordId,
    pub created_at: i64,
    pub created_by: UserId,
    pub updated_at: i64,
    pub updated_by: UserId,
    pub deleted: bool,
}

impl RecordRow {
    pub fn is_top_level(&self) -> bool {
        self.record_id == self.parent_id
    }
}

#[derive(Debug, Clone)]
pub struct ContainerRow {
    pub container_id: ContainerId,
    pub record_id: RecordId,
    pub field_id: FieldId,
    pub created_at: i64,
    pub created_by: UserId,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct ValueRow {
    pub value_id: ValueId,
    pub container_id: ContainerId,
    pub value: FieldValue,
    pub created_at: i64,
    pub created_by: UserId,
    pub updated_at: i64,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct SelectionRow {
    pub selection_id: SelectionId,
    pub container_id: ContainerId,
    pub option_id: OptionId,
    pub created_at: i64,
    pub created_by: UserId,
    pub updated_at: i64,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct LinkRow {
    pub link_id: LinkId,
    pub ancestor_record_id: RecordId,
    pub descendant_record_id: RecordId,
    pub created_at: i64,
    pub created_by: UserId,
    pub deleted: bool,
}

/// Live selection count for one option, as reported by field statistics.
#[derive(Debug, Clone)]
pub struct OptionCount {
    pub option_id: OptionId,
    pub name: String,
    pub count: u64,
}

/// One record removed by a cascade delete, with the datatype it belonged to.
#[derive(Debug, Clone, Copy)]
pub struct DeletedRecord {
    pub record_id: RecordId,
    pub datatype_id: DatatypeId,
}

pub trait Storage {
    // Users
    fn insert_user(&mut self, row: &UserRow) -> Result<(), StorageError>;
    fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>, StorageError>;

    // Datatypes and the ancestor/descendant tree
    fn insert_datatype(&mut self, row: &DatatypeRow) -> Result<(), StorageError>;
    fn get_datatype(&self, datatype_id: DatatypeId) -> Result<Option<DatatypeRow>, StorageError>;
    fn get_master_datatype(
        &self,
        template_uuid: TemplateId,
    ) -> Result<Option<DatatypeRow>, StorageError>;
    fn get_datatype_in_group(
        &self,
        template_uuid: TemplateId,
        template_group: GroupId,
    ) -> Result<Option<DatatypeRow>, StorageError>;
    fn insert_tree_edge(&mut self, edge: &TreeEdgeRow) -> Result<(), StorageError>;
    fn get_tree_edge(
        &self,
        ancestor_id: DatatypeId,
        descendant_id: DatatypeId,
    ) -> Result<Option<TreeEdgeRow>, StorageError>;
    fn get_tree_children(&self, ancestor_id: DatatypeId) -> Result<Vec<TreeEdgeRow>, StorageError>;

    // Fields and options
    fn insert_field(&mut self, row: &FieldRow) -> Result<(), StorageError>;
    fn get_field(&self, field_id: FieldId) -> Result<Option<FieldRow>, StorageError>;
    fn resolve_field(
        &self,
        template_field_uuid: TemplateFieldId,
        datatype_id: DatatypeId,
    ) -> Result<Option<FieldRow>, StorageError>;
    fn get_fields_for_datatype(
        &self,
        datatype_id: DatatypeId,
    ) -> Result<Vec<FieldRow>, StorageError>;
    fn resolve_fields_by_template(
        &self,
        template_field_uuid: TemplateFieldId,
    ) -> Result<Vec<FieldRow>, StorageError>;
    fn insert_option(&mut self, row: &OptionRow) -> Result<(), StorageError>;
    fn get_option(&self, option_id: OptionId) -> Result<Option<OptionRow>, StorageError>;
    fn get_option_in_field(
        &self,
        option_id: OptionId,
        field_id: FieldId,
    ) -> Result<Option<OptionRow>, StorageError>;
    fn get_options_for_field(&self, field_id: FieldId) -> Result<Vec<OptionRow>, StorageError>;

    // Records
    fn insert_record(&mut self, row: &RecordRow) -> Result<(), StorageError>;
    fn get_record(&self, record_id: RecordId) -> Result<Option<RecordRow>, StorageError>;
    fn get_child_records(&self, parent_id: RecordId) -> Result<Vec<RecordRow>, StorageError>;
    fn get_records_for_datatype(
        &self,
        datatype_id: DatatypeId,
    ) -> Result<Vec<RecordRow>, StorageError>;
    fn touch_record(
        &mut self,
        record_id: RecordId,
        user_id: UserId,
        at_ms: i64,
    ) -> Result<(), StorageError>;
    /// Soft-delete a record and everything it owns: descendant records via
    /// the lineage chain, their containers, value rows, selections, and any
    /// link junctions touching the subtree. Linked records themselves are
    /// left alone. Returns every deleted record with its datatype.
    fn delete_record_tree(
        &mut self,
        record_id: RecordId,
        user_id: UserId,
        at_ms: i64,
    ) -> Result<Vec<DeletedRecord>, StorageError>;

    // Containers, value rows, selections
    fn insert_container(&mut self, row: &ContainerRow) -> Result<(), StorageError>;
    fn get_container(
        &self,
        record_id: RecordId,
        field_id: FieldId,
    ) -> Result<Option<ContainerRow>, StorageError>;
    fn insert_value(&mut self, row: &ValueRow) -> Result<(), StorageError>;
    fn get_value(&self, value_id: ValueId) -> Result<Option<ValueRow>, StorageError>;
    fn get_live_value(
        &self,
        container_id: ContainerId,
    ) -> Result<Option<ValueRow>, StorageError>;
    fn supersede_value(&mut self, value_id: ValueId, at_ms: i64) -> Result<(), StorageError>;
    fn insert_selection(&mut self, row: &SelectionRow) -> Result<(), StorageError>;
    fn get_selection(
        &self,
        selection_id: SelectionId,
    ) -> Result<Option<SelectionRow>, StorageError>;
    fn get_live_selection(
        &self,
        container_id: ContainerId,
        option_id: OptionId,
    ) -> Result<Option<SelectionRow>, StorageError>;
    fn get_live_selections(
        &self,
        container_id: ContainerId,
    ) -> Result<Vec<SelectionRow>, StorageError>;
    fn delete_selection(
        &mut self,
        selection_id: SelectionId,
        at_ms: i64,
    ) -> Result<(), StorageError>;

    // Record links
    fn insert_link(&mut self, row: &LinkRow) -> Result<(), StorageError>;
    fn get_links_from(&self, record_id: RecordId) -> Result<Vec<LinkRow>, StorageError>;
    /// Junction rows pointing at a record, soft-deleted ones included, so
    /// linking ancestors can be found after a cascade already removed the
    /// junctions.
    fn get_links_to(&self, record_id: RecordId) -> Result<Vec<LinkRow>, StorageError>;

    // Statistics
    fn count_selections_by_option(
        &self,
        field_id: FieldId,
    ) -> Result<Vec<OptionCount>, StorageError>;
}
