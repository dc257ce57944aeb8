use rusqlite::{Connection, OptionalExtension, params};

use datapub_core::{field_value::FieldValue, ids::*, kind::FieldKind};

use crate::error::StorageError;
use crate::traits::{
    ContainerRow, DatatypeRow, DeletedRecord, FieldRow, LinkRow, OptionCount, OptionRow,
    RecordRow, SelectionRow, Storage, TreeEdgeRow, UserRow, ValueRow,
};

/// Convert Vec<u8> to a fixed-size id array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

fn read_user(row: &rusqlite::Row) -> Result<UserRow, StorageError> {
    Ok(UserRow {
        user_id: UserId::from_bytes(to_array::<16>(row.get(0)?, "user_id")?),
        email: row.get(1)?,
        display_name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn read_datatype(row: &rusqlite::Row) -> Result<DatatypeRow, StorageError> {
    Ok(DatatypeRow {
        datatype_id: DatatypeId::from_bytes(to_array::<16>(row.get(0)?, "datatype_id")?),
        template_uuid: TemplateId::from_bytes(to_array::<16>(row.get(1)?, "template_uuid")?),
        template_group: GroupId::from_bytes(to_array::<16>(row.get(2)?, "template_group")?),
        name: row.get(3)?,
        is_master: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        deleted: row.get::<_, Option<i64>>(6)?.is_some(),
    })
}

fn read_field(row: &rusqlite::Row) -> Result<FieldRow, StorageError> {
    let kind: String = row.get(3)?;
    Ok(FieldRow {
        field_id: FieldId::from_bytes(to_array::<16>(row.get(0)?, "field_id")?),
        datatype_id: DatatypeId::from_bytes(to_array::<16>(row.get(1)?, "datatype_id")?),
        template_field_uuid: TemplateFieldId::from_bytes(to_array::<16>(
            row.get(2)?,
            "template_field_uuid",
        )?),
        kind: FieldKind::parse(&kind)?,
        name: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn read_option(row: &rusqlite::Row) -> Result<OptionRow, StorageError> {
    let parent: Option<Vec<u8>> = row.get(3)?;
    Ok(OptionRow {
        option_id: OptionId::from_bytes(to_array::<16>(row.get(0)?, "option_id")?),
        field_id: FieldId::from_bytes(to_array::<16>(row.get(1)?, "field_id")?),
        name: row.get(2)?,
        parent_id: match parent {
            Some(bytes) => Some(OptionId::from_bytes(to_array::<16>(bytes, "parent_id")?)),
            None => None,
        },
        user_created: row.get::<_, i64>(4)? != 0,
        display_order: row.get(5)?,
        created_at: row.get(6)?,
        deleted: row.get::<_, Option<i64>>(7)?.is_some(),
    })
}

fn read_record(row: &rusqlite::Row) -> Result<RecordRow, StorageError> {
    Ok(RecordRow {
        record_id: RecordId::from_bytes(to_array::<16>(row.get(0)?, "record_id")?),
        datatype_id: DatatypeId::from_bytes(to_array::<16>(row.get(1)?, "datatype_id")?),
        parent_id: RecordId::from_bytes(to_array::<16>(row.get(2)?, "parent_id")?),
        grandparent_id: RecordId::from_bytes(to_array::<16>(row.get(3)?, "grandparent_id")?),
        created_at: row.get(4)?,
        created_by: UserId::from_bytes(to_array::<16>(row.get(5)?, "created_by")?),
        updated_at: row.get(6)?,
        updated_by: UserId::from_bytes(to_array::<16>(row.get(7)?, "updated_by")?),
        deleted: row.get::<_, Option<i64>>(8)?.is_some(),
    })
}

fn read_container(row: &rusqlite::Row) -> Result<ContainerRow, StorageError> {
    Ok(ContainerRow {
        container_id: ContainerId::from_bytes(to_array::<16>(row.get(0)?, "container_id")?),
        record_id: RecordId::from_bytes(to_array::<16>(row.get(1)?, "record_id")?),
        field_id: FieldId::from_bytes(to_array::<16>(row.get(2)?, "field_id")?),
        created_at: row.get(3)?,
        created_by: UserId::from_bytes(to_array::<16>(row.get(4)?, "created_by")?),
        deleted: row.get::<_, Option<i64>>(5)?.is_some(),
    })
}

fn read_value(row: &rusqlite::Row) -> Result<ValueRow, StorageError> {
    let blob: Vec<u8> = row.get(2)?;
    Ok(ValueRow {
        value_id: ValueId::from_bytes(to_array::<16>(row.get(0)?, "value_id")?),
        container_id: ContainerId::from_bytes(to_array::<16>(row.get(1)?, "container_id")?),
        value: FieldValue::from_msgpack(&blob)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        created_at: row.get(3)?,
        created_by: UserId::from_bytes(to_array::<16>(row.get(4)?, "created_by")?),
        updated_at: row.get(5)?,
        deleted: row.get::<_, Option<i64>>(6)?.is_some(),
    })
}

fn read_selection(row: &rusqlite::Row) -> Result<SelectionRow, StorageError> {
    Ok(SelectionRow {
        selection_id: SelectionId::from_bytes(to_array::<16>(row.get(0)?, "selection_id")?),
        container_id: ContainerId::from_bytes(to_array::<16>(row.get(1)?, "container_id")?),
        option_id: OptionId::from_bytes(to_array::<16>(row.get(2)?, "option_id")?),
        created_at: row.get(3)?,
        created_by: UserId::from_bytes(to_array::<16>(row.get(4)?, "created_by")?),
        updated_at: row.get(5)?,
        deleted: row.get::<_, Option<i64>>(6)?.is_some(),
    })
}

fn read_link(row: &rusqlite::Row) -> Result<LinkRow, StorageError> {
    Ok(LinkRow {
        link_id: LinkId::from_bytes(to_array::<16>(row.get(0)?, "link_id")?),
        ancestor_record_id: RecordId::from_bytes(to_array::<16>(
            row.get(1)?,
            "ancestor_record_id",
        )?),
        descendant_record_id: RecordId::from_bytes(to_array::<16>(
            row.get(2)?,
            "descendant_record_id",
        )?),
        created_at: row.get(3)?,
        created_by: UserId::from_bytes(to_array::<16>(row.get(4)?, "created_by")?),
        deleted: row.get::<_, Option<i64>>(5)?.is_some(),
    })
}

const USER_COLS: &str = "user_id, email, display_name, created_at";
const DATATYPE_COLS: &str =
    "datatype_id, template_uuid, template_group, name, is_master, created_at, deleted_at";
const FIELD_COLS: &str = "field_id, datatype_id, template_field_uuid, kind, name, created_at";
const OPTION_COLS: &str =
    "option_id, field_id, name, parent_id, user_created, display_order, created_at, deleted_at";
const RECORD_COLS: &str = "record_id, datatype_id, parent_id, grandparent_id, created_at, \
     created_by, updated_at, updated_by, deleted_at";
const CONTAINER_COLS: &str = "container_id, record_id, field_id, created_at, created_by, deleted_at";
const VALUE_COLS: &str =
    "value_id, container_id, value, created_at, created_by, updated_at, deleted_at";
const SELECTION_COLS: &str =
    "selection_id, container_id, option_id, created_at, created_by, updated_at, deleted_at";
const LINK_COLS: &str =
    "link_id, ancestor_record_id, descendant_record_id, created_at, created_by, deleted_at";

impl Storage for SqliteStorage {
    fn insert_user(&mut self, row: &UserRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO users (user_id, email, display_name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                row.user_id.as_bytes().as_slice(),
                row.email,
                row.display_name,
                row.created_at,
            ],
        )?;
        Ok(())
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE email = ?1"),
                params![email],
                |row| Ok(read_user(row)),
            )
            .optional()?
            .transpose()
    }

    fn insert_datatype(&mut self, row: &DatatypeRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO datatypes (datatype_id, template_uuid, template_group, name, is_master, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.datatype_id.as_bytes().as_slice(),
                row.template_uuid.as_bytes().as_slice(),
                row.template_group.as_bytes().as_slice(),
                row.name,
                row.is_master as i64,
                row.created_at,
            ],
        )?;
        Ok(())
    }

    fn get_datatype(&self, datatype_id: DatatypeId) -> Result<Option<DatatypeRow>, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {DATATYPE_COLS} FROM datatypes WHERE datatype_id = ?1"),
                params![datatype_id.as_bytes().as_slice()],
                |row| Ok(read_datatype(row)),
            )
            .optional()?
            .transpose()
    }

    fn get_master_datatype(
        &self,
        template_uuid: TemplateId,
    ) -> Result<Option<DatatypeRow>, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {DATATYPE_COLS} FROM datatypes \
                     WHERE datatype_id = ?1 AND is_master = 1 AND deleted_at IS NULL"
                ),
                params![template_uuid.as_bytes().as_slice()],
                |row| Ok(read_datatype(row)),
            )
            .optional()?
            .transpose()
    }

    fn get_datatype_in_group(
        &self,
        template_uuid: TemplateId,
        template_group: GroupId,
    ) -> Result<Option<DatatypeRow>, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {DATATYPE_COLS} FROM datatypes \
                     WHERE template_uuid = ?1 AND template_group = ?2 \
                     AND is_master = 0 AND deleted_at IS NULL"
                ),
                params![
                    template_uuid.as_bytes().as_slice(),
                    template_group.as_bytes().as_slice()
                ],
                |row| Ok(read_datatype(row)),
            )
            .optional()?
            .transpose()
    }

    fn insert_tree_edge(&mut self, edge: &TreeEdgeRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO datatype_tree (ancestor_id, descendant_id, is_link) VALUES (?1, ?2, ?3)",
            params![
                edge.ancestor_id.as_bytes().as_slice(),
                edge.descendant_id.as_bytes().as_slice(),
                edge.is_link as i64,
            ],
        )?;
        Ok(())
    }

    fn get_tree_edge(
        &self,
        ancestor_id: DatatypeId,
        descendant_id: DatatypeId,
    ) -> Result<Option<TreeEdgeRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT is_link FROM datatype_tree WHERE ancestor_id = ?1 AND descendant_id = ?2",
                params![
                    ancestor_id.as_bytes().as_slice(),
                    descendant_id.as_bytes().as_slice()
                ],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(row.map(|is_link| TreeEdgeRow {
            ancestor_id,
            descendant_id,
            is_link: is_link != 0,
        }))
    }

    fn get_tree_children(&self, ancestor_id: DatatypeId) -> Result<Vec<TreeEdgeRow>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT descendant_id, is_link FROM datatype_tree WHERE ancestor_id = ?1")?;
        let rows = stmt
            .query_map(params![ancestor_id.as_bytes().as_slice()], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(descendant, is_link)| {
                Ok(TreeEdgeRow {
                    ancestor_id,
                    descendant_id: DatatypeId::from_bytes(to_array::<16>(
                        descendant,
                        "descendant_id",
                    )?),
                    is_link: is_link != 0,
                })
            })
            .collect()
    }

    fn insert_field(&mut self, row: &FieldRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO fields (field_id, datatype_id, template_field_uuid, kind, name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.field_id.as_bytes().as_slice(),
                row.datatype_id.as_bytes().as_slice(),
                row.template_field_uuid.as_bytes().as_slice(),
                row.kind.as_str(),
                row.name,
                row.created_at,
            ],
        )?;
        Ok(())
    }

    fn get_field(&self, field_id: FieldId) -> Result<Option<FieldRow>, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {FIELD_COLS} FROM fields WHERE field_id = ?1 AND deleted_at IS NULL"),
                params![field_id.as_bytes().as_slice()],
                |row| Ok(read_field(row)),
            )
            .optional()?
            .transpose()
    }

    fn resolve_field(
        &self,
        template_field_uuid: TemplateFieldId,
        datatype_id: DatatypeId,
    ) -> Result<Option<FieldRow>, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {FIELD_COLS} FROM fields \
                     WHERE template_field_uuid = ?1 AND datatype_id = ?2 AND deleted_at IS NULL"
                ),
                params![
                    template_field_uuid.as_bytes().as_slice(),
                    datatype_id.as_bytes().as_slice()
                ],
                |row| Ok(read_field(row)),
            )
            .optional()?
            .transpose()
    }

    fn get_fields_for_datatype(
        &self,
        datatype_id: DatatypeId,
    ) -> Result<Vec<FieldRow>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FIELD_COLS} FROM fields \
             WHERE datatype_id = ?1 AND deleted_at IS NULL ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![datatype_id.as_bytes().as_slice()], |row| {
                Ok(read_field(row))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    fn resolve_fields_by_template(
        &self,
        template_field_uuid: TemplateFieldId,
    ) -> Result<Vec<FieldRow>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FIELD_COLS} FROM fields \
             WHERE template_field_uuid = ?1 AND deleted_at IS NULL"
        ))?;
        let rows = stmt
            .query_map(params![template_field_uuid.as_bytes().as_slice()], |row| {
                Ok(read_field(row))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    fn insert_option(&mut self, row: &OptionRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO options (option_id, field_id, name, parent_id, user_created, display_order, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.option_id.as_bytes().as_slice(),
                row.field_id.as_bytes().as_slice(),
                row.name,
                row.parent_id.as_ref().map(|p| p.as_bytes().as_slice()),
                row.user_created as i64,
                row.display_order,
                row.created_at,
            ],
        )?;
        Ok(())
    }

    fn get_option(&self, option_id: OptionId) -> Result<Option<OptionRow>, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {OPTION_COLS} FROM options WHERE option_id = ?1 AND deleted_at IS NULL"
                ),
                params![option_id.as_bytes().as_slice()],
                |row| Ok(read_option(row)),
            )
            .optional()?
            .transpose()
    }

    fn get_option_in_field(
        &self,
        option_id: OptionId,
        field_id: FieldId,
    ) -> Result<Option<OptionRow>, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {OPTION_COLS} FROM options \
                     WHERE option_id = ?1 AND field_id = ?2 AND deleted_at IS NULL"
                ),
                params![
                    option_id.as_bytes().as_slice(),
                    field_id.as_bytes().as_slice()
                ],
                |row| Ok(read_option(row)),
            )
            .optional()?
            .transpose()
    }

    fn get_options_for_field(&self, field_id: FieldId) -> Result<Vec<OptionRow>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OPTION_COLS} FROM options \
             WHERE field_id = ?1 AND deleted_at IS NULL ORDER BY display_order, created_at"
        ))?;
        let rows = stmt
            .query_map(params![field_id.as_bytes().as_slice()], |row| {
                Ok(read_option(row))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    fn insert_record(&mut self, row: &RecordRow) -> Result<(), StorageError> {
        let result = self.conn.execute(
            "INSERT INTO records (record_id, datatype_id, parent_id, grandparent_id, created_at, created_by, updated_at, updated_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.record_id.as_bytes().as_slice(),
                row.datatype_id.as_bytes().as_slice(),
                row.parent_id.as_bytes().as_slice(),
                row.grandparent_id.as_bytes().as_slice(),
                row.created_at,
                row.created_by.as_bytes().as_slice(),
                row.updated_at,
                row.updated_by.as_bytes().as_slice(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::RecordCollision {
                    record_id: row.record_id.to_string(),
                })
            }
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    fn get_record(&self, record_id: RecordId) -> Result<Option<RecordRow>, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {RECORD_COLS} FROM records WHERE record_id = ?1"),
                params![record_id.as_bytes().as_slice()],
                |row| Ok(read_record(row)),
            )
            .optional()?
            .transpose()
    }

    fn get_child_records(&self, parent_id: RecordId) -> Result<Vec<RecordRow>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLS} FROM records \
             WHERE parent_id = ?1 AND record_id != parent_id AND deleted_at IS NULL \
             ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![parent_id.as_bytes().as_slice()], |row| {
                Ok(read_record(row))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    fn get_records_for_datatype(
        &self,
        datatype_id: DatatypeId,
    ) -> Result<Vec<RecordRow>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLS} FROM records \
             WHERE datatype_id = ?1 AND deleted_at IS NULL ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![datatype_id.as_bytes().as_slice()], |row| {
                Ok(read_record(row))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    fn touch_record(
        &mut self,
        record_id: RecordId,
        user_id: UserId,
        at_ms: i64,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE records SET updated_at = ?1, updated_by = ?2 WHERE record_id = ?3",
            params![
                at_ms,
                user_id.as_bytes().as_slice(),
                record_id.as_bytes().as_slice()
            ],
        )?;
        Ok(())
    }

    fn delete_record_tree(
        &mut self,
        record_id: RecordId,
        user_id: UserId,
        at_ms: i64,
    ) -> Result<Vec<DeletedRecord>, StorageError> {
        // Owned descendants follow the parent chain; linked records are roots
        // of their own trees (parent = self) and are never reached here.
        let mut stmt = self.conn.prepare(
            "WITH RECURSIVE subtree(record_id, datatype_id) AS (
                SELECT record_id, datatype_id FROM records
                    WHERE record_id = ?1 AND deleted_at IS NULL
                UNION ALL
                SELECT r.record_id, r.datatype_id FROM records r
                    JOIN subtree s ON r.parent_id = s.record_id
                    WHERE r.record_id != r.parent_id AND r.deleted_at IS NULL
            )
            SELECT record_id, datatype_id FROM subtree",
        )?;
        let subtree: Vec<(Vec<u8>, Vec<u8>)> = stmt
            .query_map(params![record_id.as_bytes().as_slice()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut deleted = Vec::new();
        let tx = self.conn.transaction()?;
        for (rid, dt) in &subtree {
            tx.execute(
                "UPDATE selections SET deleted_at = ?1 WHERE deleted_at IS NULL AND container_id IN
                    (SELECT container_id FROM containers WHERE record_id = ?2)",
                params![at_ms, rid.as_slice()],
            )?;
            tx.execute(
                "UPDATE field_values SET deleted_at = ?1 WHERE deleted_at IS NULL AND container_id IN
                    (SELECT container_id FROM containers WHERE record_id = ?2)",
                params![at_ms, rid.as_slice()],
            )?;
            tx.execute(
                "UPDATE containers SET deleted_at = ?1 WHERE deleted_at IS NULL AND record_id = ?2",
                params![at_ms, rid.as_slice()],
            )?;
            tx.execute(
                "UPDATE record_links SET deleted_at = ?1 WHERE deleted_at IS NULL
                    AND (ancestor_record_id = ?2 OR descendant_record_id = ?2)",
                params![at_ms, rid.as_slice()],
            )?;
            tx.execute(
                "UPDATE records SET deleted_at = ?1, deleted_by = ?2 WHERE record_id = ?3",
                params![at_ms, user_id.as_bytes().as_slice(), rid.as_slice()],
            )?;
            deleted.push(DeletedRecord {
                record_id: RecordId::from_bytes(to_array::<16>(rid.clone(), "record_id")?),
                datatype_id: DatatypeId::from_bytes(to_array::<16>(dt.clone(), "datatype_id")?),
            });
        }
        tx.commit()?;

        Ok(deleted)
    }

    fn insert_container(&mut self, row: &ContainerRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO containers (container_id, record_id, field_id, created_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.container_id.as_bytes().as_slice(),
                row.record_id.as_bytes().as_slice(),
                row.field_id.as_bytes().as_slice(),
                row.created_at,
                row.created_by.as_bytes().as_slice(),
            ],
        )?;
        Ok(())
    }

    fn get_container(
        &self,
        record_id: RecordId,
        field_id: FieldId,
    ) -> Result<Option<ContainerRow>, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {CONTAINER_COLS} FROM containers \
                     WHERE record_id = ?1 AND field_id = ?2 AND deleted_at IS NULL"
                ),
                params![
                    record_id.as_bytes().as_slice(),
                    field_id.as_bytes().as_slice()
                ],
                |row| Ok(read_container(row)),
            )
            .optional()?
            .transpose()
    }

    fn insert_value(&mut self, row: &ValueRow) -> Result<(), StorageError> {
        let blob = row
            .value
            .to_msgpack()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO field_values (value_id, container_id, value, created_at, created_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.value_id.as_bytes().as_slice(),
                row.container_id.as_bytes().as_slice(),
                blob,
                row.created_at,
                row.created_by.as_bytes().as_slice(),
                row.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_value(&self, value_id: ValueId) -> Result<Option<ValueRow>, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {VALUE_COLS} FROM field_values WHERE value_id = ?1"),
                params![value_id.as_bytes().as_slice()],
                |row| Ok(read_value(row)),
            )
            .optional()?
            .transpose()
    }

    fn get_live_value(
        &self,
        container_id: ContainerId,
    ) -> Result<Option<ValueRow>, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {VALUE_COLS} FROM field_values \
                     WHERE container_id = ?1 AND deleted_at IS NULL \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![container_id.as_bytes().as_slice()],
                |row| Ok(read_value(row)),
            )
            .optional()?
            .transpose()
    }

    fn supersede_value(&mut self, value_id: ValueId, at_ms: i64) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE field_values SET deleted_at = ?1 WHERE value_id = ?2",
            params![at_ms, value_id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    fn insert_selection(&mut self, row: &SelectionRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO selections (selection_id, container_id, option_id, created_at, created_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.selection_id.as_bytes().as_slice(),
                row.container_id.as_bytes().as_slice(),
                row.option_id.as_bytes().as_slice(),
                row.created_at,
                row.created_by.as_bytes().as_slice(),
                row.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_selection(
        &self,
        selection_id: SelectionId,
    ) -> Result<Option<SelectionRow>, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {SELECTION_COLS} FROM selections WHERE selection_id = ?1"),
                params![selection_id.as_bytes().as_slice()],
                |row| Ok(read_selection(row)),
            )
            .optional()?
            .transpose()
    }

    fn get_live_selection(
        &self,
        container_id: ContainerId,
        option_id: OptionId,
    ) -> Result<Option<SelectionRow>, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {SELECTION_COLS} FROM selections \
                     WHERE container_id = ?1 AND option_id = ?2 AND deleted_at IS NULL"
                ),
                params![
                    container_id.as_bytes().as_slice(),
                    option_id.as_bytes().as_slice()
                ],
                |row| Ok(read_selection(row)),
            )
            .optional()?
            .transpose()
    }

    fn get_live_selections(
        &self,
        container_id: ContainerId,
    ) -> Result<Vec<SelectionRow>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECTION_COLS} FROM selections \
             WHERE container_id = ?1 AND deleted_at IS NULL ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![container_id.as_bytes().as_slice()], |row| {
                Ok(read_selection(row))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    fn delete_selection(
        &mut self,
        selection_id: SelectionId,
        at_ms: i64,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE selections SET deleted_at = ?1 WHERE selection_id = ?2",
            params![at_ms, selection_id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    fn insert_link(&mut self, row: &LinkRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO record_links (link_id, ancestor_record_id, descendant_record_id, created_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.link_id.as_bytes().as_slice(),
                row.ancestor_record_id.as_bytes().as_slice(),
                row.descendant_record_id.as_bytes().as_slice(),
                row.created_at,
                row.created_by.as_bytes().as_slice(),
            ],
        )?;
        Ok(())
    }

    fn get_links_from(&self, record_id: RecordId) -> Result<Vec<LinkRow>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LINK_COLS} FROM record_links \
             WHERE ancestor_record_id = ?1 AND deleted_at IS NULL ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![record_id.as_bytes().as_slice()], |row| {
                Ok(read_link(row))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    fn get_links_to(&self, record_id: RecordId) -> Result<Vec<LinkRow>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LINK_COLS} FROM record_links \
             WHERE descendant_record_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![record_id.as_bytes().as_slice()], |row| {
                Ok(read_link(row))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    fn count_selections_by_option(
        &self,
        field_id: FieldId,
    ) -> Result<Vec<OptionCount>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT o.option_id, o.name, COUNT(r.record_id)
             FROM options o
             LEFT JOIN selections s ON s.option_id = o.option_id AND s.deleted_at IS NULL
             LEFT JOIN containers c ON c.container_id = s.container_id AND c.deleted_at IS NULL
             LEFT JOIN records r ON r.record_id = c.record_id AND r.deleted_at IS NULL
             WHERE o.field_id = ?1 AND o.deleted_at IS NULL
             GROUP BY o.option_id, o.name
             ORDER BY o.display_order, o.created_at",
        )?;
        let rows = stmt
            .query_map(params![field_id.as_bytes().as_slice()], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, name, count)| {
                Ok(OptionCount {
                    option_id: OptionId::from_bytes(to_array::<16>(id, "option_id")?),
                    name,
                    count,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> i64 {
        1_700_000_000_000
    }

    fn seed_record(storage: &mut SqliteStorage) -> (RecordRow, FieldRow, UserId) {
        let user = UserId::new();
        let datatype_id = DatatypeId::new();
        storage
            .insert_datatype(&DatatypeRow {
                datatype_id,
                template_uuid: TemplateId::from_uuid(*datatype_id.as_uuid()),
                template_group: GroupId::new(),
                name: "sample".into(),
                is_master: false,
                created_at: now(),
                deleted: false,
            })
            .unwrap();
        let field = FieldRow {
            field_id: FieldId::new(),
            datatype_id,
            template_field_uuid: TemplateFieldId::new(),
            kind: FieldKind::Text,
            name: "mineral".into(),
            created_at: now(),
        };
        storage.insert_field(&field).unwrap();
        let record_id = RecordId::new();
        let record = RecordRow {
            record_id,
            datatype_id,
            parent_id: record_id,
            grandparent_id: record_id,
            created_at: now(),
            created_by: user,
            updated_at: now(),
            updated_by: user,
            deleted: false,
        };
        storage.insert_record(&record).unwrap();
        (record, field, user)
    }

    #[test]
    fn value_rows_version_by_replacement() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let (record, field, user) = seed_record(&mut storage);

        let container = ContainerRow {
            container_id: ContainerId::new(),
            record_id: record.record_id,
            field_id: field.field_id,
            created_at: now(),
            created_by: user,
            deleted: false,
        };
        storage.insert_container(&container).unwrap();

        let first = ValueRow {
            value_id: ValueId::new(),
            container_id: container.container_id,
            value: FieldValue::Text("olivine".into()),
            created_at: now(),
            created_by: user,
            updated_at: now(),
            deleted: false,
        };
        storage.insert_value(&first).unwrap();
        storage.supersede_value(first.value_id, now() + 1).unwrap();

        let second = ValueRow {
            value_id: ValueId::new(),
            container_id: container.container_id,
            value: FieldValue::Text("pyroxene".into()),
            created_at: now() + 1,
            created_by: user,
            updated_at: now() + 1,
            deleted: false,
        };
        storage.insert_value(&second).unwrap();

        let live = storage.get_live_value(container.container_id).unwrap().unwrap();
        assert_eq!(live.value, FieldValue::Text("pyroxene".into()));

        // The superseded row is retained for history.
        let old = storage.get_value(first.value_id).unwrap().unwrap();
        assert!(old.deleted);
        assert_eq!(old.value, FieldValue::Text("olivine".into()));
    }

    #[test]
    fn delete_record_tree_cascades_to_owned_children_only() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let (parent, field, user) = seed_record(&mut storage);

        // Owned child.
        let child_id = RecordId::new();
        storage
            .insert_record(&RecordRow {
                record_id: child_id,
                datatype_id: parent.datatype_id,
                parent_id: parent.record_id,
                grandparent_id: parent.record_id,
                created_at: now(),
                created_by: user,
                updated_at: now(),
                updated_by: user,
                deleted: false,
            })
            .unwrap();

        // Linked record: own tree, junction row only.
        let linked_id = RecordId::new();
        storage
            .insert_record(&RecordRow {
                record_id: linked_id,
                datatype_id: parent.datatype_id,
                parent_id: linked_id,
                grandparent_id: linked_id,
                created_at: now(),
                created_by: user,
                updated_at: now(),
                updated_by: user,
                deleted: false,
            })
            .unwrap();
        storage
            .insert_link(&LinkRow {
                link_id: LinkId::new(),
                ancestor_record_id: parent.record_id,
                descendant_record_id: linked_id,
                created_at: now(),
                created_by: user,
                deleted: false,
            })
            .unwrap();

        // A value under the child.
        let container = ContainerRow {
            container_id: ContainerId::new(),
            record_id: child_id,
            field_id: field.field_id,
            created_at: now(),
            created_by: user,
            deleted: false,
        };
        storage.insert_container(&container).unwrap();
        let value = ValueRow {
            value_id: ValueId::new(),
            container_id: container.container_id,
            value: FieldValue::Integer(7),
            created_at: now(),
            created_by: user,
            updated_at: now(),
            deleted: false,
        };
        storage.insert_value(&value).unwrap();

        let deleted = storage
            .delete_record_tree(parent.record_id, user, now() + 5)
            .unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(deleted.iter().any(|d| d.record_id == parent.record_id));
        assert!(deleted.iter().any(|d| d.record_id == child_id));

        assert!(storage.get_record(parent.record_id).unwrap().unwrap().deleted);
        assert!(storage.get_record(child_id).unwrap().unwrap().deleted);
        assert!(storage.get_value(value.value_id).unwrap().unwrap().deleted);

        // The linked record survives; the junction row does not.
        assert!(!storage.get_record(linked_id).unwrap().unwrap().deleted);
        assert!(storage.get_links_from(parent.record_id).unwrap().is_empty());

        // The reverse lookup still sees the removed junction.
        let back = storage.get_links_to(linked_id).unwrap();
        assert_eq!(back.len(), 1);
        assert!(back[0].deleted);
        assert_eq!(back[0].ancestor_record_id, parent.record_id);
    }

    #[test]
    fn selection_lifecycle() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let (record, field, user) = seed_record(&mut storage);

        let option = OptionRow {
            option_id: OptionId::new(),
            field_id: field.field_id,
            name: "igneous".into(),
            parent_id: None,
            user_created: false,
            display_order: 0,
            created_at: now(),
            deleted: false,
        };
        storage.insert_option(&option).unwrap();

        let container = ContainerRow {
            container_id: ContainerId::new(),
            record_id: record.record_id,
            field_id: field.field_id,
            created_at: now(),
            created_by: user,
            deleted: false,
        };
        storage.insert_container(&container).unwrap();

        let selection = SelectionRow {
            selection_id: SelectionId::new(),
            container_id: container.container_id,
            option_id: option.option_id,
            created_at: now(),
            created_by: user,
            updated_at: now(),
            deleted: false,
        };
        storage.insert_selection(&selection).unwrap();

        assert!(
            storage
                .get_live_selection(container.container_id, option.option_id)
                .unwrap()
                .is_some()
        );

        let counts = storage.count_selections_by_option(field.field_id).unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].count, 1);

        storage
            .delete_selection(selection.selection_id, now() + 1)
            .unwrap();
        assert!(
            storage
                .get_live_selection(container.container_id, option.option_id)
                .unwrap()
                .is_none()
        );
    }
}
