use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS users (
    user_id BLOB PRIMARY KEY CHECK (length(user_id) = 16),
    email TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);

-- Master templates are rows with is_master = 1; clones point back at the
-- master through template_uuid and share a template_group per instantiation.
CREATE TABLE IF NOT EXISTS datatypes (
    datatype_id BLOB PRIMARY KEY CHECK (length(datatype_id) = 16),
    template_uuid BLOB NOT NULL CHECK (length(template_uuid) = 16),
    template_group BLOB NOT NULL CHECK (length(template_group) = 16),
    name TEXT NOT NULL,
    is_master INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    created_by BLOB CHECK (created_by IS NULL OR length(created_by) = 16),
    deleted_at INTEGER,
    deleted_by BLOB CHECK (deleted_by IS NULL OR length(deleted_by) = 16)
);
CREATE INDEX IF NOT EXISTS idx_datatypes_group ON datatypes (template_uuid, template_group) WHERE deleted_at IS NULL;

-- Ancestor/descendant relation between datatypes; is_link distinguishes a
-- cross-tree link from an owned child.
CREATE TABLE IF NOT EXISTS datatype_tree (
    ancestor_id BLOB NOT NULL CHECK (length(ancestor_id) = 16),
    descendant_id BLOB NOT NULL CHECK (length(descendant_id) = 16),
    is_link INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (ancestor_id, descendant_id)
);

CREATE TABLE IF NOT EXISTS fields (
    field_id BLOB PRIMARY KEY CHECK (length(field_id) = 16),
    datatype_id BLOB NOT NULL CHECK (length(datatype_id) = 16),
    template_field_uuid BLOB NOT NULL CHECK (length(template_field_uuid) = 16),
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_fields_lookup ON fields (template_field_uuid, datatype_id) WHERE deleted_at IS NULL;

-- Radio options and tags share this table; tags carry a parent_id forming a
-- per-field tree. user_created marks options provisioned at data-entry time.
CREATE TABLE IF NOT EXISTS options (
    option_id BLOB PRIMARY KEY CHECK (length(option_id) = 16),
    field_id BLOB NOT NULL CHECK (length(field_id) = 16),
    name TEXT NOT NULL,
    parent_id BLOB CHECK (parent_id IS NULL OR length(parent_id) = 16),
    user_created INTEGER NOT NULL DEFAULT 0,
    display_order INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    created_by BLOB CHECK (created_by IS NULL OR length(created_by) = 16),
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_options_field ON options (field_id) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS records (
    record_id BLOB PRIMARY KEY CHECK (length(record_id) = 16),
    datatype_id BLOB NOT NULL CHECK (length(datatype_id) = 16),
    parent_id BLOB NOT NULL CHECK (length(parent_id) = 16),
    grandparent_id BLOB NOT NULL CHECK (length(grandparent_id) = 16),
    created_at INTEGER NOT NULL,
    created_by BLOB NOT NULL CHECK (length(created_by) = 16),
    updated_at INTEGER NOT NULL,
    updated_by BLOB NOT NULL CHECK (length(updated_by) = 16),
    deleted_at INTEGER,
    deleted_by BLOB CHECK (deleted_by IS NULL OR length(deleted_by) = 16)
);
CREATE INDEX IF NOT EXISTS idx_records_parent ON records (parent_id) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_records_datatype ON records (datatype_id) WHERE deleted_at IS NULL;

-- One container per (record, field) pair; value rows and selections hang off
-- it, so cascade-deleting a record only needs to mark containers and below.
CREATE TABLE IF NOT EXISTS containers (
    container_id BLOB PRIMARY KEY CHECK (length(container_id) = 16),
    record_id BLOB NOT NULL CHECK (length(record_id) = 16),
    field_id BLOB NOT NULL CHECK (length(field_id) = 16),
    created_at INTEGER NOT NULL,
    created_by BLOB NOT NULL CHECK (length(created_by) = 16),
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_containers_lookup ON containers (record_id, field_id) WHERE deleted_at IS NULL;

-- Scalar/boolean values are versioned by replacement: superseding a value
-- soft-deletes the old row and inserts a new one. The live value for a
-- container is the row with deleted_at IS NULL.
CREATE TABLE IF NOT EXISTS field_values (
    value_id BLOB PRIMARY KEY CHECK (length(value_id) = 16),
    container_id BLOB NOT NULL CHECK (length(container_id) = 16),
    value BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    created_by BLOB NOT NULL CHECK (length(created_by) = 16),
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_values_container ON field_values (container_id) WHERE deleted_at IS NULL;

-- Live existence of a (container, option) row means the option is selected.
CREATE TABLE IF NOT EXISTS selections (
    selection_id BLOB PRIMARY KEY CHECK (length(selection_id) = 16),
    container_id BLOB NOT NULL CHECK (length(container_id) = 16),
    option_id BLOB NOT NULL CHECK (length(option_id) = 16),
    created_at INTEGER NOT NULL,
    created_by BLOB NOT NULL CHECK (length(created_by) = 16),
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_selections_container ON selections (container_id) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_selections_option ON selections (option_id) WHERE deleted_at IS NULL;

-- Junction for linked records; owned children use the lineage columns on
-- records instead.
CREATE TABLE IF NOT EXISTS record_links (
    link_id BLOB PRIMARY KEY CHECK (length(link_id) = 16),
    ancestor_record_id BLOB NOT NULL CHECK (length(ancestor_record_id) = 16),
    descendant_record_id BLOB NOT NULL CHECK (length(descendant_record_id) = 16),
    created_at INTEGER NOT NULL,
    created_by BLOB NOT NULL CHECK (length(created_by) = 16),
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_links_ancestor ON record_links (ancestor_record_id) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_links_descendant ON record_links (descendant_record_id) WHERE deleted_at IS NULL;
";
