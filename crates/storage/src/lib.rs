pub mod error;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use error::StorageError;
pub use sqlite::SqliteStorage;
pub use traits::{
    ContainerRow, DatatypeRow, DeletedRecord, FieldRow, LinkRow, OptionCount, OptionRow,
    RecordRow, SelectionRow, Storage, TreeEdgeRow, UserRow, ValueRow,
};
