pub mod document;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod kind;

pub use document::{Dataset, FieldEntry, FieldInput, OptionNode, Submission, TagNode};
pub use error::CoreError;
pub use field_value::FieldValue;
pub use ids::*;
pub use kind::FieldKind;
