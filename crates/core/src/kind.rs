use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Field typing for a datatype's fields. Selection-set kinds store their data
/// as selection rows against an option table; scalar kinds store typed value
/// rows that are versioned by replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Boolean,
    Integer,
    Decimal,
    Text,
    SingleRadio,
    MultiRadio,
    SingleSelect,
    MultiSelect,
    TagTree,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Text => "text",
            Self::SingleRadio => "single_radio",
            Self::MultiRadio => "multi_radio",
            Self::SingleSelect => "single_select",
            Self::MultiSelect => "multi_select",
            Self::TagTree => "tag_tree",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "boolean" => Ok(Self::Boolean),
            "integer" => Ok(Self::Integer),
            "decimal" => Ok(Self::Decimal),
            "text" => Ok(Self::Text),
            "single_radio" => Ok(Self::SingleRadio),
            "multi_radio" => Ok(Self::MultiRadio),
            "single_select" => Ok(Self::SingleSelect),
            "multi_select" => Ok(Self::MultiSelect),
            "tag_tree" => Ok(Self::TagTree),
            _ => Err(CoreError::InvalidData(format!("unknown field kind: {s}"))),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Integer | Self::Decimal | Self::Text)
    }

    /// Kinds whose value is a set of option selections (flat option lists).
    pub fn is_option_set(&self) -> bool {
        matches!(
            self,
            Self::SingleRadio | Self::MultiRadio | Self::SingleSelect | Self::MultiSelect
        )
    }

    /// Kinds that admit at most one live selection.
    pub fn single_cardinality(&self) -> bool {
        matches!(self, Self::SingleRadio | Self::SingleSelect)
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
