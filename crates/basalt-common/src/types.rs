//! Field types for table primary keys.

use serde::{Deserialize, Serialize};

/// Type of a table's primary key column.
///
/// The type decides which key comparator the table's index is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldType {
    Boolean = 1,
    Int32 = 12,
    Int64 = 13,
    Float64 = 31,
    Char = 50,
    Varchar = 51,
}

/// Comparator family used to order encoded keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    /// Native-endian signed integers, 4 or 8 bytes.
    Integer,
    /// Native-endian `f64`.
    Float,
    /// Raw bytes compared lexicographically.
    String,
}

impl FieldType {
    /// Returns the fixed byte size for this type, or None for variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            FieldType::Boolean => Some(1),
            FieldType::Int32 => Some(4),
            FieldType::Int64 | FieldType::Float64 => Some(8),
            FieldType::Char | FieldType::Varchar => None,
        }
    }

    /// Returns the comparator family for a primary key of this type, or None
    /// if the type cannot key an index.
    pub fn key_kind(&self) -> Option<KeyKind> {
        match self {
            FieldType::Int32 | FieldType::Int64 => Some(KeyKind::Integer),
            FieldType::Float64 => Some(KeyKind::Float),
            FieldType::Char | FieldType::Varchar => Some(KeyKind::String),
            FieldType::Boolean => None,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::Boolean => "BOOLEAN",
            FieldType::Int32 => "INT32",
            FieldType::Int64 => "INT64",
            FieldType::Float64 => "FLOAT64",
            FieldType::Char => "CHAR",
            FieldType::Varchar => "VARCHAR",
        };
        write!(f, "{}", name)
    }
}
