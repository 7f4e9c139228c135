//! Declarative field-to-column mapping for cloudrow entity tables.
//!
//! A [`TableSpec`] is the single description of an entity type's storage shape. The same value
//! renders the DDL executed at module install time and drives the record codec and the equality
//! rule used by the reconciliation engine, so the object shape and the table never drift apart.

pub mod column;
pub mod error;
pub mod table;

pub use column::{ColumnSpec, ColumnType, ForeignKey};
pub use error::SchemaError;
pub use table::{REGION_COLUMN, REGION_TABLE, ROW_ID_COLUMN, TableSpec};

/// Returns true when `name` is safe to splice into SQL as an identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
