use serde::{Deserialize, Serialize};

/// Storage type of a column. SQLite affinity is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    /// Arbitrary JSON stored as text.
    Json,
    /// RFC3339 timestamp stored as text.
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Json | ColumnType::Timestamp => "TEXT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

/// One entity field and the column backing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Field name on the entity (and key in the generic record).
    pub field: String,
    /// Column name in the entity table.
    pub column: String,
    pub ty: ColumnType,
    pub nullable: bool,
    /// Assigned by the cloud. Never compared when diffing and written back after apply.
    pub computed: bool,
    /// Cannot be changed in place; a difference forces delete-then-recreate.
    pub immutable: bool,
    pub references: Option<ForeignKey>,
}

impl ColumnSpec {
    pub fn new(field: impl Into<String>, ty: ColumnType) -> Self {
        let field = field.into();
        Self {
            column: field.clone(),
            field,
            ty,
            nullable: false,
            computed: false,
            immutable: false,
            references: None,
        }
    }

    pub fn text(field: impl Into<String>) -> Self {
        Self::new(field, ColumnType::Text)
    }

    pub fn integer(field: impl Into<String>) -> Self {
        Self::new(field, ColumnType::Integer)
    }

    pub fn boolean(field: impl Into<String>) -> Self {
        Self::new(field, ColumnType::Boolean)
    }

    pub fn json(field: impl Into<String>) -> Self {
        Self::new(field, ColumnType::Json)
    }

    /// Store the field under a different column name.
    pub fn column_name(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Cloud-assigned field. Implies nullable: declared rows do not know it yet.
    pub fn computed(mut self) -> Self {
        self.computed = true;
        self.nullable = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKey {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    pub(crate) fn definition(&self) -> String {
        let mut def = format!("\"{}\" {}", self.column, self.ty.sql_type());
        if !self.nullable {
            def.push_str(" NOT NULL");
        }
        def
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computed_columns_are_nullable() {
        let col = ColumnSpec::text("network_id").computed();
        assert!(col.computed);
        assert!(col.nullable);
        assert_eq!(col.definition(), "\"network_id\" TEXT");
    }

    #[test]
    fn renamed_column_definition() {
        let col = ColumnSpec::boolean("enabled").column_name("is_enabled");
        assert_eq!(col.field, "enabled");
        assert_eq!(col.definition(), "\"is_enabled\" INTEGER NOT NULL");
    }
}
