use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("invalid SQL identifier `{0}`")]
    InvalidIdentifier(String),

    #[error("table `{table}` declares column `{column}` twice")]
    DuplicateColumn { table: String, column: String },

    #[error("table `{table}` uses reserved column name `{column}`")]
    ReservedColumn { table: String, column: String },

    #[error("table `{table}` has no identity fields")]
    MissingIdentity { table: String },

    #[error("table `{table}` names unknown field `{field}` as {role}")]
    UnknownField {
        table: String,
        field: String,
        role: &'static str,
    },
}
