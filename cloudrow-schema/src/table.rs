use crate::column::{ColumnSpec, ForeignKey};
use crate::error::SchemaError;
use crate::is_valid_identifier;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Local primary key present on every entity table. Never part of a record.
pub const ROW_ID_COLUMN: &str = "id";
/// Scope column present on every regional entity table.
pub const REGION_COLUMN: &str = "region";
/// Platform table holding the enabled-region set, referenced by `REGION_COLUMN`.
pub const REGION_TABLE: &str = "account_region";

/// Storage shape of one entity type. The table name doubles as the entity-type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    /// Fields whose values, joined with `|`, form the identity key.
    pub identity: Vec<String>,
    /// Field carrying the cloud-assigned identifier, if the cloud assigns one.
    pub cloud_id: Option<String>,
    /// Regional tables carry a `region` column and are read once per enabled region.
    pub regional: bool,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            identity: Vec::new(),
            cloud_id: None,
            regional: true,
        }
    }

    /// Account-wide entity type without a region column.
    pub fn global(mut self) -> Self {
        self.regional = false;
        self
    }

    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    pub fn identity<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identity = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn cloud_id(mut self, field: impl Into<String>) -> Self {
        self.cloud_id = Some(field.into());
        self
    }

    pub fn field(&self, field: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.field == field)
    }

    pub fn computed_fields(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.computed)
            .map(|c| c.field.as_str())
    }

    pub fn immutable_fields(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.immutable && !c.computed)
            .map(|c| c.field.as_str())
    }

    pub fn foreign_keys(&self) -> impl Iterator<Item = (&ColumnSpec, &ForeignKey)> {
        self.columns
            .iter()
            .filter_map(|c| c.references.as_ref().map(|fk| (c, fk)))
    }

    /// Other entity tables this one references. Self references are excluded.
    pub fn referenced_tables(&self) -> BTreeSet<&str> {
        self.foreign_keys()
            .map(|(_, fk)| fk.table.as_str())
            .filter(|t| *t != self.name)
            .collect()
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if !is_valid_identifier(&self.name) {
            return Err(SchemaError::InvalidIdentifier(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for col in &self.columns {
            if !is_valid_identifier(&col.column) {
                return Err(SchemaError::InvalidIdentifier(col.column.clone()));
            }
            if col.column == ROW_ID_COLUMN || (self.regional && col.column == REGION_COLUMN) {
                return Err(SchemaError::ReservedColumn {
                    table: self.name.clone(),
                    column: col.column.clone(),
                });
            }
            if !seen.insert(col.column.as_str()) {
                return Err(SchemaError::DuplicateColumn {
                    table: self.name.clone(),
                    column: col.column.clone(),
                });
            }
            if let Some(fk) = &col.references {
                if !is_valid_identifier(&fk.table) {
                    return Err(SchemaError::InvalidIdentifier(fk.table.clone()));
                }
                if !is_valid_identifier(&fk.column) {
                    return Err(SchemaError::InvalidIdentifier(fk.column.clone()));
                }
            }
        }

        if self.identity.is_empty() {
            return Err(SchemaError::MissingIdentity {
                table: self.name.clone(),
            });
        }
        for field in &self.identity {
            if self.field(field).is_none() {
                return Err(self.unknown(field, "identity"));
            }
        }
        match &self.cloud_id {
            Some(field) if self.field(field).is_none() => Err(self.unknown(field, "cloud id")),
            _ => Ok(()),
        }
    }

    fn unknown(&self, field: &str, role: &'static str) -> SchemaError {
        SchemaError::UnknownField {
            table: self.name.clone(),
            field: field.to_string(),
            role,
        }
    }

    fn column_of<'a>(&'a self, field: &'a str) -> &'a str {
        self.field(field).map_or(field, |c| c.column.as_str())
    }

    /// DDL creating the table and its identity index.
    ///
    /// `is_regional` answers whether a referenced table is regional; a regional table
    /// referencing another regional table gets a composite `(region, column)` foreign key.
    pub fn create_statements(&self, is_regional: impl Fn(&str) -> bool) -> Vec<String> {
        // Row ids are never reused: create tokens are derived from them.
        let mut defs = vec![format!(
            "\"{ROW_ID_COLUMN}\" INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL"
        )];
        if self.regional {
            defs.push(format!("\"{REGION_COLUMN}\" TEXT"));
        }
        defs.extend(self.columns.iter().map(ColumnSpec::definition));

        if self.regional {
            defs.push(format!(
                "FOREIGN KEY (\"{REGION_COLUMN}\") REFERENCES \"{REGION_TABLE}\"(\"{REGION_COLUMN}\")"
            ));
        }
        for (col, fk) in self.foreign_keys() {
            let parent_regional = if fk.table == self.name {
                self.regional
            } else {
                is_regional(&fk.table)
            };
            if self.regional && parent_regional {
                defs.push(format!(
                    "FOREIGN KEY (\"{REGION_COLUMN}\", \"{}\") REFERENCES \"{}\"(\"{REGION_COLUMN}\", \"{}\")",
                    col.column, fk.table, fk.column
                ));
            } else {
                defs.push(format!(
                    "FOREIGN KEY (\"{}\") REFERENCES \"{}\"(\"{}\")",
                    col.column, fk.table, fk.column
                ));
            }
        }

        let mut index_cols: Vec<String> = Vec::new();
        if self.regional {
            index_cols.push(format!("\"{REGION_COLUMN}\""));
        }
        index_cols.extend(
            self.identity
                .iter()
                .map(|f| format!("\"{}\"", self.column_of(f))),
        );

        vec![
            format!(
                "CREATE TABLE \"{}\" (\n    {}\n)",
                self.name,
                defs.join(",\n    ")
            ),
            format!(
                "CREATE UNIQUE INDEX \"uq_{0}_identity\" ON \"{0}\"({1})",
                self.name,
                index_cols.join(", ")
            ),
        ]
    }

    pub fn drop_statement(&self) -> String {
        format!("DROP TABLE IF EXISTS \"{}\"", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> TableSpec {
        TableSpec::new("network")
            .column(ColumnSpec::text("name").immutable())
            .column(ColumnSpec::text("cidr_block").immutable())
            .column(ColumnSpec::text("description").optional())
            .column(ColumnSpec::text("network_id").computed())
            .identity(["name"])
            .cloud_id("network_id")
    }

    fn subnet() -> TableSpec {
        TableSpec::new("subnet")
            .column(ColumnSpec::text("name"))
            .column(ColumnSpec::text("network").references("network", "name"))
            .column(ColumnSpec::text("subnet_id").computed())
            .identity(["name"])
            .cloud_id("subnet_id")
    }

    #[test]
    fn validates_well_formed_tables() {
        network().validate().unwrap();
        subnet().validate().unwrap();
    }

    #[test]
    fn rejects_reserved_and_unknown_fields() {
        let reserved = TableSpec::new("thing")
            .column(ColumnSpec::text("region"))
            .identity(["region"]);
        assert!(matches!(
            reserved.validate(),
            Err(SchemaError::ReservedColumn { .. })
        ));

        let unknown = TableSpec::new("thing")
            .column(ColumnSpec::text("name"))
            .identity(["label"]);
        assert!(matches!(
            unknown.validate(),
            Err(SchemaError::UnknownField { role: "identity", .. })
        ));

        let no_identity = TableSpec::new("thing").column(ColumnSpec::text("name"));
        assert!(matches!(
            no_identity.validate(),
            Err(SchemaError::MissingIdentity { .. })
        ));
    }

    #[test]
    fn field_classification() {
        let spec = network();
        assert_eq!(spec.computed_fields().collect::<Vec<_>>(), ["network_id"]);
        assert_eq!(
            spec.immutable_fields().collect::<Vec<_>>(),
            ["name", "cidr_block"]
        );
        assert_eq!(
            subnet().referenced_tables().into_iter().collect::<Vec<_>>(),
            ["network"]
        );
    }

    #[test]
    fn renders_composite_regional_foreign_key() {
        let stmts = subnet().create_statements(|_| true);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE \"subnet\""));
        assert!(stmts[0].contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL"));
        assert!(stmts[0].contains(
            "FOREIGN KEY (\"region\", \"network\") REFERENCES \"network\"(\"region\", \"name\")"
        ));
        assert!(stmts[0].contains("REFERENCES \"account_region\"(\"region\")"));
        assert_eq!(
            stmts[1],
            "CREATE UNIQUE INDEX \"uq_subnet_identity\" ON \"subnet\"(\"region\", \"name\")"
        );
    }

    #[test]
    fn global_tables_have_no_region() {
        let spec = TableSpec::new("dns_zone")
            .global()
            .column(ColumnSpec::text("domain"))
            .identity(["domain"]);
        let stmts = spec.create_statements(|_| false);
        assert!(!stmts[0].contains("region"));
        assert_eq!(spec.drop_statement(), "DROP TABLE IF EXISTS \"dns_zone\"");
    }
}
