use chrono::{DateTime, Utc};
use cloudrow_diff::Record;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbModule {
    pub name: String,
    pub version: String,
    pub installed: bool,
    pub enabled: bool,
    pub installed_at: DateTime<Utc>,
}

/// An installed module with the rows it owns in the registry tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstalledModule {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub installed_at: DateTime<Utc>,
    pub dependencies: Vec<String>,
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbOperation {
    pub opid: String,
    pub kind: String,
    pub params: String,
    pub output: Option<String>,
    pub err: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub holder: String,
    pub heartbeat_ms: i64,
}

/// Module rows to write when installing.
#[derive(Debug, Clone)]
pub struct ModuleInstall {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    /// `(table name, DDL statements)` in creation order.
    pub tables: Vec<(String, Vec<String>)>,
}

/// Module rows to remove when uninstalling.
#[derive(Debug, Clone)]
pub struct ModuleUninstall {
    pub name: String,
    /// `DROP` statements in execution order (children first).
    pub drops: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewOperation {
    pub opid: String,
    pub kind: String,
    pub params: serde_json::Value,
    pub holder: String,
    /// Running operations with an older heartbeat are closed before acquiring.
    pub stale_after_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct AccountRegion {
    pub region: String,
    pub enabled: bool,
}

/// Cloud credentials of a target and the regions its rows may live in.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub default_region: String,
    pub regions: Vec<AccountRegion>,
}

impl Account {
    /// Account with every listed region enabled. The default region is added if missing.
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        default_region: impl Into<String>,
        regions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let default_region = default_region.into();
        let mut regions: Vec<AccountRegion> = regions
            .into_iter()
            .map(|r| AccountRegion {
                region: r.into(),
                enabled: true,
            })
            .collect();
        if !regions.iter().any(|r| r.region == default_region) {
            regions.push(AccountRegion {
                region: default_region.clone(),
                enabled: true,
            });
        }
        regions.sort_by(|a, b| a.region.cmp(&b.region));
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            default_region,
            regions,
        }
    }

    pub fn enabled_regions(&self) -> impl Iterator<Item = &str> {
        self.regions
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.region.as_str())
    }

    pub fn is_enabled(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r.enabled && r.region == region)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("default_region", &self.default_region)
            .field("regions", &self.regions)
            .finish()
    }
}

/// One entity-table row decoded through its `TableSpec`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub row_id: i64,
    /// `None` for global tables.
    pub region: Option<String>,
    pub record: Record,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_always_enables_default_region() {
        let account = Account::new("AK", "SK", "us-east-1", ["eu-west-1"]);
        assert_eq!(
            account.enabled_regions().collect::<Vec<_>>(),
            ["eu-west-1", "us-east-1"]
        );
        assert!(!format!("{account:?}").contains("SK"));
    }
}
