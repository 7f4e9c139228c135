//! Cloud API collaborator: the verbs mappers call, plus two implementations.
//!
//! - `memory.rs`: in-process simulator with reference rules and fault injection
//! - `http.rs`: JSON/REST client over reqwest
//! - `policy.rs`: HTTP status classification

pub mod http;
pub mod memory;
pub mod policy;

pub use http::HttpCloud;
pub use memory::{CallOp, CloudCall, MemoryCloud};

use crate::db::Account;
use crate::error::CloudApiError;
use async_trait::async_trait;
use cloudrow_diff::Record;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Region used for cloud calls on global (non-regional) entity types.
pub const GLOBAL_REGION: &str = "global";

/// Where a cloud call is made: one region of one account.
#[derive(Debug, Clone)]
pub struct Scope {
    region: Option<String>,
    account: Arc<Account>,
}

impl Scope {
    pub fn regional(account: Arc<Account>, region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            account,
        }
    }

    pub fn global(account: Arc<Account>) -> Self {
        Self {
            region: None,
            account,
        }
    }

    /// `None` for global entity types.
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn api_region(&self) -> &str {
        self.region.as_deref().unwrap_or(GLOBAL_REGION)
    }

    pub fn account(&self) -> &Account {
        &self.account
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudObject {
    pub id: String,
    #[serde(default)]
    pub attributes: Record,
}

/// One page of a listing. `next_page_token` is `None` on the last page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<CloudObject>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait ResourceApi: Send + Sync {
    async fn list(
        &self,
        scope: &Scope,
        kind: &str,
        page_token: Option<String>,
    ) -> Result<Page, CloudApiError>;

    async fn get(&self, scope: &Scope, kind: &str, id: &str) -> Result<CloudObject, CloudApiError>;

    /// Creates an object. Repeating a call with the same `idempotency_token` returns the object
    /// created by the first one instead of creating another.
    async fn create(
        &self,
        scope: &Scope,
        kind: &str,
        attributes: Record,
        idempotency_token: &str,
    ) -> Result<CloudObject, CloudApiError>;

    /// Merges `attributes` into an existing object.
    async fn update(
        &self,
        scope: &Scope,
        kind: &str,
        id: &str,
        attributes: Record,
    ) -> Result<CloudObject, CloudApiError>;

    async fn delete(&self, scope: &Scope, kind: &str, id: &str) -> Result<(), CloudApiError>;
}
