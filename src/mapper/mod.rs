//! Mapper contract: one implementation per entity type translating between stored rows and
//! live cloud objects.
//!
//! Authors implement the typed [`Mapper`] over a serde entity struct; the engine drives the
//! type-erased [`DynMapper`] over generic JSON records (see `erased.rs`).

pub mod context;
pub mod erased;
pub mod retry;

pub use context::{MapperContext, RecordIndex};
pub use erased::{DynMapper, TypedMapper, UpdatePolicy, erase};

use crate::cloud::{CloudObject, Scope};
use crate::error::CloudApiError;
use async_trait::async_trait;
use cloudrow_diff::{Record, normalize};
use cloudrow_schema::TableSpec;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

/// A resource type as stored in its entity table.
pub trait Entity: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Entity-type tag; also the table name.
    const ENTITY_TYPE: &'static str;

    fn table() -> TableSpec;
}

/// Identity of a record within one entity type: scope region plus the mapper's key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub region: Option<String>,
    pub id: String,
}

impl RecordKey {
    pub fn new(region: Option<String>, id: impl Into<String>) -> Self {
        Self {
            region,
            id: id.into(),
        }
    }

    /// Key of a declared row whose identity is not known yet.
    pub fn for_row(region: Option<String>, row_id: i64) -> Self {
        Self::new(region, format!("#row{row_id}"))
    }

    pub fn is_row_key(&self) -> bool {
        self.id.starts_with("#row")
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.region {
            Some(region) => write!(f, "{region}|{}", self.id),
            None => f.write_str(&self.id),
        }
    }
}

#[async_trait]
pub trait Mapper: Send + Sync + 'static {
    type Entity: Entity;

    /// Stable identity key, or `None` while it depends on a cloud id that is not known yet.
    fn id_of(&self, entity: &Self::Entity) -> Option<String>;

    /// Lazy, finite listing of the live objects in `scope`. The engine restarts the whole stream
    /// on a transient error.
    fn read_cloud<'a>(
        &'a self,
        ctx: &'a MapperContext,
        scope: &'a Scope,
    ) -> BoxStream<'a, Result<Self::Entity, CloudApiError>>;

    /// Creates the object and returns it as the cloud now sees it. `idempotency_token` is stable
    /// for a given declared row and content, so a retried call does not create a second object.
    async fn create_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        declared: &Self::Entity,
        idempotency_token: &str,
    ) -> Result<Self::Entity, CloudApiError>;

    async fn update_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        declared: &Self::Entity,
        observed: &Self::Entity,
    ) -> Result<Self::Entity, CloudApiError>;

    /// Removes the object. The engine treats not-found as success.
    async fn delete_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        observed: &Self::Entity,
    ) -> Result<(), CloudApiError>;
}

/// Streams every object of `kind` in `scope`, one page per cloud call.
pub fn list_objects<'a>(
    ctx: &'a MapperContext,
    scope: &'a Scope,
    kind: &'a str,
) -> BoxStream<'a, Result<CloudObject, CloudApiError>> {
    stream::try_unfold(Some(None), move |cursor: Option<Option<String>>| async move {
        let Some(page_token) = cursor else {
            return Ok(None);
        };
        let page = ctx.cloud().list(scope, kind, page_token).await?;
        let next = page.next_page_token.map(Some);
        Ok(Some((stream::iter(page.items.into_iter().map(Ok)), next)))
    })
    .map(|page| match page {
        Ok(items) => items.left_stream(),
        Err(e) => stream::once(async move { Err(e) }).right_stream(),
    })
    .flatten()
    .boxed()
}

/// Decodes cloud attributes into an entity; a mismatch is a payload error, not a bug.
pub fn decode_attributes<E: Entity>(attributes: Record) -> Result<E, CloudApiError> {
    serde_json::from_value(Value::Object(normalize(attributes)))
        .map_err(|e| CloudApiError::Decode(format!("{}: {e}", E::ENTITY_TYPE)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_key_display_and_order() {
        let a = RecordKey::new(Some("eu-west-1".into()), "net-b");
        let b = RecordKey::new(Some("us-east-1".into()), "net-a");
        assert_eq!(a.to_string(), "eu-west-1|net-b");
        assert!(a < b);
        assert_eq!(RecordKey::new(None, "zone").to_string(), "zone");
        assert!(RecordKey::for_row(None, 4).is_row_key());
    }
}
