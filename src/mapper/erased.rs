use super::{Entity, Mapper, MapperContext, RecordKey};
use crate::cloud::Scope;
use crate::error::{CloudApiError, CloudrowError};
use async_trait::async_trait;
use cloudrow_diff::{Record, differing_fields, equivalent, normalize};
use cloudrow_schema::TableSpec;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Namespace of create idempotency tokens (UUID v5).
const TOKEN_NAMESPACE: Uuid = Uuid::from_u128(0x6c0d_7f2e_41a3_4b8e_9d55_0c1f_aa37_e214);

/// How a matched but unequal pair is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    InPlace,
    /// An immutable field differs: delete the live object, then create the declared one.
    Replace,
}

/// Type-erased mapper over generic records, as the engine sees it.
#[async_trait]
pub trait DynMapper: Send + Sync {
    fn entity_type(&self) -> &'static str;

    fn table(&self) -> &Arc<TableSpec>;

    /// Identity key of a record; `None` when it is not derivable yet.
    fn id_of(&self, record: &Record) -> Result<Option<String>, CloudrowError>;

    /// Equality ignoring the table's computed fields.
    fn equals(&self, declared: &Record, observed: &Record) -> bool;

    fn update_policy(&self, declared: &Record, observed: &Record) -> UpdatePolicy;

    /// Round-trips a declared record through the entity type, rejecting rows it cannot represent.
    fn canonical(&self, record: &Record) -> Result<Record, CloudrowError>;

    async fn read_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
    ) -> Result<Vec<Record>, CloudApiError>;

    async fn create_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        key: &RecordKey,
        row_id: i64,
        declared: &Record,
    ) -> Result<Record, CloudrowError>;

    async fn update_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        declared: &Record,
        observed: &Record,
    ) -> Result<Record, CloudrowError>;

    async fn delete_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        observed: &Record,
    ) -> Result<(), CloudrowError>;
}

/// Adapts a typed [`Mapper`] to [`DynMapper`]; serde is the only conversion point.
pub struct TypedMapper<M: Mapper> {
    inner: M,
    table: Arc<TableSpec>,
    computed: Vec<String>,
    immutable: Vec<String>,
}

impl<M: Mapper> TypedMapper<M> {
    pub fn new(inner: M) -> Self {
        let table = Arc::new(M::Entity::table());
        let computed = table.computed_fields().map(str::to_string).collect();
        let immutable = table.immutable_fields().map(str::to_string).collect();
        Self {
            inner,
            table,
            computed,
            immutable,
        }
    }

    fn to_entity(&self, record: &Record) -> Result<M::Entity, CloudrowError> {
        serde_json::from_value(Value::Object(record.clone())).map_err(|e| {
            CloudrowError::InvalidRecord {
                entity_type: M::Entity::ENTITY_TYPE.to_string(),
                message: e.to_string(),
            }
        })
    }

    fn to_record(entity: &M::Entity) -> Result<Record, CloudrowError> {
        match serde_json::to_value(entity)? {
            Value::Object(map) => Ok(normalize(map)),
            other => Err(CloudrowError::InvalidRecord {
                entity_type: M::Entity::ENTITY_TYPE.to_string(),
                message: format!("entity serialized to a non-object: {other}"),
            }),
        }
    }

    fn ignored(&self) -> Vec<&str> {
        self.computed.iter().map(String::as_str).collect()
    }

    async fn read_once(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
    ) -> Result<Vec<Record>, CloudApiError> {
        let limit = ctx.call_timeout();
        let mut stream = self.inner.read_cloud(ctx, scope);
        let mut records = Vec::new();
        loop {
            match tokio::time::timeout(limit, stream.next()).await {
                Err(_) => return Err(CloudApiError::Timeout(limit)),
                Ok(None) => return Ok(records),
                Ok(Some(item)) => {
                    let record = Self::to_record(&item?)
                        .map_err(|e| CloudApiError::Decode(e.to_string()))?;
                    records.push(record);
                }
            }
        }
    }
}

pub fn erase<M: Mapper>(mapper: M) -> Arc<dyn DynMapper> {
    Arc::new(TypedMapper::new(mapper))
}

/// Token for creating one declared row: same type, key, row and content give the same token
/// across restarts. A row declared again after its object was deleted gets a new row id and so a
/// new token.
pub(crate) fn idempotency_token(
    entity_type: &str,
    key: &RecordKey,
    row_id: i64,
    declared: &Record,
) -> String {
    let name = format!(
        "{entity_type}\n{key}\n{row_id}\n{}",
        Value::Object(declared.clone())
    );
    let digest = Uuid::new_v5(&TOKEN_NAMESPACE, name.as_bytes());
    format!("cr-{entity_type}-{}", digest.simple())
}

#[async_trait]
impl<M: Mapper> DynMapper for TypedMapper<M> {
    fn entity_type(&self) -> &'static str {
        M::Entity::ENTITY_TYPE
    }

    fn table(&self) -> &Arc<TableSpec> {
        &self.table
    }

    fn id_of(&self, record: &Record) -> Result<Option<String>, CloudrowError> {
        Ok(self.inner.id_of(&self.to_entity(record)?))
    }

    fn equals(&self, declared: &Record, observed: &Record) -> bool {
        equivalent(declared, observed, &self.ignored())
    }

    fn update_policy(&self, declared: &Record, observed: &Record) -> UpdatePolicy {
        let ignored = self.ignored();
        let changed = differing_fields(declared, observed, &ignored);
        if changed.iter().any(|f| self.immutable.contains(f)) {
            UpdatePolicy::Replace
        } else {
            UpdatePolicy::InPlace
        }
    }

    fn canonical(&self, record: &Record) -> Result<Record, CloudrowError> {
        Self::to_record(&self.to_entity(record)?)
    }

    async fn read_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
    ) -> Result<Vec<Record>, CloudApiError> {
        ctx.retrying("read", M::Entity::ENTITY_TYPE, || self.read_once(ctx, scope))
            .await
    }

    async fn create_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        key: &RecordKey,
        row_id: i64,
        declared: &Record,
    ) -> Result<Record, CloudrowError> {
        let entity = self.to_entity(declared)?;
        let token = idempotency_token(M::Entity::ENTITY_TYPE, key, row_id, declared);
        let created = ctx
            .call("create", M::Entity::ENTITY_TYPE, || {
                self.inner.create_in_cloud(ctx, scope, &entity, &token)
            })
            .await?;
        Self::to_record(&created)
    }

    async fn update_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        declared: &Record,
        observed: &Record,
    ) -> Result<Record, CloudrowError> {
        let declared = self.to_entity(declared)?;
        let observed = self.to_entity(observed)?;
        let updated = ctx
            .call("update", M::Entity::ENTITY_TYPE, || {
                self.inner.update_in_cloud(ctx, scope, &declared, &observed)
            })
            .await?;
        Self::to_record(&updated)
    }

    async fn delete_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        observed: &Record,
    ) -> Result<(), CloudrowError> {
        let observed = self.to_entity(observed)?;
        let res = ctx
            .call("delete", M::Entity::ENTITY_TYPE, || {
                self.inner.delete_in_cloud(ctx, scope, &observed)
            })
            .await;
        match res {
            Err(e) if e.is_not_found() => {
                debug!(
                    entity_type = M::Entity::ENTITY_TYPE,
                    "delete target already gone"
                );
                Ok(())
            }
            other => Ok(other?),
        }
    }
}
