use crate::db::{Account, StoreHandle};
use crate::error::CloudrowError;
use crate::mapper::{DynMapper, Mapper, MapperContext, erase};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a module-level action can reach.
pub struct RpcContext {
    pub store: StoreHandle,
    pub mappers: MapperContext,
    pub account: Arc<Account>,
}

/// A named non-CRUD action exposed by a module.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn call(&self, ctx: &RpcContext, params: Value) -> Result<Value, CloudrowError>;
}

/// Static definition of a module: its mappers (in table order) and actions.
#[derive(Clone)]
pub struct ModuleDef {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub mappers: Vec<Arc<dyn DynMapper>>,
    pub rpcs: BTreeMap<String, Arc<dyn RpcHandler>>,
}

impl ModuleDef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dependencies: Vec::new(),
            mappers: Vec::new(),
            rpcs: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, module: impl Into<String>) -> Self {
        self.dependencies.push(module.into());
        self
    }

    pub fn mapper<M: Mapper>(mut self, mapper: M) -> Self {
        self.mappers.push(erase(mapper));
        self
    }

    pub fn rpc(mut self, method: impl Into<String>, handler: impl RpcHandler + 'static) -> Self {
        self.rpcs.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.mappers.iter().map(|m| m.table().name.as_str())
    }
}

/// A module as listed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub tables: Vec<String>,
    pub rpcs: Vec<String>,
    pub installed: bool,
    pub enabled: bool,
}
