//! Orchestrator: the external entry points.
//!
//! Every state-changing call runs as one operation row in the target's store. The row is the
//! target lock (a partial unique index admits one running operation per target), the audit
//! record and the place where output and error lines end up.

pub mod operation;

pub use operation::{OperationKind, OperationOutcome, OperationRecord, OperationStatus};

use crate::cloud::ResourceApi;
use crate::config::Config;
use crate::db::{self, Account, StoreHandle};
use crate::engine::{Direction, Reconciler, RunRequest};
use crate::error::CloudrowError;
use crate::mapper::MapperContext;
use crate::registry::{Catalog, ModuleDescriptor, Registry, RpcContext};
use operation::OperationGuard;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_TARGET_LEN: usize = 64;

/// Target names become part of database file names.
pub fn validate_target(target: &str) -> Result<(), CloudrowError> {
    let valid = !target.is_empty()
        && target.len() <= MAX_TARGET_LEN
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(CloudrowError::InvalidTarget(target.to_string()))
    }
}

pub struct Orchestrator {
    config: Config,
    registry: Registry,
    cloud: Arc<dyn ResourceApi>,
    /// Identifies this process in operation rows.
    holder: String,
    /// Open target stores. Entries stay until `close_target`.
    stores: Mutex<HashMap<String, StoreHandle>>,
}

impl Orchestrator {
    pub fn new(config: Config, catalog: Catalog, cloud: Arc<dyn ResourceApi>) -> Self {
        Self {
            config,
            registry: Registry::new(catalog),
            cloud,
            holder: format!("{}-{}", std::process::id(), Uuid::new_v4().simple()),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The store of `target`, opened (and its platform schema created) on first use.
    pub async fn store(&self, target: &str) -> Result<StoreHandle, CloudrowError> {
        validate_target(target)?;
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(target) {
            return Ok(store.clone());
        }
        let url = self.config.basic.database_url_for(target);
        let store = db::spawn(target, &url).await?;
        info!(target_name = %target, "target store opened");
        stores.insert(target.to_string(), store.clone());
        Ok(store)
    }

    /// Stops the store actor of `target` and drops it from the cache; the next call on the
    /// target opens it again. Only call this while no operation on the target is in flight.
    /// Returns whether the target was open.
    pub async fn close_target(&self, target: &str) -> bool {
        let Some(store) = self.stores.lock().await.remove(target) else {
            return false;
        };
        store.stop();
        info!(target_name = %target, "target store closed");
        true
    }

    fn mapper_context(&self) -> MapperContext {
        MapperContext::new(self.cloud.clone(), &self.config.engine, &self.config.retry)
    }

    async fn account(&self, store: &StoreHandle) -> Result<Arc<Account>, CloudrowError> {
        store
            .load_account()
            .await?
            .map(Arc::new)
            .ok_or(CloudrowError::MissingAccount)
    }

    pub async fn set_account(&self, target: &str, account: Account) -> Result<(), CloudrowError> {
        let store = self.store(target).await?;
        store.upsert_account(account).await?;
        info!(target_name = %target, "account updated");
        Ok(())
    }

    pub async fn list_modules(&self, target: &str) -> Result<Vec<ModuleDescriptor>, CloudrowError> {
        let store = self.store(target).await?;
        self.registry.list_modules(&store).await
    }

    /// Most recent operations first.
    pub async fn list_operations(
        &self,
        target: &str,
        limit: u32,
    ) -> Result<Vec<OperationRecord>, CloudrowError> {
        let store = self.store(target).await?;
        store
            .list_operations(limit)
            .await?
            .into_iter()
            .map(OperationRecord::try_from)
            .collect()
    }

    pub async fn set_enabled(
        &self,
        target: &str,
        module: &str,
        enabled: bool,
    ) -> Result<(), CloudrowError> {
        let store = self.store(target).await?;
        self.registry.set_enabled(&store, module, enabled).await
    }

    /// Runs `body` as one operation. `body` yields the output and an error to attach to it;
    /// an `Err` from `body` is recorded without output.
    async fn audited<Fut>(
        &self,
        store: &StoreHandle,
        kind: OperationKind,
        params: Value,
        body: Fut,
    ) -> Result<OperationOutcome, CloudrowError>
    where
        Fut: Future<Output = Result<(Option<Value>, Option<CloudrowError>), CloudrowError>>,
    {
        let guard =
            OperationGuard::begin(store, kind, params, &self.holder, &self.config.engine).await?;
        let opid = guard.opid().to_string();

        let (output, error) = match body.await {
            Ok(res) => res,
            Err(e) => (None, Some(e)),
        };
        if let Some(e) = &error {
            warn!(target_name = %store.target(), opid = %opid, kind = %kind, error = %e, "operation failed");
        }

        let status = guard.finish(output.clone(), error.as_ref()).await?;
        Ok(OperationOutcome {
            opid,
            kind,
            status,
            output,
            error,
        })
    }

    /// Installs modules and their dependencies, then pulls the cloud state of the new entity
    /// types when `engine.sync_on_install` is set and an account is configured.
    pub async fn install(
        &self,
        target: &str,
        names: &[String],
    ) -> Result<OperationOutcome, CloudrowError> {
        let store = self.store(target).await?;
        self.audited(&store, OperationKind::Install, json!({ "modules": names }), async {
            let report = self.registry.install(&store, names).await?;
            let mut output = serde_json::to_value(&report)?;
            if !self.config.engine.sync_on_install || report.installed.is_empty() {
                return Ok((Some(output), None));
            }
            let Some(account) = store.load_account().await? else {
                info!(target_name = %target, "no account configured, skipping initial sync");
                return Ok((Some(output), None));
            };

            let types: Vec<&str> = self
                .registry
                .mappers_for(&report.installed)?
                .iter()
                .map(|m| m.entity_type())
                .collect();
            let reconciler = Reconciler::new(
                store.clone(),
                self.mapper_context(),
                Arc::new(account),
                self.registry.enabled_mappers(&store).await?,
                &self.config.engine,
            )?;
            let run = reconciler
                .run(&RunRequest::new(Direction::Sync).only(types))
                .await?;
            output["sync"] = serde_json::to_value(&run.summary)?;
            Ok::<_, CloudrowError>((Some(output), run.error()))
        })
        .await
    }

    pub async fn uninstall(
        &self,
        target: &str,
        names: &[String],
    ) -> Result<OperationOutcome, CloudrowError> {
        let store = self.store(target).await?;
        self.audited(&store, OperationKind::Uninstall, json!({ "modules": names }), async {
            let report = self.registry.uninstall(&store, names).await?;
            Ok::<_, CloudrowError>((Some(serde_json::to_value(&report)?), None))
        })
        .await
    }

    pub async fn apply(&self, target: &str) -> Result<OperationOutcome, CloudrowError> {
        self.reconcile(target, Direction::Apply, false, None).await
    }

    pub async fn sync(&self, target: &str) -> Result<OperationOutcome, CloudrowError> {
        self.reconcile(target, Direction::Sync, false, None).await
    }

    pub async fn plan_apply(&self, target: &str) -> Result<OperationOutcome, CloudrowError> {
        self.reconcile(target, Direction::Apply, true, None).await
    }

    pub async fn plan_sync(&self, target: &str) -> Result<OperationOutcome, CloudrowError> {
        self.reconcile(target, Direction::Sync, true, None).await
    }

    /// Apply or sync over every enabled module. After `deadline` no new cloud call is launched
    /// and the operation ends with `OperationTimeout`.
    pub async fn reconcile(
        &self,
        target: &str,
        direction: Direction,
        dry_run: bool,
        deadline: Option<Instant>,
    ) -> Result<OperationOutcome, CloudrowError> {
        let kind = match (direction, dry_run) {
            (Direction::Apply, false) => OperationKind::Apply,
            (Direction::Apply, true) => OperationKind::PlanApply,
            (Direction::Sync, false) => OperationKind::Sync,
            (Direction::Sync, true) => OperationKind::PlanSync,
        };
        let timeout_ms = deadline.map(|d| {
            u64::try_from(d.saturating_duration_since(Instant::now()).as_millis())
                .unwrap_or(u64::MAX)
        });
        let params = json!({ "dry_run": dry_run, "timeout_ms": timeout_ms });

        let store = self.store(target).await?;
        self.audited(&store, kind, params, async {
            let account = self.account(&store).await?;
            let mappers = self.registry.enabled_mappers(&store).await?;
            let reconciler = Reconciler::new(
                store.clone(),
                self.mapper_context(),
                account,
                mappers,
                &self.config.engine,
            )?;
            let request = RunRequest::new(direction)
                .dry_run(dry_run)
                .deadline(deadline);
            let report = reconciler.run(&request).await?;
            info!(
                target_name = %target,
                kind = %kind,
                created = report.summary.totals.created,
                updated = report.summary.totals.updated,
                deleted = report.summary.totals.deleted,
                failed = report.summary.totals.failed,
                "reconciliation finished"
            );
            Ok::<_, CloudrowError>((Some(serde_json::to_value(&report.summary)?), report.error()))
        })
        .await
    }

    /// Calls a named action of an installed, enabled module.
    pub async fn rpc(
        &self,
        target: &str,
        module: &str,
        method: &str,
        params: Value,
    ) -> Result<OperationOutcome, CloudrowError> {
        let store = self.store(target).await?;
        let op_params = json!({ "module": module, "method": method, "params": params.clone() });
        self.audited(&store, OperationKind::Rpc, op_params, async {
            let def = self.registry.enabled_module(&store, module).await?;
            let handler = def
                .rpcs
                .get(method)
                .cloned()
                .ok_or_else(|| CloudrowError::UnknownRpc {
                    module: module.to_string(),
                    method: method.to_string(),
                })?;
            let ctx = RpcContext {
                store: store.clone(),
                mappers: self.mapper_context(),
                account: self.account(&store).await?,
            };
            let output = handler.call(&ctx, params).await?;
            Ok::<_, CloudrowError>((Some(output), None))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_names() {
        assert!(validate_target("prod-eu_1").is_ok());
        assert!(validate_target("").is_err());
        assert!(validate_target("../etc").is_err());
        assert!(validate_target(&"a".repeat(65)).is_err());
    }
}
