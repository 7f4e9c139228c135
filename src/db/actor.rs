use crate::db::codec::{self, SqlValue};
use crate::db::models::{
    Account, AccountRegion, DbModule, DbOperation, InstalledModule, ModuleInstall,
    ModuleUninstall, NewOperation, StoredRecord,
};
use crate::db::schema::PLATFORM_INIT;
use crate::error::CloudrowError;
use chrono::Utc;
use cloudrow_diff::Record;
use cloudrow_schema::TableSpec;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::json;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::sync::Arc;
use std::{str::FromStr, time::Duration};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum StoreMessage {
    /// Installed modules ordered by name, with dependencies and owned tables.
    ListModules(RpcReplyPort<Result<Vec<InstalledModule>, CloudrowError>>),

    /// Create tables and registry rows for the given modules in one transaction.
    InstallModules(Vec<ModuleInstall>, RpcReplyPort<Result<(), CloudrowError>>),

    /// Drop tables and registry rows for the given modules in one transaction.
    UninstallModules(Vec<ModuleUninstall>, RpcReplyPort<Result<(), CloudrowError>>),

    /// Set the enabled flag of an installed module.
    SetEnabled(String, bool, RpcReplyPort<Result<(), CloudrowError>>),

    LoadAccount(RpcReplyPort<Result<Option<Account>, CloudrowError>>),

    /// Replace the credential row and the region set.
    UpsertAccount(Account, RpcReplyPort<Result<(), CloudrowError>>),

    /// All rows of one entity table ordered by row id.
    ReadRecords(
        Arc<TableSpec>,
        RpcReplyPort<Result<Vec<StoredRecord>, CloudrowError>>,
    ),

    /// Insert a row and return its row id.
    InsertRecord(
        Arc<TableSpec>,
        Option<String>,
        Record,
        RpcReplyPort<Result<i64, CloudrowError>>,
    ),

    /// Overwrite the listed fields of one row. Missing fields are set to `NULL`.
    UpdateRecord(
        Arc<TableSpec>,
        i64,
        Vec<String>,
        Record,
        RpcReplyPort<Result<(), CloudrowError>>,
    ),

    DeleteRecord(Arc<TableSpec>, i64, RpcReplyPort<Result<(), CloudrowError>>),

    /// Reap stale operations, then insert a running one. Fails if another is still running.
    BeginOperation(NewOperation, RpcReplyPort<Result<(), CloudrowError>>),

    /// Refresh the heartbeat; `false` once the operation is no longer running.
    Heartbeat(String, RpcReplyPort<Result<bool, CloudrowError>>),

    /// Set end date, output and error of a running operation.
    FinishOperation(
        String,
        Option<serde_json::Value>,
        Option<Vec<String>>,
        RpcReplyPort<Result<bool, CloudrowError>>,
    ),

    /// Most recent operations first.
    ListOperations(u32, RpcReplyPort<Result<Vec<DbOperation>, CloudrowError>>),
}

/// Cloneable handle to the store actor of one target.
#[derive(Clone)]
pub struct StoreHandle {
    target: Arc<str>,
    actor: ActorRef<StoreMessage>,
}

impl StoreHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Stops the actor; its pool is closed once the current message is done. Calls made
    /// through any clone afterwards fail with `RactorError`.
    pub fn stop(&self) {
        self.actor.stop(Some("store closed".to_string()));
    }

    pub async fn list_modules(&self) -> Result<Vec<InstalledModule>, CloudrowError> {
        ractor::call!(self.actor, StoreMessage::ListModules).map_err(|e| {
            CloudrowError::RactorError(format!("StoreActor ListModules RPC failed: {e}"))
        })?
    }

    pub async fn install_modules(&self, modules: Vec<ModuleInstall>) -> Result<(), CloudrowError> {
        ractor::call!(self.actor, StoreMessage::InstallModules, modules).map_err(|e| {
            CloudrowError::RactorError(format!("StoreActor InstallModules RPC failed: {e}"))
        })?
    }

    pub async fn uninstall_modules(
        &self,
        modules: Vec<ModuleUninstall>,
    ) -> Result<(), CloudrowError> {
        ractor::call!(self.actor, StoreMessage::UninstallModules, modules).map_err(|e| {
            CloudrowError::RactorError(format!("StoreActor UninstallModules RPC failed: {e}"))
        })?
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), CloudrowError> {
        ractor::call!(self.actor, StoreMessage::SetEnabled, name.to_string(), enabled).map_err(
            |e| CloudrowError::RactorError(format!("StoreActor SetEnabled RPC failed: {e}")),
        )?
    }

    pub async fn load_account(&self) -> Result<Option<Account>, CloudrowError> {
        ractor::call!(self.actor, StoreMessage::LoadAccount).map_err(|e| {
            CloudrowError::RactorError(format!("StoreActor LoadAccount RPC failed: {e}"))
        })?
    }

    pub async fn upsert_account(&self, account: Account) -> Result<(), CloudrowError> {
        ractor::call!(self.actor, StoreMessage::UpsertAccount, account).map_err(|e| {
            CloudrowError::RactorError(format!("StoreActor UpsertAccount RPC failed: {e}"))
        })?
    }

    pub async fn read_records(
        &self,
        spec: Arc<TableSpec>,
    ) -> Result<Vec<StoredRecord>, CloudrowError> {
        ractor::call!(self.actor, StoreMessage::ReadRecords, spec).map_err(|e| {
            CloudrowError::RactorError(format!("StoreActor ReadRecords RPC failed: {e}"))
        })?
    }

    pub async fn insert_record(
        &self,
        spec: Arc<TableSpec>,
        region: Option<String>,
        record: Record,
    ) -> Result<i64, CloudrowError> {
        ractor::call!(self.actor, StoreMessage::InsertRecord, spec, region, record).map_err(
            |e| CloudrowError::RactorError(format!("StoreActor InsertRecord RPC failed: {e}")),
        )?
    }

    pub async fn update_record(
        &self,
        spec: Arc<TableSpec>,
        row_id: i64,
        fields: Vec<String>,
        record: Record,
    ) -> Result<(), CloudrowError> {
        ractor::call!(
            self.actor,
            StoreMessage::UpdateRecord,
            spec,
            row_id,
            fields,
            record
        )
        .map_err(|e| CloudrowError::RactorError(format!("StoreActor UpdateRecord RPC failed: {e}")))?
    }

    pub async fn delete_record(
        &self,
        spec: Arc<TableSpec>,
        row_id: i64,
    ) -> Result<(), CloudrowError> {
        ractor::call!(self.actor, StoreMessage::DeleteRecord, spec, row_id).map_err(|e| {
            CloudrowError::RactorError(format!("StoreActor DeleteRecord RPC failed: {e}"))
        })?
    }

    pub async fn begin_operation(&self, op: NewOperation) -> Result<(), CloudrowError> {
        ractor::call!(self.actor, StoreMessage::BeginOperation, op).map_err(|e| {
            CloudrowError::RactorError(format!("StoreActor BeginOperation RPC failed: {e}"))
        })?
    }

    pub async fn heartbeat(&self, opid: &str) -> Result<bool, CloudrowError> {
        ractor::call!(self.actor, StoreMessage::Heartbeat, opid.to_string()).map_err(|e| {
            CloudrowError::RactorError(format!("StoreActor Heartbeat RPC failed: {e}"))
        })?
    }

    pub async fn finish_operation(
        &self,
        opid: &str,
        output: Option<serde_json::Value>,
        err: Option<Vec<String>>,
    ) -> Result<bool, CloudrowError> {
        ractor::call!(
            self.actor,
            StoreMessage::FinishOperation,
            opid.to_string(),
            output,
            err
        )
        .map_err(|e| {
            CloudrowError::RactorError(format!("StoreActor FinishOperation RPC failed: {e}"))
        })?
    }

    pub async fn list_operations(&self, limit: u32) -> Result<Vec<DbOperation>, CloudrowError> {
        ractor::call!(self.actor, StoreMessage::ListOperations, limit).map_err(|e| {
            CloudrowError::RactorError(format!("StoreActor ListOperations RPC failed: {e}"))
        })?
    }
}

struct StoreState {
    target: Arc<str>,
    pool: SqlitePool,
}

struct StoreActor;

#[ractor::async_trait]
impl Actor for StoreActor {
    type Msg = StoreMessage;
    type State = StoreState;
    type Arguments = (Arc<str>, String);

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        (target, database_url): Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let connect_opts = SqliteConnectOptions::from_str(database_url.as_str())
            .map_err(|e| ActorProcessingErr::from(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // Every query goes through this actor one message at a time.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_opts)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db connect failed: {e}")))?;

        apply_schema(&pool)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db schema init failed: {e}")))?;

        info!(target_name = %target, "StoreActor initialized");
        Ok(StoreState { target, pool })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.pool.close().await;
        info!(target_name = %state.target, "StoreActor stopped");
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let pool = &state.pool;
        match message {
            StoreMessage::ListModules(reply) => {
                let _ = reply.send(self.list_modules(pool).await);
            }
            StoreMessage::InstallModules(modules, reply) => {
                let _ = reply.send(self.install_modules(pool, modules).await);
            }
            StoreMessage::UninstallModules(modules, reply) => {
                let _ = reply.send(self.uninstall_modules(pool, modules).await);
            }
            StoreMessage::SetEnabled(name, enabled, reply) => {
                let _ = reply.send(self.set_enabled(pool, &name, enabled).await);
            }
            StoreMessage::LoadAccount(reply) => {
                let _ = reply.send(self.load_account(pool).await);
            }
            StoreMessage::UpsertAccount(account, reply) => {
                let _ = reply.send(self.upsert_account(pool, account).await);
            }
            StoreMessage::ReadRecords(spec, reply) => {
                let _ = reply.send(self.read_records(pool, &spec).await);
            }
            StoreMessage::InsertRecord(spec, region, record, reply) => {
                let _ = reply.send(self.insert_record(pool, &spec, region, &record).await);
            }
            StoreMessage::UpdateRecord(spec, row_id, fields, record, reply) => {
                let _ = reply.send(self.update_record(pool, &spec, row_id, &fields, &record).await);
            }
            StoreMessage::DeleteRecord(spec, row_id, reply) => {
                let _ = reply.send(self.delete_record(pool, &spec, row_id).await);
            }
            StoreMessage::BeginOperation(op, reply) => {
                let _ = reply.send(self.begin_operation(pool, &state.target, op).await);
            }
            StoreMessage::Heartbeat(opid, reply) => {
                let _ = reply.send(self.heartbeat(pool, &opid).await);
            }
            StoreMessage::FinishOperation(opid, output, err, reply) => {
                let _ = reply.send(self.finish_operation(pool, &opid, output, err).await);
            }
            StoreMessage::ListOperations(limit, reply) => {
                let _ = reply.send(self.list_operations(pool, limit).await);
            }
        }
        Ok(())
    }
}

impl StoreActor {
    async fn list_modules(&self, pool: &SqlitePool) -> Result<Vec<InstalledModule>, CloudrowError> {
        let rows = sqlx::query_as::<_, DbModule>(
            r#"
        SELECT name, version, installed, enabled, installed_at
        FROM module
        ORDER BY name
        "#,
        )
        .fetch_all(pool)
        .await?;

        let deps: Vec<(String, String)> = sqlx::query_as(
            "SELECT module, dependency FROM module_dependency ORDER BY module, dependency",
        )
        .fetch_all(pool)
        .await?;
        let tables: Vec<(String, String)> =
            sqlx::query_as("SELECT module, table_name FROM module_table ORDER BY module, rowid")
                .fetch_all(pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|m| InstalledModule {
                dependencies: deps
                    .iter()
                    .filter(|(module, _)| *module == m.name)
                    .map(|(_, d)| d.clone())
                    .collect(),
                tables: tables
                    .iter()
                    .filter(|(module, _)| *module == m.name)
                    .map(|(_, t)| t.clone())
                    .collect(),
                name: m.name,
                version: m.version,
                enabled: m.enabled,
                installed_at: m.installed_at,
            })
            .collect())
    }

    async fn install_modules(
        &self,
        pool: &SqlitePool,
        modules: Vec<ModuleInstall>,
    ) -> Result<(), CloudrowError> {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        for module in modules {
            let mut collisions = Vec::new();
            for (table, _) in &module.tables {
                let exists: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                )
                .bind(table)
                .fetch_one(&mut *tx)
                .await?;
                if exists > 0 {
                    collisions.push(table.clone());
                }
            }
            if !collisions.is_empty() {
                return Err(CloudrowError::TableCollision {
                    module: module.name,
                    tables: collisions,
                });
            }

            sqlx::query(
                r#"
            INSERT INTO module (name, version, installed, enabled, installed_at)
            VALUES (?, ?, 1, 1, ?)
            "#,
            )
            .bind(&module.name)
            .bind(&module.version)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            for dep in &module.dependencies {
                sqlx::query("INSERT INTO module_dependency (module, dependency) VALUES (?, ?)")
                    .bind(&module.name)
                    .bind(dep)
                    .execute(&mut *tx)
                    .await?;
            }

            for (table, ddl) in &module.tables {
                for stmt in ddl {
                    sqlx::query(stmt).execute(&mut *tx).await?;
                }
                sqlx::query("INSERT INTO module_table (table_name, module) VALUES (?, ?)")
                    .bind(table)
                    .bind(&module.name)
                    .execute(&mut *tx)
                    .await?;
            }
            debug!(module = %module.name, tables = module.tables.len(), "module rows written");
        }

        tx.commit().await?;
        Ok(())
    }

    async fn uninstall_modules(
        &self,
        pool: &SqlitePool,
        modules: Vec<ModuleUninstall>,
    ) -> Result<(), CloudrowError> {
        let mut tx = pool.begin().await?;
        for module in modules {
            for stmt in &module.drops {
                sqlx::query(stmt).execute(&mut *tx).await?;
            }
            sqlx::query("DELETE FROM module_table WHERE module = ?")
                .bind(&module.name)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM module_dependency WHERE module = ?")
                .bind(&module.name)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM module WHERE name = ?")
                .bind(&module.name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_enabled(
        &self,
        pool: &SqlitePool,
        name: &str,
        enabled: bool,
    ) -> Result<(), CloudrowError> {
        let res = sqlx::query("UPDATE module SET enabled = ? WHERE name = ?")
            .bind(enabled)
            .bind(name)
            .execute(pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(CloudrowError::ModuleNotInstalled(name.to_string()));
        }
        Ok(())
    }

    async fn load_account(&self, pool: &SqlitePool) -> Result<Option<Account>, CloudrowError> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT access_key_id, secret_access_key, default_region FROM account WHERE id = 1",
        )
        .fetch_optional(pool)
        .await?;
        let Some((access_key_id, secret_access_key, default_region)) = row else {
            return Ok(None);
        };

        let regions = sqlx::query_as::<_, AccountRegion>(
            "SELECT region, enabled FROM account_region ORDER BY region",
        )
        .fetch_all(pool)
        .await?;

        Ok(Some(Account {
            access_key_id,
            secret_access_key,
            default_region,
            regions,
        }))
    }

    async fn upsert_account(&self, pool: &SqlitePool, account: Account) -> Result<(), CloudrowError> {
        let mut tx = pool.begin().await?;
        sqlx::query(
            r#"
        INSERT INTO account (id, access_key_id, secret_access_key, default_region)
        VALUES (1, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            access_key_id = excluded.access_key_id,
            secret_access_key = excluded.secret_access_key,
            default_region = excluded.default_region
        "#,
        )
        .bind(&account.access_key_id)
        .bind(&account.secret_access_key)
        .bind(&account.default_region)
        .execute(&mut *tx)
        .await?;

        // Regions stay referenced by entity rows, so they are disabled rather than removed.
        sqlx::query("UPDATE account_region SET enabled = 0")
            .execute(&mut *tx)
            .await?;
        for region in &account.regions {
            sqlx::query(
                r#"
            INSERT INTO account_region (region, enabled) VALUES (?, ?)
            ON CONFLICT(region) DO UPDATE SET enabled = excluded.enabled
            "#,
            )
            .bind(&region.region)
            .bind(region.enabled)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn read_records(
        &self,
        pool: &SqlitePool,
        spec: &TableSpec,
    ) -> Result<Vec<StoredRecord>, CloudrowError> {
        let rows = sqlx::query(&codec::select_sql(spec))
            .fetch_all(pool)
            .await?;
        rows.iter()
            .map(|row| {
                let (row_id, region, record) = codec::decode_row(spec, row)?;
                Ok(StoredRecord {
                    row_id,
                    region,
                    record,
                })
            })
            .collect()
    }

    async fn insert_record(
        &self,
        pool: &SqlitePool,
        spec: &TableSpec,
        region: Option<String>,
        record: &Record,
    ) -> Result<i64, CloudrowError> {
        let values = codec::insert_values(spec, region.as_deref(), record)?;
        let sql = codec::insert_sql(spec);
        let mut query = sqlx::query(&sql);
        for value in values {
            query = codec::bind_value(query, value);
        }
        let row = query.fetch_one(pool).await?;
        Ok(sqlx::Row::try_get::<i64, _>(&row, 0)?)
    }

    async fn update_record(
        &self,
        pool: &SqlitePool,
        spec: &TableSpec,
        row_id: i64,
        fields: &[String],
        record: &Record,
    ) -> Result<(), CloudrowError> {
        if fields.is_empty() {
            return Ok(());
        }
        let (sql, values) = codec::update_sql(spec, fields, record)?;
        let mut query = sqlx::query(&sql);
        for value in values {
            query = codec::bind_value(query, value);
        }
        let res = codec::bind_value(query, SqlValue::Integer(row_id))
            .execute(pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(CloudrowError::ReconciliationConflict {
                entity_type: spec.name.clone(),
                key: format!("#row{row_id}"),
                reason: "declared row disappeared before write-back".to_string(),
            });
        }
        Ok(())
    }

    async fn delete_record(
        &self,
        pool: &SqlitePool,
        spec: &TableSpec,
        row_id: i64,
    ) -> Result<(), CloudrowError> {
        sqlx::query(&format!("DELETE FROM \"{}\" WHERE \"id\" = ?", spec.name))
            .bind(row_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn begin_operation(
        &self,
        pool: &SqlitePool,
        target: &str,
        op: NewOperation,
    ) -> Result<(), CloudrowError> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        let lost = json!({ "message": ["holder lost: heartbeat expired"] }).to_string();
        let reaped = sqlx::query(
            r#"
        UPDATE operation
        SET end_date = ?, err = ?
        WHERE end_date IS NULL AND heartbeat_ms < ?
        "#,
        )
        .bind(now)
        .bind(&lost)
        .bind(now_ms - op.stale_after_ms)
        .execute(pool)
        .await?;
        if reaped.rows_affected() > 0 {
            warn!(
                target_name = %target,
                reaped = reaped.rows_affected(),
                "closed operations whose holder stopped heartbeating"
            );
        }

        let res = sqlx::query(
            r#"
        INSERT INTO operation (opid, kind, params, start_date, holder, heartbeat_ms)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&op.opid)
        .bind(&op.kind)
        .bind(op.params.to_string())
        .bind(now)
        .bind(&op.holder)
        .bind(now_ms)
        .execute(pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let running: Option<(String, String)> = sqlx::query_as(
                    "SELECT opid, kind FROM operation WHERE end_date IS NULL LIMIT 1",
                )
                .fetch_optional(pool)
                .await?;
                let (running_opid, running_kind) = running.unwrap_or_default();
                Err(CloudrowError::ConcurrentOperation {
                    target: target.to_string(),
                    running_opid,
                    running_kind,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn heartbeat(&self, pool: &SqlitePool, opid: &str) -> Result<bool, CloudrowError> {
        let res = sqlx::query(
            "UPDATE operation SET heartbeat_ms = ? WHERE opid = ? AND end_date IS NULL",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(opid)
        .execute(pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn finish_operation(
        &self,
        pool: &SqlitePool,
        opid: &str,
        output: Option<serde_json::Value>,
        err: Option<Vec<String>>,
    ) -> Result<bool, CloudrowError> {
        let res = sqlx::query(
            r#"
        UPDATE operation
        SET end_date = ?, output = ?, err = ?
        WHERE opid = ? AND end_date IS NULL
        "#,
        )
        .bind(Utc::now())
        .bind(output.map(|o| o.to_string()))
        .bind(err.map(|lines| json!({ "message": lines }).to_string()))
        .bind(opid)
        .execute(pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_operations(
        &self,
        pool: &SqlitePool,
        limit: u32,
    ) -> Result<Vec<DbOperation>, CloudrowError> {
        let rows = sqlx::query_as::<_, DbOperation>(
            r#"
        SELECT opid, kind, params, output, err, start_date, end_date, holder, heartbeat_ms
        FROM operation
        ORDER BY rowid DESC
        LIMIT ?
        "#,
        )
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

/// Spawn the store actor of one target and return a cloneable handle.
///
/// Actors are unnamed so that any number of targets can be open in one process.
pub async fn spawn(target: &str, database_url: &str) -> Result<StoreHandle, CloudrowError> {
    let target: Arc<str> = Arc::from(target);
    let (actor, _jh) = ractor::Actor::spawn(
        None,
        StoreActor,
        (target.clone(), database_url.to_string()),
    )
    .await
    .map_err(|e| CloudrowError::RactorError(format!("failed to spawn StoreActor: {e}")))?;

    Ok(StoreHandle { target, actor })
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), CloudrowError> {
    for stmt in PLATFORM_INIT.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(pool).await?;
    }
    Ok(())
}
