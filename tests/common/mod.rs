#![allow(dead_code)]

use cloudrow::cloud::MemoryCloud;
use cloudrow::config::Config;
use cloudrow::db::{StoredRecord, StoreHandle};
use cloudrow::{Account, Orchestrator, modules};
use cloudrow::engine::RunSummary;
use cloudrow::orchestrator::OperationOutcome;
use cloudrow_diff::Record;
use cloudrow_schema::TableSpec;
use serde_json::Value;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub const TARGET: &str = "test";
pub const REGION: &str = "us-east-1";

pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Fast retries, generous rate limit, one temp database per harness.
pub fn test_config(tag: &str) -> Config {
    let mut cfg = Config::default();
    cfg.basic.database_url = format!(
        "sqlite:{}",
        std::env::temp_dir()
            .join(format!("cloudrow-{tag}-{}-{{target}}.db", Uuid::new_v4().simple()))
            .display()
    );
    cfg.engine.cloud_tps = NonZeroU32::new(10_000).unwrap();
    cfg.engine.call_timeout_secs = 5;
    cfg.engine.heartbeat_interval_secs = 1;
    cfg.retry.min_delay_ms = 1;
    cfg.retry.max_delay_ms = 2;
    cfg.retry.max_times = 3;
    cfg
}

pub fn memory_cloud() -> MemoryCloud {
    MemoryCloud::new()
        .with_reference("subnet", "network_id", "network")
        .with_reference("firewall_rule", "network_id", "network")
}

pub fn summary(outcome: &OperationOutcome) -> RunSummary {
    serde_json::from_value(outcome.output.clone().expect("run output")).unwrap()
}

/// Names of the live objects of a kind, sorted.
pub fn names(records: &[Record]) -> Vec<String> {
    let mut names: Vec<String> = records
        .iter()
        .filter_map(|r| r.get("name").and_then(Value::as_str).map(str::to_string))
        .collect();
    names.sort();
    names
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub cloud: Arc<MemoryCloud>,
    db_path: PathBuf,
}

impl Harness {
    pub async fn new(tag: &str) -> Self {
        Self::with_config(test_config(tag)).await
    }

    pub async fn with_config(cfg: Config) -> Self {
        let db_path = PathBuf::from(
            cfg.basic
                .database_url_for(TARGET)
                .trim_start_matches("sqlite:")
                .to_string(),
        );
        let cloud = Arc::new(memory_cloud());
        let orchestrator = Orchestrator::new(cfg, modules::catalog().unwrap(), cloud.clone());
        orchestrator
            .set_account(TARGET, Account::new("AK", "SK", REGION, [REGION]))
            .await
            .unwrap();
        Self {
            orchestrator,
            cloud,
            db_path,
        }
    }

    /// Harness with the given modules installed and no cloud calls recorded yet.
    pub async fn with_modules(tag: &str, names: &[&str]) -> Self {
        let h = Self::new(tag).await;
        h.install(names).await;
        h
    }

    pub async fn install(&self, names: &[&str]) {
        let names: Vec<String> = names.iter().map(|n| (*n).to_string()).collect();
        let outcome = self.orchestrator.install(TARGET, &names).await.unwrap();
        assert!(outcome.is_success(), "install failed: {:?}", outcome.error);
        self.cloud.clear_calls();
    }

    pub async fn store(&self) -> StoreHandle {
        self.orchestrator.store(TARGET).await.unwrap()
    }

    pub fn spec(&self, table: &str) -> Arc<TableSpec> {
        self.orchestrator
            .registry()
            .catalog()
            .table(table)
            .cloned()
            .unwrap()
    }

    /// Inserts a declared row in the default region.
    pub async fn declare(&self, table: &str, value: Value) -> i64 {
        let spec = self.spec(table);
        self.store()
            .await
            .insert_record(spec, Some(REGION.to_string()), record(value))
            .await
            .unwrap()
    }

    pub async fn rows(&self, table: &str) -> Vec<StoredRecord> {
        let spec = self.spec(table);
        self.store().await.read_records(spec).await.unwrap()
    }

    /// Overwrites the given fields of a declared row.
    pub async fn redeclare(&self, table: &str, row_id: i64, value: Value) {
        let spec = self.spec(table);
        let record = record(value);
        let fields = record.keys().cloned().collect();
        self.store()
            .await
            .update_record(spec, row_id, fields, record)
            .await
            .unwrap();
    }

    pub async fn undeclare(&self, table: &str, row_id: i64) {
        let spec = self.spec(table);
        self.store().await.delete_record(spec, row_id).await.unwrap();
    }

    pub fn live(&self, kind: &str) -> Vec<Record> {
        self.cloud
            .objects(REGION, kind)
            .into_iter()
            .map(|o| o.attributes)
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.db_path.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(path);
        }
    }
}
