use crate::config::EngineConfig;
use crate::db::{DbOperation, NewOperation, StoreHandle};
use crate::error::CloudrowError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Apply,
    Sync,
    Install,
    Uninstall,
    PlanApply,
    PlanSync,
    Rpc,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Apply => "apply",
            OperationKind::Sync => "sync",
            OperationKind::Install => "install",
            OperationKind::Uninstall => "uninstall",
            OperationKind::PlanApply => "plan_apply",
            OperationKind::PlanSync => "plan_sync",
            OperationKind::Rpc => "rpc",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = CloudrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "apply" => OperationKind::Apply,
            "sync" => OperationKind::Sync,
            "install" => OperationKind::Install,
            "uninstall" => OperationKind::Uninstall,
            "plan_apply" => OperationKind::PlanApply,
            "plan_sync" => OperationKind::PlanSync,
            "rpc" => OperationKind::Rpc,
            other => {
                return Err(CloudrowError::UnexpectedError(format!(
                    "unknown operation kind {other}"
                )));
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Success,
    Failure,
}

/// Result of an operation-producing call.
#[derive(Debug)]
pub struct OperationOutcome {
    pub opid: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub output: Option<Value>,
    pub error: Option<CloudrowError>,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }

    /// The lines stored in the operation's `err` column.
    pub fn error_lines(&self) -> Option<Vec<String>> {
        self.error.as_ref().map(CloudrowError::message_lines)
    }
}

/// An operation row as returned by `list_operations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub opid: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub params: Value,
    pub output: Option<Value>,
    /// One line per failure.
    pub error: Option<Vec<String>>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct StoredError {
    message: Vec<String>,
}

impl TryFrom<DbOperation> for OperationRecord {
    type Error = CloudrowError;

    fn try_from(row: DbOperation) -> Result<Self, Self::Error> {
        let error = row
            .err
            .as_deref()
            .map(serde_json::from_str::<StoredError>)
            .transpose()?
            .map(|e| e.message);
        let status = match (&row.end_date, &error) {
            (None, _) => OperationStatus::Running,
            (Some(_), None) => OperationStatus::Success,
            (Some(_), Some(_)) => OperationStatus::Failure,
        };
        Ok(Self {
            opid: row.opid,
            kind: row.kind.parse()?,
            status,
            params: serde_json::from_str(&row.params)?,
            output: row.output.as_deref().map(serde_json::from_str).transpose()?,
            error,
            start_date: row.start_date,
            end_date: row.end_date,
        })
    }
}

/// Holds the target's operation slot from `begin` until `finish`, refreshing the heartbeat in
/// the background.
pub(crate) struct OperationGuard {
    store: StoreHandle,
    opid: String,
    kind: OperationKind,
    heartbeat: JoinHandle<()>,
}

impl OperationGuard {
    pub async fn begin(
        store: &StoreHandle,
        kind: OperationKind,
        params: Value,
        holder: &str,
        engine: &EngineConfig,
    ) -> Result<Self, CloudrowError> {
        let opid = Uuid::new_v4().to_string();
        store
            .begin_operation(NewOperation {
                opid: opid.clone(),
                kind: kind.as_str().to_string(),
                params,
                holder: holder.to_string(),
                stale_after_ms: i64::try_from(engine.stale_after().as_millis()).unwrap_or(i64::MAX),
            })
            .await?;
        info!(target_name = %store.target(), opid = %opid, kind = %kind, "operation started");

        let heartbeat = tokio::spawn(heartbeat_loop(
            store.clone(),
            opid.clone(),
            engine.heartbeat_interval(),
        ));
        Ok(Self {
            store: store.clone(),
            opid,
            kind,
            heartbeat,
        })
    }

    pub fn opid(&self) -> &str {
        &self.opid
    }

    /// Sets the end time, output and error lines, releasing the slot.
    pub async fn finish(
        self,
        output: Option<Value>,
        error: Option<&CloudrowError>,
    ) -> Result<OperationStatus, CloudrowError> {
        self.heartbeat.abort();
        let status = if error.is_some() {
            OperationStatus::Failure
        } else {
            OperationStatus::Success
        };
        let closed = self
            .store
            .finish_operation(&self.opid, output, error.map(CloudrowError::message_lines))
            .await?;
        if closed {
            info!(
                target_name = %self.store.target(),
                opid = %self.opid,
                kind = %self.kind,
                status = ?status,
                "operation finished"
            );
        } else {
            warn!(
                target_name = %self.store.target(),
                opid = %self.opid,
                "operation had already been closed as abandoned"
            );
        }
        Ok(status)
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

async fn heartbeat_loop(store: StoreHandle, opid: String, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match store.heartbeat(&opid).await {
            Ok(true) => debug!(opid = %opid, "heartbeat"),
            Ok(false) => {
                warn!(opid = %opid, "operation no longer running, heartbeat stopped");
                break;
            }
            Err(e) => warn!(opid = %opid, error = %e, "heartbeat failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(end: bool, err: Option<&str>) -> DbOperation {
        DbOperation {
            opid: "op-1".into(),
            kind: "plan_apply".into(),
            params: "{}".into(),
            output: Some(r#"{"version":3}"#.into()),
            err: err.map(str::to_string),
            start_date: Utc::now(),
            end_date: end.then(Utc::now),
            holder: "h".into(),
            heartbeat_ms: 0,
        }
    }

    #[test]
    fn status_follows_end_date_and_err() {
        let running = OperationRecord::try_from(row(false, None)).unwrap();
        assert_eq!(running.status, OperationStatus::Running);
        assert_eq!(running.kind, OperationKind::PlanApply);

        let ok = OperationRecord::try_from(row(true, None)).unwrap();
        assert_eq!(ok.status, OperationStatus::Success);
        assert_eq!(ok.output.unwrap()["version"], 3);

        let failed =
            OperationRecord::try_from(row(true, Some(r#"{"message":["a","b"]}"#))).unwrap();
        assert_eq!(failed.status, OperationStatus::Failure);
        assert_eq!(failed.error.unwrap(), ["a", "b"]);
    }

    #[test]
    fn kind_round_trips_through_text() {
        for kind in [OperationKind::Apply, OperationKind::PlanSync, OperationKind::Rpc] {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert!("explode".parse::<OperationKind>().is_err());
    }
}
