mod common;

use cloudrow::db::NewOperation;
use cloudrow::{CloudrowError, OperationKind, OperationStatus};
use common::{Harness, TARGET, test_config};
use serde_json::json;
use std::time::Duration;

fn ghost(stale_after_ms: i64) -> NewOperation {
    NewOperation {
        opid: "ghost-op".to_string(),
        kind: "apply".to_string(),
        params: json!({ "dry_run": false }),
        holder: "crashed-process".to_string(),
        stale_after_ms,
    }
}

#[tokio::test]
async fn running_operation_blocks_the_target() {
    let h = Harness::with_modules("ops-blocked", &["network"]).await;
    h.store().await.begin_operation(ghost(120_000)).await.unwrap();
    let before = h.orchestrator.list_operations(TARGET, 10).await.unwrap().len();

    let err = h.orchestrator.apply(TARGET).await.unwrap_err();
    match err {
        CloudrowError::ConcurrentOperation {
            target,
            running_opid,
            running_kind,
        } => {
            assert_eq!(target, TARGET);
            assert_eq!(running_opid, "ghost-op");
            assert_eq!(running_kind, "apply");
        }
        other => panic!("expected ConcurrentOperation, got {other}"),
    }
    // No row was written for the refused call.
    let after = h.orchestrator.list_operations(TARGET, 10).await.unwrap();
    assert_eq!(after.len(), before);
    assert_eq!(after[0].status, OperationStatus::Running);
}

#[tokio::test]
async fn concurrent_calls_on_one_target_are_exclusive() {
    let h = Harness::with_modules("ops-exclusive", &["network"]).await;
    h.declare("network", json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}))
        .await;
    h.cloud.set_latency(Some(Duration::from_millis(200)));

    let (first, second) = tokio::join!(h.orchestrator.apply(TARGET), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.orchestrator.sync(TARGET).await
    });

    let first = first.unwrap();
    assert!(first.is_success(), "apply failed: {:?}", first.error);
    assert_eq!(common::summary(&first).totals.created, 1);
    assert!(matches!(
        second,
        Err(CloudrowError::ConcurrentOperation { ref running_kind, .. }) if running_kind == "apply"
    ));

    // The slot is free again once the first call finished.
    h.cloud.set_latency(None);
    assert!(h.orchestrator.sync(TARGET).await.unwrap().is_success());
}

#[tokio::test]
async fn stale_operations_are_reaped() {
    let mut cfg = test_config("ops-stale");
    cfg.engine.stale_after_secs = 0;
    let h = Harness::with_config(cfg).await;
    h.store().await.begin_operation(ghost(0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = h.orchestrator.plan_apply(TARGET).await.unwrap();
    assert!(outcome.is_success(), "plan failed: {:?}", outcome.error);

    let ops = h.orchestrator.list_operations(TARGET, 10).await.unwrap();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].opid, outcome.opid);
    assert_eq!(ops[0].kind, OperationKind::PlanApply);
    assert_eq!(ops[1].opid, "ghost-op");
    assert_eq!(ops[1].status, OperationStatus::Failure);
    assert_eq!(
        ops[1].error.as_deref(),
        Some(&["holder lost: heartbeat expired".to_string()][..])
    );
}

#[tokio::test]
async fn operations_record_params_output_and_errors() {
    let h = Harness::with_modules("ops-log", &["network"]).await;
    h.declare("network", json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}))
        .await;

    let apply = h.orchestrator.apply(TARGET).await.unwrap();
    assert_eq!(apply.kind, OperationKind::Apply);
    assert_eq!(apply.status, OperationStatus::Success);

    let ops = h.orchestrator.list_operations(TARGET, 10).await.unwrap();
    assert_eq!(ops.len(), 2);
    let kinds: Vec<OperationKind> = ops.iter().map(|op| op.kind).collect();
    assert_eq!(kinds, [OperationKind::Apply, OperationKind::Install]);

    let latest = &ops[0];
    assert_eq!(latest.opid, apply.opid);
    assert_eq!(latest.params, json!({ "dry_run": false, "timeout_ms": null }));
    assert_eq!(latest.output.as_ref().unwrap()["totals"]["created"], json!(1));
    assert!(latest.error.is_none());
    assert!(latest.end_date.is_some());
    assert!(latest.start_date <= latest.end_date.unwrap());
}

#[tokio::test]
async fn missing_account_fails_the_operation() {
    let h = Harness::with_modules("ops-no-account", &["network"]).await;
    let outcome = h.orchestrator.apply("other-target").await.unwrap();
    assert!(matches!(outcome.error, Some(CloudrowError::MissingAccount)));

    let err = h.orchestrator.apply("../escape").await.unwrap_err();
    assert!(matches!(err, CloudrowError::InvalidTarget(_)));
}

#[tokio::test]
async fn closed_target_reopens_with_its_history() {
    let h = Harness::with_modules("ops-close", &["network"]).await;
    let stale = h.store().await;
    assert!(h.orchestrator.close_target(TARGET).await);
    assert!(!h.orchestrator.close_target(TARGET).await);
    assert!(!h.orchestrator.close_target("never-opened").await);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(
        stale.list_operations(10).await,
        Err(CloudrowError::RactorError(_))
    ));

    let ops = h.orchestrator.list_operations(TARGET, 10).await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OperationKind::Install);
    let modules = h.orchestrator.list_modules(TARGET).await.unwrap();
    assert!(modules.iter().any(|m| m.name == "network" && m.installed));
}
