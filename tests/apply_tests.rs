mod common;

use cloudrow::cloud::{CallOp, CloudCall};
use cloudrow::engine::{Direction, EntityCounts, PlanAction};
use cloudrow::{CloudApiError, CloudrowError};
use common::{Harness, REGION, TARGET, names, summary};
use serde_json::{Value, json};
use tokio::time::Instant;

fn position(calls: &[CloudCall], op: CallOp, kind: &str) -> usize {
    calls
        .iter()
        .position(|c| c.op == op && c.kind == kind)
        .unwrap_or_else(|| panic!("no {op:?} call for {kind}"))
}

async fn declare_network_and_subnet(h: &Harness) -> (i64, i64) {
    let net = h
        .declare("network", json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}))
        .await;
    let subnet = h
        .declare(
            "subnet",
            json!({"name": "subnet-a", "network": "net-a", "cidr_block": "10.0.1.0/24"}),
        )
        .await;
    (net, subnet)
}

#[tokio::test]
async fn apply_creates_network_and_subnet() {
    let h = Harness::with_modules("apply-e2e", &["network"]).await;
    declare_network_and_subnet(&h).await;

    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(outcome.is_success(), "apply failed: {:?}", outcome.error);

    let summary = summary(&outcome);
    assert_eq!(
        summary.totals,
        EntityCounts {
            created: 2,
            updated: 0,
            deleted: 0,
            failed: 0
        }
    );
    assert_eq!(summary.direction, Direction::Apply);
    assert!(!summary.dry_run);

    let live_subnets = h.live("subnet");
    assert_eq!(live_subnets.len(), 1);
    assert_eq!(names(&h.live("network")), ["net-a"]);
    assert_eq!(live_subnets[0].get("network_id"), Some(&json!("network-00000001")));

    // Computed fields are written back to the declared rows.
    let net_rows = h.rows("network").await;
    assert_eq!(net_rows[0].record.get("network_id"), Some(&json!("network-00000001")));
    let subnet_rows = h.rows("subnet").await;
    assert_eq!(subnet_rows[0].record.get("subnet_id"), Some(&json!("subnet-00000001")));
}

#[tokio::test]
async fn second_apply_is_a_no_op() {
    let h = Harness::with_modules("apply-idempotent", &["network"]).await;
    declare_network_and_subnet(&h).await;
    assert!(h.orchestrator.apply(TARGET).await.unwrap().is_success());
    h.cloud.clear_calls();

    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(outcome.is_success());
    let summary = summary(&outcome);
    assert_eq!(summary.totals, EntityCounts::default());
    assert!(summary.rows.is_empty());
    assert_eq!(summary.passes, 1);
    assert!(h.cloud.mutation_calls().is_empty());
}

#[tokio::test]
async fn diff_creates_missing_and_deletes_extra() {
    let h = Harness::with_modules("apply-diff", &["network"]).await;
    h.cloud.insert_object(
        REGION,
        "network",
        common::record(json!({"name": "net-b", "cidr_block": "10.2.0.0/16"})),
    );
    h.cloud.insert_object(
        REGION,
        "network",
        common::record(json!({"name": "net-c", "cidr_block": "10.3.0.0/16"})),
    );
    h.declare("network", json!({"name": "net-a", "cidr_block": "10.1.0.0/16"}))
        .await;
    h.declare("network", json!({"name": "net-b", "cidr_block": "10.2.0.0/16"}))
        .await;

    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(outcome.is_success(), "apply failed: {:?}", outcome.error);
    let summary = summary(&outcome);
    assert_eq!(summary.counts("network").created, 1);
    assert_eq!(summary.counts("network").deleted, 1);
    assert_eq!(summary.counts("network").updated, 0);
    assert_eq!(names(&h.live("network")), ["net-a", "net-b"]);

    // net-b was already there: no update call, only its cloud id recorded locally.
    let updates = h
        .cloud
        .mutation_calls()
        .into_iter()
        .filter(|c| c.op == CallOp::Update)
        .count();
    assert_eq!(updates, 0);
    let rows = h.rows("network").await;
    assert!(rows.iter().all(|r| r.record.contains_key("network_id")));
}

#[tokio::test]
async fn parents_created_first_and_deleted_last() {
    let h = Harness::with_modules("apply-order", &["network"]).await;
    let (net, subnet) = declare_network_and_subnet(&h).await;
    assert!(h.orchestrator.apply(TARGET).await.unwrap().is_success());

    let calls = h.cloud.mutation_calls();
    assert!(position(&calls, CallOp::Create, "network") < position(&calls, CallOp::Create, "subnet"));

    h.cloud.clear_calls();
    h.undeclare("subnet", subnet).await;
    h.undeclare("network", net).await;
    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(outcome.is_success(), "apply failed: {:?}", outcome.error);
    assert_eq!(summary(&outcome).totals.deleted, 2);

    let calls = h.cloud.mutation_calls();
    assert!(position(&calls, CallOp::Delete, "subnet") < position(&calls, CallOp::Delete, "network"));
    assert!(h.live("network").is_empty());
    assert!(h.live("subnet").is_empty());
}

#[tokio::test]
async fn plan_apply_changes_nothing() {
    let h = Harness::with_modules("apply-plan", &["network"]).await;
    declare_network_and_subnet(&h).await;

    let outcome = h.orchestrator.plan_apply(TARGET).await.unwrap();
    assert!(outcome.is_success(), "plan failed: {:?}", outcome.error);
    let summary = summary(&outcome);
    assert!(summary.dry_run);
    assert_eq!(summary.totals.created, 2);
    let planned: Vec<(PlanAction, &str)> = summary
        .rows
        .iter()
        .map(|r| (r.action, r.table_name.as_str()))
        .collect();
    assert_eq!(
        planned,
        [(PlanAction::Create, "network"), (PlanAction::Create, "subnet")]
    );

    assert!(h.cloud.mutation_calls().is_empty());
    assert!(h.live("network").is_empty());
    let rows = h.rows("network").await;
    assert!(!rows[0].record.contains_key("network_id"));
}

#[tokio::test]
async fn mutable_change_updates_in_place() {
    let h = Harness::with_modules("apply-update", &["network"]).await;
    let (net, _) = declare_network_and_subnet(&h).await;
    assert!(h.orchestrator.apply(TARGET).await.unwrap().is_success());
    h.cloud.clear_calls();

    h.redeclare("network", net, json!({"description": "core"})).await;
    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(outcome.is_success(), "apply failed: {:?}", outcome.error);
    let summary = summary(&outcome);
    assert_eq!(summary.counts("network").updated, 1);
    assert_eq!(summary.rows[0].action, PlanAction::Update);

    let calls = h.cloud.mutation_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].op, CallOp::Update);
    assert_eq!(h.live("network")[0].get("description"), Some(&json!("core")));
}

#[tokio::test]
async fn immutable_change_replaces() {
    let h = Harness::with_modules("apply-replace", &["network"]).await;
    let net = h
        .declare("network", json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}))
        .await;
    assert!(h.orchestrator.apply(TARGET).await.unwrap().is_success());
    h.cloud.clear_calls();

    h.redeclare("network", net, json!({"cidr_block": "10.9.0.0/16"})).await;
    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(outcome.is_success(), "apply failed: {:?}", outcome.error);
    let summary = summary(&outcome);
    assert_eq!(summary.counts("network").updated, 1);
    assert_eq!(summary.counts("network").created, 0);
    assert_eq!(summary.rows[0].action, PlanAction::Replace);

    let ops: Vec<CallOp> = h.cloud.mutation_calls().into_iter().map(|c| c.op).collect();
    assert_eq!(ops, [CallOp::Delete, CallOp::Create]);
    let live = h.cloud.objects(REGION, "network");
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, "network-00000002");
    assert_eq!(live[0].attributes.get("cidr_block"), Some(&json!("10.9.0.0/16")));
    let rows = h.rows("network").await;
    assert_eq!(rows[0].record.get("network_id"), Some(&json!("network-00000002")));
}

#[tokio::test]
async fn delete_of_vanished_object_succeeds() {
    let h = Harness::with_modules("apply-not-found", &["network"]).await;
    h.cloud.insert_object(
        REGION,
        "network",
        common::record(json!({"name": "net-old", "cidr_block": "10.0.0.0/16"})),
    );
    // Gone by the time the delete lands.
    h.cloud.fail_next_after_commit(
        CallOp::Delete,
        "network",
        CloudApiError::NotFound("network net-old".into()),
        1,
    );

    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(outcome.is_success(), "apply failed: {:?}", outcome.error);
    assert_eq!(summary(&outcome).totals.deleted, 1);
    assert!(h.live("network").is_empty());
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let h = Harness::with_modules("apply-retry", &["network"]).await;
    h.declare("network", json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}))
        .await;
    h.cloud.fail_next(
        CallOp::Create,
        "network",
        CloudApiError::Unavailable("503 service unavailable".into()),
        2,
    );

    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(outcome.is_success(), "apply failed: {:?}", outcome.error);
    assert_eq!(summary(&outcome).totals.created, 1);
    let creates = h
        .cloud
        .mutation_calls()
        .into_iter()
        .filter(|c| c.op == CallOp::Create)
        .count();
    assert_eq!(creates, 3);
    assert_eq!(h.live("network").len(), 1);
}

#[tokio::test]
async fn lost_create_response_does_not_duplicate() {
    let h = Harness::with_modules("apply-lost-response", &["network"]).await;
    h.declare("network", json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}))
        .await;
    h.cloud.fail_next_after_commit(
        CallOp::Create,
        "network",
        CloudApiError::Unavailable("connection reset".into()),
        1,
    );

    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(outcome.is_success(), "apply failed: {:?}", outcome.error);
    assert_eq!(h.live("network").len(), 1);
}

#[tokio::test]
async fn failures_are_aggregated_per_record() {
    let h = Harness::with_modules("apply-partial", &["firewall"]).await;
    h.declare("network", json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}))
        .await;
    h.declare(
        "firewall_rule",
        json!({
            "name": "allow-https",
            "network": "net-a",
            "direction": "ingress",
            "protocol": "tcp",
            "port": 443,
            "source_ranges": ["0.0.0.0/0"],
            "priority": 1000,
            "enabled": true,
        }),
    )
    .await;
    h.declare(
        "firewall_rule",
        json!({
            "name": "bad-icmp",
            "network": "net-a",
            "direction": "ingress",
            "protocol": "icmp",
            "port": 8,
            "source_ranges": [],
            "priority": 1000,
            "enabled": true,
        }),
    )
    .await;

    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(!outcome.is_success());
    let Some(CloudrowError::Reconciliation { failures }) = &outcome.error else {
        panic!("expected an aggregated failure, got {:?}", outcome.error);
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].entity_type, "firewall_rule");
    assert_eq!(failures[0].key, "us-east-1|net-a|bad-icmp");
    assert_eq!(failures[0].action, "create");

    // The rest of the run went through.
    let summary = summary(&outcome);
    assert_eq!(summary.totals.created, 2);
    assert_eq!(summary.totals.failed, 1);
    assert_eq!(summary.passes, 2);
    assert_eq!(names(&h.live("firewall_rule")), ["allow-https"]);

    let ops = h.orchestrator.list_operations(TARGET, 1).await.unwrap();
    let lines = ops[0].error.clone().unwrap();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].contains("bad-icmp"));
}

#[tokio::test]
async fn rows_outside_enabled_regions_are_left_alone() {
    let h = Harness::with_modules("apply-regions", &["network"]).await;
    h.declare("network", json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}))
        .await;
    let spec = h.spec("network");
    h.store()
        .await
        .insert_record(
            spec,
            Some("eu-west-1".into()),
            common::record(json!({"name": "net-eu", "cidr_block": "10.5.0.0/16"})),
        )
        .await
        .unwrap();

    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(outcome.is_success(), "apply failed: {:?}", outcome.error);
    assert_eq!(names(&h.live("network")), ["net-a"]);
    assert!(h.cloud.objects("eu-west-1", "network").is_empty());
}

#[tokio::test]
async fn deadline_stops_new_calls() {
    let h = Harness::with_modules("apply-deadline", &["network"]).await;
    h.declare("network", json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}))
        .await;

    let outcome = h
        .orchestrator
        .reconcile(TARGET, Direction::Apply, false, Some(Instant::now()))
        .await
        .unwrap();
    assert!(matches!(
        &outcome.error,
        Some(CloudrowError::OperationTimeout { skipped, .. }) if *skipped > 0
    ));
    assert!(h.live("network").is_empty());
    assert!(h.cloud.mutation_calls().is_empty());

    let ops = h.orchestrator.list_operations(TARGET, 1).await.unwrap();
    assert_eq!(ops[0].params.get("dry_run"), Some(&Value::Bool(false)));
    assert!(ops[0].error.as_ref().unwrap()[0].starts_with("operation timed out"));
}

fn ssh_rule(port: u32) -> Value {
    json!({
        "name": "allow-ssh",
        "network": "net-a",
        "direction": "ingress",
        "protocol": "tcp",
        "port": port,
        "source_ranges": ["10.0.0.0/8"],
        "priority": 1000,
        "enabled": true,
    })
}

#[tokio::test]
async fn undecodable_row_keeps_its_live_object() {
    let h = Harness::with_modules("apply-undecodable", &["firewall"]).await;
    h.declare("network", json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}))
        .await;
    let rule = h.declare("firewall_rule", ssh_rule(22)).await;
    assert!(h.orchestrator.apply(TARGET).await.unwrap().is_success());
    h.cloud.clear_calls();

    h.redeclare("firewall_rule", rule, json!({"port": 70_000})).await;
    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    let Some(CloudrowError::Reconciliation { failures }) = &outcome.error else {
        panic!("expected an aggregated failure, got {:?}", outcome.error);
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key, "us-east-1|net-a|allow-ssh");
    assert_eq!(failures[0].action, "read");

    assert_eq!(names(&h.live("firewall_rule")), ["allow-ssh"]);
    assert!(h.cloud.mutation_calls().is_empty());
}

#[tokio::test]
async fn unreadable_parent_type_blocks_its_children() {
    let h = Harness::with_modules("apply-parent-unreadable", &["network"]).await;
    declare_network_and_subnet(&h).await;
    assert!(h.orchestrator.apply(TARGET).await.unwrap().is_success());
    h.cloud.clear_calls();

    h.cloud.fail_next(
        CallOp::List,
        "network",
        CloudApiError::PermissionDenied("network:List".into()),
        1,
    );
    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(!outcome.is_success());
    let lines = outcome.error_lines().unwrap();
    assert!(
        lines
            .iter()
            .any(|l| l.starts_with("subnet us-east-1|* (read): parent type network unreadable")),
        "{lines:?}"
    );
    // The subnet is neither recreated nor read against an empty network index.
    assert!(h.cloud.mutation_calls().is_empty());
    assert_eq!(names(&h.live("subnet")), ["subnet-a"]);
}

#[tokio::test]
async fn redeclared_resource_is_created_again() {
    let h = Harness::with_modules("apply-redeclare", &["network"]).await;
    let spec = json!({"name": "net-a", "cidr_block": "10.0.0.0/16"});
    let first = h.declare("network", spec.clone()).await;
    assert!(h.orchestrator.apply(TARGET).await.unwrap().is_success());
    h.undeclare("network", first).await;
    assert!(h.orchestrator.apply(TARGET).await.unwrap().is_success());
    assert!(h.live("network").is_empty());

    // Same content, new row: a fresh create, not a replay of the first one.
    let second = h.declare("network", spec).await;
    assert_ne!(first, second);
    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(outcome.is_success(), "apply failed: {:?}", outcome.error);
    assert_eq!(names(&h.live("network")), ["net-a"]);
    let rows = h.rows("network").await;
    assert_eq!(rows[0].record.get("network_id"), Some(&json!("network-00000002")));
}
