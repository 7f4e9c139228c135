mod common;

use cloudrow::CloudrowError;
use common::{Harness, TARGET};
use serde_json::json;

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| (*n).to_string()).collect()
}

#[tokio::test]
async fn install_pulls_in_dependencies() {
    let h = Harness::new("modules-install").await;
    let outcome = h
        .orchestrator
        .install(TARGET, &strings(&["firewall"]))
        .await
        .unwrap();
    assert!(outcome.is_success(), "install failed: {:?}", outcome.error);
    assert_eq!(
        outcome.output.as_ref().unwrap()["installed"],
        json!(["network", "firewall"])
    );

    let modules = h.orchestrator.list_modules(TARGET).await.unwrap();
    let state: Vec<(&str, bool, bool)> = modules
        .iter()
        .map(|m| (m.name.as_str(), m.installed, m.enabled))
        .collect();
    assert_eq!(
        state,
        [("network", true, true), ("firewall", true, true)]
    );
    assert!(h.rows("firewall_rule").await.is_empty());
    assert!(h.rows("subnet").await.is_empty());

    // Installing again is a no-op.
    let outcome = h
        .orchestrator
        .install(TARGET, &strings(&["network"]))
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.output.unwrap()["skipped"], json!(["network"]));
}

#[tokio::test]
async fn unknown_module_is_rejected() {
    let h = Harness::new("modules-unknown").await;
    let outcome = h
        .orchestrator
        .install(TARGET, &strings(&["network", "dns"]))
        .await
        .unwrap();
    assert!(matches!(
        &outcome.error,
        Some(CloudrowError::UnknownModule { names }) if names == &["dns".to_string()]
    ));
    let modules = h.orchestrator.list_modules(TARGET).await.unwrap();
    assert!(modules.iter().all(|m| !m.installed));
}

#[tokio::test]
async fn enabled_dependents_block_uninstall() {
    let h = Harness::with_modules("modules-uninstall", &["firewall"]).await;

    let outcome = h
        .orchestrator
        .uninstall(TARGET, &strings(&["network"]))
        .await
        .unwrap();
    assert!(matches!(
        &outcome.error,
        Some(CloudrowError::DependentModuleStillEnabled { module, dependents })
            if module == "network" && dependents == &["firewall".to_string()]
    ));

    let err = h
        .orchestrator
        .set_enabled(TARGET, "network", false)
        .await
        .unwrap_err();
    assert!(matches!(err, CloudrowError::DependentModuleStillEnabled { .. }));

    // A disabled dependent goes along with its dependency.
    h.orchestrator
        .set_enabled(TARGET, "firewall", false)
        .await
        .unwrap();
    let outcome = h
        .orchestrator
        .uninstall(TARGET, &strings(&["network"]))
        .await
        .unwrap();
    assert!(outcome.is_success(), "uninstall failed: {:?}", outcome.error);
    let output = outcome.output.unwrap();
    assert_eq!(output["uninstalled"], json!(["firewall", "network"]));
    assert_eq!(output["cascaded"], json!(["firewall"]));

    let modules = h.orchestrator.list_modules(TARGET).await.unwrap();
    assert!(modules.iter().all(|m| !m.installed));
}

#[tokio::test]
async fn enabling_requires_enabled_dependencies() {
    let h = Harness::with_modules("modules-enable", &["firewall"]).await;
    h.orchestrator
        .set_enabled(TARGET, "firewall", false)
        .await
        .unwrap();
    h.orchestrator
        .set_enabled(TARGET, "network", false)
        .await
        .unwrap();

    let err = h
        .orchestrator
        .set_enabled(TARGET, "firewall", true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CloudrowError::DependencyNotEnabled { ref dependencies, .. } if dependencies == &["network".to_string()]
    ));

    let err = h
        .orchestrator
        .set_enabled(TARGET, "dns", true)
        .await
        .unwrap_err();
    assert!(matches!(err, CloudrowError::ModuleNotInstalled(name) if name == "dns"));
}

#[tokio::test]
async fn disabled_modules_are_not_reconciled() {
    let h = Harness::with_modules("modules-disabled", &["network"]).await;
    h.declare("network", json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}))
        .await;
    h.orchestrator
        .set_enabled(TARGET, "network", false)
        .await
        .unwrap();

    let outcome = h.orchestrator.apply(TARGET).await.unwrap();
    assert!(outcome.is_success());
    assert!(common::summary(&outcome).entities.is_empty());
    assert!(h.cloud.calls().is_empty());
}

#[tokio::test]
async fn rpc_dispatches_to_the_module() {
    let h = Harness::with_modules("modules-rpc", &["firewall"]).await;
    h.declare("network", json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}))
        .await;
    h.declare(
        "subnet",
        json!({"name": "subnet-a", "network": "net-a", "cidr_block": "10.0.1.0/24"}),
    )
    .await;
    h.declare(
        "firewall_rule",
        json!({
            "name": "allow-ssh",
            "network": "net-a",
            "direction": "ingress",
            "protocol": "tcp",
            "port": 22,
            "source_ranges": ["10.0.0.0/8"],
            "priority": 1000,
            "enabled": true,
        }),
    )
    .await;

    let outcome = h
        .orchestrator
        .rpc(TARGET, "network", "describe", json!({"name": "net-a"}))
        .await
        .unwrap();
    assert!(outcome.is_success(), "rpc failed: {:?}", outcome.error);
    let output = outcome.output.unwrap();
    assert_eq!(output["network"]["cidr_block"], json!("10.0.0.0/16"));
    assert_eq!(output["subnets"].as_array().map(Vec::len), Some(1));

    let outcome = h
        .orchestrator
        .rpc(
            TARGET,
            "firewall",
            "toggle",
            json!({"network": "net-a", "name": "allow-ssh", "enabled": false}),
        )
        .await
        .unwrap();
    assert!(outcome.is_success(), "rpc failed: {:?}", outcome.error);
    assert_eq!(outcome.output.unwrap()["previous"], json!(true));
    let rules = h.rows("firewall_rule").await;
    assert_eq!(rules[0].record.get("enabled"), Some(&json!(false)));

    let ops = h.orchestrator.list_operations(TARGET, 1).await.unwrap();
    assert_eq!(ops[0].params["method"], json!("toggle"));
}

#[tokio::test]
async fn rpc_errors_are_recorded() {
    let h = Harness::with_modules("modules-rpc-errors", &["firewall"]).await;

    let outcome = h
        .orchestrator
        .rpc(TARGET, "network", "reboot", json!({}))
        .await
        .unwrap();
    assert!(matches!(
        &outcome.error,
        Some(CloudrowError::UnknownRpc { module, method }) if module == "network" && method == "reboot"
    ));

    let outcome = h
        .orchestrator
        .rpc(TARGET, "network", "describe", json!({"name": 7}))
        .await
        .unwrap();
    assert!(matches!(&outcome.error, Some(CloudrowError::InvalidParams(_))));

    h.orchestrator
        .set_enabled(TARGET, "firewall", false)
        .await
        .unwrap();
    let outcome = h
        .orchestrator
        .rpc(TARGET, "firewall", "toggle", json!({}))
        .await
        .unwrap();
    assert!(matches!(&outcome.error, Some(CloudrowError::ModuleNotEnabled(m)) if m == "firewall"));

    let ops = h.orchestrator.list_operations(TARGET, 3).await.unwrap();
    assert_eq!(ops.len(), 3);
    assert!(ops.iter().all(|op| op.error.is_some()));
}
