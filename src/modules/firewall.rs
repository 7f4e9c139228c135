use super::network::Network;
use crate::cloud::{CloudObject, Scope};
use crate::error::{CloudApiError, CloudrowError};
use crate::mapper::{Entity, Mapper, MapperContext, list_objects};
use crate::registry::{ModuleDef, RpcContext, RpcHandler};
use async_trait::async_trait;
use cloudrow_diff::{Record, normalize};
use cloudrow_schema::{ColumnSpec, TableSpec};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

pub const MODULE_NAME: &str = "firewall";
const RULE_KIND: &str = "firewall_rule";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

fn default_priority() -> u32 {
    1000
}

fn default_enabled() -> bool {
    true
}

/// Traffic rule attached to a network. Identified by network and name together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub name: String,
    pub network: String,
    pub direction: RuleDirection,
    /// `tcp`, `udp`, `icmp` or `all`.
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub source_ranges: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl Entity for FirewallRule {
    const ENTITY_TYPE: &'static str = "firewall_rule";

    fn table() -> TableSpec {
        TableSpec::new(Self::ENTITY_TYPE)
            .column(ColumnSpec::text("name").immutable())
            .column(
                ColumnSpec::text("network")
                    .immutable()
                    .references(Network::ENTITY_TYPE, "name"),
            )
            .column(ColumnSpec::text("direction").immutable())
            .column(ColumnSpec::text("protocol"))
            .column(ColumnSpec::integer("port").optional())
            .column(ColumnSpec::json("source_ranges"))
            .column(ColumnSpec::integer("priority"))
            .column(ColumnSpec::boolean("enabled"))
            .column(ColumnSpec::text("rule_id").computed())
            .identity(["network", "name"])
            .cloud_id("rule_id")
    }
}

#[derive(Debug, Deserialize)]
struct RuleAttributes {
    name: String,
    network_id: String,
    direction: RuleDirection,
    protocol: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    source_ranges: Vec<String>,
    priority: u32,
    enabled: bool,
}

/// Rejects rules the cloud would refuse, before calling it.
fn check_rule(rule: &FirewallRule) -> Result<(), CloudApiError> {
    match (rule.protocol.as_str(), rule.port) {
        ("tcp" | "udp", _) | ("icmp" | "all", None) => Ok(()),
        ("icmp" | "all", Some(port)) => Err(CloudApiError::InvalidRequest(format!(
            "firewall rule {}: protocol {} takes no port (got {port})",
            rule.name, rule.protocol
        ))),
        (other, _) => Err(CloudApiError::InvalidRequest(format!(
            "firewall rule {}: unknown protocol {other}",
            rule.name
        ))),
    }
}

fn mutable_attributes(rule: &FirewallRule) -> Record {
    match json!({
        "protocol": rule.protocol,
        "port": rule.port,
        "source_ranges": rule.source_ranges,
        "priority": rule.priority,
        "enabled": rule.enabled,
    }) {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

pub struct FirewallRuleMapper;

impl FirewallRuleMapper {
    fn from_object(
        ctx: &MapperContext,
        scope: &Scope,
        obj: CloudObject,
    ) -> Result<Option<FirewallRule>, CloudApiError> {
        let attrs: RuleAttributes = serde_json::from_value(Value::Object(normalize(obj.attributes)))
            .map_err(|e| CloudApiError::Decode(format!("firewall rule {}: {e}", obj.id)))?;
        let Some(network) =
            ctx.key_for_cloud_id(Network::ENTITY_TYPE, scope.region(), &attrs.network_id)
        else {
            warn!(
                rule_id = %obj.id,
                network_id = %attrs.network_id,
                region = scope.api_region(),
                "firewall rule of an unknown network, ignored"
            );
            return Ok(None);
        };
        Ok(Some(FirewallRule {
            name: attrs.name,
            network,
            direction: attrs.direction,
            protocol: attrs.protocol,
            port: attrs.port,
            source_ranges: attrs.source_ranges,
            priority: attrs.priority,
            enabled: attrs.enabled,
            rule_id: Some(obj.id),
        }))
    }

    fn rule_id(rule: &FirewallRule) -> Result<&str, CloudApiError> {
        rule.rule_id.as_deref().ok_or_else(|| {
            CloudApiError::InvalidRequest(format!("firewall rule {} has no cloud id", rule.name))
        })
    }
}

#[async_trait]
impl Mapper for FirewallRuleMapper {
    type Entity = FirewallRule;

    fn id_of(&self, rule: &FirewallRule) -> Option<String> {
        Some(format!("{}|{}", rule.network, rule.name))
    }

    fn read_cloud<'a>(
        &'a self,
        ctx: &'a MapperContext,
        scope: &'a Scope,
    ) -> BoxStream<'a, Result<FirewallRule, CloudApiError>> {
        list_objects(ctx, scope, RULE_KIND)
            .filter_map(move |obj| async move {
                obj.and_then(|obj| Self::from_object(ctx, scope, obj))
                    .transpose()
            })
            .boxed()
    }

    async fn create_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        declared: &FirewallRule,
        idempotency_token: &str,
    ) -> Result<FirewallRule, CloudApiError> {
        check_rule(declared)?;
        let network_id = ctx
            .cloud_id_of(Network::ENTITY_TYPE, scope.region(), &declared.network)
            .ok_or_else(|| {
                CloudApiError::InvalidRequest(format!("network {} has no cloud id", declared.network))
            })?;
        let mut attributes = mutable_attributes(declared);
        attributes.insert("name".into(), json!(declared.name));
        attributes.insert("network_id".into(), json!(network_id));
        attributes.insert("direction".into(), json!(declared.direction));
        let obj = ctx
            .cloud()
            .create(scope, RULE_KIND, normalize(attributes), idempotency_token)
            .await?;
        Ok(FirewallRule {
            rule_id: Some(obj.id),
            ..declared.clone()
        })
    }

    async fn update_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        declared: &FirewallRule,
        observed: &FirewallRule,
    ) -> Result<FirewallRule, CloudApiError> {
        check_rule(declared)?;
        let id = Self::rule_id(observed)?;
        ctx.cloud()
            .update(scope, RULE_KIND, id, mutable_attributes(declared))
            .await?;
        Ok(FirewallRule {
            rule_id: Some(id.to_string()),
            ..declared.clone()
        })
    }

    async fn delete_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        observed: &FirewallRule,
    ) -> Result<(), CloudApiError> {
        ctx.cloud()
            .delete(scope, RULE_KIND, Self::rule_id(observed)?)
            .await
    }
}

#[derive(Debug, Deserialize)]
struct ToggleParams {
    network: String,
    name: String,
    enabled: bool,
    #[serde(default)]
    region: Option<String>,
}

/// `toggle {network, name, enabled, region?}`: flips the declared `enabled` flag of a rule.
/// The cloud is untouched until the next apply.
pub struct Toggle;

#[async_trait]
impl RpcHandler for Toggle {
    async fn call(&self, ctx: &RpcContext, params: Value) -> Result<Value, CloudrowError> {
        let params: ToggleParams = serde_json::from_value(params)
            .map_err(|e| CloudrowError::InvalidParams(e.to_string()))?;
        let region = params
            .region
            .unwrap_or_else(|| ctx.account.default_region.clone());
        let table = Arc::new(FirewallRule::table());

        let row = ctx
            .store
            .read_records(table.clone())
            .await?
            .into_iter()
            .find(|row| {
                row.region.as_deref().unwrap_or(&ctx.account.default_region) == region
                    && row.record.get("network") == Some(&json!(params.network))
                    && row.record.get("name") == Some(&json!(params.name))
            })
            .ok_or_else(|| {
                CloudrowError::InvalidParams(format!(
                    "no firewall rule {}/{} in {region}",
                    params.network, params.name
                ))
            })?;

        let previous = row.record.get("enabled").and_then(Value::as_bool);
        let mut record = Record::new();
        record.insert("enabled".into(), json!(params.enabled));
        ctx.store
            .update_record(table, row.row_id, vec!["enabled".into()], record)
            .await?;
        info!(
            network = %params.network,
            rule = %params.name,
            enabled = params.enabled,
            "firewall rule toggled"
        );
        Ok(json!({ "previous": previous, "enabled": params.enabled }))
    }
}

pub fn module() -> ModuleDef {
    ModuleDef::new(MODULE_NAME, "1.0.0")
        .depends_on(super::network::MODULE_NAME)
        .mapper(FirewallRuleMapper)
        .rpc("toggle", Toggle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(protocol: &str, port: Option<u16>) -> FirewallRule {
        FirewallRule {
            name: "allow-web".into(),
            network: "net-a".into(),
            direction: RuleDirection::Ingress,
            protocol: protocol.into(),
            port,
            source_ranges: vec!["0.0.0.0/0".into()],
            priority: 1000,
            enabled: true,
            rule_id: None,
        }
    }

    #[test]
    fn port_only_with_tcp_or_udp() {
        assert!(check_rule(&rule("tcp", Some(443))).is_ok());
        assert!(check_rule(&rule("icmp", None)).is_ok());
        assert!(check_rule(&rule("icmp", Some(8))).is_err());
        assert!(check_rule(&rule("sctp", None)).is_err());
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let rule: FirewallRule = serde_json::from_value(json!({
            "name": "ssh",
            "network": "net-a",
            "direction": "ingress",
            "protocol": "tcp",
            "port": 22,
        }))
        .unwrap();
        assert_eq!(rule.priority, 1000);
        assert!(rule.enabled);
        assert!(rule.source_ranges.is_empty());
        assert_eq!(
            FirewallRuleMapper.id_of(&rule).as_deref(),
            Some("net-a|ssh")
        );
    }
}
