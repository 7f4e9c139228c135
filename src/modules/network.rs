//! Networks and their subnets.
//!
//! A subnet refers to its network by name in storage and by cloud id on the wire; the mapper
//! translates through the context's record index.

use crate::cloud::{CloudObject, Scope};
use crate::error::{CloudApiError, CloudrowError};
use crate::mapper::{Entity, Mapper, MapperContext, decode_attributes, list_objects};
use crate::registry::{ModuleDef, RpcContext, RpcHandler};
use async_trait::async_trait;
use cloudrow_diff::Record;
use cloudrow_schema::{ColumnSpec, TableSpec};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;

pub const MODULE_NAME: &str = "network";
const NETWORK_KIND: &str = "network";
const SUBNET_KIND: &str = "subnet";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub cidr_block: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
}

impl Entity for Network {
    const ENTITY_TYPE: &'static str = "network";

    fn table() -> TableSpec {
        TableSpec::new(Self::ENTITY_TYPE)
            .column(ColumnSpec::text("name").immutable())
            .column(ColumnSpec::text("cidr_block").immutable())
            .column(ColumnSpec::text("description").optional())
            .column(ColumnSpec::text("network_id").computed())
            .identity(["name"])
            .cloud_id("network_id")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub name: String,
    /// Name of the parent network.
    pub network: String,
    pub cidr_block: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
}

impl Entity for Subnet {
    const ENTITY_TYPE: &'static str = "subnet";

    fn table() -> TableSpec {
        TableSpec::new(Self::ENTITY_TYPE)
            .column(ColumnSpec::text("name").immutable())
            .column(
                ColumnSpec::text("network")
                    .immutable()
                    .references(Network::ENTITY_TYPE, "name"),
            )
            .column(ColumnSpec::text("cidr_block").immutable())
            .column(ColumnSpec::text("availability_zone").optional())
            .column(ColumnSpec::text("subnet_id").computed())
            .identity(["name"])
            .cloud_id("subnet_id")
    }
}

/// Subnet as the cloud API sees it.
#[derive(Debug, Deserialize)]
struct SubnetAttributes {
    name: String,
    network_id: String,
    cidr_block: String,
    #[serde(default)]
    availability_zone: Option<String>,
}

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

fn missing_id(kind: &str, name: &str) -> CloudApiError {
    CloudApiError::InvalidRequest(format!("{kind} {name} has no cloud id"))
}

fn network_from(obj: CloudObject) -> Result<Network, CloudApiError> {
    let mut network: Network = decode_attributes(obj.attributes)?;
    network.network_id = Some(obj.id);
    Ok(network)
}

pub struct NetworkMapper;

#[async_trait]
impl Mapper for NetworkMapper {
    type Entity = Network;

    fn id_of(&self, network: &Network) -> Option<String> {
        Some(network.name.clone())
    }

    fn read_cloud<'a>(
        &'a self,
        ctx: &'a MapperContext,
        scope: &'a Scope,
    ) -> BoxStream<'a, Result<Network, CloudApiError>> {
        list_objects(ctx, scope, NETWORK_KIND)
            .map(|obj| network_from(obj?))
            .boxed()
    }

    async fn create_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        declared: &Network,
        idempotency_token: &str,
    ) -> Result<Network, CloudApiError> {
        let attributes = record(json!({
            "name": declared.name,
            "cidr_block": declared.cidr_block,
            "description": declared.description,
        }));
        let obj = ctx
            .cloud()
            .create(scope, NETWORK_KIND, cloudrow_diff::normalize(attributes), idempotency_token)
            .await?;
        network_from(obj)
    }

    async fn update_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        declared: &Network,
        observed: &Network,
    ) -> Result<Network, CloudApiError> {
        let id = observed
            .network_id
            .as_deref()
            .ok_or_else(|| missing_id(NETWORK_KIND, &observed.name))?;
        let patch = record(json!({ "description": declared.description }));
        let obj = ctx.cloud().update(scope, NETWORK_KIND, id, patch).await?;
        network_from(obj)
    }

    async fn delete_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        observed: &Network,
    ) -> Result<(), CloudApiError> {
        let id = observed
            .network_id
            .as_deref()
            .ok_or_else(|| missing_id(NETWORK_KIND, &observed.name))?;
        ctx.cloud().delete(scope, NETWORK_KIND, id).await
    }
}

pub struct SubnetMapper;

impl SubnetMapper {
    /// `None` when the parent network is not known; such subnets are skipped.
    fn from_object(
        ctx: &MapperContext,
        scope: &Scope,
        obj: CloudObject,
    ) -> Result<Option<Subnet>, CloudApiError> {
        let attrs: SubnetAttributes =
            serde_json::from_value(Value::Object(cloudrow_diff::normalize(obj.attributes)))
                .map_err(|e| CloudApiError::Decode(format!("subnet {}: {e}", obj.id)))?;
        let Some(network) = ctx.key_for_cloud_id(Network::ENTITY_TYPE, scope.region(), &attrs.network_id)
        else {
            warn!(
                subnet_id = %obj.id,
                network_id = %attrs.network_id,
                region = scope.api_region(),
                "subnet of an unknown network, ignored"
            );
            return Ok(None);
        };
        Ok(Some(Subnet {
            name: attrs.name,
            network,
            cidr_block: attrs.cidr_block,
            availability_zone: attrs.availability_zone,
            subnet_id: Some(obj.id),
        }))
    }

    fn network_id(ctx: &MapperContext, scope: &Scope, subnet: &Subnet) -> Result<String, CloudApiError> {
        ctx.cloud_id_of(Network::ENTITY_TYPE, scope.region(), &subnet.network)
            .ok_or_else(|| missing_id(NETWORK_KIND, &subnet.network))
    }
}

#[async_trait]
impl Mapper for SubnetMapper {
    type Entity = Subnet;

    fn id_of(&self, subnet: &Subnet) -> Option<String> {
        Some(subnet.name.clone())
    }

    fn read_cloud<'a>(
        &'a self,
        ctx: &'a MapperContext,
        scope: &'a Scope,
    ) -> BoxStream<'a, Result<Subnet, CloudApiError>> {
        list_objects(ctx, scope, SUBNET_KIND)
            .filter_map(move |obj| async move {
                match obj.and_then(|obj| Self::from_object(ctx, scope, obj)) {
                    Ok(Some(subnet)) => Some(Ok(subnet)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                }
            })
            .boxed()
    }

    async fn create_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        declared: &Subnet,
        idempotency_token: &str,
    ) -> Result<Subnet, CloudApiError> {
        let network_id = Self::network_id(ctx, scope, declared)?;
        let attributes = record(json!({
            "name": declared.name,
            "network_id": network_id,
            "cidr_block": declared.cidr_block,
            "availability_zone": declared.availability_zone,
        }));
        let obj = ctx
            .cloud()
            .create(scope, SUBNET_KIND, cloudrow_diff::normalize(attributes), idempotency_token)
            .await?;
        Ok(Subnet {
            subnet_id: Some(obj.id),
            ..declared.clone()
        })
    }

    async fn update_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        declared: &Subnet,
        observed: &Subnet,
    ) -> Result<Subnet, CloudApiError> {
        let id = observed
            .subnet_id
            .as_deref()
            .ok_or_else(|| missing_id(SUBNET_KIND, &observed.name))?;
        let patch = record(json!({ "availability_zone": declared.availability_zone }));
        ctx.cloud().update(scope, SUBNET_KIND, id, patch).await?;
        Ok(Subnet {
            subnet_id: Some(id.to_string()),
            ..declared.clone()
        })
    }

    async fn delete_in_cloud(
        &self,
        ctx: &MapperContext,
        scope: &Scope,
        observed: &Subnet,
    ) -> Result<(), CloudApiError> {
        let id = observed
            .subnet_id
            .as_deref()
            .ok_or_else(|| missing_id(SUBNET_KIND, &observed.name))?;
        ctx.cloud().delete(scope, SUBNET_KIND, id).await
    }
}

#[derive(Debug, Deserialize)]
struct DescribeParams {
    name: String,
    #[serde(default)]
    region: Option<String>,
}

/// `describe {name, region?}`: a declared network with its declared subnets.
pub struct Describe;

#[async_trait]
impl RpcHandler for Describe {
    async fn call(&self, ctx: &RpcContext, params: Value) -> Result<Value, CloudrowError> {
        let params: DescribeParams = serde_json::from_value(params)
            .map_err(|e| CloudrowError::InvalidParams(e.to_string()))?;
        let region = params
            .region
            .unwrap_or_else(|| ctx.account.default_region.clone());
        let in_region = |r: &Option<String>| r.as_deref().unwrap_or(&ctx.account.default_region) == region;

        let networks = ctx.store.read_records(Arc::new(Network::table())).await?;
        let Some(network) = networks
            .into_iter()
            .find(|row| in_region(&row.region) && row.record.get("name") == Some(&json!(params.name)))
        else {
            return Err(CloudrowError::InvalidParams(format!(
                "no network {} in {region}",
                params.name
            )));
        };

        let subnets: Vec<Value> = ctx
            .store
            .read_records(Arc::new(Subnet::table()))
            .await?
            .into_iter()
            .filter(|row| in_region(&row.region) && row.record.get("network") == Some(&json!(params.name)))
            .map(|row| Value::Object(row.record))
            .collect();

        Ok(json!({
            "region": region,
            "network": Value::Object(network.record),
            "subnets": subnets,
        }))
    }
}

pub fn module() -> ModuleDef {
    ModuleDef::new(MODULE_NAME, "1.0.0")
        .mapper(NetworkMapper)
        .mapper(SubnetMapper)
        .rpc("describe", Describe)
}
