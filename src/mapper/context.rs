use super::RecordKey;
use super::retry::{retry_policy, timed, with_retry};
use crate::cloud::ResourceApi;
use crate::config::{EngineConfig, RetryConfig};
use crate::error::CloudApiError;
use backon::ExponentialBuilder;
use cloudrow_diff::{Record, values_equal};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// A record known to exist in the cloud (observed, created this run, or planned in a dry run).
#[derive(Debug, Clone)]
struct LiveRecord {
    record: Record,
    cloud_id: Option<String>,
}

/// Records of already-processed entity types, for FK resolution by later types.
#[derive(Debug, Default)]
pub struct RecordIndex {
    live: BTreeMap<String, BTreeMap<RecordKey, LiveRecord>>,
}

impl RecordIndex {
    pub fn insert(
        &mut self,
        entity_type: &str,
        key: RecordKey,
        record: Record,
        cloud_id: Option<String>,
    ) {
        self.live
            .entry(entity_type.to_string())
            .or_default()
            .insert(key, LiveRecord { record, cloud_id });
    }

    pub fn remove(&mut self, entity_type: &str, key: &RecordKey) {
        if let Some(records) = self.live.get_mut(entity_type) {
            records.remove(key);
        }
    }

    pub fn clear_type(&mut self, entity_type: &str) {
        self.live.remove(entity_type);
    }

    pub fn cloud_id_of(&self, entity_type: &str, key: &RecordKey) -> Option<String> {
        self.live
            .get(entity_type)?
            .get(key)
            .and_then(|r| r.cloud_id.clone())
    }

    pub fn key_for_cloud_id(
        &self,
        entity_type: &str,
        region: Option<&str>,
        cloud_id: &str,
    ) -> Option<RecordKey> {
        self.live.get(entity_type)?.iter().find_map(|(key, r)| {
            (key.region.as_deref() == region && r.cloud_id.as_deref() == Some(cloud_id))
                .then(|| key.clone())
        })
    }

    /// Whether a live record of `entity_type` in `region` has `field` equal to `value`.
    pub fn has_live(
        &self,
        entity_type: &str,
        region: Option<&str>,
        field: &str,
        value: &Value,
    ) -> bool {
        self.live.get(entity_type).is_some_and(|records| {
            records.iter().any(|(key, r)| {
                key.region.as_deref() == region
                    && r.record.get(field).is_some_and(|v| values_equal(v, value))
            })
        })
    }
}

/// Everything a mapper may use during one run: the cloud API, FK resolution and call policy.
#[derive(Clone)]
pub struct MapperContext {
    cloud: Arc<dyn ResourceApi>,
    index: Arc<RwLock<RecordIndex>>,
    retry_policy: ExponentialBuilder,
    call_timeout: Duration,
}

impl MapperContext {
    pub fn new(cloud: Arc<dyn ResourceApi>, engine: &EngineConfig, retry: &RetryConfig) -> Self {
        Self {
            cloud,
            index: Arc::new(RwLock::new(RecordIndex::default())),
            retry_policy: retry_policy(retry),
            call_timeout: engine.call_timeout(),
        }
    }

    pub fn cloud(&self) -> &dyn ResourceApi {
        self.cloud.as_ref()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Cloud id of a live record of `parent_type`, by identity key.
    pub fn cloud_id_of(&self, parent_type: &str, region: Option<&str>, id: &str) -> Option<String> {
        let key = RecordKey::new(region.map(str::to_string), id);
        self.read_index(|index| index.cloud_id_of(parent_type, &key))
    }

    /// Identity key (without region) of the live `parent_type` record with this cloud id.
    pub fn key_for_cloud_id(
        &self,
        parent_type: &str,
        region: Option<&str>,
        cloud_id: &str,
    ) -> Option<String> {
        self.read_index(|index| index.key_for_cloud_id(parent_type, region, cloud_id))
            .map(|key| key.id)
    }

    pub fn read_index<T>(&self, f: impl FnOnce(&RecordIndex) -> T) -> T {
        f(&self.index.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn write_index<T>(&self, f: impl FnOnce(&mut RecordIndex) -> T) -> T {
        f(&mut self.index.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// One bounded cloud call with transient-error retry.
    pub async fn call<T, F, Fut>(
        &self,
        action: &str,
        entity_type: &str,
        mut op: F,
    ) -> Result<T, CloudApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CloudApiError>>,
    {
        let limit = self.call_timeout;
        with_retry(self.retry_policy, action, entity_type, || timed(limit, op())).await
    }

    pub(crate) async fn retrying<T, F, Fut>(
        &self,
        action: &str,
        entity_type: &str,
        op: F,
    ) -> Result<T, CloudApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CloudApiError>>,
    {
        with_retry(self.retry_policy, action, entity_type, op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn resolves_both_directions() {
        let mut index = RecordIndex::default();
        index.insert(
            "network",
            RecordKey::new(Some("us-east-1".into()), "net-a"),
            rec(json!({"name": "net-a", "network_id": "network-1"})),
            Some("network-1".into()),
        );

        let key = RecordKey::new(Some("us-east-1".into()), "net-a");
        assert_eq!(index.cloud_id_of("network", &key).as_deref(), Some("network-1"));
        assert_eq!(
            index.key_for_cloud_id("network", Some("us-east-1"), "network-1"),
            Some(key)
        );
        assert!(index.key_for_cloud_id("network", Some("eu-west-1"), "network-1").is_none());
        assert!(index.has_live("network", Some("us-east-1"), "name", &json!("net-a")));
        assert!(!index.has_live("network", Some("us-east-1"), "name", &json!("net-b")));
    }
}
