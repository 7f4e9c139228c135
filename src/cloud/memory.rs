use super::{CloudObject, Page, ResourceApi, Scope};
use crate::error::CloudApiError;
use async_trait::async_trait;
use cloudrow_diff::Record;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallOp {
    List,
    Get,
    Create,
    Update,
    Delete,
}

/// One call observed by [`MemoryCloud`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudCall {
    pub op: CallOp,
    pub region: String,
    pub kind: String,
    /// Object id for get/update/delete, the created id for successful creates.
    pub id: Option<String>,
}

/// A child kind whose `attribute` must name a live object of `parent_kind` in the same region.
#[derive(Debug, Clone)]
struct ReferenceRule {
    kind: String,
    attribute: String,
    parent_kind: String,
}

#[derive(Debug, Clone)]
struct Fault {
    op: CallOp,
    kind: String,
    error: CloudApiError,
    remaining: usize,
    /// Apply the call, then report the error (lost response).
    after_commit: bool,
}

type Objects = BTreeMap<String, Record>;

#[derive(Debug, Default)]
struct MemoryState {
    /// region -> kind -> id -> attributes
    objects: BTreeMap<String, BTreeMap<String, Objects>>,
    counters: HashMap<String, u64>,
    /// Token -> (region, kind, first response).
    idempotency: HashMap<String, (String, String, CloudObject)>,
    references: Vec<ReferenceRule>,
    faults: Vec<Fault>,
    calls: Vec<CloudCall>,
    latency: Option<Duration>,
}

impl MemoryState {
    fn kind_mut(&mut self, region: &str, kind: &str) -> &mut Objects {
        self.objects
            .entry(region.to_string())
            .or_default()
            .entry(kind.to_string())
            .or_default()
    }

    fn kind(&self, region: &str, kind: &str) -> Option<&Objects> {
        self.objects.get(region).and_then(|k| k.get(kind))
    }

    fn next_id(&mut self, kind: &str) -> String {
        let counter = self.counters.entry(kind.to_string()).or_default();
        *counter += 1;
        format!("{}-{:08x}", kind.replace('_', "-"), *counter)
    }

    /// Returns the injected error for this call, if any, and whether the call still applies.
    fn take_fault(&mut self, op: CallOp, kind: &str) -> Option<(CloudApiError, bool)> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.op == op && f.kind == kind && f.remaining > 0)?;
        fault.remaining -= 1;
        Some((fault.error.clone(), fault.after_commit))
    }

    fn check_references(&self, region: &str, kind: &str, attrs: &Record) -> Result<(), CloudApiError> {
        for rule in self.references.iter().filter(|r| r.kind == kind) {
            let Some(parent_id) = attrs.get(&rule.attribute).and_then(Value::as_str) else {
                continue;
            };
            let live = self
                .kind(region, &rule.parent_kind)
                .is_some_and(|objs| objs.contains_key(parent_id));
            if !live {
                return Err(CloudApiError::InvalidRequest(format!(
                    "{kind}.{} references missing {} {parent_id}",
                    rule.attribute, rule.parent_kind
                )));
            }
        }
        Ok(())
    }

    fn check_no_dependents(&self, region: &str, kind: &str, id: &str) -> Result<(), CloudApiError> {
        for rule in self.references.iter().filter(|r| r.parent_kind == kind) {
            let dependents = self.kind(region, &rule.kind).map_or(0, |objs| {
                objs.values()
                    .filter(|attrs| attrs.get(&rule.attribute).and_then(Value::as_str) == Some(id))
                    .count()
            });
            if dependents > 0 {
                return Err(CloudApiError::InvalidRequest(format!(
                    "{kind} {id} still has {dependents} dependent {}",
                    rule.kind
                )));
            }
        }
        Ok(())
    }
}

/// In-process cloud: objects per region and kind, sequential ids, idempotent creates,
/// referential checks between kinds and scripted failures.
#[derive(Debug)]
pub struct MemoryCloud {
    state: Mutex<MemoryState>,
    page_size: usize,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            page_size: 100,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Creating `kind` requires `attribute` to hold the id of a live `parent_kind`, and a parent
    /// cannot be deleted while such children exist.
    pub fn with_reference(self, kind: &str, attribute: &str, parent_kind: &str) -> Self {
        self.lock().references.push(ReferenceRule {
            kind: kind.to_string(),
            attribute: attribute.to_string(),
            parent_kind: parent_kind.to_string(),
        });
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `times` calls of `op` on `kind` fail with `error`.
    pub fn fail_next(&self, op: CallOp, kind: &str, error: CloudApiError, times: usize) {
        self.lock().faults.push(Fault {
            op,
            kind: kind.to_string(),
            error,
            remaining: times,
            after_commit: false,
        });
    }

    /// The next `times` calls of `op` on `kind` take effect but report `error`.
    pub fn fail_next_after_commit(&self, op: CallOp, kind: &str, error: CloudApiError, times: usize) {
        self.lock().faults.push(Fault {
            op,
            kind: kind.to_string(),
            error,
            remaining: times,
            after_commit: true,
        });
    }

    /// Delay added to every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Out-of-band create, bypassing faults and the call log. Returns the new id.
    pub fn insert_object(&self, region: &str, kind: &str, attributes: Record) -> String {
        let mut state = self.lock();
        let id = state.next_id(kind);
        state.kind_mut(region, kind).insert(id.clone(), attributes);
        id
    }

    /// Out-of-band attribute change.
    pub fn set_attribute(&self, region: &str, kind: &str, id: &str, field: &str, value: Value) -> bool {
        let mut state = self.lock();
        match state.kind_mut(region, kind).get_mut(id) {
            Some(attrs) => {
                attrs.insert(field.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Out-of-band delete.
    pub fn remove_object(&self, region: &str, kind: &str, id: &str) -> bool {
        self.lock().kind_mut(region, kind).remove(id).is_some()
    }

    pub fn objects(&self, region: &str, kind: &str) -> Vec<CloudObject> {
        self.lock().kind(region, kind).map_or_else(Vec::new, |objs| {
            objs.iter()
                .map(|(id, attrs)| CloudObject {
                    id: id.clone(),
                    attributes: attrs.clone(),
                })
                .collect()
        })
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.lock().calls.clone()
    }

    pub fn mutation_calls(&self) -> Vec<CloudCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c.op, CallOp::Create | CallOp::Update | CallOp::Delete))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn log(state: &mut MemoryState, op: CallOp, scope: &Scope, kind: &str, id: Option<String>) {
        state.calls.push(CloudCall {
            op,
            region: scope.api_region().to_string(),
            kind: kind.to_string(),
            id,
        });
    }
}

#[async_trait]
impl ResourceApi for MemoryCloud {
    async fn list(
        &self,
        scope: &Scope,
        kind: &str,
        page_token: Option<String>,
    ) -> Result<Page, CloudApiError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        Self::log(&mut state, CallOp::List, scope, kind, None);
        if let Some((err, _)) = state.take_fault(CallOp::List, kind) {
            return Err(err);
        }

        let Some(objs) = state.kind(scope.api_region(), kind) else {
            return Ok(Page::default());
        };
        let mut iter = objs
            .iter()
            .filter(|(id, _)| page_token.as_deref().is_none_or(|after| id.as_str() > after))
            .take(self.page_size + 1);
        let items: Vec<CloudObject> = iter
            .by_ref()
            .take(self.page_size)
            .map(|(id, attrs)| CloudObject {
                id: id.clone(),
                attributes: attrs.clone(),
            })
            .collect();
        let next_page_token = match iter.next() {
            Some(_) => items.last().map(|o| o.id.clone()),
            None => None,
        };
        Ok(Page {
            items,
            next_page_token,
        })
    }

    async fn get(&self, scope: &Scope, kind: &str, id: &str) -> Result<CloudObject, CloudApiError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        Self::log(&mut state, CallOp::Get, scope, kind, Some(id.to_string()));
        if let Some((err, _)) = state.take_fault(CallOp::Get, kind) {
            return Err(err);
        }
        state
            .kind(scope.api_region(), kind)
            .and_then(|objs| objs.get(id))
            .map(|attrs| CloudObject {
                id: id.to_string(),
                attributes: attrs.clone(),
            })
            .ok_or_else(|| CloudApiError::NotFound(format!("{kind} {id}")))
    }

    async fn create(
        &self,
        scope: &Scope,
        kind: &str,
        attributes: Record,
        idempotency_token: &str,
    ) -> Result<CloudObject, CloudApiError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        let region = scope.api_region().to_string();
        let lost_response = match state.take_fault(CallOp::Create, kind) {
            Some((err, false)) => {
                Self::log(&mut state, CallOp::Create, scope, kind, None);
                return Err(err);
            }
            Some((err, true)) => Some(err),
            None => None,
        };

        // A known key replays the first response, even if that object is gone by now.
        let replayed = state
            .idempotency
            .get(idempotency_token)
            .filter(|(r, k, _)| *r == region && k == kind)
            .map(|(_, _, created)| created.clone());
        let created = match replayed {
            Some(created) => created,
            None => {
                state.check_references(&region, kind, &attributes)?;
                let id = state.next_id(kind);
                state.kind_mut(&region, kind).insert(id.clone(), attributes.clone());
                let created = CloudObject { id, attributes };
                state.idempotency.insert(
                    idempotency_token.to_string(),
                    (region.clone(), kind.to_string(), created.clone()),
                );
                created
            }
        };
        Self::log(&mut state, CallOp::Create, scope, kind, Some(created.id.clone()));
        match lost_response {
            Some(err) => Err(err),
            None => Ok(created),
        }
    }

    async fn update(
        &self,
        scope: &Scope,
        kind: &str,
        id: &str,
        attributes: Record,
    ) -> Result<CloudObject, CloudApiError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        Self::log(&mut state, CallOp::Update, scope, kind, Some(id.to_string()));
        let lost_response = match state.take_fault(CallOp::Update, kind) {
            Some((err, false)) => return Err(err),
            Some((err, true)) => Some(err),
            None => None,
        };

        let region = scope.api_region().to_string();
        state.check_references(&region, kind, &attributes)?;
        let objs = state.kind_mut(&region, kind);
        let Some(current) = objs.get_mut(id) else {
            return Err(CloudApiError::NotFound(format!("{kind} {id}")));
        };
        for (k, v) in attributes {
            if v.is_null() {
                current.remove(&k);
            } else {
                current.insert(k, v);
            }
        }
        let updated = current.clone();
        if let Some(err) = lost_response {
            return Err(err);
        }
        Ok(CloudObject {
            id: id.to_string(),
            attributes: updated,
        })
    }

    async fn delete(&self, scope: &Scope, kind: &str, id: &str) -> Result<(), CloudApiError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        Self::log(&mut state, CallOp::Delete, scope, kind, Some(id.to_string()));
        let lost_response = match state.take_fault(CallOp::Delete, kind) {
            Some((err, false)) => return Err(err),
            Some((err, true)) => Some(err),
            None => None,
        };

        let region = scope.api_region().to_string();
        state.check_no_dependents(&region, kind, id)?;
        if state.kind_mut(&region, kind).remove(id).is_none() {
            return Err(CloudApiError::NotFound(format!("{kind} {id}")));
        }
        if let Some(err) = lost_response {
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Account;
    use serde_json::json;
    use std::sync::Arc;

    fn scope() -> Scope {
        Scope::regional(
            Arc::new(Account::new("AK", "SK", "us-east-1", ["us-east-1"])),
            "us-east-1",
        )
    }

    fn attrs(v: Value) -> Record {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_per_token() {
        let cloud = MemoryCloud::new();
        let s = scope();
        let a = cloud
            .create(&s, "network", attrs(json!({"name": "a"})), "tok-1")
            .await
            .unwrap();
        let b = cloud
            .create(&s, "network", attrs(json!({"name": "a"})), "tok-1")
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(cloud.objects("us-east-1", "network").len(), 1);
    }

    #[tokio::test]
    async fn known_token_replays_the_first_response() {
        let cloud = MemoryCloud::new();
        let s = scope();
        let a = cloud
            .create(&s, "network", attrs(json!({"name": "a"})), "tok-1")
            .await
            .unwrap();
        cloud.delete(&s, "network", &a.id).await.unwrap();
        let b = cloud
            .create(&s, "network", attrs(json!({"name": "a"})), "tok-1")
            .await
            .unwrap();
        assert_eq!(a, b);
        assert!(cloud.objects("us-east-1", "network").is_empty());
    }

    #[tokio::test]
    async fn lost_response_then_retry_does_not_duplicate() {
        let cloud = MemoryCloud::new();
        let s = scope();
        cloud.fail_next_after_commit(
            CallOp::Create,
            "network",
            CloudApiError::Unavailable("connection reset".into()),
            1,
        );
        let first = cloud
            .create(&s, "network", attrs(json!({"name": "a"})), "tok-1")
            .await;
        assert!(first.is_err());
        let second = cloud
            .create(&s, "network", attrs(json!({"name": "a"})), "tok-1")
            .await
            .unwrap();
        assert_eq!(second.id, "network-00000001");
        assert_eq!(cloud.objects("us-east-1", "network").len(), 1);
    }

    #[tokio::test]
    async fn references_are_enforced_both_ways() {
        let cloud = MemoryCloud::new().with_reference("subnet", "network_id", "network");
        let s = scope();
        let orphan = cloud
            .create(&s, "subnet", attrs(json!({"network_id": "network-9"})), "t0")
            .await;
        assert!(matches!(orphan, Err(CloudApiError::InvalidRequest(_))));

        let net = cloud.create(&s, "network", Record::new(), "t1").await.unwrap();
        cloud
            .create(&s, "subnet", attrs(json!({"network_id": net.id})), "t2")
            .await
            .unwrap();
        assert!(matches!(
            cloud.delete(&s, "network", &net.id).await,
            Err(CloudApiError::InvalidRequest(_))
        ));
        assert!(cloud.delete(&s, "subnet", "subnet-00000009").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_paginates_in_id_order() {
        let cloud = MemoryCloud::new().with_page_size(2);
        for _ in 0..5 {
            cloud.insert_object("us-east-1", "network", Record::new());
        }
        let s = scope();
        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let page = cloud.list(&s, "network", token).await.unwrap();
            seen.extend(page.items.into_iter().map(|o| o.id));
            match page.next_page_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
