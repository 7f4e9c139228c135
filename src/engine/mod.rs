//! Reconciliation engine.
//!
//! For every active entity type, in foreign-key order, the engine loads the declared rows (D)
//! from the target store and the live objects (C) from the cloud, diffs them by identity key and
//! then either drives the mappers (apply) or rewrites the rows (sync).
//!
//! - `order.rs`: entity-type order and FK lookups
//! - `apply.rs`: multi-pass apply with create waves and deferred deletes
//! - `sync.rs`: single-pass sync into storage
//! - `summary.rs`: per-type counts and plan rows

mod apply;
pub mod order;
pub mod summary;
mod sync;

pub use order::entity_order;
pub use summary::{Direction, EntityCounts, PlanAction, PlanRow, RunSummary};

use crate::cloud::Scope;
use crate::config::EngineConfig;
use crate::db::{Account, StoreHandle};
use crate::error::{CloudrowError, RecordFailure};
use crate::mapper::{DynMapper, MapperContext, RecordKey};
use crate::utils::with_pretty_json_debug;
use cloudrow_diff::{Record, values_equal};
use cloudrow_schema::TableSpec;
use futures::{StreamExt, stream};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub direction: Direction,
    /// Plan only: no cloud mutation, no storage write.
    pub dry_run: bool,
    /// No new cloud call is launched after this instant.
    pub deadline: Option<Instant>,
    /// Restrict changes to these entity types; other active types are only read.
    pub only: Option<BTreeSet<String>>,
}

impl RunRequest {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            dry_run: false,
            deadline: None,
            only: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn only(mut self, entity_types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.only = Some(entity_types.into_iter().map(Into::into).collect());
        self
    }
}

/// Outcome of a run that reached its end (possibly with per-record failures).
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Records still failing when the run ended, by entity type and key.
    pub failures: Vec<RecordFailure>,
    /// Cloud calls not launched because the deadline had passed.
    pub skipped: usize,
    pub elapsed: Duration,
}

impl RunReport {
    /// The error to attach to the operation, if the run did not fully succeed.
    pub fn error(&self) -> Option<CloudrowError> {
        if self.skipped > 0 {
            Some(CloudrowError::OperationTimeout {
                elapsed: self.elapsed,
                skipped: self.skipped,
                failures: self.failures.clone(),
            })
        } else if !self.failures.is_empty() {
            Some(CloudrowError::Reconciliation {
                failures: self.failures.clone(),
            })
        } else {
            None
        }
    }
}

/// Mutable bookkeeping of one run.
pub(crate) struct RunState {
    summary: RunSummary,
    failures: BTreeMap<(String, String), RecordFailure>,
    skipped: usize,
    deadline: Option<Instant>,
    dry_run: bool,
    only: Option<BTreeSet<String>>,
}

impl RunState {
    fn includes(&self, entity_type: &str) -> bool {
        self.only.as_ref().is_none_or(|only| only.contains(entity_type))
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn fail(&mut self, entity_type: &str, key: &RecordKey, action: &str, cause: impl fmt::Display) {
        let failure = RecordFailure {
            entity_type: entity_type.to_string(),
            key: key.to_string(),
            action: action.to_string(),
            cause: cause.to_string(),
        };
        warn!(
            entity_type,
            key = %failure.key,
            action,
            cause = %failure.cause,
            "record failed"
        );
        self.failures
            .insert((failure.entity_type.clone(), failure.key.clone()), failure);
    }

    fn succeed(&mut self, entity_type: &str, key: &RecordKey) {
        self.failures
            .remove(&(entity_type.to_string(), key.to_string()));
    }
}

/// Declared rows of one type as loaded for diffing.
pub(crate) struct Declared {
    pub rows: Vec<(RecordKey, DeclaredRow)>,
    /// Identity keys of rows the entity type rejected; their live counterparts are left alone.
    pub withheld: BTreeSet<RecordKey>,
}

impl Declared {
    fn empty() -> Self {
        Self {
            rows: Vec::new(),
            withheld: BTreeSet::new(),
        }
    }
}

/// Identity key read straight from the stored columns, joined like the mappers join it.
fn raw_identity(table: &TableSpec, record: &Record) -> Option<String> {
    let parts = table
        .identity
        .iter()
        .map(|field| match record.get(field)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("|"))
}

/// A declared row as loaded for diffing.
#[derive(Debug, Clone)]
pub(crate) struct DeclaredRow {
    pub row_id: i64,
    pub region: Option<String>,
    pub record: Record,
}

pub(crate) fn cloud_id_of(table: &TableSpec, record: &Record) -> Option<String> {
    record
        .get(table.cloud_id.as_ref()?)?
        .as_str()
        .map(str::to_string)
}

fn scope_for<'s>(scopes: &'s [Scope], region: Option<&str>) -> Result<&'s Scope, CloudrowError> {
    scopes
        .iter()
        .find(|s| s.region() == region)
        .ok_or_else(|| {
            CloudrowError::UnexpectedError(format!("no scope for region {}", region.unwrap_or("-")))
        })
}

/// Runs apply or sync over a fixed set of mappers for one target.
pub struct Reconciler {
    store: StoreHandle,
    ctx: MapperContext,
    account: Arc<Account>,
    mappers: Vec<Arc<dyn DynMapper>>,
    tables: BTreeMap<&'static str, Arc<TableSpec>>,
    concurrency: usize,
    max_passes: usize,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl Reconciler {
    pub fn new(
        store: StoreHandle,
        ctx: MapperContext,
        account: Arc<Account>,
        mappers: Vec<Arc<dyn DynMapper>>,
        config: &EngineConfig,
    ) -> Result<Self, CloudrowError> {
        let mappers = entity_order(mappers)?;
        let tables = mappers
            .iter()
            .map(|m| (m.entity_type(), m.table().clone()))
            .collect();
        Ok(Self {
            store,
            ctx,
            account,
            mappers,
            tables,
            concurrency: config.concurrency.max(1),
            max_passes: config.max_passes.max(1),
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(config.cloud_tps))),
        })
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.mappers.iter().map(|m| m.entity_type())
    }

    pub async fn run(&self, request: &RunRequest) -> Result<RunReport, CloudrowError> {
        let started = Instant::now();
        let types: Vec<&str> = self
            .entity_types()
            .filter(|t| request.only.as_ref().is_none_or(|only| only.contains(*t)))
            .collect();
        let mut run = RunState {
            summary: RunSummary::new(request.direction, request.dry_run, types),
            failures: BTreeMap::new(),
            skipped: 0,
            deadline: request.deadline,
            dry_run: request.dry_run,
            only: request.only.clone(),
        };

        match request.direction {
            Direction::Apply => self.apply(&mut run).await?,
            Direction::Sync => self.sync(&mut run).await?,
        }

        let failures: Vec<RecordFailure> = run.failures.into_values().collect();
        run.summary.finish(&failures);
        with_pretty_json_debug(&run.summary, |json| {
            debug!(target_name = %self.store.target(), "run summary:\n{json}");
        });
        Ok(RunReport {
            summary: run.summary,
            failures,
            skipped: run.skipped,
            elapsed: started.elapsed(),
        })
    }

    fn scopes(&self, table: &TableSpec) -> Vec<Scope> {
        if table.regional {
            self.account
                .enabled_regions()
                .map(|r| Scope::regional(self.account.clone(), r))
                .collect()
        } else {
            vec![Scope::global(self.account.clone())]
        }
    }

    /// Declared rows keyed by identity. Rows in regions not enabled for the account are left out;
    /// rows without a region belong to the default region. A row the entity type rejects fails
    /// under its stored identity key when one can be read, and that key is withheld.
    async fn load_declared(
        &self,
        mapper: &Arc<dyn DynMapper>,
        run: &mut RunState,
    ) -> Result<Declared, CloudrowError> {
        let entity_type = mapper.entity_type();
        let table = mapper.table();
        let rows = self.store.read_records(table.clone()).await?;

        let mut declared = Declared::empty();
        for row in rows {
            let region = if table.regional {
                Some(
                    row.region
                        .unwrap_or_else(|| self.account.default_region.clone()),
                )
            } else {
                None
            };
            if let Some(r) = region.as_deref().filter(|r| !self.account.is_enabled(r)) {
                debug!(entity_type, row_id = row.row_id, region = r, "row outside enabled regions, left untouched");
                continue;
            }

            let row_key = RecordKey::for_row(region.clone(), row.row_id);
            let mut reject = |e: CloudrowError, run: &mut RunState| {
                match raw_identity(table, &row.record) {
                    Some(id) => {
                        let key = RecordKey::new(region.clone(), id);
                        run.fail(entity_type, &key, "read", e);
                        declared.withheld.insert(key);
                    }
                    None => run.fail(entity_type, &row_key, "read", e),
                }
            };
            let record = match mapper.canonical(&row.record) {
                Ok(record) => record,
                Err(e) => {
                    reject(e, run);
                    continue;
                }
            };
            let key = match mapper.id_of(&record) {
                Ok(Some(id)) => RecordKey::new(region.clone(), id),
                Ok(None) => row_key,
                Err(e) => {
                    reject(e, run);
                    continue;
                }
            };
            declared.rows.push((
                key,
                DeclaredRow {
                    row_id: row.row_id,
                    region,
                    record,
                },
            ));
        }
        Ok(declared)
    }

    /// Fails every scope of `mapper` when a type it references could not be read this pass: its
    /// mapper cannot place live objects under an unknown parent, so its view of the cloud would
    /// be truncated. The type then counts as unreadable for its own dependents.
    fn parent_unreadable(
        &self,
        mapper: &Arc<dyn DynMapper>,
        scopes: &[Scope],
        unreadable: &mut BTreeSet<&'static str>,
        run: &mut RunState,
    ) -> bool {
        let entity_type = mapper.entity_type();
        let refs = order::References::of(mapper.table(), &self.tables);
        let Some(parent) = refs
            .cross_type
            .iter()
            .find(|r| unreadable.contains(r.parent_type.as_str()))
        else {
            return false;
        };
        let cause = format!("parent type {} unreadable", parent.parent_type);
        for scope in scopes {
            let scope_key = RecordKey::new(scope.region().map(str::to_string), "*");
            run.fail(entity_type, &scope_key, "read", &cause);
        }
        unreadable.insert(entity_type);
        true
    }

    /// Live objects of one type across `scopes`, also recorded in the FK index. `None` when a
    /// read failed or the deadline passed, in which case the type is left alone this pass.
    async fn load_observed(
        &self,
        mapper: &Arc<dyn DynMapper>,
        scopes: &[Scope],
        run: &mut RunState,
    ) -> Option<Vec<(RecordKey, Record)>> {
        let entity_type = mapper.entity_type();
        let mut observed = Vec::new();
        for scope in scopes {
            let scope_key = RecordKey::new(scope.region().map(str::to_string), "*");
            if run.deadline_passed() {
                run.skipped += 1;
                return None;
            }
            let records = match mapper.read_cloud(&self.ctx, scope).await {
                Ok(records) => records,
                Err(e) => {
                    run.fail(entity_type, &scope_key, "read", e);
                    return None;
                }
            };
            run.succeed(entity_type, &scope_key);
            for record in records {
                match mapper.id_of(&record) {
                    Ok(Some(id)) => {
                        observed.push((RecordKey::new(scope.region().map(str::to_string), id), record));
                    }
                    Ok(None) => {
                        warn!(entity_type, region = scope.api_region(), "cloud object without identity key, ignored");
                    }
                    Err(e) => {
                        warn!(entity_type, region = scope.api_region(), error = %e, "undecodable cloud object, ignored");
                    }
                }
            }
        }

        let table = mapper.table();
        self.ctx.write_index(|index| {
            index.clear_type(entity_type);
            for (key, record) in &observed {
                index.insert(entity_type, key.clone(), record.clone(), cloud_id_of(table, record));
            }
        });
        Some(observed)
    }

    /// Writes computed fields of `live` that differ from the declared row.
    async fn write_back(
        &self,
        mapper: &Arc<dyn DynMapper>,
        row: &DeclaredRow,
        live: &Record,
    ) -> Result<bool, CloudrowError> {
        let table = mapper.table();
        let fields: Vec<String> = table
            .computed_fields()
            .filter(|f| match (row.record.get(*f), live.get(*f)) {
                (Some(a), Some(b)) => !values_equal(a, b),
                (None, None) => false,
                _ => true,
            })
            .map(str::to_string)
            .collect();
        if fields.is_empty() {
            return Ok(false);
        }
        self.store
            .update_record(table.clone(), row.row_id, fields, live.clone())
            .await?;
        Ok(true)
    }

    /// Runs `f` over `items` with bounded concurrency behind the rate limiter. Items reached after
    /// the deadline are not started and come back as `None`. Results are sorted by key.
    async fn launch<T, R, F, Fut>(
        &self,
        deadline: Option<Instant>,
        items: Vec<(RecordKey, T)>,
        f: F,
    ) -> Vec<(RecordKey, Option<R>)>
    where
        F: Fn(RecordKey, T) -> Fut,
        Fut: Future<Output = R>,
    {
        let limiter = &self.limiter;
        let mut results: Vec<(RecordKey, Option<R>)> = stream::iter(items)
            .map(|(key, item)| {
                let fut = f(key.clone(), item);
                async move {
                    limiter.until_ready().await;
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return (key, None);
                    }
                    (key, Some(fut.await))
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}
