use super::order::{References, describe_parent, split_leaves};
use super::summary::PlanAction;
use super::{Declared, DeclaredRow, Reconciler, RunState, cloud_id_of, scope_for};
use crate::cloud::Scope;
use crate::error::CloudrowError;
use crate::mapper::{DynMapper, RecordKey, UpdatePolicy};
use cloudrow_diff::{Record, diff, values_equal};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    attempted: usize,
    succeeded: usize,
}

/// Cloud-only objects of one type, deleted after the forward pass.
struct PendingDeletes {
    mapper: Arc<dyn DynMapper>,
    refs: References,
    records: Vec<(RecordKey, Record)>,
}

enum Readiness {
    Ready,
    /// Waits for a same-type parent that is still pending creation.
    Deferred,
    Unresolved(String),
}

impl Reconciler {
    pub(super) async fn apply(&self, run: &mut RunState) -> Result<(), CloudrowError> {
        let max_passes = if run.dry_run { 1 } else { self.max_passes };
        for pass in 1..=max_passes {
            run.summary.passes = pass;
            let progress = self.apply_pass(run).await?;
            info!(
                target_name = %self.store.target(),
                pass,
                attempted = progress.attempted,
                succeeded = progress.succeeded,
                failing = run.failures.len(),
                "apply pass finished"
            );
            if progress.attempted == 0 || run.dry_run || run.skipped > 0 {
                break;
            }
            if progress.succeeded == 0 {
                warn!(target_name = %self.store.target(), pass, "forward progress halted");
                break;
            }
        }
        Ok(())
    }

    async fn apply_pass(&self, run: &mut RunState) -> Result<Progress, CloudrowError> {
        let mut progress = Progress::default();
        let mut deletes = Vec::new();
        let mut unreadable = BTreeSet::new();

        for mapper in &self.mappers {
            let entity_type = mapper.entity_type();
            let scopes = self.scopes(mapper.table());
            if self.parent_unreadable(mapper, &scopes, &mut unreadable, run) {
                continue;
            }
            let included = run.includes(entity_type);
            let declared = if included {
                self.load_declared(mapper, run).await?
            } else {
                Declared::empty()
            };
            let Some(observed) = self.load_observed(mapper, &scopes, run).await else {
                if !run.deadline_passed() {
                    unreadable.insert(entity_type);
                }
                continue;
            };
            if !included {
                continue;
            }

            let mut delta = diff(declared.rows, observed, |d: &DeclaredRow, c: &Record| {
                mapper.equals(&d.record, c)
            });
            delta
                .to_delete
                .retain(|(key, _)| !declared.withheld.contains(key));
            for (key, _) in &delta.duplicate_declared {
                run.fail(entity_type, key, "read", "another declared row has the same identity key");
            }
            for (key, _) in &delta.duplicate_observed {
                warn!(entity_type, key = %key, "several cloud objects share one identity key, using the first");
            }
            debug!(
                entity_type,
                create = delta.to_create.len(),
                update = delta.to_update.len(),
                delete = delta.to_delete.len(),
                unchanged = delta.unchanged.len(),
                "diff computed"
            );

            if !run.dry_run {
                for (key, row, live) in &delta.unchanged {
                    if let Err(e) = self.write_back(mapper, row, live).await {
                        run.fail(entity_type, key, "write", e);
                    }
                }
            }

            let refs = References::of(mapper.table(), &self.tables);
            self.apply_updates(mapper, &scopes, delta.to_update, run, &mut progress)
                .await;
            self.apply_creates(mapper, &refs, &scopes, delta.to_create, run, &mut progress)
                .await;
            deletes.push(PendingDeletes {
                mapper: mapper.clone(),
                refs,
                records: delta.to_delete,
            });
        }

        for pending in deletes.into_iter().rev() {
            self.apply_deletes(pending, run, &mut progress).await;
        }
        Ok(progress)
    }

    /// Book-keeping after a successful create/update/replace.
    async fn record_live(
        &self,
        mapper: &Arc<dyn DynMapper>,
        key: &RecordKey,
        row: &DeclaredRow,
        live: Record,
        action: PlanAction,
        run: &mut RunState,
    ) {
        let entity_type = mapper.entity_type();
        run.summary.count(entity_type, action);
        run.succeed(entity_type, key);
        if let Err(e) = self.write_back(mapper, row, &live).await {
            run.fail(entity_type, key, "write", e);
        }

        let live_key = match mapper.id_of(&live) {
            Ok(Some(id)) => RecordKey::new(key.region.clone(), id),
            _ => key.clone(),
        };
        let cloud_id = cloud_id_of(mapper.table(), &live);
        self.ctx
            .write_index(|index| index.insert(entity_type, live_key, live, cloud_id));
    }

    async fn update_or_replace(
        &self,
        mapper: &Arc<dyn DynMapper>,
        scopes: &[Scope],
        key: &RecordKey,
        action: PlanAction,
        row: &DeclaredRow,
        live: &Record,
    ) -> Result<Record, CloudrowError> {
        let scope = scope_for(scopes, key.region.as_deref())?;
        if action != PlanAction::Replace {
            return mapper.update_in_cloud(&self.ctx, scope, &row.record, live).await;
        }
        mapper.delete_in_cloud(&self.ctx, scope, live).await?;
        self.ctx
            .write_index(|index| index.remove(mapper.entity_type(), key));
        self.limiter.until_ready().await;
        mapper
            .create_in_cloud(&self.ctx, scope, key, row.row_id, &row.record)
            .await
    }

    async fn apply_updates(
        &self,
        mapper: &Arc<dyn DynMapper>,
        scopes: &[Scope],
        to_update: Vec<(RecordKey, DeclaredRow, Record)>,
        run: &mut RunState,
        progress: &mut Progress,
    ) {
        let entity_type = mapper.entity_type();
        let items: Vec<(RecordKey, (PlanAction, DeclaredRow, Record))> = to_update
            .into_iter()
            .map(|(key, row, live)| {
                let action = match mapper.update_policy(&row.record, &live) {
                    UpdatePolicy::InPlace => PlanAction::Update,
                    UpdatePolicy::Replace => PlanAction::Replace,
                };
                (key, (action, row, live))
            })
            .collect();

        if run.dry_run {
            for (key, (action, row, _)) in &items {
                run.summary
                    .plan(*action, entity_type, Some(row.row_id), &key.to_string());
                run.summary.count(entity_type, *action);
                progress.attempted += 1;
            }
            return;
        }

        let results = self
            .launch(run.deadline, items, |key, (action, row, live)| async move {
                let res = self
                    .update_or_replace(mapper, scopes, &key, action, &row, &live)
                    .await;
                (action, row, res)
            })
            .await;

        for (key, outcome) in results {
            let Some((action, row, res)) = outcome else {
                run.skipped += 1;
                continue;
            };
            run.summary
                .plan(action, entity_type, Some(row.row_id), &key.to_string());
            progress.attempted += 1;
            match res {
                Ok(live) => {
                    progress.succeeded += 1;
                    self.record_live(mapper, &key, &row, live, action, run).await;
                }
                Err(e) => run.fail(entity_type, &key, action.as_str(), e),
            }
        }
    }

    fn readiness(
        &self,
        refs: &References,
        key: &RecordKey,
        row: &DeclaredRow,
        pending: &[(RecordKey, DeclaredRow)],
    ) -> Readiness {
        let region = key.region.as_deref();
        if let Some(parent) = refs.missing_parent(&self.ctx, region, &row.record) {
            return Readiness::Unresolved(parent);
        }
        for r in &refs.same_type {
            let Some(value) = r.value(&row.record) else {
                continue;
            };
            let live = self.ctx.read_index(|index| {
                index.has_live(&r.parent_type, r.parent_region(region), &r.parent_field, value)
            });
            if live {
                continue;
            }
            let queued = pending.iter().any(|(k, other)| {
                k != key
                    && k.region == key.region
                    && other
                        .record
                        .get(&r.parent_field)
                        .is_some_and(|v| values_equal(v, value))
            });
            return if queued {
                Readiness::Deferred
            } else {
                Readiness::Unresolved(describe_parent(r, value))
            };
        }
        Readiness::Ready
    }

    /// Creates in waves: a record waits while its same-type parent is still being created.
    async fn apply_creates(
        &self,
        mapper: &Arc<dyn DynMapper>,
        refs: &References,
        scopes: &[Scope],
        to_create: Vec<(RecordKey, DeclaredRow)>,
        run: &mut RunState,
        progress: &mut Progress,
    ) {
        let entity_type = mapper.entity_type();
        let ctx = &self.ctx;
        let mut pending = to_create;

        while !pending.is_empty() {
            if !run.dry_run && run.deadline_passed() {
                run.skipped += pending.len();
                return;
            }

            let readiness: Vec<Readiness> = pending
                .iter()
                .map(|(key, row)| self.readiness(refs, key, row, &pending))
                .collect();
            let mut wave = Vec::new();
            let mut deferred = Vec::new();
            for ((key, row), ready) in pending.into_iter().zip(readiness) {
                match ready {
                    Readiness::Ready => wave.push((key, row)),
                    Readiness::Deferred => deferred.push((key, row)),
                    Readiness::Unresolved(parent) => run.fail(
                        entity_type,
                        &key,
                        PlanAction::Create.as_str(),
                        format!("unresolved reference to {parent}"),
                    ),
                }
            }
            if wave.is_empty() {
                for (key, _) in &deferred {
                    run.fail(
                        entity_type,
                        key,
                        PlanAction::Create.as_str(),
                        "reference cycle among records being created",
                    );
                }
                return;
            }
            pending = deferred;

            if run.dry_run {
                for (key, row) in wave {
                    run.summary.plan(
                        PlanAction::Create,
                        entity_type,
                        Some(row.row_id),
                        &key.to_string(),
                    );
                    run.summary.count(entity_type, PlanAction::Create);
                    progress.attempted += 1;
                    ctx.write_index(|index| index.insert(entity_type, key, row.record, None));
                }
                continue;
            }

            let results = self
                .launch(run.deadline, wave, |key, row| async move {
                    let res = match scope_for(scopes, key.region.as_deref()) {
                        Ok(scope) => mapper.create_in_cloud(ctx, scope, &key, row.row_id, &row.record).await,
                        Err(e) => Err(e),
                    };
                    (row, res)
                })
                .await;

            for (key, outcome) in results {
                let Some((row, res)) = outcome else {
                    run.skipped += 1;
                    continue;
                };
                run.summary.plan(
                    PlanAction::Create,
                    entity_type,
                    Some(row.row_id),
                    &key.to_string(),
                );
                progress.attempted += 1;
                match res {
                    Ok(live) => {
                        progress.succeeded += 1;
                        self.record_live(mapper, &key, &row, live, PlanAction::Create, run)
                            .await;
                    }
                    Err(e) => run.fail(entity_type, &key, PlanAction::Create.as_str(), e),
                }
            }
        }
    }

    /// Deletes in waves: a record waits while a same-type child is still being deleted.
    async fn apply_deletes(
        &self,
        pending: PendingDeletes,
        run: &mut RunState,
        progress: &mut Progress,
    ) {
        let PendingDeletes {
            mapper,
            refs,
            records,
        } = pending;
        let mapper = &mapper;
        let entity_type = mapper.entity_type();
        let scopes = self.scopes(mapper.table());
        let scopes = scopes.as_slice();
        let ctx = &self.ctx;
        let mut remaining = records;

        while !remaining.is_empty() {
            if !run.dry_run && run.deadline_passed() {
                run.skipped += remaining.len();
                return;
            }
            let (wave, later) = split_leaves(&refs, remaining, |r| r);
            remaining = later;

            if run.dry_run {
                for (key, _) in wave {
                    run.summary
                        .plan(PlanAction::Delete, entity_type, None, &key.to_string());
                    run.summary.count(entity_type, PlanAction::Delete);
                    progress.attempted += 1;
                    ctx.write_index(|index| index.remove(entity_type, &key));
                }
                continue;
            }

            let results = self
                .launch(run.deadline, wave, |key, live| async move {
                    match scope_for(scopes, key.region.as_deref()) {
                        Ok(scope) => mapper.delete_in_cloud(ctx, scope, &live).await,
                        Err(e) => Err(e),
                    }
                })
                .await;

            for (key, outcome) in results {
                let Some(res) = outcome else {
                    run.skipped += 1;
                    continue;
                };
                run.summary
                    .plan(PlanAction::Delete, entity_type, None, &key.to_string());
                progress.attempted += 1;
                match res {
                    Ok(()) => {
                        progress.succeeded += 1;
                        run.summary.count(entity_type, PlanAction::Delete);
                        run.succeed(entity_type, &key);
                        ctx.write_index(|index| index.remove(entity_type, &key));
                    }
                    Err(e) => run.fail(entity_type, &key, PlanAction::Delete.as_str(), e),
                }
            }
        }
    }
}
