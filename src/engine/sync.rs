use super::order::{References, split_leaves, split_roots};
use super::summary::PlanAction;
use super::{Declared, DeclaredRow, Reconciler, RunState};
use crate::error::CloudrowError;
use crate::mapper::{DynMapper, RecordKey};
use cloudrow_diff::{Record, diff};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Declared rows of one type with no live counterpart, removed after every type is written.
struct PendingRemovals {
    mapper: Arc<dyn DynMapper>,
    refs: References,
    rows: Vec<(RecordKey, DeclaredRow)>,
}

impl Reconciler {
    /// Rewrites the declared rows to match the cloud. The cloud is only read.
    pub(super) async fn sync(&self, run: &mut RunState) -> Result<(), CloudrowError> {
        run.summary.passes = 1;
        let mut removals = Vec::new();
        let mut unreadable = BTreeSet::new();

        for mapper in &self.mappers {
            let entity_type = mapper.entity_type();
            let table = mapper.table();
            let scopes = self.scopes(table);
            // A type that could not be read keeps its rows as they are, and so do its dependents.
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
            // A rejected row still owns its identity: no cloud copy is inserted next to it.
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
                insert = delta.to_delete.len(),
                overwrite = delta.to_update.len(),
                remove = delta.to_create.len(),
                "sync diff computed"
            );

            let refs = References::of(table, &self.tables);
            self.sync_inserts(mapper, &refs, delta.to_delete, run).await?;

            let fields: Vec<String> = table.columns.iter().map(|c| c.field.clone()).collect();
            for (key, row, live) in delta.to_update {
                run.summary
                    .plan(PlanAction::Update, entity_type, Some(row.row_id), &key.to_string());
                if run.dry_run {
                    run.summary.count(entity_type, PlanAction::Update);
                    continue;
                }
                match self
                    .store
                    .update_record(table.clone(), row.row_id, fields.clone(), live)
                    .await
                {
                    Ok(()) => run.summary.count(entity_type, PlanAction::Update),
                    Err(e) => run.fail(entity_type, &key, "write", e),
                }
            }

            // Computed-only drift is written without being reported.
            if !run.dry_run {
                for (key, row, live) in &delta.unchanged {
                    if let Err(e) = self.write_back(mapper, row, live).await {
                        run.fail(entity_type, key, "write", e);
                    }
                }
            }

            removals.push(PendingRemovals {
                mapper: mapper.clone(),
                refs,
                rows: delta.to_create,
            });
        }

        for pending in removals.into_iter().rev() {
            self.sync_removals(pending, run).await;
        }
        info!(
            target_name = %self.store.target(),
            dry_run = run.dry_run,
            failing = run.failures.len(),
            "sync finished"
        );
        Ok(())
    }

    /// Inserts cloud-only records, same-type parents first.
    async fn sync_inserts(
        &self,
        mapper: &Arc<dyn DynMapper>,
        refs: &References,
        records: Vec<(RecordKey, Record)>,
        run: &mut RunState,
    ) -> Result<(), CloudrowError> {
        let entity_type = mapper.entity_type();
        let table = mapper.table();
        let mut remaining = records;
        while !remaining.is_empty() {
            let (wave, later) = split_roots(refs, remaining, |r| r);
            remaining = later;
            for (key, live) in wave {
                run.summary
                    .plan(PlanAction::Create, entity_type, None, &key.to_string());
                if run.dry_run {
                    run.summary.count(entity_type, PlanAction::Create);
                    continue;
                }
                match self
                    .store
                    .insert_record(table.clone(), key.region.clone(), live)
                    .await
                {
                    Ok(row_id) => {
                        debug!(entity_type, key = %key, row_id, "row inserted from cloud");
                        run.summary.count(entity_type, PlanAction::Create);
                    }
                    Err(e @ CloudrowError::RactorError(_)) => return Err(e),
                    Err(e) => run.fail(entity_type, &key, "write", e),
                }
            }
        }
        Ok(())
    }

    /// Removes declared rows absent from the cloud, same-type children first.
    async fn sync_removals(&self, pending: PendingRemovals, run: &mut RunState) {
        let PendingRemovals { mapper, refs, rows } = pending;
        let entity_type = mapper.entity_type();
        let table = mapper.table();
        let mut remaining = rows;
        while !remaining.is_empty() {
            let (wave, later) = split_leaves(&refs, remaining, |row| &row.record);
            remaining = later;
            for (key, row) in wave {
                run.summary
                    .plan(PlanAction::Delete, entity_type, Some(row.row_id), &key.to_string());
                if run.dry_run {
                    run.summary.count(entity_type, PlanAction::Delete);
                    continue;
                }
                match self.store.delete_record(table.clone(), row.row_id).await {
                    Ok(()) => run.summary.count(entity_type, PlanAction::Delete),
                    Err(e) => run.fail(entity_type, &key, "write", e),
                }
            }
        }
    }
}
