use crate::error::RecordFailure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the plan/summary layout stored in operation output.
pub const SUMMARY_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Push declared rows to the cloud.
    Apply,
    /// Pull live cloud state into the rows.
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    Replace,
    Delete,
}

impl PlanAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanAction::Create => "create",
            PlanAction::Update => "update",
            PlanAction::Replace => "replace",
            PlanAction::Delete => "delete",
        }
    }
}

/// One planned (or attempted) action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRow {
    pub action: PlanAction,
    pub table_name: String,
    /// Local row id; empty for cloud-only records.
    pub id: String,
    /// Identity key of the record.
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl EntityCounts {
    fn add(&mut self, other: &EntityCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

/// Structured result of one apply or sync, real or planned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub version: u32,
    pub direction: Direction,
    pub dry_run: bool,
    pub passes: usize,
    /// Per entity type. Planned runs count planned actions.
    pub entities: BTreeMap<String, EntityCounts>,
    pub totals: EntityCounts,
    pub rows: Vec<PlanRow>,
}

impl RunSummary {
    pub fn new<'a>(
        direction: Direction,
        dry_run: bool,
        entity_types: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            version: SUMMARY_VERSION,
            direction,
            dry_run,
            passes: 0,
            entities: entity_types
                .into_iter()
                .map(|t| (t.to_string(), EntityCounts::default()))
                .collect(),
            totals: EntityCounts::default(),
            rows: Vec::new(),
        }
    }

    pub fn counts(&self, entity_type: &str) -> EntityCounts {
        self.entities.get(entity_type).copied().unwrap_or_default()
    }

    pub(crate) fn plan(&mut self, action: PlanAction, table_name: &str, row_id: Option<i64>, key: &str) {
        self.rows.push(PlanRow {
            action,
            table_name: table_name.to_string(),
            id: row_id.map(|id| id.to_string()).unwrap_or_default(),
            description: key.to_string(),
        });
    }

    /// Counts one action that took effect (or, in a dry run, would).
    pub(crate) fn count(&mut self, entity_type: &str, action: PlanAction) {
        let counts = self.entities.entry(entity_type.to_string()).or_default();
        match action {
            PlanAction::Create => counts.created += 1,
            PlanAction::Update | PlanAction::Replace => counts.updated += 1,
            PlanAction::Delete => counts.deleted += 1,
        }
    }

    /// Sets failure counts from the records still failing at the end of the run and computes
    /// totals.
    pub(crate) fn finish(&mut self, failures: &[RecordFailure]) {
        for counts in self.entities.values_mut() {
            counts.failed = 0;
        }
        for failure in failures {
            self.entities
                .entry(failure.entity_type.clone())
                .or_default()
                .failed += 1;
        }
        let mut totals = EntityCounts::default();
        for counts in self.entities.values() {
            totals.add(counts);
        }
        self.totals = totals;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_counts_as_update_and_failures_are_totalled() {
        let mut summary = RunSummary::new(Direction::Apply, false, ["network", "subnet"]);
        summary.count("network", PlanAction::Create);
        summary.count("subnet", PlanAction::Replace);
        summary.count("subnet", PlanAction::Delete);
        summary.finish(&[RecordFailure {
            entity_type: "subnet".into(),
            key: "us-east-1|b".into(),
            action: "create".into(),
            cause: "boom".into(),
        }]);

        assert_eq!(summary.counts("network").created, 1);
        assert_eq!(
            summary.counts("subnet"),
            EntityCounts {
                created: 0,
                updated: 1,
                deleted: 1,
                failed: 1
            }
        );
        assert_eq!(summary.totals.created + summary.totals.updated, 2);
        assert_eq!(summary.totals.failed, 1);
    }

    #[test]
    fn plan_rows_serialize_in_wire_shape() {
        let mut summary = RunSummary::new(Direction::Sync, true, ["network"]);
        summary.plan(PlanAction::Delete, "network", None, "us-east-1|net-a");
        let v = serde_json::to_value(&summary).unwrap();
        assert_eq!(v["version"], 3);
        assert_eq!(v["direction"], "sync");
        assert_eq!(v["rows"][0]["action"], "delete");
        assert_eq!(v["rows"][0]["id"], "");
        assert_eq!(v["rows"][0]["description"], "us-east-1|net-a");
    }
}
