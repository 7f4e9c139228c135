//! Entity-type ordering and foreign-key lookups used while executing a plan.

use crate::error::CloudrowError;
use crate::mapper::{DynMapper, MapperContext, RecordKey};
use crate::registry::DependencyGraph;
use cloudrow_diff::{Record, values_equal};
use cloudrow_schema::TableSpec;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Orders mappers so every entity type comes after the types its table references.
///
/// References to types outside `mappers` are ignored; ties break by entity type.
pub fn entity_order(
    mappers: Vec<Arc<dyn DynMapper>>,
) -> Result<Vec<Arc<dyn DynMapper>>, CloudrowError> {
    let mut graph = DependencyGraph::new();
    for mapper in &mappers {
        graph.add_node(mapper.entity_type());
    }
    for mapper in &mappers {
        for parent in mapper.table().referenced_tables() {
            graph.add_edge(mapper.entity_type(), parent);
        }
    }
    let order = graph.topological_sort()?;

    let mut by_type: BTreeMap<&'static str, Arc<dyn DynMapper>> = mappers
        .into_iter()
        .map(|m| (m.entity_type(), m))
        .collect();
    Ok(order
        .iter()
        .filter_map(|t| by_type.remove(t.as_str()))
        .collect())
}

/// A foreign key of one table, resolved to record fields on both sides.
#[derive(Debug, Clone)]
pub(crate) struct ParentRef {
    pub field: String,
    pub parent_type: String,
    pub parent_field: String,
    pub parent_regional: bool,
}

impl ParentRef {
    pub fn value<'r>(&self, record: &'r Record) -> Option<&'r Value> {
        record.get(&self.field).filter(|v| !v.is_null())
    }

    /// Region the parent lives in, given the child's region.
    pub fn parent_region<'a>(&self, child_region: Option<&'a str>) -> Option<&'a str> {
        if self.parent_regional {
            child_region
        } else {
            None
        }
    }
}

/// Foreign keys of `table`, split into same-type and cross-type references.
#[derive(Debug, Clone, Default)]
pub(crate) struct References {
    pub same_type: Vec<ParentRef>,
    pub cross_type: Vec<ParentRef>,
}

impl References {
    pub fn of(table: &TableSpec, tables: &BTreeMap<&str, Arc<TableSpec>>) -> Self {
        let mut refs = Self::default();
        for (col, fk) in table.foreign_keys() {
            let parent = if fk.table == table.name {
                Some(table)
            } else {
                tables.get(fk.table.as_str()).map(AsRef::as_ref)
            };
            // Parent type not active in this run: nothing to check against.
            let Some(parent) = parent else {
                continue;
            };
            let Some(parent_col) = parent.columns.iter().find(|c| c.column == fk.column) else {
                continue;
            };
            let parent_ref = ParentRef {
                field: col.field.clone(),
                parent_type: parent.name.clone(),
                parent_field: parent_col.field.clone(),
                parent_regional: parent.regional,
            };
            if fk.table == table.name {
                refs.same_type.push(parent_ref);
            } else {
                refs.cross_type.push(parent_ref);
            }
        }
        refs
    }

    /// First cross-type parent of `record` that has no live record, as `"type field=value"`.
    pub fn missing_parent(
        &self,
        ctx: &MapperContext,
        region: Option<&str>,
        record: &Record,
    ) -> Option<String> {
        self.cross_type.iter().find_map(|r| {
            let value = r.value(record)?;
            let live = ctx.read_index(|index| {
                index.has_live(&r.parent_type, r.parent_region(region), &r.parent_field, value)
            });
            (!live).then(|| describe_parent(r, value))
        })
    }
}

pub(crate) fn describe_parent(r: &ParentRef, value: &Value) -> String {
    match value {
        Value::String(s) => format!("{} {}={s}", r.parent_type, r.parent_field),
        other => format!("{} {}={other}", r.parent_type, r.parent_field),
    }
}

/// Whether `child` points at `parent` through one of the same-type references.
fn points_at(refs: &References, child: &Record, parent: &Record) -> bool {
    refs.same_type.iter().any(|r| {
        match (r.value(child), parent.get(&r.parent_field)) {
            (Some(a), Some(b)) => values_equal(a, b),
            _ => false,
        }
    })
}

/// Splits `items` into those no other item depends on (children first) and the rest.
/// When every item is depended on (a cycle), all of them are returned as ready.
pub(crate) fn split_leaves<T>(
    refs: &References,
    items: Vec<(RecordKey, T)>,
    record: impl Fn(&T) -> &Record,
) -> (Vec<(RecordKey, T)>, Vec<(RecordKey, T)>) {
    split(refs, items, record, |refs, this, other| points_at(refs, other, this))
}

/// Splits `items` into those not depending on another item (parents first) and the rest.
/// When every item depends on another (a cycle), all of them are returned as ready.
pub(crate) fn split_roots<T>(
    refs: &References,
    items: Vec<(RecordKey, T)>,
    record: impl Fn(&T) -> &Record,
) -> (Vec<(RecordKey, T)>, Vec<(RecordKey, T)>) {
    split(refs, items, record, |refs, this, other| points_at(refs, this, other))
}

fn split<T>(
    refs: &References,
    items: Vec<(RecordKey, T)>,
    record: impl Fn(&T) -> &Record,
    blocked_by: impl Fn(&References, &Record, &Record) -> bool,
) -> (Vec<(RecordKey, T)>, Vec<(RecordKey, T)>) {
    if refs.same_type.is_empty() {
        return (items, Vec::new());
    }
    let blocked: Vec<bool> = items
        .iter()
        .map(|(key, this)| {
            items.iter().any(|(k, other)| {
                k != key && k.region == key.region && blocked_by(refs, record(this), record(other))
            })
        })
        .collect();
    if blocked.iter().all(|b| *b) {
        return (items, Vec::new());
    }
    items
        .into_iter()
        .zip(blocked)
        .fold((Vec::new(), Vec::new()), |(mut ready, mut later), (item, b)| {
            if b {
                later.push(item);
            } else {
                ready.push(item);
            }
            (ready, later)
        })
}
