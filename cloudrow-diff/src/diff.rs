use std::collections::BTreeMap;

/// Result of diffing declared (`D`) against observed (`C`) records for one entity type.
///
/// Every list is sorted by key, so for fixed inputs the sets and their processing order are
/// identical across runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff<K, D, C> {
    /// Declared without an observed counterpart.
    pub to_create: Vec<(K, D)>,
    /// Observed without a declared counterpart.
    pub to_delete: Vec<(K, C)>,
    /// Matched by key but not equal.
    pub to_update: Vec<(K, D, C)>,
    /// Matched by key and equal.
    pub unchanged: Vec<(K, D, C)>,
    /// Declared entries dropped because an earlier one had the same key.
    pub duplicate_declared: Vec<(K, D)>,
    /// Observed entries dropped because an earlier one had the same key.
    pub duplicate_observed: Vec<(K, C)>,
}

impl<K, D, C> Diff<K, D, C> {
    pub fn has_changes(&self) -> bool {
        !(self.to_create.is_empty() && self.to_delete.is_empty() && self.to_update.is_empty())
    }

    pub fn change_count(&self) -> usize {
        self.to_create.len() + self.to_delete.len() + self.to_update.len()
    }
}

/// Keyed set difference: `to_create = D \ C`, `to_delete = C \ D`,
/// `to_update = {(d, c) : key(d) = key(c), !eq(d, c)}`.
pub fn diff<K, D, C, F>(
    declared: impl IntoIterator<Item = (K, D)>,
    observed: impl IntoIterator<Item = (K, C)>,
    eq: F,
) -> Diff<K, D, C>
where
    K: Ord + Clone,
    F: Fn(&D, &C) -> bool,
{
    let mut duplicate_declared = Vec::new();
    let mut declared_by_key: BTreeMap<K, D> = BTreeMap::new();
    for (k, d) in declared {
        if declared_by_key.contains_key(&k) {
            duplicate_declared.push((k, d));
        } else {
            declared_by_key.insert(k, d);
        }
    }

    let mut duplicate_observed = Vec::new();
    let mut observed_by_key: BTreeMap<K, C> = BTreeMap::new();
    for (k, c) in observed {
        if observed_by_key.contains_key(&k) {
            duplicate_observed.push((k, c));
        } else {
            observed_by_key.insert(k, c);
        }
    }

    let mut to_create = Vec::new();
    let mut to_update = Vec::new();
    let mut unchanged = Vec::new();
    for (k, d) in declared_by_key {
        match observed_by_key.remove(&k) {
            None => to_create.push((k, d)),
            Some(c) if eq(&d, &c) => unchanged.push((k, d, c)),
            Some(c) => to_update.push((k, d, c)),
        }
    }
    let to_delete = observed_by_key.into_iter().collect();

    Diff {
        to_create,
        to_delete,
        to_update,
        unchanged,
        duplicate_declared,
        duplicate_observed,
    }
}
