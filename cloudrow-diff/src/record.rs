use serde_json::{Map, Value};

/// Generic resource record: field name to JSON value. Absent and `null` mean the same thing.
pub type Record = Map<String, Value>;

/// Drops `null` fields (recursively inside nested objects) so that optional values are
/// always represented by absence.
pub fn normalize(record: Record) -> Record {
    record
        .into_iter()
        .filter_map(|(k, v)| normalize_value(v).map(|v| (k, v)))
        .collect()
}

fn normalize_value(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => Some(Value::Object(normalize(map))),
        Value::Array(items) => Some(Value::Array(
            items
                .into_iter()
                .map(|v| normalize_value(v).unwrap_or(Value::Null))
                .collect(),
        )),
        other => Some(other),
    }
}

/// Structural equality with numeric comparison by value (`1` equals `1.0`) and
/// `null` equal to absent inside objects.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(x), Value::Object(y)) => objects_equal(x, y, &[]),
        _ => a == b,
    }
}

fn objects_equal(a: &Record, b: &Record, ignore: &[&str]) -> bool {
    let null = Value::Null;
    a.keys()
        .chain(b.keys())
        .filter(|k| !ignore.contains(&k.as_str()))
        .all(|k| values_equal(a.get(k).unwrap_or(&null), b.get(k).unwrap_or(&null)))
}

/// Equivalence of two records ignoring the listed fields.
pub fn equivalent(a: &Record, b: &Record, ignore: &[&str]) -> bool {
    objects_equal(a, b, ignore)
}

/// Sorted names of the fields that differ, ignoring the listed fields.
pub fn differing_fields(a: &Record, b: &Record, ignore: &[&str]) -> Vec<String> {
    let null = Value::Null;
    let mut fields: Vec<String> = a
        .keys()
        .chain(b.keys())
        .filter(|k| !ignore.contains(&k.as_str()))
        .filter(|k| !values_equal(a.get(*k).unwrap_or(&null), b.get(*k).unwrap_or(&null)))
        .cloned()
        .collect();
    fields.sort();
    fields.dedup();
    fields
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
    fn null_is_absent() {
        let a = rec(json!({"name": "net-a", "description": null}));
        let b = rec(json!({"name": "net-a"}));
        assert!(equivalent(&a, &b, &[]));
        assert_eq!(normalize(a), b);
    }

    #[test]
    fn ignores_listed_fields_only() {
        let d = rec(json!({"name": "net-a", "cidr_block": "10.0.0.0/16"}));
        let c = rec(json!({"name": "net-a", "cidr_block": "10.0.0.0/16", "network_id": "net-1"}));
        assert!(equivalent(&d, &c, &["network_id"]));
        assert!(!equivalent(&d, &c, &[]));
        assert_eq!(differing_fields(&d, &c, &[]), ["network_id"]);
    }

    #[test]
    fn numbers_compare_by_value() {
        assert!(values_equal(&json!(443), &json!(443.0)));
        assert!(!values_equal(&json!(443), &json!(80)));
        assert!(values_equal(&json!([1, {"a": null}]), &json!([1.0, {}])));
    }

    #[test]
    fn normalize_strips_nested_nulls() {
        let r = normalize(rec(json!({"tags": {"env": "prod", "owner": null}, "x": null})));
        assert_eq!(Value::Object(r), json!({"tags": {"env": "prod"}}));
    }
}
