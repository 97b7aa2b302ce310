//! Deterministic aggregator reduce: union branch `records[]`, dedupe by
//! `id` (shallow-merge into the most-populated survivor), stable sort.
//! Grounded on the teacher's `Gamma::roll_up_*` family — same "plain
//! deterministic reduction over a `Vec` of candidates" shape, applied to
//! JSON records instead of `Candidate` structs.

use serde_json::{Map, Value};

fn populated_field_count(v: &Value) -> usize {
    match v.as_object() {
        Some(map) => map.values().filter(|v| !v.is_null()).count(),
        None => 0,
    }
}

/// Shallow-merges `incoming` into `survivor`, letting `incoming` fill only
/// keys `survivor` doesn't already have a non-null value for.
fn shallow_merge(survivor: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match survivor.get(key) {
            Some(existing) if !existing.is_null() => {}
            _ => {
                survivor.insert(key.clone(), value.clone());
            }
        }
    }
}

fn sort_key(v: &Value) -> String {
    v.get("id").and_then(|id| id.as_str()).map(str::to_string).unwrap_or_else(|| v.to_string())
}

/// Unions every branch's `records[]`, dedupes by `id` (records without an
/// `id` are never merged into each other), and stable-sorts by `id`
/// ascending, falling back to JSON-string order when `id` is absent.
/// Idempotent: `reduce(reduce(records)) == reduce(records)`.
pub fn reduce(branch_records: Vec<Vec<Value>>) -> Vec<Value> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: std::collections::HashMap<String, Map<String, Value>> = std::collections::HashMap::new();
    let mut without_id: Vec<Value> = Vec::new();

    for record in branch_records.into_iter().flatten() {
        let Some(obj) = record.as_object() else {
            without_id.push(record);
            continue;
        };
        match obj.get("id").and_then(|id| id.as_str()) {
            Some(id) => {
                let id = id.to_string();
                match by_id.get_mut(&id) {
                    Some(survivor) => {
                        if populated_field_count(&record) > populated_field_count(&Value::Object(survivor.clone())) {
                            let mut merged = obj.clone();
                            shallow_merge(&mut merged, survivor);
                            *survivor = merged;
                        } else {
                            shallow_merge(survivor, obj);
                        }
                    }
                    None => {
                        order.push(id.clone());
                        by_id.insert(id, obj.clone());
                    }
                }
            }
            None => without_id.push(record),
        }
    }

    let mut merged: Vec<Value> = order.into_iter().map(|id| Value::Object(by_id.remove(&id).unwrap())).collect();
    merged.extend(without_id);
    merged.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    merged
}

pub fn to_strict_json(records: Vec<Value>) -> Value {
    serde_json::json!({ "records": records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dedupes_by_id_keeping_most_populated_fields() {
        let branch_a = vec![json!({"id": "1", "name": "Alice", "email": null})];
        let branch_b = vec![json!({"id": "1", "name": "Alice", "email": "a@example.com"})];
        let out = reduce(vec![branch_a, branch_b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["email"], "a@example.com");
    }

    #[test]
    fn stable_sort_by_id_ascending() {
        let branch = vec![json!({"id": "3"}), json!({"id": "1"}), json!({"id": "2"})];
        let out = reduce(vec![branch]);
        let ids: Vec<&str> = out.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn reduce_is_idempotent_on_already_aggregated_input() {
        let branch = vec![json!({"id": "2", "name": "B"}), json!({"id": "1", "name": "A"})];
        let once = reduce(vec![branch.clone()]);
        let twice = reduce(vec![once.clone()]);
        assert_eq!(once, twice);
    }

    #[test]
    fn records_without_id_are_never_merged() {
        let branch = vec![json!({"note": "x"}), json!({"note": "y"})];
        let out = reduce(vec![branch]);
        assert_eq!(out.len(), 2);
    }
}
