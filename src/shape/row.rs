use serde_json::Value;

/// A generic synced record.
pub type Row = serde_json::Map<String, Value>;

/// Derive the cache key of a row.
///
/// The `id` field wins when present. Junction rows without one are keyed by
/// their `*_id` fields, ordered by field name and joined with `-`. A null
/// `*_id` renders as `null` so nullable foreign keys still produce a key.
pub fn row_key(row: &Row) -> Option<String> {
  if let Some(id) = row.get("id") {
    return scalar_key(id);
  }

  let mut ids: Vec<(&String, &Value)> = row.iter().filter(|(k, _)| k.ends_with("_id")).collect();
  if ids.is_empty() {
    return None;
  }
  ids.sort_by(|a, b| a.0.cmp(b.0));

  let parts: Option<Vec<String>> = ids
    .into_iter()
    .map(|(_, v)| match v {
      Value::Null => Some("null".to_string()),
      v => scalar_key(v),
    })
    .collect();
  parts.map(|p| p.join("-"))
}

fn scalar_key(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Overwrite the fields of `target` with `changes`.
pub fn merge_row(target: &mut Row, changes: Row) {
  for (field, value) in changes {
    target.insert(field, value);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn test_id_field_is_key() {
    assert_eq!(row_key(&row(json!({"id": "a", "project_id": "p"}))), Some("a".into()));
    assert_eq!(row_key(&row(json!({"id": 7}))), Some("7".into()));
  }

  #[test]
  fn test_junction_key_sorted_by_field_name() {
    let forward = row(json!({"issue_id": "x", "tag_id": "y"}));
    assert_eq!(row_key(&forward), Some("x-y".into()));

    let mut reversed = Row::new();
    reversed.insert("tag_id".into(), json!("y"));
    reversed.insert("issue_id".into(), json!("x"));
    assert_eq!(row_key(&reversed), Some("x-y".into()));
  }

  #[test]
  fn test_junction_key_with_null_id() {
    let detached = row(json!({"issue_id": "x", "tag_id": null}));
    assert_eq!(row_key(&detached), Some("x-null".into()));
  }

  #[test]
  fn test_no_key() {
    assert_eq!(row_key(&row(json!({"name": "foo"}))), None);
    assert_eq!(row_key(&row(json!({"id": null}))), None);
  }

  #[test]
  fn test_merge_row() {
    let mut target = row(json!({"id": "a", "name": "old", "done": false}));
    merge_row(&mut target, row(json!({"name": "new"})));
    assert_eq!(Value::Object(target), json!({"id": "a", "name": "new", "done": false}));
  }
}
