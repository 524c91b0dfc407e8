use serde_json::Value;

// ── Dotted-path lookup over dynamic JSON ─────────────────────────
//
// Paths are dot-separated object keys with optional numeric segments
// for array indexing: `steps.fetch.rows.0.id`. Used by output shaping,
// runbook templates and predicates.

/// Look up `path` in `value`. Returns `None` when any segment is absent.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(segment)?;
            }
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                current = items.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Render a JSON value for string interpolation: bare strings stay
/// unquoted, everything else serializes compactly.
pub fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_and_array_segments() {
        let v = json!({"steps": {"fetch": {"rows": [{"id": 7}]}}});
        assert_eq!(get_path(&v, "steps.fetch.rows.0.id"), Some(&json!(7)));
        assert_eq!(get_path(&v, "steps.fetch.rows.1.id"), None);
        assert_eq!(get_path(&v, "steps.missing"), None);
    }

    #[test]
    fn test_empty_path_is_identity() {
        let v = json!({"a": 1});
        assert_eq!(get_path(&v, ""), Some(&v));
    }

    #[test]
    fn test_scalar_through_non_container() {
        let v = json!({"a": 1});
        assert_eq!(get_path(&v, "a.b"), None);
    }

    #[test]
    fn test_render_scalar() {
        assert_eq!(render_scalar(&json!("plain")), "plain");
        assert_eq!(render_scalar(&json!(42)), "42");
        assert_eq!(render_scalar(&json!(null)), "");
        assert_eq!(render_scalar(&json!({"k": 1})), r#"{"k":1}"#);
    }
}
