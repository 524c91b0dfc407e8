use sentryfrogg_types::{path::get_path, MissingPolicy, OutputShape, ToolError, ToolResult};
use serde_json::{Map, Value};

// ── Output shaping ───────────────────────────────────────────────
//
// Applied to every successful result, in order: path → pick → omit →
// map. `missing` governs an unresolvable path; `default` substitutes a
// literal instead of failing.

pub fn apply(result: Value, shape: &OutputShape) -> ToolResult<Value> {
    let mut value = match &shape.path {
        None => result,
        Some(path) => match get_path(&result, path) {
            Some(found) => found.clone(),
            None => {
                if let Some(default) = &shape.default {
                    return Ok(default.clone());
                }
                match shape.missing {
                    MissingPolicy::Error => {
                        return Err(ToolError::not_found(format!(
                            "output path '{path}' did not resolve"
                        ))
                        .with_code("output_path")
                        .with_hint("set output.missing or output.default to tolerate absence"))
                    }
                    MissingPolicy::Empty => Value::String(String::new()),
                    MissingPolicy::Null | MissingPolicy::Undefined => Value::Null,
                }
            }
        },
    };

    if let Some(pick) = &shape.pick {
        if let Value::Object(map) = &value {
            let mut kept = Map::new();
            for key in pick {
                if let Some(v) = map.get(key) {
                    kept.insert(key.clone(), v.clone());
                }
            }
            value = Value::Object(kept);
        }
    }

    if let Some(omit) = &shape.omit {
        if let Value::Object(map) = &mut value {
            for key in omit {
                map.remove(key);
            }
        }
    }

    if let Some(renames) = &shape.map {
        if let Value::Object(map) = &mut value {
            for (from, to) in renames {
                if let Some(v) = map.remove(from) {
                    map.insert(to.clone(), v);
                }
            }
        }
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shape() -> OutputShape {
        OutputShape::default()
    }

    #[test]
    fn test_identity_without_directives() {
        let result = json!({"rows": [1, 2]});
        assert_eq!(apply(result.clone(), &shape()).unwrap(), result);
    }

    #[test]
    fn test_path_extraction() {
        let mut s = shape();
        s.path = Some("rows.0".to_string());
        assert_eq!(apply(json!({"rows": [7]}), &s).unwrap(), json!(7));
    }

    #[test]
    fn test_path_missing_error() {
        let mut s = shape();
        s.path = Some("absent".to_string());
        let err = apply(json!({}), &s).unwrap_err();
        assert_eq!(err.code, "output_path");
    }

    #[test]
    fn test_path_missing_policies() {
        let mut s = shape();
        s.path = Some("absent".to_string());
        s.missing = MissingPolicy::Null;
        assert_eq!(apply(json!({}), &s).unwrap(), Value::Null);

        s.missing = MissingPolicy::Empty;
        assert_eq!(apply(json!({}), &s).unwrap(), json!(""));
    }

    #[test]
    fn test_default_beats_missing() {
        let mut s = shape();
        s.path = Some("absent".to_string());
        s.default = Some(json!("fallback"));
        assert_eq!(apply(json!({}), &s).unwrap(), json!("fallback"));
    }

    #[test]
    fn test_pick_omit_map_order() {
        let mut s = shape();
        s.pick = Some(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        s.omit = Some(vec!["c".to_string()]);
        let mut renames = std::collections::BTreeMap::new();
        renames.insert("a".to_string(), "alpha".to_string());
        s.map = Some(renames);

        let out = apply(json!({"a": 1, "b": 2, "c": 3, "d": 4}), &s).unwrap();
        assert_eq!(out, json!({"alpha": 1, "b": 2}));
    }

    #[test]
    fn test_shaping_non_object_passthrough() {
        let mut s = shape();
        s.pick = Some(vec!["x".to_string()]);
        // pick/omit/map only make sense on objects; scalars pass through
        assert_eq!(apply(json!(42), &s).unwrap(), json!(42));
    }
}
