use regex::Regex;
use sentryfrogg_types::{path::get_path, path::render_scalar, MissingPolicy, ToolError, ToolResult};
use serde_json::Value;
use std::sync::OnceLock;

// ── Template expansion ───────────────────────────────────────────
//
// `{{ expr }}` is required-resolve: a missing path fails unless the
// policy overrides. `{{ ?expr }}` is optional-resolve: a missing path
// follows the policy without ever failing. A value that is exactly one
// placeholder resolves to the raw JSON value; anything embedded in a
// larger string interpolates as text.

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*(\?)?\s*([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}").expect("template regex")
    })
}

fn whole_placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\{\{\s*(\?)?\s*([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}$").expect("template regex")
    })
}

/// Marker for "drop this key" under the `undefined` policy.
enum Expanded {
    Value(Value),
    Undefined,
}

fn missing_result(optional: bool, policy: MissingPolicy, path: &str) -> ToolResult<Expanded> {
    match (optional, policy) {
        (false, MissingPolicy::Error) => Err(ToolError::invalid_params(format!(
            "template path '{path}' did not resolve"
        ))
        .with_code("template_missing")
        .with_hint("use {{ ?path }} for optional values or set template_missing")),
        (true, MissingPolicy::Error) | (_, MissingPolicy::Empty) => {
            Ok(Expanded::Value(Value::String(String::new())))
        }
        (_, MissingPolicy::Null) => Ok(Expanded::Value(Value::Null)),
        (_, MissingPolicy::Undefined) => Ok(Expanded::Undefined),
    }
}

fn expand_string(raw: &str, scope: &Value, policy: MissingPolicy) -> ToolResult<Expanded> {
    // Whole-string placeholder keeps the resolved value's JSON type.
    if let Some(captures) = whole_placeholder().captures(raw) {
        let optional = captures.get(1).is_some();
        let path = &captures[2];
        return match get_path(scope, path) {
            Some(value) => Ok(Expanded::Value(value.clone())),
            None => missing_result(optional, policy, path),
        };
    }

    if !placeholder().is_match(raw) {
        return Ok(Expanded::Value(Value::String(raw.to_string())));
    }

    let mut failure: Option<ToolError> = None;
    let rendered = placeholder().replace_all(raw, |captures: &regex::Captures<'_>| {
        let optional = captures.get(1).is_some();
        let path = &captures[2];
        match get_path(scope, path) {
            Some(value) => render_scalar(value),
            None => match missing_result(optional, policy, path) {
                Ok(Expanded::Value(Value::String(s))) => s,
                Ok(Expanded::Value(v)) => render_scalar(&v),
                // Undefined inside a larger string degrades to empty.
                Ok(Expanded::Undefined) => String::new(),
                Err(err) => {
                    failure.get_or_insert(err);
                    String::new()
                }
            },
        }
    });

    match failure {
        Some(err) => Err(err),
        None => Ok(Expanded::Value(Value::String(rendered.into_owned()))),
    }
}

/// Recursively expand every string in `value` against `scope`.
pub fn expand(value: &Value, scope: &Value, policy: MissingPolicy) -> ToolResult<Value> {
    match expand_inner(value, scope, policy)? {
        Expanded::Value(v) => Ok(v),
        Expanded::Undefined => Ok(Value::Null),
    }
}

fn expand_inner(value: &Value, scope: &Value, policy: MissingPolicy) -> ToolResult<Expanded> {
    match value {
        Value::String(raw) => expand_string(raw, scope, policy),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match expand_inner(item, scope, policy)? {
                    Expanded::Value(v) => out.push(v),
                    Expanded::Undefined => {}
                }
            }
            Ok(Expanded::Value(Value::Array(out)))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                match expand_inner(item, scope, policy)? {
                    Expanded::Value(v) => {
                        out.insert(key.clone(), v);
                    }
                    Expanded::Undefined => {}
                }
            }
            Ok(Expanded::Value(Value::Object(out)))
        }
        primitive => Ok(Expanded::Value(primitive.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "input": {"name": "world", "count": 3},
            "steps": {"fetch": {"status": 200, "rows": [1, 2]}},
            "env": {"HOME": "/root"}
        })
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let out = expand(&json!("{{ steps.fetch.rows }}"), &scope(), MissingPolicy::Error).unwrap();
        assert_eq!(out, json!([1, 2]));

        let out = expand(&json!("{{ input.count }}"), &scope(), MissingPolicy::Error).unwrap();
        assert_eq!(out, json!(3));
    }

    #[test]
    fn test_interpolation() {
        let out = expand(
            &json!("hello {{ input.name }} x{{ input.count }}"),
            &scope(),
            MissingPolicy::Error,
        )
        .unwrap();
        assert_eq!(out, json!("hello world x3"));
    }

    #[test]
    fn test_required_missing_errors() {
        let err = expand(&json!("{{ input.absent }}"), &scope(), MissingPolicy::Error).unwrap_err();
        assert_eq!(err.code, "template_missing");
    }

    #[test]
    fn test_optional_missing_is_empty() {
        let out = expand(&json!("v={{ ?input.absent }}"), &scope(), MissingPolicy::Error).unwrap();
        assert_eq!(out, json!("v="));
    }

    #[test]
    fn test_missing_policy_null() {
        let out = expand(&json!("{{ input.absent }}"), &scope(), MissingPolicy::Null).unwrap();
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn test_missing_policy_undefined_drops_key() {
        let out = expand(
            &json!({"keep": "{{ input.name }}", "drop": "{{ input.absent }}"}),
            &scope(),
            MissingPolicy::Undefined,
        )
        .unwrap();
        assert_eq!(out, json!({"keep": "world"}));
    }

    #[test]
    fn test_deep_expansion() {
        let out = expand(
            &json!({"args": {"sql": "SELECT {{ input.count }}", "tags": ["{{ input.name }}"]}}),
            &scope(),
            MissingPolicy::Error,
        )
        .unwrap();
        assert_eq!(out["args"]["sql"], json!("SELECT 3"));
        assert_eq!(out["args"]["tags"], json!(["world"]));
    }

    #[test]
    fn test_plain_values_untouched() {
        let input = json!({"n": 5, "flag": true, "s": "no placeholders"});
        assert_eq!(expand(&input, &scope(), MissingPolicy::Error).unwrap(), input);
    }
}
