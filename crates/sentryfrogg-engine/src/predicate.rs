use regex::Regex;
use sentryfrogg_types::{path::get_path, Predicate, ToolError, ToolResult};
use serde_json::Value;

// ── Predicate evaluation ─────────────────────────────────────────
//
// Evaluated against the compiled runbook scope. All comparisons on one
// predicate must hold (they are rarely combined in practice).

pub fn evaluate(predicate: &Predicate, scope: &Value) -> ToolResult<bool> {
    let value = get_path(scope, &predicate.path);

    if let Some(expect_exists) = predicate.exists {
        if value.is_some() != expect_exists {
            return Ok(false);
        }
    }

    let Some(value) = value else {
        // Path absent: any remaining comparison cannot hold.
        let has_comparisons = predicate.equals.is_some()
            || predicate.not_equals.is_some()
            || !no_numeric(predicate)
            || predicate.r#in.is_some()
            || predicate.matches.is_some();
        return Ok(!has_comparisons);
    };

    if let Some(expected) = &predicate.equals {
        if value != expected {
            return Ok(false);
        }
    }
    if let Some(unexpected) = &predicate.not_equals {
        if value == unexpected {
            return Ok(false);
        }
    }

    if !no_numeric(predicate) {
        let number = value.as_f64().ok_or_else(|| {
            ToolError::invalid_params(format!(
                "predicate path '{}' is not numeric",
                predicate.path
            ))
        })?;
        if let Some(bound) = predicate.gt {
            if !(number > bound) {
                return Ok(false);
            }
        }
        if let Some(bound) = predicate.gte {
            if !(number >= bound) {
                return Ok(false);
            }
        }
        if let Some(bound) = predicate.lt {
            if !(number < bound) {
                return Ok(false);
            }
        }
        if let Some(bound) = predicate.lte {
            if !(number <= bound) {
                return Ok(false);
            }
        }
    }

    if let Some(allowed) = &predicate.r#in {
        if !allowed.contains(value) {
            return Ok(false);
        }
    }

    if let Some(pattern) = &predicate.matches {
        let regex = Regex::new(pattern).map_err(|e| {
            ToolError::invalid_params(format!("invalid predicate pattern '{pattern}': {e}"))
        })?;
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !regex.is_match(&text) {
            return Ok(false);
        }
    }

    Ok(true)
}

fn no_numeric(predicate: &Predicate) -> bool {
    predicate.gt.is_none() && predicate.gte.is_none() && predicate.lt.is_none() && predicate.lte.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pred(path: &str) -> Predicate {
        Predicate {
            path: path.to_string(),
            equals: None,
            not_equals: None,
            gt: None,
            gte: None,
            lt: None,
            lte: None,
            r#in: None,
            exists: None,
            matches: None,
        }
    }

    #[test]
    fn test_equals() {
        let scope = json!({"steps": {"a": {"status": 200}}});
        let mut p = pred("steps.a.status");
        p.equals = Some(json!(200));
        assert!(evaluate(&p, &scope).unwrap());
        p.equals = Some(json!(500));
        assert!(!evaluate(&p, &scope).unwrap());
    }

    #[test]
    fn test_numeric_bounds() {
        let scope = json!({"n": 5});
        let mut p = pred("n");
        p.gte = Some(5.0);
        assert!(evaluate(&p, &scope).unwrap());
        p.gt = Some(5.0);
        assert!(!evaluate(&p, &scope).unwrap());
    }

    #[test]
    fn test_exists() {
        let scope = json!({"a": 1});
        let mut p = pred("a");
        p.exists = Some(true);
        assert!(evaluate(&p, &scope).unwrap());

        let mut q = pred("b");
        q.exists = Some(false);
        assert!(evaluate(&q, &scope).unwrap());
        q.exists = Some(true);
        assert!(!evaluate(&q, &scope).unwrap());
    }

    #[test]
    fn test_missing_path_fails_other_ops() {
        let scope = json!({});
        let mut p = pred("absent");
        p.equals = Some(json!(1));
        assert!(!evaluate(&p, &scope).unwrap());
    }

    #[test]
    fn test_in() {
        let scope = json!({"status": "ready"});
        let mut p = pred("status");
        p.r#in = Some(vec![json!("ready"), json!("done")]);
        assert!(evaluate(&p, &scope).unwrap());
        p.r#in = Some(vec![json!("failed")]);
        assert!(!evaluate(&p, &scope).unwrap());
    }

    #[test]
    fn test_matches() {
        let scope = json!({"version": "v1.2.3"});
        let mut p = pred("version");
        p.matches = Some(r"^v\d+\.\d+\.\d+$".to_string());
        assert!(evaluate(&p, &scope).unwrap());
        p.matches = Some(r"^release-".to_string());
        assert!(!evaluate(&p, &scope).unwrap());
    }

    #[test]
    fn test_non_numeric_with_bound_errors() {
        let scope = json!({"s": "text"});
        let mut p = pred("s");
        p.gt = Some(1.0);
        assert!(evaluate(&p, &scope).is_err());
    }
}
