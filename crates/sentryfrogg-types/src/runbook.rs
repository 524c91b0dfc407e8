use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Predicate ────────────────────────────────────────────────────

/// A single-path condition evaluated against a compiled scope. Used by
/// step `when` guards and `retry.until` conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_equals: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gte: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lte: Option<f64>,
    #[serde(rename = "in", skip_serializing_if = "Option::is_none")]
    pub r#in: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<String>,
}

// ── Step retry policy ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRetry {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<Predicate>,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_delay_ms() -> u64 {
    1000
}

// ── Step ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub when: Option<Predicate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<StepRetry>,
    /// When false, a failed step records its error and the run continues.
    #[serde(default = "default_stop_on_error")]
    pub stop_on_error: bool,
}

fn default_stop_on_error() -> bool {
    true
}

// ── Runbook ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runbook {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Runbook {
    /// Step ids must be unique within a runbook; enforced on upsert.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("runbook has no steps".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err("step id must not be empty".to_string());
            }
            if !seen.insert(step.id.as_str()) {
                return Err(format!("duplicate step id '{}'", step.id));
            }
        }
        Ok(())
    }
}

// ── Step / run results ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub id: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub runbook: String,
    pub success: bool,
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str) -> Step {
        Step {
            id: id.to_string(),
            tool: "state".to_string(),
            args: Value::Null,
            when: None,
            retry: None,
            stop_on_error: true,
        }
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let rb = Runbook {
            name: "r".into(),
            description: None,
            inputs: None,
            steps: vec![step("a"), step("a")],
            tags: vec![],
        };
        assert!(rb.validate().is_err());
    }

    #[test]
    fn test_validate_ok() {
        let rb = Runbook {
            name: "r".into(),
            description: None,
            inputs: None,
            steps: vec![step("a"), step("b")],
            tags: vec![],
        };
        assert!(rb.validate().is_ok());
    }

    #[test]
    fn test_step_defaults() {
        let s: Step = serde_json::from_value(serde_json::json!({
            "id": "x", "tool": "postgres", "args": {"action": "query"}
        }))
        .unwrap();
        assert!(s.stop_on_error);
        assert!(s.retry.is_none());
    }
}
