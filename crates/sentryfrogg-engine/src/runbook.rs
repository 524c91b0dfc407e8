use async_trait::async_trait;
use sentryfrogg_store::StateStore;
use sentryfrogg_types::{
    MissingPolicy, RunReport, Runbook, StateScope, Step, StepReport, StepStatus, ToolError,
    ToolResult,
};
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::predicate;
use crate::template;

// ── Runbook engine ───────────────────────────────────────────────
//
// Per-step state machine: Pending → Running → {Succeeded | Retrying |
// Failed}. Each step's expanded args come from the scope compiled at
// that moment, so later steps see earlier results and fresh state.

/// Seam through which steps invoke tools; the dispatcher implements it.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool: &str, args: Value) -> ToolResult<Value>;
}

#[derive(Clone)]
pub struct RunbookEngine {
    state: StateStore,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub inputs: Value,
    pub context: Value,
    pub template_missing: MissingPolicy,
}

impl RunbookEngine {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    async fn scope(&self, opts: &RunOptions, results: &Map<String, Value>) -> Value {
        let env: Map<String, Value> = std::env::vars()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        json!({
            "input": opts.inputs,
            "steps": Value::Object(results.clone()),
            "state": {
                "session": self.state.snapshot(StateScope::Session).await,
                "persistent": self.state.snapshot(StateScope::Persistent).await,
            },
            "env": Value::Object(env),
            "context": opts.context,
        })
    }

    pub async fn run(
        &self,
        runbook: &Runbook,
        opts: &RunOptions,
        invoker: &dyn ToolInvoker,
    ) -> ToolResult<RunReport> {
        runbook
            .validate()
            .map_err(|e| ToolError::invalid_params(e).with_code("runbook_invalid"))?;

        let mut results: Map<String, Value> = Map::new();
        let mut reports: Vec<StepReport> = Vec::with_capacity(runbook.steps.len());
        let mut run_error: Option<Value> = None;

        for step in &runbook.steps {
            let scope = self.scope(opts, &results).await;

            if let Some(when) = &step.when {
                if !predicate::evaluate(when, &scope)? {
                    tracing::debug!(step = %step.id, "when predicate false, skipping");
                    reports.push(StepReport {
                        id: step.id.clone(),
                        status: StepStatus::Skipped,
                        attempts: 0,
                        result: None,
                        error: None,
                    });
                    continue;
                }
            }

            let report = self.run_step(step, opts, &mut results, invoker).await;
            let failed = report.status == StepStatus::Failed;
            if failed {
                run_error = Some(json!({
                    "step": step.id,
                    "error": report.error,
                }));
            }
            reports.push(report);

            if failed && step.stop_on_error {
                break;
            }
        }

        Ok(RunReport {
            runbook: runbook.name.clone(),
            success: run_error.is_none(),
            steps: reports,
            error: run_error,
        })
    }

    async fn run_step(
        &self,
        step: &Step,
        opts: &RunOptions,
        results: &mut Map<String, Value>,
        invoker: &dyn ToolInvoker,
    ) -> StepReport {
        let max_attempts = step.retry.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1);
        let delay = step
            .retry
            .as_ref()
            .map(|r| Duration::from_millis(r.delay_ms))
            .unwrap_or_default();

        let mut attempts: u32 = 0;
        let mut last_error: Option<ToolError> = None;

        while attempts < max_attempts {
            attempts += 1;
            let scope = self.scope(opts, results).await;

            let args = match template::expand(&step.args, &scope, opts.template_missing) {
                Ok(args) => args,
                Err(err) => {
                    // Template failures are not retryable; they would fail
                    // identically every attempt.
                    let error = serde_json::to_value(&err).unwrap_or(Value::Null);
                    results.insert(step.id.clone(), json!({"error": error, "attempts": attempts}));
                    return StepReport {
                        id: step.id.clone(),
                        status: StepStatus::Failed,
                        attempts,
                        result: None,
                        error: Some(error),
                    };
                }
            };

            match invoker.invoke(&step.tool, args).await {
                Ok(result) => {
                    results.insert(step.id.clone(), result.clone());

                    let until_holds = match step.retry.as_ref().and_then(|r| r.until.as_ref()) {
                        None => true,
                        Some(until) => {
                            let scope = self.scope(opts, results).await;
                            predicate::evaluate(until, &scope).unwrap_or(false)
                        }
                    };

                    if until_holds {
                        return StepReport {
                            id: step.id.clone(),
                            status: StepStatus::Succeeded,
                            attempts,
                            result: Some(result),
                            error: None,
                        };
                    }

                    last_error = Some(
                        ToolError::retryable(format!(
                            "step '{}' until-condition not met after {attempts} attempt(s)",
                            step.id
                        ))
                        .with_code("runbook_until"),
                    );
                }
                Err(err) => {
                    tracing::debug!(step = %step.id, attempt = attempts, error = %err, "step attempt failed");
                    last_error = Some(err);
                }
            }

            if attempts < max_attempts && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let error = last_error
            .map(|e| serde_json::to_value(&e).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        results.insert(step.id.clone(), json!({"error": error, "attempts": attempts}));
        StepReport {
            id: step.id.clone(),
            status: StepStatus::Failed,
            attempts,
            result: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentryfrogg_types::{Predicate, StepRetry};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeInvoker {
        calls: AtomicU32,
        /// Number of leading calls that fail with a retryable error.
        fail_first: u32,
    }

    #[async_trait]
    impl ToolInvoker for FakeInvoker {
        async fn invoke(&self, tool: &str, args: Value) -> ToolResult<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(ToolError::retryable("transient"));
            }
            Ok(json!({"tool": tool, "args": args, "call": call}))
        }
    }

    fn engine() -> (RunbookEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::open(dir.path().join("state.json")).unwrap();
        (RunbookEngine::new(state), dir)
    }

    fn step(id: &str, args: Value) -> Step {
        Step {
            id: id.to_string(),
            tool: "fake".to_string(),
            args,
            when: None,
            retry: None,
            stop_on_error: true,
        }
    }

    #[tokio::test]
    async fn test_results_addressable_by_later_steps() {
        let (engine, _dir) = engine();
        let invoker = FakeInvoker {
            calls: AtomicU32::new(0),
            fail_first: 0,
        };

        let runbook = Runbook {
            name: "chain".into(),
            description: None,
            inputs: None,
            steps: vec![
                step("first", json!({"value": "{{ input.seed }}"})),
                step("second", json!({"prev_call": "{{ steps.first.call }}"})),
            ],
            tags: vec![],
        };
        let opts = RunOptions {
            inputs: json!({"seed": 42}),
            ..Default::default()
        };

        let report = engine.run(&runbook, &opts, &invoker).await.unwrap();
        assert!(report.success);
        assert_eq!(report.steps.len(), 2);
        // second step saw first's result through the steps scope
        let second = report.steps[1].result.as_ref().unwrap();
        assert_eq!(second["args"]["prev_call"], json!(1));
    }

    #[tokio::test]
    async fn test_retry_until_exhaustion_fails_run() {
        let (engine, _dir) = engine();
        let invoker = FakeInvoker {
            calls: AtomicU32::new(0),
            fail_first: 0,
        };

        let mut s = step("wait", json!({}));
        s.retry = Some(StepRetry {
            max_attempts: 3,
            delay_ms: 0,
            until: Some(Predicate {
                path: "steps.wait.call".to_string(),
                equals: Some(json!(99)),
                not_equals: None,
                gt: None,
                gte: None,
                lt: None,
                lte: None,
                r#in: None,
                exists: None,
                matches: None,
            }),
        });
        let runbook = Runbook {
            name: "until".into(),
            description: None,
            inputs: None,
            steps: vec![s],
            tags: vec![],
        };

        let report = engine
            .run(&runbook, &RunOptions::default(), &invoker)
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.steps[0].attempts, 3);
        assert!(report.error.is_some());
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_when_until_holds() {
        let (engine, _dir) = engine();
        let invoker = FakeInvoker {
            calls: AtomicU32::new(0),
            fail_first: 0,
        };

        let mut s = step("wait", json!({}));
        s.retry = Some(StepRetry {
            max_attempts: 5,
            delay_ms: 0,
            until: Some(Predicate {
                path: "steps.wait.call".to_string(),
                equals: Some(json!(2)),
                not_equals: None,
                gt: None,
                gte: None,
                lt: None,
                lte: None,
                r#in: None,
                exists: None,
                matches: None,
            }),
        });
        let runbook = Runbook {
            name: "until".into(),
            description: None,
            inputs: None,
            steps: vec![s],
            tags: vec![],
        };

        let report = engine
            .run(&runbook, &RunOptions::default(), &invoker)
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.steps[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let (engine, _dir) = engine();
        let invoker = FakeInvoker {
            calls: AtomicU32::new(0),
            fail_first: 2,
        };

        let mut s = step("flaky", json!({}));
        s.retry = Some(StepRetry {
            max_attempts: 3,
            delay_ms: 0,
            until: None,
        });
        let runbook = Runbook {
            name: "flaky".into(),
            description: None,
            inputs: None,
            steps: vec![s],
            tags: vec![],
        };

        let report = engine
            .run(&runbook, &RunOptions::default(), &invoker)
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.steps[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_stop_on_error_false_continues() {
        let (engine, _dir) = engine();
        let invoker = FakeInvoker {
            calls: AtomicU32::new(0),
            fail_first: 1,
        };

        let mut failing = step("bad", json!({}));
        failing.stop_on_error = false;
        let runbook = Runbook {
            name: "tolerant".into(),
            description: None,
            inputs: None,
            steps: vec![failing, step("after", json!({}))],
            tags: vec![],
        };

        let report = engine
            .run(&runbook, &RunOptions::default(), &invoker)
            .await
            .unwrap();
        // Run is marked unsuccessful but the second step still ran.
        assert!(!report.success);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[0].status, StepStatus::Failed);
        assert_eq!(report.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_when_skips() {
        let (engine, _dir) = engine();
        let invoker = FakeInvoker {
            calls: AtomicU32::new(0),
            fail_first: 0,
        };

        let mut gated = step("gated", json!({}));
        gated.when = Some(Predicate {
            path: "input.run_it".to_string(),
            equals: Some(json!(true)),
            not_equals: None,
            gt: None,
            gte: None,
            lt: None,
            lte: None,
            r#in: None,
            exists: None,
            matches: None,
        });
        let runbook = Runbook {
            name: "gated".into(),
            description: None,
            inputs: None,
            steps: vec![gated],
            tags: vec![],
        };
        let opts = RunOptions {
            inputs: json!({"run_it": false}),
            ..Default::default()
        };

        let report = engine.run(&runbook, &opts, &invoker).await.unwrap();
        assert!(report.success);
        assert_eq!(report.steps[0].status, StepStatus::Skipped);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_step_error_addressable() {
        let (engine, _dir) = engine();
        let invoker = FakeInvoker {
            calls: AtomicU32::new(0),
            fail_first: 1,
        };

        let mut failing = step("bad", json!({}));
        failing.stop_on_error = false;
        let probe = step("probe", json!({"prev_attempts": "{{ steps.bad.attempts }}"}));
        let runbook = Runbook {
            name: "errors".into(),
            description: None,
            inputs: None,
            steps: vec![failing, probe],
            tags: vec![],
        };

        let report = engine
            .run(&runbook, &RunOptions::default(), &invoker)
            .await
            .unwrap();
        let probe_result = report.steps[1].result.as_ref().unwrap();
        // The failed step left {error, attempts} in its slot.
        assert_eq!(probe_result["args"]["prev_attempts"], json!(1));
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let (engine, _dir) = engine();
        let invoker = FakeInvoker {
            calls: AtomicU32::new(0),
            fail_first: 0,
        };
        let runbook = Runbook {
            name: "dup".into(),
            description: None,
            inputs: None,
            steps: vec![step("a", json!({})), step("a", json!({}))],
            tags: vec![],
        };
        let err = engine
            .run(&runbook, &RunOptions::default(), &invoker)
            .await
            .unwrap_err();
        assert_eq!(err.code, "runbook_invalid");
    }
}
