use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use sentryfrogg_store::redact::redact_value;
use sentryfrogg_types::{
    AuditEntry, AuditStatus, OutputShape, StateScope, StoreAs, ToolError, ToolResult,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::app::App;
use crate::shape;
use crate::tools;

// ── Tool dispatcher / executor ───────────────────────────────────
//
// The single entry point for every tool call: alias and preset
// resolution, the trace/span envelope, handler dispatch, output
// shaping, store_as persistence and audit emission.

const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("sql", "postgres"),
    ("pg", "postgres"),
    ("db", "postgres"),
    ("http", "api"),
    ("rest", "api"),
    ("secrets", "vault"),
];

type Handler = Arc<dyn Fn(Dispatcher, Value) -> BoxFuture<'static, ToolResult<Value>> + Send + Sync>;

struct Inner {
    app: App,
    handlers: HashMap<&'static str, Handler>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

// ── Envelope ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Envelope {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    output: Option<OutputShape>,
    store_as: Option<StoreAs>,
    store_scope: Option<StateScope>,
    preset: Option<String>,
}

impl Envelope {
    /// Pull the shared argument surface out of the call, leaving only the
    /// tool's own arguments behind.
    fn extract(args: &mut Map<String, Value>) -> ToolResult<Self> {
        let take_str = |args: &mut Map<String, Value>, key: &str| -> Option<String> {
            args.remove(key).and_then(|v| v.as_str().map(String::from))
        };

        let output = match args.remove("output") {
            None => None,
            Some(raw) => Some(serde_json::from_value::<OutputShape>(raw).map_err(|e| {
                ToolError::invalid_params(format!("invalid output directive: {e}"))
            })?),
        };
        let store_as = match args.remove("store_as") {
            None => None,
            Some(raw) => Some(serde_json::from_value::<StoreAs>(raw).map_err(|e| {
                ToolError::invalid_params(format!("invalid store_as directive: {e}"))
            })?),
        };
        let store_scope = match args.remove("store_scope") {
            None => None,
            Some(raw) => Some(serde_json::from_value::<StateScope>(raw).map_err(|e| {
                ToolError::invalid_params(format!("invalid store_scope: {e}"))
            })?),
        };

        let preset = take_str(args, "preset_name").or_else(|| take_str(args, "preset"));

        Ok(Self {
            trace_id: take_str(args, "trace_id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            span_id: take_str(args, "span_id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            parent_span_id: take_str(args, "parent_span_id"),
            output,
            store_as,
            store_scope,
            preset,
        })
    }
}

impl Dispatcher {
    pub fn new(app: App) -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();

        macro_rules! register {
            ($name:literal, $module:ident) => {
                handlers.insert(
                    $name,
                    Arc::new(|dispatcher: Dispatcher, args: Value| {
                        tools::$module::handle(dispatcher, args).boxed()
                    }),
                );
            };
        }

        register!("profile", profile);
        register!("postgres", postgres);
        register!("ssh", ssh);
        register!("api", api);
        register!("vault", vault);
        register!("state", state);
        register!("project", project);
        register!("runbook", runbook);
        register!("pipeline", pipeline);
        register!("audit", audit);

        Self {
            inner: Arc::new(Inner { app, handlers }),
        }
    }

    pub fn app(&self) -> &App {
        &self.inner.app
    }

    pub fn known_tools(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.inner.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    async fn resolve_alias(&self, tool: &str) -> String {
        if self.inner.handlers.contains_key(tool) {
            return tool.to_string();
        }
        if let Some(target) = self.inner.app.store.aliases.get(tool).await {
            return target;
        }
        for (alias, target) in BUILTIN_ALIASES {
            if *alias == tool {
                return target.to_string();
            }
        }
        tool.to_string()
    }

    /// Merge preset values as defaults: explicit arguments always win.
    async fn apply_preset(&self, name: &str, args: &mut Map<String, Value>) -> ToolResult<()> {
        let preset = self
            .inner
            .app
            .store
            .presets
            .get(name)
            .await
            .ok_or_else(|| {
                ToolError::not_found(format!("preset '{name}' not found")).with_code("preset_not_found")
            })?;
        let Some(defaults) = preset.as_object() else {
            return Err(ToolError::invalid_params(format!("preset '{name}' is not an object")));
        };
        for (key, value) in defaults {
            args.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(())
    }

    /// Execute one tool call through the full envelope.
    pub async fn execute(&self, tool: &str, args: Value) -> ToolResult<Value> {
        let mut args = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(ToolError::invalid_params("tool arguments must be an object")),
        };
        let envelope = Envelope::extract(&mut args)?;

        let tool = self.resolve_alias(tool).await;
        if let Some(preset) = &envelope.preset {
            self.apply_preset(preset, &mut args).await?;
        }

        let action = args
            .get("action")
            .and_then(|a| a.as_str())
            .unwrap_or("default")
            .to_string();
        let redacted_args = redact_value(&Value::Object(args.clone()));

        let handler = match self.inner.handlers.get(tool.as_str()) {
            Some(handler) => handler.clone(),
            None => {
                return Err(ToolError::not_found(format!("unknown tool '{tool}'"))
                    .with_code("unknown_tool")
                    .with_details(json!({"known_tools": self.known_tools()})));
            }
        };
        tracing::debug!(tool = %tool, action = %action, trace_id = %envelope.trace_id, "dispatching");

        // Hand the trace down so multi-stage tools (pipelines) emit their
        // spans under this call's trace. Inserted after redaction so the
        // audited args stay as the caller sent them.
        args.insert("__trace_id".to_string(), json!(envelope.trace_id.clone()));
        args.insert("__span_id".to_string(), json!(envelope.span_id.clone()));

        let started = std::time::Instant::now();
        let result = handler(self.clone(), Value::Object(args)).await;

        // Shaping and store_as failures count as call failures and are
        // audited the same way.
        let outcome: ToolResult<Value> = match result {
            Err(error) => Err(error),
            Ok(raw) => {
                let shaped = match &envelope.output {
                    Some(output) => shape::apply(raw, output),
                    None => Ok(raw),
                };
                match shaped {
                    Err(error) => Err(error),
                    Ok(shaped) => {
                        let stored = match &envelope.store_as {
                            None => Ok(()),
                            Some(store_as) => {
                                let scope = match (store_as, envelope.store_scope) {
                                    (StoreAs::Scoped { scope, .. }, _) => *scope,
                                    (StoreAs::Key(_), Some(scope)) => scope,
                                    (StoreAs::Key(_), None) => StateScope::Persistent,
                                };
                                self.inner
                                    .app
                                    .store
                                    .state
                                    .set(scope, store_as.key(), shaped.clone())
                                    .await
                                    .map_err(ToolError::from)
                            }
                        };
                        stored.map(|_| shaped)
                    }
                }
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let _ = self
            .inner
            .app
            .store
            .audit
            .append(AuditEntry {
                timestamp: chrono::Utc::now(),
                tool: tool.clone(),
                action,
                status: if outcome.is_ok() {
                    AuditStatus::Ok
                } else {
                    AuditStatus::Error
                },
                trace_id: envelope.trace_id,
                span_id: envelope.span_id,
                parent_span_id: envelope.parent_span_id,
                duration_ms: Some(duration_ms),
                details: Some(redacted_args),
                error: outcome
                    .as_ref()
                    .err()
                    .and_then(|e| serde_json::to_value(e).ok()),
            })
            .await;

        outcome
    }
}

/// Runbook steps call tools through the same envelope as the transport.
#[async_trait]
impl sentryfrogg_engine::ToolInvoker for Dispatcher {
    async fn invoke(&self, tool: &str, args: Value) -> ToolResult<Value> {
        self.execute(tool, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentryfrogg_store::Store;

    async fn dispatcher() -> (Dispatcher, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in(dir.path().to_path_buf()).unwrap();
        (Dispatcher::new(App::new(store)), dir)
    }

    #[tokio::test]
    async fn test_unknown_tool_lists_known() {
        let (dispatcher, _dir) = dispatcher().await;
        let err = dispatcher
            .execute("nonexistent", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, "unknown_tool");
        let known = err.details.unwrap();
        assert!(known["known_tools"]
            .as_array()
            .unwrap()
            .contains(&json!("postgres")));
    }

    #[tokio::test]
    async fn test_builtin_alias() {
        let (dispatcher, _dir) = dispatcher().await;
        // `sql` resolves to postgres, which then complains about its own
        // missing arguments rather than "unknown tool".
        let err = dispatcher
            .execute("sql", json!({"action": "query"}))
            .await
            .unwrap_err();
        assert_ne!(err.code, "unknown_tool");
    }

    #[tokio::test]
    async fn test_store_as_persists_shaped_result() {
        let (dispatcher, _dir) = dispatcher().await;
        dispatcher
            .execute(
                "state",
                json!({"action": "set", "key": "k", "value": {"n": 41}}),
            )
            .await
            .unwrap();

        let result = dispatcher
            .execute(
                "state",
                json!({
                    "action": "get", "key": "k",
                    "output": {"path": "value.n"},
                    "store_as": {"key": "picked", "scope": "session"}
                }),
            )
            .await
            .unwrap();
        assert_eq!(result, json!(41));

        let stored = dispatcher
            .execute("state", json!({"action": "get", "key": "picked", "scope": "session"}))
            .await
            .unwrap();
        assert_eq!(stored["value"], json!(41));
    }

    #[tokio::test]
    async fn test_preset_defaults_lose_to_explicit_args() {
        let (dispatcher, _dir) = dispatcher().await;
        dispatcher
            .app()
            .store
            .presets
            .put("demo", json!({"key": "from_preset", "value": 1, "action": "set"}))
            .await
            .unwrap();

        dispatcher
            .execute("state", json!({"preset": "demo", "key": "explicit"}))
            .await
            .unwrap();

        // preset provided action+value; explicit key won
        let entry = dispatcher
            .execute("state", json!({"action": "get", "key": "explicit"}))
            .await
            .unwrap();
        assert_eq!(entry["value"], json!(1));
    }

    #[tokio::test]
    async fn test_audit_entry_written_per_call() {
        let (dispatcher, _dir) = dispatcher().await;
        dispatcher
            .execute(
                "state",
                json!({"action": "set", "key": "x", "value": 1, "trace_id": "trace-a"}),
            )
            .await
            .unwrap();

        let entries = dispatcher
            .app()
            .store
            .audit
            .read(Some("state"), None, None)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].trace_id, "trace-a");
        assert_eq!(entries[0].action, "set");
    }

    #[tokio::test]
    async fn test_registry_alias() {
        let (dispatcher, _dir) = dispatcher().await;
        dispatcher
            .app()
            .store
            .aliases
            .put("st", "state".to_string())
            .await
            .unwrap();
        let result = dispatcher
            .execute("st", json!({"action": "set", "key": "y", "value": true}))
            .await
            .unwrap();
        assert_eq!(result["stored"], json!(true));
    }
}
