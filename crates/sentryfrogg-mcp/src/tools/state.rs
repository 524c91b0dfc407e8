use sentryfrogg_types::{StateScope, ToolError, ToolResult};
use serde_json::{json, Value};

use super::{action, require_str, str_arg};
use crate::dispatch::Dispatcher;

// ── state tool ───────────────────────────────────────────────────
// Actions: get, set, delete, list. `scope` defaults to persistent.

fn scope_of(args: &Value) -> ToolResult<StateScope> {
    match str_arg(args, "scope") {
        None => Ok(StateScope::Persistent),
        Some("persistent") => Ok(StateScope::Persistent),
        Some("session") => Ok(StateScope::Session),
        Some(other) => Err(ToolError::invalid_params(format!(
            "scope must be session or persistent, got '{other}'"
        ))),
    }
}

pub async fn handle(dispatcher: Dispatcher, args: Value) -> ToolResult<Value> {
    let app = dispatcher.app();
    let scope = scope_of(&args)?;

    match action(&args, "get") {
        "set" => {
            let key = require_str(&args, "key")?;
            let value = args.get("value").cloned().ok_or_else(|| {
                ToolError::invalid_params("'value' is required")
            })?;
            app.store.state.set(scope, &key, value).await?;
            Ok(json!({"stored": true, "key": key, "scope": scope.to_string()}))
        }
        "get" => {
            let key = require_str(&args, "key")?;
            match app.store.state.get(scope, &key).await {
                Some(entry) => Ok(json!({
                    "found": true,
                    "key": key,
                    "value": entry.value,
                    "updated_at": entry.updated_at,
                })),
                None => Ok(json!({"found": false, "key": key, "value": null})),
            }
        }
        "delete" => {
            let key = require_str(&args, "key")?;
            let deleted = app.store.state.delete(scope, &key).await?;
            Ok(json!({"deleted": deleted, "key": key}))
        }
        "list" => {
            let entries: Vec<Value> = app
                .store
                .state
                .list(scope)
                .await
                .into_iter()
                .map(|(key, entry)| json!({"key": key, "updated_at": entry.updated_at}))
                .collect();
            Ok(json!({"scope": scope.to_string(), "entries": entries}))
        }
        other => Err(ToolError::invalid_params(format!("unknown state action '{other}'"))),
    }
}
