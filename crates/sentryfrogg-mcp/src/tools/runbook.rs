use sentryfrogg_engine::RunOptions;
use sentryfrogg_types::{MissingPolicy, Runbook, ToolError, ToolResult};
use serde_json::{json, Value};

use super::{action, require_str, str_arg};
use crate::dispatch::Dispatcher;

// ── runbook tool ─────────────────────────────────────────────────
// Actions: upsert, get, list, delete, run. Steps dispatch back through
// the executor, so they get aliases, presets and audit like any call.

pub async fn handle(dispatcher: Dispatcher, args: Value) -> ToolResult<Value> {
    let app = dispatcher.app();

    match action(&args, "list") {
        "upsert" => {
            let runbook: Runbook = args
                .get("runbook")
                .cloned()
                .ok_or_else(|| ToolError::invalid_params("'runbook' is required"))
                .and_then(|raw| {
                    serde_json::from_value(raw)
                        .map_err(|e| ToolError::invalid_params(format!("invalid runbook: {e}")))
                })?;
            runbook
                .validate()
                .map_err(|e| ToolError::invalid_params(e).with_code("runbook_invalid"))?;
            let name = runbook.name.clone();
            app.store.runbooks.put(&name, runbook).await?;
            Ok(json!({"stored": true, "name": name}))
        }
        "get" => {
            let name = require_str(&args, "name")?;
            let runbook = app.store.runbooks.get(&name).await.ok_or_else(|| {
                ToolError::not_found(format!("runbook '{name}' not found")).with_code("runbook_not_found")
            })?;
            Ok(serde_json::to_value(runbook).unwrap_or(Value::Null))
        }
        "list" => {
            let runbooks: Vec<Value> = app
                .store
                .runbooks
                .entries()
                .await
                .into_iter()
                .map(|(name, rb)| {
                    json!({
                        "name": name,
                        "description": rb.description,
                        "steps": rb.steps.len(),
                        "tags": rb.tags,
                    })
                })
                .collect();
            Ok(json!({"runbooks": runbooks}))
        }
        "delete" => {
            let name = require_str(&args, "name")?;
            let deleted = app.store.runbooks.remove(&name).await?;
            Ok(json!({"deleted": deleted, "name": name}))
        }
        "run" => {
            let name = require_str(&args, "name")?;
            let runbook = app.store.runbooks.get(&name).await.ok_or_else(|| {
                ToolError::not_found(format!("runbook '{name}' not found")).with_code("runbook_not_found")
            })?;

            let template_missing = match str_arg(&args, "template_missing") {
                None | Some("error") => MissingPolicy::Error,
                Some("empty") => MissingPolicy::Empty,
                Some("null") => MissingPolicy::Null,
                Some("undefined") => MissingPolicy::Undefined,
                Some(other) => {
                    return Err(ToolError::invalid_params(format!(
                        "unknown template_missing policy '{other}'"
                    )))
                }
            };
            let opts = RunOptions {
                inputs: args.get("inputs").cloned().unwrap_or(Value::Null),
                context: args.get("context").cloned().unwrap_or(Value::Null),
                template_missing,
            };

            let report = app.runbooks.run(&runbook, &opts, &dispatcher).await?;
            Ok(serde_json::to_value(report).unwrap_or(Value::Null))
        }
        other => Err(ToolError::invalid_params(format!("unknown runbook action '{other}'"))),
    }
}
