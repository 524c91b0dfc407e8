use sentryfrogg_types::{Project, StateScope, ToolError, ToolResult};
use serde_json::{json, Value};

use super::{action, require_str, str_arg, ACTIVE_PROJECT_KEY};
use crate::dispatch::Dispatcher;

// ── project tool ─────────────────────────────────────────────────
// Actions: upsert, get, list, delete, use, current. The active project
// fills missing profile names on other tools' calls.

pub async fn handle(dispatcher: Dispatcher, args: Value) -> ToolResult<Value> {
    let app = dispatcher.app();

    match action(&args, "list") {
        "upsert" => {
            let project: Project = serde_json::from_value(args.clone())
                .map_err(|e| ToolError::invalid_params(format!("invalid project: {e}")))?;
            if project.targets.is_empty() {
                return Err(ToolError::invalid_params("project needs at least one target"));
            }
            if !project.targets.contains_key(&project.default_target) {
                return Err(ToolError::invalid_params(format!(
                    "default_target '{}' is not one of the targets",
                    project.default_target
                )));
            }
            let name = project.name.clone();
            app.store.projects.put(&name, project).await?;
            Ok(json!({"stored": true, "name": name}))
        }
        "get" => {
            let name = require_str(&args, "name")?;
            let project = app.store.projects.get(&name).await.ok_or_else(|| {
                ToolError::not_found(format!("project '{name}' not found")).with_code("project_not_found")
            })?;
            Ok(serde_json::to_value(project).unwrap_or(Value::Null))
        }
        "list" => {
            let projects: Vec<Value> = app
                .store
                .projects
                .entries()
                .await
                .into_iter()
                .map(|(name, p)| {
                    json!({
                        "name": name,
                        "description": p.description,
                        "default_target": p.default_target,
                        "targets": p.targets.keys().collect::<Vec<_>>(),
                    })
                })
                .collect();
            Ok(json!({"projects": projects}))
        }
        "delete" => {
            let name = require_str(&args, "name")?;
            let deleted = app.store.projects.remove(&name).await?;
            Ok(json!({"deleted": deleted, "name": name}))
        }
        "use" => {
            let name = require_str(&args, "name")?;
            let project = app.store.projects.get(&name).await.ok_or_else(|| {
                ToolError::not_found(format!("project '{name}' not found")).with_code("project_not_found")
            })?;
            let target = match str_arg(&args, "target") {
                Some(target) => {
                    if !project.targets.contains_key(target) {
                        return Err(ToolError::invalid_params(format!(
                            "project '{name}' has no target '{target}'"
                        )));
                    }
                    target.to_string()
                }
                None => project.default_target.clone(),
            };
            app.store
                .state
                .set(
                    StateScope::Persistent,
                    ACTIVE_PROJECT_KEY,
                    json!({"name": name, "target": target}),
                )
                .await?;
            Ok(json!({"active": true, "name": name, "target": target}))
        }
        "current" => {
            let active = app
                .store
                .state
                .get(StateScope::Persistent, ACTIVE_PROJECT_KEY)
                .await
                .map(|entry| entry.value)
                .unwrap_or(Value::Null);
            Ok(json!({"active_project": active}))
        }
        other => Err(ToolError::invalid_params(format!("unknown project action '{other}'"))),
    }
}
