pub mod api;
pub mod audit;
pub mod pipeline;
pub mod postgres;
pub mod profile;
pub mod project;
pub mod runbook;
pub mod ssh;
pub mod state;
pub mod vault;

use sentryfrogg_conn::resolver::ResolveCtx;
use sentryfrogg_types::{TargetBinding, ToolError, ToolResult};
use serde_json::Value;

use crate::app::App;

pub(crate) const ACTIVE_PROJECT_KEY: &str = "__active_project";

// ── Shared argument helpers ──────────────────────────────────────

pub(crate) fn action<'a>(args: &'a Value, default: &'a str) -> &'a str {
    args.get("action").and_then(|a| a.as_str()).unwrap_or(default)
}

pub(crate) fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

pub(crate) fn require_str(args: &Value, key: &str) -> ToolResult<String> {
    str_arg(args, key)
        .map(String::from)
        .ok_or_else(|| ToolError::invalid_params(format!("'{key}' is required")))
}

pub(crate) fn bool_arg(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

pub(crate) fn u64_arg(args: &Value, key: &str) -> Option<u64> {
    args.get(key).and_then(|v| v.as_u64())
}

/// Trace ids the dispatcher threaded through for nested spans.
pub(crate) fn trace_of(args: &Value) -> (String, Option<String>) {
    let trace_id = str_arg(args, "__trace_id")
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let span_id = str_arg(args, "__span_id").map(String::from);
    (trace_id, span_id)
}

// ── Project hydration ────────────────────────────────────────────
//
// Missing profile names are filled from the active project's target
// binding; an explicit `project`/`target` argument overrides the
// active selection.

pub(crate) async fn binding(app: &App, args: &Value) -> Option<TargetBinding> {
    let active = app
        .store
        .state
        .get(sentryfrogg_types::StateScope::Persistent, ACTIVE_PROJECT_KEY)
        .await
        .map(|entry| entry.value);

    let project_name = str_arg(args, "project")
        .map(String::from)
        .or_else(|| active.as_ref()?.get("name")?.as_str().map(String::from))?;
    let project = app.store.projects.get(&project_name).await?;

    let target = str_arg(args, "target")
        .map(String::from)
        .or_else(|| active.as_ref()?.get("target")?.as_str().map(String::from));
    project.target(target.as_deref()).cloned()
}

/// Resolve the vault profile context for secret references.
pub(crate) async fn resolve_ctx(app: &App, args: &Value) -> ResolveCtx {
    let vault_profile = match str_arg(args, "vault_profile_name") {
        Some(name) => Some(name.to_string()),
        None => binding(app, args).await.and_then(|b| b.vault_profile),
    };
    ResolveCtx { vault_profile }
}

/// `profile_name` argument, else the named role from the project binding.
pub(crate) async fn profile_for(
    app: &App,
    args: &Value,
    role: fn(&TargetBinding) -> Option<&String>,
) -> Option<String> {
    if let Some(name) = str_arg(args, "profile_name") {
        return Some(name.to_string());
    }
    binding(app, args).await.and_then(|b| role(&b).cloned())
}
