use sentryfrogg_conn::vault::Kv2Options;
use sentryfrogg_types::{ToolError, ToolResult};
use serde_json::{json, Value};

use super::{action, profile_for, require_str, u64_arg};
use crate::dispatch::Dispatcher;

// ── vault tool ───────────────────────────────────────────────────
// Actions: health, token_lookup, kv2_get. The profile comes from
// `profile_name`, the project binding, or the singleton vault profile.

async fn vault_profile(dispatcher: &Dispatcher, args: &Value) -> ToolResult<String> {
    if let Some(name) = profile_for(dispatcher.app(), args, |b| b.vault_profile.as_ref()).await {
        return Ok(name);
    }
    dispatcher
        .app()
        .store
        .profiles
        .singleton_of_kind(sentryfrogg_types::ProfileKind::Vault)
        .await
        .ok_or_else(|| {
            ToolError::invalid_params("no vault profile named and no single default exists")
                .with_hint("pass profile_name or create exactly one vault profile")
        })
}

pub async fn handle(dispatcher: Dispatcher, args: Value) -> ToolResult<Value> {
    let app = dispatcher.app();
    let profile = vault_profile(&dispatcher, &args).await?;

    match action(&args, "kv2_get") {
        "health" => app.vault.sys_health(&profile).await,
        "token_lookup" => app.vault.token_lookup_self(&profile).await,
        "kv2_get" => {
            let reference = require_str(&args, "path")?;
            let opts = Kv2Options {
                version: u64_arg(&args, "version").map(|v| v as u32),
                timeout_ms: u64_arg(&args, "timeout_ms"),
                retries: u64_arg(&args, "retries").map(|r| r as u32),
            };
            let value = app.vault.kv2_get(&profile, &reference, opts).await?;
            Ok(json!({"path": reference, "value": value}))
        }
        other => Err(ToolError::invalid_params(format!("unknown vault action '{other}'"))),
    }
}
