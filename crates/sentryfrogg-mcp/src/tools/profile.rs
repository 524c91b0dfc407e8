use sentryfrogg_conn::http::RequestArgs;
use sentryfrogg_conn::postgres::PgSource;
use sentryfrogg_types::{ProfileKind, ToolError, ToolResult};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::{action, require_str, resolve_ctx, str_arg};
use crate::dispatch::Dispatcher;

// ── profile tool ─────────────────────────────────────────────────
// Actions: upsert, get, list, delete, test, export (break-glass), plus
// the alias/preset registries consumed by the dispatcher.

fn parse_kind(args: &Value, key: &str) -> ToolResult<Option<ProfileKind>> {
    match str_arg(args, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<ProfileKind>()
            .map(Some)
            .map_err(ToolError::invalid_params),
    }
}

pub async fn handle(dispatcher: Dispatcher, args: Value) -> ToolResult<Value> {
    let app = dispatcher.app();

    match action(&args, "list") {
        "upsert" => {
            let name = require_str(&args, "name")?;
            let kind = parse_kind(&args, "type")?
                .ok_or_else(|| ToolError::invalid_params("'type' is required"))?;
            let data: Map<String, Value> = args
                .get("data")
                .and_then(|d| d.as_object())
                .cloned()
                .unwrap_or_default();
            let secrets: BTreeMap<String, String> = args
                .get("secrets")
                .and_then(|s| s.as_object())
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();

            let summary = app.store.profiles.set(&name, kind, data, secrets).await?;
            Ok(serde_json::to_value(summary).unwrap_or(Value::Null))
        }
        "get" => {
            let name = require_str(&args, "name")?;
            let expected = parse_kind(&args, "type")?;
            let profile = app.store.profiles.get(&name, expected).await?;
            // Secret values never leave the store here, only their names.
            Ok(json!({
                "name": profile.name,
                "type": profile.kind.to_string(),
                "data": profile.data,
                "secret_keys": profile.secrets.keys().collect::<Vec<_>>(),
                "created_at": profile.created_at,
                "updated_at": profile.updated_at,
            }))
        }
        "list" => {
            let kind = parse_kind(&args, "type")?;
            let summaries = app.store.profiles.list(kind).await;
            Ok(json!({"profiles": summaries}))
        }
        "delete" => {
            let name = require_str(&args, "name")?;
            let deleted = app.store.profiles.delete(&name).await?;
            Ok(json!({"deleted": deleted, "name": name}))
        }
        "export" => {
            let name = require_str(&args, "name")?;
            let profile = app.store.profiles.export_plaintext(&name).await?;
            Ok(serde_json::to_value(profile).unwrap_or(Value::Null))
        }
        "test" => {
            let name = require_str(&args, "name")?;
            let profile = app.store.profiles.get(&name, None).await?;
            let ctx = resolve_ctx(app, &args).await;
            match profile.kind {
                ProfileKind::Postgresql => {
                    app.pg.test(&PgSource::Profile(name), &ctx).await
                }
                ProfileKind::Ssh => app.ssh.check_host(&name, &ctx).await,
                ProfileKind::Api => {
                    let request = RequestArgs {
                        profile_name: Some(name),
                        path: Some("/".to_string()),
                        ..Default::default()
                    };
                    app.api.check(&request, &ctx).await
                }
                ProfileKind::Vault => app.vault.sys_health(&name).await,
            }
        }

        // ── alias registry ───────────────────────────────────────
        "alias_set" => {
            let alias = require_str(&args, "alias")?;
            let tool = require_str(&args, "tool")?;
            app.store.aliases.put(&alias, tool.clone()).await?;
            Ok(json!({"stored": true, "alias": alias, "tool": tool}))
        }
        "alias_delete" => {
            let alias = require_str(&args, "alias")?;
            Ok(json!({"deleted": app.store.aliases.remove(&alias).await?}))
        }
        "alias_list" => {
            let aliases: Map<String, Value> = app
                .store
                .aliases
                .entries()
                .await
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            Ok(json!({"aliases": aliases}))
        }

        // ── preset registry ──────────────────────────────────────
        "preset_set" => {
            let name = require_str(&args, "preset")?;
            let values = args
                .get("values")
                .cloned()
                .ok_or_else(|| ToolError::invalid_params("'values' is required"))?;
            if !values.is_object() {
                return Err(ToolError::invalid_params("preset values must be an object"));
            }
            app.store.presets.put(&name, values).await?;
            Ok(json!({"stored": true, "preset": name}))
        }
        "preset_delete" => {
            let name = require_str(&args, "preset")?;
            Ok(json!({"deleted": app.store.presets.remove(&name).await?}))
        }
        "preset_list" => Ok(json!({"presets": app.store.presets.names().await})),

        other => Err(ToolError::invalid_params(format!("unknown profile action '{other}'"))),
    }
}
