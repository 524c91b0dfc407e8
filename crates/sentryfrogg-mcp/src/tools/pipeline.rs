use sentryfrogg_conn::http::RequestArgs;
use sentryfrogg_engine::{ExportSpec, IngestSpec, PipelineCtx, SftpSpec};
use sentryfrogg_types::{ToolError, ToolResult};
use serde_json::Value;

use super::{action, binding, profile_for, resolve_ctx, trace_of};
use crate::dispatch::Dispatcher;

// ── pipeline tool ────────────────────────────────────────────────
// Actions: http_to_sftp, sftp_to_http, http_to_postgres,
// sftp_to_postgres, postgres_to_sftp, postgres_to_http. Missing
// profile names hydrate from the active project target.

fn section<T: serde::de::DeserializeOwned>(args: &Value, key: &str) -> ToolResult<T> {
    let raw = args
        .get(key)
        .cloned()
        .ok_or_else(|| ToolError::invalid_params(format!("'{key}' section is required")))?;
    serde_json::from_value(raw)
        .map_err(|e| ToolError::invalid_params(format!("invalid '{key}' section: {e}")))
}

async fn http_section(dispatcher: &Dispatcher, args: &Value) -> ToolResult<RequestArgs> {
    let mut request: RequestArgs = section(args, "http")?;
    if request.profile_name.is_none() {
        request.profile_name =
            profile_for(dispatcher.app(), args, |b| b.api_profile.as_ref()).await;
    }
    Ok(request)
}

async fn sftp_section(dispatcher: &Dispatcher, args: &Value) -> ToolResult<SftpSpec> {
    let raw = args
        .get("sftp")
        .cloned()
        .ok_or_else(|| ToolError::invalid_params("'sftp' section is required"))?;
    // profile_name may come from the project binding
    let mut obj = raw;
    if obj.get("profile_name").is_none() {
        if let Some(bound) = binding(dispatcher.app(), args)
            .await
            .and_then(|b| b.ssh_profile)
        {
            if let Some(map) = obj.as_object_mut() {
                map.insert("profile_name".to_string(), Value::String(bound));
            }
        }
    }
    serde_json::from_value(obj)
        .map_err(|e| ToolError::invalid_params(format!("invalid 'sftp' section: {e}")))
}

async fn ingest_section(dispatcher: &Dispatcher, args: &Value) -> ToolResult<IngestSpec> {
    let mut spec: IngestSpec = section(args, "postgres")?;
    if spec.profile_name.is_none() && spec.connection.is_none() {
        spec.profile_name =
            profile_for(dispatcher.app(), args, |b| b.postgres_profile.as_ref()).await;
    }
    Ok(spec)
}

async fn export_section(dispatcher: &Dispatcher, args: &Value) -> ToolResult<ExportSpec> {
    let mut spec: ExportSpec = section(args, "postgres")?;
    if spec.profile_name.is_none() && spec.connection.is_none() {
        spec.profile_name =
            profile_for(dispatcher.app(), args, |b| b.postgres_profile.as_ref()).await;
    }
    Ok(spec)
}

pub async fn handle(dispatcher: Dispatcher, args: Value) -> ToolResult<Value> {
    let app = dispatcher.app();
    let (trace_id, parent_span_id) = trace_of(&args);
    let ctx = PipelineCtx {
        trace_id,
        parent_span_id,
        resolve: resolve_ctx(app, &args).await,
    };

    match action(&args, "") {
        "http_to_sftp" => {
            let http = http_section(&dispatcher, &args).await?;
            let sftp = sftp_section(&dispatcher, &args).await?;
            app.pipelines.http_to_sftp(&http, &sftp, &ctx).await
        }
        "sftp_to_http" => {
            let sftp = sftp_section(&dispatcher, &args).await?;
            let http = http_section(&dispatcher, &args).await?;
            app.pipelines.sftp_to_http(&sftp, &http, &ctx).await
        }
        "http_to_postgres" => {
            let http = http_section(&dispatcher, &args).await?;
            let ingest = ingest_section(&dispatcher, &args).await?;
            app.pipelines.http_to_postgres(&http, &ingest, &ctx).await
        }
        "sftp_to_postgres" => {
            let sftp = sftp_section(&dispatcher, &args).await?;
            let ingest = ingest_section(&dispatcher, &args).await?;
            app.pipelines.sftp_to_postgres(&sftp, &ingest, &ctx).await
        }
        "postgres_to_sftp" => {
            let export = export_section(&dispatcher, &args).await?;
            let sftp = sftp_section(&dispatcher, &args).await?;
            app.pipelines.postgres_to_sftp(&export, &sftp, &ctx).await
        }
        "postgres_to_http" => {
            let export = export_section(&dispatcher, &args).await?;
            let http = http_section(&dispatcher, &args).await?;
            app.pipelines.postgres_to_http(&export, &http, &ctx).await
        }
        other => Err(ToolError::invalid_params(format!(
            "unknown pipeline action '{other}'; expected one of the six flows"
        ))),
    }
}
