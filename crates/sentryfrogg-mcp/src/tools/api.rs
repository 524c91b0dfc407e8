use sentryfrogg_conn::http::{PaginationSpec, RequestArgs};
use sentryfrogg_types::{ToolError, ToolResult};
use serde_json::Value;
use std::path::PathBuf;

use super::{action, bool_arg, profile_for, require_str, resolve_ctx};
use crate::dispatch::Dispatcher;

// ── api tool ─────────────────────────────────────────────────────
// Actions: request, paginate, download, check.

async fn request_args(dispatcher: &Dispatcher, args: &Value) -> ToolResult<RequestArgs> {
    let mut request: RequestArgs = serde_json::from_value(args.clone())
        .map_err(|e| ToolError::invalid_params(format!("invalid request arguments: {e}")))?;
    if request.profile_name.is_none() {
        request.profile_name =
            profile_for(dispatcher.app(), args, |b| b.api_profile.as_ref()).await;
    }
    Ok(request)
}

pub async fn handle(dispatcher: Dispatcher, args: Value) -> ToolResult<Value> {
    let app = dispatcher.app();
    let ctx = resolve_ctx(app, &args).await;
    let request = request_args(&dispatcher, &args).await?;

    match action(&args, "request") {
        "request" => app.api.request(&request, &ctx).await,
        "paginate" => {
            let spec: PaginationSpec = args
                .get("pagination")
                .cloned()
                .ok_or_else(|| ToolError::invalid_params("'pagination' is required"))
                .and_then(|raw| {
                    serde_json::from_value(raw).map_err(|e| {
                        ToolError::invalid_params(format!("invalid pagination spec: {e}"))
                    })
                })?;
            app.api.paginate(&request, &spec, &ctx).await
        }
        // `path` is the URL path on this surface, so the local destination
        // uses target_path.
        "download" => {
            let target = PathBuf::from(require_str(&args, "target_path")?);
            app.api
                .download(&request, &target, bool_arg(&args, "overwrite", false), &ctx)
                .await
        }
        "check" => app.api.check(&request, &ctx).await,
        other => Err(ToolError::invalid_params(format!("unknown api action '{other}'"))),
    }
}
