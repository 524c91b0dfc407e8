use sentryfrogg_types::{ToolError, ToolResult};
use serde_json::{json, Value};

use super::{action, str_arg, u64_arg};
use crate::dispatch::Dispatcher;

// ── audit tool ───────────────────────────────────────────────────
// Actions: tail (bounded most-recent-first read with filters).

pub async fn handle(dispatcher: Dispatcher, args: Value) -> ToolResult<Value> {
    let app = dispatcher.app();

    match action(&args, "tail") {
        "tail" | "read" => {
            let since = match str_arg(&args, "since") {
                None => None,
                Some(raw) => Some(
                    chrono::DateTime::parse_from_rfc3339(raw)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .map_err(|_| {
                            ToolError::invalid_params("'since' must be an RFC3339 datetime")
                        })?,
                ),
            };
            let entries = app
                .store
                .audit
                .read(
                    str_arg(&args, "tool"),
                    since,
                    u64_arg(&args, "limit").map(|l| l as usize),
                )
                .await?;
            Ok(json!({
                "count": entries.len(),
                "entries": entries,
            }))
        }
        other => Err(ToolError::invalid_params(format!("unknown audit action '{other}'"))),
    }
}
