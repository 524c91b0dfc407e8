use sentryfrogg_conn::postgres::{
    ExportFormat, ExportOptions, PgSource, ResultMode, Statement,
};
use sentryfrogg_types::{ToolError, ToolResult};
use serde_json::{json, Map, Value};
use std::path::PathBuf;

use super::{action, bool_arg, profile_for, require_str, resolve_ctx, str_arg, u64_arg};
use crate::dispatch::Dispatcher;

// ── postgres tool ────────────────────────────────────────────────
// Actions: test, query, batch, transaction, insert, insert_bulk,
// update, delete, select, count, exists, export, catalog_tables,
// catalog_columns, database_info.

async fn source_of(dispatcher: &Dispatcher, args: &Value) -> ToolResult<PgSource> {
    let profile = profile_for(dispatcher.app(), args, |b| b.postgres_profile.as_ref()).await;
    PgSource::from_args(profile, args.get("connection").cloned())
}

fn mode_of(args: &Value) -> ToolResult<ResultMode> {
    match str_arg(args, "mode") {
        None => Ok(ResultMode::Rows),
        Some(raw) => serde_json::from_value(json!(raw))
            .map_err(|_| ToolError::invalid_params(format!("unknown result mode '{raw}'"))),
    }
}

fn params_of(args: &Value) -> Vec<Value> {
    args.get("params")
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default()
}

fn filters_of(args: &Value) -> Value {
    args.get("filters").cloned().unwrap_or(Value::Null)
}

fn statements_of(args: &Value) -> ToolResult<Vec<Statement>> {
    let raw = args
        .get("statements")
        .cloned()
        .ok_or_else(|| ToolError::invalid_params("'statements' is required"))?;
    serde_json::from_value(raw)
        .map_err(|e| ToolError::invalid_params(format!("invalid statements: {e}")))
}

fn data_of(args: &Value, key: &str) -> ToolResult<Map<String, Value>> {
    args.get(key)
        .and_then(|d| d.as_object())
        .cloned()
        .ok_or_else(|| ToolError::invalid_params(format!("'{key}' object is required")))
}

pub async fn handle(dispatcher: Dispatcher, args: Value) -> ToolResult<Value> {
    let app = dispatcher.app();
    let source = source_of(&dispatcher, &args).await?;
    let ctx = resolve_ctx(app, &args).await;

    match action(&args, "query") {
        "test" => app.pg.test(&source, &ctx).await,
        "query" => {
            let sql = require_str(&args, "sql")?;
            app.pg
                .query(&source, &ctx, &sql, &params_of(&args), mode_of(&args)?)
                .await
        }
        "batch" => app.pg.batch(&source, &ctx, &statements_of(&args)?).await,
        "transaction" => {
            app.pg
                .transaction(&source, &ctx, &statements_of(&args)?)
                .await
        }
        "insert" => {
            let table = require_str(&args, "table")?;
            let data = data_of(&args, "data")?;
            app.pg
                .insert(&source, &ctx, &table, &data, bool_arg(&args, "returning", false))
                .await
        }
        "insert_bulk" => {
            let table = require_str(&args, "table")?;
            let rows = args
                .get("rows")
                .and_then(|r| r.as_array())
                .cloned()
                .ok_or_else(|| ToolError::invalid_params("'rows' array is required"))?;
            let columns: Option<Vec<String>> = args
                .get("columns")
                .and_then(|c| c.as_array())
                .map(|cols| {
                    cols.iter()
                        .filter_map(|c| c.as_str().map(String::from))
                        .collect()
                });
            app.pg
                .insert_bulk(
                    &source,
                    &ctx,
                    &table,
                    columns,
                    &rows,
                    u64_arg(&args, "batch_size").map(|b| b as usize),
                )
                .await
        }
        "update" => {
            let table = require_str(&args, "table")?;
            let set = data_of(&args, "set")?;
            app.pg
                .update(
                    &source,
                    &ctx,
                    &table,
                    &set,
                    &filters_of(&args),
                    bool_arg(&args, "returning", false),
                )
                .await
        }
        "delete" => {
            let table = require_str(&args, "table")?;
            app.pg
                .delete(
                    &source,
                    &ctx,
                    &table,
                    &filters_of(&args),
                    bool_arg(&args, "returning", false),
                )
                .await
        }
        "select" => {
            let table = require_str(&args, "table")?;
            let columns: Option<Vec<String>> = args
                .get("columns")
                .and_then(|c| c.as_array())
                .map(|cols| {
                    cols.iter()
                        .filter_map(|c| c.as_str().map(String::from))
                        .collect()
                });
            app.pg
                .select(
                    &source,
                    &ctx,
                    &table,
                    columns.as_deref(),
                    str_arg(&args, "columns_sql"),
                    &filters_of(&args),
                    str_arg(&args, "where_sql"),
                    str_arg(&args, "order_by"),
                    str_arg(&args, "order_by_sql"),
                    u64_arg(&args, "limit"),
                    u64_arg(&args, "offset"),
                    mode_of(&args)?,
                )
                .await
        }
        "count" => {
            let table = require_str(&args, "table")?;
            app.pg.count(&source, &ctx, &table, &filters_of(&args)).await
        }
        "exists" => {
            let table = require_str(&args, "table")?;
            app.pg.exists(&source, &ctx, &table, &filters_of(&args)).await
        }
        "export" => {
            let path = PathBuf::from(require_str(&args, "path")?);
            let format = match str_arg(&args, "format").unwrap_or("jsonl") {
                "csv" => ExportFormat::Csv,
                "jsonl" => ExportFormat::Jsonl,
                other => {
                    return Err(ToolError::invalid_params(format!(
                        "unknown export format '{other}'"
                    )))
                }
            };
            let base_sql = match (str_arg(&args, "sql"), str_arg(&args, "table")) {
                (Some(sql), _) => sql.to_string(),
                (None, Some(table)) => format!(
                    "SELECT * FROM {}",
                    sentryfrogg_conn::postgres::quote_ident(table)?
                ),
                (None, None) => {
                    return Err(ToolError::invalid_params("either sql or table is required"))
                }
            };
            let mut opts = ExportOptions {
                format,
                ..Default::default()
            };
            if let Some(batch) = u64_arg(&args, "batch_size") {
                opts.batch_size = (batch as usize).max(1);
            }
            opts.limit = u64_arg(&args, "limit");

            if !bool_arg(&args, "overwrite", false) && path.exists() {
                return Err(ToolError::conflict(format!(
                    "'{}' exists; pass overwrite=true to replace it",
                    path.display()
                ))
                .with_code("export_exists"));
            }
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ToolError::internal(format!("mkdir failed: {e}")))?;
            }

            let part = path.with_extension("part");
            let mut file = tokio::fs::File::create(&part)
                .await
                .map_err(|e| ToolError::internal(format!("cannot create {}: {e}", part.display())))?;
            let report = match app
                .pg
                .export(&source, &ctx, &base_sql, &params_of(&args), &opts, &mut file)
                .await
            {
                Ok(report) => report,
                Err(err) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(err);
                }
            };
            file.sync_all()
                .await
                .map_err(|e| ToolError::internal(format!("fsync failed: {e}")))?;
            drop(file);
            tokio::fs::rename(&part, &path)
                .await
                .map_err(|e| ToolError::internal(format!("rename failed: {e}")))?;

            Ok(json!({
                "path": path.display().to_string(),
                "rows": report.rows,
                "pages": report.pages,
                "bytes_written": report.bytes_written,
            }))
        }
        "catalog_tables" => {
            app.pg
                .catalog_tables(&source, &ctx, str_arg(&args, "schema"))
                .await
        }
        "catalog_columns" => {
            let table = require_str(&args, "table")?;
            app.pg.catalog_columns(&source, &ctx, &table).await
        }
        "database_info" => app.pg.database_info(&source, &ctx).await,
        other => Err(ToolError::invalid_params(format!("unknown postgres action '{other}'"))),
    }
}
