use sentryfrogg_store::ProfileStore;
use sentryfrogg_types::{ErrorCategory, ProfileKind, ToolError, ToolResult};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::canonical_json;
use crate::resolver::{ResolveCtx, SecretResolver};

// ── PostgreSQL manager ───────────────────────────────────────────
//
// One pool per key (`profile:<name>` or `inline:<sha256>`), lazy dial,
// eviction on connection-level errors. All user-supplied identifiers go
// through strict quoting; all values travel as parameters.

const MAX_BIND_PARAMS: usize = 65_535;
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_EXPORT_BATCH: usize = 1000;

// ── Connection source ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum PgSource {
    Profile(String),
    Inline(Value),
}

impl PgSource {
    pub fn from_args(profile_name: Option<String>, connection: Option<Value>) -> ToolResult<Self> {
        match (profile_name, connection) {
            (Some(name), _) => Ok(Self::Profile(name)),
            (None, Some(conn)) => Ok(Self::Inline(conn)),
            (None, None) => Err(ToolError::invalid_params(
                "either profile_name or connection is required",
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PoolOpts {
    pub max_connections: Option<u32>,
    pub idle_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
}

// ── Identifier quoting ───────────────────────────────────────────

/// Quote a possibly dot-qualified identifier. Every part is wrapped in
/// double quotes with embedded quotes doubled, so no unquoted input can
/// survive into emitted SQL.
pub fn quote_ident(raw: &str) -> ToolResult<String> {
    if raw.is_empty() {
        return Err(ToolError::invalid_params("identifier must not be empty"));
    }
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(ToolError::invalid_params(format!(
            "identifier '{raw}' has an empty part"
        )));
    }
    Ok(parts
        .iter()
        .map(|p| format!("\"{}\"", p.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join("."))
}

// ── Filters ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Like,
    In,
    NotIn,
}

impl FilterOp {
    fn parse(raw: &str) -> ToolResult<Self> {
        match raw {
            "=" => Ok(Self::Eq),
            "!=" | "<>" => Ok(Self::Ne),
            "<" => Ok(Self::Lt),
            ">" => Ok(Self::Gt),
            "<=" => Ok(Self::Le),
            ">=" => Ok(Self::Ge),
            "LIKE" | "like" => Ok(Self::Like),
            "IN" | "in" => Ok(Self::In),
            "NOT IN" | "not in" => Ok(Self::NotIn),
            other => Err(ToolError::invalid_params(format!(
                "unsupported filter operator '{other}'"
            ))),
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Like => "LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
        }
    }
}

/// Build a WHERE fragment from either a `{column: value}` map (AND-joined
/// equality) or an array of `{column, op, value}` clauses. Values are
/// appended to `params`; the fragment references them as `$n`.
pub fn build_where(filters: &Value, params: &mut Vec<Value>) -> ToolResult<String> {
    let mut fragments: Vec<String> = Vec::new();

    match filters {
        Value::Null => {}
        Value::Object(map) => {
            for (column, value) in map {
                let ident = quote_ident(column)?;
                if value.is_null() {
                    fragments.push(format!("{ident} IS NULL"));
                } else {
                    params.push(value.clone());
                    fragments.push(format!("{ident} = ${}", params.len()));
                }
            }
        }
        Value::Array(clauses) => {
            for clause in clauses {
                let obj = clause.as_object().ok_or_else(|| {
                    ToolError::invalid_params("filter clause must be an object")
                })?;
                let column = obj
                    .get("column")
                    .and_then(|c| c.as_str())
                    .ok_or_else(|| ToolError::invalid_params("filter clause needs a column"))?;
                let ident = quote_ident(column)?;
                let op = FilterOp::parse(obj.get("op").and_then(|o| o.as_str()).unwrap_or("="))?;
                let value = obj.get("value").cloned().unwrap_or(Value::Null);

                match op {
                    FilterOp::In | FilterOp::NotIn => {
                        let items = value.as_array().filter(|a| !a.is_empty()).ok_or_else(|| {
                            ToolError::invalid_params(format!(
                                "{} filter on '{column}' requires a non-empty array",
                                op.sql()
                            ))
                        })?;
                        let mut placeholders = Vec::with_capacity(items.len());
                        for item in items {
                            params.push(item.clone());
                            placeholders.push(format!("${}", params.len()));
                        }
                        fragments.push(format!("{ident} {} ({})", op.sql(), placeholders.join(", ")));
                    }
                    FilterOp::Eq if value.is_null() => fragments.push(format!("{ident} IS NULL")),
                    FilterOp::Ne if value.is_null() => fragments.push(format!("{ident} IS NOT NULL")),
                    _ => {
                        params.push(value);
                        fragments.push(format!("{ident} {} ${}", op.sql(), params.len()));
                    }
                }
            }
        }
        _ => {
            return Err(ToolError::invalid_params(
                "filters must be an object map or an array of clauses",
            ))
        }
    }

    Ok(if fragments.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", fragments.join(" AND "))
    })
}

// ── Parameter binding & row decoding ─────────────────────────────

fn bind_json<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.clone()),
        // Arrays and objects travel as jsonb.
        other => query.bind(other.clone()),
    }
}

fn decode_column(row: &PgRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|n| json!(n)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|n| json!(n)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|n| json!(n)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|n| json!(n)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(|n| json!(n)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
        return v.map(|u| json!(u.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(|t| json!(t.to_rfc3339())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v.map(|t| json!(t.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v.map(|t| json!(t.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Value>, _>(idx) {
        return v.unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        use base64::Engine;
        return v
            .map(|b| json!(base64::engine::general_purpose::STANDARD.encode(b)))
            .unwrap_or(Value::Null);
    }
    Value::Null
}

pub fn row_to_json(row: &PgRow) -> Value {
    let mut obj = Map::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        obj.insert(column.name().to_string(), decode_column(row, idx));
    }
    Value::Object(obj)
}

// ── Result modes ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultMode {
    #[default]
    Rows,
    Row,
    Value,
    Command,
}

// ── Manager ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgManager {
    pools: Arc<Mutex<HashMap<String, PgPool>>>,
    profiles: ProfileStore,
    resolver: SecretResolver,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub batch_size: usize,
    pub limit: Option<u64>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::Jsonl,
            batch_size: DEFAULT_EXPORT_BATCH,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Jsonl,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExportReport {
    pub rows: u64,
    pub pages: u64,
    pub bytes_written: u64,
}

impl PgManager {
    pub fn new(profiles: ProfileStore, resolver: SecretResolver) -> Self {
        let manager = Self {
            pools: Arc::new(Mutex::new(HashMap::new())),
            profiles: profiles.clone(),
            resolver,
        };
        // Profile mutations evict the matching pool so the next call redials.
        let pools = manager.pools.clone();
        profiles.on_change(Box::new(move |name| {
            pools.lock().expect("pool map poisoned").remove(&format!("profile:{name}"));
        }));
        manager
    }

    /// Invalidate one pool key explicitly.
    pub fn invalidate(&self, key: &str) {
        self.pools.lock().expect("pool map poisoned").remove(key);
    }

    async fn conn_config(&self, source: &PgSource, ctx: &ResolveCtx) -> ToolResult<(String, Value)> {
        match source {
            PgSource::Profile(name) => {
                let profile = self
                    .profiles
                    .get(name, Some(ProfileKind::Postgresql))
                    .await?;
                let merged = Value::Object(profile.merged_config());
                let resolved = self.resolver.resolve_deep(&merged, ctx).await?;
                Ok((format!("profile:{name}"), resolved))
            }
            PgSource::Inline(conn) => {
                let resolved = self.resolver.resolve_deep(conn, ctx).await?;
                let digest = Sha256::digest(canonical_json(&resolved).as_bytes());
                Ok((format!("inline:{}", hex::encode(digest)), resolved))
            }
        }
    }

    fn connection_url(config: &Value) -> ToolResult<String> {
        if let Some(url) = config.get("url").and_then(|u| u.as_str()) {
            return Ok(url.to_string());
        }
        let get = |key: &str| config.get(key).and_then(|v| v.as_str());
        let host = get("host").ok_or_else(|| {
            ToolError::invalid_params("postgres connection needs host or url")
        })?;
        let port = config.get("port").and_then(|p| p.as_u64()).unwrap_or(5432);
        let database = get("database").unwrap_or("postgres");
        let username = get("username").or_else(|| get("user")).unwrap_or("postgres");
        let password = get("password").unwrap_or("");

        let mut url = format!(
            "postgres://{}:{}@{host}:{port}/{database}",
            urlencoding::encode(username),
            urlencoding::encode(password)
        );
        if let Some(params) = config.get("params").and_then(|p| p.as_object()) {
            let query: Vec<String> = params
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| format!("{k}={s}")))
                .collect();
            if !query.is_empty() {
                url.push('?');
                url.push_str(&query.join("&"));
            }
        }
        Ok(url)
    }

    async fn pool(&self, source: &PgSource, ctx: &ResolveCtx) -> ToolResult<(String, PgPool)> {
        let (key, config) = self.conn_config(source, ctx).await?;

        if let Some(pool) = self.pools.lock().expect("pool map poisoned").get(&key) {
            return Ok((key, pool.clone()));
        }

        let pool_opts: PoolOpts = config
            .get("pool")
            .cloned()
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default();

        let url = Self::connection_url(&config)?;
        let pool = PgPoolOptions::new()
            .max_connections(pool_opts.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))
            .idle_timeout(Duration::from_millis(
                pool_opts.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS * 1000),
            ))
            .acquire_timeout(Duration::from_millis(
                pool_opts
                    .acquire_timeout_ms
                    .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS * 1000),
            ))
            .connect_lazy(&url)
            .map_err(|e| ToolError::invalid_params(format!("invalid postgres connection: {e}")))?;

        self.pools
            .lock()
            .expect("pool map poisoned")
            .insert(key.clone(), pool.clone());
        Ok((key, pool))
    }

    fn map_error(&self, key: &str, err: sqlx::Error) -> ToolError {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_) => {
                // Connection-level failure: evict so the next call redials.
                self.invalidate(key);
                ToolError::retryable(format!("postgres connection error: {err}"))
                    .with_code("postgres_connection")
            }
            sqlx::Error::RowNotFound => {
                ToolError::not_found("no row matched").with_code("postgres_no_row")
            }
            sqlx::Error::Database(db) => {
                ToolError::new(ErrorCategory::InvalidParams, "postgres_query", db.message().to_string())
            }
            _ => ToolError::internal(format!("postgres error: {err}")).with_code("postgres_query"),
        }
    }

    async fn fetch(
        &self,
        pool: &PgPool,
        key: &str,
        sql: &str,
        params: &[Value],
        mode: ResultMode,
    ) -> ToolResult<Value> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_json(query, param);
        }

        match mode {
            ResultMode::Command => {
                let done = query
                    .execute(pool)
                    .await
                    .map_err(|e| self.map_error(key, e))?;
                Ok(json!({"rows_affected": done.rows_affected()}))
            }
            ResultMode::Rows => {
                let rows = query
                    .fetch_all(pool)
                    .await
                    .map_err(|e| self.map_error(key, e))?;
                Ok(json!({
                    "rows": rows.iter().map(row_to_json).collect::<Vec<_>>(),
                    "row_count": rows.len(),
                }))
            }
            ResultMode::Row => {
                let row = query
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| self.map_error(key, e))?;
                Ok(json!({"row": row.as_ref().map(row_to_json)}))
            }
            ResultMode::Value => {
                let row = query
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| self.map_error(key, e))?;
                let value = row.as_ref().map(|r| decode_column(r, 0)).unwrap_or(Value::Null);
                Ok(json!({"value": value}))
            }
        }
    }

    // ── Public operations ────────────────────────────────────────

    pub async fn test(&self, source: &PgSource, ctx: &ResolveCtx) -> ToolResult<Value> {
        let (key, pool) = self.pool(source, ctx).await?;
        let result = self
            .fetch(&pool, &key, "SELECT version()", &[], ResultMode::Value)
            .await?;
        Ok(json!({"ok": true, "version": result["value"]}))
    }

    pub async fn query(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        sql: &str,
        params: &[Value],
        mode: ResultMode,
    ) -> ToolResult<Value> {
        let (key, pool) = self.pool(source, ctx).await?;
        self.fetch(&pool, &key, sql, params, mode).await
    }

    /// Run statements sequentially outside a transaction.
    pub async fn batch(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        statements: &[Statement],
    ) -> ToolResult<Value> {
        let (key, pool) = self.pool(source, ctx).await?;
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            let result = self
                .fetch(&pool, &key, &statement.sql, &statement.params, ResultMode::Rows)
                .await?;
            results.push(result);
        }
        Ok(json!({"results": results}))
    }

    /// Run statements in one transaction; any failure rolls everything back.
    pub async fn transaction(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        statements: &[Statement],
    ) -> ToolResult<Value> {
        let (key, pool) = self.pool(source, ctx).await?;
        let mut tx = pool.begin().await.map_err(|e| self.map_error(&key, e))?;

        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            let mut query = sqlx::query(&statement.sql);
            for param in &statement.params {
                query = bind_json(query, param);
            }
            match query.execute(&mut *tx).await {
                Ok(done) => results.push(json!({"rows_affected": done.rows_affected()})),
                Err(e) => {
                    tx.rollback().await.ok();
                    return Err(self.map_error(&key, e));
                }
            }
        }

        tx.commit().await.map_err(|e| self.map_error(&key, e))?;
        Ok(json!({"committed": true, "results": results}))
    }

    pub async fn insert(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        table: &str,
        data: &Map<String, Value>,
        returning: bool,
    ) -> ToolResult<Value> {
        if data.is_empty() {
            return Err(ToolError::invalid_params("insert data must not be empty"));
        }
        let table_ident = quote_ident(table)?;
        let mut columns = Vec::with_capacity(data.len());
        let mut placeholders = Vec::with_capacity(data.len());
        let mut params = Vec::with_capacity(data.len());
        for (idx, (column, value)) in data.iter().enumerate() {
            columns.push(quote_ident(column)?);
            placeholders.push(format!("${}", idx + 1));
            params.push(value.clone());
        }

        let mut sql = format!(
            "INSERT INTO {table_ident} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        if returning {
            sql.push_str(" RETURNING *");
        }

        let mode = if returning { ResultMode::Rows } else { ResultMode::Command };
        let (key, pool) = self.pool(source, ctx).await?;
        self.fetch(&pool, &key, &sql, &params, mode).await
    }

    /// Bulk insert. Accepts row objects (columns from the first row) or row
    /// arrays with explicit `columns`. Rows are chunked so each statement
    /// stays within the 65535 bind-parameter ceiling.
    pub async fn insert_bulk(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        table: &str,
        columns: Option<Vec<String>>,
        rows: &[Value],
        batch_size: Option<usize>,
    ) -> ToolResult<Value> {
        if rows.is_empty() {
            return Ok(json!({"inserted": 0, "batches": 0}));
        }

        let columns: Vec<String> = match columns {
            Some(c) if !c.is_empty() => c,
            _ => match &rows[0] {
                Value::Object(map) => map.keys().cloned().collect(),
                _ => {
                    return Err(ToolError::invalid_params(
                        "row arrays require explicit columns",
                    ))
                }
            },
        };

        let table_ident = quote_ident(table)?;
        let quoted: Vec<String> = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<ToolResult<_>>()?;

        let max_rows_per_batch = (MAX_BIND_PARAMS / columns.len()).max(1);
        let chunk = batch_size
            .unwrap_or(max_rows_per_batch)
            .min(max_rows_per_batch)
            .max(1);

        let (key, pool) = self.pool(source, ctx).await?;
        let mut inserted: u64 = 0;
        let mut batches: u64 = 0;

        for batch in rows.chunks(chunk) {
            let mut params: Vec<Value> = Vec::with_capacity(batch.len() * columns.len());
            let mut tuples: Vec<String> = Vec::with_capacity(batch.len());
            for row in batch {
                let mut placeholders = Vec::with_capacity(columns.len());
                match row {
                    Value::Object(map) => {
                        for column in &columns {
                            params.push(map.get(column).cloned().unwrap_or(Value::Null));
                            placeholders.push(format!("${}", params.len()));
                        }
                    }
                    Value::Array(items) => {
                        if items.len() != columns.len() {
                            return Err(ToolError::invalid_params(format!(
                                "row has {} values but {} columns were named",
                                items.len(),
                                columns.len()
                            )));
                        }
                        for item in items {
                            params.push(item.clone());
                            placeholders.push(format!("${}", params.len()));
                        }
                    }
                    _ => {
                        return Err(ToolError::invalid_params(
                            "each row must be an object or an array",
                        ))
                    }
                }
                tuples.push(format!("({})", placeholders.join(", ")));
            }

            let sql = format!(
                "INSERT INTO {table_ident} ({}) VALUES {}",
                quoted.join(", "),
                tuples.join(", ")
            );
            let result = self
                .fetch(&pool, &key, &sql, &params, ResultMode::Command)
                .await?;
            inserted += result["rows_affected"].as_u64().unwrap_or(0);
            batches += 1;
        }

        Ok(json!({"inserted": inserted, "batches": batches}))
    }

    pub async fn update(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        table: &str,
        set: &Map<String, Value>,
        filters: &Value,
        returning: bool,
    ) -> ToolResult<Value> {
        if set.is_empty() {
            return Err(ToolError::invalid_params("update set must not be empty"));
        }
        let table_ident = quote_ident(table)?;
        let mut params: Vec<Value> = Vec::new();
        let mut assignments = Vec::with_capacity(set.len());
        for (column, value) in set {
            params.push(value.clone());
            assignments.push(format!("{} = ${}", quote_ident(column)?, params.len()));
        }
        let where_sql = build_where(filters, &mut params)?;

        let mut sql = format!("UPDATE {table_ident} SET {}{where_sql}", assignments.join(", "));
        if returning {
            sql.push_str(" RETURNING *");
        }
        let mode = if returning { ResultMode::Rows } else { ResultMode::Command };
        let (key, pool) = self.pool(source, ctx).await?;
        self.fetch(&pool, &key, &sql, &params, mode).await
    }

    pub async fn delete(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        table: &str,
        filters: &Value,
        returning: bool,
    ) -> ToolResult<Value> {
        let table_ident = quote_ident(table)?;
        let mut params: Vec<Value> = Vec::new();
        let where_sql = build_where(filters, &mut params)?;
        if where_sql.is_empty() {
            return Err(ToolError::invalid_params(
                "delete requires filters; use query for unconditional statements",
            ));
        }

        let mut sql = format!("DELETE FROM {table_ident}{where_sql}");
        if returning {
            sql.push_str(" RETURNING *");
        }
        let mode = if returning { ResultMode::Rows } else { ResultMode::Command };
        let (key, pool) = self.pool(source, ctx).await?;
        self.fetch(&pool, &key, &sql, &params, mode).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn select(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        table: &str,
        columns: Option<&[String]>,
        columns_sql: Option<&str>,
        filters: &Value,
        where_sql: Option<&str>,
        order_by: Option<&str>,
        order_by_sql: Option<&str>,
        limit: Option<u64>,
        offset: Option<u64>,
        mode: ResultMode,
    ) -> ToolResult<Value> {
        let sql = build_select(
            table,
            columns,
            columns_sql,
            filters,
            where_sql,
            order_by,
            order_by_sql,
            limit,
            offset,
        )?;
        let (key, pool) = self.pool(source, ctx).await?;
        self.fetch(&pool, &key, &sql.0, &sql.1, mode).await
    }

    pub async fn count(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        table: &str,
        filters: &Value,
    ) -> ToolResult<Value> {
        let table_ident = quote_ident(table)?;
        let mut params: Vec<Value> = Vec::new();
        let where_sql = build_where(filters, &mut params)?;
        let sql = format!("SELECT COUNT(*) FROM {table_ident}{where_sql}");
        let (key, pool) = self.pool(source, ctx).await?;
        let result = self.fetch(&pool, &key, &sql, &params, ResultMode::Value).await?;
        Ok(json!({"count": result["value"]}))
    }

    pub async fn exists(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        table: &str,
        filters: &Value,
    ) -> ToolResult<Value> {
        let table_ident = quote_ident(table)?;
        let mut params: Vec<Value> = Vec::new();
        let where_sql = build_where(filters, &mut params)?;
        let sql = format!("SELECT EXISTS (SELECT 1 FROM {table_ident}{where_sql})");
        let (key, pool) = self.pool(source, ctx).await?;
        let result = self.fetch(&pool, &key, &sql, &params, ResultMode::Value).await?;
        Ok(json!({"exists": result["value"]}))
    }

    /// Stream `LIMIT batch OFFSET n` pages into `sink` as CSV or JSONL.
    /// Bounded memory: at most one page of rows is resident.
    pub async fn export<W: AsyncWrite + Unpin + Send>(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        base_sql: &str,
        params: &[Value],
        opts: &ExportOptions,
        sink: &mut W,
    ) -> ToolResult<ExportReport> {
        let (key, pool) = self.pool(source, ctx).await?;

        let mut offset: u64 = 0;
        let mut rows_written: u64 = 0;
        let mut pages: u64 = 0;
        let mut bytes_written: u64 = 0;
        let mut header: Option<Vec<String>> = None;

        loop {
            let page_size = match opts.limit {
                Some(limit) if rows_written >= limit => break,
                Some(limit) => (limit - rows_written).min(opts.batch_size as u64),
                None => opts.batch_size as u64,
            };

            // Fetch one probe row beyond the page: a short read marks the
            // last page, so no trailing empty query is issued.
            let probe_size = page_size + 1;
            let paged_sql = format!(
                "SELECT * FROM ({base_sql}) AS export_page LIMIT {probe_size} OFFSET {offset}"
            );
            let mut query = sqlx::query(&paged_sql);
            for param in params {
                query = bind_json(query, param);
            }
            let mut rows = query
                .fetch_all(&pool)
                .await
                .map_err(|e| self.map_error(&key, e))?;
            pages += 1;

            if rows.is_empty() {
                break;
            }
            let has_more = rows.len() as u64 > page_size;
            rows.truncate(page_size as usize);

            for row in &rows {
                let record = row_to_json(row);
                let line = match opts.format {
                    ExportFormat::Jsonl => {
                        let mut line = serde_json::to_string(&record)
                            .map_err(|e| ToolError::internal(format!("jsonl encode: {e}")))?;
                        line.push('\n');
                        line
                    }
                    ExportFormat::Csv => {
                        let obj = record.as_object().expect("row_to_json yields objects");
                        let mut out = String::new();
                        if header.is_none() {
                            let cols: Vec<String> = obj.keys().cloned().collect();
                            out.push_str(&csv_line(&cols.iter().map(|c| json!(c)).collect::<Vec<_>>()));
                            header = Some(cols);
                        }
                        let cols = header.as_ref().expect("header written");
                        let values: Vec<Value> = cols
                            .iter()
                            .map(|c| obj.get(c).cloned().unwrap_or(Value::Null))
                            .collect();
                        out.push_str(&csv_line(&values));
                        out
                    }
                };
                sink.write_all(line.as_bytes())
                    .await
                    .map_err(|e| ToolError::internal(format!("export write failed: {e}")))?;
                bytes_written += line.len() as u64;
                rows_written += 1;
            }

            offset += rows.len() as u64;
            if !has_more {
                break;
            }
        }

        sink.flush()
            .await
            .map_err(|e| ToolError::internal(format!("export flush failed: {e}")))?;
        Ok(ExportReport {
            rows: rows_written,
            pages,
            bytes_written,
        })
    }

    pub async fn catalog_tables(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        schema: Option<&str>,
    ) -> ToolResult<Value> {
        let mut params: Vec<Value> = Vec::new();
        let mut sql = String::from(
            "SELECT table_schema, table_name, table_type FROM information_schema.tables \
             WHERE table_schema NOT IN ('pg_catalog', 'information_schema')",
        );
        if let Some(schema) = schema {
            params.push(json!(schema));
            sql.push_str(&format!(" AND table_schema = ${}", params.len()));
        }
        sql.push_str(" ORDER BY table_schema, table_name");
        let (key, pool) = self.pool(source, ctx).await?;
        self.fetch(&pool, &key, &sql, &params, ResultMode::Rows).await
    }

    pub async fn catalog_columns(
        &self,
        source: &PgSource,
        ctx: &ResolveCtx,
        table: &str,
    ) -> ToolResult<Value> {
        let (schema, bare_table) = match table.split_once('.') {
            Some((s, t)) => (s.to_string(), t.to_string()),
            None => ("public".to_string(), table.to_string()),
        };
        let sql = "SELECT column_name, data_type, is_nullable, column_default, ordinal_position \
                   FROM information_schema.columns \
                   WHERE table_schema = $1 AND table_name = $2 \
                   ORDER BY ordinal_position";
        let params = vec![json!(schema), json!(bare_table)];
        let (key, pool) = self.pool(source, ctx).await?;
        self.fetch(&pool, &key, sql, &params, ResultMode::Rows).await
    }

    pub async fn database_info(&self, source: &PgSource, ctx: &ResolveCtx) -> ToolResult<Value> {
        let sql = "SELECT current_database() AS database, current_user AS \"user\", \
                   version() AS version, \
                   pg_size_pretty(pg_database_size(current_database())) AS size";
        let (key, pool) = self.pool(source, ctx).await?;
        let result = self.fetch(&pool, &key, sql, &[], ResultMode::Row).await?;
        Ok(result["row"].clone())
    }
}

// ── SELECT builder (separate for testability) ────────────────────

#[allow(clippy::too_many_arguments)]
fn build_select(
    table: &str,
    columns: Option<&[String]>,
    columns_sql: Option<&str>,
    filters: &Value,
    where_sql: Option<&str>,
    order_by: Option<&str>,
    order_by_sql: Option<&str>,
    limit: Option<u64>,
    offset: Option<u64>,
) -> ToolResult<(String, Vec<Value>)> {
    let table_ident = quote_ident(table)?;

    let select_list = if let Some(raw) = columns_sql {
        raw.to_string()
    } else if let Some(cols) = columns {
        if cols.is_empty() {
            "*".to_string()
        } else {
            cols.iter()
                .map(|c| quote_ident(c))
                .collect::<ToolResult<Vec<_>>>()?
                .join(", ")
        }
    } else {
        "*".to_string()
    };

    let mut params: Vec<Value> = Vec::new();
    let mut sql = format!("SELECT {select_list} FROM {table_ident}");

    if let Some(raw) = where_sql {
        sql.push_str(" WHERE ");
        sql.push_str(raw);
    } else {
        sql.push_str(&build_where(filters, &mut params)?);
    }

    if let Some(raw) = order_by_sql {
        sql.push_str(" ORDER BY ");
        sql.push_str(raw);
    } else if let Some(column) = order_by {
        let (column, desc) = match column.strip_suffix(" DESC").or_else(|| column.strip_suffix(" desc")) {
            Some(c) => (c.trim(), true),
            None => (column, false),
        };
        sql.push_str(&format!(
            " ORDER BY {}{}",
            quote_ident(column)?,
            if desc { " DESC" } else { "" }
        ));
    }

    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }

    Ok((sql, params))
}

// ── CSV encoding (RFC 4180) ──────────────────────────────────────

pub fn csv_field(value: &Value) -> String {
    let raw = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') || raw.contains('\r') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw
    }
}

pub fn csv_line(values: &[Value]) -> String {
    let mut line = values.iter().map(csv_field).collect::<Vec<_>>().join(",");
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_simple() {
        assert_eq!(quote_ident("orders").unwrap(), "\"orders\"");
        assert_eq!(
            quote_ident("analytics.orders").unwrap(),
            "\"analytics\".\"orders\""
        );
    }

    #[test]
    fn test_quote_ident_doubles_quotes() {
        assert_eq!(quote_ident("we\"ird").unwrap(), "\"we\"\"ird\"");
        // Injection attempt ends up inert inside the quotes
        assert_eq!(
            quote_ident("t\"; DROP TABLE x; --").unwrap(),
            "\"t\"\"; DROP TABLE x; --\""
        );
    }

    #[test]
    fn test_quote_ident_rejects_empty_parts() {
        assert!(quote_ident("").is_err());
        assert!(quote_ident("a..b").is_err());
        assert!(quote_ident(".a").is_err());
    }

    #[test]
    fn test_build_where_map() {
        let mut params = Vec::new();
        let sql = build_where(
            &json!({"status": "new", "deleted_at": null}),
            &mut params,
        )
        .unwrap();
        assert_eq!(sql, " WHERE \"status\" = $1 AND \"deleted_at\" IS NULL");
        assert_eq!(params, vec![json!("new")]);
    }

    #[test]
    fn test_build_where_clauses() {
        let mut params = Vec::new();
        let sql = build_where(
            &json!([
                {"column": "amount", "op": ">=", "value": 10},
                {"column": "status", "op": "IN", "value": ["a", "b"]}
            ]),
            &mut params,
        )
        .unwrap();
        assert_eq!(
            sql,
            " WHERE \"amount\" >= $1 AND \"status\" IN ($2, $3)"
        );
        assert_eq!(params, vec![json!(10), json!("a"), json!("b")]);
    }

    #[test]
    fn test_build_where_empty_in_rejected() {
        let mut params = Vec::new();
        let err = build_where(
            &json!([{"column": "s", "op": "IN", "value": []}]),
            &mut params,
        )
        .unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidParams);
    }

    #[test]
    fn test_build_where_bad_op_rejected() {
        let mut params = Vec::new();
        assert!(build_where(
            &json!([{"column": "s", "op": "~", "value": 1}]),
            &mut params
        )
        .is_err());
    }

    #[test]
    fn test_insert_sql_shape() {
        // Mirrors the contract: INSERT INTO "analytics"."orders"
        // ("status", "amount") VALUES ($1, $2) RETURNING *
        let data: Map<String, Value> =
            serde_json::from_str(r#"{"status": "new", "amount": 10}"#).unwrap();
        let table_ident = quote_ident("analytics.orders").unwrap();
        let mut columns = Vec::new();
        let mut placeholders = Vec::new();
        let mut params = Vec::new();
        for (idx, (column, value)) in data.iter().enumerate() {
            columns.push(quote_ident(column).unwrap());
            placeholders.push(format!("${}", idx + 1));
            params.push(value.clone());
        }
        let sql = format!(
            "INSERT INTO {table_ident} ({}) VALUES ({}) RETURNING *",
            columns.join(", "),
            placeholders.join(", ")
        );
        assert_eq!(
            sql,
            "INSERT INTO \"analytics\".\"orders\" (\"status\", \"amount\") VALUES ($1, $2) RETURNING *"
        );
        assert_eq!(params, vec![json!("new"), json!(10)]);
    }

    #[test]
    fn test_build_select() {
        let (sql, params) = build_select(
            "public.users",
            Some(&["id".to_string(), "email".to_string()]),
            None,
            &json!({"active": true}),
            None,
            Some("id DESC"),
            None,
            Some(50),
            Some(10),
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT \"id\", \"email\" FROM \"public\".\"users\" WHERE \"active\" = $1 ORDER BY \"id\" DESC LIMIT 50 OFFSET 10"
        );
        assert_eq!(params, vec![json!(true)]);
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field(&json!("plain")), "plain");
        assert_eq!(csv_field(&json!("has,comma")), "\"has,comma\"");
        assert_eq!(csv_field(&json!("has\"quote")), "\"has\"\"quote\"");
        assert_eq!(csv_field(&json!("line\nbreak")), "\"line\nbreak\"");
        assert_eq!(csv_field(&json!(null)), "");
        assert_eq!(csv_field(&json!(3.5)), "3.5");
    }

    #[test]
    fn test_csv_line() {
        assert_eq!(
            csv_line(&[json!("a"), json!(1), json!("b,c")]),
            "a,1,\"b,c\"\n"
        );
    }

    #[test]
    fn test_canonical_json_stable() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": 3, "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_bulk_chunk_ceiling() {
        // cols × batch must stay ≤ 65535
        let cols = 20usize;
        let max_rows = MAX_BIND_PARAMS / cols;
        assert!(max_rows * cols <= MAX_BIND_PARAMS);
        assert!((max_rows + 1) * cols > MAX_BIND_PARAMS);
    }
}
