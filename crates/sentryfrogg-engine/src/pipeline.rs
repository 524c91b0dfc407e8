use futures::TryStreamExt;
use sentryfrogg_conn::http::RequestArgs;
use sentryfrogg_conn::postgres::{ExportFormat, ExportOptions, PgSource};
use sentryfrogg_conn::sftp::TransferOptions;
use sentryfrogg_conn::{ApiManager, PgManager, SshManager};
use sentryfrogg_conn::resolver::ResolveCtx;
use sentryfrogg_store::AuditLog;
use sentryfrogg_types::{AuditEntry, AuditStatus, ToolError, ToolResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::{ReaderStream, StreamReader};

// ── Streaming pipeline engine ────────────────────────────────────
//
// Six duplex flows between HTTP, SFTP and Postgres. Every flow is a
// strict stream: reads only advance when the destination has accepted
// the previous write, so peak memory stays O(batch + capture limit).

const READ_CHUNK: usize = 8 * 1024;
const DUPLEX_BUFFER: usize = 64 * 1024;
const DEFAULT_INGEST_BATCH: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct SftpSpec {
    pub profile_name: String,
    pub path: String,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub create_parents: bool,
}

impl SftpSpec {
    fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            overwrite: self.overwrite,
            create_parents: self.create_parents,
            preserve_mtime: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestFormat {
    Jsonl,
    Csv,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSpec {
    pub profile_name: Option<String>,
    pub connection: Option<Value>,
    pub table: String,
    pub columns: Option<Vec<String>>,
    pub format: IngestFormat,
    #[serde(default = "default_ingest_batch")]
    pub batch_size: usize,
    pub max_rows: Option<u64>,
}

fn default_ingest_batch() -> usize {
    DEFAULT_INGEST_BATCH
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportSpec {
    pub profile_name: Option<String>,
    pub connection: Option<Value>,
    pub table: Option<String>,
    pub sql: Option<String>,
    #[serde(default)]
    pub params: Vec<Value>,
    pub format: ExportFormat,
    pub batch_size: Option<usize>,
    pub limit: Option<u64>,
}

impl ExportSpec {
    fn source(&self) -> ToolResult<PgSource> {
        PgSource::from_args(self.profile_name.clone(), self.connection.clone())
    }

    fn base_sql(&self) -> ToolResult<String> {
        if let Some(sql) = &self.sql {
            return Ok(sql.clone());
        }
        let table = self.table.as_deref().ok_or_else(|| {
            ToolError::invalid_params("export needs either sql or table")
        })?;
        Ok(format!(
            "SELECT * FROM {}",
            sentryfrogg_conn::postgres::quote_ident(table)?
        ))
    }

    fn options(&self) -> ExportOptions {
        let mut opts = ExportOptions {
            format: self.format,
            ..Default::default()
        };
        if let Some(batch) = self.batch_size {
            opts.batch_size = batch.max(1);
        }
        opts.limit = self.limit;
        opts
    }
}

#[derive(Debug, Clone)]
pub struct PipelineCtx {
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub resolve: ResolveCtx,
}

#[derive(Clone)]
pub struct PipelineEngine {
    pg: PgManager,
    ssh: SshManager,
    api: ApiManager,
    audit: AuditLog,
}

impl PipelineEngine {
    pub fn new(pg: PgManager, ssh: SshManager, api: ApiManager, audit: AuditLog) -> Self {
        Self { pg, ssh, api, audit }
    }

    /// Emit one audit span under the pipeline's trace. Audit failures are
    /// deliberately swallowed.
    async fn span(&self, ctx: &PipelineCtx, action: &str, status: AuditStatus, details: Value) {
        let _ = self
            .audit
            .append(AuditEntry {
                timestamp: chrono::Utc::now(),
                tool: "pipeline".to_string(),
                action: action.to_string(),
                status,
                trace_id: ctx.trace_id.clone(),
                span_id: uuid::Uuid::new_v4().to_string(),
                parent_span_id: ctx.parent_span_id.clone(),
                duration_ms: None,
                details: Some(details),
                error: None,
            })
            .await;
    }

    // ── HTTP → SFTP ──────────────────────────────────────────────

    pub async fn http_to_sftp(
        &self,
        http: &RequestArgs,
        sftp: &SftpSpec,
        ctx: &PipelineCtx,
    ) -> ToolResult<Value> {
        let response = self.api.request_streaming(http, &ctx.resolve).await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            self.span(ctx, "http_fetch", AuditStatus::Error, json!({"status": status})).await;
            return Err(ToolError::new(
                ToolError::category_for_status(status),
                "pipeline_source",
                format!("source request returned status {status}"),
            ));
        }
        self.span(ctx, "http_fetch", AuditStatus::Ok, json!({"status": status})).await;

        let mut remote = self
            .ssh
            .sftp_open_write(&sftp.profile_name, &ctx.resolve, &sftp.path, &sftp.transfer_options())
            .await?;

        let mut response = response;
        let mut bytes: u64 = 0;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = remote.write_all(&chunk).await {
                        self.span(
                            ctx,
                            "sftp_upload",
                            AuditStatus::Error,
                            json!({"path": sftp.path, "bytes_transferred": bytes}),
                        )
                        .await;
                        return Err(ToolError::internal(format!("sftp write failed: {e}"))
                            .with_code("pipeline_dest")
                            .with_details(json!({"bytes_transferred": bytes})));
                    }
                    bytes += chunk.len() as u64;
                }
                Ok(None) => break,
                Err(e) => {
                    self.span(
                        ctx,
                        "http_fetch",
                        AuditStatus::Error,
                        json!({"bytes_transferred": bytes}),
                    )
                    .await;
                    return Err(ToolError::retryable(format!("source stream failed: {e}"))
                        .with_code("pipeline_source")
                        .with_details(json!({"bytes_transferred": bytes})));
                }
            }
        }
        remote
            .shutdown()
            .await
            .map_err(|e| ToolError::internal(format!("sftp close failed: {e}")).with_code("pipeline_dest"))?;

        self.span(
            ctx,
            "sftp_upload",
            AuditStatus::Ok,
            json!({"path": sftp.path, "bytes_transferred": bytes}),
        )
        .await;
        Ok(json!({"flow": "http_to_sftp", "status": status, "bytes_transferred": bytes}))
    }

    // ── SFTP → HTTP ──────────────────────────────────────────────

    pub async fn sftp_to_http(
        &self,
        sftp: &SftpSpec,
        http: &RequestArgs,
        ctx: &PipelineCtx,
    ) -> ToolResult<Value> {
        let remote = self
            .ssh
            .sftp_open_read(&sftp.profile_name, &ctx.resolve, &sftp.path)
            .await?;
        self.span(ctx, "sftp_download", AuditStatus::Ok, json!({"path": sftp.path})).await;

        let counter = Arc::new(AtomicU64::new(0));
        let counted = counter.clone();
        let stream = ReaderStream::new(remote).inspect_ok(move |chunk| {
            counted.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        });
        let body = reqwest::Body::wrap_stream(stream);

        let result = self.api.send_body_stream(http, body, &ctx.resolve).await;
        let bytes = counter.load(Ordering::Relaxed);
        match result {
            Ok(response) => {
                self.span(
                    ctx,
                    "http_upload",
                    AuditStatus::Ok,
                    json!({"status": response["status"], "bytes_transferred": bytes}),
                )
                .await;
                Ok(json!({
                    "flow": "sftp_to_http",
                    "bytes_transferred": bytes,
                    "response": response,
                }))
            }
            Err(err) => {
                self.span(
                    ctx,
                    "http_upload",
                    AuditStatus::Error,
                    json!({"bytes_transferred": bytes}),
                )
                .await;
                Err(err.with_details(json!({"bytes_transferred": bytes})))
            }
        }
    }

    // ── HTTP → Postgres ──────────────────────────────────────────

    pub async fn http_to_postgres(
        &self,
        http: &RequestArgs,
        ingest: &IngestSpec,
        ctx: &PipelineCtx,
    ) -> ToolResult<Value> {
        let response = self.api.request_streaming(http, &ctx.resolve).await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            self.span(ctx, "http_fetch", AuditStatus::Error, json!({"status": status})).await;
            return Err(ToolError::new(
                ToolError::category_for_status(status),
                "pipeline_source",
                format!("source request returned status {status}"),
            ));
        }
        self.span(ctx, "http_fetch", AuditStatus::Ok, json!({"status": status})).await;

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let reader = StreamReader::new(stream);
        let result = self.ingest_reader(reader, ingest, ctx).await?;
        Ok(json!({"flow": "http_to_postgres", "status": status, "ingest": result}))
    }

    // ── SFTP → Postgres ──────────────────────────────────────────

    pub async fn sftp_to_postgres(
        &self,
        sftp: &SftpSpec,
        ingest: &IngestSpec,
        ctx: &PipelineCtx,
    ) -> ToolResult<Value> {
        let remote = self
            .ssh
            .sftp_open_read(&sftp.profile_name, &ctx.resolve, &sftp.path)
            .await?;
        self.span(ctx, "sftp_download", AuditStatus::Ok, json!({"path": sftp.path})).await;

        let result = self.ingest_reader(remote, ingest, ctx).await?;
        Ok(json!({"flow": "sftp_to_postgres", "ingest": result}))
    }

    // ── Postgres → SFTP ──────────────────────────────────────────

    pub async fn postgres_to_sftp(
        &self,
        export: &ExportSpec,
        sftp: &SftpSpec,
        ctx: &PipelineCtx,
    ) -> ToolResult<Value> {
        let source = export.source()?;
        let base_sql = export.base_sql()?;
        let opts = export.options();

        let mut remote = self
            .ssh
            .sftp_open_write(&sftp.profile_name, &ctx.resolve, &sftp.path, &sftp.transfer_options())
            .await?;

        let report = match self
            .pg
            .export(&source, &ctx.resolve, &base_sql, &export.params, &opts, &mut remote)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                self.span(ctx, "postgres_export", AuditStatus::Error, json!({"path": sftp.path})).await;
                return Err(err);
            }
        };
        remote
            .shutdown()
            .await
            .map_err(|e| ToolError::internal(format!("sftp close failed: {e}")).with_code("pipeline_dest"))?;

        self.span(
            ctx,
            "postgres_export",
            AuditStatus::Ok,
            json!({"rows": report.rows, "pages": report.pages}),
        )
        .await;
        self.span(
            ctx,
            "sftp_upload",
            AuditStatus::Ok,
            json!({"path": sftp.path, "bytes_transferred": report.bytes_written}),
        )
        .await;
        Ok(json!({
            "flow": "postgres_to_sftp",
            "rows": report.rows,
            "pages": report.pages,
            "bytes_transferred": report.bytes_written,
        }))
    }

    // ── Postgres → HTTP ──────────────────────────────────────────

    pub async fn postgres_to_http(
        &self,
        export: &ExportSpec,
        http: &RequestArgs,
        ctx: &PipelineCtx,
    ) -> ToolResult<Value> {
        let source = export.source()?;
        let base_sql = export.base_sql()?;
        let opts = export.options();

        let (mut writer, reader) = tokio::io::duplex(DUPLEX_BUFFER);
        let pg = self.pg.clone();
        let resolve = ctx.resolve.clone();
        let params = export.params.clone();
        let export_task = tokio::spawn(async move {
            let report = pg
                .export(&source, &resolve, &base_sql, &params, &opts, &mut writer)
                .await;
            writer.shutdown().await.ok();
            report
        });

        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        let response = self.api.send_body_stream(http, body, &ctx.resolve).await;

        let report = match export_task.await {
            Ok(report) => report,
            Err(join) => Err(ToolError::internal(format!("export task failed: {join}"))),
        };

        match (response, report) {
            (Ok(response), Ok(report)) => {
                self.span(
                    ctx,
                    "postgres_export",
                    AuditStatus::Ok,
                    json!({"rows": report.rows, "pages": report.pages}),
                )
                .await;
                self.span(
                    ctx,
                    "http_upload",
                    AuditStatus::Ok,
                    json!({"status": response["status"], "bytes_transferred": report.bytes_written}),
                )
                .await;
                Ok(json!({
                    "flow": "postgres_to_http",
                    "rows": report.rows,
                    "pages": report.pages,
                    "bytes_transferred": report.bytes_written,
                    "response": response,
                }))
            }
            (Err(err), report) => {
                let rows = report.map(|r| r.rows).unwrap_or(0);
                self.span(
                    ctx,
                    "http_upload",
                    AuditStatus::Error,
                    json!({"rows_exported": rows}),
                )
                .await;
                Err(err.with_details(json!({"rows_exported": rows})))
            }
            (Ok(_), Err(err)) => {
                self.span(ctx, "postgres_export", AuditStatus::Error, Value::Null).await;
                Err(err)
            }
        }
    }

    // ── Ingestion core ───────────────────────────────────────────

    /// Parse JSONL or CSV from `reader` and flush `insert_bulk` batches of
    /// exactly `batch_size` rows. At most one batch of rows is buffered.
    async fn ingest_reader<R: AsyncRead + Unpin>(
        &self,
        mut reader: R,
        spec: &IngestSpec,
        ctx: &PipelineCtx,
    ) -> ToolResult<Value> {
        let source = PgSource::from_args(spec.profile_name.clone(), spec.connection.clone())?;
        let batch_size = spec.batch_size.max(1);

        let mut rows: Vec<Value> = Vec::with_capacity(batch_size);
        let mut inserted: u64 = 0;
        let mut batches: u64 = 0;
        let mut total_rows: u64 = 0;
        let mut columns: Option<Vec<String>> = spec.columns.clone();
        let mut done = false;

        let mut line_buf: Vec<u8> = Vec::new();
        let mut csv = CsvParser::new();
        let mut chunk = vec![0u8; READ_CHUNK];

        'read: loop {
            let n = reader
                .read(&mut chunk)
                .await
                .map_err(|e| ToolError::retryable(format!("source read failed: {e}"))
                    .with_code("pipeline_source")
                    .with_details(json!({"rows_written": inserted})))?;
            let eof = n == 0;

            let mut parsed: Vec<Value> = Vec::new();
            match spec.format {
                IngestFormat::Jsonl => {
                    parse_jsonl(&mut line_buf, &chunk[..n], eof, &mut parsed)
                        .map_err(|e| e.with_details(json!({"rows_written": inserted})))?;
                }
                IngestFormat::Csv => {
                    let mut records: Vec<Vec<String>> = Vec::new();
                    csv.feed(&chunk[..n], &mut records);
                    if eof {
                        csv.finish(&mut records);
                    }
                    for record in records {
                        if columns.is_none() {
                            // First row is the header unless columns were given.
                            columns = Some(record);
                            continue;
                        }
                        parsed.push(Value::Array(
                            record.iter().map(|f| coerce_csv_field(f)).collect(),
                        ));
                    }
                }
            }

            for row in parsed {
                rows.push(row);
                total_rows += 1;
                if rows.len() == batch_size {
                    let flushed = self
                        .flush_batch(&source, ctx, spec, &columns, &mut rows)
                        .await
                        .map_err(|e| e.with_details(json!({"rows_written": inserted})))?;
                    inserted += flushed;
                    batches += 1;
                }
                if let Some(max) = spec.max_rows {
                    if total_rows >= max {
                        done = true;
                        break;
                    }
                }
            }

            if done || eof {
                break 'read;
            }
        }

        if !rows.is_empty() {
            let flushed = self
                .flush_batch(&source, ctx, spec, &columns, &mut rows)
                .await
                .map_err(|e| e.with_details(json!({"rows_written": inserted})))?;
            inserted += flushed;
            batches += 1;
        }

        self.span(
            ctx,
            "postgres_insert",
            AuditStatus::Ok,
            json!({"table": spec.table, "inserted": inserted, "batches": batches}),
        )
        .await;
        Ok(json!({
            "inserted": inserted,
            "batches": batches,
            "max_rows_reached": done,
        }))
    }

    async fn flush_batch(
        &self,
        source: &PgSource,
        ctx: &PipelineCtx,
        spec: &IngestSpec,
        columns: &Option<Vec<String>>,
        rows: &mut Vec<Value>,
    ) -> ToolResult<u64> {
        let batch: Vec<Value> = rows.drain(..).collect();
        let result = self
            .pg
            .insert_bulk(
                source,
                &ctx.resolve,
                &spec.table,
                columns.clone(),
                &batch,
                Some(batch.len()),
            )
            .await?;
        Ok(result["inserted"].as_u64().unwrap_or(0))
    }
}

// ── JSONL incremental parsing ────────────────────────────────────

fn parse_jsonl(
    pending: &mut Vec<u8>,
    chunk: &[u8],
    eof: bool,
    out: &mut Vec<Value>,
) -> ToolResult<()> {
    pending.extend_from_slice(chunk);

    let mut start = 0;
    while let Some(pos) = pending[start..].iter().position(|&b| b == b'\n') {
        let line = &pending[start..start + pos];
        start += pos + 1;
        push_jsonl_line(line, out)?;
    }
    pending.drain(..start);

    if eof && !pending.is_empty() {
        let line = std::mem::take(pending);
        push_jsonl_line(&line, out)?;
    }
    Ok(())
}

fn push_jsonl_line(line: &[u8], out: &mut Vec<Value>) -> ToolResult<()> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    let value: Value = serde_json::from_str(trimmed).map_err(|e| {
        ToolError::invalid_params(format!("jsonl line is not valid JSON: {e}"))
            .with_code("pipeline_parse")
    })?;
    if !value.is_object() {
        return Err(ToolError::invalid_params("jsonl line must be an object")
            .with_code("pipeline_parse"));
    }
    out.push(value);
    Ok(())
}

// ── CSV incremental parsing (RFC 4180, quote-aware) ──────────────

struct CsvParser {
    field: Vec<u8>,
    record: Vec<String>,
    in_quotes: bool,
    quote_seen: bool,
    any_bytes: bool,
}

impl CsvParser {
    fn new() -> Self {
        Self {
            field: Vec::new(),
            record: Vec::new(),
            in_quotes: false,
            quote_seen: false,
            any_bytes: false,
        }
    }

    fn feed(&mut self, bytes: &[u8], out: &mut Vec<Vec<String>>) {
        for &b in bytes {
            if self.in_quotes {
                if self.quote_seen {
                    self.quote_seen = false;
                    if b == b'"' {
                        self.field.push(b'"');
                        continue;
                    }
                    self.in_quotes = false;
                    self.unquoted(b, out);
                } else if b == b'"' {
                    self.quote_seen = true;
                } else {
                    self.field.push(b);
                }
            } else {
                self.unquoted(b, out);
            }
        }
    }

    fn unquoted(&mut self, b: u8, out: &mut Vec<Vec<String>>) {
        match b {
            b'"' if self.field.is_empty() => {
                self.in_quotes = true;
                self.any_bytes = true;
            }
            b',' => {
                self.end_field();
                self.any_bytes = true;
            }
            b'\n' => {
                self.end_record(out);
            }
            b'\r' => {}
            other => {
                self.field.push(other);
                self.any_bytes = true;
            }
        }
    }

    fn end_field(&mut self) {
        let field = String::from_utf8_lossy(&self.field).into_owned();
        self.field.clear();
        self.record.push(field);
    }

    fn end_record(&mut self, out: &mut Vec<Vec<String>>) {
        if !self.any_bytes && self.record.is_empty() {
            // blank line
            self.field.clear();
            return;
        }
        self.end_field();
        out.push(std::mem::take(&mut self.record));
        self.any_bytes = false;
    }

    fn finish(&mut self, out: &mut Vec<Vec<String>>) {
        if self.quote_seen {
            self.in_quotes = false;
            self.quote_seen = false;
        }
        if self.any_bytes || !self.record.is_empty() || !self.field.is_empty() {
            self.end_field();
            out.push(std::mem::take(&mut self.record));
            self.any_bytes = false;
        }
    }
}

/// Ingested CSV fields arrive as text; coerce the common scalar shapes so
/// parameters bind with useful types.
fn coerce_csv_field(field: &str) -> Value {
    if field.is_empty() {
        return Value::Null;
    }
    if let Ok(n) = field.parse::<i64>() {
        return json!(n);
    }
    if let Ok(f) = field.parse::<f64>() {
        return json!(f);
    }
    match field {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(field.to_string()),
    }
}
