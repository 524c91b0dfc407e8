use rmcp::{
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler,
};
use sentryfrogg_types::ToolError;
use serde_json::Value;

use crate::app::App;
use crate::dispatch::Dispatcher;

// ── MCP server ───────────────────────────────────────────────────
//
// Thin rmcp surface: every tool takes a free-form argument object and
// routes through the dispatcher, which owns normalization, the
// envelope, shaping and audit.

/// Free-form tool arguments; the dispatcher validates the shape.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct RawArgs {
    #[serde(flatten)]
    pub args: serde_json::Map<String, Value>,
}

#[derive(Clone)]
pub struct SentryfroggServer {
    pub dispatcher: Dispatcher,
    tool_router: ToolRouter<Self>,
}

impl SentryfroggServer {
    async fn call(&self, tool: &str, params: RawArgs) -> Result<CallToolResult, McpError> {
        match self
            .dispatcher
            .execute(tool, Value::Object(params.args))
            .await
        {
            Ok(result) => Ok(CallToolResult::success(vec![Content::text(
                serde_json::to_string(&result).unwrap_or_else(|_| "null".to_string()),
            )])),
            Err(error) => Ok(error_result(&error)),
        }
    }
}

fn error_result(error: &ToolError) -> CallToolResult {
    let payload = serde_json::to_string(error).unwrap_or_else(|_| format!("{error}"));
    CallToolResult::error(vec![Content::text(payload)])
}

#[tool_router]
impl SentryfroggServer {
    pub fn new(app: App) -> Self {
        Self {
            dispatcher: Dispatcher::new(app),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Manage credential profiles (postgresql/ssh/api/vault): upsert, get, list, delete, test, export, plus alias_* and preset_* registry actions. Secrets are encrypted at rest and never listed in plaintext.")]
    async fn profile(
        &self,
        Parameters(params): Parameters<RawArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call("profile", params).await
    }

    #[tool(description = "PostgreSQL operations: query, batch, transaction, insert, insert_bulk, update, delete, select, count, exists, export, catalog_tables, catalog_columns, database_info, test. Identifiers are strictly quoted; values travel as parameters.")]
    async fn postgres(
        &self,
        Parameters(params): Parameters<RawArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call("postgres", params).await
    }

    #[tool(description = "SSH/SFTP operations on pooled sessions: exec, batch, system_info, check_host, authorized_keys_add, sftp_list, sftp_upload, sftp_download. Host keys follow the profile's accept/pin/tofu policy.")]
    async fn ssh(
        &self,
        Parameters(params): Parameters<RawArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call("ssh", params).await
    }

    #[tool(description = "HTTP client with profile auth, retry/backoff, pagination and caching: request, paginate, download, check.")]
    async fn api(
        &self,
        Parameters(params): Parameters<RawArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call("api", params).await
    }

    #[tool(description = "Vault KV v2: health, token_lookup, kv2_get (mount/path#key). Uses token or AppRole auto-login from the vault profile.")]
    async fn vault(
        &self,
        Parameters(params): Parameters<RawArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call("vault", params).await
    }

    #[tool(description = "Session and persistent key/value state: get, set, delete, list. Persistent entries survive restarts; session entries do not.")]
    async fn state(
        &self,
        Parameters(params): Parameters<RawArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call("state", params).await
    }

    #[tool(description = "Projects bind profile roles to named targets: upsert, get, list, delete, use, current. The active project fills missing profile names on other tools.")]
    async fn project(
        &self,
        Parameters(params): Parameters<RawArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call("project", params).await
    }

    #[tool(description = "Declarative multi-step runbooks with templates, predicates and per-step retry: upsert, get, list, delete, run.")]
    async fn runbook(
        &self,
        Parameters(params): Parameters<RawArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call("runbook", params).await
    }

    #[tool(description = "Streaming ETL between HTTP, SFTP and Postgres with bounded memory: http_to_sftp, sftp_to_http, http_to_postgres, sftp_to_postgres, postgres_to_sftp, postgres_to_http.")]
    async fn pipeline(
        &self,
        Parameters(params): Parameters<RawArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call("pipeline", params).await
    }

    #[tool(description = "Read the append-only audit log: tail with tool/since/limit filters. Entries are redacted before they reach disk.")]
    async fn audit(
        &self,
        Parameters(params): Parameters<RawArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call("audit", params).await
    }
}

#[tool_handler]
impl ServerHandler for SentryfroggServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Sentryfrogg is a local control plane over PostgreSQL, SSH/SFTP and HTTP, \
                 with encrypted credential profiles, streaming pipelines and runbooks.\n\n\
                 Every tool accepts the shared envelope arguments: trace_id/span_id/\
                 parent_span_id (audit correlation), output (path/pick/omit/map/missing/\
                 default shaping), store_as + store_scope (persist the shaped result into \
                 state), and preset/preset_name (argument defaults).\n\n\
                 Start by storing profiles (profile upsert), optionally bind them to a \
                 project (project upsert + project use), then call postgres/ssh/api \
                 directly or compose them with pipeline and runbook. Secret values can be \
                 written as ref:env:NAME or ref:vault:kv2:mount/path#key and resolve at \
                 use time."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
