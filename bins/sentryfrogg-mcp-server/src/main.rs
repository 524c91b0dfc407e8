use anyhow::Result;
use rmcp::{transport::stdio, ServiceExt};
use sentryfrogg_mcp::{App, SentryfroggServer};
use tracing_subscriber::{self, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --version / --help
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("sentryfrogg-mcp-server {VERSION}");
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("sentryfrogg-mcp-server {VERSION}");
        println!("Infrastructure control plane MCP server (PostgreSQL / SSH / HTTP)\n");
        println!("USAGE: sentryfrogg-mcp-server [OPTIONS]\n");
        println!("OPTIONS:");
        println!("  -h, --help       Print help");
        println!("  -V, --version    Print version");
        println!("\nCommunicates via JSON-RPC over stdio (MCP transport).");
        println!("State directory: MCP_PROFILES_DIR, else $XDG_STATE_HOME/sentryfrogg,");
        println!("else ~/.local/state/sentryfrogg.");
        println!("Configure in your MCP client as:");
        println!("  {{ \"command\": \"sentryfrogg-mcp-server\", \"args\": [] }}");
        return Ok(());
    }

    // All logging goes to stderr (stdout is the MCP JSON-RPC transport)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("sentryfrogg MCP server v{VERSION} starting");

    let app = App::open()?;
    tracing::info!(base_dir = %app.store.paths().base().display(), "stores opened");

    let server = SentryfroggServer::new(app);

    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!("failed to start MCP service: {:?}", e);
    })?;

    tracing::info!("sentryfrogg MCP server running on stdio");

    service.waiting().await?;

    tracing::info!("sentryfrogg MCP server shutting down");
    Ok(())
}
