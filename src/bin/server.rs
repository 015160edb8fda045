/// mcp-guard server entry point.
///
/// Hosts the verification endpoints consumed by the `proxy` binary's STDIO
/// mode plus the SSE/HTTP remote proxy surface. Binds `MCP_PROXY_HOST:
/// MCP_PROXY_PORT` (default `127.0.0.1:8282`).
use mcp_guard::config;

fn init_logging() {
    let env_filter = if config::debug_enabled() {
        "mcp_guard=debug,actix_web=info"
    } else {
        "mcp_guard=info,actix_web=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(env_filter))
        .init();
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_logging();

    let host = config::get_env_var("MCP_PROXY_HOST", "127.0.0.1");
    let port: u16 = config::get_env_var("MCP_PROXY_PORT", "8282")
        .parse()
        .unwrap_or(8282);
    let journal_path = config::journal_path();

    mcp_guard::server::run_server(host, port, journal_path).await
}
