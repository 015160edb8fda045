/// `proxy` CLI entry point.
///
/// `proxy <command> [args…]` spawns `command` as a child MCP server and sits
/// between it and this process's own stdin/stdout. If `MCP_TARGET_URL` is
/// set, `command`/`args` are ignored and the binary bridges stdio straight
/// to that remote target instead. All verification and journaling happen in
/// the separate `mcp-proxy-server` binary, reached over HTTP.
use mcp_guard::config;
use mcp_guard::transport::stdio::StdioProxy;
use std::env;

fn init_logging() {
    // stdout is reserved for JSON-RPC frames; logs go to stderr only.
    let env_filter = if config::debug_enabled() { "mcp_guard=debug" } else { "mcp_guard=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(env_filter))
        .json()
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();

    let verify_base_url = format!("http://{}", config::proxy_bind_addr());
    let proxy = StdioProxy::new(verify_base_url);

    let exit_code = if let Some(target_url) = config::target_url() {
        match proxy.run_bridge(target_url, config::target_headers()).await {
            Ok(code) => code,
            Err(err) => {
                eprintln!("mcp-guard bridge error: {err}");
                1
            }
        }
    } else {
        let mut args = env::args().skip(1);
        let Some(command) = args.next() else {
            eprintln!("usage: proxy <command> [args...]");
            std::process::exit(2);
        };
        let child_args: Vec<String> = args.collect();

        match proxy.run(command, child_args).await {
            Ok(code) => code,
            Err(err) => {
                eprintln!("mcp-guard proxy error: {err}");
                1
            }
        }
    };

    std::process::exit(exit_code);
}
