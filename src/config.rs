/// Environment-Variable Configuration
///
/// Centralizes access to the environment variables listed in the external
/// interfaces table so no other module calls `std::env::var` directly.
/// Generalized from the teacher template's `core::utils::get_env_var`.
use std::collections::HashMap;

/// Get an environment variable with a default fallback.
pub fn get_env_var(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// `MCP_PROXY_HOST` / `MCP_PROXY_PORT` — server bind address, default
/// `127.0.0.1:8282`.
pub fn proxy_bind_addr() -> String {
    let host = get_env_var("MCP_PROXY_HOST", "127.0.0.1");
    let port = get_env_var("MCP_PROXY_PORT", "8282");
    format!("{host}:{port}")
}

/// `MCP_DEBUG` — verbose logging toggle.
pub fn debug_enabled() -> bool {
    matches!(
        get_env_var("MCP_DEBUG", "").to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// `MCP_OBSERVER_APP_NAME` / `MCP_OBSERVER_SERVER_NAME` — identity the
/// STDIO proxy reports itself under.
pub fn observer_identity() -> (String, String) {
    (
        get_env_var("MCP_OBSERVER_APP_NAME", "local"),
        get_env_var("MCP_OBSERVER_SERVER_NAME", "default"),
    )
}

/// `MCP_TARGET_URL` — when set, the `proxy` binary bridges STDIO to this
/// remote target instead of spawning a child process.
pub fn target_url() -> Option<String> {
    std::env::var("MCP_TARGET_URL").ok()
}

/// `MCP_TARGET_HEADERS` — JSON object of additional headers forwarded to
/// the remote target.
pub fn target_headers() -> HashMap<String, String> {
    std::env::var("MCP_TARGET_HEADERS")
        .ok()
        .and_then(|raw| serde_json::from_str::<HashMap<String, String>>(&raw).ok())
        .unwrap_or_default()
}

/// `API_ACCESS_TOKEN` — bearer token forwarded to the target, if set.
pub fn api_access_token() -> Option<String> {
    std::env::var("API_ACCESS_TOKEN").ok()
}

/// `MISTRAL_API_KEY` — credential for the semantic-gap detector's LLM calls.
pub fn mistral_api_key() -> Option<String> {
    std::env::var("MISTRAL_API_KEY").ok()
}

/// Max age, in seconds, a `PendingCall` may live before the reaper drops it.
pub fn pending_call_max_age_secs() -> u64 {
    get_env_var("MCP_PENDING_CALL_MAX_AGE_SECS", "600")
        .parse()
        .unwrap_or(600)
}

/// Path to the sqlite journal file.
pub fn journal_path() -> String {
    get_env_var("MCP_JOURNAL_PATH", "mcp-proxy-journal.sqlite3")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bind_addr() {
        if std::env::var("MCP_PROXY_HOST").is_err() && std::env::var("MCP_PROXY_PORT").is_err() {
            assert_eq!(proxy_bind_addr(), "127.0.0.1:8282");
        }
    }

    #[test]
    fn target_headers_defaults_empty() {
        if std::env::var("MCP_TARGET_HEADERS").is_err() {
            assert!(target_headers().is_empty());
        }
    }
}
