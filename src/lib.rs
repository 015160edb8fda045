/// mcp-guard: a security-enforcing interception proxy for the Model Context
/// Protocol. Sits between an MCP client and one or more tool servers across
/// three transports (STDIO, SSE, plain HTTP), rewriting tool schemas,
/// gating `tools/call` traffic against a denylist, and fanning every
/// exchange out to a pool of pattern and LLM-backed detectors.
pub mod bus;
pub mod config;
pub mod detectors;
pub mod error;
pub mod event;
pub mod gatekeeper;
pub mod journal;
pub mod jrpc;
pub mod llm;
pub mod notifier;
pub mod rewriter;
pub mod server;
pub mod state;
pub mod tools;
pub mod transport;
