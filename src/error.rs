/// Error Types
///
/// Centralizes the error enums used at each module boundary. Transport
/// adapters convert these into wire-level outcomes (a JSON-RPC error object,
/// or simply closing the connection) at the point where they are caught;
/// internal errors never unwind past an adapter.
use thiserror::Error;

/// Errors that can occur while driving a transport (STDIO, SSE, HTTP).
///
/// Transport I/O errors are always fatal to the affected connection, never
/// to the process.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("target closed the connection")]
    TargetClosed,

    #[error("client closed the connection")]
    ClientClosed,

    #[error("framing error: {0}")]
    Framing(String),

    #[error("malformed JSON-RPC message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors surfaced by the event journal. Journal failures are advisory: a
/// write failure is logged and the event continues through the forwarding
/// path unaffected.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("journal worker is no longer running")]
    WorkerGone,

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors from the LLM chat-completion client. Retried up to twice by the
/// caller; on final failure the semantic-gap detector contributes no
/// finding for that event.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transient API error: {0}")]
    Transient(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("no API key configured")]
    MissingApiKey,

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}
