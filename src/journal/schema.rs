/// Sqlite schema for the event journal (§6).
use crate::error::JournalError;
use rusqlite::Connection;

pub fn create_tables(conn: &Connection) -> Result<(), JournalError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS raw_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts INTEGER NOT NULL,
            producer TEXT NOT NULL,
            pid INTEGER,
            pname TEXT,
            event_type TEXT NOT NULL,
            mcp_tag TEXT NOT NULL,
            data_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rpc_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            raw_event_id INTEGER NOT NULL REFERENCES raw_events(id),
            ts INTEGER NOT NULL,
            mcptype TEXT NOT NULL,
            mcptag TEXT NOT NULL,
            direction TEXT NOT NULL,
            method TEXT,
            message_id TEXT,
            params_json TEXT,
            result_json TEXT,
            error_json TEXT
        );

        CREATE TABLE IF NOT EXISTS engine_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            raw_event_id INTEGER NOT NULL REFERENCES raw_events(id),
            engine_name TEXT NOT NULL,
            producer TEXT NOT NULL,
            server_name TEXT NOT NULL,
            severity TEXT NOT NULL,
            score INTEGER NOT NULL,
            detail_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS mcpl (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mcp_tag TEXT NOT NULL,
            producer TEXT NOT NULL,
            tool TEXT NOT NULL,
            tool_title TEXT,
            tool_description TEXT,
            tool_parameter TEXT,
            annotations TEXT,
            safety TEXT,
            safety_checked_at INTEGER,
            UNIQUE(mcp_tag, tool)
        );

        CREATE TABLE IF NOT EXISTS custom_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            engine_name TEXT NOT NULL,
            rule_name TEXT NOT NULL,
            rule_content TEXT NOT NULL,
            category TEXT,
            description TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(engine_name, rule_name)
        );
        ",
    )?;
    Ok(())
}
